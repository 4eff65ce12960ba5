use tracing::{debug, info};

use crate::error::Result;
use crate::geometry::GeometryEngine;
use crate::overlap::Overlaps;
use crate::store::{BandpassId, CatalogStore, IntercalEdge};

/// Create a pending edge for every overlapping pair of catalogs observed in
/// `bandpass` that has no edge yet, in either direction.
///
/// Catalogs are visited in ascending ID order and each catalog's new edges
/// are committed together, so an interrupted run can simply be repeated.
/// Returns the number of edges created.
pub fn prepare_network<S, G>(store: &mut S, geometry: &G, bandpass: BandpassId) -> Result<usize>
where
    S: CatalogStore + ?Sized,
    G: GeometryEngine + ?Sized,
{
    let network = store.catalogs_observed_in(bandpass);
    info!(
        "Preparing intercal network for bandpass {} over {} catalogs",
        bandpass,
        network.len()
    );

    let mut n_created = 0usize;
    for &from in &network {
        let partners: Vec<_> = {
            let overlaps =
                Overlaps::catalog(&*store, geometry, from)?.restrict_to(network.iter().copied());
            overlaps
                .catalogs()
                .iter()
                .copied()
                .filter(|&to| !IntercalEdge::edge_exists(&*store, from, to, bandpass))
                .collect()
        };
        for &to in &partners {
            store.insert_edge(from, to, bandpass)?;
        }
        store.commit()?;
        if !partners.is_empty() {
            debug!("Catalog {}: {} new edges", from, partners.len());
        }
        n_created += partners.len();
    }

    info!("Created {} intercal edges", n_created);
    Ok(n_created)
}
