//! Photometric inter-calibration of overlapping catalogs.
//!
//! Calibration runs in three stages per bandpass:
//!
//! 1. [`prepare_network`] creates a pending edge for every overlapping pair
//!    of catalogs observed in the band.
//! 2. [`analyze_network`] cross-matches each edge's catalogs inside their
//!    overlap and stores the clipped, weighted mean magnitude offset with a
//!    bootstrap uncertainty. Edges without enough matches are removed.
//! 3. [`solve_network`] finds the zero-points that best reproduce every
//!    measured offset, anchors them to the reference catalogs and writes
//!    them to catalog metadata.
//!
//! [`calibrate`] runs all three.

mod analyze;
mod network;
mod solve;
pub mod stats;

use tracing::info;

use crate::error::{Error, Result};
use crate::geometry::GeometryEngine;
use crate::store::{BandpassId, CatalogStore};

pub use analyze::{analyze_edge, analyze_network, measured_catalogs, AnalyzeConfig, AnalyzeSummary, EdgeAnalysis};
pub use network::prepare_network;
pub use solve::{solve_network, solve_network_with, NetworkSolution, SolveConfig, ZeroPoint};

/// Mark a catalog as a zero-point reference.
pub fn set_zeropoint_reference<S: CatalogStore + ?Sized>(
    store: &mut S,
    name: &str,
    instrument: &str,
) -> Result<()> {
    mark_reference(store, name, instrument, true)
}

/// Clear a catalog's zero-point reference flag.
pub fn unset_zeropoint_reference<S: CatalogStore + ?Sized>(
    store: &mut S,
    name: &str,
    instrument: &str,
) -> Result<()> {
    mark_reference(store, name, instrument, false)
}

fn mark_reference<S: CatalogStore + ?Sized>(
    store: &mut S,
    name: &str,
    instrument: &str,
    reference: bool,
) -> Result<()> {
    let id = store
        .find_catalog(name, instrument)
        .ok_or_else(|| Error::CatalogNameNotFound {
            name: name.to_string(),
            instrument: instrument.to_string(),
        })?;
    let mut meta = store.catalog(id)?.meta.clone();
    meta.set_zp_reference(reference);
    store.set_catalog_meta(id, meta)?;
    store.commit()?;
    info!("Catalog {}/{} reference = {}", name, instrument, reference);
    Ok(())
}

/// Outcome of a full calibration run.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    pub new_edges: usize,
    pub analysis: AnalyzeSummary,
    pub solution: NetworkSolution,
}

/// Prepare, analyze and solve the network of `bandpass`.
pub fn calibrate<S, G>(
    store: &mut S,
    geometry: &G,
    bandpass: BandpassId,
    analyze: &AnalyzeConfig,
    solve: &SolveConfig,
) -> Result<CalibrationReport>
where
    S: CatalogStore + ?Sized,
    G: GeometryEngine + ?Sized,
{
    let new_edges = prepare_network(store, geometry, bandpass)?;
    let analysis = analyze_network(store, geometry, bandpass, analyze)?;
    let solution = solve_network(store, bandpass, solve)?;
    Ok(CalibrationReport {
        new_edges,
        analysis,
        solution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Footprint;
    use crate::meta::Metadata;
    use crate::store::{MemoryStore, NewCatalog};

    #[test]
    fn reference_flag_round_trip() {
        let mut store = MemoryStore::new();
        let (id, _) = store
            .find_or_create_catalog(NewCatalog {
                name: "field1".into(),
                instrument: "cam".into(),
                footprint: Footprint::rectangle(0.0, 1.0, 0.0, 1.0).unwrap(),
                meta: Metadata::new(),
            })
            .unwrap();
        store.commit().unwrap();

        set_zeropoint_reference(&mut store, "field1", "cam").unwrap();
        assert!(store.catalog(id).unwrap().meta.is_zp_reference());
        unset_zeropoint_reference(&mut store, "field1", "cam").unwrap();
        assert!(!store.catalog(id).unwrap().meta.is_zp_reference());
        assert_eq!(store.pending_changes(), 0);

        let err = set_zeropoint_reference(&mut store, "field2", "cam").unwrap_err();
        assert!(matches!(err, Error::CatalogNameNotFound { .. }));
    }
}
