//! What has been compiled into the star table so far.

use crate::error::Result;
use crate::geometry::{Footprint, GeometryEngine};
use crate::store::{CatalogId, CatalogStore};

/// Catalogs with at least one catalog star linked to a master star, ascending.
pub fn compiled_catalogs<S: CatalogStore + ?Sized>(store: &S) -> Vec<CatalogId> {
    store.compiled_catalog_ids()
}

/// Aggregate footprint of the given catalogs: the single footprint, or the
/// union of all of them. `None` for an empty list.
pub fn compiled_footprint<S, G>(
    store: &S,
    geometry: &G,
    catalogs: &[CatalogId],
) -> Result<Option<Footprint>>
where
    S: CatalogStore + ?Sized,
    G: GeometryEngine + ?Sized,
{
    match catalogs {
        [] => Ok(None),
        [single] => Ok(Some(store.catalog(*single)?.footprint.clone())),
        many => {
            let footprints = many
                .iter()
                .map(|id| store.catalog(*id).map(|c| &c.footprint))
                .collect::<Result<Vec<_>>>()?;
            Ok(geometry.union(&footprints))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SkyGeometry;
    use crate::meta::Metadata;
    use crate::store::{MemoryStore, NewCatalog, NewCatalogStar};

    #[test]
    fn footprint_of_compiled_catalogs() {
        let mut store = MemoryStore::new();
        let g = SkyGeometry::default();
        let mut ids = Vec::new();
        for (i, ra0) in [0.0, 1.0, 10.0].into_iter().enumerate() {
            let (id, _) = store
                .find_or_create_catalog(NewCatalog {
                    name: format!("c{i}"),
                    instrument: "cam".into(),
                    footprint: Footprint::rectangle(ra0, ra0 + 2.0, 0.0, 1.0).unwrap(),
                    meta: Metadata::new(),
                })
                .unwrap();
            store
                .insert_catalog_stars(id, vec![NewCatalogStar::new(0.0, 0.0, ra0 + 0.5, 0.5, 1.0).unwrap()])
                .unwrap();
            ids.push(id);
        }
        assert!(compiled_catalogs(&store).is_empty());
        assert!(compiled_footprint(&store, &g, &[]).unwrap().is_none());

        for &id in &ids[..2] {
            let cs = store.catalog_star_ids(id).unwrap()[0];
            store.create_star_from(cs).unwrap();
        }
        let compiled = compiled_catalogs(&store);
        assert_eq!(compiled, ids[..2].to_vec());

        // Sky area of one degree of RA between dec 0 and 1.
        let strip = 1f64.to_radians().sin().to_degrees();
        let single = compiled_footprint(&store, &g, &compiled[..1]).unwrap().unwrap();
        assert!((g.area(&single) - 2.0 * strip).abs() < 1e-9);
        let union = compiled_footprint(&store, &g, &compiled).unwrap().unwrap();
        assert!((g.area(&union) - 3.0 * strip).abs() < 1e-9);
    }
}
