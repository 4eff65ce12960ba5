//! Footprint overlap queries.
//!
//! [`Overlaps`] finds the catalogs whose footprints intersect a principal
//! footprint, given either directly ([`Overlaps::footprint`]) or as another
//! catalog's footprint ([`Overlaps::catalog`]). The intersecting catalogs,
//! their clip polygons, the clip areas and the largest overlap are computed
//! on first access and cached for the lifetime of the value.

use std::cell::OnceCell;
use std::collections::BTreeSet;

use crate::error::Result;
use crate::geometry::{Footprint, GeometryEngine};
use crate::store::{CatalogId, CatalogStore};

pub struct Overlaps<'a, S: ?Sized, G: ?Sized> {
    store: &'a S,
    geometry: &'a G,
    footprint: Footprint,
    principal: Option<CatalogId>,
    exclude: BTreeSet<CatalogId>,
    instrument: Option<String>,
    restrict_to: Option<BTreeSet<CatalogId>>,

    catalogs: OnceCell<Vec<CatalogId>>,
    clips: OnceCell<Vec<Option<Footprint>>>,
    areas: OnceCell<Vec<f64>>,
}

impl<'a, S, G> Overlaps<'a, S, G>
where
    S: CatalogStore + ?Sized,
    G: GeometryEngine + ?Sized,
{
    /// Catalogs overlapping an arbitrary footprint.
    pub fn footprint(store: &'a S, geometry: &'a G, footprint: Footprint) -> Self {
        Self {
            store,
            geometry,
            footprint,
            principal: None,
            exclude: BTreeSet::new(),
            instrument: None,
            restrict_to: None,
            catalogs: OnceCell::new(),
            clips: OnceCell::new(),
            areas: OnceCell::new(),
        }
    }

    /// Catalogs overlapping a principal catalog, which is never reported.
    pub fn catalog(store: &'a S, geometry: &'a G, principal: CatalogId) -> Result<Self> {
        let footprint = store.catalog(principal)?.footprint.clone();
        let mut overlaps = Self::footprint(store, geometry, footprint);
        overlaps.principal = Some(principal);
        Ok(overlaps)
    }

    /// Never report these catalogs.
    pub fn exclude(mut self, ids: impl IntoIterator<Item = CatalogId>) -> Self {
        self.exclude.extend(ids);
        self
    }

    /// Only report catalogs taken with this instrument.
    pub fn instrument(mut self, instrument: Option<&str>) -> Self {
        self.instrument = instrument.map(str::to_string);
        self
    }

    /// Only report catalogs from this set.
    pub fn restrict_to(mut self, ids: impl IntoIterator<Item = CatalogId>) -> Self {
        self.restrict_to = Some(ids.into_iter().collect());
        self
    }

    /// The principal footprint.
    pub fn principal_footprint(&self) -> &Footprint {
        &self.footprint
    }

    /// Intersecting catalogs, ascending by ID.
    pub fn catalogs(&self) -> &[CatalogId] {
        self.catalogs.get_or_init(|| {
            self.store
                .catalog_ids()
                .into_iter()
                .filter(|id| Some(*id) != self.principal)
                .filter(|id| !self.exclude.contains(id))
                .filter(|id| self.restrict_to.as_ref().is_none_or(|r| r.contains(id)))
                .filter(|id| {
                    let Ok(catalog) = self.store.catalog(*id) else {
                        return false;
                    };
                    self.instrument
                        .as_deref()
                        .is_none_or(|inst| catalog.instrument == inst)
                        && self.geometry.intersects(&catalog.footprint, &self.footprint)
                })
                .collect()
        })
    }

    pub fn count(&self) -> usize {
        self.catalogs().len()
    }

    /// Intersection of each overlapping catalog with the principal
    /// footprint, aligned with [`Overlaps::catalogs`]. `None` where the
    /// footprints only touch.
    pub fn clips(&self) -> &[Option<Footprint>] {
        self.clips.get_or_init(|| {
            self.catalogs()
                .iter()
                .map(|id| {
                    self.store
                        .catalog(*id)
                        .ok()
                        .and_then(|c| self.geometry.intersection(&c.footprint, &self.footprint))
                })
                .collect()
        })
    }

    /// Overlap areas in square degrees, aligned with [`Overlaps::catalogs`].
    pub fn areas(&self) -> &[f64] {
        self.areas.get_or_init(|| {
            self.clips()
                .iter()
                .map(|clip| clip.as_ref().map_or(0.0, |f| self.geometry.area_sq_deg(f)))
                .collect()
        })
    }

    /// Catalog with the largest overlap area; ties go to the lowest ID.
    pub fn largest(&self) -> Option<CatalogId> {
        let mut best: Option<(CatalogId, f64)> = None;
        for (&id, &area) in self.catalogs().iter().zip(self.areas()) {
            if best.is_none_or(|(_, a)| area > a) {
                best = Some((id, area));
            }
        }
        best.map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{SkyGeometry, SkyPoint};
    use crate::meta::Metadata;
    use crate::store::{MemoryStore, NewCatalog};
    use std::cell::Cell;

    /// Counts intersection calls to check caching.
    struct CountingGeometry {
        inner: SkyGeometry,
        intersections: Cell<usize>,
        intersects: Cell<usize>,
    }

    impl GeometryEngine for CountingGeometry {
        fn intersects(&self, a: &Footprint, b: &Footprint) -> bool {
            self.intersects.set(self.intersects.get() + 1);
            self.inner.intersects(a, b)
        }
        fn intersection(&self, a: &Footprint, b: &Footprint) -> Option<Footprint> {
            self.intersections.set(self.intersections.get() + 1);
            self.inner.intersection(a, b)
        }
        fn area(&self, f: &Footprint) -> f64 {
            self.inner.area(f)
        }
        fn native_area_to_sq_deg(&self, area: f64) -> f64 {
            self.inner.native_area_to_sq_deg(area)
        }
        fn union(&self, footprints: &[&Footprint]) -> Option<Footprint> {
            self.inner.union(footprints)
        }
        fn contains(&self, f: &Footprint, p: SkyPoint) -> bool {
            self.inner.contains(f, p)
        }
        fn distance(&self, a: SkyPoint, b: SkyPoint) -> f64 {
            self.inner.distance(a, b)
        }
        fn degrees_to_native(&self, deg: f64) -> f64 {
            self.inner.degrees_to_native(deg)
        }
        fn native_to_degrees(&self, d: f64) -> f64 {
            self.inner.native_to_degrees(d)
        }
    }

    fn add(store: &mut MemoryStore, name: &str, instrument: &str, fp: Footprint) -> CatalogId {
        store
            .find_or_create_catalog(NewCatalog {
                name: name.into(),
                instrument: instrument.into(),
                footprint: fp,
                meta: Metadata::new(),
            })
            .unwrap()
            .0
    }

    fn sky() -> (MemoryStore, [CatalogId; 5]) {
        let mut store = MemoryStore::new();
        let p = add(&mut store, "p", "cam", Footprint::rectangle(0.0, 2.0, 0.0, 2.0).unwrap());
        let a = add(&mut store, "a", "cam", Footprint::rectangle(1.5, 3.0, 0.0, 2.0).unwrap());
        let b = add(&mut store, "b", "cam", Footprint::rectangle(1.0, 3.0, 0.0, 2.0).unwrap());
        let c = add(&mut store, "c", "other", Footprint::rectangle(359.0, 0.5, 0.0, 2.0).unwrap());
        let far = add(&mut store, "far", "cam", Footprint::rectangle(50.0, 51.0, 0.0, 1.0).unwrap());
        (store, [p, a, b, c, far])
    }

    #[test]
    fn catalog_overlaps_exclude_principal() {
        let (store, [p, a, b, c, _]) = sky();
        let g = SkyGeometry::default();
        let o = Overlaps::catalog(&store, &g, p).unwrap();
        assert_eq!(o.catalogs(), &[a, b, c]);
        assert_eq!(o.count(), 3);
        // Sky area of one degree of RA between dec 0 and 2.
        let strip = 2f64.to_radians().sin().to_degrees();
        let areas = o.areas();
        assert!((areas[0] - 0.5 * strip).abs() < 1e-9);
        assert!((areas[1] - strip).abs() < 1e-9);
        assert!((areas[2] - 0.5 * strip).abs() < 1e-9);
        assert_eq!(o.largest(), Some(b));
    }

    #[test]
    fn filters_compose() {
        let (store, [p, a, b, c, _]) = sky();
        let g = SkyGeometry::default();
        let o = Overlaps::catalog(&store, &g, p).unwrap().exclude([b]);
        assert_eq!(o.catalogs(), &[a, c]);
        let o = Overlaps::catalog(&store, &g, p).unwrap().instrument(Some("other"));
        assert_eq!(o.catalogs(), &[c]);
        let o = Overlaps::catalog(&store, &g, p).unwrap().restrict_to([a, p]);
        assert_eq!(o.catalogs(), &[a]);

        let fp = Footprint::rectangle(0.2, 0.4, 0.2, 0.4).unwrap();
        let o = Overlaps::footprint(&store, &g, fp);
        assert_eq!(o.catalogs(), &[p, c]);
    }

    #[test]
    fn ties_go_to_lowest_id() {
        let (store, [p, a, _, c, _]) = sky();
        let g = SkyGeometry::default();
        let o = Overlaps::catalog(&store, &g, p).unwrap().restrict_to([a, c]);
        assert!((o.areas()[0] - o.areas()[1]).abs() < 1e-12);
        assert_eq!(o.largest(), Some(a));
    }

    #[test]
    fn largest_is_measured_on_the_sphere() {
        let mut store = MemoryStore::new();
        let p = add(&mut store, "p", "cam", Footprint::rectangle(20.0, 21.0, 0.0, 70.0).unwrap());
        // 0.2° x 4° near the equator against 0.5° x 2° near dec 70: the second
        // is larger in the flat (RA, Dec) plane, the first on the sky.
        let low = add(&mut store, "low", "cam", Footprint::rectangle(20.8, 22.0, 0.0, 4.0).unwrap());
        let high = add(&mut store, "high", "cam", Footprint::rectangle(20.5, 22.0, 68.0, 70.0).unwrap());
        let g = SkyGeometry::default();
        let o = Overlaps::catalog(&store, &g, p).unwrap();
        assert_eq!(o.catalogs(), &[low, high]);
        let areas = o.areas();
        assert!((areas[0] - 0.7994).abs() < 1e-3, "low overlap {}", areas[0]);
        assert!((areas[1] - 0.3584).abs() < 1e-3, "high overlap {}", areas[1]);
        assert_eq!(o.largest(), Some(low));
    }

    #[test]
    fn empty_result() {
        let (store, [_, _, _, _, far]) = sky();
        let g = SkyGeometry::default();
        let o = Overlaps::catalog(&store, &g, far).unwrap();
        assert_eq!(o.count(), 0);
        assert!(o.areas().is_empty());
        assert_eq!(o.largest(), None);
        assert!(Overlaps::catalog(&store, &g, CatalogId(99)).is_err());
    }

    #[test]
    fn results_are_computed_once() {
        let (store, [p, ..]) = sky();
        let g = CountingGeometry {
            inner: SkyGeometry::default(),
            intersections: Cell::new(0),
            intersects: Cell::new(0),
        };
        let o = Overlaps::catalog(&store, &g, p).unwrap();
        o.largest();
        o.areas();
        o.clips();
        o.count();
        o.largest();
        assert_eq!(g.intersects.get(), 4);
        assert_eq!(g.intersections.get(), 3);
    }
}
