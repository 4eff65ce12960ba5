//! Spatial accretion of observed catalogs into the master star table.
//!
//! The star table is seeded from one catalog ([`SpatialJoiner::seed_catalog`]),
//! then grown greedily ([`SpatialJoiner::accrete_catalogs`]): at every step
//! the uncompiled catalog with the largest overlap against the aggregate
//! footprint of everything compiled so far is joined next. Joining matches
//! each unlinked catalog star, brightest first, to the nearest master star
//! within a radius tolerance that has no other member from the same catalog.

mod aggregate;
mod seed;

use std::collections::BTreeSet;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::geometry::{arcsec_to_degree, GeometryEngine};
use crate::overlap::Overlaps;
use crate::store::{BandpassId, CatalogId, CatalogStarId, CatalogStore, StarId};

pub use aggregate::{compiled_catalogs, compiled_footprint};
pub use seed::{reset_star_table, seed_star_table};

/// Relative padding on the candidate search cone, so that the geometry
/// engine's distance predicate has the final say at the boundary.
const CANDIDATE_PAD: f64 = 1e-6;

/// Parameters for joining and accreting catalogs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AccreteConfig {
    /// Match radius tolerance, arcseconds.
    pub r_tol_arcsec: f64,
    /// Only accrete catalogs taken with this instrument.
    pub instrument: Option<String>,
    /// Match to existing stars only; unmatched catalog stars stay unlinked.
    pub no_new: bool,
    /// Catalog stars processed per commit while joining.
    pub commit_every: usize,
}

impl Default for AccreteConfig {
    fn default() -> Self {
        Self {
            r_tol_arcsec: 1.0,
            instrument: None,
            no_new: false,
            commit_every: 1000,
        }
    }
}

/// Outcome of joining one catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinStats {
    /// Catalog stars linked to an existing star.
    pub matched: usize,
    /// Catalog stars that became new stars.
    pub new: usize,
    /// Catalog stars left unlinked (no-new mode).
    pub unmatched: usize,
}

/// Catalogs joined by one accretion run, in join order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccreteSummary {
    pub joined: Vec<(CatalogId, JoinStats)>,
}

impl AccreteSummary {
    pub fn total(&self) -> JoinStats {
        self.joined.iter().fold(JoinStats::default(), |acc, (_, s)| JoinStats {
            matched: acc.matched + s.matched,
            new: acc.new + s.new,
            unmatched: acc.unmatched + s.unmatched,
        })
    }
}

/// Grows the master star table from observed catalogs.
pub struct SpatialJoiner<'a, S: ?Sized, G: ?Sized> {
    store: &'a mut S,
    geometry: &'a G,
}

impl<'a, S, G> SpatialJoiner<'a, S, G>
where
    S: CatalogStore + ?Sized,
    G: GeometryEngine + ?Sized,
{
    pub fn new(store: &'a mut S, geometry: &'a G) -> Self {
        Self { store, geometry }
    }

    /// Seed the star table with `catalog`. See [`seed_star_table`].
    pub fn seed_catalog(&mut self, catalog: CatalogId, reset: bool) -> Result<usize> {
        seed_star_table(&mut *self.store, catalog, reset)
    }

    /// Join overlapping catalogs until no uncompiled catalog touches the
    /// aggregate footprint. Ordering uses `bandpass` magnitudes.
    ///
    /// Catalogs joined during this run are never revisited, even when the
    /// join left them without links. Fails with [`Error::NotSeeded`] when
    /// nothing has been compiled yet.
    pub fn accrete_catalogs(
        &mut self,
        config: &AccreteConfig,
        bandpass: BandpassId,
    ) -> Result<AccreteSummary> {
        if compiled_catalogs(&*self.store).is_empty() {
            return Err(Error::NotSeeded);
        }
        let mut attempted: BTreeSet<CatalogId> = BTreeSet::new();
        let mut summary = AccreteSummary::default();
        loop {
            let compiled = compiled_catalogs(&*self.store);
            let Some(footprint) = compiled_footprint(&*self.store, self.geometry, &compiled)? else {
                return Err(Error::NotSeeded);
            };
            info!("Accreted catalogs: {:?}", compiled.iter().map(|c| c.0).collect::<Vec<_>>());
            info!("Total footprint {}", footprint);

            let next = Overlaps::footprint(&*self.store, self.geometry, footprint)
                .exclude(compiled.iter().chain(attempted.iter()).copied())
                .instrument(config.instrument.as_deref())
                .largest();
            let Some(next) = next else {
                break;
            };
            attempted.insert(next);
            info!("Ingesting: {}", self.store.catalog(next)?);
            let stats = self.join_catalog(next, config, bandpass)?;
            summary.joined.push((next, stats));
        }
        let total = summary.total();
        info!(
            "Accretion done: {} catalogs, {} matched, {} new, {} unmatched",
            summary.joined.len(),
            total.matched,
            total.new,
            total.unmatched
        );
        Ok(summary)
    }

    /// Join one catalog's unlinked stars to the star table.
    pub fn join_catalog(
        &mut self,
        catalog: CatalogId,
        config: &AccreteConfig,
        bandpass: BandpassId,
    ) -> Result<JoinStats> {
        let r_deg = arcsec_to_degree(config.r_tol_arcsec);
        let r_native = self.geometry.degrees_to_native(r_deg);
        let commit_every = config.commit_every.max(1);

        let queue = self.join_order(catalog, bandpass)?;
        debug!("{} unlinked catalog stars to join", queue.len());

        let mut stats = JoinStats::default();
        for (i, cs) in queue.into_iter().enumerate() {
            match self.best_match(catalog, cs, r_deg, r_native)? {
                Some(star) => {
                    self.store.link_catalog_star(cs, star)?;
                    stats.matched += 1;
                }
                None if config.no_new => stats.unmatched += 1,
                None => {
                    self.store.create_star_from(cs)?;
                    stats.new += 1;
                }
            }
            if (i + 1) % commit_every == 0 {
                self.store.commit()?;
            }
            if i % 1000 == 0 {
                debug!("{}: matched {} new {}", i, stats.matched, stats.new);
            }
        }
        self.store.commit()?;
        info!(
            "Joined catalog {}: matched {}, new {}, unmatched {}",
            catalog, stats.matched, stats.new, stats.unmatched
        );
        Ok(stats)
    }

    /// Unlinked catalog stars, brightest first in `bandpass` (ties by ID),
    /// then those without a measurement in ID order.
    fn join_order(&self, catalog: CatalogId, bandpass: BandpassId) -> Result<Vec<CatalogStarId>> {
        let mut measured: Vec<(f64, CatalogStarId)> = Vec::new();
        let mut unmeasured: Vec<CatalogStarId> = Vec::new();
        for id in self.store.catalog_star_ids(catalog)? {
            if self.store.catalog_star(id)?.star.is_some() {
                continue;
            }
            match self.store.observation(id, bandpass) {
                Some(obs) if obs.mag.is_finite() => measured.push((obs.mag, id)),
                _ => unmeasured.push(id),
            }
        }
        measured.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        Ok(measured
            .into_iter()
            .map(|(_, id)| id)
            .chain(unmeasured)
            .collect())
    }

    /// Nearest star within tolerance that has no member from `catalog`.
    fn best_match(
        &self,
        catalog: CatalogId,
        cs: CatalogStarId,
        r_deg: f64,
        r_native: f64,
    ) -> Result<Option<StarId>> {
        let coord = self.store.catalog_star(cs)?.coord;
        let mut candidates: Vec<(f64, StarId)> = Vec::new();
        for star in self.store.stars_near(coord, r_deg * (1.0 + CANDIDATE_PAD)) {
            let pos = self.store.star(star)?.coord;
            if self.geometry.within_distance(coord, pos, r_native) {
                candidates.push((self.geometry.distance(coord, pos), star));
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        for (_, star) in candidates {
            let mut already_member = false;
            for member in self.store.star_members(star)? {
                if self.store.catalog_star(*member)?.catalog == catalog {
                    already_member = true;
                    break;
                }
            }
            if !already_member {
                return Ok(Some(star));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{DistanceUnits, Footprint, SkyGeometry, SkyPoint};
    use crate::meta::Metadata;
    use crate::store::{MemoryStore, NewCatalog, NewCatalogStar, Observation};

    struct Sky {
        store: MemoryStore,
        band: BandpassId,
    }

    impl Sky {
        fn new() -> Self {
            let mut store = MemoryStore::new();
            let band = store.find_or_create_bandpass("V", "Vega").unwrap();
            Self { store, band }
        }

        /// Catalog with stars at (ra, dec, mag).
        fn catalog(&mut self, name: &str, fp: Footprint, stars: &[(f64, f64, f64)]) -> CatalogId {
            let (id, _) = self
                .store
                .find_or_create_catalog(NewCatalog {
                    name: name.into(),
                    instrument: "cam".into(),
                    footprint: fp,
                    meta: Metadata::new(),
                })
                .unwrap();
            let rows = stars
                .iter()
                .map(|&(ra, dec, _)| NewCatalogStar::new(0.0, 0.0, ra, dec, 1.0).unwrap())
                .collect();
            let ids = self.store.insert_catalog_stars(id, rows).unwrap();
            let obs = ids
                .iter()
                .zip(stars)
                .filter(|(_, s)| s.2.is_finite())
                .map(|(&cs, s)| Observation {
                    catalog_star: cs,
                    bandpass: self.band,
                    mag: s.2,
                    mag_err: 0.01,
                })
                .collect();
            self.store.insert_observations(obs).unwrap();
            self.store.commit().unwrap();
            id
        }
    }

    const ARCSEC: f64 = 1.0 / 3600.0;

    #[test]
    fn accrete_without_seed_fails() {
        let mut sky = Sky::new();
        sky.catalog("a", Footprint::rectangle(0.0, 1.0, 0.0, 1.0).unwrap(), &[(0.5, 0.5, 15.0)]);
        let g = SkyGeometry::default();
        let band = sky.band;
        let mut joiner = SpatialJoiner::new(&mut sky.store, &g);
        assert!(matches!(
            joiner.accrete_catalogs(&AccreteConfig::default(), band),
            Err(Error::NotSeeded)
        ));
    }

    #[test]
    fn join_matches_brightest_first_within_tolerance() {
        let mut sky = Sky::new();
        let fp = Footprint::rectangle(10.0, 11.0, 20.0, 21.0).unwrap();
        let seed = sky.catalog("seed", fp.clone(), &[(10.5, 20.5, 14.0), (10.6, 20.6, 15.0)]);
        // Two detections near the first star: the brighter one claims it, the
        // fainter one cannot join the same star from the same catalog.
        let other = sky.catalog(
            "other",
            fp,
            &[
                (10.5, 20.5 + 0.5 * ARCSEC, 16.0),
                (10.5, 20.5 - 0.3 * ARCSEC, 13.0),
                (10.6, 20.6 + 5.0 * ARCSEC, 15.0),
                (10.7, 20.7, f64::NAN),
            ],
        );
        let g = SkyGeometry::new(DistanceUnits::GeographyMeters);
        let band = sky.band;
        let mut joiner = SpatialJoiner::new(&mut sky.store, &g);
        joiner.seed_catalog(seed, false).unwrap();
        let stats = joiner
            .join_catalog(other, &AccreteConfig::default(), band)
            .unwrap();
        assert_eq!(stats, JoinStats { matched: 1, new: 3, unmatched: 0 });

        let store = &sky.store;
        let seed_star = store.catalog_star(store.catalog_star_ids(seed).unwrap()[0]).unwrap().star.unwrap();
        let other_ids = store.catalog_star_ids(other).unwrap();
        assert_eq!(store.catalog_star(other_ids[1]).unwrap().star, Some(seed_star));
        assert_ne!(store.catalog_star(other_ids[0]).unwrap().star, Some(seed_star));
        assert_eq!(store.star_count(), 5);
    }

    #[test]
    fn no_new_leaves_unmatched_stars_untouched() {
        let mut sky = Sky::new();
        let fp = Footprint::rectangle(10.0, 11.0, 20.0, 21.0).unwrap();
        let seed = sky.catalog("seed", fp.clone(), &[(10.5, 20.5, 14.0)]);
        let other = sky.catalog("other", fp, &[(10.5, 20.5, 14.1), (10.9, 20.9, 14.2)]);
        let g = SkyGeometry::default();
        let band = sky.band;
        let mut joiner = SpatialJoiner::new(&mut sky.store, &g);
        joiner.seed_catalog(seed, false).unwrap();
        let config = AccreteConfig {
            no_new: true,
            ..Default::default()
        };
        let summary = joiner.accrete_catalogs(&config, band).unwrap();
        assert_eq!(summary.joined, vec![(other, JoinStats { matched: 1, new: 0, unmatched: 1 })]);
        let ids = sky.store.catalog_star_ids(other).unwrap();
        assert!(sky.store.catalog_star(ids[1]).unwrap().star.is_none());
        assert_eq!(sky.store.star_count(), 1);
    }

    #[test]
    fn accretion_follows_largest_overlap_and_stops_at_component() {
        let mut sky = Sky::new();
        let a = sky.catalog("a", Footprint::rectangle(10.0, 12.0, 0.0, 2.0).unwrap(), &[(11.0, 1.0, 12.0)]);
        // b overlaps a by 0.5 sq deg, c by 1.0; d only overlaps c; e is isolated.
        let b = sky.catalog("b", Footprint::rectangle(11.75, 13.75, 0.0, 2.0).unwrap(), &[(11.8, 1.0, 12.0)]);
        let c = sky.catalog("c", Footprint::rectangle(8.5, 10.5, 0.0, 2.0).unwrap(), &[(10.2, 1.0, 12.0)]);
        let d = sky.catalog("d", Footprint::rectangle(7.0, 9.0, 0.0, 2.0).unwrap(), &[(8.0, 1.0, 12.0)]);
        let e = sky.catalog("e", Footprint::rectangle(50.0, 51.0, 0.0, 1.0).unwrap(), &[(50.5, 0.5, 12.0)]);
        let g = SkyGeometry::default();
        let band = sky.band;
        let mut joiner = SpatialJoiner::new(&mut sky.store, &g);
        joiner.seed_catalog(a, false).unwrap();
        let summary = joiner.accrete_catalogs(&AccreteConfig::default(), band).unwrap();
        let order: Vec<CatalogId> = summary.joined.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![c, d, b]);
        assert_eq!(summary.total().new, 3);

        let compiled = compiled_catalogs(&sky.store);
        assert_eq!(compiled, vec![a, b, c, d]);
        assert!(!compiled.contains(&e));
        assert!(sky.store.stars_near(SkyPoint::new(50.5, 0.5), 0.1).is_empty());
    }
}
