use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::stats::{bootstrap_std, sigma_clip, weighted_mean, weighted_mean_error};
use crate::error::Result;
use crate::geometry::{arcsec_to_degree, GeometryEngine};
use crate::meta::DEFAULT_PRIOR_KEY;
use crate::skyindex::SkyIndex;
use crate::store::{BandpassId, CatalogId, CatalogStarId, CatalogStore, IntercalEdge};

/// Parameters for measuring zero-point offsets along network edges.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnalyzeConfig {
    /// Cross-match radius between the two catalogs, arcseconds.
    pub match_radius_arcsec: f64,
    /// Clipping threshold in robust standard deviations.
    pub clip_sigma: f64,
    pub clip_iterations: usize,
    /// Minimum number of differences before and after clipping.
    pub min_differences: usize,
    pub n_bootstrap: usize,
    /// Metadata key holding prior zero-point offsets.
    pub prior_key: String,
    /// Also re-measure edges that already carry an offset.
    pub reanalyze: bool,
    /// Edges processed per commit.
    pub commit_every: usize,
    /// Bootstrap RNG seed; `None` draws a fresh one.
    pub seed: Option<u64>,
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        Self {
            match_radius_arcsec: 1.0,
            clip_sigma: 3.0,
            clip_iterations: 5,
            min_differences: 5,
            n_bootstrap: 1000,
            prior_key: DEFAULT_PRIOR_KEY.to_string(),
            reanalyze: false,
            commit_every: 100,
            seed: None,
        }
    }
}

/// Outcome of measuring one edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EdgeAnalysis {
    /// Magnitude offset `from − to` and its uncertainty: the bootstrap spread,
    /// floored at the formal error of the weighted mean.
    Offset {
        delta: f64,
        delta_err: f64,
        /// Finite cross-matched pairs.
        n_pairs: usize,
        /// Pairs surviving the sigma clip.
        n_used: usize,
    },
    /// Too few usable cross-matches to measure an offset.
    NoOverlap { n_raw: usize, n_filtered: usize },
}

/// Edges touched by [`analyze_network`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalyzeSummary {
    /// Edges that received an offset.
    pub n_measured: usize,
    /// Edges deleted for lack of usable overlap.
    pub n_discarded: usize,
}

/// Magnitude differences `from − to` of stars matched inside the overlap of
/// the two catalogs, with errors added in quadrature. Priors are applied to
/// each side; non-finite pairs are dropped.
///
/// Each `to` star pairs with its nearest `from` star. A `from` star claimed
/// by several `to` stars keeps only the closest one, so every detection
/// enters at most one pair.
fn matched_differences<S, G>(
    store: &S,
    geometry: &G,
    edge: &IntercalEdge,
    config: &AnalyzeConfig,
) -> Result<(Vec<f64>, Vec<f64>)>
where
    S: CatalogStore + ?Sized,
    G: GeometryEngine + ?Sized,
{
    let from = store.catalog(edge.from)?;
    let to = store.catalog(edge.to)?;
    let Some(overlap) = geometry.intersection(&from.footprint, &to.footprint) else {
        return Ok((Vec::new(), Vec::new()));
    };
    let from_prior = from.meta.prior_zp(&config.prior_key, edge.bandpass);
    let to_prior = to.meta.prior_zp(&config.prior_key, edge.bandpass);

    let mut index = SkyIndex::default();
    for cs in store.catalog_star_ids(edge.from)? {
        if store.observation(cs, edge.bandpass).is_some() {
            index.insert(cs.0, store.catalog_star(cs)?.coord);
        }
    }

    let radius = arcsec_to_degree(config.match_radius_arcsec);
    // from-star -> (separation, difference, error) of its closest to-star
    let mut pairs: BTreeMap<u64, (f64, f64, f64)> = BTreeMap::new();
    for cs in store.catalog_star_ids(edge.to)? {
        let Some(to_obs) = store.observation(cs, edge.bandpass) else {
            continue;
        };
        let coord = store.catalog_star(cs)?.coord;
        if !geometry.contains(&overlap, coord) {
            continue;
        }
        let Some(&(nearest, sep)) = index.query(coord, radius).first() else {
            continue;
        };
        let Some(from_obs) = store.observation(CatalogStarId(nearest), edge.bandpass) else {
            continue;
        };
        let diff = (from_obs.mag + from_prior) - (to_obs.mag + to_prior);
        let err = from_obs.mag_err.hypot(to_obs.mag_err);
        if !(diff.is_finite() && err.is_finite() && err > 0.0) {
            continue;
        }
        match pairs.get(&nearest) {
            Some(&(best, _, _)) if best <= sep => {}
            _ => {
                pairs.insert(nearest, (sep, diff, err));
            }
        }
    }
    Ok(pairs.into_values().map(|(_, diff, err)| (diff, err)).unzip())
}

/// Measure the zero-point offset along one edge.
pub fn analyze_edge<S, G>(
    store: &S,
    geometry: &G,
    edge: &IntercalEdge,
    config: &AnalyzeConfig,
    rng: &mut StdRng,
) -> Result<EdgeAnalysis>
where
    S: CatalogStore + ?Sized,
    G: GeometryEngine + ?Sized,
{
    let (diffs, errs) = matched_differences(store, geometry, edge, config)?;
    let n_raw = diffs.len();
    if n_raw < config.min_differences {
        return Ok(EdgeAnalysis::NoOverlap {
            n_raw,
            n_filtered: 0,
        });
    }

    let keep = sigma_clip(&diffs, &errs, config.clip_sigma, config.clip_iterations);
    let (diffs, errs): (Vec<f64>, Vec<f64>) = diffs
        .iter()
        .zip(&errs)
        .zip(&keep)
        .filter(|(_, &k)| k)
        .map(|((&d, &e), _)| (d, e))
        .unzip();
    let n_filtered = diffs.len();
    if n_filtered < config.min_differences {
        return Ok(EdgeAnalysis::NoOverlap { n_raw, n_filtered });
    }

    // Identical differences resample to a zero spread; never report less
    // than the formal error.
    let spread = bootstrap_std(&diffs, &errs, config.n_bootstrap, rng);
    Ok(EdgeAnalysis::Offset {
        delta: weighted_mean(&diffs, &errs),
        delta_err: spread.max(weighted_mean_error(&errs)),
        n_pairs: n_raw,
        n_used: n_filtered,
    })
}

/// Measure every pending edge of `bandpass` (every edge with
/// `config.reanalyze`). Offsets are stored on their edges; edges without a
/// usable overlap are deleted.
pub fn analyze_network<S, G>(
    store: &mut S,
    geometry: &G,
    bandpass: BandpassId,
    config: &AnalyzeConfig,
) -> Result<AnalyzeSummary>
where
    S: CatalogStore + ?Sized,
    G: GeometryEngine + ?Sized,
{
    let edges: Vec<IntercalEdge> = store
        .edges(bandpass)
        .into_iter()
        .filter(|e| config.reanalyze || e.is_pending())
        .collect();
    info!("Analyzing {} intercal edges in bandpass {}", edges.len(), bandpass);

    let mut rng = StdRng::seed_from_u64(config.seed.unwrap_or_else(rand::random::<u64>));
    let mut summary = AnalyzeSummary::default();
    for (k, edge) in edges.iter().enumerate() {
        match analyze_edge(&*store, geometry, edge, config, &mut rng)? {
            EdgeAnalysis::Offset {
                delta,
                delta_err,
                n_pairs,
                n_used,
            } => {
                debug!(
                    "Edge {} ({} -> {}): delta = {:.4} ± {:.4} from {}/{} pairs",
                    edge.id, edge.from, edge.to, delta, delta_err, n_used, n_pairs
                );
                store.set_edge_delta(edge.id, delta, delta_err)?;
                summary.n_measured += 1;
            }
            EdgeAnalysis::NoOverlap { n_raw, n_filtered } => {
                warn!(
                    "Discarding edge {} ({} -> {}): {} raw, {} filtered differences",
                    edge.id, edge.from, edge.to, n_raw, n_filtered
                );
                store.delete_edge(edge.id)?;
                summary.n_discarded += 1;
            }
        }
        if config.commit_every > 0 && (k + 1) % config.commit_every == 0 {
            store.commit()?;
        }
    }
    store.commit()?;

    info!(
        "Measured {} edges, discarded {}",
        summary.n_measured, summary.n_discarded
    );
    Ok(summary)
}

/// Catalogs joined by at least one measured edge.
pub fn measured_catalogs<S: CatalogStore + ?Sized>(store: &S, bandpass: BandpassId) -> Vec<CatalogId> {
    let mut ids: Vec<CatalogId> = store
        .edges(bandpass)
        .iter()
        .filter(|e| !e.is_pending())
        .flat_map(|e| [e.from, e.to])
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Footprint, SkyGeometry};
    use crate::ingest::{add_observations, init_catalog, StarBatch};
    use crate::meta::Metadata;
    use crate::store::MemoryStore;
    use nalgebra::DMatrix;

    /// Catalog on the shared footprint with stars along dec = 0.5.
    fn catalog_with(store: &mut MemoryStore, name: &str, ra: &[f64], mags: &[f64], meta: Metadata) {
        let fp = Footprint::rectangle(10.0, 11.0, 0.0, 1.0).unwrap();
        init_catalog(store, name, "cam", &["V"], "Vega", fp, meta).unwrap();
        let n = ra.len();
        let batch = StarBatch {
            x: vec![0.0; n],
            y: vec![0.0; n],
            ra: ra.to_vec(),
            dec: vec![0.5; n],
            cfrac: vec![1.0; n],
            mag: DMatrix::from_column_slice(n, 1, mags),
            mag_err: DMatrix::from_element(n, 1, 0.02),
        };
        add_observations(store, name, "cam", &["V"], "Vega", &batch).unwrap();
    }

    fn positions(n: usize) -> Vec<f64> {
        (0..n).map(|k| 10.1 + 0.05 * k as f64).collect()
    }

    fn edge_between(store: &mut MemoryStore, a: &str, b: &str) -> IntercalEdge {
        let band = store.find_bandpass("V", "Vega").unwrap();
        let from = store.find_catalog(a, "cam").unwrap();
        let to = store.find_catalog(b, "cam").unwrap();
        let id = store.insert_edge(from, to, band).unwrap();
        store.commit().unwrap();
        *store.edge(id).unwrap()
    }

    #[test]
    fn measures_offset_with_priors() {
        let mut store = MemoryStore::new();
        let geom = SkyGeometry::default();
        let ra = positions(12);
        let base: Vec<f64> = (0..12).map(|k| 14.0 + 0.1 * k as f64).collect();
        let shifted: Vec<f64> = base.iter().map(|m| m + 0.7).collect();
        catalog_with(&mut store, "a", &ra, &shifted, Metadata::new());

        let band = store.find_bandpass("V", "Vega").unwrap();
        let mut meta = Metadata::new();
        meta.set_prior_zp(DEFAULT_PRIOR_KEY, band, 0.2);
        catalog_with(&mut store, "b", &ra, &base, meta);

        let edge = edge_between(&mut store, "a", "b");
        let mut rng = StdRng::seed_from_u64(1);
        let result = analyze_edge(&store, &geom, &edge, &AnalyzeConfig::default(), &mut rng).unwrap();
        match result {
            EdgeAnalysis::Offset {
                delta,
                delta_err,
                n_pairs,
                n_used,
            } => {
                assert!((delta - 0.5).abs() < 1e-9, "delta = {delta}");
                // All differences agree, so only the formal error remains.
                let formal = weighted_mean_error(&[0.02f64.hypot(0.02); 12]);
                assert!((delta_err - formal).abs() < 1e-12, "delta_err = {delta_err}");
                assert!(delta_err > 0.008);
                assert_eq!(n_pairs, 12);
                assert_eq!(n_used, 12);
            }
            other => panic!("expected an offset, got {other:?}"),
        }
    }

    #[test]
    fn quantized_differences_have_nonzero_error() {
        let mut store = MemoryStore::new();
        let geom = SkyGeometry::default();
        let ra = positions(11);
        let base = vec![15.0; 11];
        let steps = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.01, -0.01, 0.01, -0.01, 0.02];
        let stepped: Vec<f64> = steps.iter().map(|d| 15.0 + d).collect();
        catalog_with(&mut store, "a", &ra, &stepped, Metadata::new());
        catalog_with(&mut store, "b", &ra, &base, Metadata::new());
        let edge = edge_between(&mut store, "a", "b");

        let mut rng = StdRng::seed_from_u64(2);
        let result = analyze_edge(&store, &geom, &edge, &AnalyzeConfig::default(), &mut rng).unwrap();
        let EdgeAnalysis::Offset {
            delta_err, n_used, ..
        } = result
        else {
            panic!("expected an offset, got {result:?}");
        };
        assert_eq!(n_used, 11);
        assert!(delta_err.is_finite() && delta_err > 0.0, "delta_err = {delta_err}");
    }

    #[test]
    fn each_star_enters_one_pair() {
        let mut store = MemoryStore::new();
        let geom = SkyGeometry::default();
        let ra = positions(6);
        catalog_with(&mut store, "a", &ra, &[15.0; 6], Metadata::new());

        // A second detection 0.4" from the first star, inside the match radius.
        let mut b_ra = ra.clone();
        b_ra.push(ra[0] + 0.4 / 3600.0);
        let mut b_mags = vec![15.0; 6];
        b_mags.push(15.3);
        catalog_with(&mut store, "b", &b_ra, &b_mags, Metadata::new());
        let edge = edge_between(&mut store, "a", "b");

        let mut rng = StdRng::seed_from_u64(3);
        let result = analyze_edge(&store, &geom, &edge, &AnalyzeConfig::default(), &mut rng).unwrap();
        let EdgeAnalysis::Offset {
            delta, n_pairs, ..
        } = result
        else {
            panic!("expected an offset, got {result:?}");
        };
        assert_eq!(n_pairs, 6);
        assert!(delta.abs() < 1e-12, "delta = {delta}");
    }

    #[test]
    fn too_few_pairs_is_no_overlap() {
        let mut store = MemoryStore::new();
        let geom = SkyGeometry::default();
        let ra = positions(4);
        let mags = vec![15.0; 4];
        catalog_with(&mut store, "a", &ra, &mags, Metadata::new());
        catalog_with(&mut store, "b", &ra, &mags, Metadata::new());
        let edge = edge_between(&mut store, "a", "b");

        let mut rng = StdRng::seed_from_u64(1);
        let result = analyze_edge(&store, &geom, &edge, &AnalyzeConfig::default(), &mut rng).unwrap();
        assert_eq!(
            result,
            EdgeAnalysis::NoOverlap {
                n_raw: 4,
                n_filtered: 0
            }
        );
    }

    #[test]
    fn clipping_below_minimum_is_no_overlap() {
        let mut store = MemoryStore::new();
        let geom = SkyGeometry::default();
        let ra = positions(6);
        let a_mags = vec![15.0, 15.0, 15.0, 15.0, 15.0, 18.0];
        let b_mags = vec![15.0; 6];
        catalog_with(&mut store, "a", &ra, &a_mags, Metadata::new());
        catalog_with(&mut store, "b", &ra, &b_mags, Metadata::new());
        let edge = edge_between(&mut store, "a", "b");

        let config = AnalyzeConfig {
            min_differences: 6,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let result = analyze_edge(&store, &geom, &edge, &config, &mut rng).unwrap();
        assert_eq!(
            result,
            EdgeAnalysis::NoOverlap {
                n_raw: 6,
                n_filtered: 5
            }
        );
    }

    #[test]
    fn network_pass_stores_and_discards() {
        let mut store = MemoryStore::new();
        let geom = SkyGeometry::default();
        let ra = positions(8);
        let mags = vec![15.0; 8];
        catalog_with(&mut store, "a", &ra, &mags, Metadata::new());
        catalog_with(&mut store, "b", &ra, &mags, Metadata::new());
        catalog_with(&mut store, "c", &ra[..3], &mags[..3], Metadata::new());
        let ab = edge_between(&mut store, "a", "b");
        let ac = edge_between(&mut store, "a", "c");
        let band = ab.bandpass;

        let config = AnalyzeConfig {
            seed: Some(4),
            ..Default::default()
        };
        let summary = analyze_network(&mut store, &geom, band, &config).unwrap();
        assert_eq!(
            summary,
            AnalyzeSummary {
                n_measured: 1,
                n_discarded: 1
            }
        );
        assert!(!store.edge(ab.id).unwrap().is_pending());
        assert!(store.edge(ac.id).is_err());
        assert_eq!(store.pending_changes(), 0);
        assert_eq!(measured_catalogs(&store, band).len(), 2);

        // Nothing pending is left, so a second pass is a no-op.
        let again = analyze_network(&mut store, &geom, band, &config).unwrap();
        assert_eq!(again, AnalyzeSummary::default());
    }
}
