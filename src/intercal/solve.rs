use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::analyze::measured_catalogs;
use crate::error::{Error, Result};
use crate::meta::DEFAULT_PRIOR_KEY;
use crate::optimize::{BasinHopping, BasinHoppingConfig, Minimizer, NelderMead, NelderMeadConfig};
use crate::store::{BandpassId, CatalogId, CatalogStore, IntercalEdge};

/// Relative singular value cutoff when inverting the normal equations.
const PINV_RCOND: f64 = 1e-10;

/// Parameters for solving a measured network.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SolveConfig {
    /// Metadata key holding prior zero-point offsets.
    pub prior_key: String,
    /// Standard deviation of the random starting zero-points.
    pub z0_sigma: f64,
    pub basin_hopping: BasinHoppingConfig,
    pub nelder_mead: NelderMeadConfig,
    /// Seeds the starting point and the hops; `None` draws a fresh one.
    pub seed: Option<u64>,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            prior_key: DEFAULT_PRIOR_KEY.to_string(),
            z0_sigma: 0.2,
            basin_hopping: BasinHoppingConfig::default(),
            nelder_mead: NelderMeadConfig::default(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZeroPoint {
    pub catalog: CatalogId,
    /// Zero-point including the prior and the reference correction.
    pub zp: f64,
    /// One-sigma uncertainty propagated from the edge offsets.
    pub err: f64,
}

/// Solved zero-points for one bandpass, in ascending catalog order.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSolution {
    pub bandpass: BandpassId,
    pub zeropoints: Vec<ZeroPoint>,
    /// Offset applied so that reference catalogs match their priors on average.
    pub correction: f64,
    /// Objective value at the optimum.
    pub objective: f64,
    pub n_edges: usize,
    /// Measured catalogs with no edge path to a reference catalog. Their
    /// zero-points are undetermined and were neither solved nor stored.
    pub unanchored: Vec<CatalogId>,
}

impl NetworkSolution {
    pub fn zeropoint(&self, catalog: CatalogId) -> Option<&ZeroPoint> {
        self.zeropoints.iter().find(|z| z.catalog == catalog)
    }
}

/// Split `catalogs` into those connected to a reference through measured
/// edges and those that are not.
fn split_anchored(
    catalogs: &[CatalogId],
    edges: &[&IntercalEdge],
    references: &BTreeSet<CatalogId>,
) -> (Vec<CatalogId>, Vec<CatalogId>) {
    let mut neighbours: BTreeMap<CatalogId, Vec<CatalogId>> = BTreeMap::new();
    for e in edges {
        neighbours.entry(e.from).or_default().push(e.to);
        neighbours.entry(e.to).or_default().push(e.from);
    }
    let mut reached: BTreeSet<CatalogId> = references.clone();
    let mut queue: Vec<CatalogId> = references.iter().copied().collect();
    while let Some(id) = queue.pop() {
        for &next in neighbours.get(&id).into_iter().flatten() {
            if reached.insert(next) {
                queue.push(next);
            }
        }
    }
    catalogs.iter().partition(|id| reached.contains(*id))
}

/// Measured edge as parameter indices.
struct EdgeTerm {
    from: usize,
    to: usize,
    delta: f64,
    delta_err: f64,
}

/// Solve for per-catalog zero-points with basin-hopping over Nelder–Mead and
/// store them in each catalog's metadata.
pub fn solve_network<S: CatalogStore + ?Sized>(
    store: &mut S,
    bandpass: BandpassId,
    config: &SolveConfig,
) -> Result<NetworkSolution> {
    let mut minimizer = BasinHopping::new(
        config.basin_hopping.clone(),
        NelderMead::new(config.nelder_mead.clone()),
        config.seed,
    );
    solve_network_with(store, bandpass, config, &mut minimizer)
}

/// [`solve_network`] with a caller-supplied minimizer.
///
/// Minimizes Σ [(δ + z_from − z_to) / σ²]² over the measured edges, adds the
/// catalogs' priors, then shifts every zero-point so that the reference
/// catalogs agree with their priors on average. Nothing is written unless a
/// reference catalog is part of the network.
///
/// Every measured edge must carry a finite offset with a finite, positive
/// uncertainty. Catalogs cut off from all references are reported in
/// [`NetworkSolution::unanchored`] and left out of the solve.
pub fn solve_network_with<S, M>(
    store: &mut S,
    bandpass: BandpassId,
    config: &SolveConfig,
    minimizer: &mut M,
) -> Result<NetworkSolution>
where
    S: CatalogStore + ?Sized,
    M: Minimizer + ?Sized,
{
    let all_edges = store.edges(bandpass);
    let n_pending = all_edges.iter().filter(|e| e.is_pending()).count();
    if n_pending > 0 {
        warn!(
            "Skipping {} unanalyzed edges in bandpass {}",
            n_pending, bandpass
        );
    }

    let measured: Vec<&IntercalEdge> = all_edges.iter().filter(|e| !e.is_pending()).collect();
    for e in &measured {
        let delta = e.delta.unwrap_or(f64::NAN);
        let delta_err = e.delta_err.unwrap_or(f64::NAN);
        if !(delta.is_finite() && delta_err.is_finite() && delta_err > 0.0) {
            return Err(Error::InvalidEdgeOffset {
                edge: e.id,
                delta,
                delta_err,
            });
        }
    }

    let measured_ids = measured_catalogs(&*store, bandpass);
    if measured_ids.is_empty() {
        return Err(Error::EmptyNetwork(bandpass));
    }
    let mut reference_ids = BTreeSet::new();
    for &id in &measured_ids {
        if store.catalog(id)?.meta.is_zp_reference() {
            reference_ids.insert(id);
        }
    }
    if reference_ids.is_empty() {
        return Err(Error::NoReferenceCatalogs(bandpass));
    }
    let (catalogs, unanchored) = split_anchored(&measured_ids, &measured, &reference_ids);
    if !unanchored.is_empty() {
        warn!(
            "{} catalogs in bandpass {} have no path to a reference catalog; leaving them unsolved",
            unanchored.len(),
            bandpass
        );
    }

    let index: BTreeMap<CatalogId, usize> =
        catalogs.iter().enumerate().map(|(k, &id)| (id, k)).collect();
    let terms: Vec<EdgeTerm> = measured
        .iter()
        .filter_map(|e| {
            Some(EdgeTerm {
                delta: e.delta?,
                delta_err: e.delta_err?,
                from: *index.get(&e.from)?,
                to: *index.get(&e.to)?,
            })
        })
        .collect();

    let priors: Vec<f64> = catalogs
        .iter()
        .map(|&id| Ok(store.catalog(id)?.meta.prior_zp(&config.prior_key, bandpass)))
        .collect::<Result<_>>()?;
    let references: Vec<usize> = catalogs
        .iter()
        .enumerate()
        .filter(|(_, id)| reference_ids.contains(*id))
        .map(|(k, _)| k)
        .collect();

    info!(
        "Solving {} zero-points from {} edges in bandpass {} ({} references)",
        catalogs.len(),
        terms.len(),
        bandpass,
        references.len()
    );

    let objective = |z: &DVector<f64>| -> f64 {
        terms
            .iter()
            .map(|t| ((t.delta + z[t.from] - z[t.to]) / (t.delta_err * t.delta_err)).powi(2))
            .sum()
    };

    let mut rng = StdRng::seed_from_u64(config.seed.unwrap_or_else(rand::random::<u64>));
    let normal = Normal::new(0.0, config.z0_sigma).map_err(|e| Error::Optimizer(e.to_string()))?;
    let z0 = DVector::from_fn(catalogs.len(), |_, _| normal.sample(&mut rng));
    let minimum = minimizer.minimize(&objective, &z0)?;
    debug!(
        "Minimizer finished: F = {:.6e} after {} iterations, {} evaluations",
        minimum.fun, minimum.nit, minimum.nfev
    );

    let solved: Vec<f64> = minimum
        .x
        .iter()
        .zip(&priors)
        .map(|(z, prior)| z + prior)
        .collect();
    let correction = references
        .iter()
        .map(|&k| priors[k] - solved[k])
        .sum::<f64>()
        / references.len() as f64;
    let errors = zeropoint_errors(catalogs.len(), &terms, &references)?;

    let zeropoints: Vec<ZeroPoint> = catalogs
        .iter()
        .enumerate()
        .map(|(k, &catalog)| ZeroPoint {
            catalog,
            zp: solved[k] + correction,
            err: errors[k],
        })
        .collect();

    for zp in &zeropoints {
        let mut meta = store.catalog(zp.catalog)?.meta.clone();
        meta.set_intercal_zp(bandpass, zp.zp, zp.err);
        store.set_catalog_meta(zp.catalog, meta)?;
        debug!("Catalog {}: zp = {:.4} ± {:.4}", zp.catalog, zp.zp, zp.err);
    }
    store.commit()?;

    info!(
        "Network solved: F = {:.4e}, reference correction = {:.4}",
        minimum.fun, correction
    );
    Ok(NetworkSolution {
        bandpass,
        zeropoints,
        correction,
        objective: minimum.fun,
        n_edges: terms.len(),
        unanchored,
    })
}

/// Zero-point uncertainties from the weighted normal equations AᵀWA,
/// W = 1/σ², with the free offset fixed by the mean of the references.
///
/// The corrected zero-point of catalog k is (e_k − m)ᵀz plus constants,
/// m being the mean of the reference unit vectors, so its variance is
/// (e_k − m)ᵀ C (e_k − m) with C the pseudo-inverse of AᵀWA.
fn zeropoint_errors(n: usize, terms: &[EdgeTerm], references: &[usize]) -> Result<Vec<f64>> {
    let mut normal = DMatrix::<f64>::zeros(n, n);
    for t in terms {
        let w = 1.0 / (t.delta_err * t.delta_err);
        normal[(t.from, t.from)] += w;
        normal[(t.to, t.to)] += w;
        normal[(t.from, t.to)] -= w;
        normal[(t.to, t.from)] -= w;
    }

    let svd = normal.svd(true, true);
    let max_sv = svd.singular_values.max();
    let cov = svd
        .pseudo_inverse(max_sv * PINV_RCOND)
        .map_err(|e| Error::Optimizer(e.to_string()))?;

    let mut m = DVector::<f64>::zeros(n);
    for &r in references {
        m[r] += 1.0 / references.len() as f64;
    }
    Ok((0..n)
        .map(|k| {
            let mut g = -m.clone();
            g[k] += 1.0;
            (g.transpose() * &cov * &g)[(0, 0)].max(0.0).sqrt()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Footprint;
    use crate::meta::Metadata;
    use crate::store::{MemoryStore, NewCatalog};

    fn add_catalog(store: &mut MemoryStore, name: &str, meta: Metadata) -> CatalogId {
        let (id, _) = store
            .find_or_create_catalog(NewCatalog {
                name: name.into(),
                instrument: "cam".into(),
                footprint: Footprint::rectangle(10.0, 11.0, 0.0, 1.0).unwrap(),
                meta,
            })
            .unwrap();
        id
    }

    fn measured_edge(store: &mut MemoryStore, a: CatalogId, b: CatalogId, band: BandpassId, delta: f64, err: f64) {
        let id = store.insert_edge(a, b, band).unwrap();
        store.set_edge_delta(id, delta, err).unwrap();
    }

    fn reference() -> Metadata {
        let mut meta = Metadata::new();
        meta.set_zp_reference(true);
        meta
    }

    fn quick_config() -> SolveConfig {
        SolveConfig {
            basin_hopping: BasinHoppingConfig {
                niter: 5,
                ..Default::default()
            },
            nelder_mead: NelderMeadConfig {
                xatol: 1e-9,
                fatol: 1e-9,
                ..Default::default()
            },
            seed: Some(17),
            ..Default::default()
        }
    }

    #[test]
    fn chain_solves_relative_to_reference() {
        let mut store = MemoryStore::new();
        let band = store.find_or_create_bandpass("V", "Vega").unwrap();
        let a = add_catalog(&mut store, "a", reference());
        let b = add_catalog(&mut store, "b", Metadata::new());
        let c = add_catalog(&mut store, "c", Metadata::new());
        // delta = from − to, and z_to − z_from = delta at the optimum.
        measured_edge(&mut store, a, b, band, 1.0, 0.1);
        measured_edge(&mut store, b, c, band, 1.0, 0.1);
        store.commit().unwrap();

        let sol = solve_network(&mut store, band, &quick_config()).unwrap();
        let zp = |id| sol.zeropoint(id).unwrap().zp;
        assert!(zp(a).abs() < 1e-4, "z_a = {}", zp(a));
        assert!((zp(b) - zp(a) - 1.0).abs() < 1e-4, "z_b - z_a = {}", zp(b) - zp(a));
        assert!((zp(c) - zp(b) - 1.0).abs() < 1e-4, "z_c - z_b = {}", zp(c) - zp(b));

        // The reference is pinned; errors grow along the chain.
        let err = |id| sol.zeropoint(id).unwrap().err;
        assert!(err(a) < 1e-12);
        assert!((err(b) - 0.1).abs() < 1e-9, "err_b = {}", err(b));
        assert!((err(c) - 0.1 * 2f64.sqrt()).abs() < 1e-9, "err_c = {}", err(c));

        let stored = store.catalog(c).unwrap().meta.intercal_zp(band).unwrap();
        assert!((stored.0 - zp(c)).abs() < 1e-12);
        assert_eq!(store.pending_changes(), 0);
    }

    #[test]
    fn priors_shift_the_solution() {
        let mut store = MemoryStore::new();
        let band = store.find_or_create_bandpass("V", "Vega").unwrap();
        let mut ref_meta = reference();
        ref_meta.set_prior_zp(DEFAULT_PRIOR_KEY, band, 0.3);
        let a = add_catalog(&mut store, "a", ref_meta);
        let b = add_catalog(&mut store, "b", Metadata::new());
        measured_edge(&mut store, a, b, band, 0.5, 0.05);
        store.commit().unwrap();

        let sol = solve_network(&mut store, band, &quick_config()).unwrap();
        let za = sol.zeropoint(a).unwrap().zp;
        let zb = sol.zeropoint(b).unwrap().zp;
        // The reference keeps its prior; b's offset was measured against the
        // prior-corrected magnitudes of a.
        assert!((za - 0.3).abs() < 1e-4, "z_a = {za}");
        assert!((zb - 0.5).abs() < 1e-4, "z_b = {zb}");
    }

    #[test]
    fn requires_reference_and_persists_nothing() {
        let mut store = MemoryStore::new();
        let band = store.find_or_create_bandpass("V", "Vega").unwrap();
        let a = add_catalog(&mut store, "a", Metadata::new());
        let b = add_catalog(&mut store, "b", Metadata::new());
        measured_edge(&mut store, a, b, band, 1.0, 0.1);
        store.commit().unwrap();

        let err = solve_network(&mut store, band, &quick_config()).unwrap_err();
        assert!(matches!(err, Error::NoReferenceCatalogs(id) if id == band));
        assert!(store.catalog(b).unwrap().meta.intercal_zp(band).is_none());
    }

    #[test]
    fn unusable_offsets_are_rejected() {
        for (delta, err) in [(1.0, 0.0), (1.0, -0.1), (f64::NAN, 0.1), (1.0, f64::INFINITY)] {
            let mut store = MemoryStore::new();
            let band = store.find_or_create_bandpass("V", "Vega").unwrap();
            let a = add_catalog(&mut store, "a", reference());
            let b = add_catalog(&mut store, "b", Metadata::new());
            let c = add_catalog(&mut store, "c", Metadata::new());
            measured_edge(&mut store, a, b, band, 1.0, 0.1);
            measured_edge(&mut store, b, c, band, delta, err);
            store.commit().unwrap();
            let bad = store.edges(band)[1].id;

            let result = solve_network(&mut store, band, &quick_config());
            assert!(
                matches!(result, Err(Error::InvalidEdgeOffset { edge, .. }) if edge == bad),
                "delta {delta} ± {err}: {result:?}"
            );
            assert!(store.catalog(b).unwrap().meta.intercal_zp(band).is_none());
        }
    }

    #[test]
    fn catalogs_without_reference_path_are_left_out() {
        let mut store = MemoryStore::new();
        let band = store.find_or_create_bandpass("V", "Vega").unwrap();
        let a = add_catalog(&mut store, "a", reference());
        let b = add_catalog(&mut store, "b", Metadata::new());
        let c = add_catalog(&mut store, "c", Metadata::new());
        let d = add_catalog(&mut store, "d", Metadata::new());
        measured_edge(&mut store, a, b, band, 1.0, 0.1);
        measured_edge(&mut store, c, d, band, 0.5, 0.1);
        store.commit().unwrap();

        let sol = solve_network(&mut store, band, &quick_config()).unwrap();
        assert_eq!(sol.n_edges, 1);
        assert_eq!(sol.unanchored, vec![c, d]);
        assert_eq!(sol.zeropoints.len(), 2);
        assert!((sol.zeropoint(b).unwrap().zp - 1.0).abs() < 1e-4);
        assert!((sol.zeropoint(b).unwrap().err - 0.1).abs() < 1e-9);
        assert!(sol.zeropoint(c).is_none());
        assert!(store.catalog(c).unwrap().meta.intercal_zp(band).is_none());
        assert!(store.catalog(d).unwrap().meta.intercal_zp(band).is_none());
    }

    #[test]
    fn pending_edges_are_ignored() {
        let mut store = MemoryStore::new();
        let band = store.find_or_create_bandpass("V", "Vega").unwrap();
        let a = add_catalog(&mut store, "a", reference());
        let b = add_catalog(&mut store, "b", Metadata::new());
        store.insert_edge(a, b, band).unwrap();
        store.commit().unwrap();

        let err = solve_network(&mut store, band, &quick_config()).unwrap_err();
        assert!(matches!(err, Error::EmptyNetwork(_)));
    }
}
