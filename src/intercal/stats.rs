//! Robust statistics for zero-point differences.

use rand::rngs::StdRng;
use rand::RngExt;

/// Scale factor from median absolute deviation to Gaussian sigma.
const MAD_TO_SIGMA: f64 = 1.4826;

/// MAD at or below which the values count as having no spread.
const ZERO_SPREAD_TOL: f64 = 1e-12;

/// Median of a slice; `None` when empty.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    let mid = v.len() / 2;
    Some(if v.len() % 2 == 0 {
        0.5 * (v[mid - 1] + v[mid])
    } else {
        v[mid]
    })
}

/// Iterative sigma clipping about the median, with sigma estimated from the
/// median absolute deviation. `errors` are the per-value uncertainties,
/// aligned with `values`. Returns a keep-mask aligned with `values`.
///
/// Stops when an iteration clips nothing or after `max_iterations`. When
/// more than half of the surviving values coincide (zero MAD, as with
/// quantized photometry), the median of their errors sets sigma instead.
pub fn sigma_clip(values: &[f64], errors: &[f64], nsigma: f64, max_iterations: usize) -> Vec<bool> {
    let mut keep = vec![true; values.len()];
    for _ in 0..max_iterations {
        let (kept, kept_errors): (Vec<f64>, Vec<f64>) = values
            .iter()
            .zip(errors)
            .zip(&keep)
            .filter(|(_, &k)| k)
            .map(|((&v, &e), _)| (v, e))
            .unzip();
        let Some(center) = median(&kept) else {
            break;
        };
        let deviations: Vec<f64> = kept.iter().map(|v| (v - center).abs()).collect();
        let mad = median(&deviations).unwrap_or(0.0);
        let sigma = if mad > ZERO_SPREAD_TOL {
            MAD_TO_SIGMA * mad
        } else {
            median(&kept_errors).unwrap_or(0.0)
        };
        if !(sigma > 0.0) {
            break;
        }
        let limit = nsigma * sigma;

        let mut clipped = 0usize;
        for (v, k) in values.iter().zip(keep.iter_mut()) {
            if *k && (v - center).abs() > limit {
                *k = false;
                clipped += 1;
            }
        }
        if clipped == 0 {
            break;
        }
    }
    keep
}

/// Inverse-variance weighted mean.
pub fn weighted_mean(values: &[f64], errors: &[f64]) -> f64 {
    let (num, den) = values
        .iter()
        .zip(errors)
        .fold((0.0, 0.0), |(num, den), (v, e)| {
            let w = 1.0 / (e * e);
            (num + w * v, den + w)
        });
    num / den
}

/// Formal uncertainty of the inverse-variance weighted mean, `1/sqrt(Σ 1/σ²)`.
pub fn weighted_mean_error(errors: &[f64]) -> f64 {
    let den: f64 = errors.iter().map(|e| 1.0 / (e * e)).sum();
    1.0 / den.sqrt()
}

/// Standard deviation of `n_samples` bootstrap weighted means. Each resample
/// draws `values.len()` indices with replacement.
pub fn bootstrap_std(values: &[f64], errors: &[f64], n_samples: usize, rng: &mut StdRng) -> f64 {
    let n = values.len();
    if n == 0 || n_samples == 0 {
        return f64::NAN;
    }
    let mut v = vec![0.0; n];
    let mut e = vec![0.0; n];
    let means: Vec<f64> = (0..n_samples)
        .map(|_| {
            for k in 0..n {
                let idx = rng.random_range(0..n);
                v[k] = values[idx];
                e[k] = errors[idx];
            }
            weighted_mean(&v, &e)
        })
        .collect();
    let mean = means.iter().sum::<f64>() / n_samples as f64;
    let var = means.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n_samples as f64;
    var.sqrt()
}
