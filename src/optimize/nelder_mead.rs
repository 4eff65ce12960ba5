use std::cell::Cell;

use nalgebra::DVector;
use serde::Deserialize;

use super::{Minimizer, Minimum};
use crate::error::{Error, Result};

/// Nelder–Mead termination settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NelderMeadConfig {
    pub max_iter: usize,
    pub max_fev: usize,
    /// Absolute spread of the simplex vertices at convergence.
    pub xatol: f64,
    /// Absolute spread of the objective over the simplex at convergence.
    pub fatol: f64,
}

impl Default for NelderMeadConfig {
    fn default() -> Self {
        Self {
            max_iter: 1_000_000,
            max_fev: 1_000_000,
            xatol: 1e-6,
            fatol: 1e-6,
        }
    }
}

/// Downhill simplex method with standard coefficients
/// (reflection 1, expansion 2, contraction ½, shrink ½).
#[derive(Debug, Clone, Default)]
pub struct NelderMead {
    pub config: NelderMeadConfig,
}

const RHO: f64 = 1.0;
const CHI: f64 = 2.0;
const PSI: f64 = 0.5;
const SIGMA: f64 = 0.5;

/// Relative (and, for zero coordinates, absolute) size of the initial simplex.
const NONZERO_DELTA: f64 = 0.05;
const ZERO_DELTA: f64 = 0.00025;

impl NelderMead {
    pub fn new(config: NelderMeadConfig) -> Self {
        Self { config }
    }
}

impl Minimizer for NelderMead {
    fn minimize(
        &mut self,
        objective: &dyn Fn(&DVector<f64>) -> f64,
        x0: &DVector<f64>,
    ) -> Result<Minimum> {
        let n = x0.len();
        if n == 0 {
            return Err(Error::Optimizer("empty parameter vector".into()));
        }
        let cfg = &self.config;
        let nfev = Cell::new(0usize);
        let eval = |x: &DVector<f64>| {
            nfev.set(nfev.get() + 1);
            let f = objective(x);
            // Non-finite values rank last.
            if f.is_nan() {
                f64::INFINITY
            } else {
                f
            }
        };

        let mut sim: Vec<DVector<f64>> = Vec::with_capacity(n + 1);
        sim.push(x0.clone());
        for k in 0..n {
            let mut y = x0.clone();
            y[k] = if y[k] != 0.0 {
                (1.0 + NONZERO_DELTA) * y[k]
            } else {
                ZERO_DELTA
            };
            sim.push(y);
        }
        let mut fsim: Vec<f64> = sim.iter().map(|x| eval(x)).collect();

        let mut nit = 0usize;
        let mut converged = false;
        loop {
            // Keep the simplex sorted, best vertex first.
            let mut order: Vec<usize> = (0..=n).collect();
            order.sort_by(|&a, &b| fsim[a].total_cmp(&fsim[b]));
            sim = order.iter().map(|&i| sim[i].clone()).collect();
            fsim = order.iter().map(|&i| fsim[i]).collect();

            let x_spread = sim[1..]
                .iter()
                .map(|v| (v - &sim[0]).amax())
                .fold(0.0, f64::max);
            let f_spread = fsim[1..]
                .iter()
                .map(|f| (f - fsim[0]).abs())
                .fold(0.0, f64::max);
            if x_spread <= cfg.xatol && f_spread <= cfg.fatol {
                converged = true;
                break;
            }
            if nit >= cfg.max_iter || nfev.get() >= cfg.max_fev {
                break;
            }
            nit += 1;

            let centroid = sim[..n]
                .iter()
                .fold(DVector::zeros(n), |acc, v| acc + v)
                / n as f64;
            let worst = sim[n].clone();

            let xr = &centroid * (1.0 + RHO) - &worst * RHO;
            let fr = eval(&xr);

            if fr < fsim[0] {
                let xe = &centroid * (1.0 + RHO * CHI) - &worst * (RHO * CHI);
                let fe = eval(&xe);
                if fe < fr {
                    sim[n] = xe;
                    fsim[n] = fe;
                } else {
                    sim[n] = xr;
                    fsim[n] = fr;
                }
                continue;
            }
            if fr < fsim[n - 1] {
                sim[n] = xr;
                fsim[n] = fr;
                continue;
            }

            // Contraction, outside or inside.
            let shrink = if fr < fsim[n] {
                let xc = &centroid * (1.0 + PSI * RHO) - &worst * (PSI * RHO);
                let fc = eval(&xc);
                if fc <= fr {
                    sim[n] = xc;
                    fsim[n] = fc;
                    false
                } else {
                    true
                }
            } else {
                let xcc = &centroid * (1.0 - PSI) + &worst * PSI;
                let fcc = eval(&xcc);
                if fcc < fsim[n] {
                    sim[n] = xcc;
                    fsim[n] = fcc;
                    false
                } else {
                    true
                }
            };

            if shrink {
                for j in 1..=n {
                    sim[j] = &sim[0] + (&sim[j] - &sim[0]) * SIGMA;
                    fsim[j] = eval(&sim[j]);
                }
            }
        }

        Ok(Minimum {
            x: sim[0].clone(),
            fun: fsim[0],
            nit,
            nfev: nfev.get(),
            converged,
        })
    }
}
