use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use serde::Deserialize;
use tracing::debug;

use super::{Minimizer, Minimum};
use crate::error::Result;

/// Basin-hopping schedule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BasinHoppingConfig {
    /// Number of hops after the initial local minimization.
    pub niter: usize,
    /// Metropolis temperature.
    pub temperature: f64,
    /// Initial half-width of the uniform random displacement.
    pub stepsize: f64,
    /// Hops between step size updates.
    pub interval: usize,
    /// Acceptance rate the step size adapts towards.
    pub target_accept_rate: f64,
    /// Multiplicative step size update factor.
    pub stepwise_factor: f64,
}

impl Default for BasinHoppingConfig {
    fn default() -> Self {
        Self {
            niter: 100,
            temperature: 1.0e8,
            stepsize: 0.1,
            interval: 10,
            target_accept_rate: 0.5,
            stepwise_factor: 0.9,
        }
    }
}

/// Global minimizer: repeated random perturbation followed by local
/// minimization, accepting new minima by the Metropolis criterion. The
/// lowest minimum seen is returned.
pub struct BasinHopping<L> {
    pub config: BasinHoppingConfig,
    local: L,
    rng: StdRng,
}

impl<L: Minimizer> BasinHopping<L> {
    /// `seed` fixes the random hops; `None` draws a fresh seed.
    pub fn new(config: BasinHoppingConfig, local: L, seed: Option<u64>) -> Self {
        Self {
            config,
            local,
            rng: StdRng::seed_from_u64(seed.unwrap_or_else(rand::random::<u64>)),
        }
    }
}

impl<L: Minimizer> Minimizer for BasinHopping<L> {
    fn minimize(
        &mut self,
        objective: &dyn Fn(&DVector<f64>) -> f64,
        x0: &DVector<f64>,
    ) -> Result<Minimum> {
        let cfg = self.config.clone();
        let first = self.local.minimize(objective, x0)?;
        let mut nfev = first.nfev;
        let mut current = first.clone();
        let mut best = first;

        let mut stepsize = cfg.stepsize;
        let mut n_accept = 0usize;
        for hop in 1..=cfg.niter {
            let trial_x = current
                .x
                .map(|v| v + self.rng.random_range(-stepsize..=stepsize));
            let trial = self.local.minimize(objective, &trial_x)?;
            nfev += trial.nfev;

            let accept = trial.fun < current.fun || {
                let p = (-(trial.fun - current.fun) / cfg.temperature).exp();
                self.rng.random::<f64>() < p
            };
            if trial.fun < best.fun {
                best = trial.clone();
            }
            if accept {
                n_accept += 1;
                current = trial;
            }

            if cfg.interval > 0 && hop % cfg.interval == 0 {
                let rate = n_accept as f64 / hop as f64;
                if rate > cfg.target_accept_rate {
                    stepsize /= cfg.stepwise_factor;
                } else {
                    stepsize *= cfg.stepwise_factor;
                }
                debug!(
                    "basinhopping step {}: f = {:.6e}, best = {:.6e}, stepsize = {:.4}",
                    hop, current.fun, best.fun, stepsize
                );
            }
        }

        Ok(Minimum {
            x: best.x,
            fun: best.fun,
            nit: cfg.niter,
            nfev,
            converged: best.converged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::NelderMead;

    #[test]
    fn escapes_local_minimum() {
        // Double well with the global minimum near x = -1.
        let f = |x: &DVector<f64>| {
            let v = x[0];
            (v * v - 1.0).powi(2) + 0.3 * v
        };
        let mut bh = BasinHopping::new(
            BasinHoppingConfig {
                stepsize: 1.5,
                temperature: 1.0,
                niter: 50,
                ..Default::default()
            },
            NelderMead::default(),
            Some(3),
        );
        let m = bh.minimize(&f, &DVector::from_vec(vec![1.0])).unwrap();
        assert!(m.x[0] < -0.9, "x = {}", m.x[0]);
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let f = |x: &DVector<f64>| (x[0] - 0.3).powi(2) + (x[1] + 0.1).powi(2);
        let x0 = DVector::from_vec(vec![0.0, 0.0]);
        let run = |seed| {
            let mut bh = BasinHopping::new(
                BasinHoppingConfig {
                    niter: 10,
                    ..Default::default()
                },
                NelderMead::default(),
                Some(seed),
            );
            bh.minimize(&f, &x0).unwrap()
        };
        let a = run(11);
        let b = run(11);
        assert_eq!(a.x, b.x);
        assert!((a.x[0] - 0.3).abs() < 1e-4);
    }
}
