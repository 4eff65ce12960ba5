//! Derivative-free minimization.
//!
//! [`NelderMead`] is a local simplex method; [`BasinHopping`] wraps any
//! local [`Minimizer`] in a randomized global search with Metropolis
//! acceptance and an adaptive step size.

mod basinhopping;
mod nelder_mead;

use nalgebra::DVector;

use crate::error::Result;

pub use basinhopping::{BasinHopping, BasinHoppingConfig};
pub use nelder_mead::{NelderMead, NelderMeadConfig};

/// Result of a minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct Minimum {
    /// Location of the minimum.
    pub x: DVector<f64>,
    /// Objective value at `x`.
    pub fun: f64,
    /// Iterations performed.
    pub nit: usize,
    /// Objective evaluations performed.
    pub nfev: usize,
    /// `true` if the convergence criteria were met before any limit.
    pub converged: bool,
}

/// A method that minimizes a scalar objective over ℝⁿ.
pub trait Minimizer {
    fn minimize(
        &mut self,
        objective: &dyn Fn(&DVector<f64>) -> f64,
        x0: &DVector<f64>,
    ) -> Result<Minimum>;
}
