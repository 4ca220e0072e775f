//! Parameterization of the model under refinement.
//!
//! A [`Parameterization`] owns the current parameter vector and is the only
//! place it is ever mutated. Strategies read the vector with
//! [`get_param_vals`](Parameterization::get_param_vals), compute a shift, and
//! push the shifted vector back with
//! [`set_param_vals`](Parameterization::set_param_vals). Pushing new values is
//! also the hook where dependent model state is re-derived (e.g. predicted
//! observations recomputed from the new parameters); that propagation is the
//! parameterization's responsibility, not the engine's.
//!
//! The vector length is fixed when the parameterization is constructed. A
//! vector of any other length is rejected with
//! [`CoreError::DimensionMismatch`].

use nalgebra::DVector;

use crate::core::{CoreError, CoreResult};

/// Access to the parameter vector being refined.
///
/// Implementations must be cheap to read: `get_param_vals` is called at the
/// start of every step and must have no side effects. `set_param_vals` may be
/// expensive (model update), but is called at most a handful of times per
/// step.
pub trait Parameterization: Send + Sync {
    /// Number of parameters. Fixed for the lifetime of a refinement run.
    fn num_params(&self) -> usize;

    /// Current parameter values. No side effects.
    fn get_param_vals(&self) -> DVector<f64>;

    /// Push new parameter values and re-derive any dependent model state.
    ///
    /// Fails with [`CoreError::DimensionMismatch`] if `vals` does not have
    /// exactly [`num_params`](Parameterization::num_params) entries.
    fn set_param_vals(&mut self, vals: &DVector<f64>) -> CoreResult<()>;
}

/// The trivial parameterization: the model state *is* the vector.
///
/// Suitable for target functions that read the parameter values directly and
/// keep no derived state of their own.
#[derive(Debug, Clone)]
pub struct VectorParameterization {
    values: DVector<f64>,
}

impl VectorParameterization {
    pub fn new(initial: DVector<f64>) -> Self {
        VectorParameterization { values: initial }
    }

    /// Construct with all parameters at zero.
    pub fn zeros(n: usize) -> Self {
        VectorParameterization {
            values: DVector::zeros(n),
        }
    }
}

impl Parameterization for VectorParameterization {
    fn num_params(&self) -> usize {
        self.values.len()
    }

    fn get_param_vals(&self) -> DVector<f64> {
        self.values.clone()
    }

    fn set_param_vals(&mut self, vals: &DVector<f64>) -> CoreResult<()> {
        if vals.len() != self.values.len() {
            return Err(CoreError::DimensionMismatch {
                context: "set_param_vals".to_string(),
                expected: self.values.len(),
                actual: vals.len(),
            }
            .log());
        }
        self.values.copy_from(vals);
        Ok(())
    }
}
