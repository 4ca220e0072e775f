//! Target function contract for least-squares refinement.
//!
//! A target function turns one observation block plus the current
//! parameterization into the quantities a minimizer consumes. The engine is
//! agnostic about what is being fitted; everything domain-specific lives
//! behind this trait.
//!
//! # Numeric convention
//!
//! ```text
//! f = ½ · Σ w·r²          the scalar functional
//! g = Jᵗ·(w ∘ r)          its gradient, with J = ∂r/∂p
//! c ≈ diag(JᵗWJ)          optional curvatures (Hessian diagonal estimate)
//! ```
//!
//! where `r` is observed − predicted and `w` an inverse-variance weight.
//! All evaluation methods produce fresh values for the current parameters;
//! nothing may be cached across steps.
//!
//! # Evaluation paths
//!
//! Three per-block paths serve the three strategy families:
//! - [`compute_residuals`](TargetFunction::compute_residuals) gives the
//!   objective-only view, used when just the functional is needed (trial
//!   steps, line searches).
//! - [`compute_residuals_and_gradients`](TargetFunction::compute_residuals_and_gradients)
//!   gives the full `(r, J, w)` triple for normal-equation assembly.
//! - [`compute_functional_gradients`](TargetFunction::compute_functional_gradients)
//!   gives pre-reduced `(f, g)` for quasi-Newton use, with an optional
//!   curvature-carrying variant.
//!
//! The `compute_restraints_*` counterparts contribute prior/soft-constraint
//! terms once per step (not per block) and return `None` when no restraints
//! are configured.
//!
//! # Reporting
//!
//! [`rmsds`](TargetFunction::rmsds) with its names and units feeds the journal
//! and the step table; it must be side-effect-free.
//! [`achieved`](TargetFunction::achieved) lets a target declare an externally
//! supplied RMSD threshold reached, which terminates refinement early.

use nalgebra::{DMatrix, DVector};

use crate::core::blocks::DataBlock;
use crate::core::parameters::Parameterization;
use crate::core::{CoreError, CoreResult};

/// Residuals and derivatives of the model against one observation block.
///
/// Implementations must be `Send + Sync`: in parallel evaluation each worker
/// calls the per-block methods concurrently with a shared read-only borrow of
/// the parameterization.
pub trait TargetFunction: Send + Sync {
    /// Residuals and weights for a block. Objective-only path.
    fn compute_residuals(
        &self,
        params: &dyn Parameterization,
        block: &DataBlock,
    ) -> CoreResult<(DVector<f64>, DVector<f64>)>;

    /// Residuals, Jacobian (`∂r/∂p`, one row per observation) and weights for
    /// a block. Full path for normal-equation assembly.
    fn compute_residuals_and_gradients(
        &self,
        params: &dyn Parameterization,
        block: &DataBlock,
    ) -> CoreResult<(DVector<f64>, DMatrix<f64>, DVector<f64>)>;

    /// Scalar functional and its gradient for a block, pre-reduced for
    /// quasi-Newton use.
    fn compute_functional_gradients(
        &self,
        params: &dyn Parameterization,
        block: &DataBlock,
    ) -> CoreResult<(f64, DVector<f64>)>;

    /// Functional, gradient and Hessian-diagonal curvatures for a block.
    ///
    /// Only required for the curvature-preconditioned quasi-Newton engine;
    /// the default declares the operation unsupported.
    fn compute_functional_gradients_and_curvatures(
        &self,
        params: &dyn Parameterization,
        block: &DataBlock,
    ) -> CoreResult<(f64, DVector<f64>, DVector<f64>)> {
        let _ = (params, block);
        Err(CoreError::Unsupported(
            "compute_functional_gradients_and_curvatures".to_string(),
        ))
    }

    /// Restraint residuals, Jacobian and weights; contributed once per step.
    fn compute_restraints_residuals_and_gradients(
        &self,
        params: &dyn Parameterization,
    ) -> CoreResult<Option<(DVector<f64>, DMatrix<f64>, DVector<f64>)>> {
        let _ = params;
        Ok(None)
    }

    /// Restraint functional and gradient; contributed once per step.
    fn compute_restraints_functional_gradients(
        &self,
        params: &dyn Parameterization,
    ) -> CoreResult<Option<(f64, DVector<f64>)>> {
        let _ = params;
        Ok(None)
    }

    /// Restraint functional, gradient and curvatures; contributed once per step.
    fn compute_restraints_functional_gradients_and_curvatures(
        &self,
        params: &dyn Parameterization,
    ) -> CoreResult<Option<(f64, DVector<f64>, DVector<f64>)>> {
        // Curvature-less targets usually share the plain restraint gradient
        match self.compute_restraints_functional_gradients(params)? {
            Some((f, g)) => {
                let n = g.len();
                Ok(Some((f, g, DVector::zeros(n))))
            }
            None => Ok(None),
        }
    }

    /// Reporting RMSDs over the given blocks. Side-effect-free.
    fn rmsds(
        &self,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
    ) -> CoreResult<Vec<f64>>;

    /// Names of the RMSD components, in the order `rmsds` returns them.
    fn rmsd_names(&self) -> Vec<String>;

    /// Units of the RMSD components, aligned with `rmsd_names`.
    fn rmsd_units(&self) -> Vec<String>;

    /// Whether an externally supplied RMSD target has been reached.
    fn achieved(&self, params: &dyn Parameterization) -> bool {
        let _ = params;
        false
    }
}

/// Reduce a residual/weight pair to its functional contribution `½·Σ w·r²`.
pub fn weighted_ssq(residuals: &DVector<f64>, weights: &DVector<f64>) -> CoreResult<f64> {
    if residuals.len() != weights.len() {
        return Err(CoreError::DimensionMismatch {
            context: "weighted_ssq".to_string(),
            expected: residuals.len(),
            actual: weights.len(),
        }
        .log());
    }
    let mut f = 0.0;
    for (r, w) in residuals.iter().zip(weights.iter()) {
        f += 0.5 * w * r * r;
    }
    Ok(f)
}
