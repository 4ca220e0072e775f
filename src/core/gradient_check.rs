//! Finite-difference gradients for verifying analytic derivatives.
//!
//! Central differences: each parameter is perturbed to `x - δ/2` and
//! `x + δ/2`, the supplied evaluation runs at both points through the full
//! parameterization (so derived model state is re-propagated on every set),
//! and the slope `(f⁺ - f⁻)/δ` approximates the partial derivative with an
//! error of order `δ²`. The original parameter vector is restored before
//! returning on every path, including evaluation failure.

use nalgebra::DVector;

use crate::core::blocks::{BlockExecutor, DataBlock};
use crate::core::parameters::Parameterization;
use crate::core::target::TargetFunction;
use crate::core::{CoreError, CoreResult};

/// Central finite-difference gradient of `evaluate` at the current
/// parameter values, with a per-parameter step `deltas[i]`.
pub fn fd_gradients<F>(
    parameters: &mut dyn Parameterization,
    deltas: &DVector<f64>,
    mut evaluate: F,
) -> CoreResult<DVector<f64>>
where
    F: FnMut(&dyn Parameterization) -> CoreResult<f64>,
{
    let original = parameters.get_param_vals();
    if deltas.len() != original.len() {
        return Err(CoreError::DimensionMismatch {
            context: "finite-difference steps".to_string(),
            expected: original.len(),
            actual: deltas.len(),
        }
        .log());
    }

    let result = (|| -> CoreResult<DVector<f64>> {
        let mut gradient = DVector::zeros(original.len());
        let mut shifted = original.clone();
        for i in 0..original.len() {
            if deltas[i] == 0.0 {
                return Err(CoreError::Evaluation(format!(
                    "finite-difference step for parameter {} is zero",
                    i
                ))
                .log());
            }

            shifted[i] = original[i] - deltas[i] / 2.0;
            parameters.set_param_vals(&shifted)?;
            let reverse = evaluate(&*parameters)?;

            shifted[i] = original[i] + deltas[i] / 2.0;
            parameters.set_param_vals(&shifted)?;
            let forward = evaluate(&*parameters)?;

            gradient[i] = (forward - reverse) / deltas[i];
            shifted[i] = original[i];
        }
        Ok(gradient)
    })();

    // Leave the parameterization as it was found, whatever happened above
    parameters.set_param_vals(&original)?;
    result
}

/// Finite-difference gradient of the block-summed functional, with one
/// uniform step for every parameter.
pub fn fd_functional_gradient(
    parameters: &mut dyn Parameterization,
    target: &dyn TargetFunction,
    executor: &dyn BlockExecutor,
    blocks: &[DataBlock],
    delta: f64,
) -> CoreResult<DVector<f64>> {
    let deltas = DVector::from_element(parameters.num_params(), delta);
    fd_gradients(parameters, &deltas, |p| executor.functional(target, p, blocks))
}
