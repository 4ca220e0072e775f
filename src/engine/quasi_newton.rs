//! Limited-memory quasi-Newton refinement strategy.
//!
//! Instead of forming and factorizing the normal matrix, this strategy keeps
//! a short history of parameter and gradient differences `(s, y)` and applies
//! the L-BFGS two-loop recursion to produce an approximate Newton direction
//! from gradient evaluations alone. Cost per step is O(m·n) for a history of
//! m pairs, so it scales to parameter counts where a dense `n × n` normal
//! matrix is not affordable.
//!
//! Two flavours share the implementation:
//!
//! - the plain variant seeds the inverse Hessian with the standard
//!   `sᵗy / yᵗy` scaling of the latest pair;
//! - the curvature variant seeds it with the reciprocal diagonal curvatures
//!   reported by the target, which pre-whitens badly scaled parameters and
//!   usually cuts the iteration count sharply.
//!
//! Steps are globalized by an Armijo backtracking line search on the
//! objective. A search that cannot find any decrease stops the refinement,
//! since with a descent direction in exact arithmetic that only happens at a
//! stationary point or on an inconsistent target.
//!
//! # References
//!
//! - Nocedal, J. (1980). "Updating Quasi-Newton Matrices with Limited Storage". Mathematics of Computation, 35(151).
//! - Liu, D. C., & Nocedal, J. (1989). "On the Limited Memory BFGS Method for Large Scale Optimization". Mathematical Programming, 45.

use std::collections::VecDeque;

use nalgebra::DVector;
use tracing::debug;

use crate::core::CoreError;
use crate::engine::{
    AcceptedStep, EngineResult, RefineryConfig, StepContext, StepOutcome, Strategy,
    TerminationReason, evaluate_objective,
};

/// Number of `(s, y)` pairs kept for the two-loop recursion.
const HISTORY: usize = 5;

/// Pairs with `sᵗy` at or below this are skipped to keep the implicit
/// inverse Hessian positive definite.
const CURVATURE_GUARD: f64 = 1e-10;

/// Diagonal curvatures at or below this are not inverted.
const CURVATURE_FLOOR: f64 = 1e-12;

const ARMIJO_SLOPE: f64 = 1e-4;
const MAX_HALVINGS: usize = 20;

pub struct QuasiNewtonStrategy {
    use_curvatures: bool,
    history: VecDeque<(DVector<f64>, DVector<f64>)>,
    previous: Option<(DVector<f64>, DVector<f64>)>,
}

impl QuasiNewtonStrategy {
    pub fn new(_config: &RefineryConfig) -> Self {
        QuasiNewtonStrategy {
            use_curvatures: false,
            history: VecDeque::with_capacity(HISTORY),
            previous: None,
        }
    }

    /// Variant seeded with the target's diagonal curvatures.
    pub fn with_curvatures(_config: &RefineryConfig) -> Self {
        QuasiNewtonStrategy {
            use_curvatures: true,
            history: VecDeque::with_capacity(HISTORY),
            previous: None,
        }
    }

    /// Objective, gradient and (for the curvature variant) diagonal
    /// curvatures at the current parameters, restraints folded in.
    fn evaluate_gradient(
        &self,
        context: &StepContext<'_>,
    ) -> EngineResult<(f64, DVector<f64>, Option<DVector<f64>>)> {
        let blocks = context.blocks.fitting_blocks();
        if self.use_curvatures {
            let (mut functional, mut gradient, mut curvatures) = context
                .executor
                .functional_gradients_and_curvatures(context.target, &*context.parameters, blocks)?;
            if let Some((f, g, c)) = context
                .target
                .compute_restraints_functional_gradients_and_curvatures(&*context.parameters)?
            {
                check_restraint_len("restraint gradient", gradient.len(), g.len())?;
                check_restraint_len("restraint curvatures", curvatures.len(), c.len())?;
                functional += f;
                gradient += g;
                curvatures += c;
            }
            Ok((functional, gradient, Some(curvatures)))
        } else {
            let (mut functional, mut gradient) = context.executor.functional_gradients(
                context.target,
                &*context.parameters,
                blocks,
            )?;
            if let Some((f, g)) = context
                .target
                .compute_restraints_functional_gradients(&*context.parameters)?
            {
                check_restraint_len("restraint gradient", gradient.len(), g.len())?;
                functional += f;
                gradient += g;
            }
            Ok((functional, gradient, None))
        }
    }

    /// Apply the two-loop recursion to `gradient`, giving `H·g` for the
    /// implicit inverse Hessian approximation.
    fn apply_inverse_hessian(
        &self,
        gradient: &DVector<f64>,
        curvatures: Option<&DVector<f64>>,
    ) -> DVector<f64> {
        let mut q = gradient.clone();
        let mut alphas = Vec::with_capacity(self.history.len());
        for (s, y) in self.history.iter().rev() {
            let rho = 1.0 / y.dot(s);
            let alpha = rho * s.dot(&q);
            q.axpy(-alpha, y, 1.0);
            alphas.push((rho, alpha));
        }

        match curvatures {
            Some(c) => {
                for i in 0..q.len() {
                    if c[i] > CURVATURE_FLOOR {
                        q[i] /= c[i];
                    }
                }
            }
            None => {
                if let Some((s, y)) = self.history.back() {
                    q *= s.dot(y) / y.dot(y);
                }
            }
        }

        for ((s, y), (rho, alpha)) in self.history.iter().zip(alphas.iter().rev()) {
            let beta = rho * y.dot(&q);
            q.axpy(alpha - beta, s, 1.0);
        }
        q
    }
}

fn check_restraint_len(context: &str, expected: usize, actual: usize) -> EngineResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(CoreError::DimensionMismatch {
            context: context.to_string(),
            expected,
            actual,
        }
        .into())
    }
}

impl Strategy for QuasiNewtonStrategy {
    fn name(&self) -> &'static str {
        if self.use_curvatures {
            "L-BFGS with curvatures"
        } else {
            "L-BFGS"
        }
    }

    fn default_max_iterations(&self) -> usize {
        100
    }

    fn step(&mut self, context: &mut StepContext<'_>) -> EngineResult<StepOutcome> {
        let (functional, gradient, curvatures) = self.evaluate_gradient(context)?;
        let gradient_norm = gradient.amax();
        let original = context.parameters.get_param_vals();

        if let Some((previous_params, previous_gradient)) = self.previous.take() {
            let s = &original - previous_params;
            let y = &gradient - previous_gradient;
            if s.dot(&y) > CURVATURE_GUARD {
                if self.history.len() == HISTORY {
                    self.history.pop_front();
                }
                self.history.push_back((s, y));
            }
        }

        let mut direction = -self.apply_inverse_hessian(&gradient, curvatures.as_ref());
        let mut slope = direction.dot(&gradient);
        if !(slope < 0.0) && gradient_norm > 0.0 {
            // Stale history can stop producing descent directions after a
            // sharp change in the objective landscape; restart from it
            debug!("direction is not downhill, dropping the update history");
            self.history.clear();
            direction = -self.apply_inverse_hessian(&gradient, curvatures.as_ref());
            slope = direction.dot(&gradient);
        }

        let mut step_length = 1.0;
        for _ in 0..MAX_HALVINGS {
            let shift = &direction * step_length;
            context.parameters.set_param_vals(&(&original + &shift))?;
            let trial_objective = evaluate_objective(context)?;
            if trial_objective <= functional + ARMIJO_SLOPE * step_length * slope {
                debug!(
                    "step accepted at length {:.3e}: objective {:.6e}, |g|inf {:.3e}",
                    step_length, trial_objective, gradient_norm
                );
                self.previous = Some((original, gradient.clone()));
                return Ok(StepOutcome::Accepted(AcceptedStep {
                    objective: trial_objective,
                    gradient: Some(gradient),
                    gradient_norm,
                    step: shift,
                    damping: None,
                    nu: None,
                }));
            }
            step_length *= 0.5;
        }

        context.parameters.set_param_vals(&original)?;
        Ok(StepOutcome::Stopped(TerminationReason::ObjectiveIncrease))
    }
}
