//! Levenberg-Marquardt refinement strategy.
//!
//! Solves the damped normal equations at each trial:
//!
//! ```text
//! (JᵗWJ + λ·diag(JᵗWJ))·δ = -JᵗWr
//! ```
//!
//! The damping factor λ interpolates between Gauss-Newton (λ → 0, fast
//! quadratic convergence) and scaled gradient descent (λ large, guaranteed
//! descent direction), which keeps the iteration usable far from the minimum
//! and on ill-conditioned systems.
//!
//! ## Trial steps
//!
//! A solved shift is applied provisionally and the objective re-evaluated at
//! the shifted point. If it got worse, the shift is rolled back, λ is
//! multiplied by ν and ν doubles; the same system is re-solved with the
//! heavier damping. Such rejected trials do not count as iterations and are
//! never journaled. After `max_trial_iterations` consecutive rejections the
//! strategy stops. A factorization failure during a trial is treated the
//! same way as a rejected trial, since raising λ strengthens the diagonal;
//! it is only surfaced as an error when the last permitted trial fails in
//! the factorization itself.
//!
//! ## Damping update
//!
//! Accepted steps rescale λ by the gain ratio ρ of actual to predicted
//! reduction using Nielsen's formula:
//!
//! ```text
//! λ ← λ · max(⅓, 1 - (2ρ - 1)³),   ν ← 2
//! ```
//!
//! # References
//!
//! - Nielsen, H. B. (1999). "Damping Parameter in Marquardt's Method". Technical Report IMM-REP-1999-05.
//! - Madsen, K., Nielsen, H. B., & Tingleff, O. (2004). *Methods for Non-Linear Least Squares Problems* (2nd ed.). Chapter 3.

use nalgebra::DMatrix;
use tracing::debug;

use crate::core::normal_equations::NormalEquations;
use crate::engine::{
    AcceptedStep, EngineResult, RefineryConfig, StepContext, StepOutcome, Strategy,
    TerminationReason, build_up, cap_shift_by_esd, evaluate_objective,
};
use crate::linalg::NormalEquationsSolver;

pub struct LevenbergMarquardtStrategy {
    solver: NormalEquationsSolver,
    equations: Option<NormalEquations>,
    damping: f64,
    nu: f64,
    max_trial_iterations: usize,
    max_shift_over_esd: Option<f64>,
}

impl LevenbergMarquardtStrategy {
    pub fn new(config: &RefineryConfig) -> Self {
        LevenbergMarquardtStrategy {
            solver: NormalEquationsSolver::new(),
            equations: None,
            damping: config.damping_value,
            nu: 2.0,
            max_trial_iterations: config.max_trial_iterations,
            max_shift_over_esd: config.max_shift_over_esd,
        }
    }

    /// Current damping value, evolving across steps.
    pub fn damping(&self) -> f64 {
        self.damping
    }

    /// Gain ratio of actual to predicted reduction.
    fn step_quality(actual_reduction: f64, predicted_reduction: f64) -> f64 {
        if predicted_reduction.abs() < 1e-15 {
            if actual_reduction > 0.0 { 1.0 } else { 0.0 }
        } else {
            actual_reduction / predicted_reduction
        }
    }
}

impl Strategy for LevenbergMarquardtStrategy {
    fn name(&self) -> &'static str {
        "Levenberg-Marquardt"
    }

    fn default_max_iterations(&self) -> usize {
        20
    }

    fn step(&mut self, context: &mut StepContext<'_>) -> EngineResult<StepOutcome> {
        let n = context.parameters.num_params();
        let equations = match &mut self.equations {
            Some(equations) if equations.num_params() == n => equations,
            slot => slot.insert(NormalEquations::new(n)),
        };

        build_up(context, equations)?;
        let current_objective = equations.objective();
        let gradient = equations.gradient();
        let gradient_norm = gradient.amax();
        let diagonal = equations.normal_matrix().diagonal();
        let original = context.parameters.get_param_vals();

        for trial in 0..self.max_trial_iterations {
            let mut augmented = equations.normal_matrix().clone();
            for i in 0..n {
                augmented[(i, i)] += self.damping * diagonal[i];
            }

            let shift = match self.solver.solve(&augmented, equations.right_hand_side()) {
                Ok(shift) => shift,
                Err(e) => {
                    // More damping may cure the factorization; only the last
                    // permitted trial turns this into a hard failure
                    if trial + 1 == self.max_trial_iterations {
                        return Err(e.into());
                    }
                    debug!(
                        "trial {} failed to factorize, raising damping to {:.3e}",
                        trial + 1,
                        self.damping * self.nu
                    );
                    self.damping *= self.nu;
                    self.nu *= 2.0;
                    continue;
                }
            };
            let shift = match self.max_shift_over_esd {
                Some(cap) => cap_shift_by_esd(&mut self.solver, &augmented, shift, cap)?,
                None => shift,
            };

            context.parameters.set_param_vals(&(&original + &shift))?;
            let trial_objective = evaluate_objective(context)?;

            if trial_objective > current_objective {
                context.parameters.set_param_vals(&original)?;
                debug!(
                    "trial {} rejected: objective {:.6e} > {:.6e}, raising damping to {:.3e}",
                    trial + 1,
                    trial_objective,
                    current_objective,
                    self.damping * self.nu
                );
                self.damping *= self.nu;
                self.nu *= 2.0;
                continue;
            }

            // Accepted: rescale the damping by the gain ratio
            let actual = current_objective - trial_objective;
            let predicted =
                0.5 * shift.dot(&(self.damping * diagonal.component_mul(&shift) - &gradient));
            let rho = Self::step_quality(actual, predicted);
            let coff = 2.0 * rho - 1.0;
            self.damping *= (1.0_f64 / 3.0).max(1.0 - coff * coff * coff);
            self.nu = 2.0;
            debug!(
                "step accepted after {} trial(s): objective {:.6e}, rho {:.3}, damping {:.3e}",
                trial + 1,
                trial_objective,
                rho,
                self.damping
            );

            return Ok(StepOutcome::Accepted(AcceptedStep {
                objective: trial_objective,
                gradient: Some(gradient),
                gradient_norm,
                step: shift,
                damping: Some(self.damping),
                nu: Some(self.nu),
            }));
        }

        // Every permitted trial was rejected; parameters are back at the
        // last accepted state
        Ok(StepOutcome::Stopped(TerminationReason::MaxTrialIterations))
    }

    fn normal_matrix(&self) -> Option<&DMatrix<f64>> {
        self.equations.as_ref().map(NormalEquations::normal_matrix)
    }
}
