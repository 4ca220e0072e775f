//! Gauss-Newton refinement strategy.
//!
//! Solves the undamped normal equations at every step:
//!
//! ```text
//! (JᵗWJ)·δ = -JᵗWr
//! ```
//!
//! and applies the full shift, optionally rescaled so no parameter moves
//! more than a configured number of estimated standard deviations. There is
//! no step rejection: near a well-conditioned minimum this converges
//! quadratically, but a singular system or a rising objective is a hard
//! failure rather than something the strategy recovers from. Prefer
//! [`LevenbergMarquardtStrategy`](crate::engine::LevenbergMarquardtStrategy)
//! when conditioning or the starting point is in doubt.

use nalgebra::DMatrix;
use tracing::debug;

use crate::core::normal_equations::NormalEquations;
use crate::engine::{
    AcceptedStep, EngineResult, RefineryConfig, StepContext, StepOutcome, Strategy, build_up,
    cap_shift_by_esd, evaluate_objective,
};
use crate::linalg::NormalEquationsSolver;

pub struct GaussNewtonStrategy {
    solver: NormalEquationsSolver,
    equations: Option<NormalEquations>,
    max_shift_over_esd: Option<f64>,
}

impl GaussNewtonStrategy {
    pub fn new(config: &RefineryConfig) -> Self {
        GaussNewtonStrategy {
            solver: NormalEquationsSolver::new(),
            equations: None,
            max_shift_over_esd: config.max_shift_over_esd,
        }
    }
}

impl Strategy for GaussNewtonStrategy {
    fn name(&self) -> &'static str {
        "Gauss-Newton"
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
        let gradient = equations.gradient();
        let gradient_norm = gradient.amax();

        // Singular normal equations are fatal here; there is no damping to
        // fall back on
        let mut shift = self
            .solver
            .solve(equations.normal_matrix(), equations.right_hand_side())?;
        if let Some(cap) = self.max_shift_over_esd {
            shift = cap_shift_by_esd(&mut self.solver, equations.normal_matrix(), shift, cap)?;
        }

        let shifted = context.parameters.get_param_vals() + &shift;
        context.parameters.set_param_vals(&shifted)?;
        let objective = evaluate_objective(context)?;
        debug!(
            "Gauss-Newton step: objective {:.6e}, gradient norm {:.3e}, shift norm {:.3e}",
            objective,
            gradient_norm,
            shift.norm()
        );

        Ok(StepOutcome::Accepted(AcceptedStep {
            objective,
            gradient: Some(gradient),
            gradient_norm,
            step: shift,
            damping: None,
            nu: None,
        }))
    }

    fn normal_matrix(&self) -> Option<&DMatrix<f64>> {
        self.equations.as_ref().map(NormalEquations::normal_matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoreResult;
    use crate::core::blocks::{BlockSet, DataBlock, SequentialExecutor};
    use crate::core::parameters::{Parameterization, VectorParameterization};
    use crate::core::target::{TargetFunction, weighted_ssq};
    use nalgebra::{DVector, dvector};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Quadratic bowl: r_i = c_i - x_i with unit weights.
    struct CentresTarget {
        centres: DVector<f64>,
    }

    impl TargetFunction for CentresTarget {
        fn compute_residuals(
            &self,
            params: &dyn Parameterization,
            block: &DataBlock,
        ) -> CoreResult<(DVector<f64>, DVector<f64>)> {
            let x = params.get_param_vals();
            let idx: Vec<usize> = block.observation_range().collect();
            let residuals = DVector::from_fn(idx.len(), |i, _| self.centres[idx[i]] - x[idx[i]]);
            let weights = DVector::from_element(idx.len(), 1.0);
            Ok((residuals, weights))
        }

        fn compute_residuals_and_gradients(
            &self,
            params: &dyn Parameterization,
            block: &DataBlock,
        ) -> CoreResult<(DVector<f64>, DMatrix<f64>, DVector<f64>)> {
            let (residuals, weights) = self.compute_residuals(params, block)?;
            let idx: Vec<usize> = block.observation_range().collect();
            let mut jacobian = DMatrix::zeros(idx.len(), self.centres.len());
            for (row, &obs) in idx.iter().enumerate() {
                jacobian[(row, obs)] = -1.0;
            }
            Ok((residuals, jacobian, weights))
        }

        fn compute_functional_gradients(
            &self,
            params: &dyn Parameterization,
            block: &DataBlock,
        ) -> CoreResult<(f64, DVector<f64>)> {
            let (residuals, jacobian, weights) =
                self.compute_residuals_and_gradients(params, block)?;
            let f = weighted_ssq(&residuals, &weights)?;
            let g = jacobian.transpose() * residuals.component_mul(&weights);
            Ok((f, g))
        }

        fn rmsds(
            &self,
            params: &dyn Parameterization,
            blocks: &[DataBlock],
        ) -> CoreResult<Vec<f64>> {
            let mut ssq = 0.0;
            let mut count = 0;
            for block in blocks {
                let (residuals, _) = self.compute_residuals(params, block)?;
                ssq += residuals.norm_squared();
                count += residuals.len();
            }
            Ok(vec![(ssq / count.max(1) as f64).sqrt()])
        }

        fn rmsd_names(&self) -> Vec<String> {
            vec!["RMSD".to_string()]
        }

        fn rmsd_units(&self) -> Vec<String> {
            vec!["a.u.".to_string()]
        }
    }

    /// Exponential decay fit: r_i = exp(-t_i·x₀)·x₁ - y_i.
    struct DecayTarget {
        times: Vec<f64>,
        values: Vec<f64>,
    }

    impl DecayTarget {
        fn new(num_obs: usize) -> Self {
            let times: Vec<f64> = (0..num_obs).map(|i| 0.2 * i as f64).collect();
            // True parameters: rate 0.8, amplitude 2.5
            let values = times.iter().map(|t| 2.5 * (-0.8 * t).exp()).collect();
            DecayTarget { times, values }
        }

        fn model(&self, x: &DVector<f64>, obs: usize) -> f64 {
            x[1] * (-self.times[obs] * x[0]).exp()
        }
    }

    impl TargetFunction for DecayTarget {
        fn compute_residuals(
            &self,
            params: &dyn Parameterization,
            block: &DataBlock,
        ) -> CoreResult<(DVector<f64>, DVector<f64>)> {
            let x = params.get_param_vals();
            let idx: Vec<usize> = block.observation_range().collect();
            let residuals =
                DVector::from_fn(idx.len(), |i, _| self.model(&x, idx[i]) - self.values[idx[i]]);
            let weights = DVector::from_element(idx.len(), 1.0);
            Ok((residuals, weights))
        }

        fn compute_residuals_and_gradients(
            &self,
            params: &dyn Parameterization,
            block: &DataBlock,
        ) -> CoreResult<(DVector<f64>, DMatrix<f64>, DVector<f64>)> {
            let (residuals, weights) = self.compute_residuals(params, block)?;
            let x = params.get_param_vals();
            let idx: Vec<usize> = block.observation_range().collect();
            let mut jacobian = DMatrix::zeros(idx.len(), 2);
            for (row, &obs) in idx.iter().enumerate() {
                let decay = (-self.times[obs] * x[0]).exp();
                jacobian[(row, 0)] = -self.times[obs] * x[1] * decay;
                jacobian[(row, 1)] = decay;
            }
            Ok((residuals, jacobian, weights))
        }

        fn compute_functional_gradients(
            &self,
            params: &dyn Parameterization,
            block: &DataBlock,
        ) -> CoreResult<(f64, DVector<f64>)> {
            let (residuals, jacobian, weights) =
                self.compute_residuals_and_gradients(params, block)?;
            let f = weighted_ssq(&residuals, &weights)?;
            let g = jacobian.transpose() * residuals.component_mul(&weights);
            Ok((f, g))
        }

        fn rmsds(
            &self,
            params: &dyn Parameterization,
            blocks: &[DataBlock],
        ) -> CoreResult<Vec<f64>> {
            let mut ssq = 0.0;
            let mut count = 0;
            for block in blocks {
                let (residuals, _) = self.compute_residuals(params, block)?;
                ssq += residuals.norm_squared();
                count += residuals.len();
            }
            Ok(vec![(ssq / count.max(1) as f64).sqrt()])
        }

        fn rmsd_names(&self) -> Vec<String> {
            vec!["RMSD".to_string()]
        }

        fn rmsd_units(&self) -> Vec<String> {
            vec!["a.u.".to_string()]
        }
    }

    #[test]
    fn test_quadratic_bowl_solved_in_one_step() -> TestResult {
        let target = CentresTarget {
            centres: dvector![1.0, 2.0, 3.0],
        };
        let mut params = VectorParameterization::zeros(3);
        let blocks = BlockSet::partition(3, 1)?;
        let executor = SequentialExecutor::new();

        let mut strategy = GaussNewtonStrategy::new(&RefineryConfig::default());
        let mut context = StepContext {
            target: &target,
            parameters: &mut params,
            executor: &executor,
            blocks: &blocks,
        };
        let outcome = strategy.step(&mut context)?;

        let StepOutcome::Accepted(step) = outcome else {
            panic!("expected an accepted step");
        };
        assert!(step.objective < 1e-20);
        assert!((step.step - dvector![1.0, 2.0, 3.0]).norm() < 1e-10);
        assert!((params.get_param_vals() - dvector![1.0, 2.0, 3.0]).norm() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_objective_non_increasing_on_nonlinear_fit() -> TestResult {
        let target = DecayTarget::new(15);
        let mut params = VectorParameterization::new(dvector![0.5, 2.0]);
        let blocks = BlockSet::partition(15, 3)?;
        let executor = SequentialExecutor::new();

        let mut strategy = GaussNewtonStrategy::new(&RefineryConfig::default());
        let mut previous = f64::INFINITY;
        for _ in 0..5 {
            let mut context = StepContext {
                target: &target,
                parameters: &mut params,
                executor: &executor,
                blocks: &blocks,
            };
            let StepOutcome::Accepted(step) = strategy.step(&mut context)? else {
                panic!("expected an accepted step");
            };
            assert!(step.objective <= previous + 1e-12);
            previous = step.objective;
        }

        // Converged close to the generating parameters
        let x = params.get_param_vals();
        assert!((x[0] - 0.8).abs() < 1e-6);
        assert!((x[1] - 2.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_shift_capped_in_esd_units() -> TestResult {
        let target = CentresTarget {
            centres: dvector![1.0, 2.0, 3.0],
        };
        let mut params = VectorParameterization::zeros(3);
        let blocks = BlockSet::partition(3, 1)?;
        let executor = SequentialExecutor::new();

        // Normal matrix is the identity, so esds are all 1 and the raw
        // largest shift is 3 esds
        let config = RefineryConfig::default().with_max_shift_over_esd(0.5);
        let mut strategy = GaussNewtonStrategy::new(&config);
        let mut context = StepContext {
            target: &target,
            parameters: &mut params,
            executor: &executor,
            blocks: &blocks,
        };
        let StepOutcome::Accepted(step) = strategy.step(&mut context)? else {
            panic!("expected an accepted step");
        };

        let expected = dvector![1.0, 2.0, 3.0] * (0.5 / 3.0);
        assert!((step.step - expected).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_singular_normal_equations_are_fatal() -> TestResult {
        // Second parameter has no influence, so JᵗWJ is rank-deficient
        struct Underdetermined;
        impl TargetFunction for Underdetermined {
            fn compute_residuals(
                &self,
                params: &dyn Parameterization,
                block: &DataBlock,
            ) -> CoreResult<(DVector<f64>, DVector<f64>)> {
                let x = params.get_param_vals();
                let n = block.num_observations();
                Ok((
                    DVector::from_element(n, 1.0 - x[0]),
                    DVector::from_element(n, 1.0),
                ))
            }

            fn compute_residuals_and_gradients(
                &self,
                params: &dyn Parameterization,
                block: &DataBlock,
            ) -> CoreResult<(DVector<f64>, DMatrix<f64>, DVector<f64>)> {
                let (residuals, weights) = self.compute_residuals(params, block)?;
                let mut jacobian = DMatrix::zeros(residuals.len(), 2);
                for row in 0..residuals.len() {
                    jacobian[(row, 0)] = -1.0;
                }
                Ok((residuals, jacobian, weights))
            }

            fn compute_functional_gradients(
                &self,
                params: &dyn Parameterization,
                block: &DataBlock,
            ) -> CoreResult<(f64, DVector<f64>)> {
                let (residuals, jacobian, weights) =
                    self.compute_residuals_and_gradients(params, block)?;
                let f = weighted_ssq(&residuals, &weights)?;
                let g = jacobian.transpose() * residuals.component_mul(&weights);
                Ok((f, g))
            }

            fn rmsds(
                &self,
                _params: &dyn Parameterization,
                _blocks: &[DataBlock],
            ) -> CoreResult<Vec<f64>> {
                Ok(vec![0.0])
            }

            fn rmsd_names(&self) -> Vec<String> {
                vec!["RMSD".to_string()]
            }

            fn rmsd_units(&self) -> Vec<String> {
                vec!["a.u.".to_string()]
            }
        }

        let target = Underdetermined;
        let mut params = VectorParameterization::zeros(2);
        let blocks = BlockSet::partition(3, 1)?;
        let executor = SequentialExecutor::new();

        let mut strategy = GaussNewtonStrategy::new(&RefineryConfig::default());
        let mut context = StepContext {
            target: &target,
            parameters: &mut params,
            executor: &executor,
            blocks: &blocks,
        };
        assert!(strategy.step(&mut context).is_err());
        Ok(())
    }

    #[test]
    fn test_normal_matrix_exposed_after_step() -> TestResult {
        let target = CentresTarget {
            centres: dvector![1.0, 2.0, 3.0],
        };
        let mut params = VectorParameterization::zeros(3);
        let blocks = BlockSet::partition(3, 1)?;
        let executor = SequentialExecutor::new();

        let mut strategy = GaussNewtonStrategy::new(&RefineryConfig::default());
        assert!(strategy.normal_matrix().is_none());

        let mut context = StepContext {
            target: &target,
            parameters: &mut params,
            executor: &executor,
            blocks: &blocks,
        };
        strategy.step(&mut context)?;

        let n_matrix = strategy.normal_matrix().ok_or("missing normal matrix")?;
        assert!((n_matrix - DMatrix::identity(3, 3)).norm() < 1e-12);
        Ok(())
    }
}
