//! The refinement loop.
//!
//! [`Refinery`] wires a target function, a parameterization, a block set and
//! a minimization strategy together and drives them to termination. The
//! strategy produces one accepted shift per step; the refinery owns
//! everything around that: journaling accepted steps, notifying observers,
//! applying the convergence tests in priority order and deciding when to
//! stop.
//!
//! Termination checks run after every accepted step, most meaningful reason
//! first: target achieved, RMSDs converged, step or gradient below
//! threshold, objective increase (for engines without damping to fall back
//! on), iteration limit. Strategies additionally stop on their own when
//! they cannot produce an acceptable step at all.

use std::fmt;
use std::fmt::{Display, Formatter};

use nalgebra::DMatrix;
use tracing::debug;
use web_time::{Duration, Instant};

use crate::core::blocks::{BlockExecutor, BlockSet, ParallelExecutor, SequentialExecutor};
use crate::core::normal_equations::NormalEquations;
use crate::core::parameters::Parameterization;
use crate::core::target::TargetFunction;
use crate::engine::journal::format_general;
use crate::engine::{
    EngineError, EngineResult, EngineType, Journal, JournalRow, RefineryConfig,
    RmsdConvergenceTester, StepContext, StepOutcome, Strategy, TerminationReason, build_strategy,
    build_up, evaluate_objective,
};
use crate::linalg::NormalEquationsSolver;
use crate::observers::{StepObserver, StepObserverVec};

/// Outcome of a completed refinement run.
#[derive(Debug, Clone)]
pub struct RefinerySummary {
    /// Name of the engine that drove the refinement
    pub engine: &'static str,
    /// Why the run stopped
    pub termination_reason: TerminationReason,
    /// Number of accepted steps
    pub iterations: usize,
    /// Objective before the first step
    pub initial_objective: f64,
    /// Objective after the last accepted step, if any step was accepted
    pub final_objective: Option<f64>,
    /// RMSDs after the last accepted step
    pub final_rmsds: Vec<f64>,
    /// Total wall clock time
    pub elapsed: Duration,
}

impl Display for RefinerySummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Refinement with {} finished in {} step(s)",
            self.engine, self.iterations
        )?;
        writeln!(f, "Termination: {}", self.termination_reason)?;
        match self.final_objective {
            Some(last) => writeln!(f, "Objective: {:.6e} -> {:.6e}", self.initial_objective, last)?,
            None => writeln!(f, "Objective: {:.6e}", self.initial_objective)?,
        }
        if !self.final_rmsds.is_empty() {
            let rmsds: Vec<String> = self.final_rmsds.iter().map(|v| format_general(*v)).collect();
            writeln!(f, "Final RMSDs: {}", rmsds.join(" "))?;
        }
        write!(
            f,
            "Wall clock time: {:.1} ms",
            self.elapsed.as_secs_f64() * 1000.0
        )
    }
}

/// Drives a minimization strategy over a target function until one of the
/// termination criteria fires.
pub struct Refinery {
    config: RefineryConfig,
    strategy: Box<dyn Strategy>,
    target: Box<dyn TargetFunction>,
    parameters: Box<dyn Parameterization>,
    executor: Box<dyn BlockExecutor>,
    blocks: BlockSet,
    journal: Journal,
    tester: RmsdConvergenceTester,
    observers: StepObserverVec,
    covariance: Option<DMatrix<f64>>,
}

impl Refinery {
    /// Assemble a refinery. Validates the configuration and spins up the
    /// worker pool when more than one worker is requested.
    pub fn new(
        target: Box<dyn TargetFunction>,
        parameters: Box<dyn Parameterization>,
        blocks: BlockSet,
        config: RefineryConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        let executor: Box<dyn BlockExecutor> = if config.nproc > 1 {
            Box::new(ParallelExecutor::new(config.nproc)?)
        } else {
            Box::new(SequentialExecutor::new())
        };
        let strategy = build_strategy(&config);
        let tester = RmsdConvergenceTester::new(config.rmsd_tolerance);
        Ok(Refinery {
            config,
            strategy,
            target,
            parameters,
            executor,
            blocks,
            journal: Journal::new(),
            tester,
            observers: StepObserverVec::new(),
            covariance: None,
        })
    }

    /// Register an observer notified with every accepted step.
    pub fn add_observer(&mut self, observer: impl StepObserver + 'static) {
        self.observers.add(observer);
    }

    /// Run the refinement to termination, starting from the current
    /// parameter values. The journal is cleared first, so a second call
    /// starts a fresh record from wherever the previous run left off.
    pub fn run(&mut self) -> EngineResult<RefinerySummary> {
        let start = Instant::now();
        self.journal = Journal::new();
        self.covariance = None;

        let num_parameters = self.parameters.num_params();
        let num_observations = self.blocks.num_fitting_observations();
        if num_observations < num_parameters {
            self.journal
                .set_termination_reason(TerminationReason::DofTooLow);
            return Err(EngineError::DofTooLow {
                observations: num_observations,
                parameters: num_parameters,
            }
            .log());
        }

        let max_iterations = self
            .config
            .max_iterations
            .unwrap_or_else(|| self.strategy.default_max_iterations());
        debug!(
            "refining {} parameters against {} observations with {}",
            num_parameters,
            num_observations,
            self.strategy.name()
        );

        let initial_objective = {
            let context = StepContext {
                target: &*self.target,
                parameters: &mut *self.parameters,
                executor: &*self.executor,
                blocks: &self.blocks,
            };
            evaluate_objective(&context)?
        };

        for iteration in 1..=max_iterations {
            let outcome = {
                let mut context = StepContext {
                    target: &*self.target,
                    parameters: &mut *self.parameters,
                    executor: &*self.executor,
                    blocks: &self.blocks,
                };
                self.strategy.step(&mut context)?
            };
            let accepted = match outcome {
                StepOutcome::Accepted(accepted) => accepted,
                StepOutcome::Stopped(reason) => {
                    self.journal.set_termination_reason(reason);
                    break;
                }
            };

            let rmsds = self
                .target
                .rmsds(&*self.parameters, self.blocks.fitting_blocks())?;
            let out_of_sample_rmsds = match (
                self.config.tracking.track_out_of_sample_rmsd,
                self.blocks.free_block(),
            ) {
                (true, Some(free)) => Some(
                    self.target
                        .rmsds(&*self.parameters, std::slice::from_ref(free))?,
                ),
                _ => None,
            };
            debug!(
                "step {}: objective {:.6e}, |g|inf {:.3e}, rmsds {:?}",
                iteration, accepted.objective, accepted.gradient_norm, rmsds
            );

            let row = JournalRow {
                step: iteration,
                num_observations: self.blocks.num_observations(),
                objective: accepted.objective,
                rmsds,
                parameter_vector: self.parameters.get_param_vals(),
                shift: self
                    .config
                    .tracking
                    .track_step
                    .then(|| accepted.step.clone()),
                gradient: if self.config.tracking.track_gradient {
                    accepted.gradient.clone()
                } else {
                    None
                },
                out_of_sample_rmsds,
                damping: accepted.damping,
                nu: accepted.nu,
            };
            self.observers.notify(&row);
            self.journal.push(row);

            if self.target.achieved(&*self.parameters) {
                self.journal
                    .set_termination_reason(TerminationReason::TargetAchieved);
                break;
            }
            if self.tester.converged(&self.journal) {
                self.journal
                    .set_termination_reason(TerminationReason::RmsdConverged);
                break;
            }
            let small_step = self
                .config
                .step_threshold
                .is_some_and(|threshold| accepted.step.norm() < threshold);
            let small_gradient = self
                .config
                .gradient_threshold
                .is_some_and(|threshold| accepted.gradient_norm < threshold);
            if small_step || small_gradient {
                self.journal
                    .set_termination_reason(TerminationReason::StepTooSmall);
                break;
            }
            if self.config.engine != EngineType::LevenbergMarquardt
                && let Some((previous, current)) = self.journal.last_two_objectives()
                && current > previous
            {
                self.journal
                    .set_termination_reason(TerminationReason::ObjectiveIncrease);
                break;
            }
        }

        if self.journal.termination_reason().is_none() {
            self.journal
                .set_termination_reason(TerminationReason::MaxIterations);
        }

        if self.config.compute_covariance {
            let mut equations = NormalEquations::new(num_parameters);
            let mut context = StepContext {
                target: &*self.target,
                parameters: &mut *self.parameters,
                executor: &*self.executor,
                blocks: &self.blocks,
            };
            build_up(&mut context, &mut equations)?;
            let mut solver = NormalEquationsSolver::new();
            self.covariance = Some(solver.inverse(equations.normal_matrix())?);
        }

        let summary = RefinerySummary {
            engine: self.strategy.name(),
            termination_reason: self
                .journal
                .termination_reason()
                .unwrap_or(TerminationReason::MaxIterations),
            iterations: self.journal.len(),
            initial_objective,
            final_objective: self.journal.last().map(|row| row.objective),
            final_rmsds: self
                .journal
                .last()
                .map(|row| row.rmsds.clone())
                .unwrap_or_default(),
            elapsed: start.elapsed(),
        };
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!("{}", summary);
        }
        Ok(summary)
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn parameters(&self) -> &dyn Parameterization {
        &*self.parameters
    }

    /// Formatted table of all journaled steps.
    pub fn step_table(&self) -> String {
        self.journal
            .step_table(&self.target.rmsd_names(), &self.target.rmsd_units())
    }

    /// Covariance of the refined parameters, present after a run with
    /// covariance computation enabled.
    pub fn covariance(&self) -> Option<&DMatrix<f64>> {
        self.covariance.as_ref()
    }
}
