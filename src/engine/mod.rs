//! Minimization engines for nonlinear least squares refinement.
//!
//! This module provides the pluggable strategies driven by the
//! [`Refinery`](crate::engine::refinery::Refinery) loop:
//! - Quasi-Newton L-BFGS, plain or seeded with analytic curvatures
//! - Gauss-Newton iteration on the full normal equations
//! - Levenberg-Marquardt with adaptive damping
//!
//! A strategy computes one accepted parameter shift per call and reports the
//! state at the shifted point; the surrounding loop owns journaling,
//! convergence testing and termination.

use std::str::FromStr;
use std::{
    fmt,
    fmt::{Display, Formatter},
};

use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::{debug, error};

use crate::core::blocks::{BlockExecutor, BlockSet};
use crate::core::normal_equations::NormalEquations;
use crate::core::parameters::Parameterization;
use crate::core::target::{TargetFunction, weighted_ssq};
use crate::core::CoreError;
use crate::linalg::{LinAlgError, NormalEquationsSolver};

pub mod convergence;
pub mod gauss_newton;
pub mod journal;
pub mod levenberg_marquardt;
pub mod quasi_newton;
pub mod refinery;

pub use convergence::RmsdConvergenceTester;
pub use gauss_newton::GaussNewtonStrategy;
pub use journal::{Journal, JournalRow};
pub use levenberg_marquardt::LevenbergMarquardtStrategy;
pub use quasi_newton::QuasiNewtonStrategy;
pub use refinery::{Refinery, RefinerySummary};

/// Type of minimization engine to use
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    /// L-BFGS with unit initial scaling
    #[default]
    QuasiNewton,
    /// L-BFGS seeded with analytic curvature estimates
    QuasiNewtonCurvature,
    /// Gauss-Newton iteration (fast convergence, may be unstable)
    GaussNewton,
    /// Levenberg-Marquardt (robust, adaptive damping)
    LevenbergMarquardt,
}

impl Display for EngineType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EngineType::QuasiNewton => write!(f, "L-BFGS"),
            EngineType::QuasiNewtonCurvature => write!(f, "L-BFGS with curvatures"),
            EngineType::GaussNewton => write!(f, "Gauss-Newton"),
            EngineType::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
        }
    }
}

impl FromStr for EngineType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SimpleLBFGS" => Ok(EngineType::QuasiNewton),
            "LBFGScurvs" => Ok(EngineType::QuasiNewtonCurvature),
            "GaussNewton" => Ok(EngineType::GaussNewton),
            "LevMar" => Ok(EngineType::LevenbergMarquardt),
            other => Err(EngineError::InvalidConfig(format!(
                "unknown engine '{}'",
                other
            ))),
        }
    }
}

/// Why a refinement run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The target function reported its goal reached
    TargetAchieved,
    /// RMSDs stopped decreasing between consecutive steps
    RmsdConverged,
    /// Shift norm or gradient norm fell below threshold
    StepTooSmall,
    /// The objective rose between accepted steps
    ObjectiveIncrease,
    /// Iteration limit reached
    MaxIterations,
    /// Consecutive damped trials all rejected
    MaxTrialIterations,
    /// Fewer observations than parameters
    DofTooLow,
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::TargetAchieved => write!(f, "RMSD target achieved"),
            TerminationReason::RmsdConverged => write!(f, "RMSD no longer decreasing"),
            TerminationReason::StepTooSmall => write!(f, "Step too small"),
            TerminationReason::ObjectiveIncrease => {
                write!(f, "Refinement failure: objective increased")
            }
            TerminationReason::MaxIterations => {
                write!(f, "Reached maximum number of iterations")
            }
            TerminationReason::MaxTrialIterations => write!(
                f,
                "Reached maximum number of consecutive unsuccessful trial steps"
            ),
            TerminationReason::DofTooLow => {
                write!(f, "Not enough degrees of freedom to refine")
            }
        }
    }
}

/// Engine-specific error types for the refinery
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Target or parameterization evaluation failed
    #[error("Evaluation error: {0}")]
    Core(#[from] CoreError),

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] LinAlgError),

    /// Fewer observations than free parameters
    #[error("Too few degrees of freedom: {observations} observations for {parameters} parameters")]
    DofTooLow {
        observations: usize,
        parameters: usize,
    },

    /// Invalid refinement configuration provided
    #[error("Invalid refinement configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| EngineError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Which optional quantities the journal records per step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackingOptions {
    /// Record the applied shift vector
    pub track_step: bool,
    /// Record the functional gradient
    pub track_gradient: bool,
    /// Record the RMSD over the held-out block
    pub track_out_of_sample_rmsd: bool,
}

impl TrackingOptions {
    pub fn new() -> Self {
        TrackingOptions::default()
    }

    pub fn with_step(mut self, track: bool) -> Self {
        self.track_step = track;
        self
    }

    pub fn with_gradient(mut self, track: bool) -> Self {
        self.track_gradient = track;
        self
    }

    pub fn with_out_of_sample_rmsd(mut self, track: bool) -> Self {
        self.track_out_of_sample_rmsd = track;
        self
    }
}

/// Configuration shared by every engine.
///
/// Numerical defaults follow established refinement practice: a loose RMSD
/// convergence tolerance, a tiny gradient threshold, mild initial damping
/// for Levenberg-Marquardt and a generous cap on shifts measured in
/// estimated standard deviations.
#[derive(Debug, Clone)]
pub struct RefineryConfig {
    /// Which minimization engine drives the refinement
    pub engine: EngineType,
    /// Iteration limit; `None` uses the engine's own default
    pub max_iterations: Option<usize>,
    /// Relative tolerance for the RMSD convergence test
    pub rmsd_tolerance: f64,
    /// Terminate when the gradient infinity norm falls below this
    pub gradient_threshold: Option<f64>,
    /// Terminate when the shift norm falls below this
    pub step_threshold: Option<f64>,
    /// Initial Levenberg-Marquardt damping value
    pub damping_value: f64,
    /// Consecutive rejected damped trials allowed before giving up
    pub max_trial_iterations: usize,
    /// Cap on any parameter shift, in units of its standard deviation
    pub max_shift_over_esd: Option<f64>,
    /// Worker count for block evaluation; 1 runs sequentially
    pub nproc: usize,
    /// Compute the parameter covariance matrix after termination
    pub compute_covariance: bool,
    /// Optional per-step quantities to journal
    pub tracking: TrackingOptions,
}

impl Default for RefineryConfig {
    fn default() -> Self {
        RefineryConfig {
            engine: EngineType::default(),
            max_iterations: None,
            rmsd_tolerance: 1e-4,
            gradient_threshold: Some(1e-10),
            step_threshold: None,
            damping_value: 7e-4,
            max_trial_iterations: 10,
            max_shift_over_esd: Some(15.0),
            nproc: 1,
            compute_covariance: false,
            tracking: TrackingOptions::default(),
        }
    }
}

impl RefineryConfig {
    pub fn new() -> Self {
        RefineryConfig::default()
    }

    pub fn with_engine(mut self, engine: EngineType) -> Self {
        self.engine = engine;
        self
    }

    /// Set the maximum number of iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_rmsd_tolerance(mut self, rmsd_tolerance: f64) -> Self {
        self.rmsd_tolerance = rmsd_tolerance;
        self
    }

    pub fn with_gradient_threshold(mut self, gradient_threshold: f64) -> Self {
        self.gradient_threshold = Some(gradient_threshold);
        self
    }

    pub fn with_step_threshold(mut self, step_threshold: f64) -> Self {
        self.step_threshold = Some(step_threshold);
        self
    }

    /// Set the initial Levenberg-Marquardt damping value
    pub fn with_damping_value(mut self, damping_value: f64) -> Self {
        self.damping_value = damping_value;
        self
    }

    pub fn with_max_trial_iterations(mut self, max_trial_iterations: usize) -> Self {
        self.max_trial_iterations = max_trial_iterations;
        self
    }

    pub fn with_max_shift_over_esd(mut self, max_shift_over_esd: f64) -> Self {
        self.max_shift_over_esd = Some(max_shift_over_esd);
        self
    }

    /// Set the worker count for block evaluation
    pub fn with_nproc(mut self, nproc: usize) -> Self {
        self.nproc = nproc;
        self
    }

    pub fn with_compute_covariance(mut self, compute_covariance: bool) -> Self {
        self.compute_covariance = compute_covariance;
        self
    }

    pub fn with_tracking(mut self, tracking: TrackingOptions) -> Self {
        self.tracking = tracking;
        self
    }

    /// Reject configurations no engine can run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_iterations == Some(0) {
            return Err(
                EngineError::InvalidConfig("max_iterations must be at least 1".to_string()).log(),
            );
        }
        if !(self.rmsd_tolerance >= 1e-6) {
            return Err(EngineError::InvalidConfig(format!(
                "rmsd_tolerance must be at least 1e-6, got {}",
                self.rmsd_tolerance
            ))
            .log());
        }
        if !(self.damping_value >= 0.0) {
            return Err(EngineError::InvalidConfig(format!(
                "damping_value must be non-negative, got {}",
                self.damping_value
            ))
            .log());
        }
        if self.max_trial_iterations == 0 {
            return Err(EngineError::InvalidConfig(
                "max_trial_iterations must be at least 1".to_string(),
            )
            .log());
        }
        if self.nproc == 0 {
            return Err(
                EngineError::InvalidConfig("nproc must be at least 1".to_string()).log(),
            );
        }
        Ok(())
    }
}

/// Everything a strategy needs to compute one step.
pub struct StepContext<'a> {
    pub target: &'a dyn TargetFunction,
    pub parameters: &'a mut dyn Parameterization,
    pub executor: &'a dyn BlockExecutor,
    pub blocks: &'a BlockSet,
}

/// State at the shifted point after an accepted step.
#[derive(Debug, Clone)]
pub struct AcceptedStep {
    /// Objective value at the new parameters
    pub objective: f64,
    /// Functional gradient at the point the step was computed from
    pub gradient: Option<DVector<f64>>,
    /// Infinity norm of that gradient
    pub gradient_norm: f64,
    /// The shift applied to the parameters
    pub step: DVector<f64>,
    /// Damping value after the step, for damped engines
    pub damping: Option<f64>,
    /// Damping growth factor after the step, for damped engines
    pub nu: Option<f64>,
}

/// Result of asking a strategy for one step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The parameters were shifted; journal this state
    Accepted(AcceptedStep),
    /// The strategy cannot usefully continue
    Stopped(TerminationReason),
}

/// One minimization step at a time, with the surrounding loop owning
/// journaling and termination.
///
/// A call to [`step`](Strategy::step) leaves the parameterization at the
/// accepted shifted point, or unchanged when the outcome is `Stopped` or an
/// error.
pub trait Strategy {
    fn name(&self) -> &'static str;

    /// Iteration limit used when the configuration does not set one.
    fn default_max_iterations(&self) -> usize;

    fn step(&mut self, context: &mut StepContext<'_>) -> EngineResult<StepOutcome>;

    /// Last accumulated normal matrix, for engines that form one.
    fn normal_matrix(&self) -> Option<&DMatrix<f64>> {
        None
    }
}

/// Construct the strategy selected by the configuration.
pub fn build_strategy(config: &RefineryConfig) -> Box<dyn Strategy> {
    match config.engine {
        EngineType::QuasiNewton => Box::new(QuasiNewtonStrategy::new(config)),
        EngineType::QuasiNewtonCurvature => Box::new(QuasiNewtonStrategy::with_curvatures(config)),
        EngineType::GaussNewton => Box::new(GaussNewtonStrategy::new(config)),
        EngineType::LevenbergMarquardt => Box::new(LevenbergMarquardtStrategy::new(config)),
    }
}

/// Assemble the full normal equations at the current parameters, block
/// contributions first, restraints folded in once.
pub(crate) fn build_up(
    context: &mut StepContext<'_>,
    equations: &mut NormalEquations,
) -> EngineResult<()> {
    equations.reset();
    context.executor.accumulate_equations(
        context.target,
        &*context.parameters,
        context.blocks.fitting_blocks(),
        equations,
    )?;
    if let Some((residuals, jacobian, weights)) = context
        .target
        .compute_restraints_residuals_and_gradients(&*context.parameters)?
    {
        equations.add_equations(&residuals, &jacobian, &weights)?;
    }
    Ok(())
}

/// Objective value at the current parameters, restraints included.
/// Residual-only build-up, no derivative work.
pub(crate) fn evaluate_objective(context: &StepContext<'_>) -> EngineResult<f64> {
    let mut objective = context.executor.functional(
        context.target,
        &*context.parameters,
        context.blocks.fitting_blocks(),
    )?;
    if let Some((residuals, _, weights)) = context
        .target
        .compute_restraints_residuals_and_gradients(&*context.parameters)?
    {
        objective += weighted_ssq(&residuals, &weights)?;
    }
    Ok(objective)
}

/// Rescale a solved shift so that no component moves more than
/// `max_shift_over_esd` standard deviations, keeping its direction.
pub(crate) fn cap_shift_by_esd(
    solver: &mut NormalEquationsSolver,
    normal_matrix: &DMatrix<f64>,
    shift: DVector<f64>,
    max_shift_over_esd: f64,
) -> EngineResult<DVector<f64>> {
    let covariance = solver.inverse(normal_matrix)?;
    let mut worst = 0.0_f64;
    for i in 0..shift.len() {
        let variance = covariance[(i, i)];
        if variance > 0.0 {
            worst = worst.max(shift[i].abs() / variance.sqrt());
        }
    }
    if worst > max_shift_over_esd {
        let scale = max_shift_over_esd / worst;
        debug!(
            "largest shift is {:.3e} esds, rescaling the step by {:.3e}",
            worst, scale
        );
        Ok(shift * scale)
    } else {
        Ok(shift)
    }
}
