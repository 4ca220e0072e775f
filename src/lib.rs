//! # lsq-refinery
//!
//! A nonlinear least-squares refinement engine with pluggable minimization
//! strategies, built for iterative model refinement against blocked
//! observation sets.
//!
//! ## Features
//!
//! - **Multiple Minimization Engines**: plain and curvature-seeded L-BFGS,
//!   Gauss-Newton and Levenberg-Marquardt, selectable at runtime
//! - **Blocked Evaluation**: observations are split into blocks evaluated
//!   sequentially or on a worker pool, with an optional held-out block for
//!   out-of-sample RMSD tracking
//! - **Refinement Journal**: an append-only record of every accepted step
//!   with objective, RMSDs, parameters and optional diagnostics
//! - **Uncertainty Estimates**: parameter covariance from the inverse normal
//!   matrix, plus analytic covariance propagation through matrix inversion
//! - **Gradient Checking**: central finite-difference reference gradients
//!   for validating hand-written derivatives
//!
//! ## Usage
//!
//! Implement [`TargetFunction`] for your model, pick a
//! [`Parameterization`], partition the observations into a [`BlockSet`] and
//! hand all three to a [`Refinery`]:
//!
//! ```rust,ignore
//! use lsq_refinery::{BlockSet, EngineType, Refinery, RefineryConfig};
//!
//! let config = RefineryConfig::default()
//!     .with_engine(EngineType::LevenbergMarquardt)
//!     .with_max_iterations(50);
//! let blocks = BlockSet::partition(observations.len(), 8)?;
//! let mut refinery = Refinery::new(target, parameters, blocks, config)?;
//! let summary = refinery.run()?;
//! println!("{}", refinery.step_table());
//! ```

pub mod core;
pub mod engine;
pub mod error;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod observers;

pub use core::blocks::{
    BlockExecutor, BlockSet, DataBlock, ParallelExecutor, SequentialExecutor,
};
pub use core::gradient_check::{fd_functional_gradient, fd_gradients};
pub use core::normal_equations::NormalEquations;
pub use core::parameters::{Parameterization, VectorParameterization};
pub use core::target::TargetFunction;
pub use engine::{
    EngineType, Journal, JournalRow, Refinery, RefineryConfig, RefinerySummary,
    RmsdConvergenceTester, TerminationReason, TrackingOptions,
};
pub use error::{RefineryError, RefineryResult};
pub use linalg::{NormalEquationsSolver, invert_with_covariance, propagate_inverse_covariance};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use observers::{StepObserver, StepObserverVec};
