//! Core refinement components for the lsq-refinery library
//!
//! This module contains the fundamental building blocks for nonlinear least squares refinement:
//! - Parameterization of the model being fitted
//! - Target function contract (residuals, gradients, curvatures, restraints)
//! - Observation blocks and their sequential/parallel evaluation
//! - The per-step normal equations accumulator
//! - Finite-difference gradient checking

pub mod blocks;
pub mod gradient_check;
pub mod normal_equations;
pub mod parameters;
pub mod target;

use thiserror::Error;
use tracing::error;

/// Core module error types for parameterizations, targets and block evaluation
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Length mismatch between parameter/residual/weight vectors or Jacobian shapes
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// Target function evaluation failed
    #[error("Target evaluation error: {0}")]
    Evaluation(String),

    /// Parallel block evaluation failed (worker or pool failure)
    #[error("Parallel evaluation error: {0}")]
    ParallelEvaluation(String),

    /// Operation not provided by this target function
    #[error("Unsupported target operation: {0}")]
    Unsupported(String),

    /// Block set construction or partition error
    #[error("Block error: {0}")]
    Block(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// This method allows for a consistent error logging pattern throughout
    /// the core module, ensuring all errors are properly recorded.
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// This method logs both the CoreError and the underlying error
    /// from external libraries. This provides full debugging context when
    /// errors occur in third-party code.
    ///
    /// # Arguments
    /// * `source_error` - The original error from the third-party library (must implement Debug)
    ///
    /// # Example
    /// ```ignore
    /// evaluate_block()
    ///     .map_err(|e| {
    ///         CoreError::Evaluation(
    ///             "residual evaluation failed".to_string()
    ///         )
    ///         .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
