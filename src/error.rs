//! Error types for the refinement library
//!
//! This module provides the main error and result types used throughout the
//! library. All errors use the `thiserror` crate for automatic trait
//! implementations.
//!
//! # Error Hierarchy
//!
//! The library uses a hierarchical error system where:
//! - **`RefineryError`** is the top-level error exposed to users via public APIs
//! - **Module errors** (`CoreError`, `EngineError`, `LinAlgError`) are wrapped inside it
//! - **Error sources** are preserved, allowing full error chain inspection
//!
//! Example error chain:
//! ```text
//! RefineryError::Engine(
//!     EngineError::LinAlg(
//!         LinAlgError::SingularMatrix
//!     )
//! )
//! ```

use crate::{core::CoreError, engine::EngineError, linalg::LinAlgError};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the library
pub type RefineryResult<T> = Result<T, RefineryError>;

/// Top-level error type wrapping the module-specific errors.
///
/// # Error Chain Access
///
/// The full error chain is available through the `chain()` method:
///
/// ```rust,ignore
/// if let Err(e) = refinery.run() {
///     warn!("Refinement failed: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum RefineryError {
    /// Target function, parameterization or block evaluation errors
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Minimization engine errors
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),
}

impl RefineryError {
    /// Full error chain as a multi-line string, from this error down to the
    /// root cause.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  -> {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Single-line variant of [`chain`](Self::chain) for log messages.
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_passes_through_module_error() {
        let error = RefineryError::from(LinAlgError::SingularMatrix);
        assert!(error.to_string().contains("Singular matrix"));
    }

    #[test]
    fn test_chain_walks_nested_sources() {
        let engine_error = EngineError::from(LinAlgError::FactorizationFailed(
            "Cholesky factorization failed".to_string(),
        ));
        let error = RefineryError::from(engine_error);

        let chain = error.chain();
        assert!(chain.contains("Linear algebra error"));
        assert!(chain.contains("Cholesky"));
    }

    #[test]
    fn test_chain_compact_is_single_line() {
        let core_error = CoreError::Evaluation("model blew up".to_string());
        let error = RefineryError::from(EngineError::from(core_error));

        let compact = error.chain_compact();
        assert!(compact.contains("model blew up"));
        assert!(!compact.contains('\n'));
    }

    #[test]
    fn test_transparent_error_conversion() {
        let core_error = CoreError::Evaluation("bad residual".to_string());
        let error: RefineryError = core_error.into();
        match error {
            RefineryError::Core(_) => {}
            _ => panic!("expected the Core variant"),
        }
    }
}
