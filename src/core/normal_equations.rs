//! Accumulator for the normal equations of a weighted least-squares step.
//!
//! Residual blocks are folded in one at a time, in either of two modes:
//! - [`add_equations`](NormalEquations::add_equations) accumulates the full
//!   system `JᵗWJ`, the right-hand side `-JᵗWr` and the objective `½·Σ w·r²`.
//! - [`add_residuals`](NormalEquations::add_residuals) accumulates the
//!   objective only, for cheap re-evaluation after a trial shift.
//!
//! The right-hand side carries the negated gradient, so solving
//! `normal_matrix · δ = right_hand_side` directly yields a descent shift.

use nalgebra::{DMatrix, DVector};

use crate::core::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct NormalEquations {
    normal_matrix: DMatrix<f64>,
    right_hand_side: DVector<f64>,
    objective: f64,
    num_equations: usize,
}

impl NormalEquations {
    /// A zeroed accumulator for `num_params` parameters.
    pub fn new(num_params: usize) -> Self {
        NormalEquations {
            normal_matrix: DMatrix::zeros(num_params, num_params),
            right_hand_side: DVector::zeros(num_params),
            objective: 0.0,
            num_equations: 0,
        }
    }

    /// Zero every accumulated term, keeping the parameter dimension.
    pub fn reset(&mut self) {
        self.normal_matrix.fill(0.0);
        self.right_hand_side.fill(0.0);
        self.objective = 0.0;
        self.num_equations = 0;
    }

    /// Fold in residuals and weights without gradient information.
    pub fn add_residuals(
        &mut self,
        residuals: &DVector<f64>,
        weights: &DVector<f64>,
    ) -> CoreResult<()> {
        if residuals.len() != weights.len() {
            return Err(CoreError::DimensionMismatch {
                context: "residual weights".to_string(),
                expected: residuals.len(),
                actual: weights.len(),
            }
            .log());
        }
        self.objective += 0.5 * residuals.dot(&residuals.component_mul(weights));
        self.num_equations += residuals.len();
        Ok(())
    }

    /// Fold in one block's residuals, design matrix and weights.
    pub fn add_equations(
        &mut self,
        residuals: &DVector<f64>,
        jacobian: &DMatrix<f64>,
        weights: &DVector<f64>,
    ) -> CoreResult<()> {
        if residuals.len() != weights.len() {
            return Err(CoreError::DimensionMismatch {
                context: "residual weights".to_string(),
                expected: residuals.len(),
                actual: weights.len(),
            }
            .log());
        }
        if jacobian.nrows() != residuals.len() {
            return Err(CoreError::DimensionMismatch {
                context: "design matrix rows".to_string(),
                expected: residuals.len(),
                actual: jacobian.nrows(),
            }
            .log());
        }
        if jacobian.ncols() != self.num_params() {
            return Err(CoreError::DimensionMismatch {
                context: "design matrix columns".to_string(),
                expected: self.num_params(),
                actual: jacobian.ncols(),
            }
            .log());
        }

        let weighted_residuals = residuals.component_mul(weights);
        self.objective += 0.5 * residuals.dot(&weighted_residuals);
        self.right_hand_side -= jacobian.transpose() * &weighted_residuals;

        let mut weighted_jacobian = jacobian.clone();
        for (i, mut row) in weighted_jacobian.row_iter_mut().enumerate() {
            row *= weights[i];
        }
        self.normal_matrix += jacobian.transpose() * weighted_jacobian;

        self.num_equations += residuals.len();
        Ok(())
    }

    pub fn num_params(&self) -> usize {
        self.right_hand_side.len()
    }

    pub fn num_equations(&self) -> usize {
        self.num_equations
    }

    /// Accumulated `½·Σ w·r²`.
    pub fn objective(&self) -> f64 {
        self.objective
    }

    /// Accumulated `JᵗWJ`.
    pub fn normal_matrix(&self) -> &DMatrix<f64> {
        &self.normal_matrix
    }

    /// Accumulated `-JᵗWr`.
    pub fn right_hand_side(&self) -> &DVector<f64> {
        &self.right_hand_side
    }

    /// The functional gradient `JᵗWr`, the negated right-hand side.
    pub fn gradient(&self) -> DVector<f64> {
        -&self.right_hand_side
    }
}
