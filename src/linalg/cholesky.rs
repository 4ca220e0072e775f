//! Sparse Cholesky solver for the accumulated normal equations.
//!
//! The accumulator hands over a dense symmetric normal matrix of modest
//! dimension (one row per parameter, not per observation). It is loaded into
//! a faer sparse matrix over its full pattern, factorized with a supernodal
//! LLᵗ, and solved against the right-hand side or against the identity when
//! the inverse is wanted. Because the pattern is fixed for a given parameter
//! count, the symbolic analysis is computed once and reused across
//! iterations; only the numeric factorization is repeated.

use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::{SparseColMat, Triplet},
};
use nalgebra::{DMatrix, DVector};

use crate::linalg::{LinAlgError, LinAlgResult};

/// Cholesky-based solver for `N·δ = rhs` with `N` symmetric positive
/// definite, caching the symbolic factorization between calls.
#[derive(Debug, Default)]
pub struct NormalEquationsSolver {
    symbolic: Option<(usize, SymbolicLlt<usize>)>,
}

impl NormalEquationsSolver {
    pub fn new() -> Self {
        NormalEquationsSolver { symbolic: None }
    }

    fn factorize(&mut self, matrix: &DMatrix<f64>) -> LinAlgResult<Llt<usize, f64>> {
        let n = matrix.nrows();
        if matrix.ncols() != n {
            return Err(LinAlgError::DimensionMismatch {
                context: "normal matrix".to_string(),
                expected: n,
                actual: matrix.ncols(),
            }
            .log());
        }

        // Full pattern, so one symbolic analysis serves every iteration
        let mut triplets = Vec::with_capacity(n * n);
        for j in 0..n {
            for i in 0..n {
                triplets.push(Triplet::new(i, j, matrix[(i, j)]));
            }
        }
        let sparse = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets)
            .map_err(|e| {
                LinAlgError::SparseMatrixCreation(
                    "Failed to create sparse normal matrix from triplets".to_string(),
                )
                .log_with_source(e)
            })?;

        let symbolic = match &self.symbolic {
            Some((dim, cached)) if *dim == n => cached.clone(),
            _ => {
                let computed =
                    SymbolicLlt::try_new(sparse.symbolic(), Side::Lower).map_err(|e| {
                        LinAlgError::FactorizationFailed(
                            "Symbolic Cholesky decomposition failed".to_string(),
                        )
                        .log_with_source(e)
                    })?;
                self.symbolic = Some((n, computed.clone()));
                computed
            }
        };

        Llt::try_new_with_symbolic(symbolic, sparse.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))
    }

    /// Solve `matrix · x = rhs` for a symmetric positive definite matrix.
    pub fn solve(
        &mut self,
        matrix: &DMatrix<f64>,
        rhs: &DVector<f64>,
    ) -> LinAlgResult<DVector<f64>> {
        if rhs.len() != matrix.nrows() {
            return Err(LinAlgError::DimensionMismatch {
                context: "right-hand side".to_string(),
                expected: matrix.nrows(),
                actual: rhs.len(),
            }
            .log());
        }

        let cholesky = self.factorize(matrix)?;
        let rhs_mat = Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let solution = cholesky.solve(&rhs_mat);
        Ok(DVector::from_fn(rhs.len(), |i, _| solution[(i, 0)]))
    }

    /// Invert a symmetric positive definite matrix by solving against the
    /// identity.
    pub fn inverse(&mut self, matrix: &DMatrix<f64>) -> LinAlgResult<DMatrix<f64>> {
        let n = matrix.nrows();
        let cholesky = self.factorize(matrix)?;
        let identity: Mat<f64> = Mat::identity(n, n);
        let inverse = cholesky.solve(&identity);
        Ok(DMatrix::from_fn(n, n, |i, j| inverse[(i, j)]))
    }
}
