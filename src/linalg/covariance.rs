//! First-order error propagation through matrix inversion.
//!
//! Given a square matrix `M` and the covariance of its elements, the
//! covariance of the elements of `M⁻¹` follows from the analytic derivative
//! `∂(M⁻¹)/∂M_ij = -M⁻¹·E_ij·M⁻¹` (Lefebvre, Keeler, Sobeski and White,
//! 2000):
//!
//! ```text
//! cov(M⁻¹_αβ, M⁻¹_ab) = Σ_ijkl M⁻¹_αi · M⁻¹_jβ · M⁻¹_ak · M⁻¹_lb · cov(M_ij, M_kl)
//! ```
//!
//! Matrix elements are indexed row-major into the covariance matrices: the
//! element `(i, j)` of an `n×n` matrix maps to row/column `i·n + j` of the
//! `n²×n²` covariance. Only the upper triangle is computed; the lower is
//! mirrored.

use nalgebra::DMatrix;

use crate::linalg::{LinAlgError, LinAlgResult};

/// Invert `matrix` and propagate the covariance of its elements through the
/// inversion. Returns `(inverse, covariance_of_inverse)`.
pub fn invert_with_covariance(
    matrix: &DMatrix<f64>,
    covariance: &DMatrix<f64>,
) -> LinAlgResult<(DMatrix<f64>, DMatrix<f64>)> {
    let n = matrix.nrows();
    if matrix.ncols() != n {
        return Err(LinAlgError::DimensionMismatch {
            context: "matrix to invert".to_string(),
            expected: n,
            actual: matrix.ncols(),
        }
        .log());
    }
    if covariance.nrows() != n * n || covariance.ncols() != n * n {
        return Err(LinAlgError::DimensionMismatch {
            context: "element covariance".to_string(),
            expected: n * n,
            actual: covariance.nrows().max(covariance.ncols()),
        }
        .log());
    }

    let inverse = matrix
        .clone()
        .try_inverse()
        .ok_or_else(|| LinAlgError::SingularMatrix.log())?;

    let mut propagated = DMatrix::zeros(n * n, n * n);
    for alpha in 0..n {
        for beta in 0..n {
            let u = alpha * n + beta;
            for a in 0..n {
                for b in 0..n {
                    let v = a * n + b;
                    if v < u {
                        continue;
                    }
                    let mut elt = 0.0;
                    for i in 0..n {
                        for j in 0..n {
                            let x = i * n + j;
                            let left = inverse[(alpha, i)] * inverse[(j, beta)];
                            for k in 0..n {
                                for l in 0..n {
                                    let y = k * n + l;
                                    elt += left
                                        * inverse[(a, k)]
                                        * inverse[(l, b)]
                                        * covariance[(x, y)];
                                }
                            }
                        }
                    }
                    propagated[(u, v)] = elt;
                }
            }
        }
    }

    // Mirror the upper triangle into the lower
    for u in 0..n * n {
        for v in 0..u {
            propagated[(u, v)] = propagated[(v, u)];
        }
    }

    Ok((inverse, propagated))
}

/// Covariance of the elements of `matrix⁻¹`, discarding the inverse itself.
pub fn propagate_inverse_covariance(
    matrix: &DMatrix<f64>,
    covariance: &DMatrix<f64>,
) -> LinAlgResult<DMatrix<f64>> {
    invert_with_covariance(matrix, covariance).map(|(_, propagated)| propagated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dmatrix;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_scalar_case_has_closed_form() -> TestResult {
        // For M = [m], cov(1/m) = cov(m) / m⁴
        let matrix = DMatrix::from_element(1, 1, 2.0);
        let covariance = DMatrix::from_element(1, 1, 0.09);

        let (inverse, propagated) = invert_with_covariance(&matrix, &covariance)?;
        assert!((inverse[(0, 0)] - 0.5).abs() < 1e-14);
        assert!((propagated[(0, 0)] - 0.09 / 16.0).abs() < 1e-14);
        Ok(())
    }

    #[test]
    fn test_agrees_with_finite_difference_propagation() -> TestResult {
        let matrix = dmatrix![2.0, 0.3; 0.5, 1.5];
        let n = 2;

        // Positive semidefinite element covariance, B·Bᵗ
        let b = dmatrix![
            0.30, 0.01, 0.05, 0.00;
            0.01, 0.25, 0.02, 0.03;
            0.05, 0.02, 0.20, 0.01;
            0.00, 0.03, 0.01, 0.35
        ];
        let covariance = &b * b.transpose();

        let (inverse, analytic) = invert_with_covariance(&matrix, &covariance)?;

        // Numerical Jacobian of vec(M⁻¹) with respect to vec(M)
        let h = 1e-6;
        let mut jacobian = DMatrix::zeros(n * n, n * n);
        for i in 0..n {
            for j in 0..n {
                let x = i * n + j;
                let mut plus = matrix.clone();
                plus[(i, j)] += h;
                let mut minus = matrix.clone();
                minus[(i, j)] -= h;
                let inv_plus = plus.try_inverse().ok_or("singular")?;
                let inv_minus = minus.try_inverse().ok_or("singular")?;
                for alpha in 0..n {
                    for beta in 0..n {
                        let u = alpha * n + beta;
                        jacobian[(u, x)] =
                            (inv_plus[(alpha, beta)] - inv_minus[(alpha, beta)]) / (2.0 * h);
                    }
                }
            }
        }
        let brute_force = &jacobian * &covariance * jacobian.transpose();

        assert!((&analytic - &brute_force).norm() < 1e-6);

        // Sanity on the returned inverse itself
        assert!((&matrix * inverse - DMatrix::identity(2, 2)).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_result_is_symmetric() -> TestResult {
        let matrix = dmatrix![3.0, 1.0; 1.0, 2.0];
        let covariance = DMatrix::identity(4, 4) * 0.01;

        let propagated = propagate_inverse_covariance(&matrix, &covariance)?;
        assert!((&propagated - propagated.transpose()).norm() < 1e-14);
        Ok(())
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let matrix = dmatrix![1.0, 2.0; 2.0, 4.0];
        let covariance = DMatrix::identity(4, 4);
        assert!(matches!(
            invert_with_covariance(&matrix, &covariance),
            Err(LinAlgError::SingularMatrix)
        ));
    }

    #[test]
    fn test_shape_mismatches_rejected() {
        let square = dmatrix![1.0, 0.0; 0.0, 1.0];
        let result = invert_with_covariance(&square, &DMatrix::identity(3, 3));
        assert!(matches!(
            result,
            Err(LinAlgError::DimensionMismatch { expected: 4, actual: 3, .. })
        ));

        let rectangular = DMatrix::from_element(2, 3, 1.0);
        assert!(invert_with_covariance(&rectangular, &DMatrix::identity(4, 4)).is_err());
    }
}
