//! Dense matrix helpers with checked dimensions.
//!
//! Public API:
//!     checked_add / checked_sub / checked_mul / transpose / checked_inverse
//!     determinant / lu_solve / chol_solve_spd / robust_spd_solve
//!     symmetrize / joseph_update / clamp_diagonal
//!     dcm_321 / skew / norm / dot
//!
//! Every fallible routine returns a [`MatrixError`] rather than panicking, so a filter can
//! abandon a single step and keep flying on its previous state.
//!
//! Strategy for SPD solves:
//! 1) Symmetrize A ← 0.5 (A + Aᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp)
//! 4) LU with a pivot threshold, otherwise report the matrix as singular

use nalgebra::linalg::{Cholesky, LU};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use crate::error::MatrixError;

/// Relative pivot magnitude below which a matrix is treated as singular.
const SINGULAR_TOLERANCE: f64 = 1e-12;

fn same_shape(op: &'static str, a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<(), MatrixError> {
    if a.shape() != b.shape() {
        return Err(MatrixError::DimensionMismatch {
            op,
            left: a.shape(),
            right: b.shape(),
        });
    }
    Ok(())
}
fn require_square(op: &'static str, a: &DMatrix<f64>) -> Result<(), MatrixError> {
    if !a.is_square() {
        return Err(MatrixError::NotSquare {
            op,
            shape: a.shape(),
        });
    }
    Ok(())
}
/// A + B
pub fn checked_add(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>, MatrixError> {
    same_shape("add", a, b)?;
    Ok(a + b)
}
/// A - B
pub fn checked_sub(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>, MatrixError> {
    same_shape("sub", a, b)?;
    Ok(a - b)
}
/// A * B
pub fn checked_mul(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>, MatrixError> {
    if a.ncols() != b.nrows() {
        return Err(MatrixError::DimensionMismatch {
            op: "mul",
            left: a.shape(),
            right: b.shape(),
        });
    }
    Ok(a * b)
}
/// Aᵀ * B, without forming the transpose explicitly
pub fn checked_tr_mul(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>, MatrixError> {
    if a.nrows() != b.nrows() {
        return Err(MatrixError::DimensionMismatch {
            op: "tr_mul",
            left: a.shape(),
            right: b.shape(),
        });
    }
    Ok(a.tr_mul(b))
}
/// Aᵀ
#[inline]
pub fn transpose(a: &DMatrix<f64>) -> DMatrix<f64> {
    a.transpose()
}
/// Largest absolute entry, used to scale the singularity threshold.
fn max_abs(a: &DMatrix<f64>) -> f64 {
    a.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
}
/// LU factorization, rejecting matrices whose smallest pivot is negligible.
fn checked_lu(op: &'static str, a: &DMatrix<f64>) -> Result<LU<f64, nalgebra::Dyn, nalgebra::Dyn>, MatrixError> {
    require_square(op, a)?;
    if a.iter().any(|v| !v.is_finite()) {
        return Err(MatrixError::NonFinite { op });
    }
    let scale = max_abs(a);
    let lu = LU::new(a.clone());
    let u = lu.u();
    let smallest_pivot = u.diagonal().iter().fold(f64::INFINITY, |m, v| m.min(v.abs()));
    if scale == 0.0 || smallest_pivot <= SINGULAR_TOLERANCE * scale {
        return Err(MatrixError::Singular { op });
    }
    Ok(lu)
}
/// A⁻¹, reporting singular matrices instead of returning garbage
pub fn checked_inverse(a: &DMatrix<f64>) -> Result<DMatrix<f64>, MatrixError> {
    checked_lu("inverse", a)?
        .try_inverse()
        .ok_or(MatrixError::Singular { op: "inverse" })
}
/// det(A) via LU decomposition
pub fn determinant(a: &DMatrix<f64>) -> Result<f64, MatrixError> {
    require_square("determinant", a)?;
    Ok(LU::new(a.clone()).determinant())
}
/// Solve A X = B with partial-pivot LU
pub fn lu_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>, MatrixError> {
    if a.nrows() != b.nrows() {
        return Err(MatrixError::DimensionMismatch {
            op: "lu_solve",
            left: a.shape(),
            right: b.shape(),
        });
    }
    checked_lu("lu_solve", a)?
        .solve(b)
        .ok_or(MatrixError::Singular { op: "lu_solve" })
}
/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Removes the round-off asymmetry that accumulates in covariance propagation.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    pub initial_jitter: f64, // e.g., 1e-12
    pub max_jitter: f64,     // e.g., 1e-6
    pub max_tries: usize,    // e.g., 6
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            initial_jitter: 1e-12,
            max_jitter: 1e-6,
            max_tries: 6,
        }
    }
}
/// Solve A X = B for SPD-ish A via Cholesky, with jitter retries.
/// Returns None if all attempts fail.
pub fn chol_solve_spd(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    opt: SolveOptions,
) -> Option<DMatrix<f64>> {
    if !a.is_square() || a.nrows() != b.nrows() {
        return None;
    }
    let a_sym = symmetrize(a);
    if let Some(ch) = Cholesky::new(a_sym.clone()) {
        return Some(ch.solve(b));
    }
    let n = a_sym.nrows();
    let mut jitter = opt.initial_jitter;
    for _ in 0..opt.max_tries {
        let mut a_j = a_sym.clone();
        for i in 0..n {
            a_j[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(a_j) {
            return Some(ch.solve(b));
        }
        jitter *= 10.0;
        if jitter > opt.max_jitter {
            break;
        }
    }
    None
}
/// Robust SPD solve:
/// - Cholesky + jitter (preferred)
/// - Last resort: pivoted LU with singularity check
pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>, MatrixError> {
    require_square("spd_solve", a)?;
    if a.nrows() != b.nrows() {
        return Err(MatrixError::DimensionMismatch {
            op: "spd_solve",
            left: a.shape(),
            right: b.shape(),
        });
    }
    if let Some(x) = chol_solve_spd(a, b, SolveOptions::default()) {
        return Ok(x);
    }
    lu_solve(&symmetrize(a), b)
}
/// Joseph-form covariance update: (I − K H) P (I − K H)ᵀ + K R Kᵀ, symmetrized
///
/// Unlike the short form (I − K H) P, the result stays positive semi-definite for any gain,
/// which is what keeps the covariance diagonal non-negative under round-off.
pub fn joseph_update(
    p: &DMatrix<f64>,
    k: &DMatrix<f64>,
    h: &DMatrix<f64>,
    r: &DMatrix<f64>,
) -> Result<DMatrix<f64>, MatrixError> {
    require_square("joseph", p)?;
    let kh = checked_mul(k, h)?;
    let i_kh = checked_sub(&DMatrix::identity(p.nrows(), p.ncols()), &kh)?;
    let left = checked_mul(&checked_mul(&i_kh, p)?, &i_kh.transpose())?;
    let krk = checked_mul(&checked_mul(k, r)?, &k.transpose())?;
    Ok(symmetrize(&checked_add(&left, &krk)?))
}
/// Clamp every diagonal entry to at least `floor`
pub fn clamp_diagonal(p: &mut DMatrix<f64>, floor: f64) {
    let n = p.nrows().min(p.ncols());
    for i in 0..n {
        if p[(i, i)] < floor {
            p[(i, i)] = floor;
        }
    }
}
/// Euclidean norm of a vector
#[inline]
pub fn norm(v: &DVector<f64>) -> f64 {
    v.norm()
}
/// Dot product of two equally sized vectors
pub fn dot(a: &DVector<f64>, b: &DVector<f64>) -> Result<f64, MatrixError> {
    if a.len() != b.len() {
        return Err(MatrixError::DimensionMismatch {
            op: "dot",
            left: a.shape(),
            right: b.shape(),
        });
    }
    Ok(a.dot(b))
}
/// 3-2-1 (yaw, pitch, roll) direction cosine matrix from the navigation frame to the body frame
///
/// $$
/// C^b_n = R_x(\phi) R_y(\theta) R_z(\psi)
/// $$
///
/// The transpose rotates body vectors into NED.
pub fn dcm_321(roll: f64, pitch: f64, yaw: f64) -> Matrix3<f64> {
    let (sp, cp) = roll.sin_cos();
    let (st, ct) = pitch.sin_cos();
    let (ss, cs) = yaw.sin_cos();
    Matrix3::new(
        ct * cs,
        ct * ss,
        -st,
        sp * st * cs - cp * ss,
        sp * st * ss + cp * cs,
        sp * ct,
        cp * st * cs + sp * ss,
        cp * st * ss - sp * cs,
        cp * ct,
    )
}
/// Convert a three-element vector to a skew-symmetric (cross product) matrix
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

/* =============================== Tests ==================================== */

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Rotation3;

    fn approx_eq(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) -> bool {
        if a.shape() != b.shape() {
            return false;
        }
        let mut max_abs = 0.0f64;
        for i in 0..a.nrows() {
            for j in 0..a.ncols() {
                max_abs = max_abs.max((a[(i, j)] - b[(i, j)]).abs());
            }
        }
        max_abs <= tol
    }

    #[test]
    fn t_clamp_diagonal_floors_only_the_diagonal() {
        let mut p = DMatrix::from_row_slice(3, 3, &[-1e-9, -2.0, 0.0, -2.0, 4.0, 0.0, 0.0, 0.0, 1e-15]);
        clamp_diagonal(&mut p, 1e-12);
        assert_eq!(p[(0, 0)], 1e-12);
        assert_eq!(p[(1, 1)], 4.0);
        assert_eq!(p[(2, 2)], 1e-12);
        assert_eq!(p[(0, 1)], -2.0);
        assert_eq!(p[(1, 0)], -2.0);

        let mut wide = DMatrix::from_element(2, 3, -1.0);
        clamp_diagonal(&mut wide, 0.0);
        assert_eq!(wide[(1, 1)], 0.0);
        assert_eq!(wide[(1, 2)], -1.0);
    }

    #[test]
    fn t_add_sub_mul_dimensions() {
        let a = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        assert!(matches!(
            checked_add(&a, &b),
            Err(MatrixError::DimensionMismatch { op: "add", .. })
        ));
        assert!(checked_sub(&a, &a).is_ok_and(|z| z.iter().all(|v| *v == 0.0)));
        let ab = checked_mul(&a, &b).unwrap();
        let expected = DMatrix::from_row_slice(2, 2, &[4.0, 5.0, 10.0, 11.0]);
        assert!(approx_eq(&ab, &expected, 1e-15));
        assert!(checked_mul(&a, &a).is_err());
        let atb = checked_tr_mul(&b, &b).unwrap();
        assert!(approx_eq(&atb, &(b.transpose() * &b), 1e-15));
    }

    #[test]
    fn t_inverse_and_singular() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0]);
        let inv = checked_inverse(&a).unwrap();
        assert!(approx_eq(&(&a * inv), &DMatrix::identity(3, 3), 1e-12));

        let s = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        assert!(matches!(checked_inverse(&s), Err(MatrixError::Singular { .. })));
        assert!(matches!(
            checked_inverse(&DMatrix::zeros(2, 2)),
            Err(MatrixError::Singular { .. })
        ));
        assert!(matches!(
            checked_inverse(&DMatrix::zeros(2, 3)),
            Err(MatrixError::NotSquare { .. })
        ));
    }

    #[test]
    fn t_determinant_and_lu_solve() {
        let a = DMatrix::from_row_slice(2, 2, &[3.0, 1.0, 2.0, 4.0]);
        assert!((determinant(&a).unwrap() - 10.0).abs() < 1e-12);
        let b = DMatrix::from_row_slice(2, 1, &[5.0, 10.0]);
        let x = lu_solve(&a, &b).unwrap();
        assert!(approx_eq(&(&a * x), &b, 1e-12));
    }

    #[test]
    fn t_symmetrize() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let s = symmetrize(&m);
        let s_expected = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 3.0]);
        assert!(approx_eq(&s, &s_expected, 1e-15));
    }

    #[test]
    fn t_robust_spd_solve_matches_inverse() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0]);
        let b = DMatrix::identity(3, 3);
        let x = robust_spd_solve(&a, &b).unwrap();
        assert!(approx_eq(&x, &checked_inverse(&a).unwrap(), 1e-12));
        // Indefinite and singular: jitter cannot rescue it and LU reports the null pivot
        let bad = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, -1.0, 0.0]));
        assert!(matches!(
            robust_spd_solve(&bad, &b),
            Err(MatrixError::Singular { .. })
        ));
    }

    #[test]
    fn t_joseph_keeps_diagonal_non_negative() {
        let p = DMatrix::from_diagonal(&DVector::from_vec(vec![1e-8, 4.0, 9.0]));
        let h = DMatrix::from_row_slice(1, 3, &[1.0, 1.0, 0.0]);
        let r = DMatrix::from_element(1, 1, 1e-10);
        let s = &h * &p * h.transpose() + &r;
        let k = &p * h.transpose() * checked_inverse(&s).unwrap();
        let p_new = joseph_update(&p, &k, &h, &r).unwrap();
        for i in 0..3 {
            assert!(p_new[(i, i)] >= 0.0);
        }
        assert!(approx_eq(&p_new, &p_new.transpose(), 0.0));
    }

    #[test]
    fn t_dcm_matches_rotation() {
        let (roll, pitch, yaw) = (0.1, -0.2, 2.5);
        let c_bn = dcm_321(roll, pitch, yaw);
        let r_nb = Rotation3::from_euler_angles(roll, pitch, yaw);
        let diff = c_bn - r_nb.matrix().transpose();
        assert!(diff.amax() < 1e-12);
    }

    #[test]
    fn t_skew_is_cross_product() {
        let a = Vector3::new(1.0, -2.0, 0.5);
        let b = Vector3::new(0.3, 0.4, -1.0);
        assert!((skew(&a) * b - a.cross(&b)).amax() < 1e-15);
    }

    #[test]
    fn t_dot_dimension_mismatch() {
        let a = DVector::from_vec(vec![1.0, 2.0]);
        let b = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        assert!(dot(&a, &b).is_err());
        assert!((norm(&a) - 5.0_f64.sqrt()).abs() < 1e-15);
    }
}
