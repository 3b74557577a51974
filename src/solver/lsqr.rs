//! LSQR (Paige & Saunders 1982), matrix-free.
//!
//! Minimizes `‖A·x − b‖² + damp²·‖x‖²` using the Golub–Kahan
//! bidiagonalization, touching `A` only through the two products of
//! [`LeastSquaresOperator`]. The stopping rules and the running estimates of
//! `‖A‖`, `cond(A)`, `‖r‖` and `‖Aᵀr‖` follow the reference implementation.
//!
//! All working vectors are allocated before the iteration loop.

use nalgebra::DVector;

use super::{sym_ortho, LeastSquaresOperator, SolverStats, StopReason};

/// Solve the damped least-squares problem with LSQR.
///
/// Arguments
/// ---------
/// * `op`: the matrix, exposed as `y += A·x` / `x += Aᵀ·y` products.
/// * `b`: right-hand side, length `op.nrows()`.
/// * `damp`: Tikhonov damping `λ` (0 disables).
/// * `atol`, `btol`: relative tolerances on `‖Aᵀr‖` and `‖r‖`.
/// * `conlim`: stop when the condition estimate exceeds this (0 disables).
/// * `max_iter`: iteration cap; 0 auto-picks `4·n`.
///
/// Return
/// ------
/// * The solution vector and the run statistics.
pub fn lsqr(
    op: &dyn LeastSquaresOperator,
    b: &DVector<f64>,
    damp: f64,
    atol: f64,
    btol: f64,
    conlim: f64,
    max_iter: usize,
) -> (DVector<f64>, SolverStats) {
    let n = op.ncols();
    debug_assert_eq!(b.len(), op.nrows());

    let iteration_cap = if max_iter == 0 { 4 * n } else { max_iter };
    let ctol = if conlim > 0.0 { 1.0 / conlim } else { 0.0 };
    let dampsq = damp * damp;

    let mut x = DVector::zeros(n);
    let mut stats = SolverStats {
        stop: StopReason::ZeroRhs,
        iterations: 0,
        iteration_cap,
        a_norm: 0.0,
        a_cond: 0.0,
        r_norm: 0.0,
        ar_norm: 0.0,
        x_norm: 0.0,
    };

    let mut u = b.clone();
    let bnorm = u.norm();
    if bnorm == 0.0 {
        return (x, stats);
    }
    let mut beta = bnorm;
    u /= beta;

    let mut v = DVector::zeros(n);
    op.apply_transpose_add(&u, &mut v);
    let mut alpha = v.norm();
    if alpha > 0.0 {
        v /= alpha;
    }
    let mut w = v.clone();

    let mut rhobar = alpha;
    let mut phibar = beta;
    let mut rnorm = beta;
    let mut arnorm = alpha * beta;
    if arnorm == 0.0 {
        // b is orthogonal to the range of A: x = 0 is the solution
        stats.stop = StopReason::GradientTolerance;
        stats.r_norm = rnorm;
        return (x, stats);
    }

    let (mut anorm, mut acond, mut ddnorm) = (0.0f64, 0.0f64, 0.0f64);
    let (mut res2, mut xnorm, mut xxnorm, mut z) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    let (mut cs2, mut sn2) = (-1.0f64, 0.0f64);

    let mut itn = 0usize;
    let stop = loop {
        itn += 1;

        // next step of the bidiagonalization
        u *= -alpha;
        op.apply_add(&v, &mut u);
        beta = u.norm();
        if beta > 0.0 {
            u /= beta;
            anorm = (anorm * anorm + alpha * alpha + beta * beta + dampsq).sqrt();
            v *= -beta;
            op.apply_transpose_add(&u, &mut v);
            alpha = v.norm();
            if alpha > 0.0 {
                v /= alpha;
            }
        }

        // eliminate the damping parameter
        let (cs1, sn1, rhobar1) = sym_ortho(rhobar, damp);
        let psi = sn1 * phibar;
        phibar = cs1 * phibar;

        // plane rotation removing the subdiagonal element beta
        let (cs, sn, rho) = sym_ortho(rhobar1, beta);
        let theta = sn * alpha;
        rhobar = -cs * alpha;
        let phi = cs * phibar;
        phibar = sn * phibar;
        let tau = sn * phi;

        ddnorm += w.norm_squared() / (rho * rho);
        x.axpy(phi / rho, &w, 1.0);
        w.axpy(1.0, &v, -theta / rho);

        // estimate ‖x‖
        let delta = sn2 * rho;
        let gambar = -cs2 * rho;
        let rhs = phi - delta * z;
        let zbar = rhs / gambar;
        xnorm = (xxnorm + zbar * zbar).sqrt();
        let gamma = (gambar * gambar + theta * theta).sqrt();
        cs2 = gambar / gamma;
        sn2 = theta / gamma;
        z = rhs / gamma;
        xxnorm += z * z;

        acond = anorm * ddnorm.sqrt();
        res2 += psi * psi;
        rnorm = (phibar * phibar + res2).sqrt();
        arnorm = alpha * tau.abs();

        let test1 = rnorm / bnorm;
        let test2 = if anorm * rnorm > 0.0 {
            arnorm / (anorm * rnorm)
        } else {
            f64::INFINITY
        };
        let test3 = 1.0 / acond;
        let t1 = test1 / (1.0 + anorm * xnorm / bnorm);
        let rtol = btol + atol * anorm * xnorm / bnorm;

        if itn >= iteration_cap {
            break StopReason::IterationCap;
        }
        if 1.0 + test3 <= 1.0 {
            break StopReason::ConditionLimit;
        }
        if 1.0 + test2 <= 1.0 {
            break StopReason::GradientTolerance;
        }
        if 1.0 + t1 <= 1.0 {
            break StopReason::ResidualTolerance;
        }
        if test3 <= ctol {
            break StopReason::ConditionLimit;
        }
        if test2 <= atol {
            break StopReason::GradientTolerance;
        }
        if test1 <= rtol {
            break StopReason::ResidualTolerance;
        }
    };

    stats.stop = stop;
    stats.iterations = itn;
    stats.a_norm = anorm;
    stats.a_cond = acond;
    stats.r_norm = rnorm;
    stats.ar_norm = arnorm;
    stats.x_norm = xnorm;
    (x, stats)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use nalgebra::DMatrix;

    use super::*;
    use crate::solver::tests::DenseOp;

    #[test]
    fn recovers_the_solution_of_a_square_system() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0]);
        let x_true = DVector::from_column_slice(&[1.0, -2.0, 0.5]);
        let b = &a * &x_true;

        let (x, stats) = lsqr(&DenseOp(a), &b, 0.0, 1e-12, 1e-12, 1e8, 100);
        assert!(matches!(
            stats.stop,
            StopReason::ResidualTolerance | StopReason::GradientTolerance
        ));
        for i in 0..3 {
            assert_abs_diff_eq!(x[i], x_true[i], epsilon = 1e-8);
        }
    }

    #[test]
    fn overdetermined_system_matches_normal_equations() {
        let a = DMatrix::from_row_slice(
            4,
            2,
            &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0],
        );
        let b = DVector::from_column_slice(&[1.1, 1.9, 3.2, 3.8]);

        let (x, _) = lsqr(&DenseOp(a.clone()), &b, 0.0, 1e-14, 1e-14, 1e8, 200);
        let ata = a.transpose() * &a;
        let atb = a.transpose() * &b;
        let expected = ata.lu().solve(&atb).unwrap();
        assert_abs_diff_eq!(x[0], expected[0], epsilon = 1e-10);
        assert_abs_diff_eq!(x[1], expected[1], epsilon = 1e-10);
    }

    #[test]
    fn damping_shrinks_the_solution() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let b = DVector::from_column_slice(&[1.0, 1.0]);
        let (x0, _) = lsqr(&DenseOp(a.clone()), &b, 0.0, 1e-12, 1e-12, 1e8, 50);
        let (xd, _) = lsqr(&DenseOp(a), &b, 1.0, 1e-12, 1e-12, 1e8, 50);
        assert!(xd.norm() < x0.norm());
        // λ = 1 on the identity: x = b / (1 + λ²)
        assert_abs_diff_eq!(xd[0], 0.5, epsilon = 1e-8);
    }

    #[test]
    fn zero_rhs_stops_immediately() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let b = DVector::zeros(2);
        let (x, stats) = lsqr(&DenseOp(a), &b, 0.0, 1e-12, 1e-12, 1e8, 50);
        assert!(matches!(stats.stop, StopReason::ZeroRhs));
        assert_eq!(x.norm(), 0.0);
    }

    #[test]
    fn zero_max_iter_auto_picks_four_n() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let b = DVector::from_column_slice(&[1.0, 2.0, 3.0]);
        let (_, stats) = lsqr(&DenseOp(a), &b, 0.0, 1e-12, 1e-12, 1e8, 0);
        assert_eq!(stats.iteration_cap, 8);
    }
}
