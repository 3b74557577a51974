//! LSMR (Fong & Saunders 2011), matrix-free.
//!
//! Like LSQR, LSMR runs the Golub–Kahan process, but it additionally carries
//! the QR factorization of the lower bidiagonal so that `‖Aᵀr‖` decreases
//! monotonically, which makes it the safer choice on the ill-conditioned
//! systems double-difference clusters produce. Numerics follow the reference
//! implementation, including the recurrences for `‖r‖`, `‖A‖` and `cond(A)`.
//!
//! All working vectors are allocated before the iteration loop.

use nalgebra::DVector;

use super::{sym_ortho, LeastSquaresOperator, SolverStats, StopReason};

/// Solve the damped least-squares problem with LSMR.
///
/// Same contract as [`super::lsqr::lsqr`]: `max_iter == 0` auto-picks `4·n`,
/// `conlim == 0` disables the condition test.
pub fn lsmr(
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
    let normb = u.norm();
    if normb == 0.0 {
        return (x, stats);
    }
    let mut beta = normb;
    u /= beta;

    let mut v = DVector::zeros(n);
    op.apply_transpose_add(&u, &mut v);
    let mut alpha = v.norm();
    if alpha > 0.0 {
        v /= alpha;
    }

    if alpha * beta == 0.0 {
        stats.stop = StopReason::GradientTolerance;
        stats.r_norm = beta;
        return (x, stats);
    }

    // rotations and search directions
    let mut zetabar = alpha * beta;
    let mut alphabar = alpha;
    let mut rho = 1.0f64;
    let mut rhobar = 1.0f64;
    let mut cbar = 1.0f64;
    let mut sbar = 0.0f64;

    let mut h = v.clone();
    let mut hbar = DVector::zeros(n);

    // quantities for the ‖r‖ estimate
    let mut betadd = beta;
    let mut betad = 0.0f64;
    let mut rhodold = 1.0f64;
    let mut tautildeold = 0.0f64;
    let mut thetatilde = 0.0f64;
    let mut zeta = 0.0f64;
    let mut d = 0.0f64;

    // ‖A‖ and cond(A) estimates
    let mut norm_a2 = alpha * alpha;
    let mut maxrbar = 0.0f64;
    let mut minrbar = 1e100f64;

    let mut normr = beta;
    let mut normar = alpha * beta;
    let (mut norm_a, mut cond_a, mut normx) = (norm_a2.sqrt(), 1.0f64, 0.0f64);

    let mut itn = 0usize;
    let stop = loop {
        itn += 1;

        u *= -alpha;
        op.apply_add(&v, &mut u);
        beta = u.norm();
        if beta > 0.0 {
            u /= beta;
            v *= -beta;
            op.apply_transpose_add(&u, &mut v);
            alpha = v.norm();
            if alpha > 0.0 {
                v /= alpha;
            }
        }

        // construct rotation P̂ eliminating the damping
        let (chat, shat, alphahat) = sym_ortho(alphabar, damp);

        // rotation P_k
        let rhoold = rho;
        let (c, s, rho_new) = sym_ortho(alphahat, beta);
        rho = rho_new;
        let thetanew = s * alpha;
        alphabar = c * alpha;

        // rotation P̄_k
        let rhobarold = rhobar;
        let zetaold = zeta;
        let thetabar = sbar * rho;
        let rhotemp = cbar * rho;
        let (cbar_new, sbar_new, rhobar_new) = sym_ortho(cbar * rho, thetanew);
        cbar = cbar_new;
        sbar = sbar_new;
        rhobar = rhobar_new;
        zeta = cbar * zetabar;
        zetabar = -sbar * zetabar;

        // update h̄, x, h
        hbar *= -thetabar * rho / (rhoold * rhobarold);
        hbar += &h;
        x.axpy(zeta / (rho * rhobar), &hbar, 1.0);
        h *= -thetanew / rho;
        h += &v;

        // estimate ‖r‖
        let betaacute = chat * betadd;
        let betacheck = -shat * betadd;
        let betahat = c * betaacute;
        betadd = -s * betaacute;

        let thetatildeold = thetatilde;
        let (ctildeold, stildeold, rhotildeold) = sym_ortho(rhodold, thetabar);
        thetatilde = stildeold * rhobar;
        rhodold = ctildeold * rhobar;
        betad = -stildeold * betad + ctildeold * betahat;

        tautildeold = (zetaold - thetatildeold * tautildeold) / rhotildeold;
        let taud = (zeta - thetatilde * tautildeold) / rhodold;
        d += betacheck * betacheck;
        normr = (d + (betad - taud).powi(2) + betadd * betadd).sqrt();

        // estimate ‖A‖ and cond(A)
        norm_a2 += beta * beta;
        norm_a = norm_a2.sqrt();
        norm_a2 += alpha * alpha;
        maxrbar = maxrbar.max(rhobarold);
        if itn > 1 {
            minrbar = minrbar.min(rhobarold);
        }
        cond_a = maxrbar.max(rhotemp) / minrbar.min(rhotemp);

        normar = zetabar.abs();
        normx = x.norm();

        let test1 = normr / normb;
        let test2 = if norm_a * normr > 0.0 {
            normar / (norm_a * normr)
        } else {
            f64::INFINITY
        };
        let test3 = 1.0 / cond_a;
        let t1 = test1 / (1.0 + norm_a * normx / normb);
        let rtol = btol + atol * norm_a * normx / normb;

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
    stats.a_norm = norm_a;
    stats.a_cond = cond_a;
    stats.r_norm = normr;
    stats.ar_norm = normar;
    stats.x_norm = normx;
    (x, stats)
}
