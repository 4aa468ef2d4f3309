//! Gaussian random-intercept solver.
//!
//! For fixed variance ratios lambda_k the marginal covariance is
//! V = sigma^2 (W^-1 + sum_k lambda_k Z_k Z_k^T); beta and sigma^2 have
//! closed GLS forms, leaving a low-dimensional profiled criterion that is
//! minimized by deterministic coordinate golden-section search over
//! log(lambda). Identical inputs always produce identical fits.

use nalgebra::{DMatrix, DVector};

use super::FitOptions;
use crate::error::{Error, Result};

pub(crate) struct LmmFit {
    pub beta: DVector<f64>,
    /// sigma^2-scaled covariance of beta.
    pub cov_beta: DMatrix<f64>,
    pub sigma2: f64,
    pub lambdas: Vec<f64>,
    pub blups: Vec<DVector<f64>>,
    /// Conditional linear predictor X beta + sum_k Z_k u_k.
    pub eta: DVector<f64>,
    pub iterations: usize,
    pub converged: bool,
}

struct Eval {
    criterion: f64,
    beta: DVector<f64>,
    cov_beta: DMatrix<f64>,
    sigma2: f64,
    blups: Vec<DVector<f64>>,
    eta: DVector<f64>,
}

const LOG_LAMBDA_RANGE: (f64, f64) = (-12.0, 10.0);
const GOLDEN_ITERS: usize = 40;

fn ln_det_from_cholesky(l: &DMatrix<f64>) -> f64 {
    2.0 * l.diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

fn evaluate(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    zzt: &[DMatrix<f64>],
    zs: &[DMatrix<f64>],
    w_inv: &DVector<f64>,
    log_lambdas: &[f64],
) -> Option<Eval> {
    let n = y.len();
    let p = x.ncols();
    let dof = (n.saturating_sub(p)).max(1) as f64;

    let mut v0 = DMatrix::from_diagonal(w_inv);
    for (ll, zz) in log_lambdas.iter().zip(zzt.iter()) {
        v0 += zz * ll.exp();
    }
    let chol_v = v0.cholesky()?;
    let ln_det_v = ln_det_from_cholesky(&chol_v.l());

    let vx = chol_v.solve(x);
    let vy = chol_v.solve(y);
    let xtvx = x.transpose() * &vx;
    let xtvy = x.transpose() * &vy;
    let chol_xtvx = xtvx.cholesky()?;
    let ln_det_xtvx = ln_det_from_cholesky(&chol_xtvx.l());
    let beta = chol_xtvx.solve(&xtvy);

    let residual = y - x * &beta;
    let v_residual = chol_v.solve(&residual);
    let rss = residual.dot(&v_residual).max(f64::MIN_POSITIVE);
    let sigma2 = rss / dof;

    let criterion = ln_det_v + ln_det_xtvx + dof * rss.ln();

    let blups: Vec<DVector<f64>> = log_lambdas
        .iter()
        .zip(zs.iter())
        .map(|(ll, z)| (z.transpose() * &v_residual) * ll.exp())
        .collect();
    let mut eta = x * &beta;
    for (z, u) in zs.iter().zip(blups.iter()) {
        eta += z * u;
    }

    Some(Eval {
        criterion,
        beta,
        cov_beta: chol_xtvx.inverse() * sigma2,
        sigma2,
        blups,
        eta,
    })
}

fn golden_min<F: Fn(f64) -> f64>(f: F, mut lo: f64, mut hi: f64, iters: usize) -> f64 {
    const INV_PHI: f64 = 0.618_033_988_749_894_8;
    let mut c = hi - INV_PHI * (hi - lo);
    let mut d = lo + INV_PHI * (hi - lo);
    let mut fc = f(c);
    let mut fd = f(d);
    for _ in 0..iters {
        if fc < fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - INV_PHI * (hi - lo);
            fc = f(c);
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + INV_PHI * (hi - lo);
            fd = f(d);
        }
    }
    0.5 * (lo + hi)
}

/// Fit a (weighted) Gaussian random-intercept model.
///
/// `prior_weights` carries the working weights of the quasi-likelihood
/// outer loop; `None` means unit weights.
pub(crate) fn profile_fit(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    zs: &[DMatrix<f64>],
    prior_weights: Option<&DVector<f64>>,
    opts: &FitOptions,
) -> Result<LmmFit> {
    let n = y.len();
    let w_inv = match prior_weights {
        Some(w) => DVector::from_iterator(n, w.iter().map(|wi| 1.0 / wi.max(1e-12))),
        None => DVector::from_element(n, 1.0),
    };
    let zzt: Vec<DMatrix<f64>> = zs.iter().map(|z| z * z.transpose()).collect();

    let fit_error = |iterations: usize, last_delta: f64, reason: &str| Error::ModelFit {
        reason: reason.to_string(),
        iterations,
        last_delta,
    };

    let mut log_lambdas = vec![0.0; zs.len()];
    let mut iterations = 0;
    let mut converged = zs.is_empty();

    if !zs.is_empty() {
        let criterion_at = |lls: &[f64]| {
            evaluate(x, y, &zzt, zs, &w_inv, lls)
                .map(|e| e.criterion)
                .unwrap_or(f64::INFINITY)
        };
        let mut last = criterion_at(&log_lambdas);
        if !last.is_finite() {
            return Err(fit_error(0, f64::NAN, "covariance matrix not positive definite"));
        }
        for sweep in 0..opts.sweeps {
            iterations = sweep + 1;
            for k in 0..log_lambdas.len() {
                let others = log_lambdas.clone();
                log_lambdas[k] = golden_min(
                    |t| {
                        let mut trial = others.clone();
                        trial[k] = t;
                        criterion_at(&trial)
                    },
                    LOG_LAMBDA_RANGE.0,
                    LOG_LAMBDA_RANGE.1,
                    GOLDEN_ITERS,
                );
            }
            let current = criterion_at(&log_lambdas);
            let delta = (last - current).abs();
            last = current;
            if delta < opts.tol * last.abs().max(1.0) {
                converged = true;
                break;
            }
        }
    }

    let eval = evaluate(x, y, &zzt, zs, &w_inv, &log_lambdas)
        .ok_or_else(|| fit_error(iterations, f64::NAN, "covariance matrix not positive definite"))?;

    Ok(LmmFit {
        beta: eval.beta,
        cov_beta: eval.cov_beta,
        sigma2: eval.sigma2,
        lambdas: log_lambdas.iter().map(|ll| ll.exp()).collect(),
        blups: eval.blups,
        eta: eval.eta,
        iterations: iterations.max(1),
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ols_reduction_without_random_terms() {
        // y = 1 + 2x exactly
        let x = DMatrix::from_row_slice(4, 2, &[1., 0., 1., 1., 1., 2., 1., 3.]);
        let y = DVector::from_column_slice(&[1., 3., 5., 7.]);
        let fit = profile_fit(&x, &y, &[], None, &FitOptions::default()).unwrap();
        assert_relative_eq!(fit.beta[0], 1.0, epsilon = 1e-10);
        assert_relative_eq!(fit.beta[1], 2.0, epsilon = 1e-10);
        assert!(fit.sigma2 < 1e-18);
        assert!(fit.converged);
    }

    #[test]
    fn test_random_intercept_shrinks_group_means() {
        // two groups offset around a shared mean
        let x = DMatrix::from_element(6, 1, 1.0);
        let y = DVector::from_column_slice(&[2.0, 2.1, 1.9, 1.0, 0.9, 1.1]);
        let z = DMatrix::from_row_slice(
            6,
            2,
            &[1., 0., 1., 0., 1., 0., 0., 1., 0., 1., 0., 1.],
        );
        let fit = profile_fit(&x, &y, &[z], None, &FitOptions::default()).unwrap();
        assert_relative_eq!(fit.beta[0], 1.5, epsilon = 1e-6);
        assert_eq!(fit.blups.len(), 1);
        let u = &fit.blups[0];
        // BLUPs shrink toward zero but keep the group ordering
        assert!(u[0] > 0.0 && u[1] < 0.0);
        assert!(u[0] < 0.5);
        assert_relative_eq!(u[0], -u[1], epsilon = 1e-6);
    }

    #[test]
    fn test_weighted_fit_downweights_noisy_rows() {
        let x = DMatrix::from_row_slice(3, 1, &[1., 1., 1.]);
        let y = DVector::from_column_slice(&[1.0, 1.0, 10.0]);
        let w = DVector::from_column_slice(&[1.0, 1.0, 1e-6]);
        let fit = profile_fit(&x, &y, &[], Some(&w), &FitOptions::default()).unwrap();
        assert_relative_eq!(fit.beta[0], 1.0, epsilon = 1e-3);
    }
}
