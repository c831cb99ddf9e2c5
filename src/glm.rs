//! Penalized generalized linear models fit by iteratively reweighted
//! least squares.

use faer::Mat;

use crate::error::GlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Identity link, constant variance.
    Gaussian,
    /// Logit link.
    Binomial,
    /// Log link.
    Poisson,
}

const MAX_LINEAR_PREDICTOR: f64 = 30.;
const MIN_PROBABILITY: f64 = 1e-10;

impl Family {
    fn inverse_link(self, eta: f64) -> f64 {
        match self {
            Family::Gaussian => eta,
            Family::Binomial => {
                let p = 1. / (1. + (-eta).exp());
                p.clamp(MIN_PROBABILITY, 1. - MIN_PROBABILITY)
            }
            Family::Poisson => eta.min(MAX_LINEAR_PREDICTOR).exp(),
        }
    }

    fn link(self, mu: f64) -> f64 {
        match self {
            Family::Gaussian => mu,
            Family::Binomial => (mu / (1. - mu)).ln(),
            Family::Poisson => mu.ln(),
        }
    }

    /// Starting mean for IRLS, away from the boundary of the support.
    fn initial_mean(self, y: f64, mean: f64) -> f64 {
        match self {
            Family::Gaussian => y,
            Family::Binomial => (y + 0.5) / 2.,
            Family::Poisson => (y + mean) / 2. + 0.1,
        }
    }

    /// IRLS weight and working response for one observation.
    fn working(self, y: f64, eta: f64, mu: f64) -> (f64, f64) {
        match self {
            Family::Gaussian => (1., y),
            Family::Binomial => {
                let var = mu * (1. - mu);
                (var, eta + (y - mu) / var)
            }
            Family::Poisson => (mu, eta + (y - mu) / mu),
        }
    }
}

/// Settings of the IRLS solver.
#[derive(Debug, Clone, Copy)]
pub struct GlmOptions {
    pub max_iter: usize,
    pub tolerance: f64,
}

impl Default for GlmOptions {
    fn default() -> Self {
        Self {
            max_iter: 50,
            tolerance: 1e-8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FittedGlm {
    family: Family,
    coefficients: Vec<f64>,
    /// Residual variance for the Gaussian family, 1 otherwise.
    dispersion: f64,
    converged: bool,
}

/// Fit `targets ~ design` with a ridge penalty `penalty[j] * beta[j]^2`.
///
/// Rows with a non-finite target or design entry are ignored.
pub fn fit(
    design: &Mat<f64>,
    targets: &[f64],
    penalty: &[f64],
    family: Family,
    options: GlmOptions,
) -> Result<FittedGlm, GlmError> {
    let n_cols = design.ncols();
    if design.nrows() != targets.len() {
        return Err(GlmError::ShapeMismatch {
            rows: design.nrows(),
            targets: targets.len(),
        });
    }
    if penalty.len() != n_cols {
        return Err(GlmError::PenaltyMismatch {
            expected: n_cols,
            found: penalty.len(),
        });
    }

    let rows = (0..design.nrows())
        .filter(|&i| targets[i].is_finite() && (0..n_cols).all(|j| design[(i, j)].is_finite()))
        .collect::<Vec<_>>();
    if rows.is_empty() {
        return Err(GlmError::Empty);
    }

    let mean_target = rows.iter().map(|&i| targets[i]).sum::<f64>() / rows.len() as f64;
    let mut eta = rows
        .iter()
        .map(|&i| family.link(family.initial_mean(targets[i], mean_target)))
        .collect::<Vec<_>>();
    let mut coefficients = vec![0f64; n_cols];
    let mut converged = false;

    for _ in 0..options.max_iter {
        let mut gram = Mat::<f64>::zeros(n_cols, n_cols);
        let mut rhs = vec![0f64; n_cols];
        for (k, &i) in rows.iter().enumerate() {
            let mu = family.inverse_link(eta[k]);
            let (weight, z) = family.working(targets[i], eta[k], mu);
            for a in 0..n_cols {
                let xa = design[(i, a)] * weight;
                if xa == 0. {
                    continue;
                }
                rhs[a] += xa * z;
                for b in a..n_cols {
                    gram[(a, b)] += xa * design[(i, b)];
                }
            }
        }
        for a in 0..n_cols {
            gram[(a, a)] += penalty[a];
            for b in 0..a {
                gram[(a, b)] = gram[(b, a)];
            }
        }

        let updated = spd_solve(&gram, &rhs).ok_or(GlmError::Singular)?;
        let change = updated
            .iter()
            .zip(&coefficients)
            .map(|(new, old)| (new - old).abs() / (1. + old.abs()))
            .fold(0f64, f64::max);
        coefficients = updated;

        for (k, &i) in rows.iter().enumerate() {
            eta[k] = (0..n_cols).map(|j| design[(i, j)] * coefficients[j]).sum();
        }

        if family == Family::Gaussian || change < options.tolerance {
            converged = true;
            break;
        }
    }

    let dispersion = match family {
        Family::Gaussian => {
            let rss: f64 = rows
                .iter()
                .zip(&eta)
                .map(|(&i, &fitted)| (targets[i] - fitted).powi(2))
                .sum();
            let dof = rows.len().saturating_sub(n_cols).max(1);
            rss / dof as f64
        }
        _ => 1.,
    };

    Ok(FittedGlm {
        family,
        coefficients,
        dispersion,
        converged,
    })
}

impl FittedGlm {
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn dispersion(&self) -> f64 {
        self.dispersion
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Mean response for one design row.
    pub fn predict_row(&self, row: &[f64]) -> f64 {
        assert!(row.len() == self.coefficients.len());
        let eta: f64 = row.iter().zip(&self.coefficients).map(|(x, b)| x * b).sum();
        self.family.inverse_link(eta)
    }

    /// Mean response for every row of `design`.
    pub fn predict(&self, design: &Mat<f64>) -> Vec<f64> {
        let mut row = vec![0f64; design.ncols()];
        (0..design.nrows())
            .map(|i| {
                row.iter_mut()
                    .enumerate()
                    .for_each(|(j, x)| *x = design[(i, j)]);
                self.predict_row(&row)
            })
            .collect()
    }
}

/// Solve `a x = b` for a symmetric positive semi-definite `a` through its
/// eigendecomposition, discarding directions with negligible eigenvalues.
pub(crate) fn spd_solve(a: &Mat<f64>, b: &[f64]) -> Option<Vec<f64>> {
    let n = a.nrows();
    let eig = a.self_adjoint_eigen(faer::Side::Lower).ok()?;
    let u = eig.U().to_owned();
    let s = eig.S().column_vector().to_owned();
    let s: Vec<f64> = s.iter().copied().collect();
    let max = s.iter().copied().fold(0f64, f64::max);
    if !(max > 0.) || !max.is_finite() {
        return None;
    }
    let cutoff = max * 1e-12;

    let mut x = vec![0f64; n];
    for (k, &value) in s.iter().enumerate() {
        if value <= cutoff {
            continue;
        }
        let projection: f64 = (0..n).map(|i| u[(i, k)] * b[i]).sum::<f64>() / value;
        x.iter_mut()
            .enumerate()
            .for_each(|(i, x)| *x += u[(i, k)] * projection);
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Poisson};

    fn design(x: &[f64]) -> Mat<f64> {
        Mat::from_fn(x.len(), 2, |i, j| if j == 0 { 1. } else { x[i] })
    }

    #[test]
    fn gaussian_is_least_squares() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|x| 1.5 + 0.5 * x).collect();
        let fit = fit(&design(&x), &y, &[0., 0.], Family::Gaussian, Default::default()).unwrap();
        assert_abs_diff_eq!(fit.coefficients()[0], 1.5, epsilon = 1e-8);
        assert_abs_diff_eq!(fit.coefficients()[1], 0.5, epsilon = 1e-8);
        assert!(fit.dispersion() < 1e-12);
    }

    #[test]
    fn binomial_recovers_logistic_coefficients() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let x: Vec<f64> = (0..4000).map(|_| rng.random_range(-3.0..3.0)).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|&x| {
                let p = 1. / (1. + (-(0.5 - 1.2 * x)).exp());
                if rng.random::<f64>() < p {
                    1.
                } else {
                    0.
                }
            })
            .collect();
        let fit = fit(&design(&x), &y, &[0., 0.], Family::Binomial, Default::default()).unwrap();
        assert!(fit.converged());
        assert_abs_diff_eq!(fit.coefficients()[0], 0.5, epsilon = 0.15);
        assert_abs_diff_eq!(fit.coefficients()[1], -1.2, epsilon = 0.15);
    }

    #[test]
    fn poisson_recovers_log_rate() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let x: Vec<f64> = (0..3000).map(|i| (i % 100) as f64 / 50. - 1.).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|&x| Poisson::new((0.3 + 0.8 * x).exp()).unwrap().sample(&mut rng))
            .collect();
        let fit = fit(&design(&x), &y, &[0., 0.], Family::Poisson, Default::default()).unwrap();
        assert_abs_diff_eq!(fit.coefficients()[0], 0.3, epsilon = 0.1);
        assert_abs_diff_eq!(fit.coefficients()[1], 0.8, epsilon = 0.1);
        assert_abs_diff_eq!(fit.predict_row(&[1., 0.]), 0.3f64.exp(), epsilon = 0.15);
    }

    #[test]
    fn penalty_shrinks_and_nan_rows_are_skipped() {
        let x = vec![0., 1., 2., f64::NAN, 3.];
        let y = vec![0., 1., 2., 100., 3.];
        let free = fit(&design(&x), &y, &[0., 0.], Family::Gaussian, Default::default()).unwrap();
        assert_abs_diff_eq!(free.coefficients()[1], 1., epsilon = 1e-8);
        let shrunk = fit(&design(&x), &y, &[0., 100.], Family::Gaussian, Default::default()).unwrap();
        assert!(shrunk.coefficients()[1].abs() < 0.5);
    }

    #[test]
    fn shape_errors() {
        let x = vec![0., 1.];
        assert!(matches!(
            fit(&design(&x), &[1.], &[0., 0.], Family::Gaussian, Default::default()),
            Err(GlmError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            fit(&design(&x), &[1., 2.], &[0.], Family::Gaussian, Default::default()),
            Err(GlmError::PenaltyMismatch { .. })
        ));
    }
}
