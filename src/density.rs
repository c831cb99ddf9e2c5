//! Density estimation capability.
//!
//! Emission models only need to fit a density to samples and evaluate its
//! log density. [`DensityEstimator`] and [`DensityModel`] are that contract;
//! Gaussian mixtures and Gaussian kernel density estimates implement it, and
//! [`DensitySettings`] selects one of them at runtime.

use std::f64::consts::PI;

use faer::Mat;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::{error::DensityError, math::logaddexp};

/// A fitted probability density over `dim()`-dimensional points.
pub trait DensityModel: Send + Sync + std::fmt::Debug {
    fn dim(&self) -> usize;

    /// Log density at a single point of length `dim()`.
    fn log_density_at(&self, point: &[f64]) -> f64;

    /// Log density at every row of `points`.
    fn log_density(&self, points: &Mat<f64>) -> Result<Vec<f64>, DensityError> {
        if points.ncols() != self.dim() {
            return Err(DensityError::DimensionMismatch {
                expected: self.dim(),
                found: points.ncols(),
            });
        }
        let mut point = vec![0f64; self.dim()];
        Ok((0..points.nrows())
            .map(|row| {
                point
                    .iter_mut()
                    .enumerate()
                    .for_each(|(col, p)| *p = points[(row, col)]);
                self.log_density_at(&point)
            })
            .collect())
    }

    /// Draw `n` samples, one per row.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Mat<f64>
    where
        Self: Sized;
}

/// Something that can fit a [`DensityModel`] to samples (one per row).
pub trait DensityEstimator {
    type Model: DensityModel;

    fn fit(&self, samples: &Mat<f64>) -> Result<Self::Model, DensityError>;
}

fn check_samples(samples: &Mat<f64>) -> Result<(), DensityError> {
    if samples.ncols() == 0 {
        return Err(DensityError::NoDimensions);
    }
    if samples.nrows() == 0 {
        return Err(DensityError::NotEnoughSamples(0));
    }
    Ok(())
}

fn row(samples: &Mat<f64>, i: usize) -> Vec<f64> {
    (0..samples.ncols()).map(|j| samples[(i, j)]).collect()
}

/// A multivariate normal stored through the eigendecomposition of its
/// covariance.
#[derive(Debug, Clone)]
struct Gaussian {
    mean: Vec<f64>,
    /// `diag(1 / sqrt(eigvals)) * U^T`
    whiten: Mat<f64>,
    /// `U * diag(sqrt(eigvals))`
    color: Mat<f64>,
    log_norm: f64,
}

impl Gaussian {
    fn new(mean: Vec<f64>, covariance: &Mat<f64>) -> Result<Self, DensityError> {
        let d = mean.len();
        let eig = covariance
            .self_adjoint_eigen(faer::Side::Lower)
            .map_err(|_| DensityError::Factorization)?;
        let u = eig.U().to_owned();
        let vals: Vec<f64> = eig.S().column_vector().to_owned().iter().copied().collect();
        if vals.iter().any(|&v| !(v > 0.) || !v.is_finite()) {
            return Err(DensityError::Factorization);
        }
        let whiten = Mat::from_fn(d, d, |i, j| u[(j, i)] / vals[i].sqrt());
        let color = Mat::from_fn(d, d, |i, j| u[(i, j)] * vals[j].sqrt());
        let log_det: f64 = vals.iter().map(|v| v.ln()).sum();
        Ok(Self {
            mean,
            whiten,
            color,
            log_norm: -0.5 * (d as f64 * (2. * PI).ln() + log_det),
        })
    }

    fn log_pdf(&self, point: &[f64]) -> f64 {
        let d = self.mean.len();
        let mut quad = 0f64;
        for i in 0..d {
            let z: f64 = (0..d)
                .map(|j| self.whiten[(i, j)] * (point[j] - self.mean[j]))
                .sum();
            quad += z * z;
        }
        self.log_norm - 0.5 * quad
    }

    fn sample_into<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]) {
        let d = self.mean.len();
        let z: Vec<f64> = (0..d).map(|_| rng.sample(StandardNormal)).collect();
        for i in 0..d {
            out[i] = self.mean[i] + (0..d).map(|j| self.color[(i, j)] * z[j]).sum::<f64>();
        }
    }
}

/// Settings for a full-covariance Gaussian mixture fit by EM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianMixtureSettings {
    /// Upper bound on the number of components; fewer are used when there
    /// are fewer samples.
    pub n_components: usize,
    pub max_iter: usize,
    /// EM stops when the mean log likelihood improves less than this.
    pub tol: f64,
    /// Added to the diagonal of every covariance.
    pub reg_covar: f64,
    /// Seed of the k-means++ initialisation.
    pub seed: u64,
}

impl Default for GaussianMixtureSettings {
    fn default() -> Self {
        Self {
            n_components: 10,
            max_iter: 200,
            tol: 1e-6,
            reg_covar: 1e-6,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GaussianMixture {
    log_weights: Vec<f64>,
    components: Vec<Gaussian>,
    converged: bool,
}

impl GaussianMixture {
    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.log_weights.iter().map(|w| w.exp()).collect()
    }

    pub fn converged(&self) -> bool {
        self.converged
    }
}

impl DensityModel for GaussianMixture {
    fn dim(&self) -> usize {
        self.components[0].mean.len()
    }

    fn log_density_at(&self, point: &[f64]) -> f64 {
        self.log_weights
            .iter()
            .zip(&self.components)
            .fold(f64::NEG_INFINITY, |acc, (w, c)| logaddexp(acc, w + c.log_pdf(point)))
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Mat<f64> {
        let d = self.dim();
        let weights = self.weights();
        let mut out = Mat::zeros(n, d);
        let mut draw = vec![0f64; d];
        for i in 0..n {
            let u: f64 = rng.random();
            let mut cumulative = 0.;
            let mut chosen = self.components.len() - 1;
            for (k, w) in weights.iter().enumerate() {
                cumulative += w;
                if u < cumulative {
                    chosen = k;
                    break;
                }
            }
            self.components[chosen].sample_into(rng, &mut draw);
            draw.iter().enumerate().for_each(|(j, &x)| out[(i, j)] = x);
        }
        out
    }
}

impl GaussianMixtureSettings {
    fn initial_means(&self, samples: &Mat<f64>, k: usize) -> Vec<Vec<f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let n = samples.nrows();
        let sq_dist = |i: usize, center: &[f64]| -> f64 {
            center
                .iter()
                .enumerate()
                .map(|(j, c)| (samples[(i, j)] - c).powi(2))
                .sum()
        };

        let mut means = vec![row(samples, rng.random_range(0..n))];
        let mut closest: Vec<f64> = (0..n).map(|i| sq_dist(i, &means[0])).collect();
        while means.len() < k {
            let total: f64 = closest.iter().sum();
            let next = if total > 0. {
                let target = rng.random::<f64>() * total;
                let mut cumulative = 0.;
                closest
                    .iter()
                    .position(|&d| {
                        cumulative += d;
                        cumulative > target
                    })
                    .unwrap_or(n - 1)
            } else {
                rng.random_range(0..n)
            };
            let center = row(samples, next);
            closest
                .iter_mut()
                .enumerate()
                .for_each(|(i, c)| *c = c.min(sq_dist(i, &center)));
            means.push(center);
        }
        means
    }

    fn m_step(
        &self,
        samples: &Mat<f64>,
        resp: &[f64],
        k: usize,
    ) -> Result<(Vec<f64>, Vec<Gaussian>), DensityError> {
        let (n, d) = (samples.nrows(), samples.ncols());
        let mut log_weights = Vec::with_capacity(k);
        let mut components = Vec::with_capacity(k);
        for c in 0..k {
            let nk: f64 = (0..n).map(|i| resp[i * k + c]).sum::<f64>() + 10. * f64::EPSILON;
            let mean: Vec<f64> = (0..d)
                .map(|j| (0..n).map(|i| resp[i * k + c] * samples[(i, j)]).sum::<f64>() / nk)
                .collect();
            let mut cov = Mat::<f64>::zeros(d, d);
            for i in 0..n {
                let r = resp[i * k + c];
                if r == 0. {
                    continue;
                }
                for a in 0..d {
                    let da = samples[(i, a)] - mean[a];
                    for b in 0..=a {
                        cov[(a, b)] += r * da * (samples[(i, b)] - mean[b]);
                    }
                }
            }
            for a in 0..d {
                for b in 0..=a {
                    cov[(a, b)] /= nk;
                    cov[(b, a)] = cov[(a, b)];
                }
                cov[(a, a)] += self.reg_covar;
            }
            log_weights.push((nk / n as f64).ln());
            components.push(Gaussian::new(mean, &cov)?);
        }
        Ok((log_weights, components))
    }
}

impl DensityEstimator for GaussianMixtureSettings {
    type Model = GaussianMixture;

    fn fit(&self, samples: &Mat<f64>) -> Result<GaussianMixture, DensityError> {
        check_samples(samples)?;
        if self.n_components == 0 || !(self.reg_covar > 0.) {
            return Err(DensityError::InvalidSettings(
                "a mixture needs at least one component and a positive reg_covar".into(),
            ));
        }
        let (n, d) = (samples.nrows(), samples.ncols());
        let k = self.n_components.min(n);

        // hard assignment to the k-means++ seeds starts EM
        let means = self.initial_means(samples, k);
        let mut resp = vec![0f64; n * k];
        for i in 0..n {
            let nearest = (0..k)
                .map(|c| {
                    let dist: f64 = (0..d).map(|j| (samples[(i, j)] - means[c][j]).powi(2)).sum();
                    (c, dist)
                })
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(c, _)| c)
                .unwrap_or(0);
            resp[i * k + nearest] = 1.;
        }

        let (mut log_weights, mut components) = self.m_step(samples, &resp, k)?;
        let mut previous = f64::NEG_INFINITY;
        let mut converged = false;
        let mut point = vec![0f64; d];
        let mut log_resp = vec![0f64; k];

        for _ in 0..self.max_iter {
            let mut total = 0f64;
            for i in 0..n {
                point
                    .iter_mut()
                    .enumerate()
                    .for_each(|(j, p)| *p = samples[(i, j)]);
                log_resp
                    .iter_mut()
                    .zip(log_weights.iter().zip(&components))
                    .for_each(|(lr, (w, c))| *lr = w + c.log_pdf(&point));
                let norm = crate::math::log_sum_exp(&log_resp);
                total += norm;
                for c in 0..k {
                    resp[i * k + c] = (log_resp[c] - norm).exp();
                }
            }
            let mean_log_likelihood = total / n as f64;
            (log_weights, components) = self.m_step(samples, &resp, k)?;
            if (mean_log_likelihood - previous).abs() < self.tol {
                converged = true;
                break;
            }
            previous = mean_log_likelihood;
        }

        Ok(GaussianMixture {
            log_weights,
            components,
            converged,
        })
    }
}

/// Kernel bandwidth selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bandwidth {
    /// The same bandwidth in every dimension.
    Fixed(f64),
    /// Normal reference plug-in rule, `1.06 * std * n^(-1 / (d + 4))` per
    /// dimension.
    NormalReference,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelDensitySettings {
    pub bandwidth: Bandwidth,
}

impl Default for KernelDensitySettings {
    fn default() -> Self {
        Self {
            bandwidth: Bandwidth::Fixed(2.0),
        }
    }
}

/// Gaussian kernel density estimate with a diagonal bandwidth.
#[derive(Debug, Clone)]
pub struct KernelDensity {
    dim: usize,
    /// row-major samples
    samples: Box<[f64]>,
    bandwidth: Vec<f64>,
    log_norm: f64,
}

impl KernelDensity {
    pub fn bandwidth(&self) -> &[f64] {
        &self.bandwidth
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len() / self.dim
    }
}

impl DensityEstimator for KernelDensitySettings {
    type Model = KernelDensity;

    fn fit(&self, samples: &Mat<f64>) -> Result<KernelDensity, DensityError> {
        check_samples(samples)?;
        let (n, d) = (samples.nrows(), samples.ncols());
        let bandwidth = match self.bandwidth {
            Bandwidth::Fixed(h) => {
                if !(h > 0.) {
                    return Err(DensityError::InvalidSettings(format!("bandwidth {h}")));
                }
                vec![h; d]
            }
            Bandwidth::NormalReference => {
                let factor = 1.06 * (n as f64).powf(-1. / (d as f64 + 4.));
                (0..d)
                    .map(|j| {
                        let mean = (0..n).map(|i| samples[(i, j)]).sum::<f64>() / n as f64;
                        let var = (0..n)
                            .map(|i| (samples[(i, j)] - mean).powi(2))
                            .sum::<f64>()
                            / (n.max(2) - 1) as f64;
                        let h = factor * var.sqrt();
                        if h > 0. {
                            h
                        } else {
                            1e-3 * (1. + mean.abs())
                        }
                    })
                    .collect()
            }
        };
        let data: Vec<f64> = (0..n).flat_map(|i| row(samples, i)).collect();
        let log_norm = -(n as f64).ln()
            - bandwidth.iter().map(|h| h.ln()).sum::<f64>()
            - 0.5 * d as f64 * (2. * PI).ln();
        Ok(KernelDensity {
            dim: d,
            samples: data.into(),
            bandwidth,
            log_norm,
        })
    }
}

impl DensityModel for KernelDensity {
    fn dim(&self) -> usize {
        self.dim
    }

    fn log_density_at(&self, point: &[f64]) -> f64 {
        let log_kernel_sum = self
            .samples
            .chunks_exact(self.dim)
            .map(|sample| {
                -0.5 * sample
                    .iter()
                    .zip(point)
                    .zip(&self.bandwidth)
                    .map(|((s, x), h)| ((x - s) / h).powi(2))
                    .sum::<f64>()
            })
            .fold(f64::NEG_INFINITY, logaddexp);
        self.log_norm + log_kernel_sum
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Mat<f64> {
        let n_samples = self.n_samples();
        let mut out = Mat::zeros(n, self.dim);
        for i in 0..n {
            let base = rng.random_range(0..n_samples) * self.dim;
            for j in 0..self.dim {
                let noise: f64 = rng.sample(StandardNormal);
                out[(i, j)] = self.samples[base + j] + self.bandwidth[j] * noise;
            }
        }
        out
    }
}

/// Runtime choice between the available density estimators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DensitySettings {
    GaussianMixture(GaussianMixtureSettings),
    KernelDensity(KernelDensitySettings),
}

impl Default for DensitySettings {
    fn default() -> Self {
        DensitySettings::GaussianMixture(Default::default())
    }
}

#[derive(Debug, Clone)]
pub enum FittedDensity {
    GaussianMixture(GaussianMixture),
    KernelDensity(KernelDensity),
}

impl DensityEstimator for DensitySettings {
    type Model = FittedDensity;

    fn fit(&self, samples: &Mat<f64>) -> Result<FittedDensity, DensityError> {
        Ok(match self {
            DensitySettings::GaussianMixture(settings) => {
                FittedDensity::GaussianMixture(settings.fit(samples)?)
            }
            DensitySettings::KernelDensity(settings) => {
                FittedDensity::KernelDensity(settings.fit(samples)?)
            }
        })
    }
}

impl DensityModel for FittedDensity {
    fn dim(&self) -> usize {
        match self {
            FittedDensity::GaussianMixture(model) => model.dim(),
            FittedDensity::KernelDensity(model) => model.dim(),
        }
    }

    fn log_density_at(&self, point: &[f64]) -> f64 {
        match self {
            FittedDensity::GaussianMixture(model) => model.log_density_at(point),
            FittedDensity::KernelDensity(model) => model.log_density_at(point),
        }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Mat<f64> {
        match self {
            FittedDensity::GaussianMixture(model) => model.sample(rng, n),
            FittedDensity::KernelDensity(model) => model.sample(rng, n),
        }
    }
}
