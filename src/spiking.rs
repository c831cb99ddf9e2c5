//! Sorted-spike likelihood from Poisson place fields.

use faer::Mat;
use rayon::prelude::*;

use crate::{
    error::{GlmError, ReplayError, Result},
    glm::{self, Family, FittedGlm, GlmOptions},
    grid::PlaceGrid,
    likelihood::{LikelihoodArray, LikelihoodModel},
    math::axpy,
    spline::NaturalCubicSpline,
    tensor::{NO_REPLAY, REPLAY},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeModelSettings {
    /// Ridge penalty on the spline coefficients.
    pub penalty: f64,
    /// Distance between spline knots over each position dimension.
    pub knot_spacing: f64,
}

impl Default for SpikeModelSettings {
    fn default() -> Self {
        Self {
            penalty: 1e-1,
            knot_spacing: 15.,
        }
    }
}

/// Additive spline basis over the position dimensions plus an intercept.
#[derive(Debug, Clone)]
struct PlaceBasis {
    splines: Vec<Option<NaturalCubicSpline>>,
}

impl PlaceBasis {
    fn fit(position: &Mat<f64>, rows: &[usize], knot_spacing: f64) -> Self {
        let splines = (0..position.ncols())
            .map(|dim| {
                let values = rows.iter().map(|&t| position[(t, dim)]).collect::<Vec<_>>();
                let (min, max) = values
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                        (lo.min(v), hi.max(v))
                    });
                let knots = if knot_spacing > 0. {
                    (1..)
                        .map(|k| min + k as f64 * knot_spacing)
                        .take_while(|&k| k < max)
                        .collect::<Vec<_>>()
                } else {
                    vec![]
                };
                NaturalCubicSpline::fit(&values, &knots)
            })
            .collect();
        Self { splines }
    }

    fn n_cols(&self) -> usize {
        1 + self
            .splines
            .iter()
            .flatten()
            .map(|s| s.n_basis())
            .sum::<usize>()
    }

    fn fill(&self, point: &[f64], out: &mut [f64]) {
        out[0] = 1.;
        let mut offset = 1;
        for (spline, &value) in self.splines.iter().zip(point) {
            if let Some(spline) = spline {
                let n = spline.n_basis();
                spline.basis(value, &mut out[offset..offset + n]);
                offset += n;
            }
        }
    }

    fn design(&self, position: &Mat<f64>, rows: &[usize]) -> Mat<f64> {
        let mut design = Mat::zeros(rows.len(), self.n_cols());
        let mut point = vec![0f64; position.ncols()];
        let mut row = vec![0f64; self.n_cols()];
        for (i, &t) in rows.iter().enumerate() {
            point
                .iter_mut()
                .enumerate()
                .for_each(|(dim, p)| *p = position[(t, dim)]);
            self.fill(&point, &mut row);
            row.iter()
                .enumerate()
                .for_each(|(j, &x)| design[(i, j)] = x);
        }
        design
    }
}

/// Place fields of every neuron, fit outside of replay.
#[derive(Debug, Clone)]
pub struct SpikingLikelihood {
    basis: PlaceBasis,
    neurons: Vec<FittedGlm>,
    /// Expected count per time bin at every place bin center, per neuron.
    place_fields: Vec<Vec<f64>>,
}

/// Spike counts (`n_time x n_neurons`) and the observed position.
#[derive(Debug, Clone, Copy)]
pub struct SpikeInput<'a> {
    pub spikes: &'a Mat<f64>,
    pub position: &'a Mat<f64>,
}

impl SpikingLikelihood {
    pub fn fit(
        spikes: &Mat<f64>,
        position: &Mat<f64>,
        is_replay: &[bool],
        grid: &PlaceGrid,
        settings: SpikeModelSettings,
    ) -> Result<Self> {
        let n_time = position.nrows();
        ReplayError::check_len("spike times", n_time, spikes.nrows())?;
        ReplayError::check_len("replay labels", n_time, is_replay.len())?;
        ReplayError::check_len("position dimensions", grid.n_dims(), position.ncols())?;

        let rows = (0..n_time)
            .filter(|&t| {
                !is_replay[t] && (0..position.ncols()).all(|d| position[(t, d)].is_finite())
            })
            .collect::<Vec<_>>();
        let basis = PlaceBasis::fit(position, &rows, settings.knot_spacing);
        let design = basis.design(position, &rows);
        let mut penalty = vec![settings.penalty; basis.n_cols()];
        penalty[0] = 0.;

        let neurons = (0..spikes.ncols())
            .into_par_iter()
            .map(|neuron| {
                let counts = rows.iter().map(|&t| spikes[(t, neuron)]).collect::<Vec<_>>();
                glm::fit(&design, &counts, &penalty, Family::Poisson, GlmOptions::default())
            })
            .collect::<std::result::Result<Vec<_>, GlmError>>()?;

        let centers = basis.design(grid.centers(), &(0..grid.n_bins()).collect::<Vec<_>>());
        let place_fields = neurons.iter().map(|model| model.predict(&centers)).collect();
        Ok(Self {
            basis,
            neurons,
            place_fields,
        })
    }

    pub fn n_neurons(&self) -> usize {
        self.neurons.len()
    }

    /// Expected count of `neuron` at every place bin center.
    pub fn place_field(&self, neuron: usize) -> &[f64] {
        &self.place_fields[neuron]
    }

    /// Poisson log-likelihood of one neuron, laid out per time as the
    /// no-replay value followed by one value per bin.
    fn neuron_log_likelihood(&self, neuron: usize, input: &SpikeInput<'_>) -> Vec<f64> {
        let n_bins = self.place_fields[neuron].len();
        let model = &self.neurons[neuron];
        let mut out = vec![0f64; input.spikes.nrows() * (n_bins + 1)];
        let mut point = vec![0f64; input.position.ncols()];
        let mut row = vec![0f64; self.basis.n_cols()];
        for (t, chunk) in out.chunks_exact_mut(n_bins + 1).enumerate() {
            let count = input.spikes[(t, neuron)];
            point
                .iter_mut()
                .enumerate()
                .for_each(|(dim, p)| *p = input.position[(t, dim)]);
            chunk[0] = if point.iter().all(|p| p.is_finite()) {
                self.basis.fill(&point, &mut row);
                poisson_log_likelihood(count, model.predict_row(&row))
            } else {
                f64::NAN
            };
            chunk[1..]
                .iter_mut()
                .zip(&self.place_fields[neuron])
                .for_each(|(ll, &rate)| *ll = poisson_log_likelihood(count, rate));
        }
        out
    }
}

/// `y log(rate) - rate`, dropping the `log(y!)` term shared by all states.
fn poisson_log_likelihood(count: f64, rate: f64) -> f64 {
    if count == 0. {
        -rate
    } else {
        count * rate.ln() - rate
    }
}

impl LikelihoodModel for SpikingLikelihood {
    type Input<'a> = SpikeInput<'a>;

    fn evaluate(&self, input: SpikeInput<'_>) -> Result<LikelihoodArray> {
        let n_time = input.spikes.nrows();
        ReplayError::check_len("spike neurons", self.n_neurons(), input.spikes.ncols())?;
        ReplayError::check_len("spike times", n_time, input.position.nrows())?;
        ReplayError::check_len(
            "position dimensions",
            self.basis.splines.len(),
            input.position.ncols(),
        )?;
        let n_bins = self.place_fields.first().map_or(0, |f| f.len());
        let width = n_bins + 1;

        let total = (0..self.n_neurons())
            .into_par_iter()
            .map(|neuron| self.neuron_log_likelihood(neuron, &input))
            .reduce(
                || vec![0f64; n_time * width],
                |mut acc, partial| {
                    axpy(&partial, &mut acc, 1.);
                    acc
                },
            );

        let n_bins = n_bins.max(1);
        let mut out = LikelihoodArray::zeros(n_time, n_bins);
        for t in 0..n_time {
            let ll = &total[t * width..(t + 1) * width];
            let max = ll
                .iter()
                .copied()
                .filter(|x| x.is_finite())
                .fold(f64::NEG_INFINITY, f64::max);
            let shift = if max.is_finite() { max } else { 0. };
            out.state_mut(t, NO_REPLAY).fill((ll[0] - shift).exp());
            if width == 1 {
                out.state_mut(t, REPLAY).fill(1.);
            } else {
                out.state_mut(t, REPLAY)
                    .iter_mut()
                    .zip(&ll[1..])
                    .for_each(|(x, &l)| *x = (l - shift).exp());
            }
        }
        Ok(out)
    }
}
