//! Marked point-process likelihood of unsorted multiunit activity.
//!
//! Each electrode is described by a ground intensity over position and a
//! joint intensity over marks and position, both estimated as ratios of
//! densities fit outside of replay:
//!
//! ```text
//! ground(x)        = mean_rate * p(x | event) / occupancy(x)
//! joint(marks, x)  = mean_rate * p(marks, x) / occupancy(x)
//! ```
//!
//! A time bin with an event contributes `ln(dt) + ln(joint) - ground * dt`,
//! a time bin without one `-ground * dt`.

use faer::Mat;
use rayon::prelude::*;

use crate::{
    density::{
        DensityEstimator, DensityModel, DensitySettings, FittedDensity, GaussianMixtureSettings,
        KernelDensitySettings,
    },
    diagnostics::{Diagnostic, DiagnosticSink},
    error::{ReplayError, Result},
    grid::PlaceGrid,
    likelihood::{LikelihoodArray, LikelihoodModel},
    math::{axpy, EPS},
    tensor::{NO_REPLAY, REPLAY},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiunitSettings {
    /// Estimator of the joint density of marks and position.
    pub joint_density: DensitySettings,
    /// Estimator of the occupancy and of each electrode's place density.
    pub occupancy_density: DensitySettings,
    /// Duration of one time bin, in the units of the rates.
    pub time_bin_size: f64,
}

impl Default for MultiunitSettings {
    fn default() -> Self {
        Self {
            joint_density: DensitySettings::GaussianMixture(GaussianMixtureSettings {
                n_components: 30,
                ..Default::default()
            }),
            occupancy_density: DensitySettings::KernelDensity(KernelDensitySettings::default()),
            time_bin_size: 1.,
        }
    }
}

#[derive(Debug, Clone)]
struct ElectrodeModel {
    mean_rate: f64,
    joint: FittedDensity,
    /// Ground intensity at every place bin center.
    ground_at_bins: Vec<f64>,
    marginal: FittedDensity,
}

#[derive(Debug, Clone)]
struct Electrode {
    /// Mark columns that carried a value during training.
    mark_columns: Vec<usize>,
    /// `None` for electrodes without training events.
    model: Option<ElectrodeModel>,
}

impl Electrode {
    /// The retained marks at `t`, or `None` if there was no event.
    fn event_marks(&self, marks: &Mat<f64>, t: usize) -> Option<Vec<f64>> {
        if self.mark_columns.is_empty() {
            return None;
        }
        let values = self
            .mark_columns
            .iter()
            .map(|&j| marks[(t, j)])
            .collect::<Vec<_>>();
        values.iter().all(|v| v.is_finite()).then_some(values)
    }
}

/// Fitted multiunit likelihood.
#[derive(Debug, Clone)]
pub struct MultiunitLikelihood {
    occupancy: FittedDensity,
    bin_centers: Mat<f64>,
    occupancy_at_bins: Vec<f64>,
    electrodes: Vec<Electrode>,
    n_marks: Vec<usize>,
    time_bin_size: f64,
}

/// Marks of every electrode (`n_time x n_marks`, NaN rows without an
/// event) and the observed position.
#[derive(Debug, Clone, Copy)]
pub struct MultiunitInput<'a> {
    pub marks: &'a [Mat<f64>],
    pub position: &'a Mat<f64>,
}

fn position_row(position: &Mat<f64>, t: usize) -> Vec<f64> {
    (0..position.ncols()).map(|d| position[(t, d)]).collect()
}

fn select_rows(source: &Mat<f64>, rows: &[usize]) -> Mat<f64> {
    Mat::from_fn(rows.len(), source.ncols(), |i, j| source[(rows[i], j)])
}

impl MultiunitLikelihood {
    pub fn fit(
        marks: &[Mat<f64>],
        position: &Mat<f64>,
        is_replay: &[bool],
        grid: &PlaceGrid,
        settings: &MultiunitSettings,
        sink: &dyn DiagnosticSink,
    ) -> Result<Self> {
        let n_time = position.nrows();
        ReplayError::check_len("replay labels", n_time, is_replay.len())?;
        ReplayError::check_len("position dimensions", grid.n_dims(), position.ncols())?;
        for electrode in marks {
            ReplayError::check_len("multiunit times", n_time, electrode.nrows())?;
        }

        let rows = (0..n_time)
            .filter(|&t| {
                !is_replay[t] && position_row(position, t).iter().all(|p| p.is_finite())
            })
            .collect::<Vec<_>>();
        let occupancy = settings.occupancy_density.fit(&select_rows(position, &rows))?;
        let bin_centers = grid.centers().to_owned();
        let occupancy_at_bins = occupancy
            .log_density(&bin_centers)?
            .into_iter()
            .map(f64::exp)
            .collect::<Vec<_>>();

        let electrodes = marks
            .par_iter()
            .map(|electrode_marks| {
                fit_electrode(
                    electrode_marks,
                    position,
                    &rows,
                    &bin_centers,
                    &occupancy_at_bins,
                    settings,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        for (index, electrode) in electrodes.iter().enumerate() {
            if electrode.model.is_none() {
                sink.emit(&Diagnostic::SilentElectrode { electrode: index });
            }
        }

        Ok(Self {
            occupancy,
            bin_centers,
            occupancy_at_bins,
            electrodes,
            n_marks: marks.iter().map(|m| m.ncols()).collect(),
            time_bin_size: settings.time_bin_size,
        })
    }

    pub fn n_electrodes(&self) -> usize {
        self.electrodes.len()
    }

    /// Fraction of training time bins with an event, per electrode.
    pub fn mean_rate(&self, electrode: usize) -> f64 {
        self.electrodes[electrode]
            .model
            .as_ref()
            .map_or(0., |model| model.mean_rate)
    }

    /// Ground intensity of `electrode` at every place bin center.
    pub fn ground_intensity(&self, electrode: usize) -> Option<&[f64]> {
        self.electrodes[electrode]
            .model
            .as_ref()
            .map(|model| model.ground_at_bins.as_slice())
    }

    /// Per-time log-likelihood of one electrode, laid out as the no-replay
    /// value followed by one value per bin.
    fn electrode_log_likelihood(
        &self,
        electrode: &Electrode,
        marks: &Mat<f64>,
        position: &Mat<f64>,
        occupancy_at_position: &[f64],
    ) -> Vec<f64> {
        let n_bins = self.bin_centers.nrows();
        let width = n_bins + 1;
        let mut out = vec![0f64; position.nrows() * width];
        let Some(model) = &electrode.model else {
            return out;
        };
        let dt = self.time_bin_size;
        let n_dims = self.bin_centers.ncols();
        let n_retained = electrode.mark_columns.len();
        let mut point = vec![0f64; n_retained + n_dims];

        for (t, chunk) in out.chunks_exact_mut(width).enumerate() {
            let here = position_row(position, t);
            let observed = here.iter().all(|p| p.is_finite());
            let occupancy_here = occupancy_at_position[t] + EPS;
            let ground_here = if observed {
                model.mean_rate * model.marginal.log_density_at(&here).exp() / occupancy_here
            } else {
                f64::NAN
            };

            match electrode.event_marks(marks, t) {
                None => {
                    chunk[0] = -ground_here * dt;
                    chunk[1..]
                        .iter_mut()
                        .zip(&model.ground_at_bins)
                        .for_each(|(ll, ground)| *ll = -ground * dt);
                }
                Some(values) => {
                    let log_scale = dt.ln() + model.mean_rate.ln();
                    point[..n_retained].copy_from_slice(&values);
                    chunk[0] = if observed {
                        point[n_retained..].copy_from_slice(&here);
                        log_scale + model.joint.log_density_at(&point)
                            - occupancy_here.ln()
                            - ground_here * dt
                    } else {
                        f64::NAN
                    };
                    for bin in 0..n_bins {
                        (0..n_dims)
                            .for_each(|d| point[n_retained + d] = self.bin_centers[(bin, d)]);
                        chunk[bin + 1] = log_scale + model.joint.log_density_at(&point)
                            - (self.occupancy_at_bins[bin] + EPS).ln()
                            - model.ground_at_bins[bin] * dt;
                    }
                }
            }
        }
        out
    }

    /// Log-likelihood of the marks, summed over electrodes. The no-replay
    /// value is broadcast over bins; it is NaN where the position is missing.
    pub fn log_likelihood(&self, input: MultiunitInput<'_>) -> Result<LikelihoodArray> {
        let n_time = input.position.nrows();
        ReplayError::check_len("multiunit electrodes", self.n_electrodes(), input.marks.len())?;
        ReplayError::check_len(
            "position dimensions",
            self.bin_centers.ncols(),
            input.position.ncols(),
        )?;
        for (marks, &n_marks) in input.marks.iter().zip(&self.n_marks) {
            ReplayError::check_len("multiunit times", n_time, marks.nrows())?;
            ReplayError::check_len("multiunit marks", n_marks, marks.ncols())?;
        }

        let occupancy_at_position = (0..n_time)
            .map(|t| {
                let here = position_row(input.position, t);
                if here.iter().all(|p| p.is_finite()) {
                    self.occupancy.log_density_at(&here).exp()
                } else {
                    f64::NAN
                }
            })
            .collect::<Vec<_>>();

        let n_bins = self.bin_centers.nrows();
        let width = n_bins + 1;
        let total = self
            .electrodes
            .par_iter()
            .zip(input.marks.par_iter())
            .map(|(electrode, marks)| {
                self.electrode_log_likelihood(
                    electrode,
                    marks,
                    input.position,
                    &occupancy_at_position,
                )
            })
            .reduce(
                || vec![0f64; n_time * width],
                |mut acc, partial| {
                    axpy(&partial, &mut acc, 1.);
                    acc
                },
            );

        let mut out = LikelihoodArray::zeros(n_time, n_bins);
        for t in 0..n_time {
            let ll = &total[t * width..(t + 1) * width];
            out.state_mut(t, NO_REPLAY).fill(ll[0]);
            out.state_mut(t, REPLAY).copy_from_slice(&ll[1..]);
        }
        Ok(out)
    }
}

fn fit_electrode(
    marks: &Mat<f64>,
    position: &Mat<f64>,
    rows: &[usize],
    bin_centers: &Mat<f64>,
    occupancy_at_bins: &[f64],
    settings: &MultiunitSettings,
) -> Result<Electrode> {
    let mark_columns = (0..marks.ncols())
        .filter(|&j| rows.iter().any(|&t| marks[(t, j)].is_finite()))
        .collect::<Vec<_>>();
    let mut electrode = Electrode {
        mark_columns,
        model: None,
    };
    let events = rows
        .iter()
        .copied()
        .filter(|&t| electrode.event_marks(marks, t).is_some())
        .collect::<Vec<_>>();
    if events.is_empty() {
        return Ok(electrode);
    }

    let n_retained = electrode.mark_columns.len();
    let n_dims = position.ncols();
    let joint_samples = Mat::from_fn(events.len(), n_retained + n_dims, |i, j| {
        if j < n_retained {
            marks[(events[i], electrode.mark_columns[j])]
        } else {
            position[(events[i], j - n_retained)]
        }
    });
    let joint = settings.joint_density.fit(&joint_samples)?;
    let marginal = settings
        .occupancy_density
        .fit(&select_rows(position, &events))?;

    let mean_rate = events.len() as f64 / rows.len() as f64;
    let ground_at_bins = marginal
        .log_density(bin_centers)?
        .into_iter()
        .zip(occupancy_at_bins)
        .map(|(log_place, occupancy)| mean_rate * log_place.exp() / (occupancy + EPS))
        .collect();
    electrode.model = Some(ElectrodeModel {
        mean_rate,
        joint,
        ground_at_bins,
        marginal,
    });
    Ok(electrode)
}

impl LikelihoodModel for MultiunitLikelihood {
    type Input<'a> = MultiunitInput<'a>;

    /// The likelihood scaled so that its per-time maximum over finite
    /// values is 1.
    fn evaluate(&self, input: MultiunitInput<'_>) -> Result<LikelihoodArray> {
        let mut log_likelihood = self.log_likelihood(input)?;
        for t in 0..log_likelihood.n_time() {
            let slice = log_likelihood.time_mut(t);
            let max = slice
                .iter()
                .copied()
                .filter(|x| x.is_finite())
                .fold(f64::NEG_INFINITY, f64::max);
            let shift = if max.is_finite() { max } else { 0. };
            slice.iter_mut().for_each(|x| *x = (*x - shift).exp());
        }
        Ok(log_likelihood)
    }
}
