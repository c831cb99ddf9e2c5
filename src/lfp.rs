//! Likelihood of ripple-band LFP power under each replay state.

use faer::Mat;

use crate::{
    density::{DensityEstimator, DensityModel, DensitySettings, FittedDensity},
    error::{ReplayError, Result},
    likelihood::{LikelihoodArray, LikelihoodModel},
    math::EPS,
    tensor::{NO_REPLAY, REPLAY},
};

/// Densities of `log(power + eps)` in and out of replay.
#[derive(Debug, Clone)]
pub struct LfpPowerLikelihood {
    no_replay: FittedDensity,
    replay: FittedDensity,
}

fn complete_rows(power: &Mat<f64>) -> impl Iterator<Item = usize> + '_ {
    (0..power.nrows()).filter(|&t| (0..power.ncols()).all(|j| power[(t, j)].is_finite()))
}

fn log_power(power: &Mat<f64>, rows: &[usize]) -> Mat<f64> {
    Mat::from_fn(rows.len(), power.ncols(), |i, j| {
        (power[(rows[i], j)] + EPS).ln()
    })
}

impl LfpPowerLikelihood {
    /// `power` is `n_time x n_signals`; rows with a missing signal are left
    /// out of both densities.
    pub fn fit(power: &Mat<f64>, is_replay: &[bool], settings: &DensitySettings) -> Result<Self> {
        ReplayError::check_len("lfp power", is_replay.len(), power.nrows())?;
        let (replay_rows, no_replay_rows): (Vec<usize>, Vec<usize>) =
            complete_rows(power).partition(|&t| is_replay[t]);
        Ok(Self {
            no_replay: settings.fit(&log_power(power, &no_replay_rows))?,
            replay: settings.fit(&log_power(power, &replay_rows))?,
        })
    }

    pub fn n_signals(&self) -> usize {
        self.replay.dim()
    }
}

impl LikelihoodModel for LfpPowerLikelihood {
    type Input<'a> = &'a Mat<f64>;

    fn evaluate(&self, power: &Mat<f64>) -> Result<LikelihoodArray> {
        ReplayError::check_len("lfp signals", self.n_signals(), power.ncols())?;
        let mut out = LikelihoodArray::filled(power.nrows(), 1, f64::NAN);
        let rows = complete_rows(power).collect::<Vec<_>>();
        let log_power = log_power(power, &rows);
        let no_replay = self.no_replay.log_density(&log_power)?;
        let replay = self.replay.log_density(&log_power)?;
        for (i, &t) in rows.iter().enumerate() {
            out.state_mut(t, NO_REPLAY)[0] = no_replay[i].exp();
            out.state_mut(t, REPLAY)[0] = replay[i].exp();
        }
        Ok(out)
    }
}
