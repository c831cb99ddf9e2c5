use crate::error::{ReplayError, Result};

/// Number of replay indicator states.
pub const N_STATES: usize = 2;
pub const NO_REPLAY: usize = 0;
pub const REPLAY: usize = 1;

/// Dense `n_time x 2 x n_bins` array indexed by time, replay state and
/// place bin, in that order.
///
/// Arrays that are not position resolved use `n_bins == 1` and are
/// broadcast over the place bins when combined with a full tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTensor {
    n_time: usize,
    n_bins: usize,
    data: Box<[f64]>,
}

impl StateTensor {
    pub fn filled(n_time: usize, n_bins: usize, value: f64) -> Self {
        Self {
            n_time,
            n_bins,
            data: vec![value; n_time * N_STATES * n_bins].into(),
        }
    }

    pub fn zeros(n_time: usize, n_bins: usize) -> Self {
        Self::filled(n_time, n_bins, 0.)
    }

    pub fn ones(n_time: usize, n_bins: usize) -> Self {
        Self::filled(n_time, n_bins, 1.)
    }

    pub fn from_fn(
        n_time: usize,
        n_bins: usize,
        mut f: impl FnMut(usize, usize, usize) -> f64,
    ) -> Self {
        let mut out = Self::zeros(n_time, n_bins);
        for t in 0..n_time {
            for state in 0..N_STATES {
                out.state_mut(t, state)
                    .iter_mut()
                    .enumerate()
                    .for_each(|(bin, x)| *x = f(t, state, bin));
            }
        }
        out
    }

    /// Wrap row-major data of length `n_time * 2 * n_bins`.
    pub fn from_vec(n_time: usize, n_bins: usize, data: Vec<f64>) -> Result<Self> {
        ReplayError::check_len("state tensor", n_time * N_STATES * n_bins, data.len())?;
        Ok(Self {
            n_time,
            n_bins,
            data: data.into(),
        })
    }

    pub fn n_time(&self) -> usize {
        self.n_time
    }

    pub fn n_bins(&self) -> usize {
        self.n_bins
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// All states and bins at time `t`, replay state major.
    pub fn time(&self, t: usize) -> &[f64] {
        let width = N_STATES * self.n_bins;
        &self.data[t * width..(t + 1) * width]
    }

    pub fn time_mut(&mut self, t: usize) -> &mut [f64] {
        let width = N_STATES * self.n_bins;
        &mut self.data[t * width..(t + 1) * width]
    }

    pub fn state(&self, t: usize, state: usize) -> &[f64] {
        let start = (t * N_STATES + state) * self.n_bins;
        &self.data[start..start + self.n_bins]
    }

    pub fn state_mut(&mut self, t: usize, state: usize) -> &mut [f64] {
        let start = (t * N_STATES + state) * self.n_bins;
        &mut self.data[start..start + self.n_bins]
    }

    pub fn get(&self, t: usize, state: usize, bin: usize) -> f64 {
        self.data[(t * N_STATES + state) * self.n_bins + bin]
    }

    /// Probability of each replay state at `t`, summed over bins.
    pub fn state_marginal(&self, t: usize) -> [f64; N_STATES] {
        [
            self.state(t, NO_REPLAY).iter().sum(),
            self.state(t, REPLAY).iter().sum(),
        ]
    }

    /// The replay state marginal over time.
    pub fn replay_probability(&self) -> Vec<f64> {
        (0..self.n_time)
            .map(|t| self.state_marginal(t)[REPLAY])
            .collect()
    }
}
