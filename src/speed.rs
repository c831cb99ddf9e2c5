//! Likelihood of the running speed under each replay state.

use faer::Mat;
use statrs::distribution::{Continuous, Normal};

use crate::{
    error::{ReplayError, Result},
    glm::{self, Family, FittedGlm, GlmOptions},
    likelihood::{LikelihoodArray, LikelihoodModel},
    math::lagged,
    tensor::{N_STATES, NO_REPLAY, REPLAY},
};

/// Lower bound on the residual variance of either speed model, in squared
/// speed units. Constant training speeds (an animal lying still) would
/// otherwise give a degenerate density.
pub const MIN_SPEED_VARIANCE: f64 = 1e-2;

/// One Gaussian autoregression of speed on lagged speed per replay state.
#[derive(Debug, Clone)]
pub struct SpeedLikelihood {
    models: [FittedGlm; N_STATES],
}

impl SpeedLikelihood {
    pub fn fit(speed: &[f64], is_replay: &[bool]) -> Result<Self> {
        ReplayError::check_len("replay labels", speed.len(), is_replay.len())?;
        let lagged_speed = lagged(speed);
        let fit_state = |replay: bool| -> Result<FittedGlm> {
            let times = (0..speed.len())
                .filter(|&t| is_replay[t] == replay)
                .collect::<Vec<_>>();
            let design = Mat::from_fn(times.len(), 2, |i, j| {
                if j == 0 {
                    1.
                } else {
                    lagged_speed[times[i]]
                }
            });
            let targets = times.iter().map(|&t| speed[t]).collect::<Vec<_>>();
            Ok(glm::fit(
                &design,
                &targets,
                &[0., 0.],
                Family::Gaussian,
                GlmOptions::default(),
            )?)
        };
        Ok(Self {
            models: [fit_state(false)?, fit_state(true)?],
        })
    }

    /// Intercept, slope and residual variance of the model of `state`.
    pub fn parameters(&self, state: usize) -> (f64, f64, f64) {
        let model = &self.models[state];
        (
            model.coefficients()[0],
            model.coefficients()[1],
            self.variance(state),
        )
    }

    fn variance(&self, state: usize) -> f64 {
        self.models[state].dispersion().max(MIN_SPEED_VARIANCE)
    }
}

impl LikelihoodModel for SpeedLikelihood {
    type Input<'a> = &'a [f64];

    fn evaluate(&self, speed: &[f64]) -> Result<LikelihoodArray> {
        let lagged_speed = lagged(speed);
        let mut out = LikelihoodArray::zeros(speed.len(), 1);
        for (t, (&value, &lag)) in speed.iter().zip(&lagged_speed).enumerate() {
            for state in [NO_REPLAY, REPLAY] {
                let mean = self.models[state].predict_row(&[1., lag]);
                // NaN speed propagates and is neutralised on fusion
                out.state_mut(t, state)[0] = Normal::new(mean, self.variance(state).sqrt())
                    .map_or(f64::NAN, |normal| normal.pdf(value));
            }
        }
        Ok(out)
    }
}
