//! Probability of entering or staying in replay given the previous state
//! and the previous speed.

use faer::Mat;

use crate::{
    diagnostics::{Diagnostic, DiagnosticSink},
    error::{ReplayError, Result},
    glm::{self, Family, FittedGlm, GlmOptions},
    math::lagged,
    spline::NaturalCubicSpline,
};

/// Bounds applied to every transition probability.
const MIN_TRANSITION: f64 = 1e-10;

/// Speeds above this value define the last default spline knot.
const FAST_SPEED: f64 = 10.;

/// Default knots for lagged speed: `[1, 2, 3]` followed by the median of the
/// speeds above 10 when there are any.
pub fn default_speed_knots(speed: &[f64]) -> Vec<f64> {
    let mut knots = vec![1., 2., 3.];
    let mut fast = speed
        .iter()
        .copied()
        .filter(|&s| s > FAST_SPEED)
        .collect::<Vec<_>>();
    if !fast.is_empty() {
        fast.sort_by(f64::total_cmp);
        let mid = fast.len() / 2;
        let median = if fast.len() % 2 == 0 {
            (fast[mid - 1] + fast[mid]) / 2.
        } else {
            fast[mid]
        };
        if median > 3. {
            knots.push(median);
        }
    }
    knots
}

/// Fitted logistic model of the replay indicator on its own lag and a
/// spline of lagged speed.
#[derive(Debug, Clone)]
pub struct ReplayTransition {
    spline: Option<NaturalCubicSpline>,
    model: FittedGlm,
}

/// Per-time 2x2 replay transition matrices, `matrix[from][to]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayTransitionSeries {
    matrices: Vec<[[f64; 2]; 2]>,
}

impl ReplayTransitionSeries {
    pub fn from_matrices(matrices: Vec<[[f64; 2]; 2]>) -> Self {
        Self { matrices }
    }

    pub fn len(&self) -> usize {
        self.matrices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    pub fn get(&self, t: usize) -> &[[f64; 2]; 2] {
        &self.matrices[t]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[[f64; 2]; 2]> {
        self.matrices.iter()
    }
}

impl ReplayTransition {
    pub fn fit(
        speed: &[f64],
        is_replay: &[bool],
        penalty: f64,
        knots: Option<&[f64]>,
        sink: &dyn DiagnosticSink,
    ) -> Result<Self> {
        ReplayError::check_len("replay labels", speed.len(), is_replay.len())?;
        if !is_replay.iter().any(|&r| r) {
            sink.emit(&Diagnostic::NoReplayTraining);
        }

        let lagged_speed = lagged(speed);
        let lagged_replay = lagged(
            &is_replay
                .iter()
                .map(|&r| if r { 1. } else { 0. })
                .collect::<Vec<_>>(),
        );
        let knots = match knots {
            Some(knots) => knots.to_vec(),
            None => default_speed_knots(speed),
        };
        let spline = NaturalCubicSpline::fit(&lagged_speed, &knots);

        let n_cols = 2 + spline.as_ref().map_or(0, |s| s.n_basis());
        let mut design = Mat::<f64>::zeros(speed.len(), n_cols);
        let mut row = vec![0f64; n_cols];
        for t in 0..speed.len() {
            fill_row(spline.as_ref(), lagged_replay[t], lagged_speed[t], &mut row);
            row.iter()
                .enumerate()
                .for_each(|(j, &x)| design[(t, j)] = x);
        }
        let targets = is_replay
            .iter()
            .map(|&r| if r { 1. } else { 0. })
            .collect::<Vec<_>>();
        let mut penalties = vec![penalty; n_cols];
        penalties[0] = 0.;

        let model = glm::fit(
            &design,
            &targets,
            &penalties,
            Family::Binomial,
            GlmOptions::default(),
        )?;
        Ok(Self { spline, model })
    }

    /// `P(replay_t | replay_{t-1} = was_replay, speed_{t-1} = lagged_speed)`
    /// before clipping. Non-finite speed is treated as zero.
    pub fn replay_probability(&self, was_replay: bool, lagged_speed: f64) -> f64 {
        let speed = if lagged_speed.is_finite() {
            lagged_speed
        } else {
            0.
        };
        let mut row = vec![0f64; self.model.coefficients().len()];
        fill_row(
            self.spline.as_ref(),
            if was_replay { 1. } else { 0. },
            speed,
            &mut row,
        );
        let eta: f64 = row
            .iter()
            .zip(self.model.coefficients())
            .map(|(x, b)| x * b)
            .sum();
        1. / (1. + (-eta).exp())
    }

    /// Transition matrices for every time of `speed`, using the lagged
    /// speed at each time.
    pub fn evaluate(&self, speed: &[f64], sink: &dyn DiagnosticSink) -> ReplayTransitionSeries {
        let mut clipped = 0;
        let mut clip = |p: f64| {
            let bounded = if p.is_nan() {
                0.5
            } else {
                p.clamp(MIN_TRANSITION, 1. - MIN_TRANSITION)
            };
            if bounded != p {
                clipped += 1;
            }
            bounded
        };
        let matrices = lagged(speed)
            .into_iter()
            .map(|lag| {
                let p0 = clip(self.replay_probability(false, lag));
                let p1 = clip(self.replay_probability(true, lag));
                [[1. - p0, p0], [1. - p1, p1]]
            })
            .collect();
        if clipped > 0 {
            sink.emit(&Diagnostic::ClippedTransition { count: clipped });
        }
        ReplayTransitionSeries { matrices }
    }
}

fn fill_row(
    spline: Option<&NaturalCubicSpline>,
    lagged_replay: f64,
    lagged_speed: f64,
    row: &mut [f64],
) {
    row[0] = 1.;
    row[1] = lagged_replay;
    if let Some(spline) = spline {
        spline.basis(lagged_speed, &mut row[2..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{CollectingSink, TracingSink};
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// Slow periods that tend to persist in replay.
    fn session(n: usize, seed: u64) -> (Vec<f64>, Vec<bool>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut speed = Vec::with_capacity(n);
        let mut is_replay = Vec::with_capacity(n);
        let mut replay = false;
        let mut current = 10.;
        for _ in 0..n {
            let previous = current;
            current = (current + rng.random_range(-3.0..3.0f64)).clamp(0., 40.);
            let p = match (replay, previous < 4.) {
                (true, _) => 0.9,
                (false, true) => 0.1,
                (false, false) => 0.001,
            };
            replay = rng.random::<f64>() < p;
            speed.push(current);
            is_replay.push(replay);
        }
        (speed, is_replay)
    }

    #[test]
    fn default_knots() {
        assert_eq!(default_speed_knots(&[0., 1., 5.]), vec![1., 2., 3.]);
        assert_eq!(default_speed_knots(&[11., 13., 20., 0.]), vec![1., 2., 3., 13.]);
        assert_eq!(default_speed_knots(&[11., 13.]), vec![1., 2., 3., 12.]);
    }

    #[test]
    fn replay_persists_and_starts_when_slow() {
        let (speed, is_replay) = session(6000, 1);
        let model = ReplayTransition::fit(&speed, &is_replay, 1e-5, None, &TracingSink).unwrap();
        assert!(model.replay_probability(true, 2.) > 0.5);
        assert!(model.replay_probability(false, 1.) > model.replay_probability(false, 30.));
        assert!(model.replay_probability(false, 30.) < 0.05);
    }

    #[test]
    fn evaluation_rows_are_stochastic_and_lagged() {
        let (speed, is_replay) = session(2000, 2);
        let model = ReplayTransition::fit(&speed, &is_replay, 1e-5, None, &TracingSink).unwrap();
        let series = model.evaluate(&[f64::NAN, 50., 0.], &TracingSink);
        assert_eq!(series.len(), 3);
        // time 0 uses the zero lag, time 1 the NaN speed treated as zero
        assert_eq!(series.get(0), series.get(1));
        for matrix in series.iter() {
            for row in matrix {
                assert!((row[0] + row[1] - 1.).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn no_replay_in_training_is_reported() {
        let sink = CollectingSink::new();
        let speed: Vec<f64> = (0..200).map(|i| (i % 20) as f64).collect();
        let model = ReplayTransition::fit(&speed, &[false; 200], 1e-5, None, &sink).unwrap();
        assert!(sink.events().contains(&Diagnostic::NoReplayTraining));
        let series = model.evaluate(&speed, &sink);
        assert!(series.iter().all(|m| m[0][1] < 1e-3));
    }

    #[test]
    fn label_length_mismatch() {
        assert!(ReplayTransition::fit(&[1., 2.], &[true], 1e-5, None, &TracingSink).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn any_speed_gives_stochastic_rows(speeds in proptest::collection::vec(-1e6f64..1e6, 1..30)) {
            let (speed, is_replay) = session(500, 3);
            let model = ReplayTransition::fit(&speed, &is_replay, 1e-5, None, &TracingSink).unwrap();
            let series = model.evaluate(&speeds, &TracingSink);
            for matrix in series.iter() {
                for row in matrix {
                    prop_assert!(row.iter().all(|p| p.is_finite() && *p > 0. && *p < 1.));
                    prop_assert!((row[0] + row[1] - 1.).abs() < 1e-12);
                }
            }
        }
    }
}
