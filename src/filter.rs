//! Forward filter over the joint (replay state, place bin) chain.
//!
//! While the replay indicator is off the place bin is pinned to the
//! observed position. While it is on, the place bin moves according to the
//! movement kernel. The replay indicator itself switches according to the
//! per-time replay transition matrices.

use crate::{
    diagnostics::{Diagnostic, DiagnosticSink, Stage},
    error::{ReplayError, Result},
    math::{multiply, normalize, scale},
    movement::MovementKernel,
    replay_transition::ReplayTransitionSeries,
    tensor::{StateTensor, NO_REPLAY, N_STATES, REPLAY},
};

/// Distribution over the joint state before the first observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialConditions {
    /// Equal mass on both replay states and every interior bin.
    #[default]
    Uniform,
    /// All mass on the no-replay state at the first observed bin.
    ObservedPosition,
}

/// The fixed inputs of the recursion.
#[derive(Debug, Clone, Copy)]
pub struct StateSpace<'a> {
    pub movement: &'a MovementKernel,
    /// Transition matrices; entry `t` moves the chain from `t - 1` to `t`.
    pub replay_transition: &'a ReplayTransitionSeries,
    /// Observed place bin at every time, `None` where position is missing.
    pub observed_bins: &'a [Option<usize>],
    pub is_interior: &'a [bool],
    pub initial_conditions: InitialConditions,
}

#[derive(Debug, Clone)]
pub struct FilterOutput {
    /// Normalised filtered posterior.
    pub posterior: StateTensor,
    /// One-step predictive distribution (for `t = 0`, the initial
    /// distribution).
    pub predictive: StateTensor,
    pub replay_probability: Vec<f64>,
    /// `ln` of the mass of predictive times likelihood at every time;
    /// `-inf` where the likelihood had no mass.
    pub log_normalizers: Vec<f64>,
    /// Times at which the posterior fell back to the predictive distribution.
    pub fallback_times: Vec<usize>,
}

impl StateSpace<'_> {
    pub fn n_bins(&self) -> usize {
        self.is_interior.len()
    }

    pub fn n_time(&self) -> usize {
        self.observed_bins.len()
    }

    pub(crate) fn validate(&self, likelihood: &StateTensor) -> Result<()> {
        let n_bins = self.n_bins();
        ReplayError::check_len("movement kernel bins", n_bins, self.movement.n_bins())?;
        ReplayError::check_len("likelihood bins", n_bins, likelihood.n_bins())?;
        ReplayError::check_len("likelihood times", self.n_time(), likelihood.n_time())?;
        ReplayError::check_len("replay transitions", self.n_time(), self.replay_transition.len())?;
        if self.observed_bins.iter().flatten().any(|&bin| bin >= n_bins) {
            return Err(ReplayError::Grid("observed bin outside the place grid".into()));
        }
        if !self.is_interior.iter().any(|&x| x) {
            return Err(ReplayError::Grid("no interior place bins".into()));
        }
        Ok(())
    }

    /// Where the no-replay mass lands at time `t`: the observed bin, or
    /// every interior bin equally when the position is missing.
    pub(crate) fn clamp(&self, t: usize) -> Clamp {
        match self.observed_bins[t] {
            Some(bin) => Clamp::Bin(bin),
            None => Clamp::Interior,
        }
    }

    fn initial(&self) -> Vec<f64> {
        let n_bins = self.n_bins();
        let mut prior = vec![0f64; N_STATES * n_bins];
        match (self.initial_conditions, self.observed_bins.first()) {
            (InitialConditions::ObservedPosition, Some(&Some(bin))) => {
                prior[NO_REPLAY * n_bins + bin] = 1.;
            }
            (InitialConditions::ObservedPosition, _) => {
                self.spread(&mut prior[NO_REPLAY * n_bins..(NO_REPLAY + 1) * n_bins], 1.);
            }
            (InitialConditions::Uniform, _) => {
                for state in 0..N_STATES {
                    self.spread(&mut prior[state * n_bins..(state + 1) * n_bins], 1.);
                }
                scale(&mut prior, 1. / N_STATES as f64);
            }
        }
        prior
    }

    pub(crate) fn spread(&self, out: &mut [f64], mass: f64) {
        let n_interior = self.is_interior.iter().filter(|&&x| x).count() as f64;
        out.iter_mut()
            .zip(self.is_interior)
            .filter(|(_, &interior)| interior)
            .for_each(|(x, _)| *x = mass / n_interior);
    }

    /// One-step prediction of the joint distribution at `t` from the
    /// posterior at `t - 1`.
    pub(crate) fn predict(&self, t: usize, previous: &[f64], out: &mut [f64]) {
        let n_bins = self.n_bins();
        let matrix = self.replay_transition.get(t);
        let (previous_0, previous_1) = previous.split_at(n_bins);
        let (out_0, out_1) = out.split_at_mut(n_bins);

        let mass = |to: usize| -> f64 {
            matrix[NO_REPLAY][to] * previous_0.iter().sum::<f64>()
                + matrix[REPLAY][to] * previous_1.iter().sum::<f64>()
        };

        out_0.fill(0.);
        match self.clamp(t) {
            Clamp::Bin(bin) => out_0[bin] = mass(NO_REPLAY),
            Clamp::Interior => self.spread(out_0, mass(NO_REPLAY)),
        }

        let weights = previous_0
            .iter()
            .zip(previous_1)
            .map(|(p0, p1)| matrix[NO_REPLAY][REPLAY] * p0 + matrix[REPLAY][REPLAY] * p1)
            .collect::<Vec<_>>();
        out_1.fill(0.);
        self.movement.propagate(&weights, out_1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Clamp {
    Bin(usize),
    Interior,
}

/// Run the forward recursion over a fused likelihood.
pub fn filter(
    space: &StateSpace<'_>,
    likelihood: &StateTensor,
    sink: &dyn DiagnosticSink,
) -> Result<FilterOutput> {
    space.validate(likelihood)?;
    sink.emit(&Diagnostic::Stage(Stage::Filter));
    let (n_time, n_bins) = (space.n_time(), space.n_bins());
    let mut posterior = StateTensor::zeros(n_time, n_bins);
    let mut predictive = StateTensor::zeros(n_time, n_bins);
    let mut log_normalizers = Vec::with_capacity(n_time);
    let mut fallback_times = Vec::new();
    let mut prior = space.initial();

    for t in 0..n_time {
        if t > 0 {
            space.predict(t, posterior.time(t - 1), &mut prior);
        }
        predictive.time_mut(t).copy_from_slice(&prior);

        let current = posterior.time_mut(t);
        multiply(&prior, likelihood.time(t), current);
        let total = normalize(current);
        if total > 0. && total.is_finite() {
            log_normalizers.push(total.ln());
        } else {
            current.copy_from_slice(&prior);
            if !(normalize(current) > 0.) {
                return Err(ReplayError::Numerical {
                    time: t,
                    reason: "predictive distribution has no mass",
                });
            }
            sink.emit(&Diagnostic::ZeroLikelihood { time: t });
            log_normalizers.push(f64::NEG_INFINITY);
            fallback_times.push(t);
        }
    }

    Ok(FilterOutput {
        replay_probability: posterior.replay_probability(),
        posterior,
        predictive,
        log_normalizers,
        fallback_times,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::diagnostics::{CollectingSink, TracingSink};
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    /// Replay transition series with constant stay probabilities.
    pub(crate) fn constant_transition(
        n_time: usize,
        stay_out: f64,
        stay_in: f64,
    ) -> ReplayTransitionSeries {
        ReplayTransitionSeries::from_matrices(vec![
            [[stay_out, 1. - stay_out], [1. - stay_in, stay_in]];
            n_time
        ])
    }

    pub(crate) fn random_walk_kernel(n_bins: usize) -> MovementKernel {
        let mut data = vec![0f64; n_bins * n_bins];
        for i in 0..n_bins {
            for j in 0..n_bins {
                data[i * n_bins + j] = (-((i as f64 - j as f64).powi(2)) / 2.).exp();
            }
        }
        MovementKernel::new(n_bins, data, &vec![true; n_bins]).unwrap()
    }

    #[test]
    fn one_hot_likelihood_is_reproduced() {
        let n_time = 6;
        let n_bins = 4;
        let kernel = MovementKernel::identity(n_bins);
        let transition = constant_transition(n_time, 0.9, 0.9);
        let interior = vec![true; n_bins];
        // replay while the animal sits in bin 0..3, decoding bin 2
        let observed: Vec<Option<usize>> = (0..n_time).map(|t| Some(t % n_bins)).collect();
        let likelihood = StateTensor::from_fn(n_time, n_bins, |t, s, b| {
            let replay = t >= 3;
            match (replay, s, b) {
                (true, REPLAY, 2) => 1.,
                (false, NO_REPLAY, b) if b == t % n_bins => 1.,
                _ => 0.,
            }
        });
        let space = StateSpace {
            movement: &kernel,
            replay_transition: &transition,
            observed_bins: &observed,
            is_interior: &interior,
            initial_conditions: InitialConditions::Uniform,
        };
        let output = filter(&space, &likelihood, &TracingSink).unwrap();
        assert!(output.fallback_times.is_empty());
        for (x, l) in output.posterior.as_slice().iter().zip(likelihood.as_slice()) {
            assert_abs_diff_eq!(*x, *l, epsilon = 1e-12);
        }
        assert_eq!(output.replay_probability, vec![0., 0., 0., 1., 1., 1.]);
    }

    #[test]
    fn zero_likelihood_falls_back_to_prior() {
        let n_bins = 5;
        let kernel = random_walk_kernel(n_bins);
        let transition = constant_transition(3, 0.95, 0.8);
        let interior = vec![true; n_bins];
        let observed = vec![Some(1), Some(2), None];
        let mut likelihood = StateTensor::ones(3, n_bins);
        likelihood.time_mut(1).fill(0.);
        let space = StateSpace {
            movement: &kernel,
            replay_transition: &transition,
            observed_bins: &observed,
            is_interior: &interior,
            initial_conditions: InitialConditions::Uniform,
        };
        let sink = CollectingSink::new();
        let output = filter(&space, &likelihood, &sink).unwrap();
        assert_eq!(output.fallback_times, vec![1]);
        assert!(sink.events().contains(&Diagnostic::ZeroLikelihood { time: 1 }));
        assert!(output.posterior.as_slice().iter().all(|x| x.is_finite()));
        assert_eq!(output.log_normalizers[1], f64::NEG_INFINITY);
        let predictive_sum: f64 = output.predictive.time(1).iter().sum();
        for (post, pred) in output.posterior.time(1).iter().zip(output.predictive.time(1)) {
            assert_abs_diff_eq!(*post, pred / predictive_sum, epsilon = 1e-12);
        }
        // missing position spreads the no-replay mass over interior bins
        let no_replay = output.predictive.state(2, NO_REPLAY);
        assert!(no_replay.iter().all(|&x| (x - no_replay[0]).abs() < 1e-15 && x > 0.));
    }

    #[test]
    fn observed_position_start() {
        let n_bins = 3;
        let kernel = random_walk_kernel(n_bins);
        let transition = constant_transition(2, 0.9, 0.9);
        let interior = vec![true; n_bins];
        let observed = vec![Some(2), Some(2)];
        let space = StateSpace {
            movement: &kernel,
            replay_transition: &transition,
            observed_bins: &observed,
            is_interior: &interior,
            initial_conditions: InitialConditions::ObservedPosition,
        };
        let output = filter(&space, &StateTensor::ones(2, n_bins), &TracingSink).unwrap();
        assert_eq!(output.posterior.time(0), &[0., 0., 1., 0., 0., 0.]);
        assert_abs_diff_eq!(output.replay_probability[1], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn shape_mismatch() {
        let kernel = MovementKernel::identity(3);
        let transition = constant_transition(2, 0.9, 0.9);
        let interior = vec![true; 3];
        let observed = vec![Some(0), Some(5)];
        let space = StateSpace {
            movement: &kernel,
            replay_transition: &transition,
            observed_bins: &observed,
            is_interior: &interior,
            initial_conditions: InitialConditions::Uniform,
        };
        assert!(filter(&space, &StateTensor::ones(2, 4), &TracingSink).is_err());
        assert!(filter(&space, &StateTensor::ones(2, 3), &TracingSink).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn posterior_is_normalised(
            values in proptest::collection::vec(0f64..1., 2 * 6 * 5),
            observed in proptest::collection::vec(proptest::option::of(0usize..5), 6),
            stay_out in 0.5f64..0.999,
            stay_in in 0.5f64..0.999,
        ) {
            let kernel = random_walk_kernel(5);
            let transition = constant_transition(6, stay_out, stay_in);
            let interior = vec![true, true, false, true, true];
            let space = StateSpace {
                movement: &kernel,
                replay_transition: &transition,
                observed_bins: &observed,
                is_interior: &interior,
                initial_conditions: InitialConditions::Uniform,
            };
            let likelihood = StateTensor::from_vec(6, 5, values).unwrap();
            let output = filter(&space, &likelihood, &TracingSink).unwrap();
            for t in 0..6 {
                let total: f64 = output.posterior.time(t).iter().sum();
                prop_assert!((total - 1.).abs() < 1e-9);
                prop_assert!(output.posterior.time(t).iter().all(|&x| (0. ..=1.).contains(&x)));
                let p = output.replay_probability[t];
                prop_assert!((0. ..=1.).contains(&p));
            }
        }
    }
}
