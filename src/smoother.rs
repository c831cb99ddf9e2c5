//! Fixed-interval backward smoothing of the filtered posterior.

use crate::{
    diagnostics::{Diagnostic, DiagnosticSink, Stage},
    error::Result,
    filter::{Clamp, FilterOutput, StateSpace},
    math::{normalize, vector_dot},
    tensor::{StateTensor, NO_REPLAY, REPLAY},
};

/// Combine the filtered posterior with the smoothed posterior of the next
/// time step, reusing the filter's predictive distributions.
///
/// `smoothed[T-1] = filtered[T-1]` and, walking backwards,
/// `smoothed[t](s) ∝ filtered[t](s) * Σ_s' P(s' | s) smoothed[t+1](s') / predictive[t+1](s')`
/// with `0 / 0 = 0`.
pub fn smooth(
    space: &StateSpace<'_>,
    filtered: &FilterOutput,
    sink: &dyn DiagnosticSink,
) -> Result<StateTensor> {
    space.validate(&filtered.posterior)?;
    sink.emit(&Diagnostic::Stage(Stage::Smooth));
    let (n_time, n_bins) = (space.n_time(), space.n_bins());
    let mut smoothed = filtered.posterior.clone();
    if n_time == 0 {
        return Ok(smoothed);
    }

    let mut ratio = vec![0f64; 2 * n_bins];
    let mut backward_replay = vec![0f64; n_bins];
    for t in (0..n_time - 1).rev() {
        ratio
            .iter_mut()
            .zip(smoothed.time(t + 1))
            .zip(filtered.predictive.time(t + 1))
            .for_each(|((r, &s), &p)| *r = if p > 0. { s / p } else { 0. });
        let (ratio_0, ratio_1) = ratio.split_at(n_bins);

        // expected ratio after moving out of each bin while replaying
        backward_replay
            .iter_mut()
            .enumerate()
            .for_each(|(from, b)| *b = vector_dot(space.movement.row(from), ratio_1));
        // expected ratio after landing in no-replay, which does not depend
        // on the source bin
        let backward_no_replay = match space.clamp(t + 1) {
            Clamp::Bin(bin) => ratio_0[bin],
            Clamp::Interior => {
                let mut spread = vec![0f64; n_bins];
                space.spread(&mut spread, 1.);
                vector_dot(&spread, ratio_0)
            }
        };

        let matrix = space.replay_transition.get(t + 1);
        let current = smoothed.time_mut(t);
        for state in [NO_REPLAY, REPLAY] {
            current[state * n_bins..(state + 1) * n_bins]
                .iter_mut()
                .zip(&backward_replay)
                .for_each(|(x, &b)| {
                    *x *= matrix[state][NO_REPLAY] * backward_no_replay
                        + matrix[state][REPLAY] * b;
                });
        }
        if !(normalize(current) > 0.) {
            current.copy_from_slice(filtered.posterior.time(t));
        }
    }
    Ok(smoothed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diagnostics::TracingSink,
        filter::{
            filter,
            tests::{constant_transition, random_walk_kernel},
            InitialConditions,
        },
        movement::MovementKernel,
        replay_transition::ReplayTransitionSeries,
    };
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_likelihood(n_time: usize, n_bins: usize, seed: u64) -> StateTensor {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        StateTensor::from_fn(n_time, n_bins, |_, _, _| rng.random_range(0.05..1.0))
    }

    /// Brute-force marginals over every joint path of a tiny chain.
    fn enumerate_marginals(
        space: &StateSpace<'_>,
        likelihood: &StateTensor,
        initial: &[f64],
    ) -> StateTensor {
        let n_bins = space.n_bins();
        let n_states = 2 * n_bins;
        let n_time = space.n_time();
        let transition = |t: usize, from: usize, to: usize| {
            let matrix = space.replay_transition.get(t);
            let (r0, b0) = (from / n_bins, from % n_bins);
            let (r1, b1) = (to / n_bins, to % n_bins);
            if r1 == NO_REPLAY {
                let landing = match space.observed_bins[t] {
                    Some(bin) => (b1 == bin) as u8 as f64,
                    None => 1. / n_bins as f64,
                };
                matrix[r0][NO_REPLAY] * landing
            } else {
                matrix[r0][REPLAY] * space.movement.get(b0, b1)
            }
        };
        let mut marginals = StateTensor::zeros(n_time, n_bins);
        let total_paths = n_states.pow(n_time as u32);
        let mut path = vec![0usize; n_time];
        for index in 0..total_paths {
            let mut rest = index;
            for p in path.iter_mut() {
                *p = rest % n_states;
                rest /= n_states;
            }
            let mut weight = initial[path[0]] * likelihood.time(0)[path[0]];
            for t in 1..n_time {
                weight *= transition(t, path[t - 1], path[t]) * likelihood.time(t)[path[t]];
            }
            for (t, &s) in path.iter().enumerate() {
                marginals.time_mut(t)[s] += weight;
            }
        }
        for t in 0..n_time {
            normalize(marginals.time_mut(t));
        }
        marginals
    }

    #[test]
    fn matches_brute_force_enumeration() {
        let n_bins = 3;
        let n_time = 4;
        let kernel = random_walk_kernel(n_bins);
        let transition = constant_transition(n_time, 0.8, 0.7);
        let interior = vec![true; n_bins];
        let observed = vec![Some(0), Some(1), None, Some(2)];
        let space = StateSpace {
            movement: &kernel,
            replay_transition: &transition,
            observed_bins: &observed,
            is_interior: &interior,
            initial_conditions: InitialConditions::Uniform,
        };
        let likelihood = random_likelihood(n_time, n_bins, 9);
        let filtered = filter(&space, &likelihood, &TracingSink).unwrap();
        let smoothed = smooth(&space, &filtered, &TracingSink).unwrap();
        let expected = enumerate_marginals(&space, &likelihood, filtered.predictive.time(0));
        for (x, e) in smoothed.as_slice().iter().zip(expected.as_slice()) {
            assert_abs_diff_eq!(*x, *e, epsilon = 1e-10);
        }
    }

    #[test]
    fn identity_transitions_reproduce_the_likelihood() {
        let n_bins = 2;
        let n_time = 5;
        let kernel = MovementKernel::identity(n_bins);
        let transition = ReplayTransitionSeries::from_matrices(vec![[[1., 0.], [0., 1.]]; n_time]);
        let interior = vec![true; n_bins];
        let observed: Vec<Option<usize>> = (0..n_time).map(|t| Some(t % n_bins)).collect();
        let space = StateSpace {
            movement: &kernel,
            replay_transition: &transition,
            observed_bins: &observed,
            is_interior: &interior,
            initial_conditions: InitialConditions::Uniform,
        };

        // one path that stays in replay at bin 1, one that follows the animal
        let paths = [
            StateTensor::from_fn(n_time, n_bins, |_, s, b| {
                if s == REPLAY && b == 1 {
                    3.
                } else {
                    0.
                }
            }),
            StateTensor::from_fn(n_time, n_bins, |t, s, b| {
                if s == NO_REPLAY && b == t % n_bins {
                    0.5
                } else {
                    0.
                }
            }),
        ];
        for likelihood in paths {
            let filtered = filter(&space, &likelihood, &TracingSink).unwrap();
            let smoothed = smooth(&space, &filtered, &TracingSink).unwrap();
            assert!(filtered.fallback_times.is_empty());
            for t in 0..n_time {
                let mut expected = likelihood.time(t).to_vec();
                normalize(&mut expected);
                for ((f, s), e) in filtered
                    .posterior
                    .time(t)
                    .iter()
                    .zip(smoothed.time(t))
                    .zip(&expected)
                {
                    assert_abs_diff_eq!(*f, *e, epsilon = 1e-12);
                    assert_abs_diff_eq!(*s, *e, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn terminal_step_equals_filter_and_filter_is_untouched() {
        let n_bins = 6;
        let n_time = 30;
        let kernel = random_walk_kernel(n_bins);
        let transition = constant_transition(n_time, 0.95, 0.9);
        let interior = vec![true, true, true, false, true, true];
        let observed: Vec<Option<usize>> = (0..n_time)
            .map(|t| if t % 7 == 3 { None } else { Some(t % n_bins) })
            .collect();
        let space = StateSpace {
            movement: &kernel,
            replay_transition: &transition,
            observed_bins: &observed,
            is_interior: &interior,
            initial_conditions: InitialConditions::Uniform,
        };
        let likelihood = random_likelihood(n_time, n_bins, 4);
        let filtered = filter(&space, &likelihood, &TracingSink).unwrap();
        let before = filtered.posterior.clone();
        let smoothed = smooth(&space, &filtered, &TracingSink).unwrap();
        assert_eq!(filtered.posterior, before);
        assert_eq!(smoothed.time(n_time - 1), filtered.posterior.time(n_time - 1));
        for t in 0..n_time {
            let total: f64 = smoothed.time(t).iter().sum();
            assert_abs_diff_eq!(total, 1., epsilon = 1e-9);
            assert!(smoothed.time(t).iter().all(|&x| x >= 0.));
        }
    }
}
