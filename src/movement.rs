//! Place-bin transition kernels used while the replay indicator is on.

use faer::Mat;

use crate::{
    error::{ReplayError, Result},
    grid::PlaceGrid,
    math::{axpy, normalize, normalize_rows},
};

/// Which segments of a track are joined to each other.
///
/// Labels are arbitrary integers attached to the training samples;
/// a label is always connected to itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackTopology {
    pub connections: Vec<(i64, i64)>,
}

impl TrackTopology {
    fn connected(&self, a: i64, b: i64) -> bool {
        a == b
            || self
                .connections
                .iter()
                .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
    }
}

/// Policy used to build the movement kernel.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MovementModel {
    /// Transition counts between consecutive bins while the animal moves,
    /// taken to the power `replay_speed`.
    #[default]
    Empirical,
    /// Gaussian random walk with variance `movement_std^2 * replay_speed`.
    RandomWalk,
    /// Random walk that only crosses between connected track segments.
    TrackRandomWalk(TrackTopology),
}

/// Training data a movement policy may need.
pub struct MovementData<'a> {
    pub position: &'a Mat<f64>,
    pub speed: &'a [f64],
    pub track_labels: Option<&'a [i64]>,
}

#[derive(Debug, Clone, Copy)]
pub struct MovementParams {
    pub speed_threshold: f64,
    pub replay_speed: u32,
    pub movement_std: f64,
}

/// A time-invariant `n_bins x n_bins` stochastic kernel, stored row-major
/// with rows indexed by the source bin.
#[derive(Debug, Clone, PartialEq)]
pub struct MovementKernel {
    n_bins: usize,
    data: Box<[f64]>,
}

impl MovementKernel {
    /// Wrap a row-major matrix, zeroing non-interior rows and columns and
    /// renormalising interior rows.
    pub fn new(n_bins: usize, data: Vec<f64>, is_interior: &[bool]) -> Result<Self> {
        ReplayError::check_len("movement kernel", n_bins * n_bins, data.len())?;
        ReplayError::check_len("track interior mask", n_bins, is_interior.len())?;
        let mut kernel = Self {
            n_bins,
            data: data.into(),
        };
        kernel.restrict_to_interior(is_interior);
        Ok(kernel)
    }

    pub fn identity(n_bins: usize) -> Self {
        let mut data = vec![0f64; n_bins * n_bins];
        (0..n_bins).for_each(|i| data[i * n_bins + i] = 1.);
        Self {
            n_bins,
            data: data.into(),
        }
    }

    pub fn fit(
        model: &MovementModel,
        grid: &PlaceGrid,
        data: &MovementData<'_>,
        params: MovementParams,
    ) -> Result<Self> {
        let n_time = data.position.nrows();
        ReplayError::check_len("speed", n_time, data.speed.len())?;
        let raw = match model {
            MovementModel::Empirical => empirical(grid, data, params)?,
            MovementModel::RandomWalk => random_walk(grid, params, |_, _| true),
            MovementModel::TrackRandomWalk(topology) => {
                let labels = data.track_labels.ok_or(ReplayError::Grid(
                    "track labels are required for the track random walk".into(),
                ))?;
                ReplayError::check_len("track labels", n_time, labels.len())?;
                let bin_labels = bin_labels(grid, data.position, labels)?;
                random_walk(grid, params, |from, to| {
                    if from == to {
                        return true;
                    }
                    match (bin_labels[from], bin_labels[to]) {
                        (Some(a), Some(b)) => topology.connected(a, b),
                        _ => false,
                    }
                })
            }
        };
        Self::new(grid.n_bins(), raw, grid.is_interior())
    }

    fn restrict_to_interior(&mut self, is_interior: &[bool]) {
        let n = self.n_bins;
        for (from, row) in self.data.chunks_exact_mut(n).enumerate() {
            if !is_interior[from] {
                row.fill(0.);
                continue;
            }
            row.iter_mut()
                .zip(is_interior)
                .filter(|(_, &interior)| !interior)
                .for_each(|(value, _)| *value = 0.);
            if !(normalize(row) > 0.) {
                row.fill(0.);
                row[from] = 1.;
            }
        }
    }

    pub fn n_bins(&self) -> usize {
        self.n_bins
    }

    /// Transition probabilities out of bin `from`.
    pub fn row(&self, from: usize) -> &[f64] {
        &self.data[from * self.n_bins..(from + 1) * self.n_bins]
    }

    pub fn get(&self, from: usize, to: usize) -> f64 {
        self.data[from * self.n_bins + to]
    }

    /// `out[j] += sum_i weights[i] * K[i, j]`.
    pub(crate) fn propagate(&self, weights: &[f64], out: &mut [f64]) {
        weights
            .iter()
            .enumerate()
            .filter(|(_, &w)| w != 0.)
            .for_each(|(from, &w)| axpy(self.row(from), out, w));
    }

    pub fn to_mat(&self) -> Mat<f64> {
        Mat::from_fn(self.n_bins, self.n_bins, |i, j| self.get(i, j))
    }
}

fn empirical(
    grid: &PlaceGrid,
    data: &MovementData<'_>,
    params: MovementParams,
) -> Result<Vec<f64>> {
    let n = grid.n_bins();
    let bins = grid.observed_bins(data.position)?;
    let is_moving = data
        .speed
        .iter()
        .map(|&s| s > params.speed_threshold)
        .collect::<Vec<_>>();

    let mut counts = vec![0f64; n * n];
    for t in 1..bins.len() {
        if !(is_moving[t] && is_moving[t - 1]) {
            continue;
        }
        if let (Some(from), Some(to)) = (bins[t - 1], bins[t]) {
            counts[from * n + to] += 1.;
        }
    }
    normalize_rows(&mut counts, n);
    // empty rows stay in place so that the power below stays stochastic
    counts.chunks_exact_mut(n).enumerate().for_each(|(from, row)| {
        if row.iter().all(|&x| x == 0.) {
            row[from] = 1.;
        }
    });

    let step = Mat::from_fn(n, n, |i, j| counts[i * n + j]);
    let power = matrix_power(step, params.replay_speed.max(1));
    Ok((0..n * n).map(|k| power[(k / n, k % n)]).collect())
}

fn matrix_power(base: Mat<f64>, exponent: u32) -> Mat<f64> {
    let n = base.nrows();
    let mut result = Mat::from_fn(n, n, |i, j| if i == j { 1. } else { 0. });
    let mut base = base;
    let mut exponent = exponent;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = &result * &base;
        }
        exponent >>= 1;
        if exponent > 0 {
            base = &base * &base;
        }
    }
    result
}

fn random_walk(
    grid: &PlaceGrid,
    params: MovementParams,
    allowed: impl Fn(usize, usize) -> bool,
) -> Vec<f64> {
    let n = grid.n_bins();
    let centers = grid.centers();
    let variance = params.movement_std.powi(2) * params.replay_speed.max(1) as f64;
    let mut data = vec![0f64; n * n];
    for from in 0..n {
        for to in 0..n {
            if !allowed(from, to) {
                continue;
            }
            let sq_dist: f64 = (0..grid.n_dims())
                .map(|dim| (centers[(to, dim)] - centers[(from, dim)]).powi(2))
                .sum();
            data[from * n + to] = (-0.5 * sq_dist / variance).exp();
        }
    }
    data
}

/// Most frequent training label among samples falling in each bin.
fn bin_labels(grid: &PlaceGrid, position: &Mat<f64>, labels: &[i64]) -> Result<Vec<Option<i64>>> {
    let bins = grid.observed_bins(position)?;
    let mut counts: Vec<Vec<(i64, usize)>> = vec![Vec::new(); grid.n_bins()];
    for (bin, &label) in bins.iter().zip(labels) {
        let Some(bin) = *bin else { continue };
        match counts[bin].iter_mut().find(|(l, _)| *l == label) {
            Some((_, count)) => *count += 1,
            None => counts[bin].push((label, 1)),
        }
    }
    Ok(counts
        .into_iter()
        .map(|c| {
            c.into_iter()
                .max_by_key(|&(label, count)| (count, std::cmp::Reverse(label)))
                .map(|(label, _)| label)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::column;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn params() -> MovementParams {
        MovementParams {
            speed_threshold: 4.,
            replay_speed: 3,
            movement_std: 1.,
        }
    }

    fn check_stochastic(kernel: &MovementKernel, is_interior: &[bool]) {
        for from in 0..kernel.n_bins() {
            let total: f64 = kernel.row(from).iter().sum();
            if is_interior[from] {
                assert_abs_diff_eq!(total, 1., epsilon = 1e-10);
            } else {
                assert_eq!(total, 0.);
            }
            for to in 0..kernel.n_bins() {
                assert!(kernel.get(from, to) >= 0.);
                if !is_interior[to] {
                    assert_eq!(kernel.get(from, to), 0.);
                }
            }
        }
    }

    fn track() -> (Mat<f64>, Vec<f64>, Vec<i64>) {
        let position: Vec<f64> = (0..200).map(|t| (t % 20) as f64 * 0.5).collect();
        let speed = vec![10.; 200];
        let labels = position.iter().map(|&x| if x < 5. { 0 } else { 1 }).collect();
        (column(&position), speed, labels)
    }

    #[test]
    fn all_policies_are_stochastic_on_the_interior() {
        let (position, speed, labels) = track();
        let grid = PlaceGrid::from_edges(vec![(0..=10).map(|x| x as f64).collect()]);
        let mut mask = vec![true; 10];
        mask[3] = false;
        mask[9] = false;
        let grid = grid.with_interior(mask.clone()).unwrap();
        let data = MovementData {
            position: &position,
            speed: &speed,
            track_labels: Some(&labels),
        };
        let topology = TrackTopology {
            connections: vec![],
        };
        for model in [
            MovementModel::Empirical,
            MovementModel::RandomWalk,
            MovementModel::TrackRandomWalk(topology),
        ] {
            let kernel = MovementKernel::fit(&model, &grid, &data, params()).unwrap();
            check_stochastic(&kernel, &mask);
        }
    }

    #[test]
    fn track_walk_does_not_cross_unconnected_segments() {
        let (position, speed, labels) = track();
        let grid = PlaceGrid::from_edges(vec![(0..=10).map(|x| x as f64).collect()]);
        let data = MovementData {
            position: &position,
            speed: &speed,
            track_labels: Some(&labels),
        };
        let split = MovementKernel::fit(
            &MovementModel::TrackRandomWalk(TrackTopology::default()),
            &grid,
            &data,
            params(),
        )
        .unwrap();
        assert_eq!(split.get(4, 5), 0.);
        assert!(split.get(4, 3) > 0.);

        let joined = MovementKernel::fit(
            &MovementModel::TrackRandomWalk(TrackTopology {
                connections: vec![(0, 1)],
            }),
            &grid,
            &data,
            params(),
        )
        .unwrap();
        assert!(joined.get(4, 5) > 0.);
    }

    #[test]
    fn track_walk_requires_labels() {
        let (position, speed, _) = track();
        let grid = PlaceGrid::from_edges(vec![(0..=10).map(|x| x as f64).collect()]);
        let data = MovementData {
            position: &position,
            speed: &speed,
            track_labels: None,
        };
        let model = MovementModel::TrackRandomWalk(TrackTopology::default());
        assert!(MovementKernel::fit(&model, &grid, &data, params()).is_err());
    }

    #[test]
    fn empirical_power_spreads_transitions() {
        // a deterministic walk 0 -> 1 -> 2 -> 0 ...
        let position: Vec<f64> = (0..30).map(|t| (t % 3) as f64 + 0.5).collect();
        let speed = vec![10.; 30];
        let grid = PlaceGrid::from_edges(vec![vec![0., 1., 2., 3.]]);
        let position = column(&position);
        let data = MovementData {
            position: &position,
            speed: &speed,
            track_labels: None,
        };
        let mut p = params();
        p.replay_speed = 2;
        let kernel = MovementKernel::fit(&MovementModel::Empirical, &grid, &data, p).unwrap();
        assert_abs_diff_eq!(kernel.get(0, 2), 1.);
        assert_abs_diff_eq!(kernel.get(1, 0), 1.);
    }

    #[test]
    fn propagate_is_a_vector_matrix_product() {
        let kernel = MovementKernel::new(2, vec![0.5, 0.5, 0.25, 0.75], &[true, true]).unwrap();
        let mut out = vec![0.; 2];
        kernel.propagate(&[1., 2.], &mut out);
        assert_abs_diff_eq!(out[0], 1.);
        assert_abs_diff_eq!(out[1], 2.);
        assert_eq!(kernel.to_mat()[(1, 1)], 0.75);
    }

    proptest! {
        #[test]
        fn random_walk_rows_sum_to_one(std in 0.01f64..20., n in 1usize..15) {
            let grid = PlaceGrid::from_edges(vec![(0..=n).map(|x| x as f64).collect()]);
            let position = column(&[0.]);
            let data = MovementData { position: &position, speed: &[0.], track_labels: None };
            let params = MovementParams { speed_threshold: 4., replay_speed: 20, movement_std: std };
            let kernel = MovementKernel::fit(&MovementModel::RandomWalk, &grid, &data, params).unwrap();
            for from in 0..n {
                let total: f64 = kernel.row(from).iter().sum();
                prop_assert!((total - 1.).abs() < 1e-10);
            }
        }
    }
}
