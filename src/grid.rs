//! Discretisation of the track into place bins.

use faer::Mat;

use crate::{
    diagnostics::{Diagnostic, DiagnosticSink},
    error::{ReplayError, Result},
};

/// How the place grid is sized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    /// Width of a place bin in position units.
    pub bin_size: Option<f64>,
    /// Number of bins per position dimension.
    pub n_bins: Option<usize>,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            bin_size: Some(2.0),
            n_bins: None,
        }
    }
}

/// The ordered, immutable set of place bins.
///
/// Bins of multi-dimensional grids are raveled with the first dimension
/// varying slowest.
#[derive(Debug, Clone)]
pub struct PlaceGrid {
    edges: Vec<Vec<f64>>,
    centers: Mat<f64>,
    is_interior: Vec<bool>,
}

impl PlaceGrid {
    /// Build the grid spanning the extent of `position` (`n_time x n_dims`,
    /// NaN rows ignored).
    pub fn from_positions(
        position: &Mat<f64>,
        spec: GridSpec,
        sink: &dyn DiagnosticSink,
    ) -> Result<Self> {
        let n_dims = position.ncols();
        if n_dims == 0 {
            return Err(ReplayError::Grid("positions have no dimensions".into()));
        }

        if spec.bin_size.is_some() && spec.n_bins.is_some() {
            sink.emit(&Diagnostic::ConflictingSettings {
                used: "place_bin_size",
                ignored: "n_place_bins",
            });
        }

        let valid_rows = (0..position.nrows())
            .filter(|&row| (0..n_dims).all(|dim| position[(row, dim)].is_finite()))
            .collect::<Vec<_>>();

        let mut edges = Vec::with_capacity(n_dims);
        for dim in 0..n_dims {
            let (min, max) = valid_rows.iter().fold(
                (f64::INFINITY, f64::NEG_INFINITY),
                |(min, max), &row| {
                    let value = position[(row, dim)];
                    (min.min(value), max.max(value))
                },
            );
            if !(min.is_finite() && max.is_finite()) {
                return Err(ReplayError::Grid("no finite training positions".into()));
            }
            let n = match (spec.bin_size, spec.n_bins) {
                (Some(size), _) => {
                    if !(size > 0.) {
                        return Err(ReplayError::Grid(format!("invalid bin size {size}")));
                    }
                    ((max - min) / size).ceil() as usize
                }
                (None, Some(n)) => n,
                (None, None) => {
                    return Err(ReplayError::Grid(
                        "either a bin size or a bin count is required".into(),
                    ))
                }
            };
            if n == 0 {
                return Err(ReplayError::Grid(format!(
                    "position range [{min}, {max}] of dimension {dim} yields zero bins"
                )));
            }
            let width = (max - min) / n as f64;
            edges.push((0..=n).map(|i| min + width * i as f64).collect());
        }

        Ok(Self::from_edges(edges))
    }

    /// Build a grid from explicit, increasing per-dimension edges.
    pub fn from_edges(edges: Vec<Vec<f64>>) -> Self {
        let shape: Vec<usize> = edges.iter().map(|e| e.len().saturating_sub(1)).collect();
        let n_bins: usize = shape.iter().product();
        let n_dims = edges.len();

        let centers = Mat::from_fn(n_bins, n_dims, |bin, dim| {
            let index = unravel(bin, &shape)[dim];
            0.5 * (edges[dim][index] + edges[dim][index + 1])
        });

        Self {
            edges,
            centers,
            is_interior: vec![true; n_bins],
        }
    }

    /// Restrict the reachable bins. `mask` must have one entry per bin.
    pub fn with_interior(mut self, mask: Vec<bool>) -> Result<Self> {
        ReplayError::check_len("track interior mask", self.n_bins(), mask.len())?;
        self.is_interior = mask;
        Ok(self)
    }

    pub fn n_bins(&self) -> usize {
        self.centers.nrows()
    }

    pub fn n_dims(&self) -> usize {
        self.edges.len()
    }

    pub fn edges(&self) -> &[Vec<f64>] {
        &self.edges
    }

    /// Bin centers, `n_bins x n_dims`.
    pub fn centers(&self) -> &Mat<f64> {
        &self.centers
    }

    pub fn is_interior(&self) -> &[bool] {
        &self.is_interior
    }

    pub fn n_interior(&self) -> usize {
        self.is_interior.iter().filter(|&&x| x).count()
    }

    fn shape(&self) -> Vec<usize> {
        self.edges.iter().map(|e| e.len() - 1).collect()
    }

    /// The bin containing `point`, `None` if any coordinate is not finite.
    /// Points outside the grid are assigned to the nearest edge bin.
    pub fn bin_of(&self, point: &[f64]) -> Option<usize> {
        let shape = self.shape();
        let mut bin = 0;
        for (dim, (&value, edges)) in point.iter().zip(self.edges.iter()).enumerate() {
            if !value.is_finite() {
                return None;
            }
            let n = shape[dim];
            // edges are increasing; the last edge belongs to the last bin
            let index = edges[1..n].partition_point(|&edge| edge <= value);
            bin = bin * n + index;
        }
        Some(bin)
    }

    /// Observed place bin for every row of `position`.
    pub fn observed_bins(&self, position: &Mat<f64>) -> Result<Vec<Option<usize>>> {
        ReplayError::check_len("position dimensions", self.n_dims(), position.ncols())?;
        let mut point = vec![0f64; self.n_dims()];
        Ok((0..position.nrows())
            .map(|row| {
                point
                    .iter_mut()
                    .enumerate()
                    .for_each(|(dim, p)| *p = position[(row, dim)]);
                self.bin_of(&point)
            })
            .collect())
    }
}

fn unravel(mut index: usize, shape: &[usize]) -> Vec<usize> {
    let mut out = vec![0; shape.len()];
    for (dim, &n) in shape.iter().enumerate().rev() {
        out[dim] = index % n;
        index /= n;
    }
    out
}

/// Position matrix with a single dimension.
pub fn column(values: &[f64]) -> Mat<f64> {
    Mat::from_fn(values.len(), 1, |row, _| values[row])
}
