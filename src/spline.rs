//! Natural cubic regression splines.
//!
//! The basis is the truncated power form of a natural cubic spline
//! (cubic between the knots, linear beyond the boundary knots) with the
//! constant column removed and every column centred on its training mean.
//! Inputs are rescaled to the knot range before the cubes are taken.

/// A fitted natural cubic spline basis over one covariate.
#[derive(Debug, Clone, PartialEq)]
pub struct NaturalCubicSpline {
    /// Knots in rescaled units, strictly increasing, at least two.
    knots: Vec<f64>,
    offset: f64,
    scale: f64,
    means: Vec<f64>,
}

impl NaturalCubicSpline {
    /// Boundary knots are placed at the extremes of the finite values of `x`;
    /// `inner_knots` outside that range are dropped.
    ///
    /// Returns `None` if `x` has fewer than two distinct finite values.
    pub fn fit(x: &[f64], inner_knots: &[f64]) -> Option<Self> {
        let (min, max) = x
            .iter()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if !(min.is_finite() && max > min) {
            return None;
        }

        let scale = max - min;
        let mut knots = vec![0.];
        let mut inner = inner_knots
            .iter()
            .copied()
            .filter(|&k| k > min && k < max)
            .map(|k| (k - min) / scale)
            .collect::<Vec<_>>();
        inner.sort_by(f64::total_cmp);
        inner.dedup();
        knots.extend(inner);
        knots.push(1.);

        let mut spline = Self {
            knots,
            offset: min,
            scale,
            means: vec![],
        };

        let n_basis = spline.n_basis();
        let mut means = vec![0f64; n_basis];
        let mut row = vec![0f64; n_basis];
        let mut count = 0usize;
        for &value in x.iter().filter(|v| v.is_finite()) {
            spline.raw_basis(value, &mut row);
            means.iter_mut().zip(&row).for_each(|(m, r)| *m += r);
            count += 1;
        }
        means.iter_mut().for_each(|m| *m /= count as f64);
        spline.means = means;
        Some(spline)
    }

    /// Number of basis columns.
    pub fn n_basis(&self) -> usize {
        self.knots.len() - 1
    }

    fn raw_basis(&self, x: f64, out: &mut [f64]) {
        let u = (x - self.offset) / self.scale;
        let k = self.knots.len();
        let last = self.knots[k - 1];
        let before_last = self.knots[k - 2];
        let d = |knot: f64| {
            (positive_cube(u - knot) - positive_cube(u - last)) / (last - knot)
        };
        out[0] = u;
        let d_before_last = d(before_last);
        for (j, &knot) in self.knots[..k - 2].iter().enumerate() {
            out[j + 1] = d(knot) - d_before_last;
        }
    }

    /// Centred basis at `x`, written to `out` (length `n_basis`).
    pub fn basis(&self, x: f64, out: &mut [f64]) {
        assert!(out.len() == self.n_basis());
        self.raw_basis(x, out);
        out.iter_mut().zip(&self.means).for_each(|(o, m)| *o -= m);
    }
}

#[inline]
fn positive_cube(x: f64) -> f64 {
    if x > 0. {
        x * x * x
    } else {
        0.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn basis_is_centred_on_training_data() {
        let x: Vec<f64> = (0..50).map(|i| i as f64 * 0.3).collect();
        let spline = NaturalCubicSpline::fit(&x, &[3., 6., 9.]).unwrap();
        assert_eq!(spline.n_basis(), 4);
        let mut sums = vec![0.; 4];
        let mut row = vec![0.; 4];
        for &v in &x {
            spline.basis(v, &mut row);
            sums.iter_mut().zip(&row).for_each(|(s, r)| *s += r);
        }
        sums.iter().for_each(|&s| assert_abs_diff_eq!(s, 0., epsilon = 1e-9));
    }

    #[test]
    fn linear_beyond_boundary_knots() {
        let x: Vec<f64> = (0..=10).map(|i| i as f64).collect();
        let spline = NaturalCubicSpline::fit(&x, &[2., 5., 7.]).unwrap();
        let mut a = vec![0.; 4];
        let mut b = vec![0.; 4];
        let mut c = vec![0.; 4];
        spline.basis(20., &mut a);
        spline.basis(30., &mut b);
        spline.basis(40., &mut c);
        for j in 0..4 {
            assert_abs_diff_eq!(b[j] - a[j], c[j] - b[j], epsilon = 1e-8);
        }
    }

    #[test]
    fn knots_outside_range_are_dropped() {
        let spline = NaturalCubicSpline::fit(&[0., 1., f64::NAN, 2.], &[-4., 1., 9.]).unwrap();
        assert_eq!(spline.n_basis(), 2);
        assert!(NaturalCubicSpline::fit(&[1., 1.], &[]).is_none());
    }
}
