use itertools::izip;
use multiversion::multiversion;

/// Added to empirical densities before taking logarithms.
pub(crate) const EPS: f64 = 1e-15;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// `log(sum(exp(values)))`, `-inf` for an empty slice.
pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

#[multiversion(targets("x86_64+avx+avx2", "x86+sse"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());

    let head_length = a.len() - a.len() % 4;

    let (x, x_tail) = a.split_at(head_length);
    let (y, y_tail) = b.split_at(head_length);

    let mut acc = [0f64; 4];
    izip!(x.chunks_exact(4), y.chunks_exact(4)).for_each(|(x, y)| {
        acc[0] += x[0] * y[0];
        acc[1] += x[1] * y[1];
        acc[2] += x[2] * y[2];
        acc[3] += x[3] * y[3];
    });

    let mut result = acc.iter().sum::<f64>();
    for (val1, val2) in x_tail.iter().zip(y_tail) {
        result += *val1 * *val2;
    }
    result
}

#[multiversion(targets("x86_64+avx+avx2", "x86+sse"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    let n = x.len();
    assert!(y.len() == n);

    izip!(x, y).for_each(|(x, y)| {
        *y += a * x;
    });
}

#[multiversion(targets("x86_64+avx+avx2", "x86+sse"))]
pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = x * y;
    });
}

#[multiversion(targets("x86_64+avx+avx2", "x86+sse"))]
pub(crate) fn scale(x: &mut [f64], a: f64) {
    x.iter_mut().for_each(|x| *x *= a);
}

/// Divide `values` by their sum. Returns the sum, and leaves `values`
/// untouched if the sum is zero or not finite.
pub(crate) fn normalize(values: &mut [f64]) -> f64 {
    let total: f64 = values.iter().sum();
    if total > 0. && total.is_finite() {
        scale(values, total.recip());
    }
    total
}

/// Normalise each row of a row-major `n x n` matrix to sum to one.
/// Rows without mass are left at zero.
pub(crate) fn normalize_rows(data: &mut [f64], n: usize) {
    data.chunks_exact_mut(n).for_each(|row| {
        normalize(row);
    });
}

/// The series shifted by one step, starting at zero.
pub(crate) fn lagged(values: &[f64]) -> Vec<f64> {
    std::iter::once(0.)
        .chain(values.iter().copied())
        .take(values.len())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn check_logaddexp(x in -10f64..10f64, y in -10f64..10f64) {
            let a = (x.exp() + y.exp()).ln();
            let b = logaddexp(x, y);
            let neginf = f64::NEG_INFINITY;
            let nan = f64::NAN;
            prop_assert!((a - b).abs() < 1e-10);
            prop_assert_eq!(b, logaddexp(y, x));
            prop_assert_eq!(x, logaddexp(x, neginf));
            prop_assert_eq!(logaddexp(neginf, neginf), neginf);
            prop_assert!(logaddexp(nan, x).is_nan());
        }

        #[test]
        fn check_log_sum_exp(values in proptest::collection::vec(-30f64..30f64, 1..20)) {
            let expected = values.iter().map(|x| x.exp()).sum::<f64>().ln();
            prop_assert!((log_sum_exp(&values) - expected).abs() < 1e-9);
        }

        #[test]
        fn check_dot(values in proptest::collection::vec(-10f64..10f64, 0..37)) {
            let expected: f64 = values.iter().map(|x| x * x).sum();
            prop_assert!((vector_dot(&values, &values) - expected).abs() < 1e-8);
        }
    }

    #[test]
    fn check_neginf() {
        assert_eq!(logaddexp(f64::NEG_INFINITY, 2.), 2.);
        assert_eq!(logaddexp(2., f64::NEG_INFINITY), 2.);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn lag_starts_at_zero() {
        assert_eq!(lagged(&[3., 4., 5.]), vec![0., 3., 4.]);
        assert!(lagged(&[]).is_empty());
    }

    #[test]
    fn normalize_rows_skips_empty_rows() {
        let mut data = vec![1., 3., 0., 0.];
        normalize_rows(&mut data, 2);
        assert_eq!(data, vec![0.25, 0.75, 0., 0.]);
    }

    #[test]
    fn axpy_and_multiply() {
        let x = [1., 2., 3., 4., 5.];
        let mut y = [1.; 5];
        axpy(&x, &mut y, 2.);
        assert_eq!(y, [3., 5., 7., 9., 11.]);
        let mut out = [0.; 5];
        multiply(&x, &y, &mut out);
        assert_eq!(out, [3., 10., 21., 36., 55.]);
    }
}
