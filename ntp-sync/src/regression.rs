//! Line fitting routines used by per-source statistics.
//!
//! All routines take the independent variable `x`, the measurements `y` and,
//! where applicable, per-point variances `w` (larger means less reliable).
//! Slices may hold at most [`MAX_POINTS`] fitted points.

use std::{cmp::Ordering, fmt};

/// Maximum number of points a fit may use.
pub const MAX_POINTS: usize = 64;

/// How far back, relative to the fitted window, residuals may be taken for
/// the runs test.
pub const REGRESS_RUNS_RATIO: usize = 2;

/// Smallest number of points a regression is computed from.
pub const MIN_SAMPLES_FOR_REGRESS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegressionError {
    NotEnoughPoints,
    TooManyPoints,
    /// The robust fit could not bracket a root for the slope.
    NoSlopeBracket,
}

impl fmt::Display for RegressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotEnoughPoints => f.write_str("not enough points for a regression"),
            Self::TooManyPoints => write!(f, "more than {MAX_POINTS} points in a regression"),
            Self::NoSlopeBracket => f.write_str("could not bracket the slope of a robust fit"),
        }
    }
}

impl std::error::Error for RegressionError {}

/// Result of a weighted least squares fit `y = b0 + b1 * x`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionLine {
    pub b0: f64,
    pub b1: f64,
    /// Weighted average of the variances of the data points
    pub s2: f64,
    /// Standard deviation of the intercept
    pub sb0: f64,
    /// Standard deviation of the slope
    pub sb1: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestRegression {
    pub line: RegressionLine,
    /// Index of the first point still used in the fit, relative to the
    /// fitted window.
    pub new_start: usize,
    pub n_runs: usize,
    /// Degrees of freedom, for use with [`t_coef`].
    pub dof: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustRegression {
    pub b0: f64,
    pub b1: f64,
    pub n_runs: usize,
    pub best_start: usize,
}

/// Weighted least squares.
///
/// # Panics
///
/// Fewer than three points, or slices of unequal length.
pub fn weighted_regression(x: &[f64], y: &[f64], w: &[f64]) -> RegressionLine {
    let n = x.len();
    assert!(n >= MIN_SAMPLES_FOR_REGRESS, "regression needs at least 3 points");
    assert!(y.len() == n && w.len() == n);

    let mut big_w = 0.0;
    let mut big_u = 0.0;
    for i in 0..n {
        big_u += x[i] / w[i];
        big_w += 1.0 / w[i];
    }

    let u = big_u / big_w;

    let mut p = 0.0;
    let mut q = 0.0;
    let mut v = 0.0;
    for i in 0..n {
        let ui = x[i] - u;
        p += y[i] / w[i];
        q += y[i] * ui / w[i];
        v += ui * ui / w[i];
    }

    let b1 = q / v;
    let b0 = (p / big_w) - b1 * u;

    let mut s2 = 0.0;
    for i in 0..n {
        let diff = y[i] - b0 - b1 * x[i];
        s2 += diff * diff / w[i];
    }
    s2 /= (n - 2) as f64;

    let sb1 = (s2 / v).sqrt();
    let aa = u * sb1;
    let sb0 = (s2 / big_w + aa * aa).sqrt();

    RegressionLine {
        b0,
        b1,
        s2: s2 * (n as f64 / big_w),
        sb0,
        sb1,
    }
}

/// Multiplier for a 99.95% confidence interval with the given degrees of
/// freedom (Student's t).
pub fn t_coef(dof: usize) -> f64 {
    const COEFS: [f64; 40] = [
        636.6, 31.6, 12.92, 8.61, 6.869, 5.959, 5.408, 5.041, 4.781, 4.587, 4.437, 4.318, 4.221,
        4.140, 4.073, 4.015, 3.965, 3.922, 3.883, 3.850, 3.819, 3.792, 3.767, 3.745, 3.725,
        3.707, 3.690, 3.674, 3.659, 3.646, 3.633, 3.622, 3.611, 3.601, 3.591, 3.582, 3.574,
        3.566, 3.558, 3.551,
    ];

    match COEFS.get(dof.saturating_sub(1)) {
        Some(coef) => *coef,
        None => 3.5,
    }
}

/// Upper 90% quantile of the chi-square distribution.
pub fn chi2_coef(dof: usize) -> f64 {
    const COEFS: [f64; 64] = [
        2.706, 4.605, 6.251, 7.779, 9.236, 10.645, 12.017, 13.362, 14.684, 15.987, 17.275,
        18.549, 19.812, 21.064, 22.307, 23.542, 24.769, 25.989, 27.204, 28.412, 29.615, 30.813,
        32.007, 33.196, 34.382, 35.563, 36.741, 37.916, 39.087, 40.256, 41.422, 42.585, 43.745,
        44.903, 46.059, 47.212, 48.363, 49.513, 50.660, 51.805, 52.949, 54.090, 55.230, 56.369,
        57.505, 58.641, 59.774, 60.907, 62.038, 63.167, 64.295, 65.422, 66.548, 67.673, 68.796,
        69.919, 71.040, 72.160, 73.279, 74.397, 75.514, 76.630, 77.745, 78.860,
    ];

    match COEFS.get(dof.saturating_sub(1)) {
        Some(coef) => *coef,
        None => 1.2 * dof as f64,
    }
}

/// Largest number of runs (indexed by number of residuals) at which the
/// residuals are considered non-random at the 5% level.
const CRITICAL_RUNS: [usize; 130] = [
    0, 0, 0, 0, 0, 0, 0, 0, 2, 3, //
    3, 3, 4, 4, 5, 5, 5, 6, 6, 7, //
    7, 7, 8, 8, 9, 9, 9, 10, 10, 11, //
    11, 11, 12, 12, 13, 13, 14, 14, 14, 15, //
    15, 16, 16, 17, 17, 18, 18, 18, 19, 19, //
    20, 20, 21, 21, 21, 22, 22, 23, 23, 24, //
    24, 25, 25, 26, 26, 26, 27, 27, 28, 28, //
    29, 29, 30, 30, 30, 31, 31, 32, 32, 33, //
    33, 34, 34, 35, 35, 35, 36, 36, 37, 37, //
    38, 38, 39, 39, 40, 40, 40, 41, 41, 42, //
    42, 43, 43, 44, 44, 45, 45, 46, 46, 46, //
    47, 47, 48, 48, 49, 49, 50, 50, 51, 51, //
    52, 52, 52, 53, 53, 54, 54, 55, 55, 56, //
];

/// Count the runs of equal sign in a residual sequence. Zero residuals
/// always start a new run.
pub fn n_runs_from_residuals(resid: &[f64]) -> usize {
    if resid.is_empty() {
        return 0;
    }

    let mut nruns = 1;
    for pair in resid.windows(2) {
        let same_sign = (pair[0] < 0.0 && pair[1] < 0.0) || (pair[0] > 0.0 && pair[1] > 0.0);
        if !same_sign {
            nruns += 1;
        }
    }
    nruns
}

/// Weighted regression that drops the oldest points until the residuals pass
/// a runs test.
///
/// The first `extra` entries of the slices are older samples which are not
/// fitted, but whose residuals extend the runs test. `min_samples` is the
/// smallest number of points the fit is allowed to shrink to.
pub fn find_best_regression(
    x: &[f64],
    y: &[f64],
    w: &[f64],
    extra: usize,
    min_samples: usize,
) -> Result<BestRegression, RegressionError> {
    assert!(y.len() == x.len() && w.len() == x.len() && extra <= x.len());

    let n = x.len() - extra;
    if n > MAX_POINTS {
        return Err(RegressionError::TooManyPoints);
    }
    if n < MIN_SAMPLES_FOR_REGRESS {
        return Err(RegressionError::NotEnoughPoints);
    }

    let mut resid = Vec::with_capacity(n * REGRESS_RUNS_RATIO);
    let mut start = 0;

    // Indices below are relative to the fitted window; `i + extra` indexes
    // the slices.
    let (a, b, u, big_w, v, resid_start, nruns) = loop {
        let mut big_w = 0.0;
        let mut big_u = 0.0;
        for i in start..n {
            big_u += x[i + extra] / w[i + extra];
            big_w += 1.0 / w[i + extra];
        }

        let u = big_u / big_w;

        let mut p = 0.0;
        let mut q = 0.0;
        let mut v = 0.0;
        for i in start..n {
            let ui = x[i + extra] - u;
            p += y[i + extra] / w[i + extra];
            q += y[i + extra] * ui / w[i + extra];
            v += ui * ui / w[i + extra];
        }

        let b = q / v;
        let a = (p / big_w) - b * u;

        // Residuals may reach back before the start of the fit, into the
        // extra samples
        let wanted = (n - start) * REGRESS_RUNS_RATIO;
        let resid_start = (extra + n).saturating_sub(wanted);

        resid.clear();
        resid.extend((resid_start..extra + n).map(|i| y[i] - a - b * x[i]));

        let nruns = n_runs_from_residuals(&resid);

        if nruns > CRITICAL_RUNS[resid.len()]
            || n - start <= MIN_SAMPLES_FOR_REGRESS
            || n - start <= min_samples
        {
            // Extra samples are not counted in the returned runs
            let fitted_offset = start + extra - resid_start;
            let nruns = n_runs_from_residuals(&resid[fitted_offset..]);
            break (a, b, u, big_w, v, resid_start, nruns);
        }

        start += 1;
    };

    let mut ss = 0.0;
    for i in start..n {
        let r = resid[i + extra - resid_start];
        ss += r * r / w[i + extra];
    }

    let npoints = n - start;
    ss /= (npoints - 2) as f64;
    let sb1 = (ss / v).sqrt();
    let aa = u * sb1;
    let sb0 = (ss / big_w + aa * aa).sqrt();

    Ok(BestRegression {
        line: RegressionLine {
            b0: a,
            b1: b,
            s2: ss * npoints as f64 / big_w,
            sb0,
            sb1,
        },
        new_start: start,
        n_runs: nruns,
        dof: npoints - 2,
    })
}

/// Place the element that belongs at `index` in sorted order, using and
/// updating `placed` to skip over ranges already partitioned by earlier
/// calls on the same slice.
fn find_ordered_entry_with_flags(x: &mut [f64], index: usize, placed: &mut [bool]) -> f64 {
    let n = x.len();
    assert!(index < n);

    if placed[index] {
        return x[index];
    }

    // Find the unplaced range around index
    let mut u = index;
    while u > 0 && !placed[u] {
        u -= 1;
    }
    if placed[u] {
        u += 1;
    }

    let mut v = index;
    while v < n - 1 && !placed[v] {
        v += 1;
    }
    if placed[v] {
        v -= 1;
    }

    loop {
        if v - u < 2 {
            if x[v] < x[u] {
                x.swap(u, v);
            }
            placed[u] = true;
            placed[v] = true;
            return x[index];
        }

        let pivot_index = (u + v) / 2;
        x.swap(u, pivot_index);
        let pivot = x[u];

        let mut l = u + 1;
        let mut r = v;
        loop {
            while l < v && x[l] < pivot {
                l += 1;
            }
            while x[r] > pivot {
                r -= 1;
            }
            if r <= l {
                break;
            }
            x.swap(l, r);
            l += 1;
            r -= 1;
        }
        x.swap(u, r);
        placed[r] = true;

        match index.cmp(&r) {
            Ordering::Equal => return x[r],
            Ordering::Less => v = r - 1,
            Ordering::Greater => u = r + 1,
        }
    }
}

/// Median by quick-select. Reorders `values`.
///
/// # Panics
///
/// `values` is empty or contains NaN.
pub fn find_median(values: &mut [f64]) -> f64 {
    let n = values.len();
    assert!(n > 0, "median of an empty set");
    assert!(values.iter().all(|v| !v.is_nan()), "median of NaN");

    let mut placed = vec![false; n];
    let k = n / 2;
    if n % 2 == 1 {
        find_ordered_entry_with_flags(values, k, &mut placed)
    } else {
        let upper = find_ordered_entry_with_flags(values, k, &mut placed);
        let lower = find_ordered_entry_with_flags(values, k - 1, &mut placed);
        0.5 * (upper + lower)
    }
}

/// Evaluate `sum(x_i * sign(y_i - a - b * x_i))` for the intercept `a` that
/// minimises the absolute residuals at slope `b`. Returns `(a, sum)`.
fn eval_robust_residual(x: &[f64], y: &[f64], b: f64, scratch: &mut Vec<f64>) -> (f64, f64) {
    scratch.clear();
    scratch.extend(x.iter().zip(y).map(|(x, y)| y - b * x));

    let a = find_median(scratch);

    let mut res = 0.0;
    for (x, y) in x.iter().zip(y) {
        let del = y - a - b * x;
        if del > 0.0 {
            res += x;
        } else if del < 0.0 {
            res -= x;
        }
    }

    (a, res)
}

/// Least absolute deviations fit, solved by bisection on the slope, dropping
/// the oldest points until the residuals pass a runs test.
pub fn find_best_robust_regression(
    x: &[f64],
    y: &[f64],
    tol: f64,
) -> Result<RobustRegression, RegressionError> {
    assert!(y.len() == x.len());
    let n = x.len();

    if n > MAX_POINTS {
        return Err(RegressionError::TooManyPoints);
    }

    if n < 2 {
        return Err(RegressionError::NotEnoughPoints);
    } else if n == 2 {
        let b1 = (y[1] - y[0]) / (x[1] - x[0]);
        return Ok(RobustRegression {
            b0: y[0] - b1 * x[0],
            b1,
            n_runs: 0,
            best_start: 0,
        });
    }

    let mut scratch = Vec::with_capacity(n);
    let mut resids = Vec::with_capacity(n);
    let mut start = 0;
    let mut nruns = 0;

    loop {
        let xs = &x[start..];
        let ys = &y[start..];
        let n_points = xs.len();
        let count = n_points as f64;

        // Ordinary least squares for a starting estimate
        let my = ys.iter().sum::<f64>() / count;
        let mx = xs.iter().sum::<f64>() / count;

        let mut cov = 0.0;
        let mut v = 0.0;
        for (x, y) in xs.iter().zip(ys) {
            let dx = x - mx;
            cov += (y - my) * dx;
            v += dx * dx;
        }

        let b = cov / v;
        let a = my - b * mx;

        let s2: f64 = xs
            .iter()
            .zip(ys)
            .map(|(x, y)| {
                let resid = y - a - b * x;
                resid * resid
            })
            .sum();

        // Widen the slope interval around the estimate until it contains
        // a sign change
        let sb = (s2 * count / v).sqrt();
        let mut incr = 3.0 * sb.max(tol);
        let mut prev = None;

        let (mut blo, mut bhi, mut rlo, mut rhi) = loop {
            let blo = b - incr;
            let bhi = b + incr;

            // degenerate data, widening gets us nowhere
            if !blo.is_finite() || !bhi.is_finite() || prev == Some((blo, bhi)) {
                return Err(RegressionError::NoSlopeBracket);
            }
            prev = Some((blo, bhi));

            let (_, rlo) = eval_robust_residual(xs, ys, blo, &mut scratch);
            let (_, rhi) = eval_robust_residual(xs, ys, bhi, &mut scratch);

            if rlo * rhi < 0.0 {
                break (blo, bhi, rlo, rhi);
            }

            incr *= 2.0;
        };

        let mut a;
        let mut bmid;
        loop {
            bmid = 0.5 * (blo + bhi);
            let (amid, rmid) = eval_robust_residual(xs, ys, bmid, &mut scratch);
            a = amid;
            if !(blo < bmid && bmid < bhi) || rmid == 0.0 {
                break;
            }

            if rmid * rlo > 0.0 {
                blo = bmid;
                rlo = rmid;
            } else if rmid * rhi > 0.0 {
                bhi = bmid;
                rhi = rmid;
            } else {
                unreachable!("robust residual lost its bracket");
            }

            if bhi - blo <= tol {
                break;
            }
        }

        if n_points == MIN_SAMPLES_FOR_REGRESS {
            return Ok(RobustRegression {
                b0: a,
                b1: bmid,
                n_runs: nruns,
                best_start: start,
            });
        }

        resids.clear();
        resids.extend(xs.iter().zip(ys).map(|(x, y)| y - a - bmid * x));
        nruns = n_runs_from_residuals(&resids);

        if nruns > CRITICAL_RUNS[n_points] {
            return Ok(RobustRegression {
                b0: a,
                b1: bmid,
                n_runs: nruns,
                best_start: start,
            });
        }

        start += 1;
    }
}

#[cfg(feature = "fuzz")]
pub fn fuzz_find_median(values: &[f64]) {
    let mut values: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if values.is_empty() {
        return;
    }

    let mut sorted = values.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let expected = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2] + sorted[n / 2 - 1])
    };

    let median = find_median(&mut values);
    assert!(median == expected || (median.is_nan() && expected.is_nan()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solve_normal_equations(x: &[f64], y: &[f64], w: &[f64]) -> (f64, f64) {
        let (mut s, mut sx, mut sxx, mut sy, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for i in 0..x.len() {
            let wi = 1.0 / w[i];
            s += wi;
            sx += wi * x[i];
            sxx += wi * x[i] * x[i];
            sy += wi * y[i];
            sxy += wi * x[i] * y[i];
        }
        let det = s * sxx - sx * sx;
        let b0 = (sxx * sy - sx * sxy) / det;
        let b1 = (s * sxy - sx * sy) / det;
        (b0, b1)
    }

    #[test]
    fn test_weighted_regression_normal_equations() {
        let x: Vec<f64> = (0..12).map(|i| i as f64 * 16.0).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, x)| 0.002 + 3e-6 * x + [1e-4, -2e-4, 5e-5][i % 3])
            .collect();
        let w: Vec<f64> = (0..12).map(|i| 1.0 + (i % 4) as f64).collect();

        let line = weighted_regression(&x, &y, &w);
        let (b0, b1) = solve_normal_equations(&x, &y, &w);

        assert!((line.b0 - b0).abs() < 1e-12);
        assert!((line.b1 - b1).abs() < 1e-12);
        assert!(line.s2 > 0.0);
        assert!(line.sb0 > 0.0 && line.sb1 > 0.0);
    }

    #[test]
    fn test_weighted_regression_exact_line() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [3.0, 5.0, 7.0, 9.0];
        let w = [1.0; 4];

        let line = weighted_regression(&x, &y, &w);
        assert!((line.b0 - 1.0).abs() < 1e-12);
        assert!((line.b1 - 2.0).abs() < 1e-12);
        assert!(line.s2.abs() < 1e-20);
    }

    #[test]
    #[should_panic]
    fn test_weighted_regression_needs_three_points() {
        weighted_regression(&[1.0, 2.0], &[1.0, 2.0], &[1.0, 1.0]);
    }

    #[test]
    fn test_coefficient_tables() {
        assert_eq!(t_coef(1), 636.6);
        assert_eq!(t_coef(40), 3.551);
        assert_eq!(t_coef(41), 3.5);
        assert_eq!(chi2_coef(1), 2.706);
        assert_eq!(chi2_coef(64), 78.860);
        assert_eq!(chi2_coef(100), 120.0);
    }

    #[test]
    fn test_runs() {
        assert_eq!(n_runs_from_residuals(&[]), 0);
        assert_eq!(n_runs_from_residuals(&[1.0, 2.0, 3.0]), 1);
        assert_eq!(n_runs_from_residuals(&[1.0, -2.0, 3.0]), 3);
        assert_eq!(n_runs_from_residuals(&[-1.0, -2.0, 3.0, 4.0]), 2);
        assert_eq!(n_runs_from_residuals(&[0.0, 0.0]), 2);
    }

    fn noise(i: usize) -> f64 {
        if i % 2 == 0 {
            0.001
        } else {
            -0.001
        }
    }

    #[test]
    fn test_best_regression_keeps_random_residuals() {
        let x: Vec<f64> = (0..16).map(|i| i as f64).collect();
        let y: Vec<f64> = (0..16).map(|i| 0.5 + 0.25 * i as f64 + noise(i)).collect();
        let w = vec![1.0; 16];

        let best = find_best_regression(&x, &y, &w, 0, 0).unwrap();
        assert_eq!(best.new_start, 0);
        assert_eq!(best.n_runs, 16);
        assert_eq!(best.dof, 14);
        assert!((best.line.b1 - 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_best_regression_drops_kinked_history() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = (0..20)
            .map(|i| if i < 10 { (10 - i) as f64 } else { 0.0 } + noise(i))
            .collect();
        let w = vec![1.0; 20];

        let best = find_best_regression(&x, &y, &w, 0, 0).unwrap();
        assert!(best.new_start >= 1);
        assert!(best.new_start <= 10);
        assert_eq!(best.dof, 20 - best.new_start - 2);
    }

    #[test]
    fn test_best_regression_respects_min_samples() {
        // Residuals of a line through a parabola form three runs, which only
        // passes once the residual window is down to eight points
        let x: Vec<f64> = (0..16).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|x| x * x).collect();
        let w = vec![1.0; 16];

        let best = find_best_regression(&x, &y, &w, 0, 6).unwrap();
        assert_eq!(best.new_start, 10);

        let best = find_best_regression(&x, &y, &w, 0, 0).unwrap();
        assert_eq!(best.new_start, 12);
        assert_eq!(best.n_runs, 3);
    }

    #[test]
    fn test_best_regression_extra_samples() {
        let x: Vec<f64> = (0..12).map(|i| i as f64).collect();
        let y: Vec<f64> = (0..12).map(|i| 1.0 + noise(i)).collect();
        let w = vec![1.0; 12];

        // Four extra samples are only used to extend the runs test
        let best = find_best_regression(&x, &y, &w, 4, 0).unwrap();
        assert_eq!(best.new_start, 0);
        assert_eq!(best.dof, 6);
        assert_eq!(best.n_runs, 8);
    }

    #[test]
    fn test_best_regression_errors() {
        let x = [1.0, 2.0];
        assert_eq!(
            find_best_regression(&x, &x, &x, 0, 0),
            Err(RegressionError::NotEnoughPoints)
        );

        let x = vec![1.0; MAX_POINTS + 1];
        assert_eq!(
            find_best_regression(&x, &x, &x, 0, 0),
            Err(RegressionError::TooManyPoints)
        );
    }

    #[test]
    fn test_robust_two_points() {
        let fit = find_best_robust_regression(&[1.0, 3.0], &[2.0, 8.0], 1e-9).unwrap();
        assert_eq!(fit.b1, 3.0);
        assert_eq!(fit.b0, -1.0);
        assert_eq!(fit.n_runs, 0);
        assert_eq!(fit.best_start, 0);
    }

    #[test]
    fn test_robust_too_few_points() {
        assert_eq!(
            find_best_robust_regression(&[1.0], &[1.0], 1e-9),
            Err(RegressionError::NotEnoughPoints)
        );
    }

    #[test]
    fn test_robust_ignores_outlier() {
        let x: Vec<f64> = (0..11).map(|i| i as f64).collect();
        let mut y: Vec<f64> = x.iter().map(|x| 1.0 + 2.0 * x).collect();
        y[5] += 10.0;

        let fit = find_best_robust_regression(&x, &y, 1e-9).unwrap();
        assert!((fit.b1 - 2.0).abs() < 1e-6);
        assert!((fit.b0 - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_robust_short_time_span() {
        // noisy points a few milliseconds apart give a huge slope uncertainty
        let x = [0.0, 0.001, 0.002, 0.003, 0.004, 0.005];
        let y = [0.0, 1.0, -1.0, 1.0, 0.0, -1.0];

        let fit = find_best_robust_regression(&x, &y, 1e-9).unwrap();
        assert!(fit.b0.is_finite());
        assert!(fit.b1.is_finite());
        assert!(fit.best_start < x.len());
    }

    #[test]
    fn test_robust_degenerate_x() {
        assert_eq!(
            find_best_robust_regression(&[1.0, 1.0, 1.0], &[0.0, 1.0, 2.0], 1e-9),
            Err(RegressionError::NoSlopeBracket)
        );
    }

    #[test]
    fn test_median() {
        assert_eq!(find_median(&mut [3.0]), 3.0);
        assert_eq!(find_median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(find_median(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(find_median(&mut [1.0, 1.0, 1.0, 2.0, 2.0, 2.0]), 1.5);
        assert_eq!(find_median(&mut [5.0, 5.0, 5.0, 5.0]), 5.0);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::super::find_median;

        fn sorted_median(values: &[f64]) -> f64 {
            let mut sorted = values.to_vec();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let n = sorted.len();
            if n % 2 == 1 {
                sorted[n / 2]
            } else {
                0.5 * (sorted[n / 2] + sorted[n / 2 - 1])
            }
        }

        proptest! {
            #[test]
            fn median_matches_sorting(values in prop::collection::vec(-1e6f64..1e6, 1..64)) {
                let expected = sorted_median(&values);
                let mut scratch = values.clone();
                prop_assert_eq!(find_median(&mut scratch), expected);
            }

            #[test]
            fn median_with_many_duplicates(values in prop::collection::vec(0u8..4, 1..64)) {
                let values: Vec<f64> = values.into_iter().map(f64::from).collect();
                let expected = sorted_median(&values);
                let mut scratch = values.clone();
                prop_assert_eq!(find_median(&mut scratch), expected);
            }
        }
    }
}
