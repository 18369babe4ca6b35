//! One-dimensional interpolation and small statistics helpers.
//!
//! All grids are assumed sorted in ascending order. Lookups use binary search
//! (`partition_point`) so evaluating `m` points on an `n`-point table costs
//! `O(m log n)`.

/// How [`interp_linear`] treats points outside the tabulated range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Extrapolate {
    /// Continue the line through the two outermost samples.
    Linear,
    /// Return a constant outside the range.
    Fill(f64),
    /// Hold the first/last sample value.
    Edge,
}

/// Linearly interpolate `ys(xs)` at every point of `x_new`.
pub fn interp_linear(xs: &[f64], ys: &[f64], x_new: &[f64], mode: Extrapolate) -> Vec<f64> {
    debug_assert_eq!(xs.len(), ys.len());
    x_new.iter().map(|&x| interp_one(xs, ys, x, mode)).collect()
}

fn interp_one(xs: &[f64], ys: &[f64], x: f64, mode: Extrapolate) -> f64 {
    let n = xs.len();
    match n {
        0 => return f64::NAN,
        1 => return ys[0],
        _ => {}
    }
    let outside = x < xs[0] || x > xs[n - 1];
    if outside {
        match mode {
            Extrapolate::Fill(v) => return v,
            Extrapolate::Edge => return if x < xs[0] { ys[0] } else { ys[n - 1] },
            Extrapolate::Linear => {}
        }
    }
    // Index of the segment [xs[i], xs[i+1]] used for evaluation.
    let i = xs.partition_point(|&v| v <= x).saturating_sub(1).min(n - 2);
    let (x0, x1) = (xs[i], xs[i + 1]);
    let (y0, y1) = (ys[i], ys[i + 1]);
    let dx = x1 - x0;
    if dx == 0.0 {
        return y0;
    }
    y0 + (x - x0) * (y1 - y0) / dx
}

/// Index of the tabulated sample nearest to `x`.
pub fn nearest_index(xs: &[f64], x: f64) -> Option<usize> {
    if xs.is_empty() {
        return None;
    }
    let hi = xs.partition_point(|&v| v < x);
    if hi == 0 {
        return Some(0);
    }
    if hi == xs.len() {
        return Some(xs.len() - 1);
    }
    let lo = hi - 1;
    Some(if (x - xs[lo]) <= (xs[hi] - x) { lo } else { hi })
}

/// Median of a slice, ignoring NaNs. Returns `None` when nothing is left.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| !x.is_nan()).collect();
    if v.is_empty() {
        return None;
    }
    v.sort_by(|a, b| a.total_cmp(b));
    let n = v.len();
    Some(if n % 2 == 1 {
        v[n / 2]
    } else {
        0.5 * (v[n / 2 - 1] + v[n / 2])
    })
}

/// Median spacing between consecutive samples of a grid.
pub fn median_spacing(xs: &[f64]) -> Option<f64> {
    let diffs: Vec<f64> = xs.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    median(&diffs)
}
