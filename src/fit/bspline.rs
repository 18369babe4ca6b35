//! Breakpoint B-spline fit with iterative rejection.
//!
//! Breakpoints are laid out uniformly at `bkspace` across the data, then any
//! interior breakpoint whose nearest pixel is invalid is dropped so the basis
//! does not chase masked regions. The knot vector is padded with `nord − 1`
//! knots on each side at the nominal spacing.

use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

use super::reject::{iterative_fit, Rejection, ResidualScale, RobustFit};
use crate::error::{ensure_same_len, FluxError, Result};
use crate::interp::nearest_index;

#[derive(Debug, Clone, PartialEq)]
pub struct BsplineFitConfig {
    /// Breakpoint spacing in the units of `x`.
    pub bkspace: f64,
    /// Spline order (4 = cubic).
    pub nord: usize,
    pub maxiter: usize,
    pub lower: f64,
    pub upper: f64,
    pub maxrej: Option<usize>,
}

impl Default for BsplineFitConfig {
    fn default() -> Self {
        Self {
            bkspace: 1.0,
            nord: 4,
            maxiter: 35,
            lower: 3.0,
            upper: 3.0,
            maxrej: Some(5),
        }
    }
}

impl BsplineFitConfig {
    pub fn rejection(&self) -> Rejection {
        Rejection {
            lower: self.lower,
            upper: self.upper,
            maxrej: self.maxrej,
            scale: ResidualScale::InverseVariance,
            sticky: true,
        }
    }
}

/// Effective breakpoint multiplier and spacing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakpointSpacing {
    pub nresln: f64,
    pub bkspace: f64,
}

/// Breakpoint spacing of `nresln` resolution elements of width `std_res`,
/// never finer than one pixel (`std_pix`).
pub fn breakpoint_spacing(nresln: f64, std_res: f64, std_pix: f64) -> BreakpointSpacing {
    let mut nresln = nresln;
    if nresln * std_res < std_pix {
        warn!(
            "Breakpoints spaced at {:.1} resolution elements ({:.3} A) are finer than a pixel ({:.3} A); widening",
            nresln,
            nresln * std_res,
            std_pix
        );
        nresln = std_pix / std_res;
    }
    BreakpointSpacing {
        nresln,
        bkspace: std_res * nresln,
    }
}

/// Uniform breakpoints across sorted `x`, with interior breakpoints dropped
/// where the nearest sample is invalid. Returns the breakpoints and the
/// nominal spacing used for padding.
pub fn breakpoints(x: &[f64], bkspace: f64, valid: Option<&[bool]>) -> Result<(Vec<f64>, f64)> {
    let (Some(&start), Some(&end)) = (x.first(), x.last()) else {
        return Err(FluxError::InvalidInput("no samples for breakpoints".into()));
    };
    let span = end - start;
    if !(span > 0.0) || !(bkspace > 0.0) || !bkspace.is_finite() {
        return Err(FluxError::InvalidInput(format!(
            "cannot place breakpoints: span {span}, spacing {bkspace}"
        )));
    }
    let nbkpts = ((span / bkspace) as usize + 1).max(2);
    let spacing = span / (nbkpts - 1) as f64;

    let bkpt: Vec<f64> = (0..nbkpts)
        .map(|i| if i + 1 == nbkpts { end } else { start + i as f64 * spacing })
        .enumerate()
        .filter(|&(i, b)| {
            if i == 0 || i + 1 == nbkpts {
                return true;
            }
            match (valid, nearest_index(x, b)) {
                (Some(v), Some(idx)) => v[idx],
                _ => true,
            }
        })
        .map(|(_, b)| b)
        .collect();

    debug!("{} of {} breakpoints kept (spacing {:.3})", bkpt.len(), nbkpts, spacing);
    Ok((bkpt, spacing))
}

/// A B-spline on a fixed knot vector.
#[derive(Debug, Clone, PartialEq)]
pub struct BSpline {
    pub knots: Vec<f64>,
    pub nord: usize,
    pub coeffs: Vec<f64>,
}

impl BSpline {
    /// Pad breakpoints to a full knot vector.
    pub fn from_breakpoints(bkpt: &[f64], spacing: f64, nord: usize) -> Self {
        let pad = nord.saturating_sub(1);
        let first = bkpt.first().copied().unwrap_or(0.0);
        let last = bkpt.last().copied().unwrap_or(0.0);
        let mut knots = Vec::with_capacity(bkpt.len() + 2 * pad);
        knots.extend((1..=pad).rev().map(|k| first - k as f64 * spacing));
        knots.extend_from_slice(bkpt);
        knots.extend((1..=pad).map(|k| last + k as f64 * spacing));
        let ncoeff = knots.len().saturating_sub(nord);
        Self {
            knots,
            nord,
            coeffs: vec![0.0; ncoeff],
        }
    }

    pub fn ncoeff(&self) -> usize {
        self.coeffs.len()
    }

    /// Non-zero basis values at `x` and the index of the first one.
    ///
    /// Cox-de Boor recursion on the knot span containing `x`; points outside
    /// the breakpoint range use the outermost span.
    fn basis(&self, x: f64) -> (usize, Vec<f64>) {
        let k = self.nord;
        let t = &self.knots;
        let lo = k - 1;
        let hi = t.len() - k - 1;
        let i = t.partition_point(|&v| v <= x).saturating_sub(1).clamp(lo, hi);

        let mut n = vec![0.0; k];
        let mut left = vec![0.0; k];
        let mut right = vec![0.0; k];
        n[0] = 1.0;
        for j in 1..k {
            left[j] = x - t[i + 1 - j];
            right[j] = t[i + j] - x;
            let mut saved = 0.0;
            for r in 0..j {
                let denom = right[r + 1] + left[j - r];
                let temp = if denom != 0.0 { n[r] / denom } else { 0.0 };
                n[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            n[j] = saved;
        }
        (i + 1 - k, n)
    }

    pub fn eval(&self, x: f64) -> f64 {
        if self.ncoeff() == 0 {
            return 0.0;
        }
        let (first, n) = self.basis(x);
        n.iter()
            .enumerate()
            .map(|(j, b)| b * self.coeffs[first + j])
            .sum()
    }

    /// Weighted least-squares coefficients over the points where `mask` is set.
    pub fn fit_coeffs(&mut self, x: &[f64], y: &[f64], invvar: &[f64], mask: &[bool]) {
        let m = self.ncoeff();
        let rows: Vec<usize> = (0..x.len()).filter(|&i| mask[i] && invvar[i] > 0.0).collect();
        if m == 0 || rows.is_empty() {
            self.coeffs.iter_mut().for_each(|c| *c = 0.0);
            return;
        }

        let mut a_mat = DMatrix::<f64>::zeros(rows.len(), m);
        let mut b_vec = DVector::<f64>::zeros(rows.len());
        for (row, &i) in rows.iter().enumerate() {
            let w = invvar[i].sqrt();
            let (first, n) = self.basis(x[i]);
            for (j, b) in n.iter().enumerate() {
                a_mat[(row, first + j)] = w * b;
            }
            b_vec[row] = w * y[i];
        }

        let svd = a_mat.svd(true, true);
        let coeffs = svd
            .solve(&b_vec, 1e-12)
            .unwrap_or_else(|_| DVector::zeros(m));
        self.coeffs = coeffs.iter().copied().collect();
    }
}

/// Outcome of [`fit_bspline`].
#[derive(Debug, Clone, PartialEq)]
pub struct BsplineFit {
    pub spline: BSpline,
    pub fit: RobustFit,
}

/// Iteratively rejecting B-spline fit of `y(x)`.
///
/// `bkpt_valid` marks samples breakpoints may sit on; `inmask` selects the
/// points entering the fit. Residuals are scaled by `sqrt(invvar)`.
pub fn fit_bspline(
    x: &[f64],
    y: &[f64],
    invvar: &[f64],
    inmask: &[bool],
    bkpt_valid: Option<&[bool]>,
    config: &BsplineFitConfig,
) -> Result<BsplineFit> {
    ensure_same_len("spline fit", &[x.len(), y.len(), invvar.len(), inmask.len()])?;
    if config.nord < 1 {
        return Err(FluxError::Configuration("spline order must be at least 1".into()));
    }
    let (bkpt, spacing) = breakpoints(x, config.bkspace, bkpt_valid)?;
    let mut spline = BSpline::from_breakpoints(&bkpt, spacing, config.nord);

    let fit = iterative_fit(y, Some(invvar), inmask, config.maxiter, &config.rejection(), |mask| {
        spline.fit_coeffs(x, y, invvar, mask);
        Ok(x.iter().map(|&xi| spline.eval(xi)).collect())
    })?;

    Ok(BsplineFit { spline, fit })
}
