//! Iterative outlier rejection shared by the polynomial and spline fitters.
//!
//! The loop alternates fitting and clipping:
//!
//! 1. fit the model to the currently included points,
//! 2. scale residuals by a robust sigma (median absolute residual) or by
//!    `sqrt(invvar)`,
//! 3. exclude points beyond `-lower`/`+upper` sigma, worst first, at most
//!    `maxrej` per iteration.
//!
//! With `sticky` rejection the excluded set only grows, so the iteration is a
//! monotone fixed point: it stops at `maxiter` or as soon as an iteration
//! excludes nothing new. Without `sticky` every iteration starts again from
//! the input mask.

use tracing::debug;

use crate::error::Result;
use crate::interp::median;

/// How residuals are normalized before clipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualScale {
    /// 1.4826 × median absolute residual of the included points.
    Mad,
    /// Per-point `sqrt(invvar)`.
    InverseVariance,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rejection {
    pub lower: f64,
    pub upper: f64,
    /// Cap on new rejections per iteration.
    pub maxrej: Option<usize>,
    pub scale: ResidualScale,
    pub sticky: bool,
}

/// Result of an iteratively rejecting fit.
#[derive(Debug, Clone, PartialEq)]
pub struct RobustFit {
    /// Model evaluated at every input point.
    pub model: Vec<f64>,
    /// Points included in the final fit.
    pub mask: Vec<bool>,
    pub iterations: usize,
}

/// Robust sigma of the included residuals, taken about zero so that a biased
/// first fit inflates the scale instead of clipping every point.
pub fn mad_sigma(residuals: &[f64], mask: &[bool]) -> Option<f64> {
    let abs_res: Vec<f64> = residuals
        .iter()
        .zip(mask)
        .filter(|(_, &m)| m)
        .map(|(&r, _)| r.abs())
        .collect();
    median(&abs_res).map(|mad| 1.4826 * mad)
}

/// One clipping pass. Updates `outmask` and reports whether it changed.
pub fn reject_step(
    residuals: &[f64],
    invvar: Option<&[f64]>,
    inmask: &[bool],
    outmask: &mut [bool],
    rejection: &Rejection,
) -> bool {
    let n = residuals.len();
    let sigma = match rejection.scale {
        ResidualScale::Mad => mad_sigma(residuals, outmask),
        ResidualScale::InverseVariance => None,
    };

    // Normalized deviation of each point
    let chi: Vec<f64> = (0..n)
        .map(|i| match (rejection.scale, sigma, invvar) {
            (ResidualScale::Mad, Some(s), _) if s > 0.0 => residuals[i] / s,
            (ResidualScale::Mad, _, _) => 0.0,
            (ResidualScale::InverseVariance, _, Some(iv)) => residuals[i] * iv[i].max(0.0).sqrt(),
            (ResidualScale::InverseVariance, _, None) => residuals[i],
        })
        .collect();

    let candidates = |i: usize| {
        if rejection.sticky {
            outmask[i]
        } else {
            inmask[i]
        }
    };

    // (index, excess beyond the threshold)
    let mut outliers: Vec<(usize, f64)> = (0..n)
        .filter(|&i| candidates(i))
        .filter_map(|i| {
            let c = chi[i];
            if c > rejection.upper {
                Some((i, c - rejection.upper))
            } else if c < -rejection.lower {
                Some((i, -rejection.lower - c))
            } else {
                None
            }
        })
        .collect();

    if let Some(maxrej) = rejection.maxrej {
        outliers.sort_by(|a, b| b.1.total_cmp(&a.1));
        outliers.truncate(maxrej);
    }

    let mut newmask: Vec<bool> = (0..n).map(candidates).collect();
    for &(i, _) in &outliers {
        newmask[i] = false;
    }

    let changed = newmask.iter().zip(outmask.iter()).any(|(a, b)| a != b);
    outmask.copy_from_slice(&newmask);
    changed
}

/// Fit-and-clip until convergence or `maxiter` iterations.
///
/// `fit` receives the current inclusion mask and returns the model evaluated
/// at every point. Excessive rejection is not an error; the last fit is
/// returned along with its mask.
pub fn iterative_fit<F>(
    data: &[f64],
    invvar: Option<&[f64]>,
    inmask: &[bool],
    maxiter: usize,
    rejection: &Rejection,
    mut fit: F,
) -> Result<RobustFit>
where
    F: FnMut(&[bool]) -> Result<Vec<f64>>,
{
    let mut outmask = inmask.to_vec();
    let mut model = fit(&outmask)?;
    let mut iterations = 1;

    while iterations < maxiter.max(1) {
        let residuals: Vec<f64> = data.iter().zip(&model).map(|(d, m)| d - m).collect();
        if !reject_step(&residuals, invvar, inmask, &mut outmask, rejection) {
            break;
        }
        model = fit(&outmask)?;
        iterations += 1;
    }

    debug!(
        "Robust fit: {} iterations, {}/{} points kept",
        iterations,
        outmask.iter().filter(|&&m| m).count(),
        inmask.iter().filter(|&&m| m).count()
    );
    Ok(RobustFit {
        model,
        mask: outmask,
        iterations,
    })
}
