//! Global polynomial fit with iterative rejection.

use nalgebra::{DMatrix, DVector};
use tracing::warn;

use super::reject::{iterative_fit, Rejection, ResidualScale, RobustFit};
use crate::error::{ensure_same_len, Result};

/// Configuration for [`fit_polynomial`].
#[derive(Debug, Clone, PartialEq)]
pub struct PolyFitConfig {
    /// Polynomial order (number of coefficients minus one).
    pub order: usize,
    pub maxiter: usize,
    /// Rejection threshold below the model, in sigma.
    pub lower: f64,
    /// Rejection threshold above the model, in sigma.
    pub upper: f64,
    pub maxrej: Option<usize>,
    /// Scale residuals by the median absolute deviation instead of `invvar`.
    pub use_mad: bool,
    pub sticky: bool,
}

impl Default for PolyFitConfig {
    fn default() -> Self {
        Self {
            order: 4,
            maxiter: 35,
            lower: 3.0,
            upper: 3.0,
            maxrej: None,
            use_mad: true,
            sticky: true,
        }
    }
}

impl PolyFitConfig {
    pub fn rejection(&self) -> Rejection {
        Rejection {
            lower: self.lower,
            upper: self.upper,
            maxrej: self.maxrej,
            scale: if self.use_mad {
                ResidualScale::Mad
            } else {
                ResidualScale::InverseVariance
            },
            sticky: self.sticky,
        }
    }
}

/// Polynomial in `t = (2x − (xmin + xmax)) / (xmax − xmin)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    /// Coefficients, constant term first.
    pub coeffs: Vec<f64>,
    pub xmin: f64,
    pub xmax: f64,
}

impl Polynomial {
    fn normalize(&self, x: f64) -> f64 {
        let span = self.xmax - self.xmin;
        if span > 0.0 {
            (2.0 * x - (self.xmin + self.xmax)) / span
        } else {
            0.0
        }
    }

    pub fn eval(&self, x: f64) -> f64 {
        let t = self.normalize(x);
        self.coeffs.iter().rev().fold(0.0, |acc, &c| acc * t + c)
    }

    /// Weighted least-squares fit over the points where `mask` is set.
    ///
    /// Points with zero weight contribute nothing. With no usable points every
    /// coefficient is zero.
    pub fn fit(x: &[f64], y: &[f64], weights: Option<&[f64]>, mask: &[bool], order: usize) -> Self {
        let xmin = x.iter().copied().fold(f64::INFINITY, f64::min);
        let xmax = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut poly = Self {
            coeffs: vec![0.0; order + 1],
            xmin,
            xmax,
        };

        let rows: Vec<usize> = (0..x.len())
            .filter(|&i| mask[i] && weights.map_or(true, |w| w[i] > 0.0))
            .collect();
        if rows.is_empty() {
            return poly;
        }

        let ncoef = order + 1;
        let mut a_mat = DMatrix::<f64>::zeros(rows.len(), ncoef);
        let mut b_vec = DVector::<f64>::zeros(rows.len());
        for (row, &i) in rows.iter().enumerate() {
            let w = weights.map_or(1.0, |w| w[i].sqrt());
            let t = poly.normalize(x[i]);
            let mut tk = 1.0;
            for k in 0..ncoef {
                a_mat[(row, k)] = w * tk;
                tk *= t;
            }
            b_vec[row] = w * y[i];
        }

        let svd = a_mat.svd(true, true);
        let coeffs = svd
            .solve(&b_vec, 1e-12)
            .unwrap_or_else(|_| DVector::zeros(ncoef));
        poly.coeffs = coeffs.iter().copied().collect();
        poly
    }
}

/// Outcome of [`fit_polynomial`].
#[derive(Debug, Clone, PartialEq)]
pub struct PolyFit {
    pub poly: Polynomial,
    pub fit: RobustFit,
}

/// Iteratively rejecting polynomial fit of `y(x)` over `inmask`.
///
/// The returned model is evaluated at every `x`, including masked points.
pub fn fit_polynomial(
    x: &[f64],
    y: &[f64],
    invvar: Option<&[f64]>,
    inmask: &[bool],
    config: &PolyFitConfig,
) -> Result<PolyFit> {
    ensure_same_len("polynomial fit", &[x.len(), y.len(), inmask.len()])?;
    if let Some(iv) = invvar {
        ensure_same_len("polynomial fit", &[x.len(), iv.len()])?;
    }
    let ngood = inmask.iter().filter(|&&m| m).count();
    if ngood <= config.order {
        warn!(
            "Only {} points for an order-{} polynomial; fit is underdetermined",
            ngood, config.order
        );
    }

    let mut last = None;
    let fit = iterative_fit(y, invvar, inmask, config.maxiter, &config.rejection(), |mask| {
        let poly = Polynomial::fit(x, y, invvar, mask, config.order);
        let model = x.iter().map(|&xi| poly.eval(xi)).collect();
        last = Some(poly);
        Ok(model)
    })?;

    let poly = last.unwrap_or(Polynomial {
        coeffs: vec![0.0; config.order + 1],
        xmin: 0.0,
        xmax: 0.0,
    });
    Ok(PolyFit { poly, fit })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn exact_polynomial_recovered() {
        let x: Vec<f64> = (0..50).map(|i| 4000.0 + 100.0 * i as f64).collect();
        let f = |x: f64| 1.5 - 2e-4 * x + 3e-8 * x * x;
        let y: Vec<f64> = x.iter().map(|&x| f(x)).collect();
        let out = fit_polynomial(&x, &y, None, &vec![true; 50], &PolyFitConfig {
            order: 2,
            ..Default::default()
        })
        .unwrap();
        for (&xi, &m) in x.iter().zip(&out.fit.model) {
            assert_relative_eq!(m, f(xi), epsilon = 1e-9);
        }
        assert_relative_eq!(out.poly.eval(10000.0), f(10000.0), epsilon = 1e-9);
    }

    #[test]
    fn outliers_rejected_and_masked_points_evaluated() {
        let mut rng = StdRng::seed_from_u64(42);
        let noise = Normal::new(0.0, 0.01).unwrap();
        let x: Vec<f64> = (0..200).map(|i| i as f64).collect();
        let mut y: Vec<f64> = x.iter().map(|&x| 2.0 + 0.01 * x + noise.sample(&mut rng)).collect();
        for i in [13, 77, 150] {
            y[i] += 5.0;
        }
        let mut inmask = vec![true; 200];
        inmask[100] = false;
        y[100] = -100.0;

        let out = fit_polynomial(&x, &y, None, &inmask, &PolyFitConfig {
            order: 1,
            ..Default::default()
        })
        .unwrap();
        for i in [13, 77, 150, 100] {
            assert!(!out.fit.mask[i]);
        }
        assert!((out.fit.model[100] - 3.0).abs() < 0.01);
        assert!((out.poly.coeffs[1] - 0.995).abs() < 0.01);
    }

    #[test]
    fn empty_mask_gives_zero_model() {
        let x = [1.0, 2.0, 3.0];
        let y = [1.0, 2.0, 3.0];
        let out = fit_polynomial(&x, &y, None, &[false; 3], &PolyFitConfig::default()).unwrap();
        assert_eq!(out.fit.model, vec![0.0; 3]);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        assert!(fit_polynomial(&[1.0, 2.0], &[1.0], None, &[true, true], &PolyFitConfig::default())
            .is_err());
    }
}
