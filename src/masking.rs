//! Pixel masks over an observed wavelength grid.
//!
//! Three independent masks are computed, `true` meaning usable:
//!
//! - **bad**: instrumental/physical validity (positive ivar and flux, not an
//!   edge pixel, redward of the atmospheric cutoff).
//! - **star**: free of hydrogen recombination lines.
//! - **tell**: free of telluric absorption. Optical bands are fixed intervals;
//!   beyond 9100 Å a reference transmission curve is smoothed to the data's
//!   resolution and thresholded.
//!
//! The masks are never merged here; callers combine them as needed.

use std::path::Path;

use tracing::{debug, info};

use crate::catalogs::read_two_columns;
use crate::error::{ensure_same_len, Result};
use crate::interp::{interp_linear, median, median_spacing, Extrapolate};

/// Blue limit of ground-based transmission, Angstrom.
pub const ATMOSPHERIC_CUTOFF: f64 = 3000.0;

/// Wavelength beyond which the transmission-curve telluric mask applies, Angstrom.
pub const NIR_TELLURIC_START: f64 = 9100.0;

pub const BALMER_LINES: [f64; 11] = [
    3836.4, 3969.6, 3890.1, 4102.8, 4102.8, 4341.6, 4862.7, 5407.0, 6564.6, 8224.8, 8239.2,
];

pub const PASCHEN_LINES: [f64; 16] = [
    8203.6, 8440.3, 8469.6, 8504.8, 8547.7, 8600.8, 8667.4, 8752.9, 8865.2, 9017.4, 9229.0,
    9546.0, 10049.4, 10938.1, 12818.1, 18751.0,
];

pub const BRACKETT_LINES: [f64; 6] = [14584.0, 18174.0, 19446.0, 21655.0, 26252.0, 40512.0];

pub const PFUND_LINES: [f64; 5] = [22788.0, 32961.0, 37395.0, 46525.0, 74578.0];

/// Optical O₂ and H₂O absorption bands, Angstrom.
pub const TELLURIC_BANDS: [(f64, f64); 5] = [
    (6270.0, 6290.0),
    (6850.0, 6960.0),
    (7580.0, 7750.0),
    (7160.0, 7340.0),
    (8150.0, 8250.0),
];

/// Every hydrogen recombination line used for masking.
pub fn recombination_lines() -> impl Iterator<Item = f64> {
    BALMER_LINES
        .into_iter()
        .chain(PASCHEN_LINES)
        .chain(BRACKETT_LINES)
        .chain(PFUND_LINES)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaskConfig {
    pub mask_lines: bool,
    pub mask_telluric: bool,
    /// Half width of each recombination-line window, Angstrom.
    pub line_half_width: f64,
    /// Transmission below which NIR pixels are masked.
    pub telluric_threshold: f64,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            mask_lines: true,
            mask_telluric: true,
            line_half_width: 5.0,
            telluric_threshold: 0.9,
        }
    }
}

/// Bad-pixel, recombination-line and telluric masks on one grid.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskTriple {
    pub bad: Vec<bool>,
    pub star: Vec<bool>,
    pub tell: Vec<bool>,
}

impl MaskTriple {
    /// Pixels usable by all three criteria.
    pub fn combined(&self) -> Vec<bool> {
        self.bad
            .iter()
            .zip(&self.star)
            .zip(&self.tell)
            .map(|((&b, &s), &t)| b && s && t)
            .collect()
    }
}

/// Atmospheric transmission reference curve.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionCurve {
    /// Wavelength in Angstrom, ascending.
    pub wave: Vec<f64>,
    pub transmission: Vec<f64>,
}

impl TransmissionCurve {
    /// Load a two-column table whose wavelengths are in microns.
    pub fn load_microns<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let (wave_um, transmission) = read_two_columns(path)?;
        info!("Loaded atmospheric transmission from {}", path.display());
        Ok(Self {
            wave: wave_um.into_iter().map(|w| w * 1e4).collect(),
            transmission,
        })
    }

    /// Samples within `[lo, hi]`.
    fn window(&self, lo: f64, hi: f64) -> (Vec<f64>, Vec<f64>) {
        self.wave
            .iter()
            .zip(&self.transmission)
            .filter(|(&w, _)| w >= lo && w <= hi)
            .map(|(&w, &t)| (w, t))
            .unzip()
    }
}

/// Gaussian smoothing with reflect boundaries, truncated at 4σ.
pub fn gaussian_smooth(values: &[f64], sigma_px: f64) -> Vec<f64> {
    let n = values.len();
    if n == 0 || !(sigma_px > 0.0) || !sigma_px.is_finite() {
        return values.to_vec();
    }
    let radius = (4.0 * sigma_px + 0.5) as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|k| (-0.5 * (k as f64 / sigma_px).powi(2)).exp())
        .collect();
    let norm: f64 = kernel.iter().sum();

    // Half-sample symmetric reflection: (d c b a | a b c d | d c b a)
    let reflect = |mut i: isize| -> usize {
        let n = n as isize;
        let period = 2 * n;
        i = i.rem_euclid(period);
        if i >= n {
            i = period - 1 - i;
        }
        i as usize
    };

    (0..n as isize)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * values[reflect(i + k as isize - radius)])
                .sum::<f64>()
                / norm
        })
        .collect()
}

/// Convolve a uniformly sampled curve to resolving power `resolution`.
pub fn convolve_to_resolution(wave: &[f64], values: &[f64], resolution: f64) -> Vec<f64> {
    let (Some(mid), Some(dwave)) = (median(wave), median_spacing(wave)) else {
        return values.to_vec();
    };
    let fwhm = mid / resolution;
    let sigma_px = fwhm / 2.355 / dwave;
    debug!("Smoothing transmission to R={:.0} (sigma={:.2} px)", resolution, sigma_px);
    gaussian_smooth(values, sigma_px)
}

/// NIR telluric mask: `false` where transmission at the data's resolution is
/// below `threshold` redward of [`NIR_TELLURIC_START`].
pub fn nir_telluric_mask(wave: &[f64], curve: &TransmissionCurve, threshold: f64) -> Vec<bool> {
    let (Some(&lo), Some(&hi)) = (wave.first(), wave.last()) else {
        return Vec::new();
    };
    let (twave, trans) = curve.window(lo - 100.0, hi + 100.0);
    if twave.len() < 2 {
        return vec![true; wave.len()];
    }
    let resolution = match (median(wave), median_spacing(wave)) {
        (Some(mid), Some(dw)) if dw > 0.0 => mid / dw / 3.0,
        _ => return vec![true; wave.len()],
    };
    let smoothed = convolve_to_resolution(&twave, &trans, resolution);
    let on_grid = interp_linear(&twave, &smoothed, wave, Extrapolate::Linear);
    wave.iter()
        .zip(&on_grid)
        .map(|(&w, &t)| !(t < threshold && w > NIR_TELLURIC_START))
        .collect()
}

/// Bad-pixel mask.
pub fn bad_pixel_mask(wave: &[f64], flux: &[f64], ivar: &[f64]) -> Vec<bool> {
    let n = wave.len();
    (0..n)
        .map(|i| {
            ivar[i] > 0.0
                && flux[i] > 0.0
                && i != 0
                && i + 1 != n
                && wave[i] > ATMOSPHERIC_CUTOFF
        })
        .collect()
}

/// Recombination-line mask; a pixel within `half_width` of any line is masked.
pub fn line_mask(wave: &[f64], half_width: f64) -> Vec<bool> {
    wave.iter()
        .map(|&w| recombination_lines().all(|line| (w - line).abs() > half_width))
        .collect()
}

/// Optical telluric-band mask.
pub fn telluric_band_mask(wave: &[f64]) -> Vec<bool> {
    wave.iter()
        .map(|&w| !TELLURIC_BANDS.iter().any(|&(lo, hi)| w >= lo && w <= hi))
        .collect()
}

/// Compute the mask triple.
///
/// `transmission` is only consulted when telluric masking is on and the grid
/// extends beyond [`NIR_TELLURIC_START`]; pass `None` to skip the NIR mask.
pub fn compute_masks(
    wave: &[f64],
    flux: &[f64],
    ivar: &[f64],
    config: &MaskConfig,
    transmission: Option<&TransmissionCurve>,
) -> Result<MaskTriple> {
    ensure_same_len("masking", &[wave.len(), flux.len(), ivar.len()])?;
    let n = wave.len();

    let bad = bad_pixel_mask(wave, flux, ivar);
    let star = if config.mask_lines {
        line_mask(wave, config.line_half_width)
    } else {
        vec![true; n]
    };

    let mut tell = vec![true; n];
    if config.mask_telluric {
        tell = telluric_band_mask(wave);
        if needs_nir_mask(wave) {
            if let Some(curve) = transmission {
                let nir = nir_telluric_mask(wave, curve, config.telluric_threshold);
                tell.iter_mut().zip(nir).for_each(|(t, ok)| *t &= ok);
            } else {
                debug!("No transmission curve supplied; NIR telluric mask skipped");
            }
        }
    }

    Ok(MaskTriple { bad, star, tell })
}

/// Whether the grid reaches far enough red for the NIR telluric mask.
pub fn needs_nir_mask(wave: &[f64]) -> bool {
    wave.iter().any(|&w| w > NIR_TELLURIC_START)
}
