//! Photometric filter curves and synthetic AB magnitudes.
//!
//! Used to tie a flux-calibrated spectrum to a known broadband magnitude,
//! e.g. to correct for slit losses.

use std::path::Path;

use tracing::info;

use crate::catalogs::read_two_columns;
use crate::error::{ensure_same_len, FluxError, Result};
use crate::interp::{interp_linear, Extrapolate};
use crate::spectrum::FLUX_SCALE;

/// Speed of light in Angstrom per second.
pub const C_ANGSTROM_PER_S: f64 = 2.997_924_58e18;

/// Filter throughput as a function of wavelength (Angstrom).
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCurve {
    pub name: String,
    pub wave: Vec<f64>,
    pub throughput: Vec<f64>,
}

impl FilterCurve {
    pub fn load<P: AsRef<Path>>(path: P, name: &str) -> anyhow::Result<Self> {
        let (wave, throughput) = read_two_columns(path)?;
        Ok(Self {
            name: name.to_string(),
            wave,
            throughput,
        })
    }
}

/// Synthetic AB magnitude of `flam` (in [`FLUX_SCALE`] units) through `filter`.
///
/// Only pixels with `mask` set and outside every `(lo, hi)` window in
/// `ignore` contribute.
pub fn synthetic_ab_magnitude(
    wave: &[f64],
    flam: &[f64],
    mask: Option<&[bool]>,
    filter: &FilterCurve,
    ignore: &[(f64, f64)],
) -> Result<f64> {
    ensure_same_len("synthetic photometry", &[wave.len(), flam.len()])?;
    if let Some(m) = mask {
        ensure_same_len("synthetic photometry", &[wave.len(), m.len()])?;
    }

    let (fw, ff): (Vec<f64>, Vec<f64>) = wave
        .iter()
        .zip(flam)
        .enumerate()
        .filter(|&(i, (&w, _))| {
            mask.map_or(true, |m| m[i]) && !ignore.iter().any(|&(lo, hi)| w > lo && w < hi)
        })
        .map(|(_, (&w, &f))| (w, f))
        .unzip();

    let tput = interp_linear(&filter.wave, &filter.throughput, &fw, Extrapolate::Fill(0.0));
    let norm: f64 = tput.iter().sum();
    if !(norm > 0.0) {
        return Err(FluxError::InvalidInput(format!(
            "spectrum does not overlap filter {}",
            filter.name
        )));
    }

    let wflam = ff.iter().zip(&tput).map(|(f, t)| f * t).sum::<f64>() / norm * FLUX_SCALE;
    let mean_wv = fw.iter().zip(&tput).map(|(w, t)| w * t).sum::<f64>() / norm;
    if !(wflam > 0.0) {
        return Err(FluxError::InvalidInput(format!(
            "non-positive mean flux through filter {}",
            filter.name
        )));
    }
    let fnu = wflam * mean_wv * mean_wv / C_ANGSTROM_PER_S;
    Ok(-2.5 * fnu.log10() - 48.6)
}

/// Multiplicative factor that brings the spectrum's synthetic AB magnitude in
/// `filter` to `target_mag`.
pub fn scale_to_ab_magnitude(
    wave: &[f64],
    flam: &[f64],
    mask: Option<&[bool]>,
    filter: &FilterCurve,
    target_mag: f64,
    ignore: &[(f64, f64)],
) -> Result<f64> {
    let ab = synthetic_ab_magnitude(wave, flam, mask, filter, ignore)?;
    let scale = 10f64.powf((ab - target_mag) / 2.5);
    info!(
        "Scaling spectrum by {:.4} to match {} = {:.3} (synthetic {:.3})",
        scale, filter.name, target_mag, ab
    );
    Ok(scale)
}
