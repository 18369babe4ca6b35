//! Apply a sensitivity function to observed spectra.
//!
//! ```text
//! flam      = counts · S / t_exp
//! flam_ivar = ivar / (S / t_exp)²
//! ```
//!
//! where `S` is the record's sensitivity resampled onto the spectrum, divided
//! by an optional telluric transmission and multiplied by the extinction
//! correction. Pixels without positive sensitivity are masked and zeroed.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::catalogs::extinction::{extinction_correction, ExtinctionCurve};
use crate::catalogs::store::CalibrationData;
use crate::error::{ensure_same_len, FluxError, Result};
use crate::sensfunc::{ExtinctionRequest, SensFuncRecord};
use crate::spectrum::ObservedSpectrum;

/// Transmission below this value is treated as opaque.
pub const TRANSMISSION_FLOOR: f64 = 1e-10;

/// Flux-calibrated spectrum in `FLUX_SCALE` units.
#[derive(Debug, Clone, PartialEq)]
pub struct FluxedSpectrum {
    pub flam: Vec<f64>,
    pub flam_ivar: Vec<f64>,
    pub mask: Vec<bool>,
}

impl FluxedSpectrum {
    /// Multiply the flux by `factor`, propagating the inverse variance.
    pub fn scale(&mut self, factor: f64) {
        for (f, iv) in self.flam.iter_mut().zip(self.flam_ivar.iter_mut()) {
            *f *= factor;
            *iv /= factor * factor;
        }
    }
}

/// Observation-specific inputs to [`apply_sensfunc`].
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyRequest {
    pub airmass: f64,
    pub exptime: f64,
    /// Extinction curve of the observing site, if correcting.
    pub extinction: Option<Arc<ExtinctionCurve>>,
}

impl ApplyRequest {
    pub fn new(airmass: f64, exptime: f64) -> Self {
        Self {
            airmass,
            exptime,
            extinction: None,
        }
    }

    /// Attach the site extinction curve named by `request`; no curve is
    /// attached when the site lookup fails.
    pub fn with_extinction(
        mut self,
        request: ExtinctionRequest,
        data: &CalibrationData,
    ) -> Result<Self> {
        if let ExtinctionRequest::Site { longitude, latitude } = request {
            if !longitude.is_finite() || !latitude.is_finite() {
                return Err(FluxError::Configuration(
                    "extinction correction requested without observatory coordinates".into(),
                ));
            }
            self.extinction = data.extinction_curve(longitude, latitude)?;
        }
        Ok(self)
    }
}

/// Convert counts to flux with a sensitivity already on the spectrum's grid.
///
/// With no `mask`, pixels with positive inverse variance and non-negative
/// counts are usable. Output pixels are masked (and zeroed) where the input
/// mask is unset, the sensitivity is not positive, or the inverse variance is
/// not positive.
pub fn flux_calibrate(
    counts: &[f64],
    ivar: &[f64],
    mask: Option<&[bool]>,
    sens_total: &[f64],
    exptime: f64,
) -> Result<FluxedSpectrum> {
    ensure_same_len("flux calibration", &[counts.len(), ivar.len(), sens_total.len()])?;
    if let Some(m) = mask {
        ensure_same_len("flux calibration mask", &[counts.len(), m.len()])?;
    }
    if !(exptime > 0.0) {
        return Err(FluxError::InvalidInput(format!("exposure time {exptime} must be positive")));
    }

    let n = counts.len();
    let mut out = FluxedSpectrum {
        flam: vec![0.0; n],
        flam_ivar: vec![0.0; n],
        mask: vec![false; n],
    };
    for i in 0..n {
        let usable = match mask {
            Some(m) => m[i],
            None => counts[i] >= 0.0,
        };
        let sens = sens_total[i];
        if !(usable && sens > 0.0 && ivar[i] > 0.0) {
            continue;
        }
        let gain = sens / exptime;
        out.flam[i] = counts[i] * gain;
        out.flam_ivar[i] = ivar[i] / (gain * gain);
        out.mask[i] = true;
    }
    Ok(out)
}

/// Total sensitivity for a spectrum: resampled record, telluric division,
/// extinction correction.
pub fn total_sensitivity(
    record: &SensFuncRecord,
    wave: &[f64],
    telluric: Option<&[f64]>,
    request: &ApplyRequest,
) -> Result<Vec<f64>> {
    let mut sens = record.sensfunc_at(wave);
    if wave.iter().any(|&w| w < record.wave_min || w > record.wave_max) {
        warn!(
            "Spectrum extends beyond the sensitivity function ({:.1}-{:.1} A); those pixels are masked",
            record.wave_min, record.wave_max
        );
    }

    if let Some(trans) = telluric {
        ensure_same_len("telluric transmission", &[wave.len(), trans.len()])?;
        for (s, &t) in sens.iter_mut().zip(trans) {
            *s = if t > TRANSMISSION_FLOOR { *s / t } else { 0.0 };
        }
    }

    if let Some(curve) = &request.extinction {
        let corr = extinction_correction(wave, request.airmass, curve)?;
        sens.iter_mut().zip(&corr).for_each(|(s, c)| *s *= c);
    } else {
        debug!("No extinction correction applied");
    }
    Ok(sens)
}

/// Flux-calibrate one spectrum with a sensitivity-function record.
pub fn apply_sensfunc(
    record: &SensFuncRecord,
    spec: &ObservedSpectrum,
    telluric: Option<&[f64]>,
    request: &ApplyRequest,
) -> Result<FluxedSpectrum> {
    let sens = total_sensitivity(record, &spec.wave, telluric, request)?;
    flux_calibrate(
        &spec.counts,
        &spec.ivar,
        spec.mask.as_deref(),
        &sens,
        request.exptime,
    )
}

/// Calibrate independent orders, pairing `records[i]` with `spectra[i]`.
pub fn apply_orders(
    records: &[SensFuncRecord],
    spectra: &[ObservedSpectrum],
    request: &ApplyRequest,
) -> Result<Vec<FluxedSpectrum>> {
    if records.len() != spectra.len() {
        return Err(FluxError::InvalidInput(format!(
            "{} sensitivity functions for {} orders",
            records.len(),
            spectra.len()
        )));
    }
    records
        .par_iter()
        .zip(spectra.par_iter())
        .map(|(record, spec)| apply_sensfunc(record, spec, None, request))
        .collect()
}
