//! Sensitivity-function assembly.
//!
//! A sensitivity function converts observed counts per second into flux
//! density. It is derived from a standard-star exposure by comparing the
//! observed spectrum with the star's true flux in magnitude space:
//!
//! ```text
//! log_ratio(λ) = 2.5 log10 f_true(λ) − 2.5 log10 (counts(λ) / t_exp)
//! sensfunc(λ)  = 10^(0.4 · log_ratio(λ))
//! ```
//!
//! Assembly runs through a fixed sequence of stages (see [`AssemblyStage`]):
//! counts are converted to rates and corrected for extinction, the true-flux
//! model is resolved and resampled, masks are computed, the log ratio is fitted
//! (polynomial reference, plus a breakpoint spline in smooth mode), clamped or
//! line-contaminated pixels are patched with the polynomial, and the result is
//! packaged as an immutable [`SensFuncRecord`].
//!
//! Smooth mode (`telluric = false`) yields a spline-smoothed curve suitable for
//! instruments without strong telluric features. Pixelized mode keeps the raw
//! per-pixel ratio so a later telluric fit can absorb atmospheric structure.

use std::path::Path;

use rayon::prelude::*;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalogs::extinction::extinction_correction;
use crate::catalogs::standards::{load_standard_spectrum, StandardSearch, STANDARD_TOLERANCE_ARCMIN};
use crate::catalogs::store::CalibrationData;
use crate::coords::SkyCoord;
use crate::error::{ensure_same_len, FluxError, Result};
use crate::fit::bspline::{breakpoint_spacing, fit_bspline, BsplineFitConfig};
use crate::fit::poly::{fit_polynomial, PolyFitConfig};
use crate::interp::{interp_linear, median, Extrapolate};
use crate::masking::{compute_masks, needs_nir_mask, MaskConfig, MaskTriple};
use crate::spectrum::{ObservedSpectrum, TrueFluxModel};
use crate::stellar::synthesize;

/// Floor applied before taking logarithms of fluxes.
pub const TINY: f64 = 1e-15;
/// Clamp bounds of the log flux ratio, magnitudes.
pub const MAGFUNC_MAX: f64 = 25.0;
pub const MAGFUNC_MIN: f64 = -25.0;

/// Inverse variance assigned to valid log-ratio pixels (σ = 0.1 mag).
const LOGRATIO_IVAR: f64 = 100.0;

/// Hydrogen lines whose windows are patched with the polynomial in pixelized mode.
pub const PATCH_LINES: [f64; 19] = [
    5407.0, 6564.6, 8224.8, 8239.2, 8203.6, 8440.3, 8469.6, 8504.8, 8547.7, 8600.8, 8667.4,
    8752.9, 8865.2, 9017.4, 9229.0, 10049.4, 10938.1, 12818.1, 21655.0,
];

// ── Configuration ───────────────────────────────────────────────────────────

/// Whether and where to correct for atmospheric extinction.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ExtinctionRequest {
    #[default]
    Disabled,
    /// Observatory geographic coordinates in degrees.
    Site { longitude: f64, latitude: f64 },
}

/// Parameters of sensitivity-function assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct SensFuncConfig {
    /// Pixelized output for a later telluric fit instead of a smooth spline.
    pub telluric: bool,
    /// Order of the polynomial reference fit.
    pub poly_norder: usize,
    /// Half width of recombination-line windows, Angstrom.
    pub line_half_width: f64,
    /// Breakpoint spacing in resolution elements (smooth mode).
    pub nresln: f64,
    /// Nominal resolving power λ/Δλ.
    pub resolution: f64,
    /// Transmission threshold of the NIR telluric mask.
    pub trans_thresh: f64,
    /// Patch clamped/contaminated pixels with the polynomial.
    pub polycorrect: bool,
    pub maxiter: usize,
    pub lower: f64,
    pub upper: f64,
    pub extinction: ExtinctionRequest,
}

impl Default for SensFuncConfig {
    fn default() -> Self {
        Self {
            telluric: false,
            poly_norder: 4,
            line_half_width: 5.0,
            nresln: 20.0,
            resolution: 3000.0,
            trans_thresh: 0.9,
            polycorrect: true,
            maxiter: 35,
            lower: 3.0,
            upper: 3.0,
            extinction: ExtinctionRequest::Disabled,
        }
    }
}

impl SensFuncConfig {
    fn mask_config(&self) -> MaskConfig {
        MaskConfig {
            mask_lines: true,
            mask_telluric: true,
            line_half_width: self.line_half_width,
            telluric_threshold: self.trans_thresh,
        }
    }

    fn poly_config(&self) -> PolyFitConfig {
        PolyFitConfig {
            order: self.poly_norder,
            maxiter: self.maxiter,
            lower: self.lower,
            upper: self.upper,
            maxrej: None,
            use_mad: true,
            sticky: true,
        }
    }
}

/// How the standard star is identified.
///
/// Coordinates alone select an archived spectrum; a spectral type with a V
/// magnitude selects a synthetic model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StandardQuery {
    pub ra: Option<String>,
    pub dec: Option<String>,
    pub sptype: Option<String>,
    pub vmag: Option<f64>,
}

impl StandardQuery {
    pub fn at(ra: impl Into<String>, dec: impl Into<String>) -> Self {
        Self {
            ra: Some(ra.into()),
            dec: Some(dec.into()),
            ..Default::default()
        }
    }

    pub fn by_type(sptype: impl Into<String>, vmag: f64) -> Self {
        Self {
            sptype: Some(sptype.into()),
            vmag: Some(vmag),
            ..Default::default()
        }
    }
}

/// Source of the standard's true flux.
#[derive(Debug, Clone, PartialEq)]
pub enum TrueFluxSource {
    Query(StandardQuery),
    Model(TrueFluxModel),
}

/// Resolve a standard star to its true-flux model.
pub fn get_standard_spectrum(query: &StandardQuery, data: &CalibrationData) -> Result<TrueFluxModel> {
    match query {
        StandardQuery {
            ra: Some(ra),
            dec: Some(dec),
            sptype: None,
            vmag: None,
        } => {
            let target = SkyCoord::parse(ra, dec)?;
            match data.find_standard(&target, STANDARD_TOLERANCE_ARCMIN)? {
                StandardSearch::Found(found) => Ok(load_standard_spectrum(&found)?),
                StandardSearch::NotFound { closest } => Err(FluxError::StandardNotFound {
                    tolerance_arcmin: STANDARD_TOLERANCE_ARCMIN,
                    closest: closest.map_or_else(|| "none".to_string(), |c| c.to_string()),
                }),
            }
        }
        StandardQuery {
            sptype: Some(sptype),
            vmag: Some(vmag),
            ..
        } => synthesize(sptype, *vmag, data),
        _ => Err(FluxError::Configuration(
            "standard star needs RA/Dec, or a spectral type and V magnitude".into(),
        )),
    }
}

// ── Assembly stages ─────────────────────────────────────────────────────────

/// Stages of sensitivity-function assembly, in order.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AssemblyStage {
    Init,
    ExtinctionApplied,
    ModelResolved,
    Masked,
    FitPoly,
    FitSpline,
    Patched,
    Packaged,
}

impl std::fmt::Display for AssemblyStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AssemblyStage::Init => "INIT",
            AssemblyStage::ExtinctionApplied => "EXTINCTION_APPLIED",
            AssemblyStage::ModelResolved => "MODEL_RESOLVED",
            AssemblyStage::Masked => "MASKED",
            AssemblyStage::FitPoly => "FIT_POLY",
            AssemblyStage::FitSpline => "FIT_SPLINE",
            AssemblyStage::Patched => "PATCHED",
            AssemblyStage::Packaged => "PACKAGED",
        };
        f.write_str(name)
    }
}

/// Ordered record of the stages an assembly passed through.
#[derive(Debug, Clone)]
struct StageLog {
    history: Vec<AssemblyStage>,
}

impl StageLog {
    fn starting_at(stage: AssemblyStage) -> Self {
        Self {
            history: vec![stage],
        }
    }

    fn current(&self) -> AssemblyStage {
        self.history.last().copied().unwrap_or(AssemblyStage::Init)
    }

    fn advance(&mut self, next: AssemblyStage) {
        debug_assert!(next > self.current(), "stage {next} after {}", self.current());
        debug!("sensfunc: {} -> {}", self.current(), next);
        self.history.push(next);
    }
}

// ── Fitting ─────────────────────────────────────────────────────────────────

/// Sensitivity on the observed grid with its validity mask.
#[derive(Debug, Clone, PartialEq)]
pub struct SensitivityCurve {
    pub sensfunc: Vec<f64>,
    /// Pixels whose log ratio was valid (bad-pixel mask and finite, unclamped ratio).
    pub mask: Vec<bool>,
    /// Final log flux ratio in magnitudes.
    pub log_ratio: Vec<f64>,
    /// Whether polynomial patching was applied.
    pub patched: bool,
}

fn log_flux(f: f64) -> f64 {
    if f.is_nan() {
        f64::NAN
    } else {
        2.5 * f.max(TINY).log10()
    }
}

fn within_clamp(v: f64) -> bool {
    v > MAGFUNC_MIN && v < MAGFUNC_MAX
}

fn at_clamp(v: f64) -> bool {
    v == MAGFUNC_MAX || v == MAGFUNC_MIN
}

/// Fit the sensitivity function of a standard star.
///
/// `flux` is in counts per second (extinction-corrected), `flux_std` the true
/// flux on the same grid. The returned mask combines the bad-pixel mask with
/// the validity of the log ratio; line and telluric masks only restrict the
/// fit.
pub fn standard_sensfunc(
    wave: &[f64],
    flux: &[f64],
    ivar: &[f64],
    flux_std: &[f64],
    masks: &MaskTriple,
    config: &SensFuncConfig,
) -> Result<SensitivityCurve> {
    let mut stages = StageLog::starting_at(AssemblyStage::Masked);
    fit_sensfunc(wave, flux, ivar, flux_std, masks, config, &mut stages)
}

fn fit_sensfunc(
    wave: &[f64],
    flux: &[f64],
    ivar: &[f64],
    flux_std: &[f64],
    masks: &MaskTriple,
    config: &SensFuncConfig,
    stages: &mut StageLog,
) -> Result<SensitivityCurve> {
    let n = wave.len();
    ensure_same_len(
        "sensitivity function",
        &[n, flux.len(), ivar.len(), flux_std.len(), masks.bad.len(), masks.star.len(), masks.tell.len()],
    )?;
    if n < 2 {
        return Err(FluxError::InvalidInput(
            "sensitivity function needs at least two pixels".into(),
        ));
    }

    let logflux_obs: Vec<f64> = flux.iter().map(|&f| log_flux(f)).collect();
    let logflux_std: Vec<f64> = flux_std.iter().map(|&f| log_flux(f)).collect();
    let mut magfunc: Vec<f64> = logflux_std
        .iter()
        .zip(&logflux_obs)
        .map(|(s, o)| (s - o).clamp(MAGFUNC_MIN, MAGFUNC_MAX))
        .collect();

    let masktot: Vec<bool> = (0..n)
        .map(|i| {
            masks.bad[i]
                && magfunc[i] < 0.99 * MAGFUNC_MAX
                && magfunc[i] > 0.99 * MAGFUNC_MIN
                && ivar[i].is_finite()
                && logflux_obs[i].is_finite()
                && logflux_std[i].is_finite()
        })
        .collect();
    let logivar: Vec<f64> = masktot
        .iter()
        .map(|&m| if m { LOGRATIO_IVAR } else { 0.0 })
        .collect();
    let msk_fit: Vec<bool> = (0..n)
        .map(|i| masktot[i] && masks.star[i] && masks.tell[i])
        .collect();
    let nfit = msk_fit.iter().filter(|&&m| m).count();
    debug!("{} of {} pixels enter the sensitivity fit", nfit, n);

    // Polynomial reference
    let poly = fit_polynomial(wave, &magfunc, None, &msk_fit, &config.poly_config())?;
    let poly_model = poly.fit.model;
    stages.advance(AssemblyStage::FitPoly);

    // Ratios that could not be formed take the reference value
    for (m, &p) in magfunc.iter_mut().zip(&poly_model) {
        if !m.is_finite() {
            *m = p.clamp(MAGFUNC_MIN, MAGFUNC_MAX);
        }
    }

    let mut log_ratio = if config.telluric {
        magfunc
    } else {
        let std_pix = median(&wave.windows(2).map(|w| (w[1] - w[0]).abs()).collect::<Vec<_>>())
            .unwrap_or(0.0);
        let std_res = median(&wave.iter().map(|w| w / config.resolution).collect::<Vec<_>>())
            .unwrap_or(0.0);
        let spacing = breakpoint_spacing(config.nresln, std_res, std_pix);
        info!(
            "Spline breakpoints every {:.2} A ({:.1} resolution elements)",
            spacing.bkspace, spacing.nresln
        );
        let spline = fit_bspline(
            wave,
            &magfunc,
            &logivar,
            &msk_fit,
            Some(masktot.as_slice()),
            &BsplineFitConfig {
                bkspace: spacing.bkspace,
                nord: 4,
                maxiter: config.maxiter,
                lower: config.lower,
                upper: config.upper,
                maxrej: Some(5),
            },
        )?;
        stages.advance(AssemblyStage::FitSpline);
        spline
            .fit
            .model
            .into_iter()
            .map(|v| v.clamp(MAGFUNC_MIN, MAGFUNC_MAX))
            .collect()
    };

    // Patch with the polynomial where the reference is trustworthy
    let patched = config.polycorrect && nfit as f64 > 0.5 * n as f64;
    if patched {
        let mut npatch = 0usize;
        for i in 0..n {
            let in_line = config.telluric
                && PATCH_LINES
                    .iter()
                    .any(|&line| (wave[i] - line).abs() <= config.line_half_width);
            let bad_ivar = !ivar[i].is_finite() || ivar[i] <= 0.0;
            if (in_line || at_clamp(log_ratio[i]) || bad_ivar) && within_clamp(poly_model[i]) {
                log_ratio[i] = poly_model[i];
                npatch += 1;
            }
        }
        debug!("Patched {} pixels with the polynomial reference", npatch);
    } else {
        warn!(
            "More than half of the pixels are masked ({} of {} usable); the polynomial \
             reference is unreliable and no patching is applied",
            nfit, n
        );
    }
    stages.advance(AssemblyStage::Patched);

    let sensfunc = log_ratio.iter().map(|&m| 10f64.powf(0.4 * m)).collect();
    Ok(SensitivityCurve {
        sensfunc,
        mask: masktot,
        log_ratio,
        patched,
    })
}

// ── Record ──────────────────────────────────────────────────────────────────

/// A packaged sensitivity function with its provenance.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SensFuncRecord {
    pub wave: Vec<f64>,
    pub sensfunc: Vec<f64>,
    pub mask: Vec<bool>,
    /// True flux resampled onto `wave`, in `FLUX_SCALE` units.
    pub flux_true: Vec<f64>,
    pub airmass: f64,
    pub exptime: f64,
    pub wave_min: f64,
    pub wave_max: f64,
    pub std_name: String,
    /// Catalog tag, `vega` or `grid-model`.
    pub std_source: String,
    pub std_cal_file: String,
    pub std_ra: Option<String>,
    pub std_dec: Option<String>,
    /// Extinction site applied, if any.
    pub extinction_site: Option<String>,
    pub telluric: bool,
    pub stages: Vec<AssemblyStage>,
}

impl SensFuncRecord {
    pub fn len(&self) -> usize {
        self.wave.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wave.is_empty()
    }

    /// Sensitivity resampled onto `wave`; zero outside the record's range.
    pub fn sensfunc_at(&self, wave: &[f64]) -> Vec<f64> {
        interp_linear(&self.wave, &self.sensfunc, wave, Extrapolate::Fill(0.0))
    }

    pub fn to_rkyv_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| anyhow::anyhow!("rkyv serialization failed: {}", e))?;
        Ok(bytes.to_vec())
    }

    pub fn from_rkyv_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {}", e))
    }

    /// Save the record to a file using rkyv.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = self.to_rkyv_bytes()?;
        std::fs::write(path, &bytes)?;
        info!("Saved sensitivity function to {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Load a record from an rkyv file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let record = Self::from_rkyv_bytes(&bytes)?;
        info!(
            "Loaded sensitivity function for {}: {} pixels, {:.1}-{:.1} A",
            record.std_name,
            record.len(),
            record.wave_min,
            record.wave_max
        );
        Ok(record)
    }
}

// ── Assembly ────────────────────────────────────────────────────────────────

/// Interpolate the true flux onto `wave`. When linear extrapolation leaves any
/// pixel non-positive, every pixel outside the model's range takes a robust
/// polynomial fit to the model instead.
fn resample_true_flux(model: &TrueFluxModel, wave: &[f64]) -> Result<Vec<f64>> {
    let mut flux_true = interp_linear(&model.wave, &model.flux, wave, Extrapolate::Linear);
    if flux_true.iter().all(|&f| f > 0.0) {
        return Ok(flux_true);
    }
    warn!(
        "Standard {} does not cover the observed range; extrapolating with a polynomial fit",
        model.name
    );
    let config = PolyFitConfig {
        order: 8,
        maxiter: 50,
        lower: 3.0,
        upper: 3.0,
        maxrej: Some(3),
        use_mad: true,
        sticky: true,
    };
    let fit = fit_polynomial(
        &model.wave,
        &model.flux,
        None,
        &vec![true; model.wave.len()],
        &config,
    )?;
    let (lo, hi) = (model.wave[0], model.wave[model.wave.len() - 1]);
    for (f, &w) in flux_true.iter_mut().zip(wave) {
        if w < lo || w > hi {
            *f = fit.poly.eval(w);
        }
    }
    Ok(flux_true)
}

/// Derive a sensitivity function from a standard-star observation.
pub fn generate_sensfunc(
    spec: &ObservedSpectrum,
    airmass: f64,
    exptime: f64,
    standard: &TrueFluxSource,
    config: &SensFuncConfig,
    data: &CalibrationData,
) -> Result<SensFuncRecord> {
    if !(exptime > 0.0) {
        return Err(FluxError::InvalidInput(format!("exposure time {exptime} must be positive")));
    }
    if !(airmass >= 1.0) {
        return Err(FluxError::InvalidInput(format!("bad airmass value {airmass}")));
    }
    let mut stages = StageLog::starting_at(AssemblyStage::Init);
    let wave = &spec.wave;

    let mut flux: Vec<f64> = spec.counts.iter().map(|c| c / exptime).collect();
    let mut ivar: Vec<f64> = spec.ivar.iter().map(|iv| iv * exptime * exptime).collect();

    let mut extinction_site = None;
    if let ExtinctionRequest::Site { longitude, latitude } = config.extinction {
        if !longitude.is_finite() || !latitude.is_finite() {
            return Err(FluxError::Configuration(
                "extinction correction requested without observatory coordinates".into(),
            ));
        }
        if let Some(curve) = data.extinction_curve(longitude, latitude)? {
            let corr = extinction_correction(wave, airmass, &curve)?;
            for ((f, iv), c) in flux.iter_mut().zip(ivar.iter_mut()).zip(&corr) {
                *f *= c;
                *iv /= c * c;
            }
            extinction_site = Some(curve.site.clone());
        }
    }
    stages.advance(AssemblyStage::ExtinctionApplied);

    let model = match standard {
        TrueFluxSource::Query(query) => get_standard_spectrum(query, data)?,
        TrueFluxSource::Model(model) => model.clone(),
    };
    let flux_true = resample_true_flux(&model, wave)?;
    stages.advance(AssemblyStage::ModelResolved);

    let transmission = if needs_nir_mask(wave) {
        match data.transmission() {
            Ok(curve) => Some(curve),
            Err(e) => {
                warn!("No atmospheric transmission available ({}); NIR telluric mask skipped", e);
                None
            }
        }
    } else {
        None
    };
    let mut masks = compute_masks(wave, &flux, &ivar, &config.mask_config(), transmission)?;
    if let Some(quality) = &spec.mask {
        masks.bad.iter_mut().zip(quality).for_each(|(b, &q)| *b &= q);
    }
    stages.advance(AssemblyStage::Masked);

    let curve = fit_sensfunc(wave, &flux, &ivar, &flux_true, &masks, config, &mut stages)?;

    let wave_min = wave.iter().copied().fold(f64::INFINITY, f64::min);
    let wave_max = wave.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    stages.advance(AssemblyStage::Packaged);
    info!(
        "Sensitivity function for {} ({}): {:.1}-{:.1} A, {} valid pixels",
        model.name,
        model.provenance,
        wave_min,
        wave_max,
        curve.mask.iter().filter(|&&m| m).count()
    );

    Ok(SensFuncRecord {
        wave: wave.clone(),
        sensfunc: curve.sensfunc,
        mask: curve.mask,
        flux_true,
        airmass,
        exptime,
        wave_min,
        wave_max,
        std_name: model.name,
        std_source: model.provenance.to_string(),
        std_cal_file: model.cal_file,
        std_ra: model.ra,
        std_dec: model.dec,
        extinction_site,
        telluric: config.telluric,
        stages: stages.history,
    })
}

/// Sensitivity functions for independent orders of one standard exposure.
///
/// Orders are processed in parallel; each result stands alone.
pub fn generate_orders(
    orders: &[ObservedSpectrum],
    airmass: f64,
    exptime: f64,
    standard: &TrueFluxSource,
    config: &SensFuncConfig,
    data: &CalibrationData,
) -> Vec<Result<SensFuncRecord>> {
    orders
        .par_iter()
        .map(|order| generate_sensfunc(order, airmass, exptime, standard, config, data))
        .collect()
}
