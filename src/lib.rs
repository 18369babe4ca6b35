//! # fluxcal
//!
//! **Spectroscopic flux calibration** of one-dimensional spectra.
//!
//! Given an extracted standard-star spectrum (wavelength, counts, inverse
//! variance), `fluxcal` derives a sensitivity function that converts counts per
//! second into flux density, and applies it to science spectra taken with the
//! same instrument setup.
//!
//! ## Features
//!
//! - **Standard-star resolution** from coordinates across the X-shooter, CALSPEC
//!   and ESO archives, or synthetic spectra from a spectral type and V magnitude
//!   (scaled Vega for A0 stars, Kurucz grid models otherwise)
//! - **Atmospheric extinction** correction from the nearest catalogued site
//! - **Masking** of bad pixels, stellar recombination lines and telluric bands
//! - **Robust fitting** with iterative sigma clipping: polynomial reference and
//!   breakpoint B-spline smoothing
//! - **Pixelized mode** that keeps raw structure for a later telluric fit
//! - **Zero-copy records**: sensitivity functions serialize with
//!   [rkyv](https://docs.rs/rkyv)
//!
//! ## Example
//!
//! ```no_run
//! use fluxcal::{
//!     apply_sensfunc, generate_sensfunc, ApplyRequest, CalibrationData, ObservedSpectrum,
//!     SensFuncConfig, SensFuncRecord, StandardQuery, TrueFluxSource,
//! };
//!
//! let data = CalibrationData::new("data");
//!
//! // Standard star exposure
//! let wave: Vec<f64> = (0..2000).map(|i| 4000.0 + 2.0 * i as f64).collect();
//! let counts = vec![1000.0; wave.len()];
//! let ivar = vec![1e-3; wave.len()];
//! let std_spec = ObservedSpectrum::new(wave, counts, ivar).unwrap();
//!
//! let standard = TrueFluxSource::Query(StandardQuery::at("10:39:36.74", "+43:06:09.3"));
//! let record = generate_sensfunc(
//!     &std_spec,
//!     1.1,
//!     300.0,
//!     &standard,
//!     &SensFuncConfig::default(),
//!     &data,
//! )
//! .unwrap();
//! record.save_to_file("sens.rkyv").unwrap();
//!
//! // Later: calibrate a science exposure
//! let record = SensFuncRecord::load_from_file("sens.rkyv").unwrap();
//! let fluxed = apply_sensfunc(&record, &std_spec, None, &ApplyRequest::new(1.2, 600.0)).unwrap();
//! println!("{} usable pixels", fluxed.mask.iter().filter(|&&m| m).count());
//! ```
//!
//! ## Algorithm overview
//!
//! 1. **Rates**: counts are divided by the exposure time and optionally
//!    corrected for extinction at the observed airmass
//! 2. **True flux**: the standard's spectrum is resolved and resampled onto
//!    the observed grid
//! 3. **Masks**: bad pixels, recombination lines and telluric regions
//! 4. **Fit**: the log flux ratio is fitted with a robust polynomial, then
//!    smoothed with a B-spline (skipped in pixelized mode)
//! 5. **Patch**: clamped or line-contaminated pixels take the polynomial value
//! 6. **Apply**: `flam = counts · S / t_exp` with inverse-variance propagation

pub mod apply;
pub mod catalogs;
pub mod coords;
pub mod error;
pub mod filters;
pub mod fit;
pub mod interp;
pub mod masking;
pub mod sensfunc;
pub mod spectrum;
pub mod stellar;

pub use apply::{apply_orders, apply_sensfunc, flux_calibrate, ApplyRequest, FluxedSpectrum};
pub use catalogs::standards::{StandardMatch, StandardSearch, StandardSource};
pub use catalogs::store::CalibrationData;
pub use coords::SkyCoord;
pub use error::{FluxError, Result};
pub use filters::{scale_to_ab_magnitude, synthetic_ab_magnitude, FilterCurve};
pub use masking::{compute_masks, MaskConfig, MaskTriple};
pub use sensfunc::{
    generate_orders, generate_sensfunc, get_standard_spectrum, standard_sensfunc,
    AssemblyStage, ExtinctionRequest, SensFuncConfig, SensFuncRecord, SensitivityCurve,
    StandardQuery, TrueFluxSource,
};
pub use spectrum::{ModelProvenance, ObservedSpectrum, TrueFluxModel, FLUX_SCALE};
