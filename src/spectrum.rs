//! Spectral containers shared by every stage of the calibration.
//!
//! Fluxes of true-flux models are stored in units of [`FLUX_SCALE`]
//! erg s⁻¹ cm⁻² Å⁻¹ so that typical standard-star values sit near unity.

use crate::error::{ensure_same_len, FluxError, Result};

/// Internal flux unit: true-flux models are stored as multiples of this value
/// in erg s⁻¹ cm⁻² Å⁻¹.
pub const FLUX_SCALE: f64 = 1e-17;

/// A 1-D extracted spectrum as produced by upstream extraction.
///
/// `wave` is in Angstrom and non-decreasing; `counts` and `ivar` are aligned with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedSpectrum {
    pub wave: Vec<f64>,
    pub counts: Vec<f64>,
    pub ivar: Vec<f64>,
    /// Optional upstream quality mask (`true` = usable).
    pub mask: Option<Vec<bool>>,
}

impl ObservedSpectrum {
    /// Build a spectrum, checking array alignment and wavelength ordering.
    pub fn new(wave: Vec<f64>, counts: Vec<f64>, ivar: Vec<f64>) -> Result<Self> {
        ensure_same_len("observed spectrum", &[wave.len(), counts.len(), ivar.len()])?;
        if wave.is_empty() {
            return Err(FluxError::InvalidInput("observed spectrum is empty".into()));
        }
        if wave.windows(2).any(|w| w[1] < w[0]) {
            return Err(FluxError::InvalidInput(
                "observed wavelengths must be non-decreasing".into(),
            ));
        }
        Ok(Self {
            wave,
            counts,
            ivar,
            mask: None,
        })
    }

    /// Attach an upstream quality mask.
    pub fn with_mask(mut self, mask: Vec<bool>) -> Result<Self> {
        ensure_same_len("observed spectrum mask", &[self.wave.len(), mask.len()])?;
        self.mask = Some(mask);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.wave.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wave.is_empty()
    }
}

/// Where a true-flux model came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelProvenance {
    /// An archived calibrated spectrum; carries the catalog tag (e.g. `"calspec"`).
    Archive(String),
    /// The Vega reference spectrum rescaled to the target magnitude.
    Vega,
    /// A Kurucz model-grid spectrum scaled to the target distance.
    GridModel,
}

impl std::fmt::Display for ModelProvenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelProvenance::Archive(source) => write!(f, "{source}"),
            ModelProvenance::Vega => write!(f, "vega"),
            ModelProvenance::GridModel => write!(f, "grid-model"),
        }
    }
}

/// The (wavelength, flux) description of a standard star's true spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct TrueFluxModel {
    /// Wavelength in Angstrom, ascending.
    pub wave: Vec<f64>,
    /// Flux density in units of [`FLUX_SCALE`] erg s⁻¹ cm⁻² Å⁻¹.
    pub flux: Vec<f64>,
    /// Star name or spectral type.
    pub name: String,
    /// Reference to the file the model was built from.
    pub cal_file: String,
    pub provenance: ModelProvenance,
    /// Catalog RA/Dec strings when the model came from an archive.
    pub ra: Option<String>,
    pub dec: Option<String>,
}

impl TrueFluxModel {
    /// Build a model from raw arrays, sorting by wavelength if necessary.
    pub fn new(
        mut wave: Vec<f64>,
        mut flux: Vec<f64>,
        name: impl Into<String>,
        cal_file: impl Into<String>,
        provenance: ModelProvenance,
    ) -> Result<Self> {
        ensure_same_len("true flux model", &[wave.len(), flux.len()])?;
        if wave.len() < 2 {
            return Err(FluxError::InvalidInput(
                "true flux model needs at least two samples".into(),
            ));
        }
        if wave.windows(2).any(|w| w[1] < w[0]) {
            let mut pairs: Vec<(f64, f64)> = wave.into_iter().zip(flux).collect();
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
            (wave, flux) = pairs.into_iter().unzip();
        }
        Ok(Self {
            wave,
            flux,
            name: name.into(),
            cal_file: cal_file.into(),
            provenance,
            ra: None,
            dec: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observed_spectrum_validates_shape() {
        assert!(ObservedSpectrum::new(vec![1.0, 2.0], vec![1.0], vec![1.0, 1.0]).is_err());
        assert!(ObservedSpectrum::new(vec![2.0, 1.0], vec![1.0; 2], vec![1.0; 2]).is_err());
        assert!(ObservedSpectrum::new(vec![], vec![], vec![]).is_err());
        let s = ObservedSpectrum::new(vec![1.0, 1.0, 2.0], vec![1.0; 3], vec![1.0; 3]).unwrap();
        assert_eq!(s.len(), 3);
        assert!(s.clone().with_mask(vec![true; 2]).is_err());
        assert!(s.with_mask(vec![true; 3]).unwrap().mask.is_some());
    }

    #[test]
    fn true_flux_model_sorts_by_wavelength() {
        let m = TrueFluxModel::new(
            vec![5000.0, 4000.0, 6000.0],
            vec![2.0, 1.0, 3.0],
            "test",
            "test.dat",
            ModelProvenance::Vega,
        )
        .unwrap();
        assert_eq!(m.wave, vec![4000.0, 5000.0, 6000.0]);
        assert_eq!(m.flux, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn provenance_tags() {
        assert_eq!(ModelProvenance::Vega.to_string(), "vega");
        assert_eq!(ModelProvenance::GridModel.to_string(), "grid-model");
        assert_eq!(ModelProvenance::Archive("calspec".into()).to_string(), "calspec");
    }
}
