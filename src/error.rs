//! Error taxonomy for flux calibration.
//!
//! Hard failures (bad airmass, missing site coordinates, not enough information
//! to identify the standard) are returned as [`FluxError`]. Lookups that the
//! caller can reasonably recover from, such as a missing extinction site, are
//! modelled as explicit outcomes ([`Option`], [`StandardSearch`](crate::StandardSearch))
//! at the lower layers and only become a [`FluxError`] where the workflow cannot
//! continue for that record.

use thiserror::Error;

/// Errors produced while building or applying a sensitivity function.
#[derive(Debug, Error)]
pub enum FluxError {
    /// The request is missing required parameters or carries inconsistent ones.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A physical input is out of its valid domain (e.g. airmass < 1).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No archived standard star lies within the matching tolerance.
    #[error("no standard star within {tolerance_arcmin:.1} arcmin; closest was {closest}")]
    StandardNotFound {
        tolerance_arcmin: f64,
        closest: String,
    },

    /// The spectral type has no unique entry in the stellar-parameter table.
    #[error("spectral type {0:?} has no unique tabulated match")]
    UnknownSpectralType(String),

    /// A calibration resource could not be read or parsed.
    #[error(transparent)]
    Data(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FluxError>;

/// Check that every array shares the length of the first one.
pub(crate) fn ensure_same_len(what: &str, lens: &[usize]) -> Result<()> {
    if let Some(&first) = lens.first() {
        if lens.iter().any(|&l| l != first) {
            return Err(FluxError::InvalidInput(format!(
                "{what}: array lengths differ ({lens:?})"
            )));
        }
    }
    Ok(())
}
