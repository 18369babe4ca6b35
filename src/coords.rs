//! Sky coordinates and angular separations.
//!
//! Coordinates are held in degrees and converted to unit vectors on the
//! celestial sphere for separation computations. Separations use the
//! `atan2(|a × b|, a · b)` form, which stays accurate for both tiny and
//! near-antipodal angles and returns exactly zero for identical positions.

use nalgebra::Vector3;

use crate::error::{FluxError, Result};

/// A position on the sphere (RA/Dec, or longitude/latitude for sites), in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyCoord {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

impl SkyCoord {
    pub fn from_degrees(ra_deg: f64, dec_deg: f64) -> Self {
        Self { ra_deg, dec_deg }
    }

    /// Parse a coordinate pair given either as decimal degrees (`"76.6525"`,
    /// `"52.86694"`) or as sexagesimal strings (`"05:06:36.6"`, `"+52:52:01.0"`).
    ///
    /// If both values parse as plain numbers they are taken as degrees;
    /// otherwise RA is read as hours and Dec as degrees.
    pub fn parse(ra: &str, dec: &str) -> Result<Self> {
        let ra = ra.trim();
        let dec = dec.trim();
        if let (Ok(ra_deg), Ok(dec_deg)) = (ra.parse::<f64>(), dec.parse::<f64>()) {
            return Ok(Self::from_degrees(ra_deg, dec_deg));
        }
        let ra_hours = parse_sexagesimal(ra)
            .ok_or_else(|| FluxError::InvalidInput(format!("cannot parse RA {ra:?}")))?;
        let dec_deg = parse_sexagesimal(dec)
            .ok_or_else(|| FluxError::InvalidInput(format!("cannot parse Dec {dec:?}")))?;
        Ok(Self::from_degrees(ra_hours * 15.0, dec_deg))
    }

    /// Unit vector pointing to this position.
    pub fn uvec(&self) -> Vector3<f64> {
        let (sin_ra, cos_ra) = self.ra_deg.to_radians().sin_cos();
        let (sin_dec, cos_dec) = self.dec_deg.to_radians().sin_cos();
        Vector3::new(cos_dec * cos_ra, cos_dec * sin_ra, sin_dec)
    }

    /// Great-circle separation to `other`, in degrees.
    pub fn separation_deg(&self, other: &SkyCoord) -> f64 {
        let a = self.uvec();
        let b = other.uvec();
        a.cross(&b).norm().atan2(a.dot(&b)).to_degrees()
    }
}

/// Parse `[+-]DD:MM:SS.s` (also accepting spaces as separators) into a decimal value
/// in the leading unit.
pub fn parse_sexagesimal(s: &str) -> Option<f64> {
    let s = s.trim();
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let mut parts = body
        .split(|c: char| c == ':' || c.is_whitespace())
        .filter(|p| !p.is_empty());
    let whole: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0.0,
    };
    let seconds: f64 = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0.0,
    };
    if parts.next().is_some() || whole < 0.0 {
        return None;
    }
    let value = whole + minutes / 60.0 + seconds / 3600.0;
    Some(if negative { -value } else { value })
}
