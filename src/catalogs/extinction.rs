//! Site-specific atmospheric extinction.
//!
//! Sites are listed in `extinction/sites.csv` (`file,name,lon,lat`); each site's
//! curve is a two-column `wave mag_ext` table giving the extinction in magnitudes
//! per unit airmass. The observatory is matched to the nearest site by
//! great-circle separation of its geographic coordinates.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{info, warn};

use super::{csv_field, csv_reader, read_two_columns};
use crate::coords::SkyCoord;
use crate::error::{FluxError, Result};
use crate::interp::{interp_linear, Extrapolate};

/// Default matching tolerance between observatory and catalog site, degrees.
pub const SITE_TOLERANCE_DEG: f64 = 5.0;

/// One row of the extinction-site index.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtinctionSite {
    pub name: String,
    /// Curve file, relative to the extinction directory.
    pub file: String,
    pub longitude_deg: f64,
    pub latitude_deg: f64,
}

impl ExtinctionSite {
    pub fn coord(&self) -> SkyCoord {
        SkyCoord::from_degrees(self.longitude_deg, self.latitude_deg)
    }
}

/// Extinction in magnitudes per airmass as a function of wavelength.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtinctionCurve {
    pub site: String,
    /// Wavelength in Angstrom, ascending.
    pub wave: Vec<f64>,
    pub mag_ext: Vec<f64>,
}

/// Load the site index table.
pub fn load_extinction_sites<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<ExtinctionSite>> {
    let path = path.as_ref();
    let mut rdr = csv_reader(path)?;
    let headers = rdr.headers()?.clone();
    rdr.records()
        .map(|result| {
            let record = result?;
            Ok(ExtinctionSite {
                name: csv_field(&headers, &record, "name")?.to_string(),
                file: csv_field(&headers, &record, "file")?.to_string(),
                longitude_deg: csv_field(&headers, &record, "lon")?.parse()?,
                latitude_deg: csv_field(&headers, &record, "lat")?.parse()?,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()
        .with_context(|| format!("loading extinction sites from {}", path.display()))
}

/// Load a site's extinction curve.
pub fn load_extinction_curve<P: AsRef<Path>>(
    path: P,
    site: &str,
) -> anyhow::Result<ExtinctionCurve> {
    let (wave, mag_ext) = read_two_columns(path)?;
    Ok(ExtinctionCurve {
        site: site.to_string(),
        wave,
        mag_ext,
    })
}

/// Find the catalog site nearest to the observatory, if within `toler_deg`.
pub fn find_extinction_site(
    sites: &[ExtinctionSite],
    longitude_deg: f64,
    latitude_deg: f64,
    toler_deg: f64,
) -> Option<&ExtinctionSite> {
    let observatory = SkyCoord::from_degrees(longitude_deg, latitude_deg);
    let (site, sep) = sites
        .iter()
        .map(|s| (s, observatory.separation_deg(&s.coord())))
        .min_by(|a, b| a.1.total_cmp(&b.1))?;
    if sep < toler_deg {
        info!("Using {} ({}) for extinction corrections", site.file, site.name);
        Some(site)
    } else {
        warn!(
            "No extinction site within {:.1} deg of lon={:.3}, lat={:.3} (closest {} at {:.1} deg); applying none",
            toler_deg, longitude_deg, latitude_deg, site.name, sep
        );
        None
    }
}

/// Resolve a site file name against the extinction directory.
pub fn site_curve_path(dir: &Path, site: &ExtinctionSite) -> PathBuf {
    dir.join(&site.file)
}

/// Multiplicative flux correction `10^(0.4 · mag_ext(λ) · airmass)` at each wavelength.
///
/// Wavelengths outside the curve's span hold the nearest in-range value.
/// If no wavelength falls inside the curve, no correction is applied (all ones).
pub fn extinction_correction(
    wave: &[f64],
    airmass: f64,
    curve: &ExtinctionCurve,
) -> Result<Vec<f64>> {
    if !(airmass >= 1.0) {
        return Err(FluxError::InvalidInput(format!(
            "bad airmass value {airmass} in extinction correction"
        )));
    }
    let mut mag_ext = interp_linear(&curve.wave, &curve.mag_ext, wave, Extrapolate::Fill(0.0));

    let first = mag_ext.iter().position(|&m| m > 0.0);
    let last = mag_ext.iter().rposition(|&m| m > 0.0);
    match (first, last) {
        (Some(first), Some(last)) => {
            if first > 0 {
                warn!("Extrapolating extinction at low wavelengths using last valid value");
                let edge = mag_ext[first];
                mag_ext[..first].iter_mut().for_each(|m| *m = edge);
            }
            if last + 1 < mag_ext.len() {
                warn!("Extrapolating extinction at high wavelengths using last valid value");
                let edge = mag_ext[last];
                mag_ext[last + 1..].iter_mut().for_each(|m| *m = edge);
            }
        }
        _ => {
            warn!("No valid extinction data in this wavelength range; extinction correction not applied");
        }
    }

    Ok(mag_ext
        .iter()
        .map(|&m| 10f64.powf(0.4 * m * airmass))
        .collect())
}
