//! Archived spectrophotometric standard stars.
//!
//! Three archives are searched in fixed priority order (X-shooter, CALSPEC,
//! ESO). For each archive the entry nearest to the query position is found;
//! the first archive whose nearest entry lies within the tolerance wins. When
//! nothing matches, the globally closest entry is reported for diagnostics.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{info, warn};

use super::{csv_field, csv_reader, read_two_columns};
use crate::coords::SkyCoord;
use crate::spectrum::{ModelProvenance, TrueFluxModel, FLUX_SCALE};

/// Default matching tolerance between a target and an archived standard, arcmin.
pub const STANDARD_TOLERANCE_ARCMIN: f64 = 20.0;

/// The archive a standard star belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardSource {
    Xshooter,
    Calspec,
    Esofil,
}

impl StandardSource {
    /// Search priority, highest first.
    pub const PRIORITY: [StandardSource; 3] = [
        StandardSource::Xshooter,
        StandardSource::Calspec,
        StandardSource::Esofil,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            StandardSource::Xshooter => "xshooter",
            StandardSource::Calspec => "calspec",
            StandardSource::Esofil => "eso",
        }
    }

    /// Directory under `standards/` holding the archive.
    pub fn dir_name(&self) -> &'static str {
        match self {
            StandardSource::Xshooter => "xshooter",
            StandardSource::Calspec => "calspec",
            StandardSource::Esofil => "esofil",
        }
    }

    /// File name of the archive index inside [`dir_name`](Self::dir_name).
    pub fn index_file(&self) -> String {
        format!("{}_info.csv", self.dir_name())
    }

    /// Factor applied to stored fluxes to reach [`FLUX_SCALE`] units.
    ///
    /// X-shooter and CALSPEC spectra are stored in cgs; ESO spectra are
    /// already scaled and are used as stored.
    pub fn flux_factor(&self) -> f64 {
        match self {
            StandardSource::Xshooter | StandardSource::Calspec => 1.0 / FLUX_SCALE,
            StandardSource::Esofil => 1.0,
        }
    }
}

/// One entry of an archive index.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardStar {
    pub name: String,
    /// Spectrum file, relative to the archive directory.
    pub file: String,
    pub ra_2000: String,
    pub dec_2000: String,
    pub coord: SkyCoord,
}

/// Nearest-match capability shared by all standard-star archives.
pub trait StandardCatalog {
    fn source(&self) -> StandardSource;

    /// Directory the archive's spectrum files live in.
    fn directory(&self) -> &Path;

    /// The entry closest to `target` and its separation in degrees.
    fn nearest(&self, target: &SkyCoord) -> Option<(&StandardStar, f64)>;
}

/// An archive index loaded from disk.
#[derive(Debug, Clone)]
pub struct StandardTable {
    pub source: StandardSource,
    pub dir: PathBuf,
    pub stars: Vec<StandardStar>,
}

impl StandardTable {
    /// Load `<dir>/<source>_info.csv` (`file,name,ra_2000,dec_2000`).
    pub fn load<P: AsRef<Path>>(dir: P, source: StandardSource) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let index = dir.join(source.index_file());
        let mut rdr = csv_reader(&index)?;
        let headers = rdr.headers()?.clone();
        let stars = rdr
            .records()
            .map(|result| {
                let record = result?;
                let ra_2000 = csv_field(&headers, &record, "ra_2000")?.to_string();
                let dec_2000 = csv_field(&headers, &record, "dec_2000")?.to_string();
                let coord = SkyCoord::parse(&ra_2000, &dec_2000)?;
                Ok(StandardStar {
                    name: csv_field(&headers, &record, "name")?.to_string(),
                    file: csv_field(&headers, &record, "file")?.to_string(),
                    ra_2000,
                    dec_2000,
                    coord,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .with_context(|| format!("loading standard index {}", index.display()))?;
        info!("Loaded {} {} standards", stars.len(), source.tag());
        Ok(Self { source, dir, stars })
    }
}

impl StandardCatalog for StandardTable {
    fn source(&self) -> StandardSource {
        self.source
    }

    fn directory(&self) -> &Path {
        &self.dir
    }

    fn nearest(&self, target: &SkyCoord) -> Option<(&StandardStar, f64)> {
        self.stars
            .iter()
            .map(|s| (s, target.separation_deg(&s.coord)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// A standard star resolved from an archive.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardMatch {
    pub name: String,
    pub source: StandardSource,
    pub cal_file: PathBuf,
    pub ra_2000: String,
    pub dec_2000: String,
    pub separation_arcmin: f64,
}

/// The closest archived entry when no match was found.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosestCandidate {
    pub name: String,
    pub source: StandardSource,
    pub ra_2000: String,
    pub dec_2000: String,
    pub separation_arcmin: f64,
}

impl std::fmt::Display for ClosestCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) at {:.2} arcmin",
            self.name,
            self.source.tag(),
            self.separation_arcmin
        )
    }
}

/// Outcome of a standard-star search.
#[derive(Debug, Clone, PartialEq)]
pub enum StandardSearch {
    Found(StandardMatch),
    NotFound { closest: Option<ClosestCandidate> },
}

/// Search the archives in order and return the first match within `toler_arcmin`.
pub fn find_standard(
    catalogs: &[&dyn StandardCatalog],
    target: &SkyCoord,
    toler_arcmin: f64,
) -> StandardSearch {
    let mut closest: Option<ClosestCandidate> = None;

    for catalog in catalogs {
        let Some((star, sep_deg)) = catalog.nearest(target) else {
            continue;
        };
        let sep_arcmin = sep_deg * 60.0;
        if sep_arcmin < toler_arcmin {
            info!("Using standard star {} from {}", star.name, catalog.source().tag());
            return StandardSearch::Found(StandardMatch {
                name: star.name.clone(),
                source: catalog.source(),
                cal_file: catalog.directory().join(&star.file),
                ra_2000: star.ra_2000.clone(),
                dec_2000: star.dec_2000.clone(),
                separation_arcmin: sep_arcmin,
            });
        }
        if closest
            .as_ref()
            .map_or(true, |c| sep_arcmin < c.separation_arcmin)
        {
            closest = Some(ClosestCandidate {
                name: star.name.clone(),
                source: catalog.source(),
                ra_2000: star.ra_2000.clone(),
                dec_2000: star.dec_2000.clone(),
                separation_arcmin: sep_arcmin,
            });
        }
    }

    warn!("No standard star was found within a tolerance of {:.1} arcmin", toler_arcmin);
    if let Some(c) = &closest {
        info!("Closest standard was {}", c);
    }
    warn!("Flux calibration will not be performed");
    StandardSearch::NotFound { closest }
}

/// Whether any archive holds a standard within `toler_arcmin` of `target`.
pub fn has_standard(
    catalogs: &[&dyn StandardCatalog],
    target: &SkyCoord,
    toler_arcmin: f64,
) -> bool {
    catalogs.iter().any(|catalog| {
        catalog
            .nearest(target)
            .is_some_and(|(_, sep_deg)| sep_deg * 60.0 < toler_arcmin)
    })
}

/// Load the calibrated spectrum of a matched standard.
pub fn load_standard_spectrum(std_match: &StandardMatch) -> anyhow::Result<TrueFluxModel> {
    info!("Loading standard star file: {}", std_match.cal_file.display());
    let (wave, flux) = read_two_columns(&std_match.cal_file)?;
    let factor = std_match.source.flux_factor();
    let flux = flux.into_iter().map(|f| f * factor).collect();
    let mut model = TrueFluxModel::new(
        wave,
        flux,
        std_match.name.clone(),
        std_match.cal_file.display().to_string(),
        ModelProvenance::Archive(std_match.source.tag().to_string()),
    )?;
    model.ra = Some(std_match.ra_2000.clone());
    model.dec = Some(std_match.dec_2000.clone());
    Ok(model)
}

/// Pick the brightest candidate extraction as the standard star.
///
/// Each entry is the counts array of one extracted object (`None` for a
/// missing extraction). The object with the largest median count wins.
pub fn select_standard_index(candidates: &[Option<&[f64]>]) -> Option<usize> {
    let medians: Vec<f64> = candidates
        .iter()
        .map(|c| c.and_then(crate::interp::median).unwrap_or(0.0))
        .collect();
    let (idx, med) = medians
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))?;
    info!("Putative standard star {} has a median count of {}", idx, med);
    Some(idx)
}
