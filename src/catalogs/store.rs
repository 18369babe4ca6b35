//! Read-only calibration resources rooted at one directory.
//!
//! ```text
//! <root>/standards/{xshooter,calspec,esofil}/<source>_info.csv
//! <root>/standards/vega_tspectool_vacuum.dat
//! <root>/kurucz93/schmidt_kaler.csv
//! <root>/kurucz93/kp00/kp00_<T>.dat
//! <root>/extinction/sites.csv
//! <root>/skysim/mktrans_zm_10_10.dat
//! <root>/filters/<NAME>.dat
//! ```
//!
//! Every table is loaded on first use and never mutated afterwards, so one
//! [`CalibrationData`] can be shared by reference across threads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use tracing::{info, warn};

use super::extinction::{
    find_extinction_site, load_extinction_curve, load_extinction_sites, site_curve_path,
    ExtinctionCurve, ExtinctionSite, SITE_TOLERANCE_DEG,
};
use super::schmidt_kaler::SchmidtKalerTable;
use super::standards::{
    find_standard, has_standard, StandardCatalog, StandardSearch, StandardSource, StandardTable,
};
use crate::coords::SkyCoord;
use crate::error::Result;
use crate::filters::FilterCurve;
use crate::masking::TransmissionCurve;
use crate::stellar::{KuruczGrid, VegaReference};

/// Lazily loaded calibration tables.
#[derive(Debug)]
pub struct CalibrationData {
    root: PathBuf,
    standards: OnceCell<Vec<StandardTable>>,
    extinction_sites: OnceCell<Vec<ExtinctionSite>>,
    extinction_curves: Mutex<HashMap<String, Arc<ExtinctionCurve>>>,
    schmidt_kaler: OnceCell<SchmidtKalerTable>,
    vega: OnceCell<VegaReference>,
    transmission: OnceCell<TransmissionCurve>,
}

impl CalibrationData {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            standards: OnceCell::new(),
            extinction_sites: OnceCell::new(),
            extinction_curves: Mutex::new(HashMap::new()),
            schmidt_kaler: OnceCell::new(),
            vega: OnceCell::new(),
            transmission: OnceCell::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn standards_dir(&self) -> PathBuf {
        self.root.join("standards")
    }

    fn extinction_dir(&self) -> PathBuf {
        self.root.join("extinction")
    }

    /// Standard-star archives in priority order. Archives without an index
    /// file are skipped.
    pub fn standard_tables(&self) -> Result<&[StandardTable]> {
        let tables = self.standards.get_or_try_init(|| {
            let mut tables = Vec::new();
            for source in StandardSource::PRIORITY {
                let dir = self.standards_dir().join(source.dir_name());
                if !dir.join(source.index_file()).exists() {
                    warn!("No {} standard index under {}", source.tag(), dir.display());
                    continue;
                }
                tables.push(StandardTable::load(&dir, source)?);
            }
            Ok::<_, anyhow::Error>(tables)
        })?;
        Ok(tables.as_slice())
    }

    fn catalogs(&self) -> Result<Vec<&dyn StandardCatalog>> {
        Ok(self
            .standard_tables()?
            .iter()
            .map(|t| t as &dyn StandardCatalog)
            .collect())
    }

    /// Resolve the archived standard nearest to `target`.
    pub fn find_standard(&self, target: &SkyCoord, toler_arcmin: f64) -> Result<StandardSearch> {
        Ok(find_standard(&self.catalogs()?, target, toler_arcmin))
    }

    /// Whether any archive holds a standard near `target`.
    pub fn has_standard(&self, target: &SkyCoord, toler_arcmin: f64) -> Result<bool> {
        Ok(has_standard(&self.catalogs()?, target, toler_arcmin))
    }

    pub fn extinction_sites(&self) -> Result<&[ExtinctionSite]> {
        let sites = self
            .extinction_sites
            .get_or_try_init(|| load_extinction_sites(self.extinction_dir().join("sites.csv")))?;
        Ok(sites.as_slice())
    }

    /// Extinction curve of the site nearest to the observatory, or `None`
    /// when no site lies within tolerance.
    pub fn extinction_curve(
        &self,
        longitude_deg: f64,
        latitude_deg: f64,
    ) -> Result<Option<Arc<ExtinctionCurve>>> {
        let sites = self.extinction_sites()?;
        let Some(site) = find_extinction_site(sites, longitude_deg, latitude_deg, SITE_TOLERANCE_DEG)
        else {
            return Ok(None);
        };

        let mut cache = self
            .extinction_curves
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(curve) = cache.get(&site.name) {
            return Ok(Some(Arc::clone(curve)));
        }
        let curve = Arc::new(load_extinction_curve(
            site_curve_path(&self.extinction_dir(), site),
            &site.name,
        )?);
        cache.insert(site.name.clone(), Arc::clone(&curve));
        Ok(Some(curve))
    }

    pub fn schmidt_kaler(&self) -> Result<&SchmidtKalerTable> {
        let table = self.schmidt_kaler.get_or_try_init(|| {
            SchmidtKalerTable::load(self.root.join("kurucz93").join("schmidt_kaler.csv"))
        })?;
        Ok(table)
    }

    pub fn vega(&self) -> Result<&VegaReference> {
        let vega = self.vega.get_or_try_init(|| {
            VegaReference::load(self.standards_dir().join("vega_tspectool_vacuum.dat"))
        })?;
        Ok(vega)
    }

    /// Kurucz grid spectra are read on demand, one temperature file at a time.
    pub fn kurucz_grid(&self) -> KuruczGrid {
        KuruczGrid::new(self.root.join("kurucz93").join("kp00"))
    }

    pub fn transmission(&self) -> Result<&TransmissionCurve> {
        let curve = self.transmission.get_or_try_init(|| {
            TransmissionCurve::load_microns(self.root.join("skysim").join("mktrans_zm_10_10.dat"))
        })?;
        Ok(curve)
    }

    /// Throughput curve of a named photometric filter.
    pub fn filter(&self, name: &str) -> Result<FilterCurve> {
        let path = self.root.join("filters").join(format!("{name}.dat"));
        info!("Loading filter curve {}", path.display());
        Ok(FilterCurve::load(path, name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn loads_once_and_skips_missing_archives() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "standards/calspec/calspec_info.csv",
            "file,name,ra_2000,dec_2000\nfeige34.dat,FEIGE34,10:39:36.74,+43:06:09.3\n",
        );
        let data = CalibrationData::new(dir.path());
        let tables = data.standard_tables().unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].source, StandardSource::Calspec);
        // Same allocation on second access
        assert!(std::ptr::eq(tables, data.standard_tables().unwrap()));

        let target = SkyCoord::parse("10:39:36.74", "+43:06:09.3").unwrap();
        assert!(data.has_standard(&target, 20.0).unwrap());
        match data.find_standard(&target, 20.0).unwrap() {
            StandardSearch::Found(m) => assert_eq!(m.name, "FEIGE34"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn extinction_curve_is_cached_per_site() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "extinction/sites.csv", "file,name,lon,lat\nmko.dat,mko,204.53,19.83\n");
        write(dir.path(), "extinction/mko.dat", "3000 0.5\n10000 0.02\n");
        let data = CalibrationData::new(dir.path());

        let a = data.extinction_curve(204.5, 19.8).unwrap().unwrap();
        let b = data.extinction_curve(204.0, 20.0).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.wave, vec![3000.0, 10000.0]);
        assert!(data.extinction_curve(0.0, -60.0).unwrap().is_none());
    }

    #[test]
    fn missing_resources_are_data_errors() {
        let dir = tempfile::tempdir().unwrap();
        let data = CalibrationData::new(dir.path());
        assert!(matches!(data.vega(), Err(crate::error::FluxError::Data(_))));
        assert!(data.schmidt_kaler().is_err());
        assert!(data.transmission().is_err());
        assert!(data.extinction_sites().is_err());
        assert!(data.standard_tables().unwrap().is_empty());
    }
}
