//! Synthetic true-flux models for standard/telluric stars without an archived spectrum.
//!
//! Two regimes:
//!
//! - **A0 stars** reuse a Vega reference spectrum rescaled by
//!   `10^(0.4 (V_vega − V))`.
//! - **Other types** take physical parameters from the Schmidt-Kaler table,
//!   derive radius and surface gravity, pick the nearest Kurucz (1993) grid
//!   spectrum in (Teff, log g), and dilute the surface flux by `(R/D)²`.
//!
//! The grid is never interpolated; the nearest grid point is used.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use tracing::info;

use crate::catalogs::read_columns;
use crate::catalogs::read_two_columns;
use crate::catalogs::schmidt_kaler::{SchmidtKalerTable, SpectralTypeRow};
use crate::catalogs::store::CalibrationData;
use crate::error::Result;
use crate::interp::nearest_index;
use crate::spectrum::{ModelProvenance, TrueFluxModel, FLUX_SCALE};

/// Johnson V magnitude of the Vega reference spectrum.
pub const VEGA_V_MAG: f64 = 0.03;

/// Parsec in cm.
const PARSEC_CM: f64 = 3.085_677_581_491_367e18;
/// Nominal solar radius in cm.
const R_SUN_CM: f64 = 6.957e10;
/// Gravitational constant (cgs) and solar mass (g) used for log g of the Sun.
const G_CGS: f64 = 6.67259e-8;
const M_SUN_G: f64 = 1.989e33;
const R_SUN_SK_CM: f64 = 6.96e10;

/// Kurucz effective-temperature grid (K), ascending.
pub static TEFF_GRID: Lazy<Vec<f64>> = Lazy::new(|| {
    let segments: [(f64, f64, usize); 4] = [
        (3000.0, 250.0, 28),
        (10000.0, 500.0, 6),
        (13000.0, 1000.0, 22),
        (35000.0, 2500.0, 7),
    ];
    segments
        .iter()
        .flat_map(|&(start, step, n)| (0..n).map(move |i| start + i as f64 * step))
        .collect()
});

/// Kurucz surface-gravity grid (log g, cgs), ascending.
pub const LOGG_GRID: [f64; 11] = [0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 4.5, 5.0];

/// Vega reference spectrum (wavelength in Angstrom, flux in cgs).
#[derive(Debug, Clone)]
pub struct VegaReference {
    pub file: String,
    pub wave: Vec<f64>,
    pub flux: Vec<f64>,
}

impl VegaReference {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let (wave, flux) = read_two_columns(path)?;
        Ok(Self {
            file: path.display().to_string(),
            wave,
            flux,
        })
    }

    /// Vega rescaled to apparent V magnitude `vmag`, in [`FLUX_SCALE`] units.
    pub fn scaled_to(&self, sptype: &str, vmag: f64) -> Result<TrueFluxModel> {
        info!("Using Vega spectrum for {} star at V={:.2}", sptype, vmag);
        let factor = 10f64.powf(0.4 * (VEGA_V_MAG - vmag)) / FLUX_SCALE;
        let flux = self.flux.iter().map(|f| f * factor).collect();
        TrueFluxModel::new(
            self.wave.clone(),
            flux,
            sptype,
            self.file.clone(),
            ModelProvenance::Vega,
        )
    }
}

/// Derived physical parameters of a star of given spectral type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StellarParams {
    /// log10 of radius in solar radii.
    pub log_r: f64,
    /// log10 of mass in solar masses.
    pub log_m: f64,
    /// log10 surface gravity (cgs).
    pub logg: f64,
    /// Absolute visual magnitude.
    pub m_v: f64,
    pub teff: f64,
}

impl StellarParams {
    /// Radius from the bolometric luminosity-temperature relation and mass from
    /// the Schmidt-Kaler mass-luminosity relation (valid for M_bol < 7.5).
    pub fn from_row(row: &SpectralTypeRow) -> Self {
        let logg_sun = G_CGS.log10() + M_SUN_G.log10() - 2.0 * R_SUN_SK_CM.log10();
        let log_r = 0.2 * (42.26 - row.m_bol - 10.0 * row.log_teff);
        let log_m = 0.46 - 0.10 * row.m_bol;
        let logg = log_m - 2.0 * log_r + logg_sun;
        Self {
            log_r,
            log_m,
            logg,
            m_v: row.m_v,
            teff: row.teff,
        }
    }

    /// `(R/D)²` for a star of apparent magnitude `vmag`.
    pub fn dilution_factor(&self, vmag: f64) -> f64 {
        let log_d = 0.2 * (vmag - self.m_v) + 1.0;
        let distance = PARSEC_CM * 10f64.powf(log_d);
        let radius = R_SUN_CM * 10f64.powf(self.log_r);
        (radius / distance).powi(2)
    }
}

/// Index of the grid value nearest to `value`; ties go to the lower index.
pub fn nearest_grid_index(grid: &[f64], value: f64) -> usize {
    nearest_index(grid, value).unwrap_or(0)
}

/// Source of model-atmosphere surface-flux spectra on the (Teff, log g) grid.
pub trait ModelGrid {
    /// Wavelength (Angstrom) and surface flux (cgs) for grid temperature `teff`
    /// and gravity column `logg_index` into [`LOGG_GRID`].
    fn spectrum(&self, teff: f64, logg_index: usize) -> anyhow::Result<(Vec<f64>, Vec<f64>)>;

    /// Identifier of the file a grid point is read from.
    fn describe(&self, teff: f64) -> String;
}

/// Kurucz grid stored as one table per temperature:
/// `kp00_{T}.dat` with columns `wave g00 g05 … g50`.
#[derive(Debug, Clone)]
pub struct KuruczGrid {
    pub dir: PathBuf,
}

impl KuruczGrid {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, teff: f64) -> PathBuf {
        self.dir.join(format!("kp00_{}.dat", teff.round() as i64))
    }
}

impl ModelGrid for KuruczGrid {
    fn spectrum(&self, teff: f64, logg_index: usize) -> anyhow::Result<(Vec<f64>, Vec<f64>)> {
        let mut cols = read_columns(self.path_for(teff), 1 + LOGG_GRID.len())?;
        anyhow::ensure!(logg_index < LOGG_GRID.len(), "gravity index {logg_index} out of range");
        let flux = std::mem::take(&mut cols[1 + logg_index]);
        let wave = std::mem::take(&mut cols[0]);
        Ok((wave, flux))
    }

    fn describe(&self, teff: f64) -> String {
        self.path_for(teff).display().to_string()
    }
}

/// Kurucz model spectrum for a star of type `sptype` at apparent magnitude `vmag`.
pub fn kurucz_model(
    sptype: &str,
    vmag: f64,
    table: &SchmidtKalerTable,
    grid: &dyn ModelGrid,
) -> Result<TrueFluxModel> {
    let row = table.lookup(sptype)?;
    let params = StellarParams::from_row(row);
    let dilution = params.dilution_factor(vmag);

    let teff = TEFF_GRID[nearest_grid_index(&TEFF_GRID, params.teff)];
    let ig = nearest_grid_index(&LOGG_GRID, params.logg);
    info!(
        "Creating {} model: Teff={} (grid {}), log g={:.2} (grid {:.1})",
        sptype, params.teff, teff, params.logg, LOGG_GRID[ig]
    );

    let (wave, surface_flux) = grid.spectrum(teff, ig)?;
    let flux = surface_flux
        .iter()
        .map(|f| f * dilution / FLUX_SCALE)
        .collect();
    TrueFluxModel::new(wave, flux, sptype, grid.describe(teff), ModelProvenance::GridModel)
}

/// Synthesize a true-flux model from spectral type and V magnitude.
///
/// A0-class stars use the Vega reference; everything else uses the Kurucz grid.
pub fn synthesize(sptype: &str, vmag: f64, data: &CalibrationData) -> Result<TrueFluxModel> {
    if sptype.contains("A0") {
        data.vega()?.scaled_to(sptype, vmag)
    } else {
        kurucz_model(sptype, vmag, data.schmidt_kaler()?, &data.kurucz_grid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FluxError;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    /// Grid returning a flat surface flux of 1.
    struct FlatGrid;

    impl ModelGrid for FlatGrid {
        fn spectrum(&self, _teff: f64, _ig: usize) -> anyhow::Result<(Vec<f64>, Vec<f64>)> {
            Ok((vec![3000.0, 5000.0, 10000.0], vec![1.0, 1.0, 1.0]))
        }

        fn describe(&self, teff: f64) -> String {
            format!("flat_{teff}")
        }
    }

    fn sk_table() -> SchmidtKalerTable {
        SchmidtKalerTable {
            rows: vec![SpectralTypeRow {
                sp: "G2V".into(),
                log_teff: 3.763,
                teff: 5800.0,
                b_v0: 0.65,
                m_v: 4.72,
                bc: -0.07,
                m_bol: 4.65,
                l_lsun: 1.0,
            }],
        }
    }

    #[test]
    fn temperature_grid_layout() {
        assert_eq!(TEFF_GRID.len(), 63);
        assert_eq!(TEFF_GRID[0], 3000.0);
        assert_eq!(TEFF_GRID[27], 9750.0);
        assert_eq!(TEFF_GRID[28], 10000.0);
        assert_eq!(*TEFF_GRID.last().unwrap(), 50000.0);
        assert!(TEFF_GRID.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn nearest_grid_point_selection() {
        assert_eq!(TEFF_GRID[nearest_grid_index(&TEFF_GRID, 5800.0)], 5750.0);
        assert_eq!(TEFF_GRID[nearest_grid_index(&TEFF_GRID, 11900.0)], 12000.0);
        assert_eq!(TEFF_GRID[nearest_grid_index(&TEFF_GRID, 1000.0)], 3000.0);
        assert_eq!(TEFF_GRID[nearest_grid_index(&TEFF_GRID, 90000.0)], 50000.0);
        assert_eq!(nearest_grid_index(&LOGG_GRID, 4.44), 9);
        // tie goes low
        assert_eq!(nearest_grid_index(&LOGG_GRID, 4.25), 8);
    }

    #[test]
    fn sun_like_parameters() {
        let p = StellarParams::from_row(&sk_table().rows[0]);
        // Radius close to solar, gravity close to solar
        assert_abs_diff_eq!(p.log_r, 0.0, epsilon = 0.02);
        assert_abs_diff_eq!(p.logg, 4.44, epsilon = 0.1);
        // At 10 pc the apparent magnitude equals M_V
        let d10 = p.dilution_factor(p.m_v);
        let expected = (R_SUN_CM * 10f64.powf(p.log_r) / (10.0 * PARSEC_CM)).powi(2);
        assert_relative_eq!(d10, expected, max_relative = 1e-12);
        // Five magnitudes fainter is ten times further
        assert_relative_eq!(p.dilution_factor(p.m_v + 5.0), d10 / 100.0, max_relative = 1e-12);
    }

    #[test]
    fn vega_scaling() {
        let vega = VegaReference {
            file: "vega.dat".into(),
            wave: vec![4000.0, 5000.0],
            flux: vec![1e-9, 2e-9],
        };
        let m = vega.scaled_to("A0V", 5.03).unwrap();
        assert_eq!(m.provenance, ModelProvenance::Vega);
        assert_relative_eq!(m.flux[0], 1e-9 * 1e-2 / FLUX_SCALE, max_relative = 1e-12);
        assert_relative_eq!(m.flux[1], 2e-9 * 1e-2 / FLUX_SCALE, max_relative = 1e-12);
    }

    #[test]
    fn kurucz_model_dilutes_surface_flux() {
        let g2 = kurucz_model("G2V", 8.0, &sk_table(), &FlatGrid).unwrap();
        assert_eq!(g2.provenance, ModelProvenance::GridModel);
        assert_eq!(g2.cal_file, "flat_5750");
        let p = StellarParams::from_row(&sk_table().rows[0]);
        assert_relative_eq!(g2.flux[0], p.dilution_factor(8.0) / FLUX_SCALE, max_relative = 1e-12);

        assert!(matches!(
            kurucz_model("K7III", 8.0, &sk_table(), &FlatGrid),
            Err(FluxError::UnknownSpectralType(_))
        ));
    }

    #[test]
    fn synthesize_dispatches_on_type() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("standards")).unwrap();
        std::fs::create_dir_all(root.join("kurucz93/kp00")).unwrap();
        std::fs::write(
            root.join("standards/vega_tspectool_vacuum.dat"),
            "# wave flux\n4000 1e-9\n5000 1e-9\n",
        )
        .unwrap();
        std::fs::write(
            root.join("kurucz93/schmidt_kaler.csv"),
            "sp,log_teff,teff,b_v0,m_v,bc,m_bol,l_lsun\nG2V,3.763,5800,0.65,4.72,-0.07,4.65,1.0\n",
        )
        .unwrap();
        let row = "1.0 1.0 1.0 1.0 1.0 1.0 1.0 1.0 1.0 1.0 1.0";
        std::fs::write(
            root.join("kurucz93/kp00/kp00_5750.dat"),
            format!("3000 {row}\n6000 {row}\n9000 {row}\n"),
        )
        .unwrap();
        let data = CalibrationData::new(root);

        let a0 = synthesize("A0V", 8.0, &data).unwrap();
        assert_eq!(a0.provenance, ModelProvenance::Vega);
        assert_relative_eq!(a0.flux[0], 1e-9 * 10f64.powf(0.4 * (0.03 - 8.0)) / FLUX_SCALE, max_relative = 1e-12);

        let g2 = synthesize("G2V", 8.0, &data).unwrap();
        assert_eq!(g2.provenance, ModelProvenance::GridModel);
        assert_eq!(g2.wave, vec![3000.0, 6000.0, 9000.0]);
        assert!(g2.cal_file.ends_with("kp00_5750.dat"));

        assert!(matches!(
            synthesize("M5V", 8.0, &data),
            Err(FluxError::UnknownSpectralType(_))
        ));
    }
}
