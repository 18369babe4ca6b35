//! Spectral type → physical parameters (Schmidt-Kaler 1982).
//!
//! Columns: `sp,log_teff,teff,b_v0,m_v,bc,m_bol,l_lsun`.

use std::path::Path;

use anyhow::Context;

use super::{csv_field, csv_reader};
use crate::error::{FluxError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct SpectralTypeRow {
    pub sp: String,
    pub log_teff: f64,
    pub teff: f64,
    pub b_v0: f64,
    /// Absolute visual magnitude.
    pub m_v: f64,
    /// Bolometric correction.
    pub bc: f64,
    /// Absolute bolometric magnitude.
    pub m_bol: f64,
    pub l_lsun: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SchmidtKalerTable {
    pub rows: Vec<SpectralTypeRow>,
}

impl SchmidtKalerTable {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut rdr = csv_reader(path)?;
        let headers = rdr.headers()?.clone();
        let num = |record: &csv::StringRecord, name: &str| -> anyhow::Result<f64> {
            let field = csv_field(&headers, record, name)?;
            field
                .parse()
                .with_context(|| format!("column {name}: bad number {field:?}"))
        };
        let rows = rdr
            .records()
            .map(|result| {
                let record = result?;
                Ok(SpectralTypeRow {
                    sp: csv_field(&headers, &record, "sp")?.to_string(),
                    log_teff: num(&record, "log_teff")?,
                    teff: num(&record, "teff")?,
                    b_v0: num(&record, "b_v0")?,
                    m_v: num(&record, "m_v")?,
                    bc: num(&record, "bc")?,
                    m_bol: num(&record, "m_bol")?,
                    l_lsun: num(&record, "l_lsun")?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .with_context(|| format!("loading spectral-type table {}", path.display()))?;
        Ok(Self { rows })
    }

    /// The unique row for `sptype`; interpolation between types is not supported.
    pub fn lookup(&self, sptype: &str) -> Result<&SpectralTypeRow> {
        let mut matches = self.rows.iter().filter(|r| r.sp == sptype);
        match (matches.next(), matches.next()) {
            (Some(row), None) => Ok(row),
            _ => Err(FluxError::UnknownSpectralType(sptype.to_string())),
        }
    }
}
