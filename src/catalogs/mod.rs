//! Calibration resource tables: standard stars, extinction sites,
//! stellar parameters, and the lazily loaded store that owns them.
//!
//! Numeric tables are whitespace-separated columns with `#` comments; index
//! tables are CSV with a header row.

pub mod extinction;
pub mod schmidt_kaler;
pub mod standards;
pub mod store;

use std::path::Path;

use anyhow::{bail, Context};

/// Parse whitespace-separated numeric columns from an in-memory table.
///
/// Blank lines and lines starting with `#` are skipped. Every data row must
/// carry at least `ncols` numeric fields; extra fields are ignored.
pub fn parse_columns(data: &str, ncols: usize) -> anyhow::Result<Vec<Vec<f64>>> {
    let mut columns = vec![Vec::new(); ncols];
    for (lineno, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        for (col, column) in columns.iter_mut().enumerate() {
            let field = match fields.next() {
                Some(f) => f,
                None => bail!("line {}: expected {} columns, found {}", lineno + 1, ncols, col),
            };
            let value: f64 = field
                .parse()
                .with_context(|| format!("line {}: bad number {:?}", lineno + 1, field))?;
            column.push(value);
        }
    }
    Ok(columns)
}

/// Read a whitespace-separated numeric table from disk.
pub fn read_columns<P: AsRef<Path>>(path: P, ncols: usize) -> anyhow::Result<Vec<Vec<f64>>> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_columns(&data, ncols).with_context(|| format!("parsing {}", path.display()))
}

/// Read a two-column `(x, y)` table from disk.
pub fn read_two_columns<P: AsRef<Path>>(path: P) -> anyhow::Result<(Vec<f64>, Vec<f64>)> {
    let mut cols = read_columns(path, 2)?;
    let y = cols.pop().unwrap_or_default();
    let x = cols.pop().unwrap_or_default();
    Ok((x, y))
}

/// Open a CSV index table with a header row, `#` comments and trimmed fields.
pub(crate) fn csv_reader<P: AsRef<Path>>(path: P) -> anyhow::Result<csv::Reader<std::fs::File>> {
    let path = path.as_ref();
    csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))
}

/// Fetch a named field from a CSV record, failing with the column name.
pub(crate) fn csv_field<'a>(
    headers: &csv::StringRecord,
    record: &'a csv::StringRecord,
    name: &str,
) -> anyhow::Result<&'a str> {
    let idx = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(name))
        .with_context(|| format!("missing column {name:?}"))?;
    record
        .get(idx)
        .with_context(|| format!("row has no value for column {name:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commented_columns() {
        let data = "# wave flux\n3000.0 1.5\n\n 4000  2.5  extra\n";
        let cols = parse_columns(data, 2).unwrap();
        assert_eq!(cols[0], vec![3000.0, 4000.0]);
        assert_eq!(cols[1], vec![1.5, 2.5]);
    }

    #[test]
    fn short_rows_are_errors() {
        assert!(parse_columns("1.0 2.0\n3.0\n", 2).is_err());
        assert!(parse_columns("1.0 abc\n", 2).is_err());
    }
}
