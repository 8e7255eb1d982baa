//! Export file parsing
//!
//! Turns the vendor's fixed-layout CSV exports into normalized
//! [`MeterReading`] records. The cell offsets below encode the stable vendor
//! export layout and are preserved exactly; short files fall back to empty /
//! zero defaults instead of failing.

use crate::error::{PipelineError, Result};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Files without this token in their stem are not exports and are skipped.
pub const EXPORT_MARKER: char = '@';

// Fixed vendor layout: meter name and export timestamp live on the second
// row, the latest cumulative value on the ninth.
const HEADER_ROW: usize = 1;
const NAME_COL: usize = 0;
const DATE_COL: usize = 4;
const VALUE_ROW: usize = 8;
const VALUE_COL: usize = 1;

/// One normalized reading, extracted from a single export file.
///
/// Lives only for the duration of a pipeline run: produced here, consumed by
/// the store, then discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    pub meter_name: String,
    pub address_name: String,
    pub meter_value: f64,
    pub meter_date: String,
}

/// Parses a directory of export files and writes the consolidated summary.
pub struct ExportParser {
    summary_path: PathBuf,
}

impl ExportParser {
    pub fn new(summary_path: PathBuf) -> Self {
        ExportParser { summary_path }
    }

    /// Parse every eligible export file in `source_dir`.
    ///
    /// Returns the records sorted by meter name. A malformed file fails the
    /// whole batch; callers must not persist a partial result. As a side
    /// effect the sorted batch is written to the summary file for audit use;
    /// that write is best-effort and never fails the parse.
    pub fn parse(&self, source_dir: &Path) -> Result<Vec<MeterReading>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(source_dir)
            .map_err(|e| {
                PipelineError::Parse(format!("cannot read {}: {e}", source_dir.display()))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        let mut readings = Vec::new();
        for path in &paths {
            if !is_export_file(path) {
                debug!(file = %path.display(), "not an export file; skipping");
                continue;
            }
            readings.push(parse_export_file(path)?);
        }
        readings.sort_by(|a, b| a.meter_name.cmp(&b.meter_name));

        if let Err(e) = self.write_summary(&readings) {
            warn!(
                file = %self.summary_path.display(),
                error = %e,
                "could not write summary file"
            );
        }

        Ok(readings)
    }

    fn write_summary(&self, readings: &[MeterReading]) -> Result<()> {
        let mut writer = WriterBuilder::new().from_path(&self.summary_path)?;
        writer.write_record(["MeterName", "AddressName", "MeterValue", "MeterDate"])?;
        for r in readings {
            let value = r.meter_value.to_string();
            writer.write_record([
                r.meter_name.as_str(),
                r.address_name.as_str(),
                value.as_str(),
                r.meter_date.as_str(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Whether `path` names an eligible export: `.csv` extension
/// (case-insensitive) and a marker token preceded by at least one character.
pub fn is_export_file(path: &Path) -> bool {
    let is_csv = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    is_csv && stem.find(EXPORT_MARKER).is_some_and(|pos| pos > 0)
}

/// Whether `dir` holds at least one eligible export (leftovers from an
/// interrupted prior run).
pub fn has_export_files(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.path().is_file() && is_export_file(&e.path()))
        })
        .unwrap_or(false)
}

fn parse_export_file(path: &Path) -> Result<MeterReading> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| PipelineError::Parse(format!("cannot open {}: {e}", path.display())))?;

    let rows: Vec<StringRecord> = reader
        .records()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| PipelineError::Parse(format!("malformed export {}: {e}", path.display())))?;

    let (meter_name, meter_date) = if rows.len() > HEADER_ROW {
        (
            cell(&rows[HEADER_ROW], NAME_COL),
            cell(&rows[HEADER_ROW], DATE_COL),
        )
    } else {
        (String::new(), String::new())
    };

    let meter_value = if rows.len() > VALUE_ROW {
        parse_value(&rows[VALUE_ROW], path)?
    } else {
        0.0
    };

    // Address is the leading token of the meter name.
    let address_name = meter_name
        .split('_')
        .next()
        .unwrap_or_default()
        .to_string();

    Ok(MeterReading {
        meter_name,
        address_name,
        meter_value,
        meter_date,
    })
}

fn cell(row: &StringRecord, col: usize) -> String {
    row.get(col).unwrap_or_default().trim().to_string()
}

fn parse_value(row: &StringRecord, path: &Path) -> Result<f64> {
    let raw = cell(row, VALUE_COL);
    if raw.is_empty() {
        return Ok(0.0);
    }
    raw.parse::<f64>().map_err(|_| {
        PipelineError::Parse(format!(
            "non-numeric meter value {raw:?} in {}",
            path.display()
        ))
    })
}
