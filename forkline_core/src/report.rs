use crate::coverage::{CoverageBlob, CoverageCalculator, CoverageError, UnitCoverage};
use crate::failure::{Failure, RaisedError, StackCleaner};
use crate::input::InputFile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Report I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize unit report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to encode cumulative coverage: {0}")]
    Coverage(#[from] CoverageError),
}

/// Format of the per-unit branch report.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReportFormat {
    #[default]
    Csv,
    Json,
    None,
}

impl ReportFormat {
    pub fn file_name(&self) -> Option<&'static str> {
        match self {
            ReportFormat::Csv => Some("units.csv"),
            ReportFormat::Json => Some("units.json"),
            ReportFormat::None => None,
        }
    }
}

/// One point of the coverage time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub elapsed_millis: u64,
    pub covered_branches: u64,
}

/// A deduplicated failure and every input that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct FailureEntry {
    pub failure: Failure,
    pub first_seen_millis: u64,
    pub first_message: String,
    pub inputs: Vec<PathBuf>,
}

#[derive(Serialize)]
struct UnitReport<'a> {
    total_branches: u64,
    covered_branches: u64,
    units: &'a [UnitCoverage],
}

/// Accumulates the coverage time series and the failure list of one campaign.
#[derive(Debug)]
pub struct CampaignReport<'c> {
    calculator: &'c CoverageCalculator,
    cleaner: StackCleaner,
    t0: Option<u64>,
    cumulative: CoverageBlob,
    rows: Vec<ReportRow>,
    failures: Vec<FailureEntry>,
    failure_index: HashMap<Failure, usize>,
}

impl<'c> CampaignReport<'c> {
    pub fn new(calculator: &'c CoverageCalculator, cleaner: StackCleaner) -> Self {
        Self {
            calculator,
            cleaner,
            t0: None,
            cumulative: CoverageBlob::new(),
            rows: Vec::new(),
            failures: Vec::new(),
            failure_index: HashMap::new(),
        }
    }

    /// Records one analyzed input. Always appends a row, even when coverage
    /// did not grow.
    pub fn record(
        &mut self,
        input: &InputFile,
        coverage: &CoverageBlob,
        failure: Option<&RaisedError>,
    ) {
        let t0 = *self.t0.get_or_insert(input.modified_millis);
        let mut elapsed = input.modified_millis.saturating_sub(t0);
        if let Some(last) = self.rows.last() {
            // Rows stay monotone even if two input directories disagree on clocks.
            elapsed = elapsed.max(last.elapsed_millis);
        }

        self.cumulative.merge_in(coverage);
        let covered = self.calculator.measure(&self.cumulative);
        self.rows.push(ReportRow {
            elapsed_millis: elapsed,
            covered_branches: covered,
        });

        if let Some(raised) = failure {
            let fingerprint = self.cleaner.clean(raised);
            let idx = match self.failure_index.get(&fingerprint) {
                Some(idx) => *idx,
                None => {
                    tracing::info!(
                        "New failure #{} ({}) from {:?}",
                        self.failures.len() + 1,
                        fingerprint.root_type,
                        input.path
                    );
                    self.failures.push(FailureEntry {
                        failure: fingerprint.clone(),
                        first_seen_millis: elapsed,
                        first_message: raised.message.clone(),
                        inputs: Vec::new(),
                    });
                    self.failure_index.insert(fingerprint, self.failures.len() - 1);
                    self.failures.len() - 1
                }
            };
            self.failures[idx].inputs.push(input.path.clone());
        }
    }

    pub fn rows(&self) -> &[ReportRow] {
        &self.rows
    }

    /// Failure entries in order of first sighting.
    pub fn failures(&self) -> &[FailureEntry] {
        &self.failures
    }

    pub fn cumulative(&self) -> &CoverageBlob {
        &self.cumulative
    }

    pub fn covered_branches(&self) -> u64 {
        self.rows.last().map_or(0, |row| row.covered_branches)
    }

    pub fn total_branches(&self) -> u64 {
        self.calculator.total_branches()
    }

    pub fn write_coverage(&self, path: &Path) -> Result<(), ReportError> {
        write_atomically(path, |w| {
            writeln!(
                w,
                "# elapsed_ms covered_branches (total_branches={})",
                self.total_branches()
            )?;
            for row in &self.rows {
                writeln!(w, "{} {}", row.elapsed_millis, row.covered_branches)?;
            }
            Ok(())
        })
    }

    pub fn write_failures(&self, path: &Path) -> Result<(), ReportError> {
        write_atomically(path, |w| {
            if self.failures.is_empty() {
                writeln!(w, "No failures observed.")?;
            }
            for (i, entry) in self.failures.iter().enumerate() {
                writeln!(
                    w,
                    "{}) {} (first seen at {} ms, {} input(s))",
                    i + 1,
                    entry.failure.root_type,
                    entry.first_seen_millis,
                    entry.inputs.len()
                )?;
                writeln!(w, "   message: {}", entry.first_message)?;
                for frame in &entry.failure.frames {
                    writeln!(w, "   at {frame}")?;
                }
                writeln!(w, "   inputs:")?;
                for input in &entry.inputs {
                    writeln!(w, "     {}", input.display())?;
                }
            }
            Ok(())
        })
    }

    /// Persists the cumulative coverage blob.
    pub fn write_cumulative(&self, path: &Path) -> Result<(), ReportError> {
        let bytes = self.cumulative.to_bytes()?;
        write_atomically(path, |w| w.write_all(&bytes))
    }

    /// Writes the per-unit branch breakdown of the cumulative blob.
    pub fn write_unit_report(&self, path: &Path, format: ReportFormat) -> Result<(), ReportError> {
        let units = self.calculator.breakdown(&self.cumulative);
        match format {
            ReportFormat::None => Ok(()),
            ReportFormat::Csv => write_atomically(path, |w| {
                writeln!(w, "unit,id,total_branches,covered_branches")?;
                for unit in &units {
                    writeln!(
                        w,
                        "{},{},{},{}",
                        unit.name, unit.id, unit.total_branches, unit.covered_branches
                    )?;
                }
                Ok(())
            }),
            ReportFormat::Json => {
                let report = UnitReport {
                    total_branches: self.total_branches(),
                    covered_branches: self.calculator.measure(&self.cumulative),
                    units: &units,
                };
                let json = serde_json::to_vec_pretty(&report)?;
                write_atomically(path, |w| w.write_all(&json))
            }
        }
    }
}

/// Writes through a temporary file in the destination directory and renames
/// it into place, so readers never observe a partial report.
fn write_atomically<F>(path: &Path, fill: F) -> Result<(), ReportError>
where
    F: FnOnce(&mut BufWriter<&mut NamedTempFile>) -> std::io::Result<()>,
{
    let io_err = |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
    {
        let mut writer = BufWriter::new(&mut tmp);
        fill(&mut writer).map_err(io_err)?;
        writer.flush().map_err(io_err)?;
    }
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
