use crate::config::CampaignConfig;
use crate::coverage::{CoverageCalculator, CoverageError, DescriptorAnalyzer, NameFilter};
use crate::failure::{FailureError, StackCleaner};
use crate::input::{InputError, collect_inputs};
use crate::report::{CampaignReport, ReportError};
use crate::supervisor::{AnalysisOutcome, Supervisor, SupervisorError, SupervisorSettings};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const COVERAGE_FILE: &str = "coverage.txt";
pub const FAILURES_FILE: &str = "failures.txt";
pub const EXEC_FILE: &str = "coverage.exec";

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Worker executable {0:?} does not exist or is not a file")]
    MissingExecutable(PathBuf),
    #[error("Working directory {0:?} does not exist")]
    MissingWorkingDir(PathBuf),
    #[error("Failed to create output directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Failure(#[from] FailureError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Coverage(#[from] CoverageError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Counts for one finished campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CampaignSummary {
    pub analyzed: usize,
    pub timed_out: usize,
    pub worker_lost: usize,
    /// Inputs left over when the wall-clock budget ran out.
    pub skipped: usize,
    pub failures: usize,
    pub covered: u64,
    pub total: u64,
}

/// A validated campaign, ready to run.
#[derive(Debug)]
pub struct Campaign {
    config: CampaignConfig,
    cleaner: StackCleaner,
    filter: NameFilter,
}

impl Campaign {
    /// Checks everything that can be checked without launching a worker.
    pub fn from_config(config: &CampaignConfig) -> Result<Self, CampaignError> {
        let target = &config.target;
        if !target.executable.is_file() {
            return Err(CampaignError::MissingExecutable(target.executable.clone()));
        }
        if let Some(dir) = &target.working_dir {
            if !dir.is_dir() {
                return Err(CampaignError::MissingWorkingDir(dir.clone()));
            }
        }
        for dir in config.analysis.input_dirs() {
            if !dir.is_dir() {
                return Err(InputError::MissingDirectory(dir).into());
            }
        }
        let cleaner = StackCleaner::new(config.analysis.max_trace_size)?;
        let filter = NameFilter::new(
            &config.coverage.includes.join(":"),
            &config.coverage.excludes.join(":"),
        )?;
        let output_dir = &config.analysis.output_dir;
        fs::create_dir_all(output_dir).map_err(|source| CampaignError::OutputDir {
            path: output_dir.clone(),
            source,
        })?;

        Ok(Self {
            config: config.clone(),
            cleaner,
            filter,
        })
    }

    pub fn config(&self) -> &CampaignConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.analysis.output_dir
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let target = &self.config.target;
        let analysis = &self.config.analysis;
        let mut settings = SupervisorSettings::new(&target.executable, &target.name);
        settings.args = target.args.clone();
        settings.working_dir = target.working_dir.clone();
        settings.env = target.env.clone();
        settings.timeout = analysis.timeout();
        settings.launch_timeout = Duration::from_millis(analysis.launch_timeout_ms);
        settings
    }

    /// Analyzes every input in modification order and writes the report
    /// artifacts into the output directory.
    pub fn run(&self) -> Result<CampaignSummary, CampaignError> {
        let analysis = &self.config.analysis;
        let inputs = collect_inputs(&analysis.input_dirs())?;
        let calculator = CoverageCalculator::new(
            &self.config.coverage.artifacts,
            self.filter.clone(),
            DescriptorAnalyzer,
        )?;
        tracing::info!(
            "Analyzing {} inputs against {} units ({} branches)",
            inputs.len(),
            calculator.unit_count(),
            calculator.total_branches()
        );

        let mut supervisor = Supervisor::new(self.supervisor_settings())?;
        let mut report = CampaignReport::new(&calculator, self.cleaner.clone());
        let mut summary = CampaignSummary::default();
        let budget = analysis.max_total_time_secs.map(Duration::from_secs);
        let started = Instant::now();

        for (idx, input) in inputs.iter().enumerate() {
            if budget.is_some_and(|budget| started.elapsed() >= budget) {
                summary.skipped = inputs.len() - idx;
                tracing::info!("Time budget spent; skipping {} inputs", summary.skipped);
                break;
            }
            match supervisor.analyze(input)? {
                AnalysisOutcome::Completed(execution) => {
                    report.record(input, &execution.coverage, execution.failure.as_ref());
                    summary.analyzed += 1;
                }
                AnalysisOutcome::TimedOut => summary.timed_out += 1,
                AnalysisOutcome::WorkerLost(_) => summary.worker_lost += 1,
            }
            if (idx + 1) % 1000 == 0 {
                tracing::info!(
                    "{}/{} inputs, {} branches covered",
                    idx + 1,
                    inputs.len(),
                    report.covered_branches()
                );
            }
        }
        supervisor.close();

        let out = self.output_dir();
        report.write_coverage(&out.join(COVERAGE_FILE))?;
        report.write_failures(&out.join(FAILURES_FILE))?;
        report.write_cumulative(&out.join(EXEC_FILE))?;
        if let Some(name) = analysis.report_format.file_name() {
            report.write_unit_report(&out.join(name), analysis.report_format)?;
        }

        summary.failures = report.failures().len();
        summary.covered = report.covered_branches();
        summary.total = report.total_branches();
        tracing::info!(
            "Campaign finished: {} analyzed, {} timed out, {} lost, {} distinct failures, {}/{} branches",
            summary.analyzed,
            summary.timed_out,
            summary.worker_lost,
            summary.failures,
            summary.covered,
            summary.total
        );
        Ok(summary)
    }
}
