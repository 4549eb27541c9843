use crate::report::ReportFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    /// Harness name looked up in the worker's registry.
    pub name: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            name: "demo".to_string(),
            executable: PathBuf::from("./target/release/forkline_core"),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct AnalysisSettings {
    #[serde(default = "default_corpus_dirs")]
    pub corpus_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub failure_dirs: Vec<PathBuf>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Per-input deadline; zero disables it.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,
    /// Wall-clock budget for the whole campaign.
    #[serde(default)]
    pub max_total_time_secs: Option<u64>,
    /// Kept signed so a negative value is rejected with a clear error.
    #[serde(default = "default_max_trace_size")]
    pub max_trace_size: i64,
    #[serde(default)]
    pub report_format: ReportFormat,
}

fn default_corpus_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("./corpus")]
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./forkline-out")
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_launch_timeout_ms() -> u64 {
    30_000
}

pub fn default_max_trace_size() -> i64 {
    5
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            corpus_dirs: default_corpus_dirs(),
            failure_dirs: Vec::new(),
            output_dir: default_output_dir(),
            timeout_ms: default_timeout_ms(),
            launch_timeout_ms: default_launch_timeout_ms(),
            max_total_time_secs: None,
            max_trace_size: default_max_trace_size(),
            report_format: ReportFormat::default(),
        }
    }
}

impl AnalysisSettings {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn input_dirs(&self) -> Vec<PathBuf> {
        self.corpus_dirs
            .iter()
            .chain(&self.failure_dirs)
            .cloned()
            .collect()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoverageSettings {
    /// Files or directories holding `*.unit.toml` descriptors.
    #[serde(default = "default_artifacts")]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

fn default_artifacts() -> Vec<PathBuf> {
    vec![PathBuf::from("./units")]
}

impl Default for CoverageSettings {
    fn default() -> Self {
        Self {
            artifacts: default_artifacts(),
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    pub target: TargetSettings,
    #[serde(default)]
    pub analysis: AnalysisSettings,
    #[serde(default)]
    pub coverage: CoverageSettings,
}

impl CampaignConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: CampaignConfig = toml::from_str(
            r#"
            [target]
            name = "parser"
            executable = "/opt/worker"
            "#,
        )
        .unwrap();
        assert_eq!(config.target.name, "parser");
        assert_eq!(config.analysis, AnalysisSettings::default());
        assert_eq!(config.analysis.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.analysis.report_format, ReportFormat::Csv);
        assert!(config.coverage.includes.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let config: CampaignConfig = toml::from_str(
            r#"
            [target]
            name = "parser"
            executable = "/opt/worker"
            args = ["--strict"]
            working-dir = "/srv"
            env = { RUST_LOG = "debug" }

            [analysis]
            corpus-dirs = ["a"]
            failure-dirs = ["b"]
            timeout-ms = 0
            max-total-time-secs = 60
            max-trace-size = 8
            report-format = "json"

            [coverage]
            artifacts = ["units"]
            includes = ["demo.*"]
            excludes = ["*Test"]
            "#,
        )
        .unwrap();
        assert_eq!(config.target.env["RUST_LOG"], "debug");
        assert_eq!(config.analysis.timeout(), None);
        assert_eq!(
            config.analysis.input_dirs(),
            vec![PathBuf::from("a"), PathBuf::from("b")]
        );
        assert_eq!(config.analysis.report_format, ReportFormat::Json);
        assert_eq!(config.coverage.excludes, vec!["*Test".to_string()]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<CampaignConfig, _> = toml::from_str(
            r#"
            [target]
            name = "parser"
            executable = "/opt/worker"
            mutator = "havoc"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let rendered = toml::to_string_pretty(&CampaignConfig::default()).unwrap();
        let parsed: CampaignConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, CampaignConfig::default());
    }

    #[test]
    fn load_from_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("forkline.toml");
        match CampaignConfig::load_from_file(&path) {
            Err(ConfigError::Read { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("Expected Read error, got {other:?}"),
        }
        std::fs::write(&path, "[target]\nname = 3\n").unwrap();
        assert!(matches!(
            CampaignConfig::load_from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
