use crate::channel::MAX_FRAME_LEN;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File suffix that marks a unit descriptor when walking artifact directories.
pub const UNIT_SUFFIX: &str = ".unit.toml";

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("Coverage artifact {0:?} does not exist")]
    MissingArtifact(PathBuf),
    #[error("Coverage I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid name filter pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Coverage blob encoding error: {0}")]
    Encode(#[from] EncodeError),
    #[error("Coverage blob decoding error: {0}")]
    Decode(#[from] DecodeError),
}

/// Failure to analyze a single unit. Never aborts a whole calculation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("unit is not valid UTF-8")]
    NotUtf8,
    #[error("malformed unit: {0}")]
    Malformed(String),
}

/// Content-derived identifier of a unit: the first eight bytes of its MD5 digest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode, Serialize,
)]
pub struct UnitId(pub u64);

impl UnitId {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = md5::compute(bytes);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.0[..8]);
        UnitId(u64::from_be_bytes(head))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Probe hits recorded for one unit during one or more executions.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct UnitHits {
    pub id: UnitId,
    pub name: String,
    pub probes: Vec<bool>,
}

impl UnitHits {
    fn union_with(&mut self, other: &UnitHits) {
        if other.probes.len() > self.probes.len() {
            self.probes.resize(other.probes.len(), false);
        }
        for (mine, theirs) in self.probes.iter_mut().zip(&other.probes) {
            *mine |= *theirs;
        }
    }
}

/// Snapshot of branch-hit state produced by a coverage agent.
///
/// Everything outside this module treats a blob as opaque: it is produced by
/// the worker, merged and measured here, and persisted via [`CoverageBlob::to_bytes`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct CoverageBlob {
    units: BTreeMap<UnitId, UnitHits>,
}

fn blob_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<{ MAX_FRAME_LEN }>()
}

impl CoverageBlob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the hits of one unit, unioning with anything already recorded for it.
    pub fn record(&mut self, id: UnitId, name: impl Into<String>, probes: Vec<bool>) {
        let hits = UnitHits {
            id,
            name: name.into(),
            probes,
        };
        match self.units.get_mut(&id) {
            Some(existing) => existing.union_with(&hits),
            None => {
                self.units.insert(id, hits);
            }
        }
    }

    pub fn units(&self) -> impl Iterator<Item = &UnitHits> {
        self.units.values()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Number of probes set across all units.
    pub fn hit_count(&self) -> usize {
        self.units
            .values()
            .map(|u| u.probes.iter().filter(|hit| **hit).count())
            .sum()
    }

    /// Union of two blobs. Commutative and associative, so folding a sequence
    /// of blobs yields the same result under any grouping.
    pub fn merge(a: &CoverageBlob, b: &CoverageBlob) -> CoverageBlob {
        let mut merged = a.clone();
        merged.merge_in(b);
        merged
    }

    pub fn merge_in(&mut self, other: &CoverageBlob) {
        for hits in other.units.values() {
            match self.units.get_mut(&hits.id) {
                Some(existing) => existing.union_with(hits),
                None => {
                    self.units.insert(hits.id, hits.clone());
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CoverageError> {
        Ok(bincode::encode_to_vec(self, blob_config())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoverageError> {
        let (blob, _len): (CoverageBlob, usize) = bincode::decode_from_slice(bytes, blob_config())?;
        Ok(blob)
    }
}

/// Result of statically analyzing one unit: its name and the number of
/// branches each probe guards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitAnalysis {
    pub name: String,
    pub probe_branches: Vec<u32>,
}

impl UnitAnalysis {
    pub fn total_branches(&self) -> u64 {
        self.probe_branches.iter().map(|b| u64::from(*b)).sum()
    }

    pub fn covered_branches(&self, probes: &[bool]) -> u64 {
        self.probe_branches
            .iter()
            .zip(probes)
            .filter(|(_, hit)| **hit)
            .map(|(branches, _)| u64::from(*branches))
            .sum()
    }
}

/// The branch analysis collaborator: turns raw unit bytes into branch counts.
pub trait BranchAnalyzer: Send + Sync {
    fn analyze(&self, bytes: &[u8]) -> Result<UnitAnalysis, AnalysisError>;
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct UnitDescriptor {
    name: String,
    branches: Vec<u32>,
}

/// Analyzer for TOML unit descriptors:
///
/// ```toml
/// name = "demo.Tokenizer"
/// branches = [0, 2, 2, 1]
/// ```
///
/// Each entry of `branches` is one probe; the value is how many branches
/// that probe guards (zero for plain line probes).
#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptorAnalyzer;

impl BranchAnalyzer for DescriptorAnalyzer {
    fn analyze(&self, bytes: &[u8]) -> Result<UnitAnalysis, AnalysisError> {
        let text = std::str::from_utf8(bytes).map_err(|_| AnalysisError::NotUtf8)?;
        let descriptor: UnitDescriptor =
            toml::from_str(text).map_err(|e| AnalysisError::Malformed(e.to_string()))?;
        if descriptor.name.trim().is_empty() {
            return Err(AnalysisError::Malformed("empty unit name".to_string()));
        }
        Ok(UnitAnalysis {
            name: descriptor.name,
            probe_branches: descriptor.branches,
        })
    }
}

/// Include/exclude filter over unit names. Patterns are colon-separated
/// wildcards where `*` matches any run of characters and `?` exactly one.
#[derive(Debug, Clone)]
pub struct NameFilter {
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl NameFilter {
    pub fn new(includes: &str, excludes: &str) -> Result<Self, CoverageError> {
        let includes = if includes.trim().is_empty() {
            "*"
        } else {
            includes
        };
        Ok(Self {
            includes: compile_wildcards(includes)?,
            excludes: compile_wildcards(excludes)?,
        })
    }

    pub fn all() -> Self {
        Self {
            includes: vec![Regex::new("^.*$").expect("valid catch-all regex")],
            excludes: Vec::new(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.includes.iter().any(|re| re.is_match(name))
            && !self.excludes.iter().any(|re| re.is_match(name))
    }
}

fn compile_wildcards(patterns: &str) -> Result<Vec<Regex>, CoverageError> {
    patterns
        .split(':')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|pattern| {
            let mut expr = String::from("^");
            for c in pattern.chars() {
                match c {
                    '*' => expr.push_str(".*"),
                    '?' => expr.push('.'),
                    other => expr.push_str(&regex::escape(&other.to_string())),
                }
            }
            expr.push('$');
            Regex::new(&expr).map_err(|source| CoverageError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
        })
        .collect()
}

#[derive(Debug)]
struct CachedUnit {
    name: String,
    bytes: Vec<u8>,
}

/// Per-unit totals, used for the delegated branch report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitCoverage {
    pub id: UnitId,
    pub name: String,
    pub total_branches: u64,
    pub covered_branches: u64,
}

/// Measures coverage blobs against a fixed set of units.
///
/// The unit cache and the branch denominator are computed once in
/// [`CoverageCalculator::new`] and never change afterwards.
pub struct CoverageCalculator {
    units: HashMap<UnitId, CachedUnit>,
    filter: NameFilter,
    analyzer: Box<dyn BranchAnalyzer>,
    total_branches: u64,
}

impl CoverageCalculator {
    /// Analyzes every unit found under `artifacts` (files, or directories
    /// walked recursively for `*.unit.toml`). Units that fail analysis are
    /// logged and left out.
    pub fn new(
        artifacts: &[PathBuf],
        filter: NameFilter,
        analyzer: impl BranchAnalyzer + 'static,
    ) -> Result<Self, CoverageError> {
        let mut files = Vec::new();
        for artifact in artifacts {
            if !artifact.exists() {
                return Err(CoverageError::MissingArtifact(artifact.clone()));
            }
            if artifact.is_dir() {
                collect_unit_files(artifact, &mut files)?;
            } else {
                files.push(artifact.clone());
            }
        }

        let mut units = HashMap::new();
        let mut total_branches = 0u64;
        for file in files {
            let bytes = fs::read(&file).map_err(|source| CoverageError::Io {
                path: file.clone(),
                source,
            })?;
            let id = UnitId::of(&bytes);
            if units.contains_key(&id) {
                continue;
            }
            let analysis = match analyzer.analyze(&bytes) {
                Ok(analysis) => analysis,
                Err(e) => {
                    tracing::warn!("Skipping unit {:?}: {}", file, e);
                    continue;
                }
            };
            if !filter.matches(&analysis.name) {
                tracing::debug!("Unit {} excluded by filter", analysis.name);
                continue;
            }
            total_branches += analysis.total_branches();
            units.insert(
                id,
                CachedUnit {
                    name: analysis.name,
                    bytes,
                },
            );
        }

        tracing::info!(
            "Coverage calculator ready: {} units, {} branches",
            units.len(),
            total_branches
        );
        Ok(Self {
            units,
            filter,
            analyzer: Box::new(analyzer),
            total_branches,
        })
    }

    /// The fixed denominator: branches across all cached units.
    pub fn total_branches(&self) -> u64 {
        self.total_branches
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn contains(&self, id: UnitId) -> bool {
        self.units.contains_key(&id)
    }

    /// Covered branches in `blob`, counting only known units whose names
    /// pass the filter.
    pub fn measure(&self, blob: &CoverageBlob) -> u64 {
        blob.units()
            .filter_map(|hits| self.covered_in_unit(hits))
            .sum()
    }

    fn covered_in_unit(&self, hits: &UnitHits) -> Option<u64> {
        let cached = self.units.get(&hits.id)?;
        if !self.filter.matches(&hits.name) {
            return None;
        }
        match self.analyzer.analyze(&cached.bytes) {
            Ok(analysis) => Some(analysis.covered_branches(&hits.probes)),
            Err(e) => {
                tracing::warn!("Failed to re-analyze unit {}: {}", cached.name, e);
                None
            }
        }
    }

    /// Per-unit totals for every cached unit, sorted by name.
    pub fn breakdown(&self, blob: &CoverageBlob) -> Vec<UnitCoverage> {
        let hits_by_id: HashMap<UnitId, &UnitHits> = blob.units().map(|h| (h.id, h)).collect();
        let mut rows: Vec<UnitCoverage> = self
            .units
            .iter()
            .filter_map(|(id, cached)| {
                let analysis = self.analyzer.analyze(&cached.bytes).ok()?;
                let covered = hits_by_id
                    .get(id)
                    .filter(|hits| self.filter.matches(&hits.name))
                    .map_or(0, |hits| analysis.covered_branches(&hits.probes));
                Some(UnitCoverage {
                    id: *id,
                    name: cached.name.clone(),
                    total_branches: analysis.total_branches(),
                    covered_branches: covered,
                })
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        rows
    }
}

impl fmt::Debug for CoverageCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoverageCalculator")
            .field("units", &self.units.len())
            .field("total_branches", &self.total_branches)
            .finish_non_exhaustive()
    }
}

fn collect_unit_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), CoverageError> {
    let io_err = |source| CoverageError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()
        .map_err(io_err)?;
    entries.sort();
    for path in entries {
        if path.is_dir() {
            collect_unit_files(&path, out)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(UNIT_SUFFIX))
        {
            out.push(path);
        }
    }
    Ok(())
}
