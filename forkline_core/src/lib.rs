pub mod campaign;
pub mod channel;
pub mod config;
pub mod coverage;
pub mod failure;
pub mod input;
pub mod report;
pub mod supervisor;
pub mod worker;

pub use campaign::{Campaign, CampaignError, CampaignSummary};
pub use channel::{ChannelError, Connection, ExecutionReport, Request, WorkerHello};
pub use config::{CampaignConfig, ConfigError};
pub use coverage::{
    BranchAnalyzer, CoverageBlob, CoverageCalculator, CoverageError, DescriptorAnalyzer,
    NameFilter, UnitId,
};
pub use failure::{Failure, RaisedError, RunnerFrames, StackCleaner, StackFrame};
pub use input::{InputFile, collect_inputs};
pub use report::{CampaignReport, ReportFormat};
pub use supervisor::{AnalysisOutcome, Supervisor, SupervisorError, SupervisorSettings};
pub use worker::{CoverageAgent, Harness, HarnessRegistry, ProbeMap, UnitProbes, Worker};
