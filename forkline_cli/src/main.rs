use forkline_core::campaign::Campaign;
use forkline_core::config::CampaignConfig;
use forkline_core::input::collect_inputs;
use forkline_core::report::ReportFormat;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "forkline.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, global = true)]
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay every corpus and failure input through the worker and write reports.
    Analyze(AnalyzeArgs),
    /// List the inputs an analysis would replay, oldest first.
    Inputs {
        /// Directories to scan instead of the configured ones.
        dirs: Vec<PathBuf>,
    },
    /// Print a default configuration file.
    Init,
}

#[derive(clap::Args, Debug)]
struct AnalyzeArgs {
    #[clap(short, long)]
    target: Option<String>,
    #[clap(short, long)]
    executable: Option<PathBuf>,
    #[clap(short, long)]
    output_dir: Option<PathBuf>,
    /// Per-input deadline in milliseconds; 0 disables it.
    #[clap(long)]
    timeout_ms: Option<u64>,
    #[clap(long)]
    max_total_time_secs: Option<u64>,
    #[clap(long)]
    max_trace_size: Option<i64>,
    #[clap(long, value_enum)]
    report_format: Option<FormatArg>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Csv,
    Json,
    None,
}

impl From<FormatArg> for ReportFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Csv => ReportFormat::Csv,
            FormatArg::Json => ReportFormat::Json,
            FormatArg::None => ReportFormat::None,
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<CampaignConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            tracing::info!("Loading configuration from {:?}", config_path);
            Ok(CampaignConfig::load_from_file(config_path)?)
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG);
            if default_path.exists() {
                tracing::info!("No config file specified, loading default {:?}", default_path);
                Ok(CampaignConfig::load_from_file(&default_path)?)
            } else {
                tracing::info!(
                    "No config file specified and '{}' not found, using built-in defaults",
                    DEFAULT_CONFIG
                );
                Ok(CampaignConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut CampaignConfig, args: AnalyzeArgs) {
    if let Some(target) = args.target {
        config.target.name = target;
    }
    if let Some(executable) = args.executable {
        config.target.executable = executable;
    }
    if let Some(output_dir) = args.output_dir {
        config.analysis.output_dir = output_dir;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.analysis.timeout_ms = timeout_ms;
    }
    if let Some(secs) = args.max_total_time_secs {
        config.analysis.max_total_time_secs = Some(secs);
    }
    if let Some(size) = args.max_trace_size {
        config.analysis.max_trace_size = size;
    }
    if let Some(format) = args.report_format {
        config.analysis.report_format = format.into();
    }
}

fn analyze(config_file: Option<&Path>, args: AnalyzeArgs) -> Result<(), anyhow::Error> {
    let mut config = load_config(config_file)?;
    apply_overrides(&mut config, args);
    tracing::debug!("Effective configuration: {:#?}", config);

    let campaign = Campaign::from_config(&config)?;
    let summary = campaign.run()?;

    println!("Analyzed:        {}", summary.analyzed);
    println!("Timed out:       {}", summary.timed_out);
    println!("Worker lost:     {}", summary.worker_lost);
    if summary.skipped > 0 {
        println!("Skipped:         {} (time budget spent)", summary.skipped);
    }
    println!("Unique failures: {}", summary.failures);
    println!("Branch coverage: {}/{}", summary.covered, summary.total);
    println!("Reports written to {:?}", campaign.output_dir());
    Ok(())
}

fn list_inputs(config_file: Option<&Path>, dirs: Vec<PathBuf>) -> Result<(), anyhow::Error> {
    let dirs = if dirs.is_empty() {
        load_config(config_file)?.analysis.input_dirs()
    } else {
        dirs
    };
    for input in collect_inputs(&dirs)? {
        println!("{}\t{}", input.modified_millis, input.path.display());
    }
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_file = cli.config_file.as_deref();
    match cli.command {
        Command::Analyze(args) => analyze(config_file, args),
        Command::Inputs { dirs } => list_inputs(config_file, dirs),
        Command::Init => {
            print!("{}", toml::to_string_pretty(&CampaignConfig::default())?);
            Ok(())
        }
    }
}
