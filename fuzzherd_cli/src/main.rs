use fuzzherd_core::campaign::{CampaignError, CampaignSettings, FuzzCampaign};
use fuzzherd_core::cancel::CancelToken;
use fuzzherd_core::config::{ConfigError, FuzzConfigFile, TargetProvider, filter_targets};
use fuzzherd_core::layout::{ProjectLayout, default_build_dir};
use fuzzherd_core::logging;
use fuzzherd_core::sanitizer;
use fuzzherd_core::supervisor::{ProcessSupervisor, TerminationPolicy};
use fuzzherd_core::triage::{CrashAnalyzer, DEFAULT_REPLAY_TIMEOUT_SECS, TriageError};

use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Runs libFuzzer campaigns and triages their crashes", long_about = None)]
struct Cli {
    /// One of: off, error, warn, info, debug, trace
    #[clap(long, global = true)]
    log_level: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fuzz every configured target in sequence
    Run(RunArgs),
    /// Replay saved crash inputs and report which still reproduce
    Triage(TriageArgs),
    /// List the configured targets
    Targets(ProjectArgs),
}

#[derive(Args, Debug)]
struct ProjectArgs {
    /// Directory containing the `fuzz/` tree
    #[clap(long, default_value = ".")]
    project_root: PathBuf,

    /// Config file, defaults to `<project-root>/fuzz/fuzz_config.toml`
    #[clap(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[clap(flatten)]
    project: ProjectArgs,

    /// Total fuzzing time per target in seconds
    #[clap(long)]
    max_seconds: Option<u64>,

    /// Parallel libFuzzer jobs per target
    #[clap(long)]
    jobs: Option<usize>,

    /// Only run these targets
    #[clap(long, num_args = 1..)]
    fuzzers: Vec<String>,

    /// Directory holding the `fuzz-<name>` binaries, relative to the project root
    #[clap(long)]
    build_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TriageArgs {
    #[clap(flatten)]
    project: ProjectArgs,

    /// Per-crash replay timeout in seconds
    #[clap(long, default_value_t = DEFAULT_REPLAY_TIMEOUT_SECS)]
    timeout: u64,

    /// Only analyze these targets, otherwise every `*-artifacts` directory
    #[clap(long, num_args = 1..)]
    fuzzers: Vec<String>,

    #[clap(long)]
    build_dir: Option<PathBuf>,
}

/// Whether a config file that fails to load aborts the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigUse {
    Required,
    /// Fall back to built-in defaults; only the log level is read.
    Optional,
}

/// Returns the config plus the load error that was tolerated, if any.
fn load_config(
    project: &ProjectArgs,
    layout: &ProjectLayout,
    usage: ConfigUse,
) -> Result<(FuzzConfigFile, Option<ConfigError>), ConfigError> {
    let loaded = match &project.config {
        Some(path) => FuzzConfigFile::load_from_file(path),
        None => FuzzConfigFile::load_or_default(&layout.config_file()),
    };
    match (loaded, usage) {
        (Ok(config), _) => Ok((config, None)),
        (Err(e), ConfigUse::Optional) => Ok((FuzzConfigFile::default(), Some(e))),
        (Err(e), ConfigUse::Required) => Err(e),
    }
}

struct Session {
    layout: ProjectLayout,
    config: FuzzConfigFile,
}

impl Session {
    /// Loads config then starts logging with the resolved level.
    fn open(
        project: &ProjectArgs,
        build_dir: Option<&PathBuf>,
        cli_level: Option<&str>,
        usage: ConfigUse,
        session_log: bool,
    ) -> Result<Self, anyhow::Error> {
        let build_dir = build_dir.cloned().unwrap_or_else(default_build_dir);
        let layout = ProjectLayout::new(&project.project_root, build_dir);
        let (config, tolerated) = load_config(project, &layout, usage)?;

        let level = logging::resolve_level(cli_level, config.log.level.as_deref())?;
        let log_path = session_log.then(|| logging::session_log_path(&layout.logs_dir()));
        if let Some(path) = logging::init_logging(level, log_path.as_deref())? {
            info!("Session log: {}", path.display());
        }
        if let Some(e) = tolerated {
            warn!("Ignoring config file, using defaults: {e}");
        }
        Ok(Self { layout, config })
    }
}

fn run_campaign(args: &RunArgs, cli_level: Option<&str>) -> Result<bool, anyhow::Error> {
    let session = Session::open(
        &args.project,
        args.build_dir.as_ref(),
        cli_level,
        ConfigUse::Required,
        true,
    )?;
    let targets = filter_targets(session.config.targets()?, &args.fuzzers)?;
    let settings = CampaignSettings {
        max_seconds_per_target: args.max_seconds.unwrap_or(session.config.max_seconds()),
        requested_jobs: args.jobs.or(session.config.jobs),
        limits: session.config.limits.clone(),
    };

    let cancel = CancelToken::install_interrupt_handler()?;
    let supervisor = ProcessSupervisor::new(TerminationPolicy::default(), cancel);
    let mut campaign = FuzzCampaign::new(session.layout, supervisor);

    match campaign.run_campaign(&targets, &settings) {
        Ok(summary) => {
            summary.log_summary();
            Ok(summary.overall_success())
        }
        Err(CampaignError::Interrupted { target }) => {
            warn!("Fuzzing session interrupted by user while running {target}");
            Ok(false)
        }
        Err(e @ CampaignError::Budget(_)) => {
            error!("{e}");
            error!("Please adjust the job count or memory limits and try again.");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn run_triage(args: &TriageArgs, cli_level: Option<&str>) -> Result<bool, anyhow::Error> {
    let session = Session::open(
        &args.project,
        args.build_dir.as_ref(),
        cli_level,
        ConfigUse::Optional,
        true,
    )?;
    let cancel = CancelToken::install_interrupt_handler()?;
    let analyzer = CrashAnalyzer::new(
        session.layout,
        ProcessSupervisor::new(TerminationPolicy::strict(), cancel),
        Duration::from_secs(args.timeout),
    );

    let filter = (!args.fuzzers.is_empty()).then_some(args.fuzzers.as_slice());
    match analyzer.analyze_campaign(filter) {
        Ok(summary) => {
            summary.log_summary();
            Ok(summary.passed())
        }
        Err(TriageError::Interrupted { crash_file }) => {
            warn!("Crash analysis interrupted by user at {}", crash_file.display());
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn list_targets(project: &ProjectArgs, cli_level: Option<&str>) -> Result<bool, anyhow::Error> {
    let session = Session::open(project, None, cli_level, ConfigUse::Required, false)?;
    for target in session.config.targets()? {
        let binary = session.layout.binary(&target.name);
        let status = if binary.exists() { "built" } else { "missing" };
        println!("{:<24} max-len={:<8} {}", target.name, target.max_len, status);
    }
    Ok(true)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = cli.log_level.as_deref();

    let result = sanitizer::validate_profiles()
        .map_err(anyhow::Error::from)
        .and_then(|()| match &cli.command {
            Command::Run(args) => run_campaign(args, level),
            Command::Triage(args) => run_triage(args, level),
            Command::Targets(args) => list_targets(args, level),
        });

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            if log::log_enabled!(log::Level::Error) {
                error!("{e:#}");
            } else {
                eprintln!("Error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}
