//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use legisflow_artifacts::ArtifactStore;
use legisflow_convert::DocumentConverter;
use legisflow_core::{
    EXPORT_FILE, GuardedModel, ModelClient, ModelSpec, PipelineRunner, ProgressReporter,
    RunConfig, RunSummary, StageModels, StageOutcome, build_client, build_export, load_agencies,
    write_export,
};
use legisflow_shared::{
    AppConfig, BillId, ModelFamily, RetryPolicy, SessionId, SourceKind, Stage, StageStatus,
    StateBackend, init_config, load_config, render_config, validate_api_key,
};
use legisflow_source::{DocumentSource, HttpManifestSource, LocalSource};
use legisflow_storage::{StateTracker, open_tracker};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use url::Url;

/// Directory holding artifacts inside a session directory.
const ARTIFACTS_DIR: &str = "artifacts";

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// legisflow: incremental legislative document pipeline.
#[derive(Parser)]
#[command(
    name = "legisflow",
    version,
    about = "Convert, amend and analyze a legislative session's bills, re-running only what changed.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (overrides `[defaults] data_dir`).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// State backend selector.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum StateArg {
    Json,
    Libsql,
}

impl From<StateArg> for StateBackend {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Json => StateBackend::Json,
            StateArg::Libsql => StateBackend::Libsql,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline for a session.
    Run {
        /// Session identifier, e.g. 2026rs.
        #[arg(long)]
        session: SessionId,

        /// Model family: gemini, gpt, or ollama.
        #[arg(long)]
        model_family: Option<ModelFamily>,

        /// Model id for both amend and qa (defaults to the family's default model).
        #[arg(long)]
        model: Option<String>,

        /// Model id for the amend stage only.
        #[arg(long)]
        amend_model: Option<String>,

        /// Model id for the qa stage only.
        #[arg(long)]
        qa_model: Option<String>,

        /// Process at most this many bills.
        #[arg(long)]
        debug_cap: Option<usize>,

        /// Re-run every stage regardless of recorded fingerprints.
        #[arg(long)]
        force: bool,

        /// Bills processed concurrently.
        #[arg(long)]
        workers: Option<usize>,

        /// State backend.
        #[arg(long)]
        state: Option<StateArg>,
    },

    /// Write the consolidated export for a session.
    Export {
        #[arg(long)]
        session: SessionId,

        /// Output path (defaults to <data_dir>/<session>/export.json).
        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long)]
        state: Option<StateArg>,
    },

    /// Show per-bill stage status.
    Status {
        #[arg(long)]
        session: SessionId,

        /// Only show bills with a failed stage.
        #[arg(long)]
        failed: bool,

        #[arg(long)]
        state: Option<StateArg>,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "legisflow=info",
        1 => "legisflow=debug",
        _ => "legisflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let data_dir = cli.data_dir;
    match cli.command {
        Command::Run {
            session,
            model_family,
            model,
            amend_model,
            qa_model,
            debug_cap,
            force,
            workers,
            state,
        } => {
            let args = RunArgs {
                session,
                model_family,
                model,
                amend_model,
                qa_model,
                debug_cap,
                force,
                workers,
                state,
            };
            cmd_run(data_dir.as_deref(), args).await
        }
        Command::Export {
            session,
            out,
            state,
        } => cmd_export(data_dir.as_deref(), &session, out, state).await,
        Command::Status {
            session,
            failed,
            state,
        } => cmd_status(data_dir.as_deref(), &session, failed, state).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Where a session's state, artifacts and export live.
struct SessionPaths {
    dir: PathBuf,
}

impl SessionPaths {
    fn new(config: &AppConfig, data_dir: Option<&Path>, session: &SessionId) -> Self {
        let root = data_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(&config.defaults.data_dir));
        Self {
            dir: root.join(session.as_str()),
        }
    }

    fn export(&self) -> PathBuf {
        self.dir.join(EXPORT_FILE)
    }
}

async fn open_state(
    config: &AppConfig,
    paths: &SessionPaths,
    session: &SessionId,
    state: Option<StateArg>,
) -> Result<(Arc<dyn StateTracker>, ArtifactStore)> {
    std::fs::create_dir_all(&paths.dir)
        .map_err(|e| eyre!("cannot create {}: {e}", paths.dir.display()))?;
    let backend = state.map(StateBackend::from).unwrap_or(config.defaults.state_backend);
    let tracker = open_tracker(backend, &paths.dir, session).await?;
    let store = ArtifactStore::open(paths.dir.join(ARTIFACTS_DIR))?;
    Ok((tracker, store))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunArgs {
    session: SessionId,
    model_family: Option<ModelFamily>,
    model: Option<String>,
    amend_model: Option<String>,
    qa_model: Option<String>,
    debug_cap: Option<usize>,
    force: bool,
    workers: Option<usize>,
    state: Option<StateArg>,
}

async fn cmd_run(data_dir: Option<&Path>, args: RunArgs) -> Result<()> {
    let config = load_config()?;
    let family = args.model_family.unwrap_or(config.models.family);
    // Fail before touching any state if the provider cannot be called.
    validate_api_key(&config, family)?;

    let limits = &config.limits;
    let timeout = limits.request_timeout();
    let retry = RetryPolicy::from(limits);
    let provider = config.models.provider(family);
    let model_permits = Arc::new(Semaphore::new(limits.max_inflight_model_calls.max(1)));

    let guarded = |model: String| -> Result<Arc<dyn ModelClient>> {
        let spec = ModelSpec {
            family,
            model,
            temperature: config.models.temperature,
        };
        let client = build_client(spec, provider, timeout)?;
        Ok(Arc::new(GuardedModel::new(
            client,
            Arc::clone(&model_permits),
            timeout,
            retry,
        )))
    };
    let default_model = args
        .model
        .clone()
        .unwrap_or_else(|| provider.default_model.clone());
    let models = StageModels {
        amend: guarded(args.amend_model.unwrap_or_else(|| default_model.clone()))?,
        qa: guarded(args.qa_model.unwrap_or(default_model))?,
    };

    let source: Arc<dyn DocumentSource> = match config.source.kind {
        SourceKind::Local => Arc::new(LocalSource::new(&config.source.location)),
        SourceKind::Http => {
            let base = Url::parse(&config.source.location)
                .map_err(|e| eyre!("invalid source URL '{}': {e}", config.source.location))?;
            Arc::new(HttpManifestSource::new(
                base,
                timeout,
                limits.max_inflight_fetches,
                retry,
            )?)
        }
    };

    let agencies = match &config.qa.agencies_file {
        Some(path) => load_agencies(Path::new(path))?,
        None => Vec::new(),
    };

    let paths = SessionPaths::new(&config, data_dir, &args.session);
    let (tracker, store) = open_state(&config, &paths, &args.session, args.state).await?;

    let run_config = RunConfig {
        session: args.session.clone(),
        debug_cap: args.debug_cap,
        force: args.force,
        workers: args.workers.unwrap_or(config.defaults.workers),
        agencies,
    };
    info!(
        session = %run_config.session,
        amend_model = %models.amend.spec(),
        qa_model = %models.qa.spec(),
        workers = run_config.workers,
        debug_cap = ?run_config.debug_cap,
        force = run_config.force,
        "starting pipeline"
    );

    let runner = PipelineRunner::new(
        source,
        Arc::new(DocumentConverter::new()),
        models,
        Arc::clone(&tracker),
        store.clone(),
    );
    let progress = Arc::new(CliProgress::new());

    let summary = tokio::select! {
        result = runner.run(&run_config, progress.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            progress.bar.abandon_with_message("interrupted");
            warn!("run interrupted; completed stages are saved and will be skipped next run");
            return Err(eyre!("run interrupted"));
        }
    };

    let export = build_export(&args.session, tracker.as_ref(), &store).await?;
    let export_path = paths.export();
    write_export(&export, &export_path)?;

    print_summary(&summary);
    println!("  Export:  {}", export_path.display());
    println!();
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("  Session: {}", summary.session);
    println!("  Bills:   {}", summary.bills);
    println!();
    println!(
        "  {:<8} {:>9} {:>8} {:>6} {:>7} {:>8}",
        "stage", "succeeded", "skipped", "n/a", "failed", "blocked"
    );
    for stage in Stage::ALL {
        let c = summary.counts(stage);
        println!(
            "  {:<8} {:>9} {:>8} {:>6} {:>7} {:>8}",
            stage.as_str(),
            c.succeeded,
            c.skipped,
            c.not_applicable,
            c.failed,
            c.blocked
        );
    }
    println!();
    println!(
        "  Invocations: {}  Model calls: {}  Time: {:.1}s",
        summary.invocations,
        summary.model_calls,
        summary.elapsed.as_secs_f64()
    );

    if !summary.failures.is_empty() {
        println!();
        println!("  Failures:");
        for failure in &summary.failures {
            println!(
                "    {} {} [{}] {}",
                failure.bill.number, failure.stage, failure.category, failure.message
            );
        }
    }

    if !summary.rejected.is_empty() {
        println!();
        println!("  Rejected listings:");
        for rejected in &summary.rejected {
            println!(
                "    {:?} [{}] {}",
                rejected.number, rejected.category, rejected.message
            );
        }
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn bills_listed(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn stage_finished(&self, bill: &BillId, stage: Stage, outcome: &StageOutcome) {
        if let StageOutcome::Failed(err) = outcome {
            self.bar
                .println(format!("  ✗ {} {stage}: [{}] {}", bill.number, err.category, err.message));
        }
    }

    fn bill_finished(&self, bill: &BillId, completed: usize, _total: usize) {
        self.bar.set_position(completed as u64);
        self.bar.set_message(bill.number.clone());
    }

    fn done(&self, _summary: &RunSummary) {
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// export / status
// ---------------------------------------------------------------------------

async fn cmd_export(
    data_dir: Option<&Path>,
    session: &SessionId,
    out: Option<PathBuf>,
    state: Option<StateArg>,
) -> Result<()> {
    let config = load_config()?;
    let paths = SessionPaths::new(&config, data_dir, session);
    let (tracker, store) = open_state(&config, &paths, session, state).await?;

    let export = build_export(session, tracker.as_ref(), &store).await?;
    let path = out.unwrap_or_else(|| paths.export());
    write_export(&export, &path)?;
    println!(
        "Exported {} bills to {}",
        export.bills.len(),
        path.display()
    );
    Ok(())
}

async fn cmd_status(
    data_dir: Option<&Path>,
    session: &SessionId,
    failed_only: bool,
    state: Option<StateArg>,
) -> Result<()> {
    let config = load_config()?;
    let paths = SessionPaths::new(&config, data_dir, session);
    let (tracker, _store) = open_state(&config, &paths, session, state).await?;

    let bills = tracker.bills(session).await?;
    if bills.is_empty() {
        println!("No bills tracked for session {session}.");
        return Ok(());
    }

    println!("  {:<10} {:<10} {:<15} {:<10}", "bill", "convert", "amend", "qa");
    let mut shown = 0;
    for bill in &bills {
        let status = |stage: Stage| {
            bill.stages
                .get(&stage)
                .map(|r| r.status.as_str())
                .unwrap_or("-")
        };
        let has_failure = bill
            .stages
            .values()
            .any(|r| r.status == StageStatus::Failed);
        if failed_only && !has_failure {
            continue;
        }
        shown += 1;
        println!(
            "  {:<10} {:<10} {:<15} {:<10}",
            bill.id.number,
            status(Stage::Convert),
            status(Stage::Amend),
            status(Stage::Qa)
        );
        for record in bill.stages.values() {
            if let Some(error) = record.error.as_ref().filter(|_| record.status == StageStatus::Failed) {
                println!(
                    "      {} [{}] attempts={} {}",
                    record.stage, error.category, record.attempts, error.message
                );
            }
        }
    }
    println!();
    println!("  {shown} of {} bills shown", bills.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    println!("{}", render_config(&config)?);
    Ok(())
}
