//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use matflow_core::pipeline::{
    PipelineConfig, PipelineReport, ProgressReporter, StageSelection, init_database,
    inspect_output, run_pipeline,
};
use matflow_core::retry::RetryPolicy;
use matflow_core::runner::ItemOutcome;
use matflow_core::shutdown::ShutdownSignal;
use matflow_gateway::{GatewaySettings, GeminiGateway, ModelGateway};
use matflow_schema::{SchemaContract, ValidationOutcome, validate};
use matflow_shared::{AppConfig, Stage, init_config, load_config, resolve_api_key};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// matflow: profile and match a material catalog with a hosted LLM.
#[derive(Parser)]
#[command(
    name = "matflow",
    version,
    about = "Two-stage schema-validated LLM pipeline over a company material catalog.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline over an input directory.
    Run {
        /// Directory holding pipeline.toml, the catalog, prompts and schemas.
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory (defaults to `defaults.output_dir`).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stages to run: profile, matching, or all.
        #[arg(long, default_value = "all")]
        stage: String,

        /// Concurrent model calls per stage.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Only process the first N catalog records.
        #[arg(long)]
        limit: Option<usize>,

        /// Render prompts to disk without calling the model.
        #[arg(long)]
        dry_run: bool,

        /// Model to use instead of the configured one.
        #[arg(long)]
        model: Option<String>,
    },

    /// Summarize what an output directory holds.
    Status {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check a JSON document against a schema file.
    Validate {
        /// Schema file.
        #[arg(long)]
        schema: PathBuf,

        /// Document to check.
        document: PathBuf,
    },

    /// Database management.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Database subcommands.
#[derive(Subcommand)]
pub(crate) enum DbAction {
    /// Create or migrate the output database.
    Init {
        #[arg(short, long)]
        output: Option<PathBuf>,
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
        0 => "matflow=info",
        1 => "matflow=debug",
        _ => "matflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

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
    match cli.command {
        Command::Run {
            input,
            output,
            stage,
            concurrency,
            limit,
            dry_run,
            model,
        } => {
            let opts = RunOptions {
                input,
                output,
                stage,
                concurrency,
                limit,
                dry_run,
                model,
            };
            cmd_run(opts).await
        }
        Command::Status { output } => cmd_status(output).await,
        Command::Validate { schema, document } => cmd_validate(&schema, &document),
        Command::Db { action } => match action {
            DbAction::Init { output } => cmd_db_init(output).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

fn output_dir(config: &AppConfig, flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunOptions {
    input: PathBuf,
    output: Option<PathBuf>,
    stage: String,
    concurrency: Option<usize>,
    limit: Option<usize>,
    dry_run: bool,
    model: Option<String>,
}

async fn cmd_run(opts: RunOptions) -> Result<()> {
    let config = load_config()?;
    let stages: StageSelection = opts.stage.parse()?;

    let mut gemini = config.gemini.clone();
    if let Some(model) = opts.model {
        gemini.model = model;
    }

    // A dry run never calls the model, so it does not need a key.
    let gateway: Arc<dyn ModelGateway> = if opts.dry_run {
        Arc::new(OfflineGateway { model: gemini.model.clone() })
    } else {
        let api_key = resolve_api_key(&config)?;
        let mut gateway = GeminiGateway::new(GatewaySettings::from_config(&gemini, api_key))?;
        gateway.resolve_model().await;
        Arc::new(gateway)
    };

    let pipeline_config = PipelineConfig {
        input_dir: opts.input,
        output_dir: output_dir(&config, opts.output),
        stages,
        concurrency: opts
            .concurrency
            .unwrap_or(config.defaults.concurrency as usize)
            .max(1),
        limit: opts.limit,
        dry_run: opts.dry_run,
        call_timeout: Duration::from_secs(gemini.timeout_secs),
        policy: RetryPolicy::from_config(&config.retry),
    };

    info!(
        input = %pipeline_config.input_dir.display(),
        output = %pipeline_config.output_dir.display(),
        model = gateway.model_id(),
        concurrency = pipeline_config.concurrency,
        "starting run"
    );

    let shutdown = ShutdownSignal::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight items");
            trigger.trigger();
        }
    });

    let reporter = CliProgress::new();
    let report = run_pipeline(&pipeline_config, gateway, shutdown, &reporter).await?;
    print_report(&report);

    if report.failed() > 0 {
        return Err(eyre!("{} item(s) failed", report.failed()));
    }
    Ok(())
}

fn print_report(report: &PipelineReport) {
    println!();
    if report.dry_run {
        println!("  Dry run: {} prompt(s) rendered", report.prompts_written);
        if report.unprofiled > 0 {
            println!("  Not yet profiled: {}", report.unprofiled);
        }
        println!();
        return;
    }

    println!("  Run:      {}", report.run_id);
    println!("  Model:    {}", report.model);
    println!("  Records:  {}", report.records);
    for stage in &report.stages {
        println!(
            "  {:<9} {} completed, {} cached, {} failed, {} interrupted ({} calls)",
            format!("{}:", stage.stage),
            stage.completed,
            stage.skipped,
            stage.failed.len(),
            stage.interrupted,
            stage.model_calls,
        );
    }
    if report.unprofiled > 0 {
        println!("  Not matched (no profile): {}", report.unprofiled);
    }
    let elapsed = report.finished_at - report.started_at;
    println!("  Time:     {:.1}s", elapsed.num_milliseconds() as f64 / 1000.0);
    if let Some(path) = &report.report_path {
        println!("  Report:   {}", path.display());
    }
    if report.interrupted {
        println!("  Interrupted: rerun the same command to resume.");
    }

    let failures: Vec<_> = report
        .stages
        .iter()
        .flat_map(|s| s.failed.iter().map(move |f| (s.stage, f)))
        .collect();
    if !failures.is_empty() {
        println!();
        println!("  Failed items:");
        for (stage, failure) in failures {
            println!("    [{stage}] {}: {}", failure.record_id, failure.reason);
        }
    }
    println!();
}

/// Stand-in gateway for dry runs; never called.
struct OfflineGateway {
    model: String,
}

#[async_trait::async_trait]
impl ModelGateway for OfflineGateway {
    async fn complete(
        &self,
        _prompt: &str,
        _contract: &SchemaContract,
        _timeout: Duration,
    ) -> matflow_gateway::ModelOutcome {
        matflow_gateway::ModelOutcome::PermanentFailure("dry run makes no model calls".into())
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn item_finished(
        &self,
        stage: Stage,
        record_id: &str,
        outcome: &ItemOutcome,
        current: usize,
        total: usize,
    ) {
        let label = match outcome {
            ItemOutcome::Completed(_) => "done",
            ItemOutcome::Skipped => "cached",
            ItemOutcome::Failed(_) => "failed",
            ItemOutcome::Interrupted => "interrupted",
        };
        self.spinner
            .set_message(format!("{stage} [{current}/{total}] {record_id}: {label}"));
    }

    fn done(&self, _report: &PipelineReport) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// status / validate / db / config
// ---------------------------------------------------------------------------

async fn cmd_status(output: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let dir = output_dir(&config, output);
    let status = inspect_output(&dir).await?;

    println!();
    println!("  Database: {} (schema v{})", status.database.display(), status.schema_version);
    if let Some(run) = &status.last_run {
        let finished = run
            .finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unfinished".into());
        println!("  Last run: {} ({} → {finished})", run.id, run.started_at.to_rfc3339());
    }
    println!("  Profiles: {}", status.profiles);
    println!("  Matches:  {}", status.matches);
    for (stage, item_status, count) in &status.manifest {
        println!("    {stage:<9} {item_status:<10} {count}");
    }
    if !status.failures.is_empty() {
        println!();
        println!("  Failed items:");
        for (record_id, stage, reason) in &status.failures {
            println!("    [{stage}] {record_id}: {reason}");
        }
    }
    println!();
    Ok(())
}

fn cmd_validate(schema: &Path, document: &Path) -> Result<()> {
    let contract = SchemaContract::load(schema)?;
    let text = std::fs::read_to_string(document)
        .map_err(|e| eyre!("cannot read '{}': {e}", document.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| eyre!("'{}' is not valid JSON: {e}", document.display()))?;

    match validate(&value, &contract) {
        ValidationOutcome::Valid => {
            println!("valid ({} v{})", contract.name, contract.version);
            Ok(())
        }
        ValidationOutcome::Invalid(violations) => {
            for v in &violations {
                println!("{v}");
            }
            Err(eyre!("{} violation(s)", violations.len()))
        }
    }
}

async fn cmd_db_init(output: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let path = init_database(&output_dir(&config, output)).await?;
    println!("Database ready at: {}", path.display());
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
