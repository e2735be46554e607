use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use autofix_core::Issue;
use autofix_orchestrator::{AutofixConfig, BackendRegistry, Orchestrator};
use autofix_store_sqlite::MemoryStore;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "autofix.cli.v1";
const LOG_ENV: &str = "AUTOFIX_LOG";

#[derive(Debug, Parser)]
#[command(name = "autofix")]
#[command(about = "Remediate failing local model tests and remember what worked")]
struct Cli {
    /// Memory directory holding the attempt log and knowledge base.
    #[arg(long, global = true)]
    memory_dir: Option<PathBuf>,

    /// YAML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one analyze/apply/verify attempt for an issue file.
    Fix(FixArgs),
    /// List fixer backends and whether they can run here.
    List,
    /// Describe one fixer backend.
    Info(InfoArgs),
    /// Aggregate statistics over every recorded attempt.
    Stats,
    /// Learned characteristics and recent history for one model.
    Model(ModelArgs),
    /// Write a snapshot of everything learned so far.
    Export(ExportArgs),
}

#[derive(Debug, Args)]
struct FixArgs {
    #[arg(long)]
    issue: PathBuf,
    /// Fixer backend to run; the local qwen coder needs no API key.
    #[arg(long, default_value = "qwen")]
    backend: String,
}

#[derive(Debug, Args)]
struct InfoArgs {
    name: String,
}

#[derive(Debug, Args)]
struct ModelArgs {
    name: String,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    out: PathBuf,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new("warn"))
        .context("failed to create log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

fn load_config(cli: &Cli) -> Result<AutofixConfig> {
    let mut config = AutofixConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.memory_dir {
        config.memory_dir.clone_from(dir);
        config.validate()?;
    }
    debug!(memory_dir = %config.memory_dir.display(), "configuration loaded");
    Ok(config)
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging()?;
    let config = load_config(&cli)?;
    let registry = BackendRegistry::with_builtin_backends();

    match cli.command {
        Command::Fix(args) => run_fix(&args, &config, &registry),
        Command::List => run_list(&config, &registry).map(|()| ExitCode::SUCCESS),
        Command::Info(args) => run_info(&args, &config, &registry).map(|()| ExitCode::SUCCESS),
        Command::Stats => run_stats(&config).map(|()| ExitCode::SUCCESS),
        Command::Model(args) => run_model(&args, &config).map(|()| ExitCode::SUCCESS),
        Command::Export(args) => run_export(&args, &config).map(|()| ExitCode::SUCCESS),
    }
}

fn read_issue(path: &Path) -> Result<Issue> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read issue file {}", path.display()))?;
    Issue::from_json(&raw).with_context(|| format!("invalid issue file {}", path.display()))
}

fn run_fix(args: &FixArgs, config: &AutofixConfig, registry: &BackendRegistry) -> Result<ExitCode> {
    let issue = read_issue(&args.issue)?;
    let backend = registry.create(&args.backend, config)?;
    let store = MemoryStore::open(&config.memory_dir)?;
    info!(backend = %args.backend, model = %issue.model, "running fix attempt");

    let mut orchestrator = Orchestrator::new(store, backend, config.timeouts);
    let report = orchestrator.run(&issue)?;
    let verified = report.is_verified();
    emit_json(serde_json::to_value(&report)?)?;

    Ok(if verified { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn run_list(config: &AutofixConfig, registry: &BackendRegistry) -> Result<()> {
    let backends = registry.list(config);
    let available = backends.iter().filter(|status| status.availability.available).count();
    emit_json(serde_json::json!({
        "backends": backends,
        "available": available,
    }))
}

fn run_info(args: &InfoArgs, config: &AutofixConfig, registry: &BackendRegistry) -> Result<()> {
    let info = registry.describe(&args.name, config)?;
    emit_json(serde_json::to_value(info)?)
}

fn run_stats(config: &AutofixConfig) -> Result<()> {
    let store = MemoryStore::open(&config.memory_dir)?;
    let stats = store.get_memory_stats()?;
    let schema = store.schema_status()?;
    let mut value = serde_json::to_value(stats)?;
    if let Value::Object(object) = &mut value {
        object.insert("schemaVersion".to_string(), Value::from(schema.current_version));
    }
    emit_json(value)
}

fn run_model(args: &ModelArgs, config: &AutofixConfig) -> Result<()> {
    let store = MemoryStore::open(&config.memory_dir)?;
    let insights = store.get_model_insights(&args.name)?;
    emit_json(serde_json::to_value(insights)?)
}

fn run_export(args: &ExportArgs, config: &AutofixConfig) -> Result<()> {
    let store = MemoryStore::open(&config.memory_dir)?;
    let snapshot = serde_json::to_value(store.export_insights(&args.out)?)?;
    emit_json(serde_json::json!({
        "path": args.out.display().to_string(),
        "generatedAt": snapshot["generatedAt"],
        "statistics": snapshot["statistics"],
        "models": snapshot["modelInsights"].as_object().map_or(0, serde_json::Map::len),
    }))
}
