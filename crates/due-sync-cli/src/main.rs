use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use due_sync_client::RegistryClient;
use due_sync_core::{CancellationToken, Clock, ExternalRef, SyncConfig, SystemClock};
use due_sync_engine::{IngestionOrchestrator, RefreshOptions, RunReport, StopReason};
use due_sync_store_sqlite::SqliteStore;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "duesync.cli.v1";

#[derive(Debug, Parser)]
#[command(name = "duesync")]
#[command(about = "Keeps a local copy of export declarations in sync with the Siscomex registry")]
struct Cli {
    #[arg(long, env = "DUESYNC_DB", default_value = "./duesync.sqlite3")]
    db: PathBuf,

    /// YAML file with sync settings; secrets still come from the environment.
    #[arg(long, env = "DUESYNC_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    /// Where the session token is cached between runs.
    #[arg(long)]
    token_cache: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve unlinked invoice keys and fetch the declarations they point to.
    Discover,
    /// Re-sync stored declarations and orphaned links.
    Refresh(RefreshArgs),
    Refs {
        #[command(subcommand)]
        command: RefsCommand,
    },
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct RefreshArgs {
    /// Ignore the refresh interval.
    #[arg(long, default_value_t = false)]
    force: bool,
    /// Override the per-run record cap.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum RefsCommand {
    /// Seed invoice keys from a file, one per line.
    Import(RefsImportArgs),
}

#[derive(Debug, Args)]
struct RefsImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum TokenCommand {
    Status,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Stats,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Clone, Copy)]
enum Job {
    Discover,
    Refresh(RefreshOptions),
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

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match &cli.command {
        Command::Discover => run_sync(&cli, Job::Discover).await,
        Command::Refresh(args) => {
            let options = RefreshOptions { force: args.force, limit: args.limit };
            run_sync(&cli, Job::Refresh(options)).await
        }
        Command::Refs { command: RefsCommand::Import(args) } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_refs_import(args, &mut store)
        }
        Command::Token { command: TokenCommand::Status } => run_token_status(&cli),
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
    }
}

/// File settings, then environment overrides, then command-line flags.
fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_yaml_file(path)?,
        None => SyncConfig::default(),
    };
    config.apply_env()?;
    if let Some(path) = &cli.token_cache {
        config.token_cache_path = Some(path.clone());
    } else if config.token_cache_path.is_none() {
        config.token_cache_path = Some(cli.db.with_extension("token.json"));
    }
    config.validate()?;
    Ok(config)
}

async fn run_sync(cli: &Cli, job: Job) -> Result<()> {
    let config = load_config(cli)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let client = RegistryClient::over_https(&config, Arc::clone(&clock))?;
    let cancel = CancellationToken::new();
    let orchestrator = IngestionOrchestrator::new(config, client, clock, cancel.clone());
    let db = cli.db.clone();

    let mut handle = tokio::task::spawn_blocking(move || -> Result<RunReport> {
        let mut store = SqliteStore::open(&db)?;
        store.migrate()?;
        match job {
            Job::Discover => orchestrator.discover(&mut store),
            Job::Refresh(options) => orchestrator.refresh(&mut store, options),
        }
    });

    let report = tokio::select! {
        joined = &mut handle => joined.context("sync task failed")??,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received; letting in-flight requests finish");
            cancel.cancel();
            handle.await.context("sync task failed")??
        }
    };

    emit_json(serde_json::to_value(&report).context("failed to serialize run report")?)?;
    if let Some(StopReason::Fatal { code, message }) = &report.stop {
        return Err(anyhow!("run stopped: {code}: {message}"));
    }
    Ok(())
}

fn run_refs_import(args: &RefsImportArgs, store: &mut SqliteStore) -> Result<()> {
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let lines: Vec<&str> = raw.lines().map(str::trim).filter(|line| !line.is_empty()).collect();
    let keys: Vec<ExternalRef> = lines.iter().filter_map(|line| ExternalRef::parse(line)).collect();
    let invalid = lines.len() - keys.len();
    if invalid > 0 {
        warn!(invalid, "skipped lines that are not 44-digit invoice keys");
    }

    store.migrate()?;
    let imported = store.import_refs(&keys)?;
    info!(imported, "invoice keys imported");
    emit_json(serde_json::json!({
        "file": args.file,
        "lines": lines.len(),
        "valid": keys.len(),
        "invalid": invalid,
        "imported": imported,
        "already_known": keys.len() - imported
    }))
}

fn run_token_status(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let client = RegistryClient::over_https(&config, Arc::new(SystemClock))?;
    let status = client.auth.status();
    emit_json(serde_json::json!({
        "token_cache": config.token_cache_path,
        "credentials_configured": config.credentials().is_ok(),
        "token": serde_json::to_value(&status).context("failed to serialize token status")?
    }))
}

fn run_db(command: &DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
        DbCommand::Stats => run_db_stats(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_db_stats(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let stats = store.stats()?;
    emit_json(serde_json::to_value(&stats).context("failed to serialize store stats")?)
}
