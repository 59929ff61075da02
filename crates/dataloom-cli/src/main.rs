mod config;
mod input;
mod registry;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;
use uuid::Uuid;

use config::{ConfigError, Overrides, Settings};
use dataloom_core::{Error as CoreError, Strictness, load_catalog};
use dataloom_introspect::DbError;
use dataloom_load::{
    LoadEngine, LoadError, MemoryDestination, PostgresDestination, ResetMode, RunOutcome,
    SyncStatus,
};
use input::{InputError, read_batches};
use registry::{RunContext, init_logging, start_run, write_json};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("registry error: {0}")]
    Registry(#[from] registry::RegistryError),
    #[error("input error: {0}")]
    Input(#[from] InputError),
    #[error("catalog error: {0}")]
    Core(#[from] CoreError),
    #[error("{0}")]
    Load(#[from] LoadError),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported engine: {0}")]
    UnsupportedEngine(String),
}

#[derive(Parser, Debug)]
#[command(name = "dataloom", version, about = "Load tabular batches into a PostgreSQL schema")]
struct Cli {
    /// Configuration file (defaults to ./dataloom.toml when present).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reset the destination and load a directory of CSV files.
    Run(RunArgs),
    /// Print the load order for a catalog.
    Plan(CatalogArgs),
    /// Align identity generators with the loaded keys.
    SyncSequences(ConnectArgs),
    /// Print the effective configuration.
    Config(ConnectArgs),
}

#[derive(Args, Debug, Default)]
struct CatalogArgs {
    /// Catalog JSON file.
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
struct ConnectArgs {
    #[command(flatten)]
    catalog: CatalogArgs,
    /// PostgreSQL connection string.
    #[arg(long, value_name = "DSN")]
    dsn: Option<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ResetArg {
    Rebuild,
    Truncate,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrictnessArg {
    Strict,
    Lenient,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    connect: ConnectArgs,
    /// Directory of `<table>.csv` files.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Output directory for runs.
    #[arg(long)]
    run_dir: Option<PathBuf>,
    #[arg(long, value_enum)]
    reset: Option<ResetArg>,
    #[arg(long, value_enum)]
    strictness: Option<StrictnessArg>,
    /// Maximum rows per insert statement.
    #[arg(long)]
    chunk_size: Option<usize>,
    /// Prepare the schema without loading rows.
    #[arg(long)]
    ddl_only: bool,
    /// Run the whole pipeline against an in-memory destination.
    #[arg(long)]
    dry_run: bool,
    /// Keep existing data and skip batches already in the ledger.
    #[arg(long)]
    resume: bool,
    /// Run ANALYZE on loaded tables.
    #[arg(long)]
    analyze: bool,
    /// Extra SQL script to run after the post-load phase (repeatable).
    #[arg(long, value_name = "PATH")]
    post_sql: Vec<PathBuf>,
    #[arg(long)]
    log_level: Option<String>,
}

impl From<ResetArg> for ResetMode {
    fn from(value: ResetArg) -> Self {
        match value {
            ResetArg::Rebuild => ResetMode::Rebuild,
            ResetArg::Truncate => ResetMode::Truncate,
        }
    }
}

impl From<StrictnessArg> for Strictness {
    fn from(value: StrictnessArg) -> Self {
        match value {
            StrictnessArg::Strict => Strictness::Strict,
            StrictnessArg::Lenient => Strictness::Lenient,
        }
    }
}

impl ConnectArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            dsn: self.dsn.clone(),
            catalog: self.catalog.catalog.clone(),
            ..Overrides::default()
        }
    }
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            data_dir: self.data_dir.clone(),
            run_dir: self.run_dir.clone(),
            reset: self.reset.map(ResetMode::from),
            strictness: self.strictness.map(Strictness::from),
            chunk_size: self.chunk_size,
            ddl_only: self.ddl_only,
            dry_run: self.dry_run,
            resume: self.resume,
            analyze: self.analyze,
            post_sql: self.post_sql.clone(),
            log_level: self.log_level.clone(),
            ..self.connect.overrides()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(event = "command_failed", error = %err);
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode, CliError> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    settings.apply_env(std::env::vars())?;

    match cli.command {
        Command::Run(args) => {
            settings.apply_overrides(args.overrides());
            run_load(settings).await
        }
        Command::Plan(args) => {
            settings.apply_overrides(Overrides {
                catalog: args.catalog,
                ..Overrides::default()
            });
            init_logging(&settings.log_level, None)?;
            print_plan(&settings)
        }
        Command::SyncSequences(args) => {
            settings.apply_overrides(args.overrides());
            init_logging(&settings.log_level, None)?;
            sync_sequences(&settings).await
        }
        Command::Config(args) => {
            settings.apply_overrides(args.overrides());
            println!("{}", serde_json::to_string_pretty(&settings.redacted())?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn detect_engine(dsn: &str) -> Result<&'static str, CliError> {
    if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
        Ok("postgres")
    } else {
        Err(CliError::UnsupportedEngine(redact(dsn)))
    }
}

fn redact(dsn: &str) -> String {
    dataloom_core::redact_dsn(dsn).redacted
}

async fn connect(settings: &Settings) -> Result<PostgresDestination, CliError> {
    let dsn = settings.require_dsn()?;
    detect_engine(dsn)?;
    Ok(PostgresDestination::connect(dsn).await?)
}

async fn run_load(settings: Settings) -> Result<ExitCode, CliError> {
    let engine_name = if settings.dry_run {
        "memory"
    } else {
        detect_engine(settings.require_dsn()?)?
    };

    let ctx = RunContext {
        run_id: Uuid::new_v4().to_string(),
        started_at: chrono::Utc::now(),
        command: "run".to_string(),
        engine: engine_name.to_string(),
        settings: settings.redacted(),
    };
    let paths = start_run(&ctx)?;
    init_logging(&settings.log_level, Some(&paths.logs_path))?;
    tracing::info!(
        event = "run_started",
        run_id = %ctx.run_id,
        engine = engine_name,
        run_dir = %paths.root.display()
    );

    let catalog = load_catalog(settings.require_catalog()?)?;
    let engine = LoadEngine::new(settings.load_options());
    let plan = engine.plan(&catalog)?;
    write_json(&paths.plan_path, &plan)?;

    let batches = match &settings.data_dir {
        Some(dir) => read_batches(dir)?,
        None if settings.ddl_only => Vec::new(),
        None => return Err(ConfigError::Missing("data_dir").into()),
    };

    let report = if settings.dry_run {
        let destination = MemoryDestination::new();
        engine.run(&destination, &catalog, batches).await?
    } else {
        let destination = connect(&settings).await?;
        engine.run(&destination, &catalog, batches).await?
    };
    write_json(&paths.report_path, &report)?;

    for result in report.tables.values() {
        println!(
            "{:<40} {:<14} attempted={:<8} inserted={:<8} rejected={}",
            result.table.to_string(),
            format!("{:?}", result.status),
            result.rows_attempted,
            result.rows_inserted,
            result.rows_rejected
        );
    }
    if let Some(failure) = &report.failure {
        eprintln!("failure: {failure}");
    }
    println!(
        "outcome: {:?}  report: {}",
        report.outcome,
        paths.report_path.display()
    );

    tracing::info!(
        event = "run_finished",
        outcome = ?report.outcome,
        duration_ms = report.duration_ms
    );

    Ok(match report.outcome {
        RunOutcome::Succeeded | RunOutcome::Partial => ExitCode::SUCCESS,
        RunOutcome::Failed => ExitCode::FAILURE,
    })
}

fn print_plan(settings: &Settings) -> Result<ExitCode, CliError> {
    let catalog = load_catalog(settings.require_catalog()?)?;
    let engine = LoadEngine::new(settings.load_options());
    match engine.plan(&catalog) {
        Ok(plan) => {
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(LoadError::Planning(report)) => {
            eprintln!("required foreign keys form a cycle:");
            for edge in &report.edges {
                eprintln!("  {edge}");
            }
            Ok(ExitCode::from(2))
        }
        Err(err) => Err(err.into()),
    }
}

async fn sync_sequences(settings: &Settings) -> Result<ExitCode, CliError> {
    let catalog = load_catalog(settings.require_catalog()?)?;
    let destination = connect(settings).await?;
    let engine = LoadEngine::new(settings.load_options());
    let results = engine.synchronize(&destination, &catalog).await?;
    println!("{}", serde_json::to_string_pretty(&results)?);

    let failed = results
        .iter()
        .any(|result| result.status == SyncStatus::Failed);
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
