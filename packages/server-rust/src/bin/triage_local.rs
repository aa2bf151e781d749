//! `triage-local`: runs the dispatch loop in-process on one observable or
//! one collector run, and prints what reached the database.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use triage_core::{DisplayValue, File, Observable, ServiceId};
use triage_server::modules::register_builtins;
use triage_server::observability::run_span;
use triage_server::storage::LocalObjectStore;
use triage_server::{init_logging, Config, LocalRunner, LogFormat, ObjectStore, ServiceRegistry};
use tracing::Instrument;

#[derive(Debug, Parser)]
#[command(name = "triage-local", version, about = "Run triage modules locally")]
struct Cli {
    /// JSON config file.
    #[arg(long, env = "TRIAGE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[arg(long, env = "TRIAGE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    /// Analysis modules to fan out, as `type` or `type:instance`.
    #[arg(
        long = "module",
        env = "TRIAGE_MODULES",
        value_delimiter = ',',
        default_value = "file_extension",
        global = true
    )]
    modules: Vec<String>,

    /// Object store directory for file observables.
    #[arg(long, env = "TRIAGE_OBJECTS", global = true)]
    objects: Option<PathBuf>,

    /// Deliveries before a failing message is dropped.
    #[arg(long, default_value_t = triage_server::runner::DEFAULT_MAX_RECEIVES, global = true)]
    max_receives: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyze one observable.
    Analyze {
        /// Observable type, e.g. `fqdn` or `ipv4`.
        #[arg(long = "type")]
        kind: String,
        value: String,
    },
    /// Upload a file and analyze it.
    File { path: PathBuf },
    /// Run a collector once and analyze what it submits.
    Collect {
        collector: String,
        #[arg(long)]
        instance: Option<String>,
    },
}

fn parse_module(raw: &str) -> ServiceId {
    match raw.split_once(':') {
        Some((kind, instance)) => ServiceId::new(kind, Some(instance.to_string())),
        None => ServiceId::new(raw, None),
    }
}

async fn file_observable(objects: &dyn ObjectStore, path: &Path) -> Result<Observable> {
    let id = objects.upload(path).await?;
    let mut observable = Observable::new::<File>(id)?;
    if let Some(name) = path.file_name() {
        observable.add::<DisplayValue>(name.to_string_lossy().into_owned());
    }
    Ok(observable)
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    let mut registry = ServiceRegistry::new();
    register_builtins(&mut registry)?;

    let modules = cli.modules.iter().map(|m| parse_module(m.trim())).collect();
    let objects = Arc::new(LocalObjectStore::new(
        cli.objects
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("triage-objects")),
    ));
    let store = Arc::clone(&objects);
    let mut runner = LocalRunner::new(config, registry, modules)?
        .with_max_receives(cli.max_receives)
        .map_context(move |ctx| ctx.with_objects(store));

    let span = match &cli.command {
        Command::Analyze { kind, value } => {
            let raw = serde_json::json!({"type": kind, "value": value});
            let observable = runner.context().catalog.decode_observable(raw)?;
            runner.seed(observable).await?;
            run_span("analyze", value)
        }
        Command::File { path } => {
            let observable = file_observable(objects.as_ref(), path)
                .await
                .with_context(|| format!("uploading {}", path.display()))?;
            runner.seed(observable).await?;
            run_span("file", &path.display().to_string())
        }
        Command::Collect {
            collector,
            instance,
        } => {
            runner.collect(collector, instance.as_deref()).await?;
            run_span("collect", collector)
        }
    };

    let report = runner.run_until_idle().instrument(span).await?;
    tracing::info!(
        analyses = report.analyses.len(),
        submissions = report.submissions.len(),
        failures = report.failures,
        dead_lettered = report.dead_lettered,
        "run finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli))
}
