use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use cloudinv::config::{RunConfig, Settings};
use cloudinv::output;
use cloudinv::remote::dispatch::{OperationRegistry, Paginator, RegistryConnector};
use cloudinv::remote::http::{register_gateway_operations, HttpGateway};
use cloudinv::resource::{Catalogue, Runner};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Inventory a cloud account from declarative resource definitions
#[derive(Parser, Debug)]
#[command(name = "cloudinv", version, about, long_about = None)]
struct Args {
    /// Resource ids to inventory (default: whole catalogue)
    #[arg(short, long = "resource", value_delimiter = ',')]
    resources: Vec<String>,

    /// Regions to inventory (default: from config.json)
    #[arg(short = 'g', long = "region", value_delimiter = ',')]
    regions: Vec<String>,

    /// Directory of resource definition YAML files
    #[arg(long)]
    catalogue_dir: Option<PathBuf>,

    /// Gateway endpoint template, e.g. https://{service}.{region}.example.com/
    #[arg(long)]
    endpoint: Option<String>,

    /// Units in flight at once
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Detail calls in flight per unit
    #[arg(long)]
    detail_concurrency: Option<usize>,

    /// Give up on unfinished units after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Attach run metadata to the report
    #[arg(long)]
    with_meta: bool,

    /// Add derived fields to items
    #[arg(long)]
    with_extra: bool,

    /// Keep empty leaves for units that found nothing
    #[arg(long)]
    with_empty: bool,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pretty-print the report
    #[arg(long)]
    pretty: bool,

    /// List catalogue resources and exit
    #[arg(long)]
    list_resources: bool,

    /// Store the effective regions, endpoint and limits as defaults
    #[arg(long)]
    save_settings: bool,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off")]
    log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(tracing_level) = level.to_tracing_level() else {
        return Ok(None);
    };

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_max_level(tracing_level)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("cloudinv {} started with log level: {:?}", cloudinv::VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Ok(Some(guard))
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("cloudinv").join("cloudinv.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".cloudinv").join("cloudinv.log");
    }
    PathBuf::from("cloudinv.log")
}

/// CLI > config > built-in defaults
fn merge_settings(args: &Args, mut settings: Settings) -> Settings {
    if !args.regions.is_empty() {
        settings.regions = args.regions.clone();
    }
    if let Some(ref endpoint) = args.endpoint {
        settings.endpoint = Some(endpoint.clone());
    }
    if let Some(concurrency) = args.concurrency {
        settings.concurrency = concurrency;
    }
    if let Some(detail_concurrency) = args.detail_concurrency {
        settings.detail_concurrency = detail_concurrency;
    }
    if let Some(ref dir) = args.catalogue_dir {
        settings.catalogue_dir = Some(dir.clone());
    }
    settings
}

fn load_catalogue(settings: &Settings) -> Result<Catalogue> {
    match settings.catalogue_dir {
        Some(ref dir) => Catalogue::from_dir(dir)
            .with_context(|| format!("Failed to load catalogue from {}", dir.display())),
        None => Catalogue::builtin().context("Failed to load built-in catalogue"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level)?;

    let settings = merge_settings(&args, Settings::load());
    let catalogue = load_catalogue(&settings)?;

    if args.list_resources {
        for resource in catalogue.resources() {
            println!(
                "{:<20} {:<12} {:<8} {}",
                resource.id,
                resource.category,
                resource.region_scope.as_str(),
                resource
                    .nodes
                    .iter()
                    .map(|n| n.list_operation.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        return Ok(());
    }

    if args.save_settings {
        let path = settings.save()?;
        eprintln!("Settings saved to {}", path.display());
    }

    let Some(ref endpoint) = settings.endpoint else {
        return Err(anyhow::anyhow!(
            "No endpoint configured. Set \"endpoint\" in config.json or use --endpoint"
        ));
    };

    let token = std::env::var("CLOUDINV_TOKEN").ok();
    let request_timeout = settings.request_timeout_secs.map(Duration::from_secs);
    let gateway = Arc::new(HttpGateway::new(endpoint, token, request_timeout)?);

    let mut registry = OperationRegistry::new();
    register_gateway_operations(&mut registry, gateway, &catalogue, &Paginator::default());

    let config = RunConfig {
        resources: args.resources.clone(),
        with_meta: args.with_meta,
        with_extra: args.with_extra,
        with_empty: args.with_empty,
        deadline: args.timeout.map(Duration::from_secs),
        ..RunConfig::from_settings(&settings)
    };

    let runner = Runner::new(config.clone(), Arc::new(RegistryConnector::new(registry)));

    let mut progress = runner.subscribe();
    let watcher = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let snapshot = *progress.borrow();
            tracing::info!(
                "progress: {}/{} ({:.1}%), {} failed",
                snapshot.completed,
                snapshot.total,
                snapshot.percent(),
                snapshot.failed
            );
        }
    });

    let outcome = runner.run(&catalogue).await?;
    watcher.abort();

    let report = output::build_report(&outcome, &config)?;
    output::write_report(&report, args.output.as_deref(), args.pretty)?;

    eprintln!(
        "Inventoried {} units in {:.1}s: {} leaves, {} items, {} failed{}",
        outcome.progress.total,
        outcome.elapsed().as_secs_f64(),
        outcome.tree.leaf_count(),
        outcome.tree.item_count(),
        outcome.progress.failed,
        if outcome.timed_out {
            format!(", {} abandoned at deadline", outcome.cancelled)
        } else {
            String::new()
        }
    );
    for failure in &outcome.failures {
        eprintln!(
            "  {:<12} {}/{}/{}@{}",
            failure.cause.short_label(),
            failure.category,
            failure.resource,
            failure.node,
            failure.region
        );
    }

    Ok(())
}
