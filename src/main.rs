use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use extaudit::{
    cache::{CacheOptions, CacheStore},
    client::HttpClientFactory,
    config::{Config, ScanSettings},
    coordinator::{RunStatus, ScanCoordinator, ScanRun},
    model::{Extension, RiskLevel, Source},
    output::{format_json, print_json, summary_line, RunReport},
    scanner::{get_scanner, to_tasks, Scanner},
};
use futures::future::join_all;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Exit codes for CI integration
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const PARTIAL_FAILURE: u8 = 2;
    pub const RISK_THRESHOLD: u8 = 3;
    pub const CANCELLED: u8 = 130;
}

#[derive(Parser)]
#[command(name = "extaudit")]
#[command(
    author,
    version,
    about = "Audit installed editor extensions against a remote scan service"
)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan installed extensions
    Scan {
        /// Only scan this editor (vscode, vscode-insiders, vscodium, cursor)
        #[arg(short, long)]
        source: Option<Source>,

        /// Number of concurrent workers (1-5)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Ignore the on-disk cache for this run
        #[arg(long)]
        no_cache: bool,

        /// Write the JSON report to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Exit with code 3 if any extension is at or above this risk
        #[arg(long, value_enum)]
        fail_on: Option<FailLevel>,
    },

    /// List available sources
    ListSources,

    /// Show or create config file
    Config {
        /// Generate default config file
        #[arg(long)]
        init: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Inspect or maintain the result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry counts and size
    Stats,
    /// Remove results for extensions that are no longer installed
    Prune,
    /// Remove every cached result
    Clear,
}

#[derive(Clone, Copy, ValueEnum)]
enum FailLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl From<FailLevel> for RiskLevel {
    fn from(level: FailLevel) -> Self {
        match level {
            FailLevel::Critical => RiskLevel::Critical,
            FailLevel::High => RiskLevel::High,
            FailLevel::Medium => RiskLevel::Medium,
            FailLevel::Low => RiskLevel::Low,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_codes::ERROR)
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "extaudit=debug" } else { "extaudit=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

async fn run(cli: Cli) -> Result<u8> {
    let config = Config::load()?;

    match cli.command {
        Commands::Scan {
            source,
            workers,
            no_cache,
            output,
            fail_on,
        } => run_scan(config, source, workers, no_cache, output, fail_on).await,
        Commands::ListSources => {
            list_sources();
            Ok(exit_codes::SUCCESS)
        }
        Commands::Config { init, path } => {
            handle_config(init, path)?;
            Ok(exit_codes::SUCCESS)
        }
        Commands::Cache { action } => {
            handle_cache(&config, action).await?;
            Ok(exit_codes::SUCCESS)
        }
    }
}

async fn run_scan(
    mut config: Config,
    source: Option<Source>,
    workers: Option<usize>,
    no_cache: bool,
    output_file: Option<PathBuf>,
    fail_on: Option<FailLevel>,
) -> Result<u8> {
    if let Some(workers) = workers {
        config.worker_count = workers;
    }
    let settings = config.settings().context("Invalid configuration")?;

    let sources = match source {
        Some(source) => vec![source],
        None => config.default_sources.clone(),
    };
    let extensions: Vec<Extension> = discover(&sources)
        .await
        .into_iter()
        .filter(|ext| !config.ignore.should_ignore(&ext.id))
        .collect();
    let tasks = to_tasks(&extensions);
    debug!(extensions = extensions.len(), tasks = tasks.len(), "discovery finished");

    let store = if no_cache {
        CacheStore::open_in_memory(cache_options(&settings))?
    } else {
        open_cache(&settings)?
    };
    let factory = HttpClientFactory::new(
        settings.service_url.clone(),
        settings.api_key.clone(),
        settings.request_timeout,
    )?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, finishing in-flight scans...");
            on_signal.cancel();
        }
    });

    let mut coordinator = ScanCoordinator::new(settings, store, Arc::new(factory));
    let run = coordinator.run(tasks, cancel).await;
    if let Err(e) = coordinator.into_store().close() {
        warn!(error = %e, "failed to close cache cleanly");
    }

    for warning in &run.warnings {
        eprintln!("Warning: {}", warning);
    }

    let report = RunReport::new(&run);
    if let Some(path) = output_file {
        std::fs::write(&path, format_json(&report)?)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        eprintln!("Results written to: {}", path.display());
    } else {
        print_json(&report)?;
    }
    eprintln!("{}", summary_line(&run));

    Ok(determine_exit_code(&run, fail_on))
}

/// Runs every requested scanner concurrently. A scanner that fails is
/// reported and skipped.
async fn discover(sources: &[Source]) -> Vec<Extension> {
    let scanners: Vec<Box<dyn Scanner>> = sources.iter().map(|&s| get_scanner(s)).collect();

    let futures = scanners.iter().map(|scanner| async move {
        if !scanner.is_supported() {
            return Vec::new();
        }
        match scanner.scan().await {
            Ok(found) => found,
            Err(e) => {
                warn!(scanner = scanner.name(), error = %e, "discovery failed");
                Vec::new()
            }
        }
    });

    join_all(futures).await.into_iter().flatten().collect()
}

fn cache_options(settings: &ScanSettings) -> CacheOptions {
    CacheOptions {
        signer: None,
        vacuum_size_threshold: settings.vacuum_size_threshold,
        vacuum_row_threshold: settings.vacuum_row_threshold,
    }
}

fn open_cache(settings: &ScanSettings) -> Result<CacheStore> {
    let opened = CacheStore::open(&settings.cache_path, cache_options(settings))
        .with_context(|| format!("Failed to open cache at {}", settings.cache_path.display()))?;
    for warning in &opened.warnings {
        eprintln!("Warning: {}", warning);
    }
    Ok(opened.store)
}

/// Determine the exit code from the run outcome and --fail-on setting.
///
/// Cancellation wins over everything else, then the risk threshold, then
/// partial failure.
fn determine_exit_code(run: &ScanRun, fail_on: Option<FailLevel>) -> u8 {
    if run.status() == RunStatus::Cancelled {
        return exit_codes::CANCELLED;
    }

    if let (Some(level), Some(max)) = (fail_on, run.max_risk()) {
        if max >= RiskLevel::from(level) {
            return exit_codes::RISK_THRESHOLD;
        }
    }

    match run.status() {
        RunStatus::PartialFailure => exit_codes::PARTIAL_FAILURE,
        _ => exit_codes::SUCCESS,
    }
}

fn list_sources() {
    println!("Available sources:");
    println!();

    for source in Source::ALL {
        let scanner = get_scanner(source);
        let supported = if scanner.is_supported() { "yes" } else { "no" };

        println!(
            "  {:<16} {:<28} [supported: {}]",
            source.as_str(),
            scanner.name(),
            supported
        );
        println!(
            "  {:<16} Location: ~/{}/extensions/",
            "",
            source.home_dir_name()
        );
        println!();
    }
}

fn handle_config(init: bool, show_path: bool) -> Result<()> {
    let config_path = Config::config_path();

    if show_path {
        println!("{}", config_path.display());
        return Ok(());
    }

    if init {
        if config_path.exists() {
            println!("Config file already exists at: {}", config_path.display());
            return Ok(());
        }

        let config = Config::default();
        config.save()?;
        println!("Created config file at: {}", config_path.display());
        println!();
        println!("Default configuration:");
        println!("{}", Config::generate_default_config());
        return Ok(());
    }

    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)?;
        println!("Config file: {}", config_path.display());
        println!();
        println!("{}", content);
    } else {
        println!("No config file found.");
        println!("Run 'extaudit config --init' to create one.");
        println!();
        println!("Config path: {}", config_path.display());
    }

    Ok(())
}

async fn handle_cache(config: &Config, action: CacheAction) -> Result<()> {
    let settings = config.settings().context("Invalid configuration")?;
    let mut store = open_cache(&settings)?;

    match action {
        CacheAction::Stats => {
            let stats = store.stats(settings.cache_max_age)?;
            println!("Cache: {}", settings.cache_path.display());
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        CacheAction::Prune => {
            let installed = discover(&Source::ALL).await;
            if installed.is_empty() {
                println!("No installed extensions found; nothing pruned.");
                store.close()?;
                return Ok(());
            }
            let report = store.cleanup(installed.iter().map(|ext| ext.id.as_str()))?;
            println!(
                "Removed {} cached results{}.",
                report.removed,
                if report.vacuumed { " and compacted the cache" } else { "" }
            );
        }
        CacheAction::Clear => {
            let removed = store.clear()?;
            println!("Cache cleared ({} results removed).", removed);
        }
    }

    store.close()?;
    Ok(())
}
