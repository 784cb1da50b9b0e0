//! ionos-ddns - Dynamic DNS updater for IONOS domains.

use clap::{Parser, Subcommand};
use ionos_ddns::config::Config;
use ionos_ddns::detector::{AddressResolver, DualStackResolver, IpDetector};
use ionos_ddns::health;
use ionos_ddns::providers::{IonosClient, UpdateClient};
use ionos_ddns::reconciler::{CycleKind, Reconciler, Settings};
use ionos_ddns::record::RecordType;
use ionos_ddns::state::{FileStateStore, StateStore};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use anyhow::Context;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "ionos-ddns")]
#[command(about = "Keeps IONOS DNS records pointed at your public address")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show detected addresses and stored record state
    Status,

    /// Run a single reconciliation cycle
    Update {
        /// Update even if the stored address matches
        #[arg(short, long)]
        force: bool,
    },

    /// Run as daemon (background service)
    Daemon {
        /// Check interval in seconds (overrides config)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Validate configuration and credentials
    Validate,

    /// Print an example configuration file
    ExampleConfig,
}

/// Process exit codes.
///
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DdnsExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<DdnsExitCode> for ExitCode {
    fn from(code: DdnsExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

fn get_config_path(cli_path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_path {
        return path;
    }

    let candidates = [
        dirs::config_dir().map(|p| p.join("ionos-ddns/config.toml")),
        Some(PathBuf::from("/etc/ionos-ddns/config.toml")),
        Some(PathBuf::from("config.toml")),
    ];

    for candidate in candidates.into_iter().flatten() {
        if candidate.exists() {
            return candidate;
        }
    }

    // Nothing on disk: environment variables alone may still be enough.
    Config::default_path().unwrap_or_else(|_| PathBuf::from("config.toml"))
}

/// Map `LOG_LEVEL` onto a filter directive; unknown values mean `info`.
fn log_level_directive(level: Option<&str>) -> &'static str {
    match level.map(|l| l.trim().to_ascii_uppercase()).as_deref() {
        Some("DEBUG") => "debug",
        Some("WARN") => "warn",
        Some("ERROR") => "error",
        _ => "info",
    }
}

/// `RUST_LOG` wins, then `LOG_LEVEL`, then `info`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").ok();
        EnvFilter::new(log_level_directive(level.as_deref()))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::ExampleConfig = cli.command {
        return match toml::to_string_pretty(&Config::example()) {
            Ok(example) => {
                print!("{}", example);
                DdnsExitCode::CleanShutdown.into()
            }
            Err(e) => {
                eprintln!("Failed to render example config: {}", e);
                DdnsExitCode::RuntimeError.into()
            }
        };
    }

    init_tracing();

    let config_path = get_config_path(cli.config);
    let config = match Config::load_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load {}: {}", config_path.display(), e);
            return DdnsExitCode::ConfigError.into();
        }
    };

    let code = match cli.command {
        Commands::Status => cmd_status(config).await,
        Commands::Update { force } => cmd_update(config, force).await,
        Commands::Daemon { interval } => cmd_daemon(config, interval).await,
        Commands::Validate => cmd_validate(config).await,
        Commands::ExampleConfig => DdnsExitCode::CleanShutdown,
    };

    code.into()
}

/// Wire the resolvers, IONOS client and state file into a reconciler.
fn build_reconciler(config: &Config) -> ionos_ddns::Result<Reconciler> {
    let timeout = config.lookup_timeout();
    let resolver = Arc::new(DualStackResolver::new(
        IpDetector::new(config.ip_services.clone(), timeout)?,
        IpDetector::new(config.ipv6_services.clone(), timeout)?,
    ));
    let client = Arc::new(IonosClient::with_base_url(
        config.api_key.clone(),
        config.api_url.clone(),
        config.request_timeout(),
    )?);
    let store = Arc::new(FileStateStore::new(&config.state_path));

    let mut reconciler = Reconciler::new(
        config.records.clone(),
        resolver,
        client,
        store,
        Settings::from(config),
    );

    for record in config.records.iter().filter(|r| r.ip_services.is_some()) {
        let detector = IpDetector::new(config.services_for(record), timeout)?;
        reconciler = reconciler.with_resolver_override(record.key(), Arc::new(detector));
    }

    Ok(reconciler)
}

/// Build and load a reconciler, reporting failures as startup errors.
async fn start(config: &Config) -> Result<Reconciler, DdnsExitCode> {
    if let Err(e) = config.validate() {
        error!("{}", e);
        return Err(DdnsExitCode::ConfigError);
    }

    let mut reconciler = build_reconciler(config).map_err(|e| {
        error!("Startup failed: {}", e);
        DdnsExitCode::ConfigError
    })?;

    reconciler.load_state().await.map_err(|e| {
        error!("Failed to load state from {}: {}", config.state_path.display(), e);
        DdnsExitCode::ConfigError
    })?;

    Ok(reconciler)
}

async fn cmd_status(config: Config) -> DdnsExitCode {
    println!("ionos-ddns Status");
    println!("=================\n");

    for family in [RecordType::A, RecordType::Aaaa] {
        if !config.records.iter().any(|r| r.record_type == family) {
            continue;
        }

        let services = match family {
            RecordType::A => config.ip_services.clone(),
            RecordType::Aaaa => config.ipv6_services.clone(),
        };
        let detector = match IpDetector::new(services, config.lookup_timeout()) {
            Ok(detector) => detector,
            Err(e) => {
                println!("Failed to create detector: {}", e);
                return DdnsExitCode::RuntimeError;
            }
        };

        match detector.resolve(family).await {
            Ok(address) => println!(
                "Current {} address: {} (via {})",
                family, address.value, address.source
            ),
            Err(e) => println!("Failed to detect {} address: {}", family, e),
        }
    }

    println!("\nRecords ({}):", config.state_path.display());
    println!("-------");

    let store = FileStateStore::new(&config.state_path);
    let persisted = match store.load().await {
        Ok(persisted) => persisted,
        Err(e) => {
            println!("Failed to read state: {}", e);
            return DdnsExitCode::RuntimeError;
        }
    };

    for record in &config.records {
        print!("  {}: ", record);
        match persisted.get(&record.key()) {
            Some(state) => match (state.last_applied, state.last_applied_at) {
                (Some(ip), Some(at)) => println!(
                    "{} (applied {}, {} consecutive failure(s))",
                    ip,
                    at.format("%Y-%m-%d %H:%M:%S UTC"),
                    state.consecutive_failures
                ),
                _ => println!(
                    "never applied ({} consecutive failure(s))",
                    state.consecutive_failures
                ),
            },
            None => println!("(no state)"),
        }
    }

    DdnsExitCode::CleanShutdown
}

async fn cmd_update(config: Config, force: bool) -> DdnsExitCode {
    let mut reconciler = match start(&config).await {
        Ok(reconciler) => reconciler,
        Err(code) => return code,
    };

    if force {
        reconciler.force_next_cycle();
    }

    let report = reconciler.run_cycle(CycleKind::Full).await;

    if report.skipped {
        println!("Could not resolve the public address, nothing updated.");
        return DdnsExitCode::RuntimeError;
    }

    for (state, status) in reconciler.states() {
        let address = state
            .last_applied
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("  {} -> {}: {}", state.record, address, status);
    }

    println!(
        "\n{} updated, {} unchanged, {} failed",
        report.succeeded, report.unchanged, report.failed
    );

    if report.failed > 0 {
        DdnsExitCode::RuntimeError
    } else {
        DdnsExitCode::CleanShutdown
    }
}

async fn cmd_daemon(mut config: Config, interval: Option<u64>) -> DdnsExitCode {
    if let Some(secs) = interval {
        config.check_interval_secs = secs;
    }

    let mut reconciler = match start(&config).await {
        Ok(reconciler) => reconciler,
        Err(code) => return code,
    };

    let signals = match shutdown_signal() {
        Ok(signals) => signals,
        Err(e) => {
            error!("{:#}", e);
            return DdnsExitCode::ConfigError;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health = match config.health_port {
        Some(port) => match health::bind(port).await {
            Ok(listener) => Some(tokio::spawn(health::serve(
                listener,
                reconciler.status_board(),
                shutdown_rx.clone(),
            ))),
            Err(e) => {
                error!("Failed to bind health endpoint on port {}: {}", port, e);
                return DdnsExitCode::ConfigError;
            }
        },
        None => None,
    };

    tokio::spawn(async move {
        let name = signals.await;
        info!("Received {}, finishing in-flight updates", name);
        let _ = shutdown_tx.send(true);
    });

    info!("Starting ionos-ddns daemon");
    let mut code = match reconciler.run(shutdown_rx).await {
        Ok(()) => DdnsExitCode::CleanShutdown,
        Err(e) => {
            error!("Daemon error: {}", e);
            DdnsExitCode::RuntimeError
        }
    };

    if let Some(handle) = health {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Health endpoint error: {}", e);
                code = DdnsExitCode::RuntimeError;
            }
            Err(e) => {
                error!("Health endpoint task failed: {}", e);
                code = DdnsExitCode::RuntimeError;
            }
        }
    }

    info!("Daemon stopped");
    code
}

async fn cmd_validate(config: Config) -> DdnsExitCode {
    println!("Validating configuration...\n");

    if let Err(e) = config.validate() {
        println!("  FAILED - {}", e);
        return DdnsExitCode::ConfigError;
    }

    let client = match IonosClient::with_base_url(
        config.api_key.clone(),
        config.api_url.clone(),
        config.request_timeout(),
    ) {
        Ok(client) => client,
        Err(e) => {
            println!("  FAILED - {}", e);
            return DdnsExitCode::ConfigError;
        }
    };

    let mut all_valid = true;

    for record in &config.records {
        print!("  {} ({}): ", record, client.name());

        match client.validate(record).await {
            Ok(()) => println!("OK"),
            Err(e) => {
                println!("FAILED - {}", e);
                all_valid = false;
            }
        }
    }

    println!();

    if all_valid {
        println!("All records validated successfully.");
        DdnsExitCode::CleanShutdown
    } else {
        println!("Some records failed validation.");
        DdnsExitCode::ConfigError
    }
}

/// Resolves with the name of the first termination signal received.
///
/// Handlers are installed eagerly so setup failures surface at startup.
#[cfg(unix)]
fn shutdown_signal() -> anyhow::Result<impl Future<Output = &'static str>> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> anyhow::Result<impl Future<Output = &'static str>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to wait for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        "Ctrl-C"
    })
}
