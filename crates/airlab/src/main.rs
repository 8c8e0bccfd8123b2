//! `airlab` - capture one validated AirLab reading from MQTT into SQLite.
//!
//! Exit codes:
//! - 0 reading saved (or discover/history finished)
//! - 2 reading rejected by range validation
//! - 3 no usable data before the deadline
//! - 4 broker failure
//! - 5 storage failure
//! - 6 configuration error
//! - 64 command-line usage error
//! - 130 interrupted
//! - 1 anything else
//!
//! `collect` is the default: its flags work with or without the subcommand
//! name, so `airlab --single --timeout 10` runs one episode.
//!
//! Ctrl+C and SIGTERM end the collection phase early. Once a reading is
//! being written the write runs to completion; a signal that arrives then is
//! logged and the saved reading is still reported.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use airlab_core::collector::{collect_once, open_store};
use airlab_core::config::{Config, LogFormat};
use airlab_core::discover;
use airlab_core::logging::init_logging;
use airlab_core::mqtt::MqttBus;

/// `EX_USAGE` from sysexits.h, clear of the collector's own codes.
const EXIT_USAGE: u8 = 64;

#[derive(Parser, Debug)]
#[command(name = "airlab", version)]
#[command(about = "Collect one validated air-quality reading from an AirLab sensor over MQTT")]
struct Cli {
    /// Path to an airlab.toml configuration file
    #[arg(long, global = true, env = "AIRLAB_CONFIG")]
    config: Option<PathBuf>,

    /// Log level or filter directive (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format: pretty or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(flatten)]
    collect: CollectArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl Cli {
    /// Collect flags in the order they apply: top level, then after `collect`.
    fn collect_args(&self) -> impl Iterator<Item = &CollectArgs> {
        let after_subcommand = match &self.command {
            Some(Commands::Collect(args)) => Some(args),
            _ => None,
        };
        std::iter::once(&self.collect).chain(after_subcommand)
    }

    /// Reject collect flags given alongside `discover` or `history`.
    fn check_usage(&self) -> Result<(), clap::Error> {
        match &self.command {
            Some(Commands::Discover { .. } | Commands::History { .. })
                if self.collect.is_set() =>
            {
                Err(Self::command().error(
                    ErrorKind::ArgumentConflict,
                    "--single, --timeout and --window only apply to collect",
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Broker and database overrides, also read from the environment.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// MQTT broker host
    #[arg(long, global = true, env = "MQTT_HOST")]
    mqtt_host: Option<String>,

    /// MQTT broker port
    #[arg(long, global = true, env = "MQTT_PORT")]
    mqtt_port: Option<u16>,

    /// MQTT username (empty for anonymous)
    #[arg(long, global = true, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password
    #[arg(long, global = true, env = "MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,

    /// Root channel the sensor publishes under
    #[arg(long, global = true, env = "MQTT_BASE_TOPIC")]
    base_topic: Option<String>,

    /// SQLite database file
    #[arg(long, global = true, env = "DB_PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one collection episode and store the result (default)
    Collect(CollectArgs),

    /// Print every message on the sensor's channels until interrupted
    Discover {
        /// Subscription pattern (default: <base_topic>/#)
        #[arg(long)]
        topic: Option<String>,
    },

    /// Show the most recent stored readings
    History {
        /// Number of readings to show
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Default)]
struct CollectArgs {
    /// Single-shot collection (the only mode; accepted for compatibility)
    #[arg(long)]
    single: bool,

    /// Overall deadline in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Collection window after the first accepted message, in seconds
    #[arg(long)]
    window: Option<u64>,
}

impl CollectArgs {
    fn is_set(&self) -> bool {
        self.single || self.timeout.is_some() || self.window.is_some()
    }
}

fn build_config(cli: &Cli) -> airlab_core::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    let o = &cli.overrides;

    if let Some(host) = &o.mqtt_host {
        config.bus.host.clone_from(host);
    }
    if let Some(port) = o.mqtt_port {
        config.bus.port = port;
    }
    if let Some(username) = &o.mqtt_username {
        config.bus.username.clone_from(username);
    }
    if let Some(password) = &o.mqtt_password {
        config.bus.password.clone_from(password);
    }
    if let Some(base_topic) = &o.base_topic {
        config.bus.base_topic.clone_from(base_topic);
    }
    if let Some(db_path) = &o.db_path {
        config.storage.db_path.clone_from(db_path);
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    for args in cli.collect_args() {
        if let Some(timeout) = args.timeout {
            config.collect.timeout_secs = timeout;
        }
        if let Some(window) = args.window {
            config.collect.collect_window_secs = window;
        }
    }

    config.validate()?;
    Ok(config)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, Ctrl+C only");
                ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Listen for shutdown signals for the life of the process.
fn spawn_signal_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown requested");
        let _ = tx.send(true);
    });
    rx
}

/// Resolves once shutdown has been requested.
async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn run_collect(config: &Config, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let report = collect_once(config, shutdown_requested(shutdown.clone())).await?;
    if *shutdown.borrow() {
        warn!(
            record_id = report.record.id,
            "Shutdown requested while writing; the reading was saved first"
        );
    }
    println!(
        "Saved reading #{} at {} UTC: {}",
        report.record.id, report.record.timestamp, report.reading
    );
    Ok(())
}

async fn run_discover(
    config: &Config,
    topic: Option<String>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let pattern = topic.unwrap_or_else(|| config.bus.subscribe_pattern());
    let mut bus = MqttBus::connect(&config.bus).await?;
    let mut stdout = std::io::stdout();
    let shown =
        discover::watch(&mut bus, &pattern, shutdown_requested(shutdown), &mut stdout).await?;
    info!(messages = shown, "Discovery stopped");
    Ok(())
}

fn run_history(config: &Config, limit: usize, json: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let records = store.latest(limit)?;
    let mut stdout = std::io::stdout().lock();

    if json {
        let rendered = serde_json::to_string_pretty(&records).context("render history")?;
        writeln!(stdout, "{rendered}")?;
        return Ok(());
    }

    if records.is_empty() {
        writeln!(
            stdout,
            "No readings stored yet in {}",
            config.storage.db_path.display()
        )?;
        return Ok(());
    }
    for record in &records {
        writeln!(stdout, "{:>6}  {}  {}", record.id, record.timestamp, record.reading)?;
    }
    Ok(())
}

/// Help and version go to stdout with success; anything else is a usage error.
fn report_usage(err: &clap::Error) -> ExitCode {
    let _ = err.print();
    if err.use_stderr() {
        ExitCode::from(EXIT_USAGE)
    } else {
        ExitCode::SUCCESS
    }
}

fn report_failure(err: &anyhow::Error) -> ExitCode {
    let Some(core) = err.downcast_ref::<airlab_core::Error>() else {
        eprintln!("Error: {err:#}");
        return ExitCode::FAILURE;
    };

    if core.is_expected() {
        eprintln!("Rejected: {core}");
    } else {
        eprintln!("Error: {core}");
    }
    if let Some(remediation) = core.remediation() {
        eprint!("\n{}", remediation.render_plain());
    }
    ExitCode::from(core.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse().and_then(|cli| cli.check_usage().map(|()| cli)) {
        Ok(cli) => cli,
        Err(e) => return report_usage(&e),
    };

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => return report_failure(&e.into()),
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("warning: logging disabled: {e}");
    }

    let result = match cli.command {
        None | Some(Commands::Collect(_)) => run_collect(&config, spawn_signal_listener()).await,
        Some(Commands::Discover { topic }) => {
            run_discover(&config, topic, spawn_signal_listener()).await
        }
        Some(Commands::History { limit, json }) => run_history(&config, limit, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report_failure(&e),
    }
}
