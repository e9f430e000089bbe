//! Binary entrypoint for the Volley CLI.
//!
//! Commands:
//! - `start [--serial <path> | --tcp <host:port>]` - run the responder
//! - `init` - write a starter `config.toml`
//! - `lookup <zipcode|prefix>` - resolve a location offline against the database
//! - `probe [--serial <path> | --tcp <host:port>] [--timeout <s>]` - connect once and print device info
//!
//! See the library crate docs for module-level details: `volley::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

use volley::bot::trigger::{is_phone_prefix, is_zipcode};
use volley::bot::MessageDispatcher;
use volley::config::Config;
use volley::geo::{self, DistanceQuery, DistanceResolver, LocationTable};
use volley::meshcore::{MeshCoreConnector, Target};
use volley::transport::supervisor::start_supervisor;
use volley::transport::{Connector, Link};

#[derive(Parser)]
#[command(name = "volley")]
#[command(about = "Compact ping responder for MeshCore mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(clap::Args, Debug, Default)]
struct RadioArgs {
    /// Serial device of the companion radio (e.g. /dev/ttyUSB0)
    #[arg(short, long, conflicts_with = "tcp")]
    serial: Option<String>,

    /// TCP address of a WiFi companion radio (host or host:port)
    #[arg(short, long)]
    tcp: Option<String>,

    /// Serial baud rate
    #[arg(short = 'b', long)]
    baud: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the responder
    Start {
        #[command(flatten)]
        radio: RadioArgs,

        /// Channel index to answer on
        #[arg(long)]
        channel: Option<u8>,

        /// Hop id of the preferred repeater (routes through it are labelled via:)
        #[arg(long)]
        via_repeater: Option<String>,

        /// Public key allowed to query telemetry (repeatable)
        #[arg(long = "telemetry-key")]
        telemetry_keys: Vec<String>,
    },
    /// Write a default configuration file
    Init,
    /// Resolve a postal code or phone prefix against the location database
    Lookup {
        /// Five-digit postal code or phone prefix starting with 0
        query: String,
    },
    /// Connect once, print device info as JSON and exit
    Probe {
        #[command(flatten)]
        radio: RadioArgs,

        /// Seconds to wait before giving up
        #[arg(long, default_value_t = 15)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = match cli.command {
        Commands::Init => None,
        _ => Some(Config::load_or_default(&cli.config).await),
    };
    if let Some(loaded) = &loaded {
        init_logging(loaded.as_ref().ok(), cli.verbose);
        // a broken file is returned below; a missing one just means defaults
        if loaded.is_ok() && !Path::new(&cli.config).exists() {
            warn!("Config file {} not found, using defaults", cli.config);
        }
    }

    match cli.command {
        Commands::Start {
            radio,
            channel,
            via_repeater,
            telemetry_keys,
        } => {
            let mut config = loaded_config(loaded)?;
            apply_radio_args(&mut config, &radio);
            if let Some(channel) = channel {
                config.connection.channel = channel;
            }
            if via_repeater.is_some() {
                config.bot.repeater_key = via_repeater;
            }
            if !telemetry_keys.is_empty() {
                config.bot.telemetry_keys = telemetry_keys;
            }
            config.validate()?;
            run(config).await?;
        }
        Commands::Init => {
            if Path::new(&cli.config).exists() {
                return Err(anyhow!("{} already exists; not overwriting", cli.config));
            }
            Config::create_default(&cli.config).await?;
            println!("Created default configuration: {}", cli.config);
            println!("Edit [connection] to point at your radio, then run: volley start");
        }
        Commands::Lookup { query } => {
            let config = loaded_config(loaded)?;
            let payload = lookup(&config, query.trim())?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Probe { radio, timeout } => {
            let mut config = loaded_config(loaded)?;
            apply_radio_args(&mut config, &radio);
            let target = config.transport_target()?;
            let mut connector = MeshCoreConnector::from_target(&target, config.response_timeout())?;
            info!("Probing {}", connector.describe());
            let status_ok =
                match tokio::time::timeout(Duration::from_secs(timeout), connector.connect()).await {
                    Ok(Ok(mut link)) => {
                        let payload = serde_json::json!({
                            "status": "ok",
                            "target": target.to_string(),
                            "device": link.device_info(),
                        });
                        println!("{}", payload);
                        link.close().await;
                        true
                    }
                    Ok(Err(e)) => {
                        print_probe_failure(&target, &e.to_string(), timeout);
                        false
                    }
                    Err(_) => {
                        print_probe_failure(&target, "timed out", timeout);
                        false
                    }
                };
            std::process::exit(if status_ok { 0 } else { 1 });
        }
    }

    Ok(())
}

/// Wire up supervisor and dispatcher and run until a shutdown signal.
async fn run(config: Config) -> Result<()> {
    info!("Starting Volley v{}", env!("CARGO_PKG_VERSION"));
    let target = config.transport_target()?;
    let table = geo::table::open_or_empty(&config.lookup.database);
    let home = config.home_position();
    match home {
        Some(home) => info!("Home position {}", home),
        None => info!("No home position configured; using the radio's advertised position"),
    }
    let resolver = DistanceResolver::new(home, table);

    let connector = MeshCoreConnector::from_target(&target, config.response_timeout())?;
    info!(
        "Connecting to {} (channel {}, rate limit {}/{}s)",
        target,
        config.connection.channel,
        config.rate_limit.max_requests,
        config.rate_limit.window_secs
    );
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (handle, supervisor) = start_supervisor(connector, config.supervisor_config(), events_tx);

    let mut dispatcher = MessageDispatcher::from_config(&config, resolver);
    dispatcher.run(events_rx, &handle, shutdown_signal()).await;

    info!("Shutting down...");
    handle.shutdown().await;
    if let Err(e) = supervisor.await {
        warn!("Supervisor task ended abnormally: {}", e);
    }
    dispatcher.log_final_stats();
    Ok(())
}

fn loaded_config(loaded: Option<Result<Config>>) -> Result<Config> {
    loaded.unwrap_or_else(|| Ok(Config::default()))
}

fn apply_radio_args(config: &mut Config, radio: &RadioArgs) {
    if let Some(serial) = &radio.serial {
        config.connection.serial = Some(serial.clone());
        config.connection.tcp = None;
    }
    if let Some(tcp) = &radio.tcp {
        config.connection.tcp = Some(tcp.clone());
        config.connection.serial = None;
    }
    if let Some(baud) = radio.baud {
        config.connection.baud_rate = baud;
    }
}

fn print_probe_failure(target: &Target, reason: &str, timeout: u64) {
    error!("Probe of {} failed: {}", target, reason);
    let payload = serde_json::json!({
        "status": "failed",
        "target": target.to_string(),
        "error": reason,
        "timeout_seconds": timeout,
    });
    println!("{}", payload);
}

fn lookup(config: &Config, query: &str) -> Result<serde_json::Value> {
    let table = geo::table::open_or_empty(&config.lookup.database);
    let (kind, code) = if is_zipcode(query) {
        ("zipcode", Some(query.to_string()))
    } else if is_phone_prefix(query) {
        ("prefix", table.phone_prefix(query)?)
    } else {
        return Err(anyhow!(
            "'{}' is neither a five-digit postal code nor a phone prefix",
            query
        ));
    };
    let entry = match &code {
        Some(code) => table.postal_code(code)?,
        None => None,
    };
    let resolver = DistanceResolver::new(config.home_position(), table);
    let result = match kind {
        "zipcode" => resolver.resolve(DistanceQuery::Zipcode(query)),
        _ => resolver.resolve(DistanceQuery::PhonePrefix(query)),
    };
    Ok(serde_json::json!({
        "query": query,
        "kind": kind,
        "zipcode": code,
        "place": entry.as_ref().map(|e| e.place.clone()),
        "position": entry.as_ref().map(|e| e.position),
        "distance_km": result.distance_km.map(geo::round_km),
    }))
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

fn init_logging(config: Option<&Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let logging = config.map(|c| c.logging.clone()).unwrap_or_default();
    let open = |path: &str| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(|f| std::sync::Arc::new(std::sync::Mutex::new(f)))
            .ok()
    };
    let log_file = logging.file.as_deref().and_then(open);
    let security_file = logging.security_file.as_deref().and_then(open);

    if log_file.is_none() && security_file.is_none() {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    } else {
        // With a log file, only echo to the console when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        let echo = is_tty || log_file.is_none();
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());

            if let Some(file) = &log_file {
                if let Ok(mut guard) = file.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
            }
            if record.target() == "security" {
                if let Some(file) = &security_file {
                    if let Ok(mut guard) = file.lock() {
                        let _ = writeln!(guard, "{}", line);
                    }
                }
            }
            if echo {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    }
    let _ = builder.try_init();
}
