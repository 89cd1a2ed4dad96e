//! Binary entrypoint for the smsbridge CLI.
//!
//! Commands:
//! - `start [--port <path>]` - run the gateway, optionally pinning the serial port
//! - `init` - write a starter `config.toml`
//! - `status` - print stored message and task statistics
//! - `ports` - list serial ports and check each for a modem
//!
//! See the library crate docs for module-level details: `smsbridge::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use smsbridge::api::{self, AppState};
use smsbridge::config::Config;
use smsbridge::modem::{ModemService, ModemSettings};
use smsbridge::notify::NotifyDispatcher;
use smsbridge::scheduler::{run_send_sweeper, TaskScheduler};
use smsbridge::storage::Storage;

#[derive(Parser)]
#[command(name = "smsbridge")]
#[command(about = "Gateway between a UART cellular modem, an HTTP API and notification webhooks")]
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

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Start {
        /// Modem serial port (e.g., /dev/ttyUSB0); overrides the config
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Show stored message and task statistics
    Status,
    /// List serial ports and check each for a modem
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { port } => {
            let mut config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting smsbridge v{}", env!("CARGO_PKG_VERSION"));
            if let Some(port) = port {
                config.serial.port = port;
            }
            run_gateway(config).await?;
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                warn!("{} already exists; not overwriting", cli.config);
                return Ok(());
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
            info!("Set http.api_token before starting to enable the HTTP API");
        }
        Commands::Status => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            let storage = Storage::new(&config.storage.data_dir).await?;
            let stats = storage.message_stats().await?;
            let tasks = storage.list_tasks().await?;
            println!("smsbridge v{}", env!("CARGO_PKG_VERSION"));
            println!("Data directory: {}", storage.base_dir().display());
            println!(
                "Messages: {} total ({} incoming, {} outgoing, {} today)",
                stats.total, stats.incoming, stats.outgoing, stats.today
            );
            println!(
                "Scheduled tasks: {} ({} enabled)",
                tasks.len(),
                tasks.iter().filter(|t| t.enabled).count()
            );
            println!(
                "Serial port: {}",
                if config.serial.port.is_empty() { "auto-detect" } else { config.serial.port.as_str() }
            );
        }
        Commands::Ports => {
            let config = Config::load(&cli.config).await.unwrap_or_default();
            init_logging(&None, cli.verbose);
            list_ports(&config).await?;
        }
    }

    Ok(())
}

async fn run_gateway(config: Config) -> Result<()> {
    let storage = Arc::new(
        Storage::new(&config.storage.data_dir)
            .await?
            .with_max_message_bytes(config.storage.max_message_size),
    );
    let notifier = Arc::new(NotifyDispatcher::from_config(&config.notify));
    info!("{} notification channel(s) enabled", notifier.enabled_count());

    let modem = Arc::new(ModemService::new(
        ModemSettings::from_config(&config),
        storage.clone(),
        notifier.clone(),
    ));

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    #[cfg(feature = "serial")]
    {
        let connector = smsbridge::modem::SerialConnector::new(
            config.serial.handshake_timeout(),
            config.serial.handshake_settle(),
        );
        tasks.spawn(modem.supervisor(connector).run(shutdown.clone()));
    }
    #[cfg(not(feature = "serial"))]
    warn!("Built without the 'serial' feature; running without a modem");

    tasks.spawn(run_send_sweeper(
        storage.clone(),
        config.serial.send_confirm_timeout(),
        shutdown.clone(),
    ));

    if config.scheduler.enabled {
        let scheduler = TaskScheduler::new(storage.clone(), modem.sender(), config.scheduler.check_hour);
        tasks.spawn(scheduler.run(shutdown.clone()));
    }

    if !config.http.enabled {
        info!("HTTP API disabled");
    } else if config.http.api_token.is_empty() {
        warn!("http.api_token is empty; HTTP API not started");
    } else {
        let state = AppState {
            api_token: config.http.api_token.clone(),
            modem: modem.clone(),
            storage: storage.clone(),
            notifier: notifier.clone(),
            tasks: Arc::new(TaskScheduler::new(
                storage.clone(),
                modem.sender(),
                config.scheduler.check_hour,
            )),
        };
        let bind = config.http.bind.clone();
        let token = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = api::serve(&bind, state, token.clone()).await {
                error!("{:#}", e);
                token.cancel();
            }
        });
    }

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown requested"),
        _ = shutdown.cancelled() => warn!("A service stopped; shutting down"),
    }
    shutdown.cancel();
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!("Background task ended abnormally: {}", e);
        }
    }
    info!("smsbridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(feature = "serial")]
async fn list_ports(config: &Config) -> Result<()> {
    use smsbridge::modem::{Connector, SerialConnector};

    let connector = SerialConnector::new(config.serial.handshake_timeout(), config.serial.handshake_settle());
    let ports = connector.list_ports().await?;
    for port in &ports {
        let answered = connector.handshake(port).await;
        println!(
            "{}\t{}",
            port,
            if answered { "modem detected" } else { "no response" }
        );
    }
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn list_ports(_config: &Config) -> Result<()> {
    anyhow::bail!("port listing requires the 'serial' feature")
}

fn level_from_config(level: &str) -> log::LevelFilter {
    level.parse().unwrap_or(log::LevelFilter::Info)
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .map(|c| level_from_config(&c.logging.level))
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let file = std::sync::Mutex::new(f);
        // Echo to the console only when someone is watching
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = file.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
