// Rollcall Linux: attendance collector daemon over TCP link emulation, plus attendee client.

mod attendee;
mod config;
mod coordinator;
mod sink;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rollcall_core::admission::MovingAverageRate;
use rollcall_core::{AttendanceEngine, StudentRecord};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::sink::{JsonlSink, LogSink, RecordSink};

/// Served peers averaged for the advertised processing rate.
const THROUGHPUT_WINDOW: usize = 20;

#[derive(Parser)]
#[command(name = "rollcall-linux", version, about = "Rollcall attendance collector")]
struct Cli {
    /// Config file (default: ~/.config/rollcall/config.toml, then /etc/rollcall/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Accept attendee links and record attendance.
    Collect {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        max_connections: Option<usize>,
        /// JSON-lines output file.
        #[arg(long)]
        records: Option<PathBuf>,
    },
    /// Send one attendance record to a collector.
    Attend {
        /// Collector address, host:port.
        #[arg(long)]
        collector: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        roll: String,
        /// Stable device address presented on every link (default derived from the roll number).
        #[arg(long)]
        device: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut cfg = config::load(cli.config.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Collect {
                port,
                max_connections,
                records,
            } => {
                if let Some(p) = port {
                    cfg.listen_port = p;
                }
                if let Some(n) = max_connections.filter(|n| *n > 0) {
                    cfg.engine.max_connections = n;
                }
                if records.is_some() {
                    cfg.records_path = records;
                }
                tokio::select! {
                    r = collect(cfg) => r,
                    r = shutdown_signal() => {
                        info!("shutting down");
                        r
                    }
                }
            }
            Command::Attend {
                collector,
                name,
                roll,
                device,
            } => {
                let opts = attendee::AttendeeOptions {
                    device: device.unwrap_or_else(|| format!("attendee-{}", roll.trim())),
                    collector,
                    connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
                    write_timeout: Duration::from_millis(cfg.write_timeout_ms),
                    tick: Duration::from_millis(cfg.tick_interval_ms),
                };
                let record = StudentRecord::new(name.trim(), roll.trim());
                let id = attendee::run(record, &cfg.engine, &opts).await?;
                println!("confirmed {id}");
                Ok(())
            }
        }
    })
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn collect(cfg: Config) -> anyhow::Result<()> {
    let sink: Arc<dyn RecordSink> = match &cfg.records_path {
        Some(path) => Arc::new(JsonlSink::open(path)?),
        None => Arc::new(LogSink),
    };
    let listener = TcpListener::bind((cfg.listen_addr.as_str(), cfg.listen_port))
        .await
        .with_context(|| format!("binding {}:{}", cfg.listen_addr, cfg.listen_port))?;
    info!(
        addr = %cfg.listen_addr,
        port = cfg.listen_port,
        max_connections = cfg.engine.max_connections,
        "collector listening"
    );

    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    let timeouts = transport::LinkTimeouts {
        handshake: cfg.engine.discovery_timeout(),
        write: Duration::from_millis(cfg.write_timeout_ms),
    };
    let listen_task = tokio::spawn(transport::run_listener(listener, event_tx, timeouts));

    let fallback_rate = 1.0 / cfg.engine.per_peer_processing_secs.max(1) as f32;
    let engine = AttendanceEngine::new(cfg.engine.clone()).with_throughput_estimator(Box::new(
        MovingAverageRate::new(THROUGHPUT_WINDOW, fallback_rate),
    ));
    let coordinator = coordinator::Coordinator::new(engine, sink);
    tokio::select! {
        _ = coordinator.run(event_rx, Duration::from_millis(cfg.tick_interval_ms.max(10))) => Ok(()),
        r = listen_task => {
            r.context("listener task")?.context("accepting links")?;
            Ok(())
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown, runtime and tasks exit; systemd may restart if configured.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
