use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use miette::IntoDiagnostic;
use telemetry_relay::axum::AppState;
use telemetry_relay::serial::SerialConfig;
use telemetry_relay::{Broadcaster, Config, DeliveryMode, SourceKind, serial, sim};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[clap(long, help = "Path to the configuration file")]
    config: Option<PathBuf>,
    #[clap(long, help = "Address to bind the HTTP server to")]
    addr: Option<SocketAddr>,
    #[clap(long, value_enum, help = "Where telemetry samples come from")]
    source: Option<SourceKind>,
    #[clap(long, value_enum, help = "When samples are pushed to subscribers")]
    mode: Option<DeliveryMode>,
    #[clap(long, help = "Milliseconds between periodic broadcasts")]
    interval_ms: Option<u64>,
    #[clap(long, help = "Serial device to read from")]
    serial_path: Option<String>,
    #[clap(long, help = "Serial baud rate")]
    baud_rate: Option<u32>,
    #[clap(
        long,
        value_enum,
        default_value = "info",
        help = "Log level (error, warn, info, debug, trace)"
    )]
    log_level: LogLevel,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(addr) = self.addr {
            config.server.addr = addr;
        }
        if let Some(source) = self.source {
            config.source = source;
        }
        if let Some(mode) = self.mode {
            config.broadcast.mode = mode;
        }
        if let Some(interval_ms) = self.interval_ms {
            config.broadcast.interval_ms = interval_ms;
        }
        if let Some(path) = self.serial_path {
            config.serial.path = path;
        }
        if let Some(baud_rate) = self.baud_rate {
            config.serial.baud_rate = baud_rate;
        }
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let args = Cli::parse();
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::builder().from_env_lossy()
    } else {
        EnvFilter::builder().parse_lossy(format!(
            "telemetry_relay={level},tower_http={level}",
            level = args.log_level.as_str()
        ))
    };
    let _ = tracing_subscriber::fmt::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        ))
        .try_init();

    let mut config = Config::discover(args.config.clone())?;
    args.apply(&mut config);
    info!(source = ?config.source, mode = ?config.broadcast.mode, "starting relay");

    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    let broadcaster = Arc::new(Broadcaster::new(config.broadcast.clone()));

    tracker.spawn(broadcaster.clone().run_periodic(token.clone()));
    match config.source {
        SourceKind::Simulator => {
            tracker.spawn(sim::run(
                config.simulator.clone(),
                broadcaster.clone(),
                token.clone(),
            ));
        }
        SourceKind::Http => info!("waiting for samples on POST /telemetry"),
        SourceKind::Serial => {
            tracker.spawn(supervise_serial(
                config.serial.clone(),
                broadcaster.clone(),
                token.clone(),
            ));
        }
    }

    let listener = tokio::net::TcpListener::bind(config.server.addr)
        .await
        .into_diagnostic()?;
    let state = AppState {
        broadcaster: broadcaster.clone(),
        token: token.clone(),
    };
    let http_token = token.clone();
    tracker.spawn(async move {
        if let Err(err) = telemetry_relay::axum::serve(listener, state).await {
            error!(%err, "http server failed");
            http_token.cancel();
        }
    });

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                warn!(?err, "failed to listen for ctrl-c");
            }
            info!("shutting down");
        }
        _ = token.cancelled() => {}
    }
    token.cancel();
    broadcaster.shutdown();
    tracker.close();
    tracker.wait().await;
    info!(published = broadcaster.published(), "stopped");
    Ok(())
}

/// Runs the serial adapter, relaunching it after `restart_delay` when set.
/// Subscribers keep receiving the last good sample while it is down.
async fn supervise_serial(
    config: SerialConfig,
    broadcaster: Arc<Broadcaster>,
    token: CancellationToken,
) {
    loop {
        match serial::run(config.clone(), broadcaster.clone(), token.clone()).await {
            Ok(stats) => {
                info!(?stats, "serial ingestion stopped");
                return;
            }
            Err(err) => error!(%err, path = %config.path, "serial ingestion failed"),
        }
        let Some(delay) = config.restart_delay() else {
            warn!("serial ingestion not restarted, serving last known sample");
            return;
        };
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => info!(?delay, "restarting serial ingestion"),
        }
    }
}
