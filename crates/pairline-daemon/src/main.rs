//! pairline daemon: serves the pairing gateway and supervises attempts.
//!
//! The orchestrator never decides process lifetime. Every finished attempt
//! is reported here; this loop keeps serving, exits after one session when
//! asked to, and stops the process on a crash outside the known-benign set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use pairline_core::client::loopback::LoopbackConnector;
use pairline_core::client::ClientConnector;
use pairline_core::event_bus::EventBus;
use pairline_core::pairing::{
    is_fatal, AttemptOutcome, AttemptReport, PairingConfig, PairingOrchestrator, ReconnectPolicy,
};
use pairline_core::paths;
use pairline_core::store::SessionStore;
use pairline_http::SharedState;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Production,
    Development,
}

impl Mode {
    /// Log filter used when `RUST_LOG` is not set.
    fn default_filter(self) -> &'static str {
        match self {
            Mode::Production => "info",
            Mode::Development => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConnectorKind {
    /// In-process endpoint that pairs itself after a delay.
    Loopback,
}

#[derive(Parser, Debug)]
#[command(name = "pairline-daemon")]
#[command(about = "Pair a phone number and deliver its session credentials", long_about = None)]
struct Args {
    /// Address to bind the HTTP gateway to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the HTTP gateway to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Root directory for per-number session storage [default: ~/.pairline/sessions]
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Log verbosity preset; RUST_LOG overrides it
    #[arg(long, env = "PAIRLINE_MODE", value_enum, default_value_t = Mode::Production)]
    mode: Mode,

    /// Exit once the first attempt has delivered or failed
    #[arg(long)]
    exit_after_session: bool,

    /// Reconnects allowed per attempt after transient disconnects
    #[arg(long, default_value_t = 5)]
    max_reconnects: u32,

    /// Protocol client implementation
    #[arg(long, value_enum, default_value_t = ConnectorKind::Loopback)]
    connector: ConnectorKind,

    /// Seconds the loopback endpoint waits before completing a pairing
    #[arg(long, default_value_t = 30, value_name = "SECONDS")]
    loopback_register_after: u64,
}

/// Why the supervisor loop stopped.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Shutdown,
    SessionFinished,
    Fatal(String),
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(args.mode.default_filter()),
    )
    .init();

    if let Err(e) = run(args).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), String> {
    let session_root = match &args.session_dir {
        Some(dir) => dir.clone(),
        None => paths::default_session_root()?,
    };
    std::fs::create_dir_all(&session_root).map_err(|e| {
        format!(
            "Failed to create session directory {}: {}",
            session_root.display(),
            e
        )
    })?;
    log::info!("Session storage at {}", session_root.display());

    let (orchestrator, reports) = PairingOrchestrator::new(
        SessionStore::new(session_root),
        build_connector(&args),
        pairing_config(&args),
        Arc::new(EventBus::new()),
    );
    let state = Arc::new(SharedState::new(orchestrator));
    let mut server = pairline_http::start(state, &args.host, args.port)?;

    let exit = tokio::select! {
        exit = supervise(reports, args.exit_after_session) => exit,
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| format!("Failed to listen for ctrl-c: {}", e))?;
            log::info!("Received ctrl-c");
            Exit::Shutdown
        }
    };

    tokio::task::spawn_blocking(move || server.stop())
        .await
        .map_err(|e| format!("Failed to stop HTTP server: {}", e))?;

    match exit {
        Exit::Fatal(message) => Err(format!("Pairing attempt crashed: {}", message)),
        Exit::SessionFinished => {
            log::info!("Session finished, exiting");
            Ok(())
        }
        Exit::Shutdown => Ok(()),
    }
}

fn build_connector(args: &Args) -> Arc<dyn ClientConnector> {
    match args.connector {
        ConnectorKind::Loopback => {
            let register_after = Duration::from_secs(args.loopback_register_after);
            log::info!(
                "Using loopback connector (registers {:?} after a code is issued)",
                register_after
            );
            Arc::new(LoopbackConnector::new(register_after))
        }
    }
}

fn pairing_config(args: &Args) -> PairingConfig {
    PairingConfig {
        reconnect: ReconnectPolicy {
            max_attempts: args.max_reconnects,
            ..ReconnectPolicy::default()
        },
        ..PairingConfig::default()
    }
}

async fn supervise(
    mut reports: mpsc::UnboundedReceiver<AttemptReport>,
    exit_after_session: bool,
) -> Exit {
    while let Some(report) = reports.recv().await {
        if let Some(exit) = decide(&report, exit_after_session) {
            return exit;
        }
    }
    Exit::Shutdown
}

/// Decide whether a finished attempt ends the process.
fn decide(report: &AttemptReport, exit_after_session: bool) -> Option<Exit> {
    match &report.outcome {
        AttemptOutcome::Delivered => {
            log::info!("Credentials delivered for {}", report.identity);
        }
        AttemptOutcome::Failed(error) => {
            log::warn!("Attempt for {} failed: {}", report.identity, error);
        }
        AttemptOutcome::Superseded => {
            log::debug!("Attempt for {} was superseded", report.identity);
            return None;
        }
        AttemptOutcome::Crashed(message) => {
            if is_fatal(&report.outcome) {
                return Some(Exit::Fatal(message.clone()));
            }
            log::warn!(
                "Ignoring known transient failure for {}: {}",
                report.identity,
                message
            );
            return None;
        }
    }

    exit_after_session.then_some(Exit::SessionFinished)
}
