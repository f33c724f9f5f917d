//! Dispatch Panel
//!
//! Operator panel for delivery orders: polls the order backend, rings when
//! new work arrives and walks an order through arm -> confirm -> delivered.
//! The library holds the panel core; `run()` wires it to the terminal
//! front-end used by the `dispatch-panel` binary.

use anyhow::Context as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
};

pub mod api;
pub mod chime;
pub mod config;
pub mod detector;
pub mod diagnostics;
pub mod order;
pub mod panel;
pub mod projector;
pub mod session;
pub mod terminal;

use crate::api::HttpOrderBackend;
use crate::config::PanelConfig;
use crate::terminal::{parse_command, Command, TerminalRenderer, HELP};

/// One JSON object per line; humans read the console instead.
fn json_file_layer<S, W>(writer: W) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
}

/// Structured logging: stderr console + rolling daily JSON file. The returned
/// guard flushes the file writer when dropped.
fn init_logging() -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dispatch_panel_lib=debug"));

    diagnostics::prune_old_logs();

    let log_dir = diagnostics::get_log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = json_file_layer(non_blocking);
    // Frames go to stdout; keep logs off it.
    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

// ============================================================================
// App entry point
// ============================================================================

pub fn run() -> anyhow::Result<()> {
    let _log_guard = init_logging();
    info!(
        about = %diagnostics::about_info(),
        "Starting Dispatch Panel v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = PanelConfig::load().context("Failed to load panel config")?;
    info!(
        backend = %config.backend_url,
        poll_interval_secs = config.poll_interval_secs,
        "Panel configured"
    );

    // Panel work is cooperative on one thread; network calls are the only
    // suspension points.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(run_panel(config));
    // A pending stdin read lives on a blocking thread; don't wait on it.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run_panel(config: PanelConfig) -> anyhow::Result<()> {
    let backend = HttpOrderBackend::new(&config.backend_url, config.request_timeout())
        .map_err(anyhow::Error::msg)?;
    let chime = chime::build_chime(config.player_command(), config.sound_path.clone());
    let handle = panel::spawn_panel(
        config.panel_options(),
        Arc::new(backend),
        chime,
        TerminalRenderer,
    );

    let outcome = operator_input(&handle).await;
    handle.shutdown().await;
    outcome
}

/// Read operator commands from stdin until `quit`, EOF or Ctrl-C.
async fn operator_input(handle: &panel::PanelHandle) -> anyhow::Result<()> {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read operator input")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };
        match parse_command(&line) {
            Ok(Command::Intent(intent)) => handle.send(intent),
            Ok(Command::Help) => println!("{HELP}"),
            Ok(Command::Quit) => return Ok(()),
            Err(message) => {
                warn!(input = %line.trim(), "Unrecognised operator input");
                println!("{message}\n{HELP}");
            }
        }
    }
}
