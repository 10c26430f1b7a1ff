//! `robobridge` – MQTT ⇄ WebSocket bridge for the robot control panel.
//!
//! On launch the binary:
//!
//! 1. Loads `~/.robobridge/config.toml` (or the path given as the first
//!    argument) and applies `ROBOBRIDGE_*` overrides.
//! 2. Starts the broker's host process in the background.
//! 3. Connects to the MQTT broker and subscribes to the robot topics.
//! 4. Serves the control panel pages and WebSocket upgrades on one port.
//! 5. On **Ctrl-C** / SIGTERM, issues the broker stop command and exits.

mod config;
mod lifecycle;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use robobridge_cockpit::{BridgeServer, ConnectionSet, SocketHub};
use robobridge_middleware::{BridgeRouter, BrokerClient};
use robobridge_types::BridgeError;
use tokio::sync::mpsc;
use tracing::{error, info};

use config::Config;
use lifecycle::LifecycleController;

fn main() -> ExitCode {
    let _tracer_guard = telemetry::init_tracing("robobridge");

    print_banner();

    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let cfg = match config::load(explicit.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "cannot start bridge");
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    info!(config = ?cfg, "configuration loaded");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "bridge stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config) -> Result<(), BridgeError> {
    // ── Shutdown signal ───────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .map_err(|e| BridgeError::Process(format!("failed to install Ctrl-C handler: {e}")))?;

    // ── Broker process ────────────────────────────────────────────────────
    let lifecycle = LifecycleController::new(
        cfg.broker_start_command.clone(),
        cfg.broker_stop_command.clone(),
    );
    lifecycle.supervise(bridge(&cfg, shutdown_rx)).await
}

async fn bridge(cfg: &Config, mut shutdown_rx: mpsc::UnboundedReceiver<()>) -> Result<(), BridgeError> {
    // ── Broker client + router ────────────────────────────────────────────
    let (broker, inbound) = BrokerClient::connect(&cfg.broker_config())?;
    let connections = Arc::new(ConnectionSet::new());
    let router = BridgeRouter::new(Arc::new(broker), connections.clone());
    tokio::spawn({
        let router = router.clone();
        async move { router.run(inbound).await }
    });

    // ── HTTP + WebSocket server ───────────────────────────────────────────
    let server = BridgeServer::new(SocketHub::new(connections, router))
        .with_port(cfg.listen_port)
        .with_frontend_dir(cfg.frontend_dir.clone());
    println!(
        "  {} http://localhost:{}",
        "Control panel:".bold(),
        server.port()
    );
    println!();

    tokio::select! {
        res = server.run() => res,
        _ = shutdown_rx.recv() => {
            println!();
            println!("{}", "⚠  Shutdown requested – stopping broker …".yellow().bold());
            info!("shutdown signal received");
            Ok(())
        }
    }
}

fn print_banner() {
    println!();
    println!("  {} {}",
        "RoboBridge".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  MQTT ⇄ WebSocket bridge for the robot control panel");
    println!();
}
