//! inputbridged -- privileged input daemon.
//!
//! Entry point, configuration discovery and signal handling.
//!
//! Usage: `inputbridged [--config PATH]`

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

#[cfg(target_os = "linux")]
fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("inputbridged v{}", env!("CARGO_PKG_VERSION"));

    let config = match inputbridge::config::DaemonConfig::discover(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            log::error!("config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let daemon = match inputbridge::daemon::Daemon::from_config(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to build tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            wait_for_signal().await;
            let _ = shutdown_tx.send(true);
        });
        daemon.run(shutdown_rx).await
    });

    match result {
        Ok(()) => {
            log::info!("inputbridged stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn main() -> ExitCode {
    eprintln!("inputbridged only runs on Linux");
    ExitCode::FAILURE
}

/// Resolves on SIGINT or SIGTERM.
#[cfg(target_os = "linux")]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("signal: cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            log::info!("signal: SIGINT received, shutting down");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("signal: SIGINT received, shutting down"),
        _ = term.recv() => log::info!("signal: SIGTERM received, shutting down"),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "inputbridged",
    version,
    about = "Privileged input capture and injection daemon"
)]
struct Cli {
    /// Daemon config file. Without it /etc/inputbridge/daemon.toml is used
    /// if present, else built-in defaults.
    #[arg(short, long, env = "INPUTBRIDGE_CONFIG")]
    config: Option<PathBuf>,
}
