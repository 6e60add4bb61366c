//! Binary entry point: parses CLI flags, wires up the Supervisor, and
//! either dispatches a one-shot Control API command or runs the
//! Intercept Engine daemon until signaled to stop.

mod cli;

use clap::Parser;
use tokio::sync::watch;

use channel_isolator::config::Config;
use channel_isolator::supervisor::Supervisor;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("channel_isolator=info")),
        )
        .init();

    let config = Config::resolve(cli.node_dir.clone(), cli.network, cli.db_path.clone());

    let supervisor = match Supervisor::start(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return std::process::ExitCode::from(e.exit_code() as u8);
        }
    };

    match cli.command {
        Some(command) => {
            let code = cli::dispatch(command, &supervisor.control, cli.json).await;
            std::process::ExitCode::from(code as u8)
        }
        None => {
            run_daemon(supervisor).await;
            std::process::ExitCode::SUCCESS
        }
    }
}

/// Runs the Intercept Engine until SIGINT/SIGTERM, then shuts down in
/// order.
async fn run_daemon(supervisor: Supervisor) {
    let (stop_tx, stop_rx) = watch::channel(false);

    let supervisor_run = supervisor.run(stop_rx);
    tokio::pin!(supervisor_run);

    tokio::select! {
        _ = &mut supervisor_run => {}
        _ = wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping intercept engine");
            let _ = stop_tx.send(true);
            supervisor_run.await;
        }
    }

    tracing::info!("shutdown complete");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
