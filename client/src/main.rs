//! Task pipeline client.
//!
//! Pulls bundles of shell tasks from a remote queue, runs them across a pool
//! of local executors, and returns completion status in re-bundled form,
//! ending with a terminal-id handshake. See SPEC_FULL.md for the full
//! component design.

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod cli;
mod collector;
mod coordinator;
mod executor;
mod queue;
mod remote;
mod scheduler;

use clap::Parser;
use tracing::{error, info};

use cli::CliArgs;
use coordinator::Coordinator;

#[tokio::main]
async fn main() {
    let file_appender = tracing_appender::rolling::daily("./logs", "client.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("client=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();
    info!(host = %cli_args.host, port = cli_args.port, "client starting up");

    let config = match cli_args.into_config() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let coordinator = Coordinator::new(config);
    let halt = coordinator.halt_token();

    let shutdown_signal = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.expect("failed to register Ctrl+C handler");
            info!("received Ctrl+C");
        }
    };

    let mut run_handle = tokio::spawn(coordinator.run());

    let result = tokio::select! {
        result = &mut run_handle => result,
        _ = shutdown_signal => {
            // Cancelling halt only flips the FSMs' loop-exit flags; the
            // coordinator still has to run its ordered shutdown sequence
            // (drain executors, flush the collector, publish the terminal
            // id) before the process may exit.
            info!("shutdown signal received, halting pipeline");
            halt.cancel();
            run_handle.await
        }
    };

    match result {
        Ok(Ok(())) => info!("client pipeline completed successfully"),
        Ok(Err(err)) => {
            error!(%err, "client pipeline failed");
            std::process::exit(1);
        }
        Err(join_err) => {
            error!(%join_err, "client pipeline task panicked");
            std::process::exit(1);
        }
    }
}
