use clap::Parser;
use tokio::sync::oneshot;

use courier::clog;
use courier::config::{Cli, Config};
use courier::server::{app, BridgeState};
use courier::{logging, store};

#[tokio::main]
async fn main() {
    logging::init();

    let config = Config::from_cli_and_env(Cli::parse());
    let bind_addr = config.bind_addr.clone();
    let sweep_interval = config.sweep_interval;
    let state = BridgeState::new(config);

    let (sweep_shutdown_tx, sweep_shutdown_rx) = oneshot::channel();
    store::start_sweep_task(
        state.storage.clone(),
        state.registry.clone(),
        state.clock.clone(),
        sweep_interval,
        sweep_shutdown_rx,
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|error| panic!("failed to bind {bind_addr}: {error}"));
    clog!("bridge: listening on {bind_addr}");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            clog!("bridge: shutting down");
        })
        .await
        .unwrap_or_else(|error| panic!("server error: {error}"));

    let _ = sweep_shutdown_tx.send(());
}
