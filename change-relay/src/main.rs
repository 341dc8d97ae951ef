//! Relay MongoDB change streams into history collections and Kafka topics.
use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use change_relay::config::Config;
use change_relay::server::serve;

async fn shutdown(token: CancellationToken) {
    let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!("failed to register SIGTERM handler: {}", e);
            return;
        }
    };
    let mut interrupt = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
        Ok(interrupt) => interrupt,
        Err(e) => {
            tracing::error!("failed to register SIGINT handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
        _ = token.cancelled() => return,
    };

    tracing::info!("Shutting down gracefully...");
    token.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env()?;

    let token = CancellationToken::new();
    tokio::spawn(shutdown(token.clone()));

    serve(config, token).await
}
