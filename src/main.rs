use std::error::Error;

use log::{error, info};
use tracing_subscriber::EnvFilter;

use relayd::config::{Args, RelayConfig};
use relayd::relay::Relay;
use relayd::server::{AppState, router};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for CTRL-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("CTRL-C received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Args = argh::from_env();
    init_logging();

    let config = RelayConfig::try_from(args)?;
    info!("Upstream: {}", config.upstream_url);
    info!(
        "Queue capacity {} chunks, read buffer {} bytes, poll every {:?}, {} backpressure, idle {}",
        config.queue_capacity,
        config.read_buffer_size,
        config.poll_interval,
        config.backpressure,
        config.idle_policy
    );

    let listen_addr = config.listen_addr;
    let relay = Relay::new(config)?;
    let app = router(AppState::new(relay.clone()));

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("Starting the server on http://{}", listener.local_addr()?);

    let shutdown_relay = relay.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_relay.shutdown().await;
        })
        .await?;

    info!("Server stopped; exiting");
    Ok(())
}
