use momo_core::app::bootstrap;
use momo_core::config::AppConfig;
use momo_core::logging::init_tracing;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.server.bind_address(),
        database = config.database.url.is_some(),
        shared_tokens = config.cache.redis_url.is_some(),
        "starting momo-core"
    );

    let services = bootstrap(&config).await.map_err(|e| {
        error!(error = ?e.kind, "failed to bootstrap services");
        anyhow::anyhow!("bootstrap failed: {}", e)
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = services.spawn_workers(&config, shutdown_rx);

    let app = services.router();
    let listener = tokio::net::TcpListener::bind(config.server.bind_address()).await?;
    info!(address = %listener.local_addr()?, "webhook ingress listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(shutdown_tx))
        .await?;

    for handle in workers {
        if let Err(e) = handle.await {
            error!(error = %e, "worker task ended abnormally");
        }
    }

    info!("momo-core stopped");
    Ok(())
}
