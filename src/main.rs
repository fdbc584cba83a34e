mod config;

use clap::Parser as _;
use config::Config;
use switchyard::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    gateway::Gateway,
    registry::{ConfigFile, WatchedFile},
};
use tokio::net::TcpListener;
use tracing::{error, info, instrument};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting switchyard with config: {:?}", config);

    let file = ConfigFile::load(&config.providers).await?;
    let gateway = Gateway::new(&file)
        .map_err(|e| anyhow::anyhow!("Failed to create gateway from config: {}", e))?;
    gateway.start_background_tasks();

    // Start file watcher if requested
    if config.watch {
        gateway
            .receive_updates(WatchedFile(config.providers.clone()))
            .await?;
    }

    let app_state = AppState::new(gateway.clone(), file.auth);
    let mut router = build_router(app_state);

    if config.metrics {
        let (prometheus_layer, handle) = build_metrics_layer_and_handle(config.metrics_prefix.clone());
        router = router.layer(prometheus_layer);

        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr).await?;
        info!("Metrics endpoint listening on {}", metrics_addr);
        gateway
            .supervisor()
            .spawn("metrics-server", move |token| async move {
                let served = axum::serve(metrics_listener, build_metrics_router(handle))
                    .with_graceful_shutdown(async move { token.cancelled().await })
                    .await;
                if let Err(e) = served {
                    error!("Metrics server failed: {}", e);
                }
            });
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Switchyard listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopped accepting requests, shutting down");
    gateway.shutdown(config.shutdown_grace()).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
