mod auth;
mod config;
mod error;
mod routes;

use std::sync::Arc;

use concord_core::adapters::{AdapterRegistry, HttpCloudAdapter, MemoryCloudAdapter};
use concord_core::services::StoreService;
use concord_core::Coordinator;
use config::AppConfig;
use routes::{app_router, AppState};
use tracing_subscriber::filter::Directive;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("concord_api=info".parse::<Directive>()?)
                .add_directive("concord_core=info".parse::<Directive>()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting concord-api with config: {:?}", config);

    let store = StoreService::open_path(config.database_path.clone())?;
    let coordinator = Coordinator::new(config.engine.clone(), store, adapter_registry(&config)?);
    let background = coordinator.spawn_background();

    let state = AppState::new(config, coordinator);
    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("concord-api listening on {}", bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in background {
        task.abort();
    }
    tracing::info!("concord-api stopped");
    Ok(())
}

fn adapter_registry(config: &AppConfig) -> concord_core::Result<AdapterRegistry> {
    let mut adapters = AdapterRegistry::new();
    if config.memory_adapter {
        adapters.register(Arc::new(MemoryCloudAdapter::new("memory")));
    }
    if let Some(bridge) = &config.cloud_bridge {
        adapters.register(Arc::new(HttpCloudAdapter::new(
            &bridge.provider,
            &bridge.url,
            &bridge.token,
        )?));
    }
    if adapters.providers().is_empty() {
        tracing::warn!("No cloud adapters configured; document sync is disabled");
    }
    Ok(adapters)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
