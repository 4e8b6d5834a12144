//! nimbus control-plane server.

use std::sync::Arc;

use nimbus_cloud::{AwsProvisioner, CloudManager, KubernetesProvisioner, Monitor};
use nimbus_core::{CloudConfig, CloudStore, Platform};
use nimbus_db::{DbPool, SqliteStore};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = CloudConfig::from_env()?;

    let pool = DbPool::connect(&config.server.database_url).await?;
    let sqlite = SqliteStore::new(pool);
    sqlite.init_schema().await?;
    let store: Arc<dyn CloudStore> = Arc::new(sqlite);

    let manager = Arc::new(CloudManager::new(config.clone(), Some(store.clone())));

    if config.container.enabled {
        match KubernetesProvisioner::new(
            config.container.clone(),
            config.server.public_url.clone(),
            config.server.api_key.clone(),
        )
        .await
        {
            Ok(provisioner) => {
                manager.register_provisioner(&[Platform::Linux], Arc::new(provisioner));
            }
            Err(e) => warn!(error = %e, "container backend unavailable, linux provisioning disabled"),
        }
    }

    if config.iaas.enabled {
        let provisioner = AwsProvisioner::new(
            config.iaas.clone(),
            store.clone(),
            config.server.public_url.clone(),
            config.server.api_key.clone(),
        )
        .await;
        if let Err(e) = provisioner.seed_hosts().await {
            warn!(error = %e, "failed to seed dedicated hosts");
        }
        manager.register_provisioner(
            &[Platform::Windows, Platform::MacOs],
            Arc::new(provisioner),
        );
    }

    let monitor = Arc::new(Monitor::new(manager.clone(), store.clone(), config.clone()));
    let monitor_handle = monitor.start();

    let app = nimbus_server::api::router(manager.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    info!(addr = %config.server.bind_addr, enabled = config.enabled, "nimbus control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    monitor.stop();
    let _ = monitor_handle.await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install shutdown handler");
    }
}
