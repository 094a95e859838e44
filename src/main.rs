// src/main.rs

mod alert;
mod config;
mod health;
mod ingest;
mod retention;
mod ring_buffer;
mod sensor;
mod shutdown;
mod store;
mod sync;
mod types;
mod vehicle_tracker;

use alert::AlertClient;
use anyhow::Result;
use health::{StatusBoard, TASK_CAMERA_SERVICE, TASK_DELETE_OLD_IMAGES, TASK_SEND_HOURLY_DATA};
use sensor::ReplaySource;
use store::DetectionStore;
use sync::CentralStoreClient;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = types::Config::load_default()?;

    tracing_subscriber::fmt()
        .with_env_filter(format!("wrongway_detection={}", config.logging.level))
        .init();

    info!("🚗 Wrong-Way Detection Node Starting");
    info!("✓ Configuration loaded");

    let store = DetectionStore::new(&config.data.db_path);
    store.ensure_schema()?;
    info!("✓ Local detection log ready at {}", config.data.db_path);

    let status = StatusBoard::new(
        &config.data.status_file,
        &[
            TASK_CAMERA_SERVICE,
            TASK_SEND_HOURLY_DATA,
            TASK_DELETE_OLD_IMAGES,
        ],
    );
    status.reset_all();

    let alert_client = AlertClient::new(
        config.application.api_alert_url.clone(),
        config.application.http_timeout_secs,
    )?;
    let central = CentralStoreClient::new(
        config.application.api_batch_url.clone(),
        config.application.api_last_upload_url.clone(),
        config.application.http_timeout_secs,
    )?;
    info!("✓ Central store client ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let replay = ReplaySource::new(&config.sensor);

    info!("🔄 Starting tasks...");
    let ingest_task = tokio::spawn(ingest::run_ingest(
        replay,
        config.clone(),
        store.clone(),
        alert_client.clone(),
        status.clone(),
        shutdown_rx.clone(),
    ));
    let sync_task = tokio::spawn(sync::run_sync(
        store.clone(),
        central,
        alert_client.clone(),
        status.clone(),
        config.sync.clone(),
        shutdown_rx.clone(),
    ));
    let retention_task = tokio::spawn(retention::run_retention(
        store,
        status,
        config.retention.clone(),
        config.alerts.wrong_direction,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(ingest_task, sync_task, retention_task);
    info!("All tasks stopped");
    Ok(())
}
