// src/retention.rs
//
// Periodic image retention. Aged image payloads are nulled in place; the
// detection rows themselves are never touched, so the synchronizer's view of
// the log is unaffected. Failures here are logged and the loop carries on -
// unlike the synchronizer, a missed purge pass costs disk space, not data.

use crate::health::{StatusBoard, TASK_DELETE_OLD_IMAGES};
use crate::shutdown::sleep_or_shutdown;
use crate::store::DetectionStore;
use crate::types::{Direction, RetentionConfig};
use chrono::{Duration as ChronoDuration, Local};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

pub async fn run_retention(
    store: DetectionStore,
    status: StatusBoard,
    config: RetentionConfig,
    wrong_direction: Direction,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        "🔄 Image retention started (interval {} s, keep_contrary_images: {})",
        config.interval_secs, config.keep_contrary_images
    );

    loop {
        status.set_running(TASK_DELETE_OLD_IMAGES);

        let threshold =
            Local::now().naive_local() - ChronoDuration::seconds(config.interval_secs as i64);
        info!("⏳ Cleaning up images older than {}...", threshold);

        match store.clear_images_before(threshold, config.keep_contrary_images, wrong_direction) {
            Ok(cleared) => {
                if cleared > 0 {
                    info!("✅ {} old image(s) deleted", cleared);
                }
            }
            Err(e) => {
                error!("❌ Error deleting images: {}", e);
            }
        }

        if sleep_or_shutdown(Duration::from_secs(config.interval_secs), &mut shutdown).await {
            break;
        }
    }

    status.set_stopped(TASK_DELETE_OLD_IMAGES);
    info!("Image retention stopped");
}
