// src/sync.rs
//
// Periodic batch synchronizer. Each cycle reconciles the local detection log
// against the central store's watermark: fetch watermark, decide the upload
// window, upload, then delete the confirmed rows locally. Local rows are
// destroyed in exactly one place, and only after the central store has
// acknowledged the batch, so an outage can delay but never lose data.

use crate::alert::AlertClient;
use crate::health::{StatusBoard, TASK_SEND_HOURLY_DATA};
use crate::shutdown::sleep_or_shutdown;
use crate::store::{DetectionStore, StoredDetection};
use crate::types::{SyncConfig, TS_FORMAT};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Serialize)]
struct BatchDetection {
    id: i64,
    timestamp: String,
    vehicle_id: String,
    x_position: f32,
    y_position: f32,
    direction: String,
}

#[derive(Debug, Deserialize)]
struct LastUploadResponse {
    last_upload_time: Option<String>,
}

/// Client for the central aggregation API.
pub struct CentralStoreClient {
    http_client: reqwest::Client,
    batch_url: String,
    last_upload_url: String,
}

impl CentralStoreClient {
    pub fn new(batch_url: String, last_upload_url: String, timeout_secs: u64) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http_client,
            batch_url,
            last_upload_url,
        })
    }

    /// The central store's watermark, or None when it cannot be determined.
    /// A missing watermark is never guessed around; the cycle goes idle.
    pub async fn fetch_watermark(&self) -> Option<NaiveDateTime> {
        info!("🔄 Getting last upload time...");
        let response = match self.http_client.get(&self.last_upload_url).send().await {
            Ok(response) => response,
            Err(_) => {
                error!("❌ Could not get the last upload time due to a network error.");
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(
                "⚠️ Error getting last upload time, response: {}",
                response.status()
            );
            return None;
        }

        match response.json::<LastUploadResponse>().await {
            Ok(LastUploadResponse {
                last_upload_time: Some(raw),
            }) => match parse_watermark(&raw) {
                Some(watermark) => Some(watermark),
                None => {
                    warn!("⚠️ Unparseable last upload time: {}", raw);
                    None
                }
            },
            Ok(_) => {
                warn!("⚠️ No last upload time found.");
                None
            }
            Err(e) => {
                warn!("⚠️ Malformed last-upload-time response: {}", e);
                None
            }
        }
    }

    /// Push one batch. True only on a 2xx acknowledgment, which also means
    /// the central store advanced its watermark to the batch's maximum
    /// timestamp.
    async fn upload_batch(&self, batch: &[BatchDetection]) -> bool {
        match self
            .http_client
            .post(&self.batch_url)
            .json(batch)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!("⚠️ API error ({}) on batch upload", response.status());
                false
            }
            Err(_) => {
                error!("❌ No connection to API for batch upload");
                false
            }
        }
    }
}

/// The central store emits its watermark in two formats, with and without
/// fractional seconds.
fn parse_watermark(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

/// Upper bound of the upload window: `now - interval`, truncated to the
/// interval boundary so repeated cycles within one interval agree on it.
fn window_end(now: NaiveDateTime, interval_secs: u64) -> NaiveDateTime {
    let interval = interval_secs.max(1) as i64;
    let end = now.and_utc().timestamp() - interval;
    let truncated = end - end.rem_euclid(interval);
    DateTime::from_timestamp(truncated, 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or(now - ChronoDuration::seconds(interval))
}

/// Decide whether there is anything to reconcile. Returns the upload window
/// `[watermark, end)` or None for an idle cycle.
fn plan_cycle(
    watermark: Option<NaiveDateTime>,
    now: NaiveDateTime,
    interval_secs: u64,
) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let watermark = watermark?;
    let end = window_end(now, interval_secs);
    if end > watermark {
        Some((watermark, end))
    } else {
        None
    }
}

fn to_batch(rows: &[StoredDetection]) -> Vec<BatchDetection> {
    rows.iter()
        .map(|row| BatchDetection {
            id: row.id,
            timestamp: row.detection.timestamp.format(TS_FORMAT).to_string(),
            vehicle_id: row.detection.vehicle_id.clone(),
            x_position: row.detection.x_position,
            y_position: row.detection.y_position,
            direction: row.detection.direction.as_str().to_string(),
        })
        .collect()
}

/// One synchronization cycle. Storage and HTTP failures inside the upload
/// loop are handled here; anything escaping as Err is unexpected and handled
/// by the outer task loop.
async fn run_cycle(
    store: &DetectionStore,
    client: &CentralStoreClient,
    config: &SyncConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let watermark = client.fetch_watermark().await;
    info!("🔄 Checking for new data... Last upload time: {:?}", watermark);

    let now = Local::now().naive_local();
    let Some((from, to)) = plan_cycle(watermark, now, config.interval_secs) else {
        info!("😴 No new data to upload. Waiting...");
        return Ok(());
    };

    let rows = store
        .query_range(from, to)
        .context("Failed to read upload window from the detection log")?;
    info!("🔄 Found {} new detections to upload", rows.len());
    if rows.is_empty() {
        return Ok(());
    }

    info!("⏳ Uploading data from {} to {}", from, to);
    let batch = to_batch(&rows);

    // Blocking retry: the cycle does not move on until the upload is
    // confirmed or the process is shutting down. No delete happens on any
    // other path.
    loop {
        if client.upload_batch(&batch).await {
            let deleted = store
                .delete_before(to)
                .context("Failed to delete uploaded detections")?;
            info!(
                "✅ Data from {} to {} uploaded, {} local rows deleted",
                from, to, deleted
            );
            return Ok(());
        }

        warn!(
            "⚠️ Upload failed. Retrying in {} s...",
            config.retry_backoff_secs
        );
        if sleep_or_shutdown(Duration::from_secs(config.retry_backoff_secs), shutdown).await {
            // Nothing was confirmed, so nothing is deleted; the rows are
            // picked up again on the next run.
            return Ok(());
        }
    }
}

pub async fn run_sync(
    store: DetectionStore,
    client: CentralStoreClient,
    alerts: AlertClient,
    status: StatusBoard,
    config: SyncConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        "🔄 Batch synchronizer started (interval {} s)",
        config.interval_secs
    );

    loop {
        status.set_running(TASK_SEND_HOURLY_DATA);

        if let Err(e) = run_cycle(&store, &client, &config, &mut shutdown).await {
            status.set_stopped(TASK_SEND_HOURLY_DATA);
            error!("❌ An unexpected error occurred: {:#}", e);
            alerts.send_system_alert("send_hourly_data FAILED.").await;
            if sleep_or_shutdown(Duration::from_secs(config.cooldown_secs), &mut shutdown).await {
                break;
            }
            continue;
        }

        if sleep_or_shutdown(Duration::from_secs(config.interval_secs), &mut shutdown).await {
            break;
        }
    }

    status.set_stopped(TASK_SEND_HOURLY_DATA);
    info!("Batch synchronizer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Detection, Direction};

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TS_FORMAT).unwrap()
    }

    #[test]
    fn test_parse_watermark_both_formats() {
        assert_eq!(
            parse_watermark("2024-03-01 08:55:00"),
            Some(ts("2024-03-01 08:55:00"))
        );
        assert_eq!(
            parse_watermark("2024-03-01 08:55:00.250000"),
            Some(
                ts("2024-03-01 08:55:00") + ChronoDuration::milliseconds(250)
            )
        );
        assert_eq!(parse_watermark("yesterday-ish"), None);
    }

    #[test]
    fn test_window_end_truncates_to_interval_boundary() {
        // 09:11:42 minus 5 min is 09:06:42, truncated down to 09:05:00
        assert_eq!(
            window_end(ts("2024-03-01 09:11:42"), 300),
            ts("2024-03-01 09:05:00")
        );
        // Exactly on a boundary stays put
        assert_eq!(
            window_end(ts("2024-03-01 09:10:00"), 300),
            ts("2024-03-01 09:05:00")
        );
    }

    #[test]
    fn test_plan_without_watermark_is_idle() {
        assert_eq!(plan_cycle(None, ts("2024-03-01 09:11:42"), 300), None);
    }

    #[test]
    fn test_plan_idle_when_watermark_is_current() {
        // window_end 09:05:00 is not past the watermark: nothing to do, and
        // re-running the same cycle stays a no-op
        let watermark = Some(ts("2024-03-01 09:05:00"));
        assert_eq!(plan_cycle(watermark, ts("2024-03-01 09:11:42"), 300), None);
        assert_eq!(plan_cycle(watermark, ts("2024-03-01 09:11:42"), 300), None);
    }

    #[test]
    fn test_plan_upload_window_starts_at_watermark() {
        assert_eq!(
            plan_cycle(
                Some(ts("2024-03-01 08:55:00")),
                ts("2024-03-01 09:11:42"),
                300
            ),
            Some((ts("2024-03-01 08:55:00"), ts("2024-03-01 09:05:00")))
        );
    }

    #[test]
    fn test_upload_window_then_delete_spares_unconfirmed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = DetectionStore::new(dir.path().join("detections.db"));
        store.ensure_schema().unwrap();

        for time in ["2024-03-01 09:00:00", "2024-03-01 09:05:00", "2024-03-01 09:10:00"] {
            store
                .append(&Detection {
                    timestamp: ts(time),
                    vehicle_id: "3".to_string(),
                    x_position: 10.0,
                    y_position: 20.0,
                    direction: Direction::Descending,
                    image: None,
                })
                .unwrap();
        }

        // Watermark 08:55, window end 09:06: the 09:00 and 09:05 rows go up
        let (from, to) = (ts("2024-03-01 08:55:00"), ts("2024-03-01 09:06:00"));
        let rows = store.query_range(from, to).unwrap();
        let batch = to_batch(&rows);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].timestamp, "2024-03-01 09:00:00");
        assert_eq!(batch[1].timestamp, "2024-03-01 09:05:00");

        // After the confirmed upload, exactly those rows are deleted
        let deleted = store.delete_before(to).unwrap();
        assert_eq!(deleted, 2);

        let remaining = store
            .query_range(ts("2024-03-01 00:00:00"), ts("2024-03-02 00:00:00"))
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].detection.timestamp, ts("2024-03-01 09:10:00"));
    }

    #[test]
    fn test_batch_rows_carry_no_image_payload() {
        let row = StoredDetection {
            id: 4,
            detection: Detection {
                timestamp: ts("2024-03-01 09:00:00"),
                vehicle_id: "9".to_string(),
                x_position: 1.0,
                y_position: 2.0,
                direction: Direction::Ascending,
                image: Some(vec![1, 2, 3]),
            },
        };

        let json = serde_json::to_value(&to_batch(&[row])).unwrap();
        assert!(json[0].get("image").is_none());
        assert_eq!(json[0]["direction"], "ascending");
    }
}
