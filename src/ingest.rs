// src/ingest.rs
//
// Ingestion task: drains frames from the sensor seam, updates the tracker,
// runs the alert policy and appends detection rows to the local log. The
// tracker map lives here and nowhere else. Sensor failures are retried up to
// the configured budget; exhausting it raises an emergency alert and ends
// the task for good, leaving the restart to process-level supervision.

use crate::alert::{AlertClient, AlertDecision, AlertDispatcher, WRONG_WAY_ALERT};
use crate::health::{StatusBoard, TASK_CAMERA_SERVICE};
use crate::sensor::TrackletSource;
use crate::shutdown::sleep_or_shutdown;
use crate::store::{DetectionStore, PresentationConfig};
use crate::types::{Config, Detection, Direction, Observation, TrackletStatus};
use crate::vehicle_tracker::VehicleTracker;
use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

enum IngestEnd {
    Shutdown,
    StreamEnded,
}

pub async fn run_ingest<S: TrackletSource>(
    mut source: S,
    config: Config,
    store: DetectionStore,
    alert_client: AlertClient,
    status: StatusBoard,
    mut shutdown: watch::Receiver<bool>,
) {
    status.set_running(TASK_CAMERA_SERVICE);

    let mut tracker = VehicleTracker::new(&config.tracker);
    let mut dispatcher = AlertDispatcher::new(&config.alerts);

    let max_retries = config.application.max_retries;
    let mut retries = 0;

    while retries < max_retries {
        if *shutdown.borrow() {
            break;
        }

        let outcome = match source.connect() {
            Ok(()) => {
                info!("✅ Sensor stream connected");
                ingest_frames(
                    &mut source,
                    &config,
                    &mut tracker,
                    &mut dispatcher,
                    &store,
                    &alert_client,
                    &mut shutdown,
                )
                .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(IngestEnd::Shutdown) => {
                break;
            }
            Ok(IngestEnd::StreamEnded) => {
                info!("Sensor stream ended");
                status.set_stopped(TASK_CAMERA_SERVICE);
                return;
            }
            Err(e) => {
                error!("❌ Error in sensor operation: {}", e);
                retries += 1;
                info!("🔄 Retrying... (attempt {}/{})", retries, max_retries);
                if sleep_or_shutdown(Duration::from_secs(5), &mut shutdown).await {
                    break;
                }
            }
        }
    }

    status.set_stopped(TASK_CAMERA_SERVICE);
    if retries >= max_retries {
        error!(
            "❌❌❌ Max retries reached ({}). Sending emergency alert.",
            max_retries
        );
        alert_client
            .send_system_alert(&format!("SENSOR FAILED after {} retries.", max_retries))
            .await;
    } else {
        info!("Ingestion stopped");
    }
}

async fn ingest_frames<S: TrackletSource>(
    source: &mut S,
    config: &Config,
    tracker: &mut VehicleTracker,
    dispatcher: &mut AlertDispatcher,
    store: &DetectionStore,
    alert_client: &AlertClient,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<IngestEnd> {
    let fps = config.sensor.fps.max(0.1);
    let frame_interval = Duration::from_secs_f64(1.0 / fps);
    let mut frame_count: u64 = 0;

    loop {
        if *shutdown.borrow() {
            return Ok(IngestEnd::Shutdown);
        }

        let Some(frame) = source.next_frame()? else {
            return Ok(IngestEnd::StreamEnded);
        };
        frame_count += 1;

        let movement = tracker.update(&frame.tracklets);

        let presentation = store.presentation_config().unwrap_or_else(|e| {
            warn!("⚠️ Error reading presentation config: {}", e);
            PresentationConfig::default()
        });
        let attach_image = presentation.send_image
            && frame_count % image_cadence(fps, presentation.refresh_rate) == 0;

        let now = Local::now().naive_local();

        for obs in &frame.tracklets {
            if !matches!(obs.status, TrackletStatus::New | TrackletStatus::Tracked) {
                continue;
            }

            let (x_center, _) = obs.roi.centroid();
            let history = movement.get(&obs.id).map(Vec::as_slice).unwrap_or(&[]);

            match dispatcher.evaluate(obs.id, history, now) {
                AlertDecision::WrongWay => {
                    // Alerts carry the top edge of the box, matching what the
                    // dashboard draws the marker against
                    alert_client
                        .send_alert(&obs.id.to_string(), x_center, obs.roi.y1, WRONG_WAY_ALERT)
                        .await;
                }
                AlertDecision::WrongWayMarker => {
                    debug!("→ vehicle {} moving against traffic", obs.id);
                }
                AlertDecision::ContraryMarker => {
                    debug!("← vehicle {} moving with traffic", obs.id);
                }
                AlertDecision::None => {}
            }

            let detection =
                build_detection(obs, history, attach_image, frame.image.as_ref(), now);
            if let Err(e) = store.append(&detection) {
                error!("❌ Error saving detection: {}", e);
            }
        }

        if frame_count % 300 == 0 {
            info!(
                "Frame {}: {} active vehicle(s) tracked",
                frame_count,
                tracker.active_count()
            );
        }

        if sleep_or_shutdown(frame_interval, shutdown).await {
            return Ok(IngestEnd::Shutdown);
        }
    }
}

/// Frames between image attachments, from the dashboard-controlled refresh
/// rate.
fn image_cadence(fps: f64, refresh_rate: f64) -> u64 {
    ((fps * refresh_rate) as u64).max(1)
}

fn build_detection(
    obs: &Observation,
    history: &[Direction],
    attach_image: bool,
    image: Option<&Vec<u8>>,
    now: NaiveDateTime,
) -> Detection {
    let (x_position, y_position) = obs.roi.centroid();
    Detection {
        timestamp: now,
        vehicle_id: obs.id.to_string(),
        x_position,
        y_position,
        direction: history.last().copied().unwrap_or(Direction::Unknown),
        image: if attach_image { image.cloned() } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Region, TS_FORMAT};

    fn obs(id: u32) -> Observation {
        Observation {
            id,
            status: TrackletStatus::Tracked,
            roi: Region {
                x1: 100.0,
                y1: 200.0,
                x2: 140.0,
                y2: 240.0,
            },
        }
    }

    fn now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2024-03-01 09:00:00", TS_FORMAT).unwrap()
    }

    #[test]
    fn test_detection_uses_latest_label_and_centroid() {
        let history = [Direction::Undefined, Direction::Ascending];
        let detection = build_detection(&obs(12), &history, false, None, now());

        assert_eq!(detection.vehicle_id, "12");
        assert_eq!(detection.x_position, 120.0);
        assert_eq!(detection.y_position, 220.0);
        assert_eq!(detection.direction, Direction::Ascending);
        assert!(detection.image.is_none());
    }

    #[test]
    fn test_detection_without_history_is_unknown() {
        let detection = build_detection(&obs(3), &[], false, None, now());
        assert_eq!(detection.direction, Direction::Unknown);
    }

    #[test]
    fn test_image_attached_only_when_enabled() {
        let image = vec![0xff, 0xd8];
        let history = [Direction::Descending];

        let with = build_detection(&obs(1), &history, true, Some(&image), now());
        assert_eq!(with.image.as_deref(), Some(&[0xff, 0xd8][..]));

        let without = build_detection(&obs(1), &history, false, Some(&image), now());
        assert!(without.image.is_none());
    }

    #[test]
    fn test_image_cadence_never_zero() {
        assert_eq!(image_cadence(30.0, 0.5), 15);
        assert_eq!(image_cadence(30.0, 0.0), 1);
        assert_eq!(image_cadence(0.1, 0.1), 1);
    }
}
