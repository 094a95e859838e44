// src/alert.rs
//
// Streak-based alert policy plus the outward alert delivery client.
// Delivery is fire-and-forget: a failed POST is logged and dropped, because
// the streak condition keeps re-triggering on subsequent frames while the
// vehicle is still travelling the wrong way.

use crate::types::{AlertsConfig, Direction, TS_FORMAT};
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{error, info, warn};

pub const WRONG_WAY_ALERT: &str = "wrong_direction";

/// Outcome of evaluating one id's direction history for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    /// Streak condition met: deliver an outward wrong-direction alert.
    WrongWay,
    /// Latest label is the wrong direction; presentation marker only.
    WrongWayMarker,
    /// Latest label is the contrary (expected) direction; marker only.
    ContraryMarker,
    None,
}

pub struct AlertDispatcher {
    wrong_direction: Direction,
    contrary_direction: Direction,
    streak_threshold: usize,
    /// None fires on every frame the streak condition holds.
    suppression: Option<ChronoDuration>,
    last_alert: HashMap<u32, NaiveDateTime>,
}

impl AlertDispatcher {
    pub fn new(config: &AlertsConfig) -> Self {
        let contrary_direction = match config.wrong_direction {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
            other => other,
        };
        let suppression = if config.suppression_secs > 0 {
            Some(ChronoDuration::seconds(config.suppression_secs as i64))
        } else {
            None
        };
        Self {
            wrong_direction: config.wrong_direction,
            contrary_direction,
            streak_threshold: config.streak_threshold,
            suppression,
            last_alert: HashMap::new(),
        }
    }

    /// Evaluate the retained direction history for one id. Precedence:
    /// streak alert, then wrong-way marker, then contrary marker.
    pub fn evaluate(&mut self, id: u32, history: &[Direction], now: NaiveDateTime) -> AlertDecision {
        let wrong_count = history
            .iter()
            .filter(|d| **d == self.wrong_direction)
            .count();

        if wrong_count >= self.streak_threshold {
            if let Some(window) = self.suppression {
                if let Some(last) = self.last_alert.get(&id) {
                    if now - *last < window {
                        // Still inside the cooldown: downgrade to a marker
                        return AlertDecision::WrongWayMarker;
                    }
                }
            }
            // TODO: prune last_alert entries for ids the tracker has dropped
            self.last_alert.insert(id, now);
            return AlertDecision::WrongWay;
        }

        match history.last() {
            Some(d) if *d == self.wrong_direction => AlertDecision::WrongWayMarker,
            Some(d) if *d == self.contrary_direction => AlertDecision::ContraryMarker,
            _ => AlertDecision::None,
        }
    }
}

#[derive(Debug, Serialize)]
struct AlertPayload {
    timestamp: String,
    vehicle_id: String,
    x_position: f32,
    y_position: f32,
    alert: String,
}

/// Client for the central alert endpoint.
#[derive(Clone)]
pub struct AlertClient {
    http_client: reqwest::Client,
    alert_url: String,
}

impl AlertClient {
    pub fn new(alert_url: String, timeout_secs: u64) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http_client,
            alert_url,
        })
    }

    /// Deliver one alert. Never retried here; failures are logged only.
    pub async fn send_alert(&self, vehicle_id: &str, x_pos: f32, y_pos: f32, alert_type: &str) {
        let payload = AlertPayload {
            timestamp: Local::now().naive_local().format(TS_FORMAT).to_string(),
            vehicle_id: vehicle_id.to_string(),
            x_position: x_pos,
            y_position: y_pos,
            alert: alert_type.to_string(),
        };

        match self
            .http_client
            .post(&self.alert_url)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!(
                    "🔔 Alert sent: {} for vehicle {}",
                    payload.alert, payload.vehicle_id
                );
            }
            Ok(response) => {
                warn!(
                    "⚠️ Alert failed to send (status {}): {} for vehicle {}",
                    response.status(),
                    payload.alert,
                    payload.vehicle_id
                );
            }
            Err(_) => {
                error!(
                    "❌ Alert could not be sent due to network error: {} for vehicle {}",
                    payload.alert, payload.vehicle_id
                );
            }
        }
    }

    /// Task-failure alerts share the alert channel with a reserved id.
    pub async fn send_system_alert(&self, alert_type: &str) {
        self.send_alert("SYSTEM", 0.0, 0.0, alert_type).await;
    }
}
