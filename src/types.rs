use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Timestamp format shared with the central store and the SQLite log.
/// Lexicographic order on this format matches chronological order.
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub application: ApplicationConfig,
    pub tracker: TrackerConfig,
    pub alerts: AlertsConfig,
    pub sensor: SensorConfig,
    pub data: DataConfig,
    pub sync: SyncConfig,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub api_alert_url: String,
    pub api_batch_url: String,
    pub api_last_upload_url: String,
    /// Sensor connect attempts before the ingestion task gives up for good.
    pub max_retries: u32,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Minimum |deltaY| over the retained window to commit to a direction.
    pub threshold_dist_delta: f32,
    /// Capacity of the per-object position history.
    pub max_history: usize,
    /// Capacity of the per-object direction-label history.
    pub max_history_positions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Which label counts as travelling the wrong way. "ascending" vs
    /// "descending" is a convention of the sensor's coordinate frame.
    #[serde(default = "default_wrong_direction")]
    pub wrong_direction: Direction,
    /// Wrong-direction labels in the retained window needed for an alert.
    #[serde(default = "default_streak_threshold")]
    pub streak_threshold: usize,
    /// Per-id cooldown for repeated wrong-way alerts. 0 fires every frame
    /// the streak condition holds.
    #[serde(default)]
    pub suppression_secs: u64,
}

fn default_wrong_direction() -> Direction {
    Direction::Ascending
}

fn default_streak_threshold() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Directory scanned for *.jsonl tracklet captures by the replay source.
    pub input_dir: String,
    pub fps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub db_path: String,
    pub status_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub interval_secs: u64,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_retry_backoff_secs() -> u64 {
    300
}

fn default_cooldown_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub interval_secs: u64,
    pub keep_contrary_images: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Direction of travel along the sensor's y axis. `Unknown` means the
/// classifier has no verdict right now; `Undefined` is what gets recorded
/// into a track's label history when no verdict was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ascending,
    Descending,
    Unknown,
    Undefined,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ascending => "ascending",
            Self::Descending => "descending",
            Self::Unknown => "unknown",
            Self::Undefined => "undefined",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ascending" => Self::Ascending,
            "descending" => Self::Descending,
            "undefined" => Self::Undefined,
            _ => Self::Unknown,
        }
    }
}

/// Tracking status reported by the upstream sensor for one tracklet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrackletStatus {
    New,
    Tracked,
    Lost,
    Removed,
}

/// Bounding region of a tracklet, in sensor pixel coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Region {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Region {
    /// Midpoint of the bounding region, used as the position sample.
    pub fn centroid(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// One tracked-object observation within a frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: u32,
    pub status: TrackletStatus,
    pub roi: Region,
}

/// A frame's worth of observations from the sensor collaborator, plus the
/// JPEG-encoded frame when the sensor delivers one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackletFrame {
    pub tracklets: Vec<Observation>,
    #[serde(default)]
    pub image: Option<Vec<u8>>,
}

/// One detection row as written to the local durable log. Written once per
/// observation event; only the retention purger ever touches it afterwards,
/// and only to null the image payload.
#[derive(Debug, Clone)]
pub struct Detection {
    pub timestamp: NaiveDateTime,
    pub vehicle_id: String,
    pub x_position: f32,
    pub y_position: f32,
    pub direction: Direction,
    pub image: Option<Vec<u8>>,
}
