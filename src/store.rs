// src/store.rs
//
// Local durable detection log, backed by a single SQLite file. Every
// operation is one short transaction: open, act, commit, close. The file is
// shared between the ingestion writer, the synchronizer reader/deleter and
// the retention updater, so nothing here holds a connection across calls.

use crate::types::{Detection, Direction, TS_FORMAT};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("malformed timestamp in detections row: {0}")]
    Timestamp(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Presentation settings written by the dashboard collaborator and read per
/// frame by the ingestion task.
#[derive(Debug, Clone, Copy)]
pub struct PresentationConfig {
    pub send_image: bool,
    pub refresh_rate: f64,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            send_image: false,
            refresh_rate: 0.5,
        }
    }
}

/// A detection row read back from the log, with its rowid.
#[derive(Debug, Clone)]
pub struct StoredDetection {
    pub id: i64,
    pub detection: Detection,
}

#[derive(Clone)]
pub struct DetectionStore {
    db_path: PathBuf,
}

impl DetectionStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    fn open(&self) -> StoreResult<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    /// Create the schema and seed the singleton config row. Safe to call on
    /// every startup.
    pub fn ensure_schema(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS detections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT,
                vehicle_id TEXT,
                x_position REAL,
                y_position REAL,
                direction TEXT,
                image BLOB
            );
            CREATE TABLE IF NOT EXISTS config (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                send_image BOOLEAN,
                refresh_rate REAL
            );",
        )?;

        let config_rows: i64 = conn.query_row("SELECT COUNT(*) FROM config", [], |r| r.get(0))?;
        if config_rows == 0 {
            conn.execute(
                "INSERT INTO config (send_image, refresh_rate) VALUES (?1, ?2)",
                params![false, 0.5],
            )?;
        }
        Ok(())
    }

    pub fn append(&self, detection: &Detection) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO detections (timestamp, vehicle_id, x_position, y_position, direction, image)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                detection.timestamp.format(TS_FORMAT).to_string(),
                detection.vehicle_id,
                detection.x_position,
                detection.y_position,
                detection.direction.as_str(),
                detection.image,
            ],
        )?;
        debug!(
            "✅ Detection saved: {} at ({}, {}) moving {}",
            detection.vehicle_id,
            detection.x_position,
            detection.y_position,
            detection.direction.as_str()
        );
        Ok(())
    }

    /// All detections with `from <= timestamp < to`, oldest first.
    pub fn query_range(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> StoreResult<Vec<StoredDetection>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, vehicle_id, x_position, y_position, direction, image
             FROM detections WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp",
        )?;

        let rows = stmt.query_map(
            params![
                from.format(TS_FORMAT).to_string(),
                to.format(TS_FORMAT).to_string()
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f32>(3)?,
                    row.get::<_, f32>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<Vec<u8>>>(6)?,
                ))
            },
        )?;

        let mut detections = Vec::new();
        for row in rows {
            let (id, ts, vehicle_id, x_position, y_position, direction, image) = row?;
            let timestamp = NaiveDateTime::parse_from_str(&ts, TS_FORMAT)
                .map_err(|_| StoreError::Timestamp(ts))?;
            detections.push(StoredDetection {
                id,
                detection: Detection {
                    timestamp,
                    vehicle_id,
                    x_position,
                    y_position,
                    direction: Direction::parse(&direction),
                    image,
                },
            });
        }
        Ok(detections)
    }

    /// Delete all detections with `timestamp < to`. Returns the number of
    /// rows removed. Only the synchronizer calls this, and only after a
    /// confirmed upload.
    pub fn delete_before(&self, to: NaiveDateTime) -> StoreResult<usize> {
        let conn = self.open()?;
        let deleted = conn.execute(
            "DELETE FROM detections WHERE timestamp < ?1",
            params![to.format(TS_FORMAT).to_string()],
        )?;
        Ok(deleted)
    }

    /// Null out aged image payloads; the rows themselves stay. With
    /// `keep_contrary` set, images of vehicles travelling `wrong_direction`
    /// survive past the horizon. Returns the number of rows touched.
    pub fn clear_images_before(
        &self,
        threshold: NaiveDateTime,
        keep_contrary: bool,
        wrong_direction: Direction,
    ) -> StoreResult<usize> {
        let conn = self.open()?;
        let threshold = threshold.format(TS_FORMAT).to_string();
        let cleared = if keep_contrary {
            conn.execute(
                "UPDATE detections SET image = NULL WHERE direction != ?1 AND timestamp < ?2",
                params![wrong_direction.as_str(), threshold],
            )?
        } else {
            conn.execute(
                "UPDATE detections SET image = NULL WHERE timestamp < ?1",
                params![threshold],
            )?
        };
        Ok(cleared)
    }

    /// The `{send_image, refresh_rate}` singleton row.
    pub fn presentation_config(&self) -> StoreResult<PresentationConfig> {
        let conn = self.open()?;
        let config = conn.query_row(
            "SELECT send_image, refresh_rate FROM config WHERE id = 1",
            [],
            |row| {
                Ok(PresentationConfig {
                    send_image: row.get(0)?,
                    refresh_rate: row.get(1)?,
                })
            },
        )?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, DetectionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DetectionStore::new(dir.path().join("detections.db"));
        store.ensure_schema().unwrap();
        (dir, store)
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TS_FORMAT).unwrap()
    }

    fn detection(time: &str, direction: Direction, image: Option<Vec<u8>>) -> Detection {
        Detection {
            timestamp: ts(time),
            vehicle_id: "7".to_string(),
            x_position: 120.0,
            y_position: 340.0,
            direction,
            image,
        }
    }

    #[test]
    fn test_schema_is_idempotent() {
        let (_dir, store) = test_store();
        store.ensure_schema().unwrap();
        store.ensure_schema().unwrap();

        // Seeded config row survives repeated initialization
        let config = store.presentation_config().unwrap();
        assert!(!config.send_image);
        assert_eq!(config.refresh_rate, 0.5);
    }

    #[test]
    fn test_append_query_roundtrip() {
        let (_dir, store) = test_store();
        store
            .append(&detection(
                "2024-03-01 09:00:00",
                Direction::Ascending,
                Some(vec![0xff, 0xd8, 0xff]),
            ))
            .unwrap();

        let rows = store
            .query_range(ts("2024-03-01 08:00:00"), ts("2024-03-01 10:00:00"))
            .unwrap();
        assert_eq!(rows.len(), 1);
        let got = &rows[0].detection;
        assert_eq!(got.timestamp, ts("2024-03-01 09:00:00"));
        assert_eq!(got.vehicle_id, "7");
        assert_eq!(got.direction, Direction::Ascending);
        assert_eq!(got.image.as_deref(), Some(&[0xff, 0xd8, 0xff][..]));
    }

    #[test]
    fn test_query_range_is_half_open() {
        let (_dir, store) = test_store();
        for time in ["2024-03-01 09:00:00", "2024-03-01 09:05:00", "2024-03-01 09:10:00"] {
            store
                .append(&detection(time, Direction::Descending, None))
                .unwrap();
        }

        let rows = store
            .query_range(ts("2024-03-01 09:00:00"), ts("2024-03-01 09:10:00"))
            .unwrap();
        let times: Vec<_> = rows.iter().map(|r| r.detection.timestamp).collect();
        assert_eq!(times, vec![ts("2024-03-01 09:00:00"), ts("2024-03-01 09:05:00")]);
    }

    #[test]
    fn test_delete_before_spares_newer_rows() {
        let (_dir, store) = test_store();
        for time in ["2024-03-01 09:00:00", "2024-03-01 09:05:00", "2024-03-01 09:10:00"] {
            store
                .append(&detection(time, Direction::Ascending, None))
                .unwrap();
        }

        let deleted = store.delete_before(ts("2024-03-01 09:06:00")).unwrap();
        assert_eq!(deleted, 2);

        let remaining = store
            .query_range(ts("2024-03-01 00:00:00"), ts("2024-03-02 00:00:00"))
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].detection.timestamp, ts("2024-03-01 09:10:00"));
    }

    #[test]
    fn test_clear_images_keeps_wrong_direction_evidence() {
        let (_dir, store) = test_store();
        store
            .append(&detection(
                "2024-03-01 09:00:00",
                Direction::Ascending,
                Some(vec![1]),
            ))
            .unwrap();
        store
            .append(&detection(
                "2024-03-01 09:00:01",
                Direction::Descending,
                Some(vec![2]),
            ))
            .unwrap();

        let cleared = store
            .clear_images_before(ts("2024-03-01 10:00:00"), true, Direction::Ascending)
            .unwrap();
        assert_eq!(cleared, 1);

        let rows = store
            .query_range(ts("2024-03-01 00:00:00"), ts("2024-03-02 00:00:00"))
            .unwrap();
        // Ascending (wrong way) keeps its image, descending loses it
        assert!(rows
            .iter()
            .find(|r| r.detection.direction == Direction::Ascending)
            .unwrap()
            .detection
            .image
            .is_some());
        assert!(rows
            .iter()
            .find(|r| r.detection.direction == Direction::Descending)
            .unwrap()
            .detection
            .image
            .is_none());
    }

    #[test]
    fn test_clear_images_without_keep_contrary_clears_all_aged() {
        let (_dir, store) = test_store();
        store
            .append(&detection(
                "2024-03-01 09:00:00",
                Direction::Ascending,
                Some(vec![1]),
            ))
            .unwrap();
        // Newer than the threshold: untouched either way
        store
            .append(&detection(
                "2024-03-01 11:00:00",
                Direction::Descending,
                Some(vec![2]),
            ))
            .unwrap();

        store
            .clear_images_before(ts("2024-03-01 10:00:00"), false, Direction::Ascending)
            .unwrap();

        let rows = store
            .query_range(ts("2024-03-01 00:00:00"), ts("2024-03-02 00:00:00"))
            .unwrap();
        assert!(rows[0].detection.image.is_none());
        assert!(rows[1].detection.image.is_some());

        // Rows survive image clearing
        assert_eq!(rows.len(), 2);
    }
}
