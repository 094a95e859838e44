// src/health.rs
//
// Task health surface. In-process state lives in per-task atomics; the YAML
// status file is the single external representation read by dashboards and
// other processes. The file is one shared blob, so its read-modify-write is
// guarded by one lock.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub const TASK_CAMERA_SERVICE: &str = "camera_service";
pub const TASK_SEND_HOURLY_DATA: &str = "send_hourly_data";
pub const TASK_DELETE_OLD_IMAGES: &str = "delete_old_images";

struct Inner {
    path: PathBuf,
    file_lock: Mutex<()>,
    states: BTreeMap<&'static str, AtomicBool>,
}

#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<Inner>,
}

impl StatusBoard {
    pub fn new(path: impl Into<PathBuf>, tasks: &[&'static str]) -> Self {
        let states = tasks
            .iter()
            .map(|name| (*name, AtomicBool::new(false)))
            .collect();
        Self {
            inner: Arc::new(Inner {
                path: path.into(),
                file_lock: Mutex::new(()),
                states,
            }),
        }
    }

    /// Seed the file with every known task stopped. Called once at startup
    /// so dashboards never read stale state from a previous run.
    pub fn reset_all(&self) {
        for name in self.inner.states.keys() {
            self.set(name, false);
        }
        info!("🔄 Status file initialized at {}", self.inner.path.display());
    }

    pub fn set_running(&self, task: &str) {
        self.set(task, true);
    }

    pub fn set_stopped(&self, task: &str) {
        self.set(task, false);
    }

    pub fn is_running(&self, task: &str) -> bool {
        self.inner
            .states
            .get(task)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn set(&self, task: &str, running: bool) {
        if let Some(flag) = self.inner.states.get(task) {
            flag.store(running, Ordering::Relaxed);
        }
        if let Err(e) = self.persist(task, running) {
            warn!("⚠️ Failed to persist status for {}: {}", task, e);
        }
    }

    /// Read-modify-write of the whole status map, under the shared lock.
    fn persist(&self, task: &str, running: bool) -> anyhow::Result<()> {
        let _guard = self
            .inner
            .file_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut map: BTreeMap<String, u8> = match fs::read_to_string(&self.inner.path) {
            Ok(contents) => serde_yaml::from_str(&contents).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        };
        map.insert(task.to_string(), u8::from(running));
        fs::write(&self.inner.path, serde_yaml::to_string(&map)?)?;
        Ok(())
    }
}
