// src/sensor.rs
//
// Seam to the upstream tracking sensor. The node never reaches into the
// sensor; it consumes whole frames of tracklet observations through
// `TrackletSource`. A hardware driver implements the trait out of tree; the
// replay source here feeds recorded captures back through the same path.

use crate::types::{SensorConfig, TrackletFrame};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;
use tracing::{info, warn};
use walkdir::WalkDir;

pub trait TrackletSource: Send {
    /// Establish (or re-establish) the upstream stream.
    fn connect(&mut self) -> Result<()>;

    /// Next frame of observations. Ok(None) means the stream ended cleanly.
    fn next_frame(&mut self) -> Result<Option<TrackletFrame>>;
}

/// Replays recorded tracklet captures: every `*.jsonl` file under the input
/// directory, one `TrackletFrame` per line, files in path order.
pub struct ReplaySource {
    input_dir: String,
    files: Vec<PathBuf>,
    file_idx: usize,
    reader: Option<Lines<BufReader<File>>>,
}

impl ReplaySource {
    pub fn new(config: &SensorConfig) -> Self {
        Self {
            input_dir: config.input_dir.clone(),
            files: Vec::new(),
            file_idx: 0,
            reader: None,
        }
    }
}

impl TrackletSource for ReplaySource {
    fn connect(&mut self) -> Result<()> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.input_dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.extension().map(|ext| ext == "jsonl").unwrap_or(false) {
                files.push(path.to_path_buf());
            }
        }
        files.sort();

        if files.is_empty() {
            anyhow::bail!("No tracklet capture files found in {}", self.input_dir);
        }
        info!("Found {} tracklet capture file(s)", files.len());

        self.files = files;
        self.file_idx = 0;
        self.reader = None;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<TrackletFrame>> {
        loop {
            if self.reader.is_none() {
                let Some(path) = self.files.get(self.file_idx) else {
                    return Ok(None);
                };
                info!("Replaying capture: {}", path.display());
                let file = File::open(path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                self.reader = Some(BufReader::new(file).lines());
                self.file_idx += 1;
            }

            if let Some(reader) = self.reader.as_mut() {
                match reader.next() {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<TrackletFrame>(&line) {
                            Ok(frame) => return Ok(Some(frame)),
                            Err(e) => {
                                // A corrupt line costs one frame, not the replay
                                warn!("⚠️ Skipping malformed capture line: {}", e);
                                continue;
                            }
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        self.reader = None;
                        continue;
                    }
                }
            }
        }
    }
}
