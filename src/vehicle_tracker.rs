// src/vehicle_tracker.rs

use crate::ring_buffer::RingBuffer;
use crate::types::{Direction, Observation, TrackerConfig, TrackletStatus};
use std::collections::HashMap;
use tracing::{debug, info};

/// Consecutive LOST frames before a track is dropped.
const MAX_LOST_FRAMES: u32 = 10;

pub struct TrackedObject {
    pub id: u32,
    positions: RingBuffer<(f32, f32)>,
    direction_history: RingBuffer<Direction>,
    lost_count: u32,
}

impl TrackedObject {
    fn new(id: u32, max_history: usize, max_history_positions: usize) -> Self {
        Self {
            id,
            positions: RingBuffer::new(max_history),
            direction_history: RingBuffer::new(max_history_positions),
            lost_count: 0,
        }
    }
}

/// Per-id position tracker. Owns every live track; the ingestion loop feeds
/// it one frame of observations at a time and gets back the retained
/// direction history per id so streak policies can be evaluated downstream.
pub struct VehicleTracker {
    objects: HashMap<u32, TrackedObject>,
    threshold_dist_delta: f32,
    max_history: usize,
    max_history_positions: usize,
}

impl VehicleTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            objects: HashMap::new(),
            threshold_dist_delta: config.threshold_dist_delta,
            max_history: config.max_history,
            max_history_positions: config.max_history_positions,
        }
    }

    /// Process one frame of observations. Returns, per id observed this
    /// frame, the full retained direction history (not just the latest
    /// label).
    pub fn update(&mut self, observations: &[Observation]) -> HashMap<u32, Vec<Direction>> {
        let mut movement = HashMap::new();

        for obs in observations {
            match obs.status {
                TrackletStatus::New | TrackletStatus::Tracked => {
                    if obs.status == TrackletStatus::New {
                        info!("🆕 New vehicle tracked: ID #{}", obs.id);
                        self.objects.insert(
                            obs.id,
                            TrackedObject::new(obs.id, self.max_history, self.max_history_positions),
                        );
                    }

                    let threshold = self.threshold_dist_delta;
                    if let Some(track) = self.objects.get_mut(&obs.id) {
                        track.positions.push(obs.roi.centroid());
                        track.lost_count = 0;

                        let direction = classify_direction(&track.positions, threshold);
                        let label = match direction {
                            Direction::Ascending | Direction::Descending => direction,
                            _ => Direction::Undefined,
                        };
                        track.direction_history.push(label);
                        movement.insert(obs.id, track.direction_history.to_vec());
                    }
                }

                TrackletStatus::Lost => {
                    // A LOST update for an already-dropped id is a no-op.
                    if let Some(track) = self.objects.get_mut(&obs.id) {
                        track.lost_count += 1;
                        if track.lost_count > MAX_LOST_FRAMES {
                            info!(
                                "🗑️  Removing vehicle ID #{} - lost for {} frames",
                                obs.id, track.lost_count
                            );
                            self.objects.remove(&obs.id);
                        }
                    }
                }

                TrackletStatus::Removed => {
                    if self.objects.remove(&obs.id).is_some() {
                        debug!("🗑️  Vehicle ID #{} removed by sensor", obs.id);
                    }
                }
            }
        }

        movement
    }

    pub fn active_count(&self) -> usize {
        self.objects.len()
    }
}

/// Direction verdict over the full retained position window: compares the
/// first and last y coordinates, not consecutive points. Fewer than 2
/// samples, or a |deltaY| within the threshold, yields no verdict.
fn classify_direction(positions: &RingBuffer<(f32, f32)>, threshold: f32) -> Direction {
    if positions.len() < 2 {
        return Direction::Unknown;
    }

    let (_, y_start) = match positions.first() {
        Some(p) => *p,
        None => return Direction::Unknown,
    };
    let (_, y_end) = match positions.last() {
        Some(p) => *p,
        None => return Direction::Unknown,
    };

    let delta_y = y_end - y_start;
    if delta_y.abs() > threshold {
        if delta_y < 0.0 {
            Direction::Ascending
        } else {
            Direction::Descending
        }
    } else {
        Direction::Unknown
    }
}
