// crates/velocut-core/src/config.rs
//
// Recognized configuration keys collected into one serde-serializable
// struct with defaults matching the documented tuning values. Constructed
// in-process by the host — there is no on-disk persistence implied here.

use std::path::PathBuf;
use serde::{Deserialize, Serialize};

/// Where the demuxer reads container bytes from.
#[derive(Clone, Debug)]
pub enum IngestSource {
    /// A file already fully on disk.
    File(PathBuf),
    /// Progressively appended byte buffers (e.g. a download in flight).
    /// Each append is spooled to a temp file; `Demuxer` tracks the spool's
    /// `file_start` offset across appends.
    Bytes(Vec<u8>),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAlertThresholds {
    pub max_processing_ms:   f64,
    pub min_fps:             f64,
    pub max_memory_bytes:    u64,
    pub max_fps_variance_ms: f64,
}

impl Default for PerformanceAlertThresholds {
    fn default() -> Self {
        Self {
            max_processing_ms:   50.0,
            min_fps:             20.0,
            max_memory_bytes:    100 * 1024 * 1024,
            max_fps_variance_ms: 10.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Output cadence. Positive integer, default 24.
    pub target_fps: u32,
    /// `emit_best` is forced whenever the buffer reaches this size.
    pub max_buffer_size: usize,
    /// Soft cap enforced by reclamation plus a `MemoryWarning`.
    pub max_memory_bytes: u64,
    /// Phase 1 sampling rate for the progressive grid.
    pub reduced_fps: u32,
    /// Slots processed per cooperative yield in the progressive grid.
    pub chunk_size: usize,
    /// Per-slot seek deadline in the progressive grid, milliseconds.
    pub seek_timeout_ms: u64,
    /// Trigger for drift correction, microseconds.
    pub max_drift_micros: i64,
    /// Cap on per-tick drift correction, as a fraction of `target_interval`.
    pub drift_correction_fraction: f64,
    /// Scoring weight on temporal proximity. Must sum with `quality_weight`
    /// to 1.0.
    pub time_weight: f64,
    /// Scoring weight on decode-time quality.
    pub quality_weight: f64,
    pub performance_alert_thresholds: PerformanceAlertThresholds,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            target_fps:               24,
            max_buffer_size:          10,
            max_memory_bytes:         100 * 1024 * 1024,
            reduced_fps:              12,
            chunk_size:               30,
            seek_timeout_ms:          500,
            max_drift_micros:         5_000,
            drift_correction_fraction: 0.1,
            time_weight:              0.7,
            quality_weight:           0.3,
            performance_alert_thresholds: PerformanceAlertThresholds::default(),
        }
    }
}

impl IngestConfig {
    /// `1e6 / target_fps` — the spacing between emitted frames, in µs.
    pub fn target_interval_us(&self) -> i64 {
        (1_000_000.0 / self.target_fps as f64).round() as i64
    }
}
