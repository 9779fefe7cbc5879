// crates/velocut-core/src/messages.rs
//
// The worker/host message protocol. Plain data, carried over a
// `crossbeam_channel` by `velocut_ingest::worker::WorkerOrchestrator` —
// this module only defines the shapes, not the transport.

use uuid::Uuid;

use crate::config::IngestSource;
use crate::frame::RawFrame;
use crate::Micros;

/// Monotonically increasing correlation id minted by the host registry.
/// Echoed back by the worker on request/response messages so the host can
/// resolve the matching pending call (and drop it after a 10s timeout).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

/// Host → worker.
pub enum HostMessage {
    Start {
        source: IngestSource,
    },
    SetTargetFps(u32),
    SetMemoryLimit(u64),
    GetPerformanceMetrics { request_id: RequestId },
    Cleanup,
    Terminate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertKind {
    ProcessingTime,
    Fps,
    Memory,
    FpsVariance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerformanceAlert {
    pub kind:      AlertKind,
    pub value:     f64,
    pub threshold: f64,
    pub severity:  Severity,
}

/// Aggregated metrics snapshot, returned in response to
/// `HostMessage::GetPerformanceMetrics`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerformanceSnapshot {
    pub processing_ms_last:    f64,
    pub processing_ms_min:     f64,
    pub processing_ms_max:     f64,
    pub processing_ms_average: f64,
    pub dropped_frames:        u64,
    pub total_frames:          u64,
    pub output_fps:            f64,
    pub output_fps_stddev:     f64,
    pub memory_current_bytes:  u64,
    pub memory_peak_bytes:     u64,
    pub memory_average_bytes:  f64,
    pub gc_event_count:        u64,
    pub quality_average:       f64,
}

/// Worker → host.
pub enum WorkerMessage {
    WorkerReady {
        /// Id of the worker session that sent this message — one `Uuid` per
        /// pipeline run, tagging every worker-originated message.
        session_id:    Uuid,
        target_fps:    u32,
        memory_limit:  u64,
    },
    StartProcessing {
        duration_ms:            f64,
        width:                  u32,
        height:                 u32,
        target_fps:             u32,
        source_fps_estimate:    f64,
        expected_output_frames: u64,
    },
    FrameProcessed {
        index:         u64,
        ts_us:         Micros,
        frame_rate:    f64,
        memory_bytes:  u64,
        buffer_size:   usize,
        frame:         RawFrame,
    },
    MemoryWarning {
        current_bytes:    u64,
        max_bytes:        u64,
        requested_bytes:  u64,
        cleanup_performed: bool,
    },
    PerformanceAlertBatch(Vec<PerformanceAlert>),
    PerformanceMetrics {
        request_id: RequestId,
        snapshot:   PerformanceSnapshot,
    },
    Error {
        message: String,
        context: String,
    },
    CleanupComplete {
        ts_us: Micros,
    },
}
