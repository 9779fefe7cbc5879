// crates/velocut-core/src/lib.rs
//
// Plain data types that cross the worker/host boundary of the ingest
// pipeline. No I/O, no FFmpeg, no threading — just the shapes that travel
// over the channel.

pub mod chunk;
pub mod config;
pub mod frame;
pub mod messages;
pub mod slot;

pub use chunk::{ChunkKind, DecoderConfig, EncodedChunk};
pub use config::{IngestConfig, IngestSource, PerformanceAlertThresholds};
pub use frame::{BufferStats, FrameClosed, FrameMeta, ManagedFrameMeta, PixelFormat, RawFrame};
pub use messages::{
    AlertKind, HostMessage, PerformanceAlert, PerformanceSnapshot, RequestId, Severity,
    WorkerMessage,
};
pub use slot::{FrameSlot, SlotQuality};

/// Timestamp in microseconds. Plain type alias — not a newtype; the rest of
/// this crate works directly in bare `i64`/`f64` timestamps rather than
/// wrapper types.
pub type Micros = i64;

/// Counters describing the pipeline's lifetime progress.
///
/// `current_memory_bytes` is the only non-monotonic field — it rises and
/// falls with `FrameBufferManager` reclamation. Everything else only grows.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PipelineState {
    pub frames_in:           u64,
    pub frames_out:          u64,
    pub dropped:             u64,
    pub current_memory_bytes: u64,
    pub source_fps_estimate: f64,
    pub uptime_secs:         f64,
}
