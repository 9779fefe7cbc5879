// crates/velocut-ingest/src/lib.rs

pub mod buffer;
pub mod decoder;
pub mod demux;
pub mod error;
pub mod performance;
pub mod progressive;
pub mod rate_controller;
pub mod timestamp;
pub mod worker;
mod helpers; // internal — not pub, not re-exported

pub use buffer::{FrameBufferManager, MemoryWarning};
pub use decoder::{FfmpegVideoDecoder, VideoDecoder};
pub use demux::{DemuxState, Demuxer, ReadyInfo, TrackInfo};
pub use error::IngestError;
pub use performance::PerformanceMonitor;
pub use progressive::{FfmpegFrameSource, FrameSource, ProgressiveFrameGrid};
pub use rate_controller::{EmitMeta, FrameRateController};
pub use timestamp::TimestampCalculator;
pub use worker::WorkerOrchestrator;
pub use velocut_core::PipelineState;
