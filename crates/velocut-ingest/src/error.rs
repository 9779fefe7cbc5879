// crates/velocut-ingest/src/error.rs
//
// Public error taxonomy. Fatal conditions are `Err(IngestError)` returned
// from the call that detected them; non-fatal/informational conditions (a
// decode error that gets recovered, `FrameInvalid`, `SeekTimeout`,
// `MemoryWarning`, `PerformanceAlert`) travel as `WorkerMessage` variants
// instead.
//
// Internal plumbing still returns `anyhow::Result`; `IngestError` is what
// crosses the crate's public boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("frame already closed")]
    FrameInvalid,

    #[error("seek timed out for slot {slot}")]
    SeekTimeout { slot: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<velocut_core::FrameClosed> for IngestError {
    fn from(_: velocut_core::FrameClosed) -> Self {
        IngestError::FrameInvalid
    }
}
