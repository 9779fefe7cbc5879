// crates/velocut-core/src/frame.rs
//
// The frame type that flows from the Decoder through the FrameBufferManager
// and FrameRateController to the consumer. Kept dependency-free (no FFmpeg,
// no rendering surface) — carries only plain RGBA bytes across the
// worker/host boundary.

use std::fmt;
use std::sync::Arc;

use crate::Micros;

/// Only pixel format the pipeline hands to consumers. Source formats are
/// converted to this by the decoder's internal scaler before a `RawFrame`
/// is ever constructed — mirrors `decode.rs`, which always scales to
/// `Pixel::RGBA` before the rest of the app sees a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
}

/// A decoded frame has been accessed after `close()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameClosed;

impl fmt::Display for FrameClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame already closed")
    }
}

impl std::error::Error for FrameClosed {}

/// A decoded video frame with an explicit, idempotent `close()` capability.
///
/// The pixel payload is `Arc`-shared so that constructing "a new frame view
/// over the same image data" (the operation `FrameRateController::emit_best`
/// performs when it rewrites a timestamp) is a cheap clone, never a copy.
/// `close()` drops this crate's reference to the payload; once every clone
/// has been closed the underlying buffer is freed.
#[derive(Clone)]
pub struct RawFrame {
    pub pts_us:          Micros,
    pub coded_width:      u32,
    pub coded_height:     u32,
    pub display_width:    u32,
    pub display_height:   u32,
    pub format:          PixelFormat,
    data: Option<Arc<Vec<u8>>>,
}

impl RawFrame {
    pub fn new(
        pts_us: Micros,
        coded_width: u32,
        coded_height: u32,
        display_width: u32,
        display_height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Self {
        Self {
            pts_us,
            coded_width,
            coded_height,
            display_width,
            display_height,
            format,
            data: Some(Arc::new(data)),
        }
    }

    /// Close this handle. Calling `close()` more than once is a silent
    /// no-op by design — producers and the buffer manager may both close
    /// the same logical frame (see `FrameBufferManager::release`).
    pub fn close(&mut self) {
        self.data = None;
    }

    pub fn is_closed(&self) -> bool {
        self.data.is_none()
    }

    /// Borrow the RGBA payload. Fails with `FrameClosed` once `close()` has
    /// been called on this handle (or the handle it was cloned from, if the
    /// underlying `Arc` was dropped through that path).
    pub fn data(&self) -> Result<&[u8], FrameClosed> {
        self.data.as_deref().map(|v| v.as_slice()).ok_or(FrameClosed)
    }

    /// Conservative byte-size estimate used by `FrameBufferManager`:
    /// `display_width * display_height * 4` (RGBA8), falling back to a
    /// 1920x1080 upper bound when dimensions are zero/missing. YUV sources
    /// are smaller in reality; the over-count is intentional, trading a
    /// little headroom for simplicity in the reclamation accounting.
    pub fn estimated_size_bytes(&self) -> u64 {
        if self.display_width == 0 || self.display_height == 0 {
            1920 * 1080 * 4
        } else {
            self.display_width as u64 * self.display_height as u64 * 4
        }
    }

    /// Construct a new view over the same image data with a rewritten
    /// presentation timestamp. Fails with `FrameClosed` if this handle's
    /// payload has already been released.
    pub fn with_timestamp(&self, pts_us: Micros) -> Result<Self, FrameClosed> {
        if self.is_closed() {
            return Err(FrameClosed);
        }
        Ok(Self { pts_us, ..self.clone() })
    }
}

/// Hint passed alongside a frame on `FrameBufferManager::acquire` —
/// currently just the decode-time quality score consulted by
/// `FrameRateController::emit_best`.
#[derive(Clone, Copy, Debug)]
pub struct FrameMeta {
    pub quality: f32,
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self { quality: 1.0 }
    }
}

/// Read-only accounting snapshot returned by `FrameBufferManager::stats()`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BufferStats {
    pub active:       usize,
    pub current_bytes: u64,
    pub max_bytes:     u64,
    pub utilisation:   f64,
}

/// Metadata mirrored back to the host for a live `ManagedFrame`, without
/// exposing the frame payload itself. `id` is the monotonic handle minted
/// by `FrameBufferManager::acquire`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ManagedFrameMeta {
    pub id:         u64,
    pub size_bytes: u64,
    pub ref_count:  u32,
    pub pinned:     bool,
}
