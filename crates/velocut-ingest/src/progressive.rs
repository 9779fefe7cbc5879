// crates/velocut-ingest/src/progressive.rs
//
// ProgressiveFrameGrid — seek-based extraction fallback for when no fast
// demux/decode pipeline is available. Builds a fixed-length grid of
// `FrameSlot`s, fills it coarsely at a reduced rate for immediate playback
// (Phase 1), then upgrades every slot to full quality in the background
// (Phase 2).
//
// Seeking is abstracted behind `FrameSource` the same way decoding is
// abstracted behind `VideoDecoder` — the production implementation,
// `FfmpegFrameSource`, uses a one-shot seek-decode-scale: a second `Input`
// context is opened purely to construct the decoder, which avoids the
// parameters-borrow conflict against the context used for seeking.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result as AnyResult};
use ffmpeg_the_third as ffmpeg;
use ffmpeg_the_third::format::Pixel;
use ffmpeg_the_third::media::Type;
use ffmpeg_the_third::software::scaling::{flag::Flags, context::Context as SwsContext};

use velocut_core::{FrameSlot, PixelFormat, RawFrame, SlotQuality};

use crate::error::IngestError;
use crate::helpers::seek::seek_to_secs;

/// Seek-and-decode capability consulted by the grid. `timeout` is enforced
/// as a deadline check between decoded frames, not true call cancellation —
/// FFmpeg's blocking API offers no cancellation point.
pub trait FrameSource {
    fn seek_and_decode(&mut self, target_secs: f64, timeout: Duration) -> Option<RawFrame>;
}

/// Concrete `FrameSource` over a file path. Opens two `Input` contexts per
/// call — one to seek, one to build the decoder — and tears both down
/// afterward since grid seeks are infrequent and not on a playback-rate hot
/// path.
pub struct FfmpegFrameSource {
    path: std::path::PathBuf,
}

impl FfmpegFrameSource {
    pub fn new(path: std::path::PathBuf) -> Self {
        Self { path }
    }
}

impl FrameSource for FfmpegFrameSource {
    fn seek_and_decode(&mut self, target_secs: f64, timeout: Duration) -> Option<RawFrame> {
        match self.try_seek_and_decode(target_secs, timeout) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::debug!(target_secs, error = %e, "progressive grid slot produced no frame");
                None
            }
        }
    }
}

impl FfmpegFrameSource {
    /// Internal fallible body of `seek_and_decode` — plain `anyhow::Result`
    /// plumbed with `?` and `anyhow!` for ad-hoc failures, converted to
    /// `Option` only at the trait boundary `FrameSource` exposes to the grid.
    fn try_seek_and_decode(&mut self, target_secs: f64, timeout: Duration) -> AnyResult<RawFrame> {
        let deadline = Instant::now() + timeout;

        let mut ictx = ffmpeg::format::input(&self.path)?;
        let video_stream_index = ictx.streams().best(Type::Video)
            .ok_or_else(|| anyhow!("no video stream"))?
            .index();

        let seeked = seek_to_secs(&mut ictx, target_secs, "progressive-grid");
        if !seeked {
            tracing::debug!(target_secs, "progressive grid seek soft-failed, decoding from current position");
        }

        // Second context for decoder construction — Parameters borrows from
        // Stream/ictx, so the decoder needs its own context to avoid fighting
        // the seek context for the borrow.
        let ictx2 = ffmpeg::format::input(&self.path)?;
        let stream2 = ictx2.stream(video_stream_index).ok_or_else(|| anyhow!("stream gone"))?;
        let dec_ctx = ffmpeg::codec::context::Context::from_parameters(stream2.parameters())?;
        let mut decoder = dec_ctx.decoder().video()?;

        let mut scaler = SwsContext::get(
            decoder.format(), decoder.width(), decoder.height(),
            Pixel::RGBA, decoder.width(), decoder.height(),
            Flags::BILINEAR,
        )?;

        let w = decoder.width();
        let h = decoder.height();

        for (stream, packet) in ictx.packets().flatten() {
            if stream.index() != video_stream_index {
                continue;
            }
            if Instant::now() > deadline {
                return Err(anyhow!("seek timed out for target_secs={target_secs:.3}"));
            }
            if decoder.send_packet(&packet).is_err() {
                continue;
            }
            let mut decoded = ffmpeg::util::frame::Video::empty();
            while decoder.receive_frame(&mut decoded).is_ok() {
                let mut out = ffmpeg::util::frame::Video::empty();
                scaler.run(&decoded, &mut out)?;
                let stride = out.stride(0);
                let raw = out.data(0);
                let data: Vec<u8> = (0..h as usize)
                    .flat_map(|row| {
                        let start = row * stride;
                        &raw[start..start + w as usize * 4]
                    })
                    .copied()
                    .collect();
                let pts_us = (target_secs * 1_000_000.0) as i64;
                return Ok(RawFrame::new(pts_us, w, h, w, h, PixelFormat::Rgba8, data));
            }
        }
        Err(anyhow!("no frame found at t={target_secs:.3}"))
    }
}

pub struct ProgressiveFrameGrid {
    slots:      Vec<FrameSlot>,
    target_fps: u32,
}

impl ProgressiveFrameGrid {
    pub fn new(duration_secs: f64, target_fps: u32) -> Self {
        let len = (duration_secs * target_fps as f64).ceil() as usize;
        let slots = (0..len)
            .map(|i| FrameSlot::empty(i, i as f64 / target_fps as f64))
            .collect();
        Self { slots, target_fps }
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Phase 1: sample at `reduced_fps`, `chunk_size` slots at a time, then
    /// fill interpolated gaps. `on_yield` is invoked between chunks — the
    /// caller decides how (or whether) to actually sleep 10ms; tests pass a
    /// no-op.
    pub fn load_initial(
        &mut self,
        source: &mut dyn FrameSource,
        reduced_fps: u32,
        chunk_size: usize,
        seek_timeout_ms: u64,
        mut on_yield: impl FnMut(),
    ) -> Result<(), IngestError> {
        if reduced_fps == 0 {
            return Err(IngestError::Configuration("reduced_fps must be > 0".into()));
        }
        let total_duration_secs = self.slots.len() as f64 / self.target_fps as f64;
        let sample_count = (total_duration_secs * reduced_fps as f64).ceil() as usize;
        let timeout = Duration::from_millis(seek_timeout_ms);

        let mut i = 0usize;
        while i < sample_count {
            let chunk_end = (i + chunk_size).min(sample_count);
            for sample_i in i..chunk_end {
                let t = sample_i as f64 / reduced_fps as f64;
                let j = (t * self.target_fps as f64).floor() as usize;
                let Some(slot) = self.slots.get_mut(j) else { continue };
                match source.seek_and_decode(t, timeout) {
                    Some(frame) => {
                        slot.data = Some(frame);
                        slot.quality = SlotQuality::LowRes;
                    }
                    None => {
                        tracing::debug!(t, "phase 1 sample failed, leaving slot empty for gap-fill");
                    }
                }
            }
            i = chunk_end;
            on_yield();
        }

        self.fill_interpolated_gaps();
        Ok(())
    }

    fn fill_interpolated_gaps(&mut self) {
        let mut last_real: Option<usize> = None;
        for i in 0..self.slots.len() {
            if self.slots[i].data.is_some() {
                last_real = Some(i);
                continue;
            }
            if let Some(src) = last_real {
                self.slots[i].quality = SlotQuality::Interpolated;
                self.slots[i].source_index = Some(src);
            }
            // Slots before the first real sample stay Empty — no source.
        }
    }

    /// Phase 2: upgrade every non-HighRes slot to full quality in the
    /// background, `chunk_size` at a time, yielding between chunks.
    pub fn upgrade_background(
        &mut self,
        source: &mut dyn FrameSource,
        chunk_size: usize,
        seek_timeout_ms: u64,
        mut on_yield: impl FnMut(),
    ) -> Result<(), IngestError> {
        let timeout = Duration::from_millis(seek_timeout_ms);
        let pending: Vec<usize> = self.slots.iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.quality, SlotQuality::LowRes | SlotQuality::Interpolated))
            .map(|(i, _)| i)
            .collect();

        for chunk in pending.chunks(chunk_size) {
            for &i in chunk {
                let t = self.slots[i].timestamp_secs;
                if let Some(frame) = source.seek_and_decode(t, timeout) {
                    // Set data before clearing source_index so a racing
                    // display read never sees Interpolated with no source.
                    self.slots[i].data = Some(frame);
                    self.slots[i].quality = SlotQuality::HighRes;
                    self.slots[i].source_index = None;
                } else {
                    tracing::debug!(t, slot = i, "phase 2 upgrade seek timed out, leaving slot as-is");
                }
            }
            on_yield();
        }
        Ok(())
    }
}
