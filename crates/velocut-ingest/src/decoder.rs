// crates/velocut-ingest/src/decoder.rs
//
// Decoder wrapper. A thin adapter over a host-provided decoder capability:
// configured once with a `DecoderConfig`, fed `EncodedChunk`s in decode
// order, and producing `RawFrame`s in presentation order through a
// callback. Errors are non-fatal — the decoder resets itself and waits for
// the next Key chunk to re-prime.
//
// `VideoDecoder` stands in for that capability so the controller/grid code
// can be exercised without FFmpeg (`FakeDecoder`, in tests). The production
// path, `FfmpegVideoDecoder`, wraps a persistent `send_packet`/
// `receive_frame` loop with an internal `SwsContext` scaling every output to
// RGBA8.

use ffmpeg_the_third as ffmpeg;
use ffmpeg_the_third::software::scaling;
use tracing::instrument;

use velocut_core::{ChunkKind, DecoderConfig, EncodedChunk, Micros, PixelFormat, RawFrame};

use crate::error::IngestError;

pub trait VideoDecoder {
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), IngestError>;

    /// Feed one chunk. On success, invokes `on_frame` zero or more times
    /// (a decoder may buffer B-frames before it can emit anything).
    fn decode(&mut self, chunk: &EncodedChunk, on_frame: &mut dyn FnMut(RawFrame)) -> Result<(), IngestError>;

    /// Drain any frames the decoder is still holding internally.
    fn flush(&mut self, on_frame: &mut dyn FnMut(RawFrame)) -> Result<(), IngestError>;

    /// Discard internal state after a decode error; the next chunk fed in
    /// must be a `Key` chunk.
    fn reset(&mut self);

    /// Running count of chunks silently dropped while waiting for the next
    /// `Key` chunk to re-prime a reset decoder (see `DecodeAction`). `Ok(())`
    /// from `decode()` doesn't distinguish this from a normal zero-output
    /// decode (B-frame buffering), so callers that need to account for
    /// these as dropped frames read this counter instead.
    fn dropped_awaiting_key(&self) -> u64 {
        0
    }
}

fn codec_id_for(codec: &str) -> Option<ffmpeg::codec::Id> {
    use ffmpeg::codec::Id;
    match codec {
        "avc1" | "avc3" => Some(Id::H264),
        "hvc1" | "hev1" => Some(Id::HEVC),
        "vp8" => Some(Id::VP8),
        "vp09" => Some(Id::VP9),
        "av01" => Some(Id::AV1),
        _ => None,
    }
}

/// Decision `decode()` makes before touching FFmpeg, factored out as a pure
/// function so the reset/re-prime contract (spec §4.4/§7: "the decoder is
/// reset and the next Key chunk re-primes it") is unit-testable without a
/// real codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecodeAction {
    /// Decoder is open — feed the chunk straight through.
    Decode,
    /// Decoder was reset (or never opened) but a config is retained and
    /// this chunk is a Key — reopen from that config, then decode.
    ReprimeThenDecode,
    /// Decoder was reset and this chunk is a Delta — nothing useful can be
    /// decoded until the next Key arrives, so drop it rather than error.
    DropAwaitingKey,
    /// `decode()` called before `configure()` ever ran once.
    Unconfigured,
}

fn decode_action(decoder_is_open: bool, config_retained: bool, kind: &ChunkKind) -> DecodeAction {
    if decoder_is_open {
        return DecodeAction::Decode;
    }
    if !config_retained {
        return DecodeAction::Unconfigured;
    }
    match kind {
        ChunkKind::Key => DecodeAction::ReprimeThenDecode,
        ChunkKind::Delta => DecodeAction::DropAwaitingKey,
    }
}

/// Production `VideoDecoder`, built directly on `ffmpeg_the_third`'s codec
/// context. Mirrors `LiveDecoder::open` (persistent context, rgba scaler
/// constructed once dimensions are known) and the `send_packet` /
/// `receive_frame` loop from the same module.
pub struct FfmpegVideoDecoder {
    decoder: Option<ffmpeg::decoder::Video>,
    scaler:  Option<scaling::Context>,
    codec:   String,
    /// Retained across `reset()` so a later Key chunk can re-prime the
    /// decoder without the host re-sending `configure()`.
    config:  Option<DecoderConfig>,
    dropped_awaiting_key: u64,
}

impl FfmpegVideoDecoder {
    pub fn new() -> Self {
        Self { decoder: None, scaler: None, codec: String::new(), config: None, dropped_awaiting_key: 0 }
    }

    fn ensure_scaler(&mut self, width: u32, height: u32, format: ffmpeg::format::Pixel) -> Result<(), IngestError> {
        if self.scaler.is_none() {
            let ctx = scaling::Context::get(
                format,
                width,
                height,
                ffmpeg::format::Pixel::RGBA,
                width,
                height,
                scaling::Flags::BILINEAR,
            ).map_err(|e| IngestError::Decode(format!("scaler init failed: {e}")))?;
            self.scaler = Some(ctx);
        }
        Ok(())
    }

    fn drain_available(&mut self, on_frame: &mut dyn FnMut(RawFrame)) -> Result<(), IngestError> {
        let decoder = self.decoder.as_mut().expect("configure() called before decode()");
        let mut decoded = ffmpeg::util::frame::Video::empty();

        while decoder.receive_frame(&mut decoded).is_ok() {
            let w = decoded.width();
            let h = decoded.height();
            self.ensure_scaler(w, h, decoded.format())?;
            let scaler = self.scaler.as_mut().unwrap();

            let mut rgba = ffmpeg::util::frame::Video::empty();
            scaler.run(&decoded, &mut rgba)
                .map_err(|e| IngestError::Decode(format!("scale failed: {e}")))?;

            // Stride can exceed width*4 (row padding); copy row by row
            // rather than taking the raw buffer wholesale.
            let stride = rgba.stride(0);
            let raw = rgba.data(0);
            let data: Vec<u8> = (0..h as usize)
                .flat_map(|row| {
                    let start = row * stride;
                    &raw[start..start + w as usize * 4]
                })
                .copied()
                .collect();

            let pts_us = decoded.pts().unwrap_or(0);
            on_frame(RawFrame::new(pts_us, w, h, w, h, PixelFormat::Rgba8, data));
        }
        Ok(())
    }
}

impl Default for FfmpegVideoDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegVideoDecoder {
    /// Opens (or reopens) the FFmpeg decoder context from a `DecoderConfig`.
    /// Shared by `configure()` and the lazy re-prime path in `decode()` —
    /// both need the exact same context-build sequence.
    fn open_from_config(&mut self, config: &DecoderConfig) -> Result<(), IngestError> {
        let id = codec_id_for(&config.codec)
            .ok_or_else(|| IngestError::UnsupportedCodec(config.codec.clone()))?;

        let codec = ffmpeg::decoder::find(id)
            .ok_or_else(|| IngestError::UnsupportedCodec(config.codec.clone()))?;

        let mut parameters = ffmpeg::codec::Parameters::new();
        unsafe {
            (*parameters.as_mut_ptr()).codec_id = id.into();
            (*parameters.as_mut_ptr()).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*parameters.as_mut_ptr()).width = config.coded_width as i32;
            (*parameters.as_mut_ptr()).height = config.coded_height as i32;
        }

        let context = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(|e| IngestError::Decode(format!("context build failed: {e}")))?;

        let mut decoder_ctx = context.decoder();
        if !config.parameter_bytes.is_empty() {
            unsafe {
                let ptr = ffmpeg::ffi::av_malloc(config.parameter_bytes.len()) as *mut u8;
                std::ptr::copy_nonoverlapping(config.parameter_bytes.as_ptr(), ptr, config.parameter_bytes.len());
                (*decoder_ctx.as_mut_ptr()).extradata = ptr;
                (*decoder_ctx.as_mut_ptr()).extradata_size = config.parameter_bytes.len() as i32;
            }
        }

        let opened = decoder_ctx.open_as(codec)
            .map_err(|e| IngestError::Decode(format!("decoder open failed: {e}")))?;
        let video = opened.video()
            .map_err(|e| IngestError::Decode(format!("not a video decoder: {e}")))?;

        self.decoder = Some(video);
        self.scaler = None;
        self.codec = config.codec.clone();
        Ok(())
    }
}

impl VideoDecoder for FfmpegVideoDecoder {
    #[instrument(skip(self, config), fields(codec = %config.codec))]
    fn configure(&mut self, config: &DecoderConfig) -> Result<(), IngestError> {
        self.open_from_config(config)?;
        self.config = Some(config.clone());
        Ok(())
    }

    #[instrument(skip(self, chunk, on_frame), fields(sample_index = chunk.sample_index))]
    fn decode(&mut self, chunk: &EncodedChunk, on_frame: &mut dyn FnMut(RawFrame)) -> Result<(), IngestError> {
        match decode_action(self.decoder.is_some(), self.config.is_some(), &chunk.kind) {
            DecodeAction::Unconfigured => {
                return Err(IngestError::Decode("decode() called before configure()".into()));
            }
            DecodeAction::DropAwaitingKey => {
                self.dropped_awaiting_key += 1;
                tracing::trace!(sample_index = chunk.sample_index, "dropping delta chunk while decoder awaits a key frame to re-prime");
                return Ok(());
            }
            DecodeAction::ReprimeThenDecode => {
                let config = self.config.clone().expect("config_retained checked by decode_action");
                self.open_from_config(&config)?;
                tracing::info!(sample_index = chunk.sample_index, "decoder re-primed from retained config on key chunk");
            }
            DecodeAction::Decode => {}
        }

        if matches!(chunk.kind, ChunkKind::Key) {
            tracing::trace!(sample_index = chunk.sample_index, "keyframe");
        }

        let mut packet = ffmpeg::Packet::copy(&chunk.payload);
        packet.set_pts(Some(chunk.pts_us as i64));

        let send_result = self.decoder.as_mut().unwrap().send_packet(&packet);
        if let Err(e) = send_result {
            tracing::warn!(error = %e, sample_index = chunk.sample_index, "decode error, resetting decoder");
            self.reset();
            return Err(IngestError::Decode(e.to_string()));
        }

        self.drain_available(on_frame)
    }

    fn flush(&mut self, on_frame: &mut dyn FnMut(RawFrame)) -> Result<(), IngestError> {
        if let Some(decoder) = self.decoder.as_mut() {
            let _ = decoder.send_eof();
        }
        self.drain_available(on_frame)
    }

    fn reset(&mut self) {
        self.decoder = None;
        self.scaler = None;
        // `config` deliberately survives a reset — `decode()` re-primes
        // from it the next time a Key chunk arrives.
    }

    fn dropped_awaiting_key(&self) -> u64 {
        self.dropped_awaiting_key
    }
}

/// Scripted `VideoDecoder` for controller/grid unit tests — no FFmpeg, no
/// real decoding. `decode` simply hands back one frame per chunk built from
/// the chunk's own timestamp, tagged with a caller-assigned quality.
#[cfg(test)]
pub struct FakeDecoder {
    pub width:   u32,
    pub height:  u32,
    pub quality: f32,
    configured:  bool,
}

#[cfg(test)]
impl FakeDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, quality: 1.0, configured: false }
    }
}

#[cfg(test)]
impl VideoDecoder for FakeDecoder {
    fn configure(&mut self, _config: &DecoderConfig) -> Result<(), IngestError> {
        self.configured = true;
        Ok(())
    }

    fn decode(&mut self, chunk: &EncodedChunk, on_frame: &mut dyn FnMut(RawFrame)) -> Result<(), IngestError> {
        if !self.configured {
            return Err(IngestError::Decode("not configured".into()));
        }
        let data = vec![0u8; (self.width * self.height * 4) as usize];
        on_frame(RawFrame::new(chunk.pts_us, self.width, self.height, self.width, self.height, PixelFormat::Rgba8, data));
        Ok(())
    }

    fn flush(&mut self, _on_frame: &mut dyn FnMut(RawFrame)) -> Result<(), IngestError> {
        Ok(())
    }

    fn reset(&mut self) {
        self.configured = false;
    }
}

#[allow(dead_code)]
fn _assert_micros_is_i64(_: Micros) {}
