// crates/velocut-ingest/src/demux.rs
//
// Demuxer — turns container bytes into a one-shot `DecoderConfig` plus a
// stream of `EncodedChunk`s in decode order.
//
// Built on `ffmpeg_the_third::format::context::Input`, which already
// performs the fragmented-container box parsing; the codec-specific
// parameter record comes straight off `AVCodecParameters::extradata`
// (already stripped of any box header) rather than being re-scanned by
// hand.

use std::io::Write;
use std::path::{Path, PathBuf};

use ffmpeg_the_third as ffmpeg;
use ffmpeg_the_third::media::Type;

use velocut_core::{ChunkKind, DecoderConfig, EncodedChunk, IngestSource, Micros};

use crate::error::IngestError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DemuxState {
    Uninitialized,
    AppendingBytes,
    Ready,
    Streaming,
    Complete,
    Errored,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackInfo {
    pub width:      u32,
    pub height:     u32,
    pub nb_samples: u64,
    pub codec:      String,
    pub timescale:  u32,
    pub duration:   u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReadyInfo {
    pub duration_ms: f64,
    pub track:       TrackInfo,
}

/// Normalizes the observed four-character codec tag into the short form the
/// decoder capability accepts. The only documented quirk: `vp08` → `vp8`.
fn normalize_codec_tag(tag: &str) -> String {
    let lower = tag.to_ascii_lowercase();
    if lower.starts_with("vp08") {
        "vp8".to_string()
    } else {
        match lower.as_str() {
            "avc1" | "avc3" => "avc1".to_string(),
            "hev1" | "hvc1" => "hvc1".to_string(),
            "vp09" => "vp09".to_string(),
            "av01" => "av01".to_string(),
            other => other.to_string(),
        }
    }
}

fn supported(codec: &str) -> bool {
    matches!(codec, "avc1" | "hvc1" | "vp8" | "vp09" | "av01")
}

enum Spool {
    File(PathBuf),
    Bytes { file: tempfile::NamedTempFile, file_start: u64 },
}

/// `new(source)` plus `append_bytes`/`EncodedChunk` extraction, driving the
/// `Uninitialized → AppendingBytes → Ready → Streaming → Complete | Errored`
/// state machine; `Ready → Streaming` happens once the caller has consumed
/// `ready_info()` and calls `start_streaming()`.
pub struct Demuxer {
    state:  DemuxState,
    spool:  Spool,
    ictx:   Option<ffmpeg::format::context::Input>,
    video_stream_index: usize,
    next_sample_index:  u64,
    ready_info: Option<ReadyInfo>,
    decoder_config: Option<DecoderConfig>,
}

impl Demuxer {
    pub fn new(source: IngestSource) -> Result<Self, IngestError> {
        let (state, spool) = match source {
            IngestSource::File(path) => (DemuxState::Uninitialized, Spool::File(path)),
            IngestSource::Bytes(initial) => {
                let file = tempfile::NamedTempFile::new().map_err(IngestError::Io)?;
                let mut demux = Self {
                    state: DemuxState::Uninitialized,
                    spool: Spool::Bytes { file, file_start: 0 },
                    ictx: None,
                    video_stream_index: 0,
                    next_sample_index: 0,
                    ready_info: None,
                    decoder_config: None,
                };
                if !initial.is_empty() {
                    demux.append_bytes(&initial)?;
                }
                return Ok(demux);
            }
        };

        let mut demux = Self {
            state,
            spool,
            ictx: None,
            video_stream_index: 0,
            next_sample_index: 0,
            ready_info: None,
            decoder_config: None,
        };
        demux.try_open()?;
        Ok(demux)
    }

    pub fn state(&self) -> DemuxState {
        self.state
    }

    /// Append more bytes to a `Bytes`-sourced stream. Spools to the backing
    /// temp file, then attempts to (re)open; the first successful open
    /// transitions `Uninitialized`/`AppendingBytes` → `Ready`.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<(), IngestError> {
        let Spool::Bytes { file, file_start } = &mut self.spool else {
            return Err(IngestError::Configuration("append_bytes called on a File-sourced demuxer".into()));
        };
        file.write_all(bytes).map_err(IngestError::Io)?;
        file.flush().map_err(IngestError::Io)?;
        *file_start += bytes.len() as u64;

        if self.state == DemuxState::Uninitialized {
            self.state = DemuxState::AppendingBytes;
        }
        if self.ictx.is_none() {
            // Best-effort: header may still be incomplete after this append.
            let _ = self.try_open();
        }
        Ok(())
    }

    fn try_open(&mut self) -> Result<(), IngestError> {
        let path: &Path = match &self.spool {
            Spool::File(p) => p.as_path(),
            Spool::Bytes { file, .. } => file.path(),
        };

        let ictx = match ffmpeg::format::input(&path) {
            Ok(ictx) => ictx,
            Err(_) => return Ok(()), // header not complete yet — not an error
        };

        self.finish_open(ictx)
    }

    fn finish_open(&mut self, ictx: ffmpeg::format::context::Input) -> Result<(), IngestError> {
        let stream = ictx.streams().best(Type::Video)
            .ok_or_else(|| IngestError::Configuration("no video track".into()))?;
        let video_stream_index = stream.index();

        let (width, height, codec_tag, extradata, timescale, tb_num) = unsafe {
            let p = stream.parameters().as_ptr();
            let tag_bytes = (*p).codec_tag.to_le_bytes();
            let tag = String::from_utf8_lossy(&tag_bytes).trim_end_matches('\0').to_string();
            let extradata = if (*p).extradata.is_null() || (*p).extradata_size <= 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts((*p).extradata, (*p).extradata_size as usize).to_vec()
            };
            let tb = stream.time_base();
            ((*p).width as u32, (*p).height as u32, tag, extradata, tb.denominator() as u32, tb.numerator())
        };

        let codec = normalize_codec_tag(&codec_tag);
        if !supported(&codec) {
            self.state = DemuxState::Errored;
            return Err(IngestError::UnsupportedCodec(codec));
        }

        let duration_ms = (ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64) * 1000.0;
        let nb_samples = stream.frames() as u64;

        self.ready_info = Some(ReadyInfo {
            duration_ms,
            track: TrackInfo {
                width,
                height,
                nb_samples,
                codec: codec.clone(),
                timescale,
                duration: stream.duration().max(0) as u64,
            },
        });
        self.decoder_config = Some(DecoderConfig {
            codec,
            coded_width: width,
            coded_height: height,
            parameter_bytes: extradata,
        });

        self.video_stream_index = video_stream_index;
        self.ictx = Some(ictx);
        self.state = DemuxState::Ready;
        let _ = tb_num;
        Ok(())
    }

    /// Returns the one-shot ready info once the header has parsed.
    pub fn ready_info(&self) -> Option<&ReadyInfo> {
        self.ready_info.as_ref()
    }

    pub fn decoder_config(&self) -> Option<&DecoderConfig> {
        self.decoder_config.as_ref()
    }

    /// `Ready → Streaming`. Must be called before `next_chunk`.
    pub fn start_streaming(&mut self) -> Result<(), IngestError> {
        if self.state != DemuxState::Ready {
            return Err(IngestError::Configuration(format!(
                "start_streaming requires Ready state, found {:?}", self.state
            )));
        }
        self.state = DemuxState::Streaming;
        Ok(())
    }

    /// Pull the next sample in decode order. Returns `None` at EOS, at which
    /// point the state transitions to `Complete`.
    #[tracing::instrument(skip(self))]
    pub fn next_chunk(&mut self) -> Result<Option<EncodedChunk>, IngestError> {
        if self.state != DemuxState::Streaming {
            return Ok(None);
        }
        let ictx = self.ictx.as_mut().expect("Streaming implies ictx is open");
        let video_stream_index = self.video_stream_index;

        for (stream, packet) in ictx.packets() {
            if stream.index() != video_stream_index {
                continue;
            }
            let tb = stream.time_base();
            let scale = 1_000_000.0 * tb.numerator() as f64 / tb.denominator() as f64;
            let pts_us = (packet.pts().unwrap_or(0) as f64 * scale) as Micros;
            let duration_us = (packet.duration() as f64 * scale) as Micros;

            let kind = if packet.is_key() { ChunkKind::Key } else { ChunkKind::Delta };
            let sample_index = self.next_sample_index;
            self.next_sample_index += 1;

            return Ok(Some(EncodedChunk {
                kind,
                pts_us,
                duration_us,
                payload: packet.data().unwrap_or(&[]).to_vec(),
                sample_index,
            }));
        }

        self.state = DemuxState::Complete;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_codec_tag_applies_vp08_quirk() {
        assert_eq!(normalize_codec_tag("vp08"), "vp8");
        assert_eq!(normalize_codec_tag("VP08"), "vp8");
        assert_eq!(normalize_codec_tag("avc1"), "avc1");
        assert_eq!(normalize_codec_tag("hev1"), "hvc1");
    }

    #[test]
    fn supported_accepts_only_the_four_documented_codecs() {
        assert!(supported("avc1"));
        assert!(supported("hvc1"));
        assert!(supported("vp8"));
        assert!(supported("vp09"));
        assert!(supported("av01"));
        assert!(!supported("mp4a"));
    }
}
