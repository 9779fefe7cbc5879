// crates/velocut-ingest/src/helpers/seek.rs
//
// Seek helper wrapping ffmpeg's avformat seek with consistent Windows EPERM
// soft-fail behaviour. All seeks in this crate route through here so the
// guard + log pattern isn't duplicated at every call site (demuxer ready-time
// probing, `FfmpegFrameSource::seek_and_decode` in the progressive grid).

use ffmpeg_the_third as ffmpeg;

/// Seek `ictx` to `target_secs` seconds from the start of the file.
///
/// Returns `true` if the seek succeeded (or was skipped because target is 0).
/// Returns `false` if the seek failed — the caller decodes from wherever the
/// demuxer currently sits, and its own PTS-based frame filtering skips
/// pre-roll frames correctly.
///
/// # Why backward seek (`..=seek_ts`)
/// A forward seek (`seek_ts..`) lands on the keyframe AT OR AFTER
/// `target_secs`. When `target_secs` falls mid-GOP, that forward keyframe may
/// be several seconds away, and every source frame between `target_secs` and
/// it is simply absent from the decode stream — the frame-rate controller
/// would see a gap and either stall or repeat the nearest frame.
///
/// A backward seek lands on the keyframe BEFORE `target_secs`. Pre-roll
/// frames are discarded by the caller's PTS filter, so the first frame that
/// matters is still correctly at `target_secs`.
///
/// # Why skip at 0.0
/// `avformat_seek_file(max_ts=0)` returns EPERM on Windows when called on a
/// freshly-opened context. Since the demuxer starts at position 0 by
/// default, skipping the seek entirely is both correct and avoids the error.
pub fn seek_to_secs(
    ictx: &mut ffmpeg::format::context::Input,
    target_secs: f64,
    label: &str, // caller description for log messages, e.g. "progressive-grid"
) -> bool {
    if target_secs <= 0.0 {
        return true; // already at start — no seek needed
    }

    let seek_ts = (target_secs * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;
    match ictx.seek(seek_ts, ..=seek_ts) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                %label, %target_secs, error = %e,
                "seek soft-fail — decoding from current position, PTS filter will skip pre-roll"
            );
            false
        }
    }
}
