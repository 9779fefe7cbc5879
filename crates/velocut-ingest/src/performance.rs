// crates/velocut-ingest/src/performance.rs
//
// PerformanceMonitor — rolling metrics over bounded ring buffers. History is
// capped with a `VecDeque`-based ring buffer rather than growing without
// bound; alert generation is a pure function over a snapshot so it can be
// unit-tested without wiring up real frame timings.

use std::collections::VecDeque;

use velocut_core::{AlertKind, PerformanceAlert, PerformanceAlertThresholds, PerformanceSnapshot, Severity};

const PROCESSING_HISTORY_CAP: usize = 1000;
const FPS_WINDOW_CAP:         usize = 60;
const QUALITY_HISTORY_CAP:    usize = 100;

fn push_bounded<T>(buf: &mut VecDeque<T>, cap: usize, value: T) {
    if buf.len() >= cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn min_or_zero(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().cloned().fold(f64::INFINITY, f64::min)
    }
}

fn stddev(values: &VecDeque<f64>) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

pub struct PerformanceMonitor {
    thresholds: PerformanceAlertThresholds,

    processing_ms_history: VecDeque<f64>,
    fps_interval_history:  VecDeque<f64>, // seconds between consecutive frame_processed events
    quality_history:       VecDeque<f64>,

    dropped_frames: u64,
    total_frames:   u64,
    /// Mirrors `FrameRateController::dropped()` — frames the rate
    /// controller discarded to hold cadence, kept separate from
    /// `dropped_frames` (decode errors) and summed in `snapshot()`.
    rate_controller_drops: u64,
    /// Mirrors `VideoDecoder::dropped_awaiting_key()` — chunks silently
    /// skipped while a reset decoder waits for the next Key chunk.
    decoder_drops: u64,

    memory_current: u64,
    memory_peak:    u64,
    memory_history: VecDeque<f64>,
    gc_event_count: u64,
    rolling_memory_average: f64,

    last_frame_instant_secs: Option<f64>,
}

impl PerformanceMonitor {
    pub fn new(thresholds: PerformanceAlertThresholds) -> Self {
        Self {
            thresholds,
            processing_ms_history: VecDeque::new(),
            fps_interval_history: VecDeque::new(),
            quality_history: VecDeque::new(),
            dropped_frames: 0,
            total_frames: 0,
            rate_controller_drops: 0,
            decoder_drops: 0,
            memory_current: 0,
            memory_peak: 0,
            memory_history: VecDeque::new(),
            gc_event_count: 0,
            rolling_memory_average: 0.0,
            last_frame_instant_secs: None,
        }
    }

    pub fn set_thresholds(&mut self, thresholds: PerformanceAlertThresholds) {
        self.thresholds = thresholds;
    }

    pub fn record_dropped_frame(&mut self) {
        self.dropped_frames += 1;
    }

    /// Sync the rate controller's own running drop count. Called after
    /// every chunk is processed so `snapshot().dropped_frames` reflects
    /// both decode-error drops and cadence-driven discards.
    pub fn sync_rate_controller_drops(&mut self, total: u64) {
        self.rate_controller_drops = total;
    }

    /// Sync the decoder's running "dropped while awaiting key" count.
    pub fn sync_decoder_drops(&mut self, total: u64) {
        self.decoder_drops = total;
    }

    /// Record one emitted frame. `now_secs` is caller-supplied (usually
    /// wall-clock seconds since pipeline start) so this stays free of
    /// `Instant::now()`/time-source assumptions in tests.
    pub fn record_frame(&mut self, now_secs: f64, processing_ms: f64, quality: f32) {
        self.total_frames += 1;
        push_bounded(&mut self.processing_ms_history, PROCESSING_HISTORY_CAP, processing_ms);
        push_bounded(&mut self.quality_history, QUALITY_HISTORY_CAP, quality as f64);

        if let Some(last) = self.last_frame_instant_secs {
            push_bounded(&mut self.fps_interval_history, FPS_WINDOW_CAP, now_secs - last);
        }
        self.last_frame_instant_secs = Some(now_secs);
    }

    pub fn record_memory(&mut self, current_bytes: u64) {
        self.memory_current = current_bytes;
        self.memory_peak = self.memory_peak.max(current_bytes);
        push_bounded(&mut self.memory_history, PROCESSING_HISTORY_CAP, current_bytes as f64);
        self.rolling_memory_average = mean(&self.memory_history);

        // Crude GC-event heuristic: a sharp drop below the rolling average
        // suggests a reclamation pass just ran.
        if self.rolling_memory_average > 0.0 && (current_bytes as f64) < 0.7 * self.rolling_memory_average {
            self.gc_event_count += 1;
        }
    }

    fn output_fps(&self) -> f64 {
        if self.fps_interval_history.is_empty() {
            return 0.0;
        }
        let avg_interval = mean(&self.fps_interval_history);
        if avg_interval <= 0.0 { 0.0 } else { 1.0 / avg_interval }
    }

    fn output_fps_stddev_ms(&self) -> f64 {
        // stddev of intervals, converted to milliseconds to match the
        // configured `max_fps_variance_ms` threshold's unit.
        stddev(&self.fps_interval_history) * 1000.0
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            processing_ms_last: self.processing_ms_history.back().copied().unwrap_or(0.0),
            processing_ms_min: min_or_zero(&self.processing_ms_history),
            processing_ms_max: self.processing_ms_history.iter().cloned().fold(0.0, f64::max),
            processing_ms_average: mean(&self.processing_ms_history),
            dropped_frames: self.dropped_frames + self.rate_controller_drops + self.decoder_drops,
            total_frames: self.total_frames,
            output_fps: self.output_fps(),
            output_fps_stddev: self.output_fps_stddev_ms(),
            memory_current_bytes: self.memory_current,
            memory_peak_bytes: self.memory_peak,
            memory_average_bytes: self.rolling_memory_average,
            gc_event_count: self.gc_event_count,
            quality_average: mean(&self.quality_history),
        }
    }

    /// Evaluate the current snapshot against configured thresholds. Alerts
    /// are informational — they never halt the pipeline.
    pub fn check_alerts(&self) -> Vec<PerformanceAlert> {
        let snap = self.snapshot();
        let mut alerts = Vec::new();

        if snap.processing_ms_last > self.thresholds.max_processing_ms {
            alerts.push(PerformanceAlert {
                kind: AlertKind::ProcessingTime,
                value: snap.processing_ms_last,
                threshold: self.thresholds.max_processing_ms,
                severity: Severity::Warning,
            });
        }
        if snap.total_frames > 0 && snap.output_fps > 0.0 && snap.output_fps < self.thresholds.min_fps {
            alerts.push(PerformanceAlert {
                kind: AlertKind::Fps,
                value: snap.output_fps,
                threshold: self.thresholds.min_fps,
                severity: Severity::Warning,
            });
        }
        if snap.memory_current_bytes > self.thresholds.max_memory_bytes {
            alerts.push(PerformanceAlert {
                kind: AlertKind::Memory,
                value: snap.memory_current_bytes as f64,
                threshold: self.thresholds.max_memory_bytes as f64,
                severity: Severity::Critical,
            });
        }
        if snap.output_fps_stddev > self.thresholds.max_fps_variance_ms {
            alerts.push(PerformanceAlert {
                kind: AlertKind::FpsVariance,
                value: snap.output_fps_stddev,
                threshold: self.thresholds.max_fps_variance_ms,
                severity: Severity::Info,
            });
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffers_stay_bounded_under_sustained_load() {
        let mut mon = PerformanceMonitor::new(PerformanceAlertThresholds::default());
        for i in 0..5000 {
            mon.record_frame(i as f64 * 0.04, 10.0, 1.0);
        }
        assert!(mon.processing_ms_history.len() <= PROCESSING_HISTORY_CAP);
        assert!(mon.fps_interval_history.len() <= FPS_WINDOW_CAP);
        assert!(mon.quality_history.len() <= QUALITY_HISTORY_CAP);
    }

    #[test]
    fn processing_time_alert_fires_above_threshold() {
        let mut mon = PerformanceMonitor::new(PerformanceAlertThresholds::default());
        mon.record_frame(0.0, 80.0, 1.0);
        let alerts = mon.check_alerts();
        assert!(alerts.iter().any(|a| a.kind == AlertKind::ProcessingTime));
    }

    #[test]
    fn memory_alert_fires_above_threshold() {
        let mut mon = PerformanceMonitor::new(PerformanceAlertThresholds::default());
        mon.record_memory(200 * 1024 * 1024);
        let alerts = mon.check_alerts();
        assert!(alerts.iter().any(|a| a.kind == AlertKind::Memory));
    }

    #[test]
    fn gc_event_counted_on_sharp_memory_drop() {
        let mut mon = PerformanceMonitor::new(PerformanceAlertThresholds::default());
        for _ in 0..20 {
            mon.record_memory(10_000_000);
        }
        assert_eq!(mon.gc_event_count, 0);
        mon.record_memory(1_000_000); // sharp drop below 0.7x rolling average
        assert_eq!(mon.gc_event_count, 1);
    }

    #[test]
    fn snapshot_sums_decode_drops_and_rate_controller_drops() {
        let mut mon = PerformanceMonitor::new(PerformanceAlertThresholds::default());
        mon.record_dropped_frame();
        mon.record_dropped_frame();
        mon.sync_rate_controller_drops(22);
        assert_eq!(mon.snapshot().dropped_frames, 24);

        // sync is idempotent against the latest total, not additive.
        mon.sync_rate_controller_drops(30);
        assert_eq!(mon.snapshot().dropped_frames, 32);
    }

    #[test]
    fn snapshot_also_folds_in_decoder_drops() {
        let mut mon = PerformanceMonitor::new(PerformanceAlertThresholds::default());
        mon.record_dropped_frame();
        mon.sync_rate_controller_drops(2);
        mon.sync_decoder_drops(5);
        assert_eq!(mon.snapshot().dropped_frames, 8);
    }

    #[test]
    fn alerts_never_panic_on_empty_history() {
        let mon = PerformanceMonitor::new(PerformanceAlertThresholds::default());
        let alerts = mon.check_alerts();
        assert!(alerts.is_empty());
    }
}
