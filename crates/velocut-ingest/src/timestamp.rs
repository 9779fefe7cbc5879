// crates/velocut-ingest/src/timestamp.rs
//
// TimestampCalculator — pure arithmetic over frame timestamps in
// microseconds. No I/O, no frame ownership, just a handful of counters.

use velocut_core::Micros;

/// Result of `compute_optimal`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OptimalTimestamp {
    pub ideal:            Micros,
    pub adjusted:         Micros,
    pub drift_applied:    Micros,
    pub total_drift:      Micros,
    pub needs_correction: bool,
}

/// Result of `should_include`. Exists for completeness —
/// `FrameRateController::emit_best`'s scoring loop is the authoritative
/// inclusion policy, not this predicate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InclusionDecision {
    pub include:      bool,
    pub time_to_ideal: Micros,
}

pub struct TimestampCalculator {
    target_interval: Micros,
    max_drift:       Micros,
    drift_fraction:  f64,

    base:             Micros,
    frame_count:      u64,
    drift_correction: Micros,
}

impl TimestampCalculator {
    pub fn new(target_fps: u32, max_drift_micros: Micros, drift_correction_fraction: f64) -> Self {
        Self {
            target_interval: (1_000_000.0 / target_fps as f64).round() as Micros,
            max_drift: max_drift_micros,
            drift_fraction: drift_correction_fraction,
            base: 0,
            frame_count: 0,
            drift_correction: 0,
        }
    }

    pub fn target_interval(&self) -> Micros {
        self.target_interval
    }

    /// Reset the grid to start at `first_ts_us`.
    pub fn initialize(&mut self, first_ts_us: Micros) {
        self.base = first_ts_us;
        self.frame_count = 0;
        self.drift_correction = 0;
    }

    pub fn next_ideal_ts(&self) -> Micros {
        self.ts_for_frame(self.frame_count as i64)
    }

    pub fn ts_for_frame(&self, i: i64) -> Micros {
        self.base + i * self.target_interval + self.drift_correction
    }

    /// Return the current ideal timestamp, then advance the internal
    /// frame counter.
    pub fn advance(&mut self) -> Micros {
        let ts = self.next_ideal_ts();
        self.frame_count += 1;
        ts
    }

    /// Gradual drift correction capped at `drift_fraction` of
    /// `target_interval` per call.
    pub fn compute_optimal(&mut self, source_ts: Micros) -> OptimalTimestamp {
        let ideal = self.next_ideal_ts();
        let diff = source_ts - ideal;

        if diff.abs() <= self.max_drift {
            return OptimalTimestamp {
                ideal,
                adjusted: ideal,
                drift_applied: 0,
                total_drift: self.drift_correction,
                needs_correction: false,
            };
        }

        let cap = (self.drift_fraction * self.target_interval as f64).round() as Micros;
        let correction = diff.signum() * diff.abs().min(cap);
        self.drift_correction += correction;

        OptimalTimestamp {
            ideal,
            adjusted: ideal + correction,
            drift_applied: correction,
            total_drift: self.drift_correction,
            needs_correction: true,
        }
    }

    /// `should_include` — kept for completeness; not consulted by
    /// `FrameRateController::emit_best`.
    pub fn should_include(&self, source_ts: Micros, last_output_ts: Option<Micros>) -> InclusionDecision {
        let next_ideal = self.next_ideal_ts();
        let delta_ideal_last = (source_ts - next_ideal).abs();
        let delta_src = match last_output_ts {
            Some(last) => (source_ts - last).abs(),
            None => Micros::MAX,
        };

        let half = (0.5 * self.target_interval as f64) as Micros;
        let eighty_pct = (0.8 * self.target_interval as f64) as Micros;
        let one_point_two = (1.2 * self.target_interval as f64) as Micros;

        let include = delta_ideal_last < half && delta_src >= eighty_pct && delta_ideal_last < one_point_two;

        InclusionDecision { include, time_to_ideal: delta_ideal_last }
    }

    // ── Static helpers ────────────────────────────────────────────────────

    /// `round(ts / src_interval) * dst_interval`.
    pub fn convert(ts: Micros, src_fps: f64, dst_fps: f64) -> Micros {
        let src_interval = 1_000_000.0 / src_fps;
        let dst_interval = 1_000_000.0 / dst_fps;
        ((ts as f64 / src_interval).round() * dst_interval).round() as Micros
    }

    /// `1e6 / mean(consecutive diffs)` for `timestamps.len() >= 2`, else 0.
    pub fn estimate_fps(timestamps: &[Micros]) -> f64 {
        if timestamps.len() < 2 {
            return 0.0;
        }
        let diffs_sum: i64 = timestamps.windows(2).map(|w| w[1] - w[0]).sum();
        let mean = diffs_sum as f64 / (timestamps.len() - 1) as f64;
        if mean <= 0.0 {
            0.0
        } else {
            1_000_000.0 / mean
        }
    }

    pub fn normalize(timestamps: &[Micros]) -> Vec<Micros> {
        match timestamps.first() {
            Some(&first) => timestamps.iter().map(|&t| t - first).collect(),
            None => Vec::new(),
        }
    }

    pub fn generate_ideal_grid(duration_ms: f64, fps: f64, start_ts: Micros) -> Vec<Micros> {
        let interval = 1_000_000.0 / fps;
        let count = (duration_ms * fps / 1000.0).ceil() as usize;
        (0..count)
            .map(|i| start_ts + (i as f64 * interval).round() as Micros)
            .collect()
    }

    pub fn in_sync(a: Micros, b: Micros, tol_ms: f64) -> bool {
        (a - b).abs() <= (tol_ms * 1000.0) as Micros
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> TimestampCalculator {
        TimestampCalculator::new(24, 5_000, 0.1)
    }

    #[test]
    fn initialize_resets_counters() {
        let mut c = calc();
        c.advance();
        c.advance();
        c.initialize(1_000);
        assert_eq!(c.next_ideal_ts(), 1_000);
    }

    #[test]
    fn advance_increments_frame_count_each_call() {
        let mut c = calc();
        let interval = c.target_interval();
        assert_eq!(c.advance(), 0);
        assert_eq!(c.advance(), interval);
        assert_eq!(c.advance(), 2 * interval);
    }

    #[test]
    fn ts_for_frame_matches_formula_without_mutating_state() {
        let c = calc();
        let interval = c.target_interval();
        assert_eq!(c.ts_for_frame(5), 5 * interval);
        assert_eq!(c.ts_for_frame(0), 0);
    }

    #[test]
    fn compute_optimal_within_tolerance_applies_no_correction() {
        let mut c = calc();
        let interval = c.target_interval();
        let r = c.compute_optimal(interval + 2_000); // within 5ms tolerance
        assert_eq!(r.adjusted, r.ideal);
        assert_eq!(r.drift_applied, 0);
        assert!(!r.needs_correction);
    }

    #[test]
    fn compute_optimal_caps_correction_at_ten_percent_of_interval() {
        let mut c = calc();
        let interval = c.target_interval();
        let cap = (0.1 * interval as f64).round() as i64;
        // source way ahead of ideal (0) — correction should be capped, not full diff.
        let r = c.compute_optimal(interval * 10);
        assert!(r.needs_correction);
        assert_eq!(r.drift_applied, cap);
        assert_eq!(r.total_drift, cap);
    }

    #[test]
    fn compute_optimal_accumulates_drift_across_calls() {
        let mut c = calc();
        let interval = c.target_interval();
        let cap = (0.1 * interval as f64).round() as i64;
        c.advance(); // frame_count = 1
        let _ = c.compute_optimal(interval * 5);
        c.advance(); // frame_count = 2
        let r2 = c.compute_optimal(interval * 5);
        assert_eq!(r2.total_drift, 2 * cap);
    }

    #[test]
    fn should_include_accepts_frame_near_next_ideal_tick() {
        let c = calc();
        let interval = c.target_interval();
        let d = c.should_include(interval, Some(0));
        assert!(d.include);
    }

    #[test]
    fn should_include_rejects_frame_too_close_to_last_output() {
        let c = calc();
        let interval = c.target_interval();
        // last_output_ts equal to source_ts -> delta_src = 0 < 0.8*interval -> rejected
        let d = c.should_include(interval, Some(interval));
        assert!(!d.include);
    }

    #[test]
    fn should_include_accepts_first_frame_when_no_prior_output() {
        let c = calc();
        let interval = c.target_interval();
        let d = c.should_include(interval, None);
        assert!(d.include);
    }

    #[test]
    fn convert_is_idempotent_under_repeated_application() {
        let once = TimestampCalculator::convert(123_456, 30.0, 24.0);
        let twice = TimestampCalculator::convert(once, 24.0, 24.0);
        assert_eq!(once, twice);
    }

    #[test]
    fn estimate_fps_returns_zero_for_short_input() {
        assert_eq!(TimestampCalculator::estimate_fps(&[1]), 0.0);
        assert_eq!(TimestampCalculator::estimate_fps(&[]), 0.0);
    }

    #[test]
    fn estimate_fps_recovers_known_rate() {
        // 30fps -> 33_333us between frames
        let ts: Vec<i64> = (0..10).map(|i| i * 33_333).collect();
        let fps = TimestampCalculator::estimate_fps(&ts);
        assert!((fps - 30.0).abs() < 0.1);
    }

    #[test]
    fn normalize_subtracts_first_timestamp() {
        let ts = [5_000, 6_000, 7_000];
        assert_eq!(TimestampCalculator::normalize(&ts), vec![0, 1_000, 2_000]);
        assert_eq!(TimestampCalculator::normalize(&[]), Vec::<i64>::new());
    }

    #[test]
    fn generate_ideal_grid_covers_full_duration() {
        let grid = TimestampCalculator::generate_ideal_grid(4_000.0, 24.0, 0);
        assert_eq!(grid.len(), 96);
        assert_eq!(grid[0], 0);
        assert_eq!(grid[1], 41_667);
    }

    #[test]
    fn in_sync_respects_tolerance() {
        assert!(TimestampCalculator::in_sync(1_000, 2_000, 2.0));
        assert!(!TimestampCalculator::in_sync(1_000, 10_000, 2.0));
    }
}
