// crates/velocut-ingest/src/buffer.rs
//
// FrameBufferManager — bounded, reference-counted registry of live decoded
// frames with size accounting and age-based reclamation.
//
// Ref-counting is a proper RAII-style handle rather than a manually
// incremented counter scattered across call sites: `add_ref`/`release` are
// the only two mutation points, `drain` bypasses the check and exists
// solely for teardown.

use std::collections::HashMap;
use std::time::Instant;

use velocut_core::{BufferStats, FrameMeta, ManagedFrameMeta, RawFrame};

struct Entry {
    frame:         RawFrame,
    size_bytes:    u64,
    ref_count:     u32,
    pinned:        bool,
    created_at:    Instant,
    last_accessed: Instant,
}

/// A `MemoryWarning` fired by `acquire` when reclamation could not bring
/// usage back under budget. Non-fatal — the caller still receives its frame
/// and is responsible for propagating back-pressure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MemoryWarning {
    pub current_bytes:     u64,
    pub max_bytes:         u64,
    pub requested_bytes:   u64,
    pub cleanup_performed: bool,
}

pub struct FrameBufferManager {
    max_bytes:     u64,
    current_bytes: u64,
    next_id:       u64,
    entries:       HashMap<u64, Entry>,
}

impl FrameBufferManager {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            current_bytes: 0,
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    pub fn set_max_bytes(&mut self, max_bytes: u64) {
        self.max_bytes = max_bytes;
    }

    /// Register a newly decoded frame. Ref-count starts at 1, unpinned.
    /// If admitting it would exceed `max_bytes`, a reclamation pass runs
    /// first; if that isn't enough a `MemoryWarning` is returned alongside
    /// the minted id — the frame is registered regardless.
    pub fn acquire(&mut self, frame: RawFrame, meta: FrameMeta) -> (u64, Option<MemoryWarning>) {
        let _ = meta; // quality hint is consulted by FrameRateController, not here
        let size_bytes = frame.estimated_size_bytes();
        let now = Instant::now();

        let mut cleanup_performed = false;
        if self.current_bytes + size_bytes > self.max_bytes {
            cleanup_performed = self.reclaim_until(self.max_bytes.saturating_sub(size_bytes));
        }

        let id = self.next_id;
        self.next_id += 1;

        self.entries.insert(id, Entry {
            frame,
            size_bytes,
            ref_count: 1,
            pinned: false,
            created_at: now,
            last_accessed: now,
        });
        self.current_bytes += size_bytes;

        let warning = if self.current_bytes > self.max_bytes {
            Some(MemoryWarning {
                current_bytes: self.current_bytes,
                max_bytes: self.max_bytes,
                requested_bytes: size_bytes,
                cleanup_performed,
            })
        } else {
            None
        };

        (id, warning)
    }

    pub fn add_ref(&mut self, id: u64) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.ref_count += 1;
            e.last_accessed = Instant::now();
        }
    }

    /// Decrement the ref-count; at zero, close the frame (idempotent) and
    /// drop it from the registry. Releasing an unknown/already-released id
    /// is a silent no-op.
    pub fn release(&mut self, id: u64) {
        let Some(e) = self.entries.get_mut(&id) else {
            tracing::debug!(id, "release: unknown or already-released frame");
            return;
        };
        if e.ref_count > 0 {
            e.ref_count -= 1;
        }
        if e.ref_count == 0 {
            if let Some(mut e) = self.entries.remove(&id) {
                e.frame.close(); // idempotent even if producer already closed it
                self.current_bytes = self.current_bytes.saturating_sub(e.size_bytes);
            }
        }
    }

    pub fn pin(&mut self, id: u64) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.pinned = true;
        }
    }

    pub fn unpin(&mut self, id: u64) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.pinned = false;
        }
    }

    pub fn meta(&self, id: u64) -> Option<ManagedFrameMeta> {
        self.entries.get(&id).map(|e| ManagedFrameMeta {
            id,
            size_bytes: e.size_bytes,
            ref_count: e.ref_count,
            pinned: e.pinned,
        })
    }

    pub fn frame(&self, id: u64) -> Option<&RawFrame> {
        self.entries.get(&id).map(|e| &e.frame)
    }

    /// Release every frame with ref-count == 1, unpinned, older than 5s.
    pub fn gentle_cleanup(&mut self) -> usize {
        self.cleanup_where(5_000)
    }

    /// Release every eligible frame regardless of age (still respects
    /// `pinned` and ref-count > 1). Used under sustained memory pressure.
    pub fn force_cleanup(&mut self) -> usize {
        self.cleanup_where(0)
    }

    fn cleanup_where(&mut self, min_age_ms: u64) -> usize {
        let now = Instant::now();
        let victims: Vec<u64> = self.entries.iter()
            .filter(|(_, e)| {
                !e.pinned
                    && e.ref_count == 1
                    && now.duration_since(e.created_at).as_millis() as u64 > min_age_ms
            })
            .map(|(&id, _)| id)
            .collect();
        let n = victims.len();
        for id in victims {
            self.release(id);
        }
        n
    }

    /// Reclaim oldest-first (by `last_accessed`) until `target_bytes` is
    /// satisfied or no more eligible candidates remain. Never touches a
    /// pinned frame or one with ref-count > 1. Returns whether anything was
    /// actually reclaimed.
    fn reclaim_until(&mut self, target_bytes: u64) -> bool {
        let mut did_reclaim = false;
        loop {
            if self.current_bytes <= target_bytes {
                break;
            }
            let victim = self.entries.iter()
                .filter(|(_, e)| !e.pinned && e.ref_count <= 1)
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(&id, _)| id);

            match victim {
                Some(id) => {
                    self.release(id);
                    did_reclaim = true;
                }
                None => break,
            }
        }
        did_reclaim
    }

    /// Close-on-shutdown: forcibly closes every frame regardless of
    /// ref-count or pin, clears the registry. Only the orchestrator should
    /// call this, during teardown.
    pub fn drain(&mut self) {
        for (_, mut e) in self.entries.drain() {
            e.frame.close();
        }
        self.current_bytes = 0;
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            active: self.entries.len(),
            current_bytes: self.current_bytes,
            max_bytes: self.max_bytes,
            utilisation: if self.max_bytes == 0 {
                0.0
            } else {
                self.current_bytes as f64 / self.max_bytes as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use velocut_core::PixelFormat;

    fn frame(w: u32, h: u32) -> RawFrame {
        RawFrame::new(0, w, h, w, h, PixelFormat::Rgba8, vec![0u8; (w * h * 4) as usize])
    }

    #[test]
    fn acquire_assigns_monotonic_ids_and_ref_count_one() {
        let mut mgr = FrameBufferManager::new(1024 * 1024);
        let (id1, w1) = mgr.acquire(frame(2, 2), FrameMeta::default());
        let (id2, w2) = mgr.acquire(frame(2, 2), FrameMeta::default());
        assert_ne!(id1, id2);
        assert!(w1.is_none());
        assert!(w2.is_none());
        assert_eq!(mgr.meta(id1).unwrap().ref_count, 1);
    }

    #[test]
    fn release_to_zero_closes_frame_and_frees_bytes() {
        let mut mgr = FrameBufferManager::new(1024 * 1024);
        let (id, _) = mgr.acquire(frame(10, 10), FrameMeta::default());
        let before = mgr.stats().current_bytes;
        assert!(before > 0);
        mgr.release(id);
        assert_eq!(mgr.stats().current_bytes, 0);
        assert!(mgr.meta(id).is_none());
    }

    #[test]
    fn release_on_unknown_id_is_a_silent_noop() {
        let mut mgr = FrameBufferManager::new(1024);
        mgr.release(9999); // must not panic
    }

    #[test]
    fn add_ref_requires_two_releases_before_closing() {
        let mut mgr = FrameBufferManager::new(1024 * 1024);
        let (id, _) = mgr.acquire(frame(4, 4), FrameMeta::default());
        mgr.add_ref(id);
        assert_eq!(mgr.meta(id).unwrap().ref_count, 2);
        mgr.release(id);
        assert!(mgr.meta(id).is_some()); // still alive
        mgr.release(id);
        assert!(mgr.meta(id).is_none()); // now closed
    }

    #[test]
    fn pinned_frames_are_never_reclaimed_by_aging() {
        let mut mgr = FrameBufferManager::new(1024 * 1024);
        let (id, _) = mgr.acquire(frame(4, 4), FrameMeta::default());
        mgr.pin(id);
        let reclaimed = mgr.force_cleanup();
        assert_eq!(reclaimed, 0);
        assert!(mgr.meta(id).is_some());

        mgr.unpin(id);
        let reclaimed = mgr.force_cleanup();
        assert_eq!(reclaimed, 1);
        assert!(mgr.meta(id).is_none());
    }

    #[test]
    fn frames_with_ref_count_above_one_are_never_reclaimed() {
        let mut mgr = FrameBufferManager::new(1024 * 1024);
        let (id, _) = mgr.acquire(frame(4, 4), FrameMeta::default());
        mgr.add_ref(id);
        assert_eq!(mgr.force_cleanup(), 0);
        assert!(mgr.meta(id).is_some());
    }

    #[test]
    fn memory_warning_fires_when_no_candidates_can_be_reclaimed() {
        // max_bytes = 8MB, five 2MB frames all pinned by the caller — no
        // reclaim path can free anything, so the fifth acquire is still
        // handed back despite pushing usage over budget.
        let mut mgr = FrameBufferManager::new(8 * 1024 * 1024);
        let size = 2 * 1024 * 1024;
        let dim = ((size / 4) as f64).sqrt() as u32; // w*h*4 == size, roughly
        let mut ids = Vec::new();
        for _ in 0..4 {
            let (id, warning) = mgr.acquire(frame(dim, dim), FrameMeta::default());
            assert!(warning.is_none());
            mgr.pin(id);
            ids.push(id);
        }
        let (_id5, warning) = mgr.acquire(frame(dim, dim), FrameMeta::default());
        let w = warning.expect("5th acquire should exceed budget with all prior pinned");
        assert!(!w.cleanup_performed);
        assert_eq!(w.max_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn stats_reports_consistent_accounting() {
        let mut mgr = FrameBufferManager::new(1024 * 1024);
        let (id1, _) = mgr.acquire(frame(10, 10), FrameMeta::default());
        let (_id2, _) = mgr.acquire(frame(20, 20), FrameMeta::default());
        let expected = 10 * 10 * 4 + 20 * 20 * 4;
        assert_eq!(mgr.stats().current_bytes, expected);
        assert_eq!(mgr.stats().active, 2);
        mgr.release(id1);
        assert_eq!(mgr.stats().current_bytes, 20 * 20 * 4);
        assert_eq!(mgr.stats().active, 1);
    }

    #[test]
    fn drain_closes_every_frame_regardless_of_pin_or_ref_count() {
        let mut mgr = FrameBufferManager::new(1024 * 1024);
        let (id, _) = mgr.acquire(frame(4, 4), FrameMeta::default());
        mgr.pin(id);
        mgr.add_ref(id);
        mgr.drain();
        assert_eq!(mgr.stats().active, 0);
        assert_eq!(mgr.stats().current_bytes, 0);
    }
}
