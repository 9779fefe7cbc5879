// crates/velocut-core/src/slot.rs
//
// FrameSlot — the element type of the ProgressiveFrameGrid.

use crate::frame::RawFrame;

/// Quality level of one grid slot. Distinct from the continuous 0.0-1.0
/// decode-time quality score used by `FrameRateController` — this is a
/// coarse state machine: `Empty -> {LowRes, HighRes}`, with `Interpolated`
/// as a synthetic fallback when a slot has never been sampled directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotQuality {
    Empty,
    Interpolated,
    LowRes,
    HighRes,
}

/// One slot of the fixed-length progressive grid.
///
/// `timestamp_secs` is fixed at construction (`index / target_fps`) and
/// never changes. `source_index`, when set, points at the nearest prior
/// slot with real (non-interpolated) data; it is only meaningful while
/// `quality == Interpolated` and must refer to a slot whose `data` is
/// `Some` at display time.
pub struct FrameSlot {
    pub index:          usize,
    pub timestamp_secs:  f64,
    pub quality:         SlotQuality,
    pub data:            Option<RawFrame>,
    pub source_index:    Option<usize>,
}

impl FrameSlot {
    pub fn empty(index: usize, timestamp_secs: f64) -> Self {
        Self {
            index,
            timestamp_secs,
            quality: SlotQuality::Empty,
            data: None,
            source_index: None,
        }
    }

    /// Resolve what this slot should display: its own data if present, else
    /// the source slot's data for `Interpolated` slots, else `None`.
    pub fn display_data<'a>(&'a self, all_slots: &'a [FrameSlot]) -> Option<&'a RawFrame> {
        if let Some(frame) = &self.data {
            return Some(frame);
        }
        match self.quality {
            SlotQuality::Interpolated => {
                let src = self.source_index?;
                all_slots.get(src).and_then(|s| s.data.as_ref())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    #[test]
    fn interpolated_slot_resolves_through_source_index() {
        let mut real = FrameSlot::empty(0, 0.0);
        real.quality = SlotQuality::LowRes;
        real.data = Some(RawFrame::new(0, 4, 4, 4, 4, PixelFormat::Rgba8, vec![9u8; 64]));

        let mut interp = FrameSlot::empty(1, 1.0 / 24.0);
        interp.quality = SlotQuality::Interpolated;
        interp.source_index = Some(0);

        let slots = vec![real, interp];
        let resolved = slots[1].display_data(&slots).expect("should resolve via source_index");
        assert_eq!(resolved.data().unwrap(), &[9u8; 64][..]);
    }

    #[test]
    fn empty_slot_with_no_source_resolves_to_none() {
        let slots = vec![FrameSlot::empty(0, 0.0)];
        assert!(slots[0].display_data(&slots).is_none());
    }
}
