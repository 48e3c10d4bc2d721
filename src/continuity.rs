use crate::config::PackMode;

/// What a block's timestamp said about the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuityResult {
    /// First block on the handle, establishes the baseline
    FirstBlock,
    Continuous,
    /// Samples were lost between the previous block and this one
    ForwardGap { expected: u64, actual: u64 },
    /// The timestamp went backwards. Should never happen on a healthy stream
    BackwardJump { expected: u64, actual: u64 },
}

impl ContinuityResult {
    pub fn is_violation(&self) -> bool {
        match self {
            ContinuityResult::ForwardGap { .. } | ContinuityResult::BackwardJump { .. } => true,
            _ => false,
        }
    }
}

/// Checks that consecutive blocks on one handle advance the timestamp by exactly the number of
/// samples delivered. A mismatch is counted and the expectation resynchronised to the block just
/// seen, so one loss is reported once rather than on every following block
#[derive(Debug, Clone)]
pub struct ContinuityTracker {
    pack_mode: PackMode,
    /// `None` until the first block arrives
    next_expected: Option<u64>,
    gap_count: u64,
    backward_count: u64,
}

impl ContinuityTracker {
    pub fn new(pack_mode: PackMode) -> Self {
        ContinuityTracker {
            pack_mode,
            next_expected: None,
            gap_count: 0,
            backward_count: 0,
        }
    }

    /// Check a block starting at `timestamp` carrying `payload_words` payload words
    pub fn observe(&mut self, timestamp: u64, payload_words: u32) -> ContinuityResult {
        let samples = self.pack_mode.samples_in_words(payload_words);
        let result = match self.next_expected {
            None => ContinuityResult::FirstBlock,
            Some(expected) if expected == timestamp => ContinuityResult::Continuous,
            Some(expected) if timestamp < expected => {
                self.gap_count += 1;
                self.backward_count += 1;
                ContinuityResult::BackwardJump {
                    expected,
                    actual: timestamp,
                }
            }
            Some(expected) => {
                self.gap_count += 1;
                ContinuityResult::ForwardGap {
                    expected,
                    actual: timestamp,
                }
            }
        };
        // Always resync to what we actually saw
        self.next_expected = Some(timestamp.wrapping_add(samples));
        result
    }

    /// Timestamp the next block should carry, once the first block has been seen
    pub fn next_expected(&self) -> Option<u64> {
        self.next_expected
    }

    pub fn is_tracking(&self) -> bool {
        self.next_expected.is_some()
    }

    /// Forward gaps and backward jumps, both count
    pub fn gap_count(&self) -> u64 {
        self.gap_count
    }

    pub fn backward_count(&self) -> u64 {
        self.backward_count
    }

    pub fn pack_mode(&self) -> PackMode {
        self.pack_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_block_sets_baseline() {
        let mut tracker = ContinuityTracker::new(PackMode::Unpacked);
        assert!(!tracker.is_tracking());
        assert_eq!(tracker.observe(1000, 500), ContinuityResult::FirstBlock);
        assert_eq!(tracker.next_expected(), Some(1500));
        assert_eq!(tracker.gap_count(), 0);
    }

    #[test]
    fn contiguous_stream_has_no_gaps() {
        let mut tracker = ContinuityTracker::new(PackMode::Unpacked);
        let mut ts = 77u64;
        let mut words = 1018u32;
        assert_eq!(tracker.observe(ts, words), ContinuityResult::FirstBlock);
        for i in 1..1000u32 {
            ts += u64::from(words);
            words = 1018 - (i % 3);
            assert_eq!(tracker.observe(ts, words), ContinuityResult::Continuous);
        }
        assert_eq!(tracker.gap_count(), 0);
    }

    #[test]
    fn missing_samples_are_a_forward_gap() {
        let mut tracker = ContinuityTracker::new(PackMode::Unpacked);
        assert_eq!(tracker.observe(1000, 500), ContinuityResult::FirstBlock);
        assert_eq!(tracker.observe(1500, 500), ContinuityResult::Continuous);
        assert_eq!(
            tracker.observe(2499, 500),
            ContinuityResult::ForwardGap {
                expected: 2000,
                actual: 2499
            }
        );
        assert_eq!(tracker.gap_count(), 1);
        // Resynchronised: the following block is judged against the new baseline
        assert_eq!(tracker.observe(2999, 500), ContinuityResult::Continuous);
        assert_eq!(tracker.gap_count(), 1);
    }

    #[test]
    fn backward_jump_counts_and_resyncs() {
        let mut tracker = ContinuityTracker::new(PackMode::Unpacked);
        tracker.observe(10_000, 100);
        let res = tracker.observe(9_000, 100);
        assert_eq!(
            res,
            ContinuityResult::BackwardJump {
                expected: 10_100,
                actual: 9_000
            }
        );
        assert!(res.is_violation());
        assert_eq!(tracker.gap_count(), 1);
        assert_eq!(tracker.backward_count(), 1);
        assert_eq!(tracker.observe(9_100, 100), ContinuityResult::Continuous);
    }

    #[test]
    fn repeated_block_is_backward() {
        let mut tracker = ContinuityTracker::new(PackMode::Unpacked);
        tracker.observe(0, 64);
        tracker.observe(64, 64);
        assert!(tracker.observe(64, 64).is_violation());
    }

    #[test]
    fn packed_mode_advances_by_samples() {
        let mut tracker = ContinuityTracker::new(PackMode::Packed);
        tracker.observe(0, 1017);
        assert_eq!(tracker.next_expected(), Some(1356));
        assert_eq!(tracker.observe(1356, 1017), ContinuityResult::Continuous);
        // Advancing by words instead of samples would be a gap in packed mode
        assert!(tracker.observe(1356 * 2 + 1017, 1017).is_violation());
    }
}
