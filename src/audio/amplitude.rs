//! Peak amplitude meter for level displays.
//!
//! The meter is dormant until someone asks for a reading: the first call to
//! [`AmplitudeTracker::take_peak`] switches it on, and the capture source only
//! feeds samples into an active tracker.  Every reading returns the peak since
//! the previous reading and starts over from zero.

/// Tracks the largest absolute 16-bit sample value seen since the last query.
#[derive(Debug, Default, Clone)]
pub struct AmplitudeTracker {
    active: bool,
    peak: u16,
}

impl AmplitudeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a reading has been requested since the last [`reset`](Self::reset).
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Fold native-endian PCM bytes into the running peak.
    pub fn observe_bytes(&mut self, data: &[u8]) {
        for sample in data.chunks_exact(2) {
            self.observe_sample(i16::from_ne_bytes([sample[0], sample[1]]));
        }
    }

    fn observe_sample(&mut self, sample: i16) {
        self.peak = self.peak.max(sample.unsigned_abs());
    }

    /// Return the peak since the previous call and reset it.
    ///
    /// The first call activates tracking.
    pub fn take_peak(&mut self) -> u16 {
        self.active = true;
        std::mem::take(&mut self.peak)
    }

    /// Deactivate and clear, as at the start of a new session.
    pub fn reset(&mut self) {
        self.active = false;
        self.peak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
    }

    #[test]
    fn reports_peak_then_resets() {
        let mut tracker = AmplitudeTracker::new();
        tracker.observe_bytes(&pcm(&[-100, 50, 200, -300]));
        assert_eq!(tracker.take_peak(), 300);
        assert_eq!(tracker.take_peak(), 0);
    }

    #[test]
    fn first_query_activates() {
        let mut tracker = AmplitudeTracker::new();
        assert!(!tracker.is_active());
        tracker.take_peak();
        assert!(tracker.is_active());

        tracker.reset();
        assert!(!tracker.is_active());
    }

    #[test]
    fn peak_spans_several_blocks() {
        let mut tracker = AmplitudeTracker::new();
        tracker.observe_bytes(&pcm(&[12, -7_000]));
        tracker.observe_bytes(&pcm(&[6_999]));
        assert_eq!(tracker.take_peak(), 7_000);
    }

    #[test]
    fn most_negative_sample_does_not_overflow() {
        let mut tracker = AmplitudeTracker::new();
        tracker.observe_bytes(&pcm(&[i16::MIN]));
        assert_eq!(tracker.take_peak(), 32_768);
    }
}
