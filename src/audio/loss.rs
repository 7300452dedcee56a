//! Hardware frame-loss accounting.
//!
//! Devices report how many frames they dropped since the last query.  The
//! capture source turns that count into a byte length of silence so the
//! session clock keeps advancing across the gap.  A single silence buffer
//! never exceeds one buffer's capacity; whatever does not fit is carried into
//! the next call.
//!
//! # Example
//!
//! ```rust
//! use pcm_capture::audio::FrameLossTracker;
//!
//! let mut tracker = FrameLossTracker::new(1);
//! // 300 mono frames = 600 bytes, but only 256 fit in one buffer.
//! assert_eq!(tracker.take(300, 256), 256);
//! assert_eq!(tracker.take(0, 256), 256);
//! assert_eq!(tracker.take(0, 256), 88);
//! assert_eq!(tracker.take(0, 256), 0);
//! ```

/// Bytes per 16-bit PCM sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Convert a lost-frame count into bytes of 16-bit PCM.
///
/// The result is always even, because every frame holds `channels` whole
/// 16-bit samples.
pub fn lost_bytes(frames: u32, channels: u16) -> usize {
    frames as usize * channels as usize * BYTES_PER_SAMPLE
}

// ---------------------------------------------------------------------------
// FrameLossTracker
// ---------------------------------------------------------------------------

/// Converts device loss reports into silence lengths and keeps the remainder
/// that did not fit into the previous buffer.
#[derive(Debug, Clone)]
pub struct FrameLossTracker {
    channels: u16,
    /// Lost bytes still owed to the stream from an earlier report.
    carried_bytes: usize,
    /// Lost frames emitted as silence this session.
    total_lost_frames: u64,
}

impl FrameLossTracker {
    pub fn new(channels: u16) -> Self {
        Self {
            channels,
            carried_bytes: 0,
            total_lost_frames: 0,
        }
    }

    /// Fold `frames_lost` into the carried remainder and return how many bytes
    /// of silence to emit now (at most `capacity`).
    pub fn take(&mut self, frames_lost: u32, capacity: usize) -> usize {
        let pending = self.carried_bytes + lost_bytes(frames_lost, self.channels);
        if pending > capacity {
            self.carried_bytes = pending - capacity;
            capacity
        } else {
            self.carried_bytes = 0;
            pending
        }
    }

    /// Count `bytes` of emitted silence towards the session total.
    pub fn record(&mut self, bytes: usize) {
        self.total_lost_frames += self.frames_in(bytes) as u64;
    }

    /// Number of whole frames in `bytes` of PCM for this channel layout.
    pub fn frames_in(&self, bytes: usize) -> usize {
        bytes / (self.channels as usize * BYTES_PER_SAMPLE)
    }

    /// Lost bytes carried over to the next call.
    pub fn carried_bytes(&self) -> usize {
        self.carried_bytes
    }

    /// Lost frames recorded this session.
    pub fn total_lost_frames(&self) -> u64 {
        self.total_lost_frames
    }

    /// Put `bytes` returned by [`take`](Self::take) back in front of the
    /// carried remainder, for silence that could not be emitted.
    pub fn restore(&mut self, bytes: usize) {
        self.carried_bytes += bytes;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scale_with_channels() {
        assert_eq!(lost_bytes(0, 1), 0);
        assert_eq!(lost_bytes(10, 1), 20);
        assert_eq!(lost_bytes(10, 2), 40);
    }

    #[test]
    fn bytes_are_always_even() {
        for frames in [1_u32, 3, 7, 1001] {
            for channels in [1_u16, 2] {
                assert_eq!(lost_bytes(frames, channels) % 2, 0);
            }
        }
    }

    #[test]
    fn loss_within_capacity_is_emitted_whole() {
        let mut tracker = FrameLossTracker::new(1);
        assert_eq!(tracker.take(100, 2048), 200);
        assert_eq!(tracker.carried_bytes(), 0);
    }

    #[test]
    fn oversized_loss_is_split_and_carried() {
        let mut tracker = FrameLossTracker::new(1);
        // K = 1000 frames → 2000 bytes against a 512 byte buffer.
        let mut emitted = Vec::new();
        let mut reported = 1000;
        loop {
            let n = tracker.take(reported, 512);
            reported = 0;
            if n == 0 {
                break;
            }
            emitted.push(n);
        }
        assert_eq!(emitted, vec![512, 512, 512, 464]);
        assert_eq!(emitted.iter().sum::<usize>(), 2000);
    }

    #[test]
    fn new_loss_adds_to_carried_remainder() {
        let mut tracker = FrameLossTracker::new(2);
        assert_eq!(tracker.take(200, 512), 512); // 800 bytes pending
        assert_eq!(tracker.carried_bytes(), 288);
        assert_eq!(tracker.take(10, 512), 328);
        assert_eq!(tracker.carried_bytes(), 0);
    }

    #[test]
    fn record_counts_frames_not_bytes() {
        let mut tracker = FrameLossTracker::new(2);
        tracker.record(400);
        assert_eq!(tracker.total_lost_frames(), 100);
        assert_eq!(tracker.carried_bytes(), 0);
    }

    #[test]
    fn restored_silence_is_emitted_again() {
        let mut tracker = FrameLossTracker::new(1);
        assert_eq!(tracker.take(300, 256), 256);
        tracker.restore(256);
        assert_eq!(tracker.carried_bytes(), 600);
        assert_eq!(tracker.take(0, 1024), 600);
        assert_eq!(tracker.total_lost_frames(), 0);
    }
}
