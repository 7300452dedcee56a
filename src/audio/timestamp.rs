//! Session clock for captured audio.
//!
//! The device counts samples; the host counts wall time.  The
//! [`TimestampReconciler`] derives every buffer's presentation time from the
//! sample count alone, anchored once per session to either the device latency
//! or a caller-supplied start time.  Frames the hardware dropped are turned
//! into silence that occupies the same span of time, so the sample clock never
//! falls behind and never jumps backwards.
//!
//! ```text
//!  start_us          prev_sample_us
//!     |---- silence ----|---- samples ----|---- samples ----| ...
//!     ^ anchor          ^ time_us         ^ time_us
//! ```

use super::buffer::BufferMeta;
use super::loss::{FrameLossTracker, BYTES_PER_SAMPLE};

/// Skip requests reaching this far past the current position are rejected.
pub const MAX_SKIP_US: i64 = 1_000_000;

/// Duration of `frames` at `sample_rate`, rounded to the nearest microsecond.
pub fn duration_us(frames: usize, sample_rate: u32) -> i64 {
    let rate = sample_rate as i64;
    (1_000_000 * frames as i64 + rate / 2) / rate
}

// ---------------------------------------------------------------------------
// Skip classification
// ---------------------------------------------------------------------------

/// What to do with a candidate buffer when the caller asked to skip ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    /// No cutoff, or the buffer already reaches it.
    Deliver,
    /// Discard this buffer and try the next one.
    Skip,
    /// The cutoff is implausibly far ahead; fail the read.
    TooFar { gap_us: i64 },
}

/// Classify a buffer ending at `timestamp_us` against an optional cutoff.
pub fn classify_skip(timestamp_us: i64, skip_to_us: Option<i64>) -> SkipDecision {
    let Some(skip_to_us) = skip_to_us else {
        return SkipDecision::Deliver;
    };
    if skip_to_us <= timestamp_us {
        return SkipDecision::Deliver;
    }

    let gap_us = skip_to_us - timestamp_us;
    if gap_us >= MAX_SKIP_US {
        log::error!("frame skip requested is way too long: {gap_us} us");
        return SkipDecision::TooFar { gap_us };
    }

    log::trace!("skip frame: {skip_to_us} us > timestamp {timestamp_us} us");
    SkipDecision::Skip
}

// ---------------------------------------------------------------------------
// TimestampReconciler
// ---------------------------------------------------------------------------

/// The interval of session time a candidate buffer would cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start_us: i64,
    pub end_us: i64,
}

/// Per-session timing state.
#[derive(Debug, Clone)]
pub struct TimestampReconciler {
    sample_rate: u32,
    channels: u16,
    /// Caller-supplied start time, consumed by the first buffer.
    start_override_us: Option<i64>,
    start_us: i64,
    prev_sample_us: i64,
    initial_read_us: i64,
    established: bool,
    first_emitted: bool,
    loss: FrameLossTracker,
}

impl TimestampReconciler {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            start_override_us: None,
            start_us: 0,
            prev_sample_us: 0,
            initial_read_us: 0,
            established: false,
            first_emitted: false,
            loss: FrameLossTracker::new(channels),
        }
    }

    /// Forget the previous session.
    pub fn reset(&mut self, start_override_us: Option<i64>) {
        *self = Self {
            start_override_us,
            ..Self::new(self.sample_rate, self.channels)
        };
    }

    /// Whether the first buffer of the session has fixed the start time.
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Fix the session start on the first buffer; later calls do nothing.
    ///
    /// With a caller-supplied start time the start becomes the distance
    /// between that time and `now_us`; otherwise the device latency is taken
    /// as a constant offset.
    pub fn establish(&mut self, now_us: i64, latency_ms: u32) {
        if self.established {
            return;
        }
        self.initial_read_us = now_us;
        self.start_us = match self.start_override_us {
            Some(start) if start > 0 => now_us - start,
            _ => latency_ms as i64 * 1000,
        };
        self.prev_sample_us = self.start_us;
        self.established = true;
        log::debug!(
            "session clock established: start {} us, initial read {} us",
            self.start_us,
            now_us
        );
    }

    pub fn start_override_us(&self) -> Option<i64> {
        self.start_override_us
    }

    pub fn start_us(&self) -> i64 {
        self.start_us
    }

    /// Sample-clock time elapsed since the session start.
    pub fn elapsed_us(&self) -> i64 {
        self.prev_sample_us - self.start_us
    }

    /// Bytes of silence to emit for `frames_lost`, capped at `capacity`.
    pub fn take_lost(&mut self, frames_lost: u32, capacity: usize) -> usize {
        let bytes = self.loss.take(frames_lost, capacity);
        if bytes > 0 {
            log::debug!(
                "inserting {bytes} bytes of silence ({} bytes carried)",
                self.loss.carried_bytes()
            );
        }
        bytes
    }

    pub fn loss(&self) -> &FrameLossTracker {
        &self.loss
    }

    pub fn loss_mut(&mut self) -> &mut FrameLossTracker {
        &mut self.loss
    }

    /// Whole frames contained in `bytes`.
    pub fn frames_in(&self, bytes: usize) -> usize {
        self.loss.frames_in(bytes)
    }

    /// The span `bytes` of PCM would occupy after the last committed buffer.
    ///
    /// # Panics
    ///
    /// Panics on an odd byte count or when the span would not advance the
    /// clock.  Either means the caller broke the sample-alignment contract.
    pub fn span_for(&self, bytes: usize) -> Span {
        assert_eq!(bytes % BYTES_PER_SAMPLE, 0, "PCM block of {bytes} bytes is not sample aligned");
        let start_us = self.prev_sample_us;
        let end_us = start_us + duration_us(self.frames_in(bytes), self.sample_rate);
        assert!(
            end_us > start_us,
            "sample clock must advance: {end_us} us after {start_us} us"
        );
        Span { start_us, end_us }
    }

    /// Move the clock past a span that will not be delivered.
    pub fn skip(&mut self, span: Span) {
        self.advance(span);
    }

    /// Commit a span and build the metadata for the buffer that carries it.
    pub fn emit(&mut self, span: Span, now_us: i64) -> BufferMeta {
        self.advance(span);
        let anchor_time_us = (!self.first_emitted).then_some(self.start_us);
        self.first_emitted = true;
        BufferMeta {
            time_us: span.start_us,
            anchor_time_us,
            drift_time_us: now_us - self.initial_read_us,
        }
    }

    fn advance(&mut self, span: Span) {
        assert_eq!(
            span.start_us, self.prev_sample_us,
            "span does not continue the session clock"
        );
        self.prev_sample_us = span.end_us;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_rounds_to_nearest_us() {
        assert_eq!(duration_us(80, 8_000), 10_000);
        assert_eq!(duration_us(1, 44_100), 23); // 22.68
        assert_eq!(duration_us(1, 48_000), 21); // 20.83
    }

    #[test]
    fn skip_classification() {
        assert_eq!(classify_skip(5_000, None), SkipDecision::Deliver);
        assert_eq!(classify_skip(5_000, Some(5_000)), SkipDecision::Deliver);
        assert_eq!(classify_skip(5_000, Some(4_000)), SkipDecision::Deliver);
        assert_eq!(classify_skip(5_000, Some(15_000)), SkipDecision::Skip);
        assert_eq!(
            classify_skip(5_000, Some(1_005_000)),
            SkipDecision::TooFar { gap_us: 1_000_000 }
        );
    }

    #[test]
    fn start_defaults_to_device_latency() {
        let mut clock = TimestampReconciler::new(8_000, 1);
        clock.establish(123_456, 40);
        assert_eq!(clock.start_us(), 40_000);
        assert_eq!(clock.elapsed_us(), 0);
    }

    #[test]
    fn start_override_is_an_offset_from_now() {
        let mut clock = TimestampReconciler::new(8_000, 1);
        clock.reset(Some(4_000_000));
        clock.establish(5_000_000, 40);
        assert_eq!(clock.start_us(), 1_000_000);
    }

    #[test]
    fn establish_only_once() {
        let mut clock = TimestampReconciler::new(8_000, 1);
        clock.establish(0, 10);
        clock.establish(99, 50);
        assert_eq!(clock.start_us(), 10_000);
    }

    #[test]
    fn anchor_only_on_first_buffer() {
        let mut clock = TimestampReconciler::new(8_000, 1);
        clock.establish(1_000, 5);

        let first = clock.emit(clock.span_for(160), 1_000);
        assert_eq!(first.anchor_time_us, Some(5_000));
        assert_eq!(first.time_us, 5_000);
        assert_eq!(first.drift_time_us, 0);

        let second = clock.emit(clock.span_for(160), 13_000);
        assert_eq!(second.anchor_time_us, None);
        assert_eq!(second.time_us, 15_000);
        assert_eq!(second.drift_time_us, 12_000);
    }

    #[test]
    fn skipped_spans_still_advance_time() {
        let mut clock = TimestampReconciler::new(8_000, 1);
        clock.establish(0, 0);
        let span = clock.span_for(160);
        clock.skip(span);
        let meta = clock.emit(clock.span_for(160), 0);
        assert_eq!(meta.time_us, 10_000);
        // Skipping never produced a buffer, so the anchor is still pending.
        assert_eq!(meta.anchor_time_us, Some(0));
    }

    #[test]
    fn stereo_spans_count_frames() {
        let mut clock = TimestampReconciler::new(8_000, 2);
        clock.establish(0, 0);
        // 320 bytes of stereo = 80 frames = 10 ms
        assert_eq!(clock.span_for(320).end_us, 10_000);
    }

    #[test]
    #[should_panic(expected = "sample aligned")]
    fn odd_byte_count_is_fatal() {
        let clock = TimestampReconciler::new(8_000, 1);
        clock.span_for(3);
    }

    #[test]
    #[should_panic(expected = "sample clock must advance")]
    fn empty_span_is_fatal() {
        let clock = TimestampReconciler::new(8_000, 1);
        clock.span_for(0);
    }

    #[test]
    fn reset_keeps_format_and_clears_state() {
        let mut clock = TimestampReconciler::new(8_000, 1);
        clock.establish(0, 20);
        clock.emit(clock.span_for(160), 0);
        clock.loss_mut().record(40);

        clock.reset(None);
        assert!(!clock.is_established());
        assert_eq!(clock.loss().total_lost_frames(), 0);
        clock.establish(0, 0);
        let meta = clock.emit(clock.span_for(160), 0);
        assert_eq!(meta.anchor_time_us, Some(0));
    }
}
