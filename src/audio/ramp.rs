//! Start-of-recording fade-in.
//!
//! Microphones with automatic gain control produce a loud transient in the
//! first few hundred milliseconds of a session.  [`FadeIn`] mutes an optional
//! leading window and then ramps the amplitude linearly from silence to full
//! scale, so the recording starts without a click.
//!
//! Samples are native-endian signed 16-bit PCM, interleaved when stereo.

use super::loss::BYTES_PER_SAMPLE;

/// Fixed-point precision of the ramp multiplier (Q14).
const SHIFT: u32 = 14;

/// Convert a duration to a frame count at `sample_rate`, rounding to nearest.
pub fn us_to_frames(us: i64, sample_rate: u32) -> i64 {
    (us * sample_rate as i64 + 500_000) / 1_000_000
}

fn fixed_multiplier(frame: i64, ramp_frames: i64) -> i32 {
    ((frame.clamp(0, ramp_frames) << SHIFT) / ramp_frames) as i32
}

/// Scale `data` by a linear ramp that reaches full scale at `ramp_frames`.
///
/// `start_frame` is the ramp position of the first frame in `data`.  The
/// multiplier is refreshed every 4 frames; frames at or beyond
/// `ramp_frames` are left untouched.
pub fn ramp_volume(start_frame: i64, ramp_frames: i64, channels: u16, data: &mut [u8]) {
    if ramp_frames <= 0 {
        return;
    }

    let stride = channels as usize * BYTES_PER_SAMPLE;
    let mut multiplier = fixed_multiplier(start_frame, ramp_frames);

    for (i, frame) in data.chunks_exact_mut(stride).enumerate() {
        let index = start_frame + i as i64;
        if index >= ramp_frames {
            break;
        }
        if i > 0 && index & 3 == 0 {
            multiplier = fixed_multiplier(index, ramp_frames);
        }
        for sample in frame.chunks_exact_mut(BYTES_PER_SAMPLE) {
            let value = i16::from_ne_bytes([sample[0], sample[1]]) as i32;
            let scaled = ((value * multiplier) >> SHIFT) as i16;
            sample.copy_from_slice(&scaled.to_ne_bytes());
        }
    }
}

// ---------------------------------------------------------------------------
// FadeIn
// ---------------------------------------------------------------------------

/// Mute window followed by a linear ramp, both measured from session start.
#[derive(Debug, Clone, Copy)]
pub struct FadeIn {
    mute_us: i64,
    ramp_us: i64,
    mute_frames: i64,
    ramp_frames: i64,
}

impl FadeIn {
    pub fn new(mute_us: i64, ramp_us: i64, sample_rate: u32) -> Self {
        Self {
            mute_us,
            ramp_us,
            mute_frames: us_to_frames(mute_us, sample_rate),
            ramp_frames: us_to_frames(ramp_us, sample_rate),
        }
    }

    /// Apply the fade to one block of real samples.
    ///
    /// `elapsed_us` is the session time at the start of the block and
    /// `frame_index` the number of frames recorded before it.
    pub fn apply(&self, elapsed_us: i64, frame_index: i64, channels: u16, data: &mut [u8]) {
        if elapsed_us < self.mute_us {
            data.fill(0);
        } else if elapsed_us < self.mute_us + self.ramp_us {
            ramp_volume(frame_index - self.mute_frames, self.ramp_frames, channels, data);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
