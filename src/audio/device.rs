//! The hardware side of a capture session.
//!
//! A [`CaptureDevice`] supplies 16-bit PCM either on demand through
//! [`CaptureDevice::read`] (pull mode) or by pushing blocks into the
//! [`PushSink`] it was handed at registration (push mode).  The capture source
//! decides the mode once, when it is built, from the return value of
//! [`CaptureDevice::register_callback`].

use std::sync::Weak;

use thiserror::Error;

use super::loss::BYTES_PER_SAMPLE;

// ---------------------------------------------------------------------------
// DeviceError
// ---------------------------------------------------------------------------

/// Failures reported by a capture device.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("audio input device is unavailable: {0}")]
    Unavailable(String),

    #[error("audio input device failed to start: {0}")]
    Start(String),

    #[error("audio input read failed: {0}")]
    Read(String),

    #[error("audio input returned no data")]
    NoData,

    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),
}

// ---------------------------------------------------------------------------
// CaptureDevice
// ---------------------------------------------------------------------------

/// An audio-input device delivering signed 16-bit PCM.
///
/// Every method is called with the capture source's session lock held, so
/// implementations never see concurrent calls from the source.  A pull-mode
/// `read` may block for as long as the hardware needs.
pub trait CaptureDevice: Send + 'static {
    /// Result of binding to the hardware when the device was created.
    fn init_check(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError>;

    fn stop(&mut self);

    /// Frames recorded since the device was started.
    fn position(&self) -> u64;

    /// Input latency in milliseconds.
    fn latency_ms(&self) -> u32;

    /// Frames dropped by the hardware since the previous call.
    fn frames_lost(&mut self) -> u32;

    fn channel_count(&self) -> u16;

    fn sample_rate(&self) -> u32;

    /// Bytes per frame.
    fn frame_size(&self) -> usize {
        self.channel_count() as usize * BYTES_PER_SAMPLE
    }

    /// Blocking read into `buf`; returns the number of bytes written.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    /// Offer a sink for pushed data.
    ///
    /// Devices that deliver data by callback keep the sink and return `true`;
    /// pull-only devices return `false` and are read from instead.
    fn register_callback(&mut self, sink: PushSink) -> bool {
        let _ = sink;
        false
    }
}

// ---------------------------------------------------------------------------
// PushSink
// ---------------------------------------------------------------------------

/// Receives blocks pushed by a device callback.
pub(crate) trait PushTarget: Send + Sync {
    fn on_data(&self, data: &[u8], frames_lost: u32, time_us: Option<i64>);
}

/// Handle a push-mode device uses to deliver captured audio.
///
/// The sink holds only a weak reference to the capture source, so a device
/// thread that outlives the source delivers into nothing.
#[derive(Clone)]
pub struct PushSink {
    target: Weak<dyn PushTarget>,
}

impl PushSink {
    pub(crate) fn new(target: Weak<dyn PushTarget>) -> Self {
        Self { target }
    }

    /// Deliver `data` captured now, with `frames_lost` dropped since the
    /// previous delivery.
    pub fn deliver(&self, data: &[u8], frames_lost: u32) {
        if let Some(target) = self.target.upgrade() {
            target.on_data(data, frames_lost, None);
        }
    }

    /// Deliver `data` captured at an explicit wall time.
    pub fn deliver_at(&self, data: &[u8], frames_lost: u32, time_us: i64) {
        if let Some(target) = self.target.upgrade() {
            target.on_data(data, frames_lost, Some(time_us));
        }
    }

    /// Whether the capture source behind this sink still exists.
    pub fn is_connected(&self) -> bool {
        self.target.strong_count() > 0
    }
}

impl std::fmt::Debug for PushSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSink")
            .field("connected", &self.is_connected())
            .finish()
    }
}
