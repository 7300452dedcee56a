//! Audio capture: device → capture source → timestamped sample buffers.
//!
//! # Pipeline
//!
//! ```text
//! CaptureDevice ──read()/PushSink──▶ CaptureSource ──read()──▶ SampleBuffer
//!                                     │ FrameLossTracker (silence for drops)
//!                                     │ TimestampReconciler (session clock)
//!                                     │ FadeIn (mute + ramp)
//!                                     │ AmplitudeTracker (peak level)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pcm_capture::audio::{CaptureSource, CpalDevice, ReadOptions, StartOptions};
//! use pcm_capture::config::AppConfig;
//!
//! let config = AppConfig::default();
//! let source = CaptureSource::new(CpalDevice::new(&config.device).unwrap(), &config.capture).unwrap();
//! source.start(&StartOptions::default()).unwrap();
//!
//! if let Some(buffer) = source.read(&ReadOptions::default()).unwrap() {
//!     println!("{} bytes @ {} us", buffer.len(), buffer.meta().time_us);
//! }
//! ```

pub mod amplitude;
pub mod buffer;
pub mod capture;
pub mod clock;
pub mod device;
pub mod loss;
pub mod ramp;
pub mod source;
pub mod timestamp;

#[cfg(test)]
mod fake;

pub use amplitude::AmplitudeTracker;
pub use buffer::{BufferMeta, BufferOrigin, BufferPool, SampleBuffer};
pub use capture::{CaptureError, CpalDevice};
pub use clock::{SystemClock, WallClock};
pub use device::{CaptureDevice, DeviceError, PushSink};
pub use loss::FrameLossTracker;
pub use ramp::FadeIn;
pub use source::{
    AudioFormat, CaptureMode, CaptureSource, CaptureStats, ReadOptions, SourceError, StartOptions,
};
pub use timestamp::{duration_us, SkipDecision, TimestampReconciler, MAX_SKIP_US};
