//! Real-time PCM capture with a reconciled session clock.
//!
//! * [`audio`]: the capture source, the device abstraction and its cpal
//!   backend, plus the timing, loss, fade-in and level helpers they use.
//! * [`config`]: TOML settings and platform paths.

pub mod audio;
pub mod config;
