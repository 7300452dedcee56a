//! Scripted capture device for exercising the capture source without
//! hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::device::{CaptureDevice, DeviceError, PushSink};

/// Behaviour and call counters shared between a [`ScriptedDevice`] and the
/// test driving it.
#[derive(Debug, Default)]
pub struct Script {
    pub sample_rate: u32,
    pub channels: u16,
    pub latency_ms: u32,
    pub init_error: Option<DeviceError>,
    pub start_error: Option<DeviceError>,
    pub push: bool,
    /// Sample value used to fill reads that have no scripted result.
    pub fill: i16,
    pub reads: VecDeque<Result<Vec<i16>, DeviceError>>,
    /// Lost-frame counts returned by successive `frames_lost` calls.
    pub lost: VecDeque<u32>,
    pub position: u64,
    pub start_calls: usize,
    pub stop_calls: usize,
    pub read_calls: usize,
    pub sink: Option<PushSink>,
}

#[derive(Clone)]
pub struct ScriptHandle(Arc<Mutex<Script>>);

impl ScriptHandle {
    pub fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    /// The sink registered by the capture source (push devices only).
    pub fn sink(&self) -> PushSink {
        self.with(|s| s.sink.clone()).expect("device was not registered for push")
    }
}

pub struct ScriptedDevice {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDevice {
    /// A pull-mode device.
    pub fn new(sample_rate: u32, channels: u16) -> (Self, ScriptHandle) {
        Self::build(sample_rate, channels, false)
    }

    /// A device that accepts a push callback.
    pub fn pushing(sample_rate: u32, channels: u16) -> (Self, ScriptHandle) {
        Self::build(sample_rate, channels, true)
    }

    fn build(sample_rate: u32, channels: u16, push: bool) -> (Self, ScriptHandle) {
        let script = Arc::new(Mutex::new(Script {
            sample_rate,
            channels,
            push,
            ..Script::default()
        }));
        (
            Self {
                script: Arc::clone(&script),
            },
            ScriptHandle(script),
        )
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }
}

impl CaptureDevice for ScriptedDevice {
    fn init_check(&self) -> Result<(), DeviceError> {
        match self.script().init_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let mut script = self.script();
        if let Some(e) = script.start_error.clone() {
            return Err(e);
        }
        script.start_calls += 1;
        script.position = 0;
        Ok(())
    }

    fn stop(&mut self) {
        self.script().stop_calls += 1;
    }

    fn position(&self) -> u64 {
        self.script().position
    }

    fn latency_ms(&self) -> u32 {
        self.script().latency_ms
    }

    fn frames_lost(&mut self) -> u32 {
        self.script().lost.pop_front().unwrap_or(0)
    }

    fn channel_count(&self) -> u16 {
        self.script().channels
    }

    fn sample_rate(&self) -> u32 {
        self.script().sample_rate
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let mut script = self.script();
        script.read_calls += 1;
        let samples = match script.reads.pop_front() {
            Some(result) => result?,
            None => vec![script.fill; buf.len() / 2],
        };

        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        script.position += (n / (2 * script.channels as usize)) as u64;
        Ok(n)
    }

    fn register_callback(&mut self, sink: PushSink) -> bool {
        let mut script = self.script();
        if script.push {
            script.sink = Some(sink);
        }
        script.push
    }
}
