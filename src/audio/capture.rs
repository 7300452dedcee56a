//! Microphone capture via `cpal`.
//!
//! [`CpalDevice`] is a push-mode [`CaptureDevice`]: the cpal callback
//! converts every hardware block to native-endian 16-bit PCM and hands it to
//! the capture source through the registered [`PushSink`].
//!
//! `cpal::Stream` is not `Send`, so each session's stream lives on a
//! dedicated thread that builds it, plays it, and drops it when told to stop.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;

use super::device::{CaptureDevice, DeviceError, PushSink};
use crate::config::DeviceConfig;

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

/// Errors that can occur while opening or running a cpal input stream.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no input device found on the default audio host")]
    NoDevice,

    #[error("input device '{requested}' not found (available: {available})")]
    DeviceNotFound { requested: String, available: String },

    #[error("failed to list input devices: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("failed to query supported input configs: {0}")]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),

    #[error("failed to query default input config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("unsupported sample format {0:?}")]
    UnsupportedFormat(cpal::SampleFormat),

    #[error("audio capture thread exited before the stream started")]
    ThreadExited,
}

// ---------------------------------------------------------------------------
// Device and format selection
// ---------------------------------------------------------------------------

/// Index of the device called `wanted`.
///
/// Tries an exact match, then a case-insensitive one, then a case-insensitive
/// substring, so both full backend names and short aliases work.
fn match_device_name(names: &[String], wanted: &str) -> Option<usize> {
    let lower = wanted.to_lowercase();
    names
        .iter()
        .position(|n| n == wanted)
        .or_else(|| names.iter().position(|n| n.to_lowercase() == lower))
        .or_else(|| names.iter().position(|n| n.to_lowercase().contains(&lower)))
}

fn find_device(host: &cpal::Host, wanted: &str) -> Result<cpal::Device, CaptureError> {
    let devices: Vec<cpal::Device> = host.input_devices()?.collect();
    let names: Vec<String> = devices
        .iter()
        .map(|d| d.name().unwrap_or_default())
        .collect();

    match match_device_name(&names, wanted) {
        Some(i) => {
            log::debug!("matched input device '{}' for '{wanted}'", names[i]);
            devices.into_iter().nth(i).ok_or(CaptureError::NoDevice)
        }
        None => Err(CaptureError::DeviceNotFound {
            requested: wanted.to_string(),
            available: names.join(", "),
        }),
    }
}

/// Preference among the sample formats the callback can convert.
fn format_rank(format: cpal::SampleFormat) -> Option<u8> {
    match format {
        cpal::SampleFormat::I16 => Some(2),
        cpal::SampleFormat::F32 => Some(1),
        cpal::SampleFormat::U16 => Some(0),
        _ => None,
    }
}

fn choose_config(
    device: &cpal::Device,
    wanted: &DeviceConfig,
) -> Result<cpal::SupportedStreamConfig, CaptureError> {
    let rate = cpal::SampleRate(wanted.sample_rate);
    let matching = device
        .supported_input_configs()?
        .filter(|range| range.channels() == wanted.channels)
        .filter(|range| range.min_sample_rate() <= rate && rate <= range.max_sample_rate())
        .filter_map(|range| format_rank(range.sample_format()).map(|rank| (rank, range)))
        .max_by_key(|(rank, _)| *rank);

    if let Some((_, range)) = matching {
        return Ok(range.with_sample_rate(rate));
    }

    let fallback = device.default_input_config()?;
    log::warn!(
        "input device does not support {} Hz / {} ch; using its default {} Hz / {} ch",
        wanted.sample_rate,
        wanted.channels,
        fallback.sample_rate().0,
        fallback.channels()
    );
    Ok(fallback)
}

// ---------------------------------------------------------------------------
// Loss estimation
// ---------------------------------------------------------------------------

/// Infers dropped frames from capture timestamps.
///
/// The hardware clock says how many frames should have arrived by the time a
/// block was captured; anything beyond one block of slack that never arrived
/// is reported as lost.
#[derive(Debug)]
struct LossEstimator {
    sample_rate: u32,
    accounted: u64,
}

impl LossEstimator {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            accounted: 0,
        }
    }

    /// `elapsed` is the capture time of this block relative to the first.
    fn observe(&mut self, elapsed: Duration, frames: usize) -> u32 {
        let expected = (elapsed.as_micros() * self.sample_rate as u128 / 1_000_000) as u64;
        let lost = if expected > self.accounted + frames as u64 {
            expected - self.accounted
        } else {
            0
        };
        self.accounted += lost + frames as u64;
        lost.min(u32::MAX as u64) as u32
    }
}

// ---------------------------------------------------------------------------
// CpalDevice
// ---------------------------------------------------------------------------

enum StreamCommand {
    Stop,
}

/// Counters written by the audio callback and read by the capture source.
#[derive(Debug, Default)]
struct StreamCounters {
    position: AtomicU64,
    latency_ms: AtomicU32,
}

struct Worker {
    cmd_tx: mpsc::Sender<StreamCommand>,
    handle: thread::JoinHandle<()>,
}

impl Worker {
    /// Tell the stream thread to drop its stream, without waiting for it.
    ///
    /// Never joins: the device can be dropped on a cpal callback thread, and
    /// some backends join that callback thread from `Stream::drop`.
    fn stop(self) {
        let _ = self.cmd_tx.send(StreamCommand::Stop);
        drop(self.handle);
    }
}

/// A cpal input device delivering 16-bit PCM by callback.
///
/// # Example
///
/// ```rust,no_run
/// use pcm_capture::audio::CpalDevice;
/// use pcm_capture::config::DeviceConfig;
///
/// let device = CpalDevice::new(&DeviceConfig::default()).unwrap();
/// println!("{}", device.name());
/// ```
pub struct CpalDevice {
    device: cpal::Device,
    name: String,
    stream_config: cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    sample_rate: u32,
    channels: u16,
    sink: Option<PushSink>,
    counters: Arc<StreamCounters>,
    worker: Option<Worker>,
}

impl CpalDevice {
    /// Open the configured input device (or the system default).
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::NoDevice`] / [`CaptureError::DeviceNotFound`]
    /// when no matching input exists, or a config error when the device
    /// cannot describe its stream formats.
    pub fn new(config: &DeviceConfig) -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = match config.device_name.as_deref() {
            None | Some("default") => host.default_input_device().ok_or(CaptureError::NoDevice)?,
            Some(name) => find_device(&host, name)?,
        };
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let supported = choose_config(&device, config)?;
        let sample_format = supported.sample_format();
        if format_rank(sample_format).is_none() {
            return Err(CaptureError::UnsupportedFormat(sample_format));
        }
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let stream_config: cpal::StreamConfig = supported.into();

        log::info!("using audio device: {name} ({sample_rate} Hz, {channels} ch, {sample_format:?})");

        Ok(Self {
            device,
            name,
            stream_config,
            sample_format,
            sample_rate,
            channels,
            sink: None,
            counters: Arc::new(StreamCounters::default()),
            worker: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn spawn_stream(&self, sink: PushSink) -> Result<Worker, CaptureError> {
        let device = self.device.clone();
        let config = self.stream_config.clone();
        let format = self.sample_format;
        let params = CallbackParams {
            sink,
            counters: Arc::clone(&self.counters),
            sample_rate: self.sample_rate,
            channels: self.channels,
        };

        let (cmd_tx, cmd_rx) = mpsc::channel::<StreamCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), CaptureError>>();

        let handle = thread::spawn(move || {
            let stream = match build_stream_for(format, &device, &config, params) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(e.into()));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            log::debug!("audio capture thread started");

            // Any command, or the device going away, ends the stream.
            let _ = cmd_rx.recv();
            drop(stream);
            log::debug!("audio capture thread stopped");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Worker { cmd_tx, handle }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::ThreadExited)
            }
        }
    }
}

impl CaptureDevice for CpalDevice {
    fn start(&mut self) -> Result<(), DeviceError> {
        if self.worker.is_some() {
            return Err(DeviceError::Start("stream is already running".into()));
        }
        let sink = self
            .sink
            .clone()
            .ok_or(DeviceError::Unsupported("starting without a push sink"))?;

        self.counters.position.store(0, Ordering::Relaxed);
        let worker = self
            .spawn_stream(sink)
            .map_err(|e| DeviceError::Start(e.to_string()))?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Signals the stream thread and returns; the audio callback may be
    /// waiting on the capture source that is calling us.
    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }

    fn position(&self) -> u64 {
        self.counters.position.load(Ordering::Relaxed)
    }

    fn latency_ms(&self) -> u32 {
        self.counters.latency_ms.load(Ordering::Relaxed)
    }

    /// Push devices report loss with each delivery.
    fn frames_lost(&mut self) -> u32 {
        0
    }

    fn channel_count(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, DeviceError> {
        Err(DeviceError::Unsupported("blocking read"))
    }

    fn register_callback(&mut self, sink: PushSink) -> bool {
        self.sink = Some(sink);
        true
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Stream callback
// ---------------------------------------------------------------------------

struct CallbackParams {
    sink: PushSink,
    counters: Arc<StreamCounters>,
    sample_rate: u32,
    channels: u16,
}

fn build_stream_for(
    format: cpal::SampleFormat,
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    params: CallbackParams,
) -> Result<cpal::Stream, CaptureError> {
    match format {
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, params),
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, params),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, params),
        other => Err(CaptureError::UnsupportedFormat(other)),
    }
}

/// Convert one block of device samples to native-endian i16 bytes.
fn to_pcm16<T>(data: &[T]) -> Vec<u8>
where
    T: cpal::Sample,
    i16: cpal::FromSample<T>,
{
    data.iter()
        .flat_map(|&s| <i16 as cpal::FromSample<T>>::from_sample_(s).to_ne_bytes())
        .collect()
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    params: CallbackParams,
) -> Result<cpal::Stream, CaptureError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    i16: cpal::FromSample<T>,
{
    let CallbackParams {
        sink,
        counters,
        sample_rate,
        channels,
    } = params;
    let mut origin: Option<cpal::StreamInstant> = None;
    let mut estimator = LossEstimator::new(sample_rate);

    let stream = device.build_input_stream(
        config,
        move |data: &[T], info: &cpal::InputCallbackInfo| {
            let timestamp = info.timestamp();
            if let Some(latency) = timestamp.callback.duration_since(&timestamp.capture) {
                counters
                    .latency_ms
                    .store(latency.as_millis() as u32, Ordering::Relaxed);
            }

            let frames = data.len() / channels as usize;
            let first = *origin.get_or_insert(timestamp.capture);
            let elapsed = timestamp.capture.duration_since(&first).unwrap_or_default();
            let lost = estimator.observe(elapsed, frames);
            if lost > 0 {
                log::debug!("audio callback detected {lost} lost frames");
            }

            let pcm = to_pcm16(data);
            counters.position.fetch_add(frames as u64, Ordering::Relaxed);
            sink.deliver(&pcm, lost);
        },
        |err: cpal::StreamError| {
            log::error!("cpal stream error: {err}");
        },
        None, // no timeout
    )?;
    Ok(stream)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn device_name_matching_prefers_exact() {
        let list = names(&["USB Mic Pro", "usb mic", "Built-in Microphone"]);
        assert_eq!(match_device_name(&list, "usb mic"), Some(1));
        assert_eq!(match_device_name(&list, "USB MIC"), Some(1));
        assert_eq!(match_device_name(&list, "built-in"), Some(2));
        assert_eq!(match_device_name(&list, "line in"), None);
    }

    #[test]
    fn i16_is_the_preferred_format() {
        assert!(format_rank(cpal::SampleFormat::I16) > format_rank(cpal::SampleFormat::F32));
        assert!(format_rank(cpal::SampleFormat::F32) > format_rank(cpal::SampleFormat::U16));
        assert_eq!(format_rank(cpal::SampleFormat::F64), None);
    }

    #[test]
    fn float_samples_convert_to_pcm16() {
        let bytes = to_pcm16(&[0.0_f32, 1.0, -1.0]);
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples[0], 0);
        assert_eq!(samples[1], i16::MAX);
        assert_eq!(samples[2], i16::MIN);
    }

    #[test]
    fn unsigned_midpoint_is_silence() {
        let bytes = to_pcm16(&[32_768_u16]);
        assert_eq!(i16::from_ne_bytes([bytes[0], bytes[1]]), 0);
    }

    #[test]
    fn stopping_a_worker_does_not_wait_for_its_thread() {
        let (cmd_tx, cmd_rx) = mpsc::channel::<StreamCommand>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            let _ = cmd_rx.recv();
            // Stands in for a stream drop that cannot finish yet.
            let _ = release_rx.recv();
            let _ = done_tx.send(());
        });

        Worker { cmd_tx, handle }.stop();
        assert!(done_rx.try_recv().is_err());

        release_tx.send(()).unwrap();
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn steady_stream_reports_no_loss() {
        let mut estimator = LossEstimator::new(8_000);
        for block in 0..10_u64 {
            let elapsed = Duration::from_millis(block * 10);
            assert_eq!(estimator.observe(elapsed, 80), 0);
        }
    }

    #[test]
    fn jitter_within_one_block_is_tolerated() {
        let mut estimator = LossEstimator::new(8_000);
        assert_eq!(estimator.observe(Duration::ZERO, 80), 0);
        assert_eq!(estimator.observe(Duration::from_millis(15), 80), 0);
    }

    #[test]
    fn gap_in_capture_times_is_reported() {
        let mut estimator = LossEstimator::new(8_000);
        assert_eq!(estimator.observe(Duration::ZERO, 80), 0);
        assert_eq!(estimator.observe(Duration::from_millis(10), 80), 0);
        // 30 ms of audio never arrived.
        assert_eq!(estimator.observe(Duration::from_millis(50), 80), 240);
        assert_eq!(estimator.observe(Duration::from_millis(60), 80), 0);
    }
}
