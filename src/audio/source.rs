//! Capture session state machine.
//!
//! [`CaptureSource`] sits between a [`CaptureDevice`] and one consumer (an
//! encoder, a level meter, ...).  It turns raw device output into
//! [`SampleBuffer`]s with a continuous, strictly increasing session clock and
//! enforces the buffer ownership contract.
//!
//! # States
//!
//! ```text
//! new() ──▶ Stopped ──start()──▶ Started ──stop()──▶ Draining ──▶ Stopped
//!                                                  (waits for borrowed
//!                                                   buffers to return)
//! ```
//!
//! # Modes
//!
//! * **Pull**: [`CaptureSource::read`] takes a buffer from the pool and
//!   blocks in the device's own `read`.
//! * **Push**: the device delivers blocks through a [`PushSink`] from its own
//!   thread; they are timestamped, queued and handed out by `read`.
//!
//! All session state sits behind one mutex.  Two condition variables wake
//! waiters: `frame_available` when a pushed buffer is queued, and
//! `buffers_returned` when the consumer gives a buffer back.
//!
//! # Example
//!
//! ```rust,no_run
//! use pcm_capture::audio::{CaptureSource, CpalDevice, ReadOptions};
//! use pcm_capture::config::AppConfig;
//!
//! let config = AppConfig::default();
//! let device = CpalDevice::new(&config.device).unwrap();
//! let source = CaptureSource::new(device, &config.capture).unwrap();
//!
//! source.start(&config.capture.start_options()).unwrap();
//! while let Some(buffer) = source.read(&ReadOptions::default()).unwrap() {
//!     println!("{} bytes @ {} us", buffer.len(), buffer.meta().time_us);
//!     buffer.release();
//! #   break;
//! }
//! source.stop().unwrap();
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;

use super::amplitude::AmplitudeTracker;
use super::buffer::{BufferMeta, BufferOrigin, BufferPool, BufferRecycler, SampleBuffer};
use super::clock::{SystemClock, WallClock};
use super::device::{CaptureDevice, DeviceError, PushSink, PushTarget};
use super::ramp::FadeIn;
use super::timestamp::{classify_skip, duration_us, SkipDecision, TimestampReconciler};
use crate::config::CaptureConfig;

// ---------------------------------------------------------------------------
// SourceError
// ---------------------------------------------------------------------------

/// Errors surfaced by [`CaptureSource`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    /// The device failed its init check; this source can never start.
    #[error("capture device failed to initialise")]
    NotInitialized,

    #[error("capture source is already started")]
    AlreadyStarted,

    #[error("capture source is not running")]
    NotRunning,

    #[error("failed to read from capture device: {0}")]
    DeviceReadError(#[source] DeviceError),

    /// A skip request pointed one second or more past the current position.
    #[error("requested frame skip of {gap_us} us is too long")]
    SkipBoundsExceeded { gap_us: i64 },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("unsupported channel count {0} (expected 1 or 2)")]
    UnsupportedChannelCount(u16),

    #[error("unsupported sample rate {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("buffer capacity {capacity} is not a positive multiple of the {frame_size} byte frame")]
    InvalidBufferCapacity { capacity: usize, frame_size: usize },

    #[error("start time must not be negative (got {0} us)")]
    InvalidStartTime(i64),
}

// ---------------------------------------------------------------------------
// Public option / report types
// ---------------------------------------------------------------------------

/// How the device hands over its samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Pull,
    Push,
}

/// Stream format advertised to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Largest buffer the source will ever hand out, in bytes.
    pub max_buffer_size: usize,
}

/// Per-session options for [`CaptureSource::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Wall time (µs, same base as the source's clock) the caller considers
    /// the start of the recording.  Only the first buffer of the session uses
    /// it; `None` or `0` falls back to the device latency.
    pub start_time_us: Option<i64>,
    /// Count lost frames and log a summary on stop.
    pub collect_stats: bool,
}

/// Per-call options for [`CaptureSource::read`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Drop buffers that end before this session time.
    pub skip_to_us: Option<i64>,
}

/// Snapshot of session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Lost frames replaced by silence (only counted with `collect_stats`).
    pub total_lost_frames: u64,
    /// Lost bytes not yet emitted as silence.
    pub carried_lost_bytes: usize,
    /// Frames handed to the consumer or queued for it, silence included.
    pub frames_received: u64,
    /// Push-mode buffers discarded because the queue was full.
    pub buffers_dropped: u64,
}

// ---------------------------------------------------------------------------
// Session state (guarded by the monitor lock)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Started,
    /// `stop` is waiting for borrowed buffers.
    Draining,
}

struct QueuedBuffer {
    data: Vec<u8>,
    meta: BufferMeta,
    end_us: i64,
}

struct Session<D> {
    device: D,
    initialized: bool,
    state: RunState,
    collect_stats: bool,
    pool: Option<BufferPool>,
    queue: VecDeque<QueuedBuffer>,
    in_flight: usize,
    timing: TimestampReconciler,
    amplitude: AmplitudeTracker,
    frames_received: u64,
    buffers_dropped: u64,
}

impl<D> Session<D> {
    fn is_started(&self) -> bool {
        self.state == RunState::Started
    }

    fn init_check(&self) -> Result<(), SourceError> {
        if self.initialized {
            Ok(())
        } else {
            Err(SourceError::NotInitialized)
        }
    }

    fn give_back(&mut self, data: Vec<u8>) {
        if let Some(pool) = self.pool.as_mut() {
            pool.give_back(data);
        }
    }

    fn record_lost(&mut self, bytes: usize) {
        if self.collect_stats {
            self.timing.loss_mut().record(bytes);
        }
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            total_lost_frames: self.timing.loss().total_lost_frames(),
            carried_lost_bytes: self.timing.loss().carried_bytes(),
            frames_received: self.frames_received,
            buffers_dropped: self.buffers_dropped,
        }
    }
}

struct Shared<D> {
    session: Mutex<Session<D>>,
    frame_available: Condvar,
    buffers_returned: Condvar,
    clock: Arc<dyn WallClock>,
    mode: CaptureMode,
    format: AudioFormat,
    fade: FadeIn,
    config: CaptureConfig,
}

impl<D: CaptureDevice> Shared<D> {
    fn lock(&self) -> MutexGuard<'_, Session<D>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(
        &self,
        condvar: &Condvar,
        guard: MutexGuard<'a, Session<D>>,
    ) -> MutexGuard<'a, Session<D>> {
        condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Transfer ownership of `data` to the consumer.
    fn hand_off(
        self: &Arc<Self>,
        session: &mut Session<D>,
        data: Vec<u8>,
        len: usize,
        meta: BufferMeta,
        origin: BufferOrigin,
    ) -> SampleBuffer {
        session.in_flight += 1;
        log::trace!(
            "handing off {len} bytes @ {} us ({} in flight)",
            meta.time_us,
            session.in_flight
        );
        let owner: Weak<dyn BufferRecycler> = Arc::downgrade(self) as Weak<dyn BufferRecycler>;
        SampleBuffer::new(data, len, meta, origin, owner)
    }

    fn read_pull(self: &Arc<Self>, options: &ReadOptions) -> Result<Option<SampleBuffer>, SourceError> {
        let mut guard = self.lock();
        guard.init_check()?;

        let read_time_us = self.clock.now_us();
        let mut data = loop {
            if !guard.is_started() {
                return Ok(None);
            }
            if let Some(data) = guard.pool.as_mut().and_then(BufferPool::acquire) {
                break data;
            }
            guard = self.wait(&self.buffers_returned, guard);
        };
        let capacity = data.len();
        let channels = self.format.channels;

        while guard.is_started() {
            let session = &mut *guard;
            let position = session.device.position();

            if !session.timing.is_established() {
                let latency_ms = session.device.latency_ms();
                session.timing.establish(read_time_us, latency_ms);
            }

            // Insert silence when lost frames are detected.
            let frames_lost = session.device.frames_lost();
            let silence = session.timing.take_lost(frames_lost, capacity);
            if silence > 0 {
                let span = session.timing.span_for(silence);
                match classify_skip(span.end_us, options.skip_to_us) {
                    SkipDecision::TooFar { gap_us } => {
                        // Still owed to the stream; the next read emits it.
                        session.timing.loss_mut().restore(silence);
                        session.give_back(data);
                        return Err(SourceError::SkipBoundsExceeded { gap_us });
                    }
                    SkipDecision::Skip => {
                        session.record_lost(silence);
                        session.timing.skip(span);
                        continue;
                    }
                    SkipDecision::Deliver => session.record_lost(silence),
                }

                data[..silence].fill(0);
                let meta = session.timing.emit(span, read_time_us);
                session.frames_received += session.timing.frames_in(silence) as u64;
                return Ok(Some(self.hand_off(session, data, silence, meta, BufferOrigin::Pool)));
            }

            let n = match session.device.read(&mut data) {
                Ok(0) => {
                    log::error!("read from capture device returned no data");
                    session.give_back(data);
                    return Err(SourceError::DeviceReadError(DeviceError::NoData));
                }
                Ok(n) => n,
                Err(e) => {
                    log::error!("read from capture device failed: {e}");
                    session.give_back(data);
                    return Err(SourceError::DeviceReadError(e));
                }
            };
            assert!(n <= capacity, "device wrote {n} bytes into a {capacity} byte buffer");

            let span = session.timing.span_for(n);
            match classify_skip(span.end_us, options.skip_to_us) {
                SkipDecision::TooFar { gap_us } => {
                    session.give_back(data);
                    return Err(SourceError::SkipBoundsExceeded { gap_us });
                }
                SkipDecision::Skip => {
                    session.timing.skip(span);
                    continue;
                }
                SkipDecision::Deliver => {}
            }

            let samples = &mut data[..n];
            self.fade
                .apply(session.timing.elapsed_us(), position as i64, channels, samples);
            if session.amplitude.is_active() {
                session.amplitude.observe_bytes(samples);
            }

            let meta = session.timing.emit(span, read_time_us);
            session.frames_received += session.timing.frames_in(n) as u64;
            log::trace!(
                "start offset {} us, sample rate {}, timestamp {} us",
                session.timing.start_us(),
                self.format.sample_rate,
                span.end_us
            );
            return Ok(Some(self.hand_off(session, data, n, meta, BufferOrigin::Pool)));
        }

        // Stopped while reading.
        guard.give_back(data);
        Ok(None)
    }

    fn read_push(self: &Arc<Self>, options: &ReadOptions) -> Result<Option<SampleBuffer>, SourceError> {
        let mut guard = self.lock();
        guard.init_check()?;

        loop {
            if !guard.is_started() {
                return Ok(None);
            }
            let Some(queued) = guard.queue.pop_front() else {
                guard = self.wait(&self.frame_available, guard);
                continue;
            };
            match classify_skip(queued.end_us, options.skip_to_us) {
                SkipDecision::Deliver => {
                    let len = queued.data.len();
                    let buffer =
                        self.hand_off(&mut guard, queued.data, len, queued.meta, BufferOrigin::Heap);
                    return Ok(Some(buffer));
                }
                SkipDecision::Skip => continue,
                SkipDecision::TooFar { gap_us } => {
                    guard.queue.push_front(queued);
                    return Err(SourceError::SkipBoundsExceeded { gap_us });
                }
            }
        }
    }
}

impl<D: CaptureDevice> BufferRecycler for Shared<D> {
    fn recycle(&self, data: Vec<u8>, origin: BufferOrigin) {
        let mut session = self.lock();
        assert!(session.in_flight > 0, "buffer returned that was never handed out");
        session.in_flight -= 1;
        if origin == BufferOrigin::Pool {
            session.give_back(data);
        }
        log::trace!("buffer returned ({} still in flight)", session.in_flight);
        self.buffers_returned.notify_all();
    }
}

impl<D: CaptureDevice> PushTarget for Shared<D> {
    fn on_data(&self, data: &[u8], frames_lost: u32, time_us: Option<i64>) {
        let time_us = time_us.unwrap_or_else(|| self.clock.now_us());
        let mut guard = self.lock();
        if !guard.is_started() {
            log::warn!("spurious callback from capture device; dropping {} bytes", data.len());
            return;
        }
        let session = &mut *guard;

        if !session.timing.is_established() {
            if data.is_empty() {
                log::warn!("nothing available from capture device callback");
                return;
            }
            // Drop audio captured before the caller's requested start.
            if let Some(start) = session.timing.start_override_us() {
                if time_us < start {
                    log::debug!("dropping audio data at {time_us}/{start} us");
                    return;
                }
            }
            let latency_ms = session.device.latency_ms();
            session.timing.establish(time_us, latency_ms);
        }

        // Loss reported before the first block belongs to no session.
        let frames_lost = if session.frames_received > 0 { frames_lost } else { 0 };
        let silence = session.timing.take_lost(frames_lost, self.format.max_buffer_size);
        if silence == 0 && data.is_empty() {
            log::warn!("nothing available from capture device callback");
            return;
        }

        let total = silence + data.len();
        let span = session.timing.span_for(total);
        session.record_lost(silence);

        let mut buffer = vec![0_u8; total];
        let samples = &mut buffer[silence..];
        samples.copy_from_slice(data);

        let silence_frames = session.timing.frames_in(silence);
        let elapsed_us =
            session.timing.elapsed_us() + duration_us(silence_frames, self.format.sample_rate);
        let frame_index = session.frames_received as i64 + silence_frames as i64;
        self.fade
            .apply(elapsed_us, frame_index, self.format.channels, samples);
        if session.amplitude.is_active() {
            session.amplitude.observe_bytes(samples);
        }

        let meta = session.timing.emit(span, time_us);
        session.frames_received += session.timing.frames_in(total) as u64;

        if session.queue.len() >= self.config.max_queued_buffers.max(1) {
            session.queue.pop_front();
            session.buffers_dropped += 1;
            log::warn!(
                "capture queue full ({} buffers); dropping the oldest",
                session.queue.len() + 1
            );
        }
        session.queue.push_back(QueuedBuffer {
            data: buffer,
            meta,
            end_us: span.end_us,
        });
        self.frame_available.notify_one();
    }
}

// ---------------------------------------------------------------------------
// CaptureSource
// ---------------------------------------------------------------------------

/// Timestamped PCM capture from a [`CaptureDevice`].
///
/// All methods take `&self`; share the source between the consumer thread
/// and a controller thread with an `Arc`.
pub struct CaptureSource<D: CaptureDevice> {
    shared: Arc<Shared<D>>,
}

impl<D: CaptureDevice> CaptureSource<D> {
    /// Bind to `device` using the system wall clock.
    pub fn new(device: D, config: &CaptureConfig) -> Result<Self, SourceError> {
        Self::with_clock(device, config, Arc::new(SystemClock::new()))
    }

    /// Bind to `device` with an explicit wall clock.
    ///
    /// # Errors
    ///
    /// Rejects devices that are not mono or stereo, a zero sample rate, and
    /// buffer capacities that are not a whole number of frames.  A device
    /// that fails its init check still yields a source, but every
    /// `start`/`read` on it fails with [`SourceError::NotInitialized`].
    pub fn with_clock(
        mut device: D,
        config: &CaptureConfig,
        clock: Arc<dyn WallClock>,
    ) -> Result<Self, SourceError> {
        let sample_rate = device.sample_rate();
        let channels = device.channel_count();
        log::debug!("sample rate: {sample_rate}, channels: {channels}");

        if !(1..=2).contains(&channels) {
            return Err(SourceError::UnsupportedChannelCount(channels));
        }
        if sample_rate == 0 {
            return Err(SourceError::UnsupportedSampleRate(sample_rate));
        }
        let frame_size = device.frame_size();
        let capacity = config.buffer_capacity;
        if capacity == 0 || frame_size == 0 || capacity % frame_size != 0 {
            return Err(SourceError::InvalidBufferCapacity {
                capacity,
                frame_size,
            });
        }

        let initialized = match device.init_check() {
            Ok(()) => true,
            Err(e) => {
                log::error!("capture device failed its init check: {e}");
                false
            }
        };

        let format = AudioFormat {
            sample_rate,
            channels,
            max_buffer_size: capacity,
        };
        let fade = FadeIn::new(
            config.auto_ramp_start_us,
            config.auto_ramp_duration_us,
            sample_rate,
        );
        let config = config.clone();

        let shared = Arc::new_cyclic(|weak: &Weak<Shared<D>>| {
            let target: Weak<dyn PushTarget> = weak.clone() as Weak<dyn PushTarget>;
            let mode = if device.register_callback(PushSink::new(target)) {
                CaptureMode::Push
            } else {
                CaptureMode::Pull
            };
            log::debug!("capture source bound in {mode:?} mode");

            Shared {
                session: Mutex::new(Session {
                    device,
                    initialized,
                    state: RunState::Stopped,
                    collect_stats: config.collect_stats,
                    pool: None,
                    queue: VecDeque::new(),
                    in_flight: 0,
                    timing: TimestampReconciler::new(sample_rate, channels),
                    amplitude: AmplitudeTracker::new(),
                    frames_received: 0,
                    buffers_dropped: 0,
                }),
                frame_available: Condvar::new(),
                buffers_returned: Condvar::new(),
                clock,
                mode,
                format,
                fade,
                config,
            }
        });

        Ok(Self { shared })
    }

    /// Start a capture session.
    ///
    /// # Errors
    ///
    /// [`SourceError::AlreadyStarted`] while a session is running (or still
    /// draining), [`SourceError::NotInitialized`] for a device that failed its
    /// init check, [`SourceError::InvalidStartTime`] for a negative start
    /// time, and [`SourceError::Device`] when the device refuses to start; in
    /// every case the source stays stopped.
    pub fn start(&self, options: &StartOptions) -> Result<(), SourceError> {
        let mut session = self.shared.lock();
        if session.state != RunState::Stopped {
            return Err(SourceError::AlreadyStarted);
        }
        session.init_check()?;

        let start_time_us = match options.start_time_us {
            Some(t) if t < 0 => return Err(SourceError::InvalidStartTime(t)),
            Some(0) => None,
            other => other,
        };

        session.collect_stats = options.collect_stats;
        session.amplitude.reset();
        session.timing.reset(start_time_us);
        session.frames_received = 0;
        session.buffers_dropped = 0;
        session.queue.clear();

        session.device.start()?;

        let config = &self.shared.config;
        session.pool = Some(BufferPool::new(
            config.pool_buffers.max(1),
            config.buffer_capacity,
        ));
        session.state = RunState::Started;
        log::debug!("capture started (start time override: {start_time_us:?})");
        Ok(())
    }

    /// Stop the session.
    ///
    /// Blocks until every buffer handed to the consumer has been returned,
    /// then discards buffers that were queued but never read.  Calling this
    /// from the thread that still holds a buffer deadlocks.
    pub fn stop(&self) -> Result<(), SourceError> {
        let mut session = self.shared.lock();
        if !session.is_started() {
            return Err(SourceError::NotRunning);
        }

        session.state = RunState::Draining;
        session.device.stop();
        self.shared.frame_available.notify_all();
        self.shared.buffers_returned.notify_all();

        log::debug!(
            "waiting for {} outstanding buffers",
            session.in_flight
        );
        while session.in_flight > 0 {
            session = self.shared.wait(&self.shared.buffers_returned, session);
        }

        let discarded = session.queue.len();
        session.queue.clear();
        if discarded > 0 {
            log::debug!("released {discarded} queued buffers");
        }
        session.pool = None;
        session.state = RunState::Stopped;

        if session.collect_stats {
            let stats = session.stats();
            log::info!(
                "capture stats: {} frames received, {} lost frames, {} dropped buffers",
                stats.frames_received,
                stats.total_lost_frames,
                stats.buffers_dropped
            );
        }
        Ok(())
    }

    /// Produce the next buffer.
    ///
    /// Returns `Ok(None)` once the source is stopped, including when a stop
    /// arrives while this call is waiting.
    ///
    /// # Errors
    ///
    /// [`SourceError::DeviceReadError`] when the device read fails (the
    /// session stays started), [`SourceError::SkipBoundsExceeded`] when
    /// `options.skip_to_us` lies a second or more ahead, and
    /// [`SourceError::NotInitialized`] for a device that never bound.
    ///
    /// A rejected skip leaves pending silence and queued buffers in place for
    /// the next read.
    pub fn read(&self, options: &ReadOptions) -> Result<Option<SampleBuffer>, SourceError> {
        match self.shared.mode {
            CaptureMode::Pull => self.shared.read_pull(options),
            CaptureMode::Push => self.shared.read_push(options),
        }
    }

    /// Peak absolute sample value since the previous call.
    ///
    /// The first call switches tracking on and therefore returns 0.
    pub fn max_amplitude(&self) -> u16 {
        let peak = self.shared.lock().amplitude.take_peak();
        log::trace!("max amplitude since last call: {peak}");
        peak
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.lock().stats()
    }

    pub fn format(&self) -> AudioFormat {
        self.shared.format
    }

    pub fn mode(&self) -> CaptureMode {
        self.shared.mode
    }

    pub fn is_started(&self) -> bool {
        self.shared.lock().is_started()
    }

    /// Buffers currently owned by the consumer.
    pub fn buffers_in_flight(&self) -> usize {
        self.shared.lock().in_flight
    }
}

impl<D: CaptureDevice> Drop for CaptureSource<D> {
    fn drop(&mut self) {
        if self.is_started() {
            if let Err(e) = self.stop() {
                log::warn!("failed to stop capture source on drop: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
