//! Output device abstraction and the sample-accurate mixing timeline.
//!
//! The playback scheduler talks to an [`OutputDevice`]: it reads the device
//! clock, starts buffers at explicit times and stops them on flush.  The
//! device reports completions and failures back as [`OutputEvent`]s.
//!
//! Both implementations share [`Timeline`], which mixes scheduled voices
//! frame-by-frame at the downstream rate (24 kHz).  Its frame cursor *is* the
//! device clock, so "now" always means "the next frame the mixer will render".
//!
//! ```text
//! PlaybackScheduler ──start(id, buffer, t)──▶ Timeline (Arc<Mutex<…>>)
//!                                                 │ mix()
//!                    ◀──OutputEvent::Ended(id)────┤
//!                                                 ▼
//!                           CpalOutput: device callback (24 kHz or rubato → device rate)
//!                           VirtualOutput: advance_frames() driven by the caller
//! ```

use std::collections::VecDeque;
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use rubato::{FftFixedIn, Resampler};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::decode::{DecodedBuffer, DOWNSTREAM_SAMPLE_RATE};

/// Frames mixed per rubato chunk when the device is not at 24 kHz.
const ADAPTER_CHUNK_FRAMES: usize = 480;

// ---------------------------------------------------------------------------
// Ids, events, errors
// ---------------------------------------------------------------------------

/// Identifies one scheduled buffer for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackId(pub u64);

/// Notifications from the device to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    /// The buffer finished playing on its own.
    Ended(PlaybackId),
    /// The device stream failed; the session must close.
    Failed(String),
}

/// Output device errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no output device available")]
    NoDevice,

    #[error("output device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to enumerate output devices: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("failed to query output configs: {0}")]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),

    #[error("failed to query default output config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("unsupported output sample format: {0}")]
    UnsupportedFormat(cpal::SampleFormat),

    #[error("failed to create output rate adapter: {0}")]
    RateAdapter(#[from] rubato::ResamplerConstructionError),

    #[error("buffer sample rate {got} Hz does not match the output timeline ({expected} Hz)")]
    RateMismatch { expected: u32, got: u32 },

    #[error("output device is not open")]
    NotOpen,

    #[error("output stream failed: {0}")]
    Stream(String),

    #[error("output thread exited unexpectedly")]
    WorkerGone,
}

// ---------------------------------------------------------------------------
// OutputDevice
// ---------------------------------------------------------------------------

/// A playback sink with a readable clock and explicit start times.
///
/// Lifecycle: `open` → (`start`/`stop`)* → `close`.  `close` must release the
/// device and be idempotent.  `open` and `close` may wait on hardware, so
/// they suspend instead of blocking the executor.
#[async_trait]
pub trait OutputDevice: Send {
    /// Open the device.  Completion and failure notifications arrive on the
    /// returned receiver.
    async fn open(&mut self) -> Result<mpsc::UnboundedReceiver<OutputEvent>, DeviceError>;

    /// Current output clock in seconds.  `0.0` before `open`.
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at `at` seconds on the output clock.  A start
    /// time already in the past plays from the buffer's beginning at once.
    fn start(&mut self, id: PlaybackId, buffer: DecodedBuffer, at: f64) -> Result<(), DeviceError>;

    /// Stop `id` immediately.  Unknown or finished ids are ignored.
    fn stop(&mut self, id: PlaybackId);

    /// Release the device.
    async fn close(&mut self);
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

struct Voice {
    id: PlaybackId,
    start: u64,
    samples: Arc<[f32]>,
}

impl Voice {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Mono mixing timeline with a frame-counting clock.
pub struct Timeline {
    sample_rate: u32,
    cursor: u64,
    voices: Vec<Voice>,
}

impl Timeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            cursor: 0,
            voices: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Next frame to be rendered.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Clock in seconds.
    pub fn now(&self) -> f64 {
        self.cursor as f64 / f64::from(self.sample_rate)
    }

    /// Number of voices not yet finished.
    pub fn active(&self) -> usize {
        self.voices.len()
    }

    /// Frame index for a time on this timeline.
    pub fn frame_at(&self, secs: f64) -> u64 {
        (secs.max(0.0) * f64::from(self.sample_rate)).round() as u64
    }

    /// Add a voice starting at `at` seconds (clamped to the cursor).
    pub fn insert(&mut self, id: PlaybackId, samples: Arc<[f32]>, at: f64) {
        let start = self.frame_at(at).max(self.cursor);
        self.voices.push(Voice { id, start, samples });
    }

    /// Remove a voice.  Returns `true` if it was still active.
    pub fn remove(&mut self, id: PlaybackId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        before != self.voices.len()
    }

    /// Render `out.len()` frames, advance the clock and return the ids of
    /// voices that finished within the rendered span.
    pub fn mix(&mut self, out: &mut [f32]) -> Vec<PlaybackId> {
        out.fill(0.0);
        let span_start = self.cursor;
        let span_end = span_start + out.len() as u64;

        for voice in &self.voices {
            let from = voice.start.max(span_start);
            let to = voice.end().min(span_end);
            for frame in from..to {
                out[(frame - span_start) as usize] += voice.samples[(frame - voice.start) as usize];
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.cursor = span_end;

        let mut ended = Vec::new();
        self.voices.retain(|v| {
            if v.end() <= span_end {
                ended.push(v.id);
                false
            } else {
                true
            }
        });
        ended
    }

    /// Drop all voices without touching the clock.
    pub fn clear(&mut self) {
        self.voices.clear();
    }
}

fn checked_samples(buffer: DecodedBuffer, expected: u32) -> Result<Arc<[f32]>, DeviceError> {
    if buffer.sample_rate() != expected {
        return Err(DeviceError::RateMismatch {
            expected,
            got: buffer.sample_rate(),
        });
    }
    Ok(Arc::from(buffer.into_mono()))
}

fn lock(timeline: &Mutex<Timeline>) -> std::sync::MutexGuard<'_, Timeline> {
    timeline.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// VirtualOutput
// ---------------------------------------------------------------------------

/// Clock-driven output with no hardware behind it.
///
/// Time only moves when [`advance_frames`](Self::advance_frames) is called;
/// rendered audio is kept so callers can inspect the mixed result.  Cloning
/// yields another handle to the same device.
#[derive(Clone)]
pub struct VirtualOutput {
    inner: Arc<Mutex<VirtualInner>>,
}

struct VirtualInner {
    timeline: Timeline,
    events: Option<mpsc::UnboundedSender<OutputEvent>>,
    rendered: Vec<f32>,
    stops: usize,
    closes: usize,
}

impl VirtualOutput {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VirtualInner {
                timeline: Timeline::new(DOWNSTREAM_SAMPLE_RATE),
                events: None,
                rendered: Vec::new(),
                stops: 0,
                closes: 0,
            })),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, VirtualInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Render `frames` frames and emit `Ended` for completed buffers.
    pub fn advance_frames(&self, frames: usize) {
        let mut inner = self.inner();
        let mut block = vec![0.0; frames];
        let ended = inner.timeline.mix(&mut block);
        inner.rendered.extend_from_slice(&block);
        if let Some(tx) = &inner.events {
            for id in ended {
                let _ = tx.send(OutputEvent::Ended(id));
            }
        }
    }

    /// Report a device failure to the session.
    pub fn fail(&self, reason: &str) {
        if let Some(tx) = &self.inner().events {
            let _ = tx.send(OutputEvent::Failed(reason.to_string()));
        }
    }

    /// Everything rendered so far.
    pub fn rendered(&self) -> Vec<f32> {
        self.inner().rendered.clone()
    }

    /// Buffers still playing or waiting to play.
    pub fn active(&self) -> usize {
        self.inner().timeline.active()
    }

    /// Number of `stop` calls that hit an active buffer.
    pub fn stops(&self) -> usize {
        self.inner().stops
    }

    /// Number of `close` calls on an open device.
    pub fn closes(&self) -> usize {
        self.inner().closes
    }
}

impl Default for VirtualOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutputDevice for VirtualOutput {
    async fn open(&mut self) -> Result<mpsc::UnboundedReceiver<OutputEvent>, DeviceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner().events = Some(tx);
        Ok(rx)
    }

    fn current_time(&self) -> f64 {
        self.inner().timeline.now()
    }

    fn start(&mut self, id: PlaybackId, buffer: DecodedBuffer, at: f64) -> Result<(), DeviceError> {
        let mut inner = self.inner();
        if inner.events.is_none() {
            return Err(DeviceError::NotOpen);
        }
        let samples = checked_samples(buffer, inner.timeline.sample_rate())?;
        inner.timeline.insert(id, samples, at);
        Ok(())
    }

    fn stop(&mut self, id: PlaybackId) {
        let mut inner = self.inner();
        if inner.timeline.remove(id) {
            inner.stops += 1;
        }
    }

    async fn close(&mut self) {
        let mut inner = self.inner();
        if inner.events.take().is_some() {
            inner.timeline.clear();
            inner.closes += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// RateAdapter
// ---------------------------------------------------------------------------

/// Converts the 24 kHz timeline to a device running at another rate.
struct RateAdapter {
    resampler: FftFixedIn<f32>,
    chunk: Vec<f32>,
    fifo: VecDeque<f32>,
}

impl RateAdapter {
    fn new(device_rate: u32) -> Result<Self, DeviceError> {
        let resampler = FftFixedIn::<f32>::new(
            DOWNSTREAM_SAMPLE_RATE as usize,
            device_rate as usize,
            ADAPTER_CHUNK_FRAMES,
            1,
            1,
        )?;
        Ok(Self {
            resampler,
            chunk: vec![0.0; ADAPTER_CHUNK_FRAMES],
            fifo: VecDeque::with_capacity(ADAPTER_CHUNK_FRAMES * 4),
        })
    }

    /// Pull `frames` device-rate frames out of `timeline`.
    fn render(&mut self, timeline: &mut Timeline, frames: usize, ended: &mut Vec<PlaybackId>) {
        while self.fifo.len() < frames {
            let needed = self.resampler.input_frames_next();
            self.chunk.resize(needed, 0.0);
            ended.extend(timeline.mix(&mut self.chunk));
            match self.resampler.process(&[self.chunk.as_slice()], None) {
                Ok(out) => self.fifo.extend(out.into_iter().next().unwrap_or_default()),
                Err(e) => {
                    log::error!("output: rate adapter failed: {e}");
                    self.fifo.extend(std::iter::repeat(0.0).take(frames));
                }
            }
        }
    }

    fn pop(&mut self) -> f32 {
        self.fifo.pop_front().unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// DeviceThread
// ---------------------------------------------------------------------------

/// A named thread that owns a `!Send` device handle from build to drop.
///
/// Dropping a `DeviceThread` without [`shutdown`](Self::shutdown) still
/// releases the handle: the thread wakes when its shutdown sender goes away.
struct DeviceThread {
    shutdown: std_mpsc::Sender<()>,
    worker: JoinHandle<()>,
}

impl DeviceThread {
    /// Run `build` on a fresh thread and wait, off the executor, until it
    /// has produced the handle or failed.
    async fn spawn<T, F>(name: &str, build: F) -> Result<Self, DeviceError>
    where
        F: FnOnce() -> Result<T, DeviceError> + Send + 'static,
        T: 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let worker = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let handle = match build() {
                    Ok(handle) => handle,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = shutdown_rx.recv();
                drop(handle);
            })
            .map_err(|_| DeviceError::WorkerGone)?;

        ready_rx.await.map_err(|_| DeviceError::WorkerGone)??;

        Ok(Self {
            shutdown: shutdown_tx,
            worker,
        })
    }

    /// Signal the thread and wait for it to drop the handle.
    async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let worker = self.worker;
        match tokio::task::spawn_blocking(move || worker.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => log::warn!("output: worker thread panicked"),
            Err(e) => log::warn!("output: worker join task failed: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// Device callback state: mixes the timeline into interleaved device frames.
struct Renderer {
    timeline: Arc<Mutex<Timeline>>,
    adapter: Option<RateAdapter>,
    channels: usize,
    mono: Vec<f32>,
    ended: Vec<PlaybackId>,
    events: mpsc::UnboundedSender<OutputEvent>,
}

impl Renderer {
    fn new(
        timeline: Arc<Mutex<Timeline>>,
        adapter: Option<RateAdapter>,
        channels: usize,
        events: mpsc::UnboundedSender<OutputEvent>,
    ) -> Self {
        Self {
            timeline,
            adapter,
            channels: channels.max(1),
            mono: Vec::new(),
            ended: Vec::new(),
            events,
        }
    }

    /// Fill one device buffer, duplicating the mono mix on every channel.
    fn fill<T>(&mut self, data: &mut [T])
    where
        T: Sample + FromSample<f32>,
    {
        let frames = data.len() / self.channels;
        self.ended.clear();
        {
            let mut tl = lock(&self.timeline);
            match self.adapter.as_mut() {
                None => {
                    self.mono.resize(frames, 0.0);
                    self.ended.extend(tl.mix(&mut self.mono));
                }
                Some(adapter) => {
                    adapter.render(&mut tl, frames, &mut self.ended);
                    self.mono.clear();
                    self.mono.extend((0..frames).map(|_| adapter.pop()));
                }
            }
        }

        for (frame, &sample) in data.chunks_mut(self.channels).zip(self.mono.iter()) {
            frame.fill(T::from_sample(sample));
        }

        for &id in &self.ended {
            let _ = self.events.send(OutputEvent::Ended(id));
        }
    }
}

// ---------------------------------------------------------------------------
// CpalOutput
// ---------------------------------------------------------------------------

/// `cpal`-backed [`OutputDevice`].
///
/// The stream lives on an `audio-output` thread.  The device runs at 24 kHz
/// when it supports it; otherwise at its default rate and sample format with
/// a [`RateAdapter`] between the timeline and the callback.
pub struct CpalOutput {
    device_name: Option<String>,
    timeline: Arc<Mutex<Timeline>>,
    device: Option<DeviceThread>,
}

impl CpalOutput {
    /// Create an unopened output for `device_name` (`None` = system default).
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            timeline: Arc::new(Mutex::new(Timeline::new(DOWNSTREAM_SAMPLE_RATE))),
            device: None,
        }
    }
}

#[async_trait]
impl OutputDevice for CpalOutput {
    async fn open(&mut self) -> Result<mpsc::UnboundedReceiver<OutputEvent>, DeviceError> {
        self.close().await;
        *lock(&self.timeline) = Timeline::new(DOWNSTREAM_SAMPLE_RATE);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let device_name = self.device_name.clone();
        let timeline = Arc::clone(&self.timeline);

        let device = DeviceThread::spawn("audio-output", move || {
            open_output_stream(device_name.as_deref(), timeline, events_tx)
        })
        .await?;

        self.device = Some(device);
        Ok(events_rx)
    }

    fn current_time(&self) -> f64 {
        lock(&self.timeline).now()
    }

    fn start(&mut self, id: PlaybackId, buffer: DecodedBuffer, at: f64) -> Result<(), DeviceError> {
        if self.device.is_none() {
            return Err(DeviceError::NotOpen);
        }
        let samples = checked_samples(buffer, DOWNSTREAM_SAMPLE_RATE)?;
        lock(&self.timeline).insert(id, samples, at);
        Ok(())
    }

    fn stop(&mut self, id: PlaybackId) {
        lock(&self.timeline).remove(id);
    }

    async fn close(&mut self) {
        if let Some(device) = self.device.take() {
            device.shutdown().await;
            lock(&self.timeline).clear();
            log::debug!("output: device released");
        }
    }
}

fn is_playable(format: cpal::SampleFormat) -> bool {
    matches!(
        format,
        cpal::SampleFormat::F32 | cpal::SampleFormat::I16 | cpal::SampleFormat::U16
    )
}

fn open_output_stream(
    device_name: Option<&str>,
    timeline: Arc<Mutex<Timeline>>,
    events: mpsc::UnboundedSender<OutputEvent>,
) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = match device_name {
        None => host.default_output_device().ok_or(DeviceError::NoDevice)?,
        Some(name) => host
            .output_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| DeviceError::DeviceNotFound(name.to_string()))?,
    };

    // Prefer f32 at 24 kHz, then any playable format at 24 kHz.
    let target = cpal::SampleRate(DOWNSTREAM_SAMPLE_RATE);
    let native = device
        .supported_output_configs()?
        .filter(|c| is_playable(c.sample_format()))
        .filter(|c| c.min_sample_rate() <= target && c.max_sample_rate() >= target)
        .min_by_key(|c| (c.sample_format() != cpal::SampleFormat::F32, c.channels()))
        .map(|c| c.with_sample_rate(target));

    let (supported, adapter) = match native {
        Some(supported) => (supported, None),
        None => {
            let fallback = device.default_output_config()?;
            let rate = fallback.sample_rate().0;
            log::info!("output: device lacks 24 kHz, adapting to {rate} Hz");
            let adapter = RateAdapter::new(rate)?;
            (fallback, Some(adapter))
        }
    };

    let format = supported.sample_format();
    let config = supported.config();
    log::debug!(
        "output: device {:?}, {} Hz, {} ch, {format}",
        device.name().unwrap_or_default(),
        config.sample_rate.0,
        config.channels
    );

    let renderer = Renderer::new(timeline, adapter, config.channels as usize, events);
    let stream = match format {
        cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, renderer)?,
        cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, renderer)?,
        cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, renderer)?,
        other => return Err(DeviceError::UnsupportedFormat(other)),
    };

    stream.play()?;
    Ok(stream)
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut renderer: Renderer,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample + FromSample<f32>,
{
    let failure_tx = renderer.events.clone();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| renderer.fill(data),
        move |err: cpal::StreamError| {
            log::error!("cpal output stream error: {err}");
            let _ = failure_tx.send(OutputEvent::Failed(err.to_string()));
        },
        None,
    )?;

    Ok(stream)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
