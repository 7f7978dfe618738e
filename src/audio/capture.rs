//! Microphone capture via `cpal`.
//!
//! [`CaptureSource`] is the seam between the capture pipeline and the device:
//! an async permission/acquisition step, then `start`/`stop`.  Frames are
//! delivered as fixed-length mono [`CaptureFrame`]s over a bounded
//! `tokio::sync::mpsc` channel.
//!
//! [`CpalCapture`] is the production source.  `cpal::Stream` is not `Send`,
//! so the stream lives on a dedicated `audio-capture` thread for its whole
//! life; the struct itself only holds the control channel to that thread.
//!
//! The device callback hands each block over with `try_send`.  When the
//! session loop has not yet taken the previous block, the new one is dropped
//! and counted: the callback is the backpressure point and never blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::encode::stereo_to_mono;

// ---------------------------------------------------------------------------
// CaptureFrame
// ---------------------------------------------------------------------------

/// One fixed-length block of mono audio at the device's native rate.
///
/// Samples are normalised `f32` in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFrame {
    /// Mono samples, `block_size` long.
    pub samples: Vec<f32>,
    /// Device sample rate in Hz (e.g. 44100, 48000).
    pub sample_rate: u32,
}

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

/// Errors that can occur while acquiring or running the capture device.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("access to the input device was refused: {0}")]
    Denied(String),

    #[error("no input device found on the default audio host")]
    NoDevice,

    #[error("input device not found: {0}")]
    DeviceNotFound(String),

    #[error("failed to enumerate input devices: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("failed to query default input config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("unsupported input sample format: {0}")]
    UnsupportedFormat(cpal::SampleFormat),

    #[error("failed to build input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("capture device was used before access was acquired")]
    NotAcquired,

    #[error("capture thread exited unexpectedly")]
    WorkerGone,
}

// ---------------------------------------------------------------------------
// CaptureSource
// ---------------------------------------------------------------------------

/// A microphone-like source of fixed-size mono blocks.
///
/// Lifecycle: `acquire` → `start` → `stop`.  `stop` must release the device
/// and be safe to call in any state, any number of times.
#[async_trait]
pub trait CaptureSource: Send {
    /// Obtain device access.  Returns the native sample rate in Hz.
    ///
    /// This is the permission step: an `Err` means access was refused or the
    /// device is unusable, and the session must not start.
    async fn acquire(&mut self) -> Result<u32, CaptureError>;

    /// Begin delivering blocks to `sink`.
    async fn start(&mut self, sink: mpsc::Sender<CaptureFrame>) -> Result<(), CaptureError>;

    /// Stop pulling blocks, disconnect and release the device stream.
    async fn stop(&mut self);

    /// Blocks dropped because the consumer had not taken the previous one.
    fn dropped_blocks(&self) -> u64 {
        0
    }
}

// ---------------------------------------------------------------------------
// BlockAssembler
// ---------------------------------------------------------------------------

/// Re-blocks arbitrarily sized interleaved device buffers into fixed-length
/// mono [`CaptureFrame`]s.
pub struct BlockAssembler {
    block_size: usize,
    channels: u16,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl BlockAssembler {
    /// # Panics
    ///
    /// Panics if `block_size == 0`.
    pub fn new(block_size: usize, channels: u16, sample_rate: u32) -> Self {
        assert!(block_size > 0, "block size must be > 0");
        Self {
            block_size,
            channels,
            sample_rate,
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Append an interleaved buffer and emit every completed block.
    pub fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(CaptureFrame)) {
        if self.channels == 1 {
            self.pending.extend_from_slice(interleaved);
        } else {
            self.pending
                .extend(stereo_to_mono(interleaved, self.channels));
        }

        while self.pending.len() >= self.block_size {
            let rest = self.pending.split_off(self.block_size);
            let samples = std::mem::replace(&mut self.pending, rest);
            emit(CaptureFrame {
                samples,
                sample_rate: self.sample_rate,
            });
        }
    }

    /// Samples buffered towards the next block.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// CpalCapture
// ---------------------------------------------------------------------------

type SharedSink = Arc<Mutex<Option<mpsc::Sender<CaptureFrame>>>>;

enum StreamControl {
    Play(oneshot::Sender<Result<(), CaptureError>>),
    Shutdown,
}

/// `cpal`-backed [`CaptureSource`].
///
/// # Example
///
/// ```rust,no_run
/// use tokio::sync::mpsc;
/// use voice_live::audio::{CaptureSource, CpalCapture};
///
/// # async fn example() -> Result<(), voice_live::audio::CaptureError> {
/// let mut capture = CpalCapture::new(None, 4096);
/// let rate = capture.acquire().await?;
/// let (tx, mut rx) = mpsc::channel(1);
/// capture.start(tx).await?;
/// while let Some(frame) = rx.recv().await {
///     assert_eq!(frame.sample_rate, rate);
/// }
/// capture.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct CpalCapture {
    device_name: Option<String>,
    block_size: usize,
    sink: SharedSink,
    dropped: Arc<AtomicU64>,
    control: Option<std_mpsc::Sender<StreamControl>>,
    worker: Option<JoinHandle<()>>,
    sample_rate: Option<u32>,
}

impl CpalCapture {
    /// Create an unacquired source for `device_name` (`None` = system
    /// default) delivering blocks of `block_size` mono samples.
    pub fn new(device_name: Option<String>, block_size: usize) -> Self {
        Self {
            device_name,
            block_size: block_size.max(1),
            sink: Arc::new(Mutex::new(None)),
            dropped: Arc::new(AtomicU64::new(0)),
            control: None,
            worker: None,
            sample_rate: None,
        }
    }
}

#[async_trait]
impl CaptureSource for CpalCapture {
    async fn acquire(&mut self) -> Result<u32, CaptureError> {
        if let Some(rate) = self.sample_rate {
            return Ok(rate);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (control_tx, control_rx) = std_mpsc::channel();
        let device_name = self.device_name.clone();
        let block_size = self.block_size;
        let sink = Arc::clone(&self.sink);
        let dropped = Arc::clone(&self.dropped);

        let worker = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                capture_worker(device_name, block_size, sink, dropped, ready_tx, control_rx)
            })
            .map_err(|_| CaptureError::WorkerGone)?;

        let rate = ready_rx.await.map_err(|_| CaptureError::WorkerGone)??;

        self.control = Some(control_tx);
        self.worker = Some(worker);
        self.sample_rate = Some(rate);
        Ok(rate)
    }

    async fn start(&mut self, sink: mpsc::Sender<CaptureFrame>) -> Result<(), CaptureError> {
        let control = self.control.as_ref().ok_or(CaptureError::NotAcquired)?;

        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);

        let (reply_tx, reply_rx) = oneshot::channel();
        control
            .send(StreamControl::Play(reply_tx))
            .map_err(|_| CaptureError::WorkerGone)?;
        reply_rx.await.map_err(|_| CaptureError::WorkerGone)?
    }

    async fn stop(&mut self) {
        // Detach the sink first so no further block reaches the session.
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(control) = self.control.take() {
            let _ = control.send(StreamControl::Shutdown);
        }

        if let Some(worker) = self.worker.take() {
            // The stream is dropped on its own thread; wait for it off the
            // async executor.
            if tokio::task::spawn_blocking(move || worker.join()).await.is_err() {
                log::warn!("capture: worker join task failed");
            }
            log::debug!("capture: device stream released");
        }

        self.sample_rate = None;
    }

    fn dropped_blocks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.send(StreamControl::Shutdown);
        }
    }
}

/// Body of the `audio-capture` thread: owns the `cpal::Stream` from build to
/// drop.
fn capture_worker(
    device_name: Option<String>,
    block_size: usize,
    sink: SharedSink,
    dropped: Arc<AtomicU64>,
    ready: oneshot::Sender<Result<u32, CaptureError>>,
    control: std_mpsc::Receiver<StreamControl>,
) {
    let (stream, sample_rate) = match open_input_stream(device_name.as_deref(), block_size, sink, dropped) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if ready.send(Ok(sample_rate)).is_err() {
        return;
    }

    // Blocks until Shutdown or until the owning CpalCapture is gone.
    while let Ok(cmd) = control.recv() {
        match cmd {
            StreamControl::Play(reply) => {
                let result = stream.play().map_err(CaptureError::from);
                if result.is_ok() {
                    log::info!("capture: stream started ({sample_rate} Hz)");
                }
                let _ = reply.send(result);
            }
            StreamControl::Shutdown => break,
        }
    }

    if let Err(e) = stream.pause() {
        log::debug!("capture: pause on shutdown failed: {e}");
    }
    drop(stream);
}

fn open_input_stream(
    device_name: Option<&str>,
    block_size: usize,
    sink: SharedSink,
    dropped: Arc<AtomicU64>,
) -> Result<(cpal::Stream, u32), CaptureError> {
    let host = cpal::default_host();
    let device = match device_name {
        None => host.default_input_device().ok_or(CaptureError::NoDevice)?,
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| CaptureError::DeviceNotFound(name.to_string()))?,
    };

    let supported = device.default_input_config()?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    log::debug!(
        "capture: device {:?}, {sample_rate} Hz, {channels} ch, {format}",
        device.name().unwrap_or_default()
    );

    let assembler = BlockAssembler::new(block_size, channels, sample_rate);
    let stream = match format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, assembler, sink, dropped)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, assembler, sink, dropped)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, assembler, sink, dropped)?,
        other => return Err(CaptureError::UnsupportedFormat(other)),
    };

    Ok((stream, sample_rate))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut assembler: BlockAssembler,
    sink: SharedSink,
    dropped: Arc<AtomicU64>,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));

            let guard = sink.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(tx) = guard.as_ref() else {
                return;
            };

            assembler.push(&scratch, |frame| match tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
                // Receiver gone: the session is tearing down.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            });
        },
        |err: cpal::StreamError| {
            log::error!("cpal input stream error: {err}");
        },
        None,
    )?;

    Ok(stream)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_frame_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CaptureFrame>();
        assert_send::<CpalCapture>();
    }

    #[test]
    fn assembler_emits_fixed_blocks() {
        let mut asm = BlockAssembler::new(4, 1, 48_000);
        let mut out = Vec::new();
        asm.push(&[0.1, 0.2, 0.3], |f| out.push(f));
        assert!(out.is_empty());
        asm.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9], |f| out.push(f));

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(out[1].samples, vec![0.5, 0.6, 0.7, 0.8]);
        assert_eq!(out[0].sample_rate, 48_000);
        assert_eq!(asm.pending(), 1);
    }

    #[test]
    fn assembler_downmixes_interleaved_input() {
        let mut asm = BlockAssembler::new(2, 2, 44_100);
        let mut out = Vec::new();
        asm.push(&[1.0, 0.0, 0.5, 0.5], |f| out.push(f));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].samples, vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn start_before_acquire_is_rejected() {
        let mut capture = CpalCapture::new(None, 4096);
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            capture.start(tx).await,
            Err(CaptureError::NotAcquired)
        ));
    }

    #[tokio::test]
    async fn stop_without_acquire_is_a_no_op() {
        let mut capture = CpalCapture::new(None, 4096);
        capture.stop().await;
        capture.stop().await;
        assert_eq!(capture.dropped_blocks(), 0);
    }
}
