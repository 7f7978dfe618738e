//! Visualizer feed: a passive tap on the capture signal.
//!
//! The capture pipeline publishes every raw block into a [`VisualizerTap`]
//! (a `tokio::sync::watch` slot, so publishing never blocks and keeps no
//! history).  Renderers hold a [`VisualizerFeed`] and call
//! [`subscribe`](VisualizerFeed::subscribe) to get a lazy, infinite stream of
//! [`VisualizerFrame`]s ticking at the display refresh rate.  Dropping the
//! stream and subscribing again restarts it from the live signal.
//!
//! Each frame is computed the way a browser `AnalyserNode` does it: the most
//! recent `fft_size` samples, Blackman window, FFT, magnitude smoothing over
//! time, then decibels mapped linearly into `[0, 1]` between
//! `min_decibels` and `max_decibels`.
//!
//! # Example
//!
//! ```rust
//! use voice_live::audio::{visualizer_channel, Analyser};
//! use voice_live::config::VisualizerConfig;
//!
//! let config = VisualizerConfig::default();
//! let (tap, feed) = visualizer_channel(config.clone());
//! tap.publish(&vec![0.5_f32; 4096]);
//!
//! let mut analyser = Analyser::new(&config);
//! let frame = analyser.analyse(&feed.latest());
//! assert_eq!(frame.bins.len(), 32);
//! assert!(frame.bins.iter().all(|&b| (0.0..=1.0).contains(&b)));
//! ```

use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, Stream, StreamExt};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;

use crate::config::VisualizerConfig;

// ---------------------------------------------------------------------------
// VisualizerFrame
// ---------------------------------------------------------------------------

/// One rendered snapshot for the display.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualizerFrame {
    /// Magnitude per frequency bucket, `fft_size / 2` values in `[0, 1]`.
    pub bins: Vec<f32>,
    /// RMS of the analysed window, clamped to `[0, 1]`.
    pub level: f32,
}

impl VisualizerFrame {
    /// Peak bin value (useful for normalisation).
    pub fn peak(&self) -> f32 {
        self.bins.iter().copied().fold(0.0_f32, f32::max)
    }
}

// ---------------------------------------------------------------------------
// Tap / feed
// ---------------------------------------------------------------------------

/// Write side, owned by the capture pipeline.
pub struct VisualizerTap {
    tx: watch::Sender<Arc<[f32]>>,
    window: usize,
}

impl VisualizerTap {
    /// Replace the observed window with the tail of `block`.
    ///
    /// Never blocks and never fails, with or without subscribers.
    pub fn publish(&self, block: &[f32]) {
        let start = block.len().saturating_sub(self.window);
        self.tx.send_replace(Arc::from(&block[start..]));
    }

    /// Reset the observed signal to silence.
    pub fn clear(&self) {
        self.tx.send_replace(Arc::from(Vec::new()));
    }
}

/// Read side, handed to the rendering layer.  Cheap to clone.
#[derive(Clone)]
pub struct VisualizerFeed {
    rx: watch::Receiver<Arc<[f32]>>,
    config: VisualizerConfig,
}

/// Create a connected tap/feed pair.
pub fn visualizer_channel(config: VisualizerConfig) -> (VisualizerTap, VisualizerFeed) {
    let window = config.fft_size.max(2);
    let (tx, rx) = watch::channel(Arc::from(Vec::new()));
    (VisualizerTap { tx, window }, VisualizerFeed { rx, config })
}

impl VisualizerFeed {
    /// Most recent raw window (may be shorter than `fft_size`).
    pub fn latest(&self) -> Arc<[f32]> {
        Arc::clone(&self.rx.borrow())
    }

    /// Lazy, infinite stream of frames at `refresh_hz`.
    ///
    /// Creating the stream needs no runtime; the ticker is built on first
    /// poll, which must happen inside a tokio runtime.
    pub fn subscribe(&self) -> impl Stream<Item = VisualizerFrame> + Send + 'static {
        let rx = self.rx.clone();
        let mut analyser = Analyser::new(&self.config);
        let period = Duration::from_secs_f64(1.0 / f64::from(self.config.refresh_hz.max(1)));

        let ticks = stream::once(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            IntervalStream::new(interval)
        })
        .flatten();

        ticks.map(move |_| {
            let window = Arc::clone(&rx.borrow());
            analyser.analyse(&window)
        })
    }
}

// ---------------------------------------------------------------------------
// Analyser
// ---------------------------------------------------------------------------

/// Stateful spectrum analyser (the smoothing carries across frames).
pub struct Analyser {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    smoothing: f32,
    min_db: f32,
    max_db: f32,
}

impl Analyser {
    pub fn new(config: &VisualizerConfig) -> Self {
        let size = config.fft_size.max(2);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(size);
        Self {
            fft,
            window: blackman(size),
            smoothed: vec![0.0; size / 2],
            scratch: vec![Complex::new(0.0, 0.0); size],
            smoothing: config.smoothing.clamp(0.0, 1.0),
            min_db: config.min_decibels,
            max_db: config.max_decibels,
        }
    }

    /// Number of output bins.
    pub fn bins(&self) -> usize {
        self.smoothed.len()
    }

    /// Analyse the most recent samples of `signal`.  Shorter input is
    /// left-padded with silence.
    pub fn analyse(&mut self, signal: &[f32]) -> VisualizerFrame {
        let size = self.window.len();
        let take = signal.len().min(size);
        let tail = &signal[signal.len() - take..];
        let pad = size - take;

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { tail[i - pad] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let range = (self.max_db - self.min_db).max(f32::EPSILON);
        let bins = self
            .smoothed
            .iter_mut()
            .zip(self.scratch.iter())
            .map(|(smoothed, bin)| {
                let magnitude = bin.norm() / size as f32;
                *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
                let db = 20.0 * smoothed.max(f32::MIN_POSITIVE).log10();
                ((db - self.min_db) / range).clamp(0.0, 1.0)
            })
            .collect();

        let level = if tail.is_empty() {
            0.0
        } else {
            (tail.iter().map(|s| s * s).sum::<f32>() / tail.len() as f32)
                .sqrt()
                .min(1.0)
        };

        VisualizerFrame { bins, level }
    }
}

fn blackman(size: usize) -> Vec<f32> {
    let n = size as f32;
    (0..size)
        .map(|i| {
            let x = i as f32 / n;
            0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
