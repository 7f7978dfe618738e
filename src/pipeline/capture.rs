//! Capture Pipeline: owns the microphone source, taps raw blocks into the
//! visualizer and encodes them for the transport.
//!
//! Blocks travel from the device callback over a bounded channel whose
//! capacity is the in-flight budget (one block by default).  The session loop
//! processes each block to completion before taking the next, so a slow
//! encode/send shows up as dropped blocks at the callback, never as a
//! growing queue.

use tokio::sync::mpsc;

use crate::audio::{encode_frame, CaptureError, CaptureFrame, CaptureSource, EncodedFrame, VisualizerTap};

pub struct CapturePipeline {
    source: Box<dyn CaptureSource>,
    tap: VisualizerTap,
    sample_rate: Option<u32>,
    running: bool,
}

impl CapturePipeline {
    pub fn new(source: Box<dyn CaptureSource>, tap: VisualizerTap) -> Self {
        Self {
            source,
            tap,
            sample_rate: None,
            running: false,
        }
    }

    /// Acquire device access.  Returns the device sample rate.
    pub async fn acquire(&mut self) -> Result<u32, CaptureError> {
        let rate = self.source.acquire().await?;
        log::debug!("capture: device acquired at {rate} Hz");
        self.sample_rate = Some(rate);
        Ok(rate)
    }

    /// Start pulling blocks into `sink`.  Requires a prior [`acquire`](Self::acquire).
    pub async fn start(&mut self, sink: mpsc::Sender<CaptureFrame>) -> Result<(), CaptureError> {
        if self.sample_rate.is_none() {
            return Err(CaptureError::NotAcquired);
        }
        self.source.start(sink).await?;
        self.running = true;
        log::info!("capture: started");
        Ok(())
    }

    /// Run one block through the tap and the encoder.
    pub fn process(&self, frame: CaptureFrame) -> EncodedFrame {
        self.tap.publish(&frame.samples);
        encode_frame(&frame.samples, frame.sample_rate)
    }

    /// Blocks dropped at the device callback so far.
    pub fn dropped_blocks(&self) -> u64 {
        self.source.dropped_blocks()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Stop pulling blocks and release the device.  Safe in any state.
    pub async fn stop(&mut self) {
        self.source.stop().await;
        self.tap.clear();
        if self.running {
            log::info!("capture: stopped");
        }
        self.running = false;
        self.sample_rate = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::visualizer_channel;
    use crate::config::VisualizerConfig;
    use crate::pipeline::testing::ScriptedCapture;

    #[tokio::test]
    async fn start_requires_acquire() {
        let (tap, _feed) = visualizer_channel(VisualizerConfig::default());
        let mut pipeline = CapturePipeline::new(Box::new(ScriptedCapture::new(48_000)), tap);
        let (tx, _rx) = mpsc::channel(1);

        assert!(matches!(pipeline.start(tx).await, Err(CaptureError::NotAcquired)));
        assert!(!pipeline.is_running());
    }

    #[tokio::test]
    async fn denied_acquire_never_starts() {
        let capture = ScriptedCapture::denied();
        let (tap, _feed) = visualizer_channel(VisualizerConfig::default());
        let mut pipeline = CapturePipeline::new(Box::new(capture.clone()), tap);

        assert!(pipeline.acquire().await.is_err());
        let (tx, _rx) = mpsc::channel(1);
        assert!(pipeline.start(tx).await.is_err());
        assert_eq!(capture.starts(), 0);
    }

    #[test]
    fn process_taps_raw_audio_and_encodes() {
        let (tap, feed) = visualizer_channel(VisualizerConfig::default());
        let pipeline = CapturePipeline::new(Box::new(ScriptedCapture::new(48_000)), tap);

        let encoded = pipeline.process(CaptureFrame {
            samples: vec![0.5; 4096],
            sample_rate: 48_000,
        });

        assert_eq!(encoded.len(), 1365);
        assert_eq!(encoded.samples[0], 16_383);
        assert_eq!(feed.latest().len(), 64);
        assert!(feed.latest().iter().all(|&s| s == 0.5));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_clears_the_tap() {
        let capture = ScriptedCapture::new(16_000);
        let (tap, feed) = visualizer_channel(VisualizerConfig::default());
        let mut pipeline = CapturePipeline::new(Box::new(capture.clone()), tap);

        pipeline.acquire().await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        pipeline.start(tx).await.unwrap();
        pipeline.process(CaptureFrame {
            samples: vec![0.1; 128],
            sample_rate: 16_000,
        });

        pipeline.stop().await;
        pipeline.stop().await;

        assert!(!pipeline.is_running());
        assert!(feed.latest().is_empty());
        assert_eq!(capture.stops(), 2);
        assert!(!capture.holds_device());
    }
}
