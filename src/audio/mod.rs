//! Audio pipeline: capture, upstream encoding, downstream decoding, output
//! mixing and the visualizer tap.
//!
//! # Pipeline
//!
//! ```text
//! Microphone → cpal callback → BlockAssembler → CaptureFrame (mpsc, 1 block)
//!           → encode_pcm16 (16 kHz PCM16) → EncodedFrame → transport
//!                      └──▶ VisualizerTap (watch) ──▶ VisualizerFeed::subscribe
//!
//! transport → bytes → decode_pcm16 (24 kHz f32) → DecodedBuffer
//!           → OutputDevice::start(id, buffer, t) → Timeline → speaker
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tokio::sync::mpsc;
//! use voice_live::audio::{encode_frame, CaptureSource, CpalCapture};
//!
//! # async fn example() -> Result<(), voice_live::audio::CaptureError> {
//! let mut capture = CpalCapture::new(None, 4096);
//! capture.acquire().await?;
//! let (tx, mut rx) = mpsc::channel(1);
//! capture.start(tx).await?;
//!
//! while let Some(frame) = rx.recv().await {
//!     let encoded = encode_frame(&frame.samples, frame.sample_rate);
//!     println!("{} samples @ 16 kHz", encoded.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod decode;
pub mod encode;
pub mod output;
pub mod visualizer;

pub use capture::{BlockAssembler, CaptureError, CaptureFrame, CaptureSource, CpalCapture};
pub use decode::{
    decode_downstream, decode_pcm16, DecodeError, DecodedBuffer, DOWNSTREAM_CHANNELS,
    DOWNSTREAM_SAMPLE_RATE,
};
pub use encode::{
    encode_frame, encode_pcm16, stereo_to_mono, EncodedFrame, UPSTREAM_MIME_TYPE,
    UPSTREAM_SAMPLE_RATE,
};
pub use output::{
    CpalOutput, DeviceError, OutputDevice, OutputEvent, PlaybackId, Timeline, VirtualOutput,
};
pub use visualizer::{
    visualizer_channel, Analyser, VisualizerFeed, VisualizerFrame, VisualizerTap,
};
