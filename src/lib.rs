//! Live bidirectional voice session.
//!
//! Microphone audio is encoded to 16 kHz PCM16 and streamed to a remote
//! speech service; synthesized 24 kHz speech streamed back is decoded and
//! scheduled gaplessly on the output device, with mid-stream interruption.
//!
//! * [`audio`]: device sources and sinks, encode/decode, visualizer tap.
//! * [`transport`]: speech channel seam, wire format, Transport Session.
//! * [`pipeline`]: capture pipeline, playback scheduler, session runner.
//! * [`config`]: `settings.toml` persistence.

pub mod audio;
pub mod config;
pub mod pipeline;
pub mod transport;
