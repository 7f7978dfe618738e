//! Session pipeline: wires capture, transport, decoding and playback into one
//! live voice session and exposes its state to the rendering layer.
//!
//! # Architecture
//!
//! ```text
//! SessionManager::start()
//!        │  join!(capture.acquire(), transport.connect())
//!        ▼
//! LiveSession::run()  ← one tokio task, select! over:
//!        ├─ ChannelEvent   → TransportSession::handle_event
//!        │     ├─ Opened      → CapturePipeline::start
//!        │     ├─ Chunk       → decode_downstream → PlaybackScheduler::schedule
//!        │     ├─ Interrupted → PlaybackScheduler::flush
//!        │     └─ Closed / Failed → teardown
//!        ├─ CaptureFrame   → CapturePipeline::process → TransportSession::send
//!        ├─ OutputEvent    → PlaybackScheduler::on_ended / teardown
//!        └─ stop request   → teardown
//!
//! watch<SessionStatus> ───▶ SessionHandle::status()   (connection state, cursor, stats)
//! VisualizerFeed      ───▶ SessionHandle::visualizer()
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use voice_live::audio::{CpalCapture, CpalOutput};
//! use voice_live::config::AppConfig;
//! use voice_live::pipeline::SessionManager;
//! use voice_live::transport::LoopbackChannel;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let config = AppConfig::default();
//!     let manager = SessionManager::new(config.clone());
//!
//!     let mut session = manager
//!         .start(
//!             Box::new(CpalCapture::new(config.audio.input_device.clone(), config.audio.block_size)),
//!             Box::new(LoopbackChannel::new()),
//!             Box::new(CpalOutput::new(config.audio.output_device.clone())),
//!         )
//!         .await
//!         .unwrap();
//!
//!     let mut status = session.status();
//!     while status.changed().await.is_ok() {
//!         println!("{}", status.borrow().state.label());
//!     }
//!     session.stop().await;
//! }
//! ```

pub mod capture;
pub mod runner;
pub mod scheduler;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use capture::CapturePipeline;
pub use runner::{SessionError, SessionHandle, SessionManager};
pub use scheduler::{PlaybackScheduler, ScheduledPlayback};
pub use state::{ConnectionState, SessionStats, SessionStatus};
