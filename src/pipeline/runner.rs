//! Session runner: drives one live voice session end to end.
//!
//! [`SessionManager::start`] acquires the microphone and opens the speech
//! channel concurrently, then spawns a single task that owns every session
//! component and multiplexes their event sources with `tokio::select!`:
//!
//! ```text
//! stop request (oneshot)      ─┐
//! ChannelEvent (transport)    ─┤
//! CaptureFrame (device, 1 blk)─┼─▶ LiveSession::run ──▶ watch<SessionStatus>
//! OutputEvent (device)        ─┘
//!
//! CaptureFrame ─▶ CapturePipeline::process ─▶ TransportSession::send
//! Inbound::Chunk ─▶ decode_downstream ─▶ PlaybackScheduler::schedule
//! Inbound::Interrupted ─▶ PlaybackScheduler::flush
//! ```
//!
//! Every exit path (explicit stop, remote close, channel error, output
//! failure, dropped handle) runs the same teardown once: stop capture,
//! sever the channel, flush the scheduler, release the output device.
//! The device lease is only returned after that, so a new session never
//! overlaps a previous one.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::audio::{
    decode_downstream, visualizer_channel, CaptureError, CaptureFrame, CaptureSource, DeviceError,
    OutputDevice, OutputEvent, VisualizerFeed,
};
use crate::config::AppConfig;
use crate::transport::{
    ChannelEvent, Inbound, InboundChunk, SpeechChannel, TransportError, TransportSession,
};

use super::capture::CapturePipeline;
use super::scheduler::PlaybackScheduler;
use super::state::{ConnectionState, SessionStats, SessionStatus};

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

/// Failures that end (or prevent) a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Microphone access was refused; the session never started.
    #[error("microphone access denied: {0}")]
    PermissionDenied(#[source] CaptureError),

    /// The microphone failed after access was granted.
    #[error("microphone failed: {0}")]
    Capture(#[source] CaptureError),

    /// The channel failed to open or dropped.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The output device failed.
    #[error("audio output failed: {0}")]
    Device(#[from] DeviceError),
}

impl SessionError {
    /// The single status line shown to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            SessionError::PermissionDenied(_) => "Microphone access was denied.",
            SessionError::Capture(_) => "The microphone stopped working.",
            SessionError::Connection(_) => "Connection to the voice service was lost.",
            SessionError::Device(_) => "The audio output device failed.",
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Connection(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Starts sessions one at a time.
///
/// ```rust,no_run
/// use voice_live::audio::{CpalCapture, CpalOutput};
/// use voice_live::config::AppConfig;
/// use voice_live::pipeline::SessionManager;
/// use voice_live::transport::LoopbackChannel;
///
/// # async fn example() -> Result<(), voice_live::pipeline::SessionError> {
/// let config = AppConfig::default();
/// let manager = SessionManager::new(config.clone());
/// let mut session = manager
///     .start(
///         Box::new(CpalCapture::new(None, config.audio.block_size)),
///         Box::new(LoopbackChannel::new()),
///         Box::new(CpalOutput::new(None)),
///     )
///     .await?;
///
/// println!("{}", session.state().label());
/// session.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct SessionManager {
    config: AppConfig,
    lease: Arc<Semaphore>,
}

impl SessionManager {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            lease: Arc::new(Semaphore::new(1)),
        }
    }

    /// Start a session.  Waits until any previous session has finished its
    /// teardown.
    ///
    /// # Errors
    ///
    /// [`SessionError::PermissionDenied`] if the microphone is refused,
    /// [`SessionError::Connection`] if the channel cannot be opened,
    /// [`SessionError::Device`] if the output device cannot be opened.
    /// Nothing is left running on error.
    pub async fn start(
        &self,
        capture: Box<dyn CaptureSource>,
        channel: Box<dyn SpeechChannel>,
        mut output: Box<dyn OutputDevice>,
    ) -> Result<SessionHandle, SessionError> {
        let lease = Arc::clone(&self.lease)
            .acquire_owned()
            .await
            .map_err(|_| SessionError::Connection("session manager shut down".into()))?;

        log::info!("session: starting");

        let output_events = output.open().await?;
        let mut scheduler = PlaybackScheduler::new(output);

        let (tap, feed) = visualizer_channel(self.config.visualizer.clone());
        let mut capture = CapturePipeline::new(capture, tap);
        let mut transport = TransportSession::new(channel, &self.config.session);

        let (acquired, connected) = tokio::join!(capture.acquire(), transport.connect());

        let channel_events = match (acquired, connected) {
            (Ok(_), Ok(events)) => events,
            (Err(e), _) => {
                log::error!("session: microphone unavailable: {e}");
                capture.stop().await;
                transport.close().await;
                scheduler.close().await;
                return Err(SessionError::PermissionDenied(e));
            }
            (Ok(_), Err(e)) => {
                capture.stop().await;
                scheduler.close().await;
                return Err(e.into());
            }
        };

        let (frames_tx, frames_rx) = mpsc::channel(self.config.audio.capture_queue_blocks.max(1));
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: transport.state(),
            ..SessionStatus::default()
        });
        let (stop_tx, stop_rx) = oneshot::channel();

        let session = LiveSession {
            transport,
            capture,
            scheduler,
            frames_tx: Some(frames_tx),
            status: status_tx,
            message: None,
            chunks_decoded: 0,
            chunks_dropped: 0,
            interruptions: 0,
            torn_down: false,
            _lease: lease,
        };

        let task = tokio::spawn(session.run(stop_rx, channel_events, frames_rx, output_events));

        Ok(SessionHandle {
            status: status_rx,
            feed,
            stop: Some(stop_tx),
            task: Some(task),
        })
    }
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// The caller's view of one live session.
///
/// Dropping the handle stops the session in the background.
pub struct SessionHandle {
    status: watch::Receiver<SessionStatus>,
    feed: VisualizerFeed,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Subscribe to status snapshots.
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Visualizer feed tapped from this session's capture signal.
    pub fn visualizer(&self) -> VisualizerFeed {
        self.feed.clone()
    }

    /// Stop the session and wait for its teardown.  Idempotent.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.join().await;
    }

    /// Wait for the session to end on its own (remote close or failure).
    pub async fn closed(&mut self) {
        self.join().await;
    }

    async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("session: task failed: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LiveSession
// ---------------------------------------------------------------------------

struct LiveSession {
    transport: TransportSession,
    capture: CapturePipeline,
    scheduler: PlaybackScheduler,
    /// Handed to the capture source once the channel opens.
    frames_tx: Option<mpsc::Sender<CaptureFrame>>,
    status: watch::Sender<SessionStatus>,
    message: Option<String>,
    chunks_decoded: u64,
    chunks_dropped: u64,
    interruptions: u64,
    torn_down: bool,
    _lease: OwnedSemaphorePermit,
}

impl LiveSession {
    async fn run(
        mut self,
        mut stop: oneshot::Receiver<()>,
        mut channel_events: mpsc::Receiver<ChannelEvent>,
        mut frames: mpsc::Receiver<CaptureFrame>,
        mut output_events: mpsc::UnboundedReceiver<OutputEvent>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = &mut stop => {
                    log::info!("session: stop requested");
                    break;
                }

                event = channel_events.recv() => {
                    let event = event.unwrap_or(ChannelEvent::Close { reason: None });
                    self.on_channel_event(event).await;
                }

                Some(frame) = frames.recv() => {
                    self.on_frame(frame).await;
                }

                Some(event) = output_events.recv() => {
                    self.on_output_event(event);
                }
            }

            if self.transport.state().is_terminal() {
                break;
            }
            self.publish();
        }

        self.teardown().await;
        self.publish();
        log::info!("session: ended");
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        for inbound in self.transport.handle_event(event).await {
            match inbound {
                Inbound::Opened => self.start_capture().await,
                Inbound::Chunk(chunk) => self.play(chunk),
                Inbound::Interrupted => {
                    self.interruptions += 1;
                    self.scheduler.flush();
                }
                Inbound::Closed { .. } => {}
                Inbound::Failed(reason) => self.fail(SessionError::Connection(reason)),
            }
            if self.transport.state().is_terminal() {
                break;
            }
        }
    }

    async fn start_capture(&mut self) {
        let Some(frames_tx) = self.frames_tx.take() else {
            return;
        };
        if let Err(e) = self.capture.start(frames_tx).await {
            self.fail(SessionError::Capture(e));
        }
    }

    fn play(&mut self, chunk: InboundChunk) {
        let buffer = match decode_downstream(&chunk.payload) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::warn!("session: chunk {} dropped: {e}", chunk.seq);
                self.chunks_dropped += 1;
                return;
            }
        };

        match self.scheduler.schedule(buffer) {
            Ok(_) => self.chunks_decoded += 1,
            Err(e) => self.fail(SessionError::Device(e)),
        }
    }

    async fn on_frame(&mut self, frame: CaptureFrame) {
        let encoded = self.capture.process(frame);
        match self.transport.send(encoded).await {
            Ok(()) | Err(TransportError::NotOpen) => {}
            Err(e) => self.fail(e.into()),
        }
    }

    fn on_output_event(&mut self, event: OutputEvent) {
        match event {
            OutputEvent::Ended(id) => self.scheduler.on_ended(id),
            OutputEvent::Failed(reason) => self.fail(SessionError::Device(DeviceError::Stream(reason))),
        }
    }

    fn fail(&mut self, error: SessionError) {
        log::error!("session: {error}");
        self.message = Some(error.user_message().to_string());
        self.scheduler.flush();
        self.transport.mark_errored();
    }

    /// Release everything in cancellation order.  Runs once.
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.capture.stop().await;
        self.transport.close().await;
        self.scheduler.close().await;
        self.frames_tx = None;
        log::debug!("session: torn down");
    }

    fn publish(&self) {
        let transport = self.transport.stats();
        self.status.send_replace(SessionStatus {
            state: self.transport.state(),
            playback_cursor: self.scheduler.next_start_time(),
            scheduled: self.scheduler.scheduled().len(),
            message: self.message.clone(),
            stats: SessionStats {
                frames_sent: transport.frames_sent,
                frames_dropped: transport.frames_dropped,
                capture_blocks_dropped: self.capture.dropped_blocks(),
                chunks_decoded: self.chunks_decoded,
                chunks_dropped: self.chunks_dropped + transport.payloads_rejected,
                flushes: self.scheduler.flushes(),
                interruptions: self.interruptions,
            },
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audio::VirtualOutput;
    use crate::pipeline::testing::{ScriptedCapture, ScriptedChannel};
    use crate::transport::ServerMessage;

    struct Rig {
        capture: ScriptedCapture,
        channel: ScriptedChannel,
        output: VirtualOutput,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                capture: ScriptedCapture::new(48_000),
                channel: ScriptedChannel::new(),
                output: VirtualOutput::new(),
            }
        }

        async fn start(&self, manager: &SessionManager) -> Result<SessionHandle, SessionError> {
            manager
                .start(
                    Box::new(self.capture.clone()),
                    Box::new(self.channel.clone()),
                    Box::new(self.output.clone()),
                )
                .await
        }

        async fn open(&self) -> SessionHandle {
            let handle = self
                .start(&SessionManager::new(AppConfig::default()))
                .await
                .expect("session starts");
            assert!(self.channel.emit(ChannelEvent::Open));
            wait_until(&handle, |s| s.state == ConnectionState::Open).await;
            handle
        }

        fn send_audio(&self, pcm: &[i16]) {
            let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
            self.send_raw(&bytes);
        }

        fn send_raw(&self, bytes: &[u8]) {
            let msg = ServerMessage::audio("audio/pcm;rate=24000", bytes);
            let text = serde_json::to_string(&msg).unwrap();
            assert!(self.channel.emit(ChannelEvent::Message(text)));
        }
    }

    async fn wait_until(
        handle: &SessionHandle,
        pred: impl FnMut(&SessionStatus) -> bool,
    ) -> SessionStatus {
        let mut status = handle.status();
        let seen = tokio::time::timeout(Duration::from_secs(5), status.wait_for(pred))
            .await
            .expect("timed out waiting for session status")
            .expect("session status closed")
            .clone();
        seen
    }

    #[tokio::test]
    async fn capture_frames_are_encoded_and_sent_in_order() {
        let rig = Rig::new();
        let mut handle = rig.open().await;
        assert_eq!(rig.capture.starts(), 1);

        for level in [0.1_f32, 0.2, 0.3] {
            assert!(rig.capture.feed(vec![level; 4096]).await);
        }
        wait_until(&handle, |s| s.stats.frames_sent == 3).await;

        let audio = rig.channel.sent_audio();
        assert_eq!(audio.len(), 3);
        for (frame, level) in audio.iter().zip([0.1_f32, 0.2, 0.3]) {
            assert_eq!(frame.len(), 1365);
            assert_eq!(frame[0], (level * 32_767.0) as i16);
        }
        // The setup message precedes all audio.
        assert!(rig.channel.sent()[0].starts_with(r#"{"setup":"#));

        handle.stop().await;
    }

    #[tokio::test]
    async fn back_to_back_chunks_play_gapless() {
        let rig = Rig::new();
        let mut handle = rig.open().await;

        rig.send_audio(&[16_384; 600]);
        rig.send_audio(&[8_192; 600]);
        let status = wait_until(&handle, |s| s.stats.chunks_decoded == 2).await;
        assert_eq!(status.scheduled, 2);
        assert_eq!(status.playback_cursor, 0.05);

        rig.output.advance_frames(1_200);
        let rendered = rig.output.rendered();
        assert!(rendered[..600].iter().all(|&s| s == 0.5));
        assert!(rendered[600..1_200].iter().all(|&s| s == 0.25));

        wait_until(&handle, |s| s.scheduled == 0).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn interruption_flushes_and_restarts_at_the_clock() {
        let rig = Rig::new();
        let mut handle = rig.open().await;

        // Two 2400-byte chunks, 50 ms each.
        rig.send_audio(&[16_384; 1_200]);
        rig.send_audio(&[16_384; 1_200]);
        let status = wait_until(&handle, |s| s.stats.chunks_decoded == 2).await;
        assert_eq!(status.playback_cursor, 0.1);

        rig.output.advance_frames(240);
        assert!(rig
            .channel
            .emit(ChannelEvent::Message(r#"{"serverContent":{"interrupted":true}}"#.into())));
        let status = wait_until(&handle, |s| s.stats.flushes == 1).await;
        assert_eq!(status.stats.interruptions, 1);
        assert_eq!(status.scheduled, 0);
        assert_eq!(status.playback_cursor, 0.0);
        assert_eq!(rig.output.active(), 0);
        assert_eq!(rig.output.stops(), 2);

        rig.send_audio(&[8_192; 600]);
        let status = wait_until(&handle, |s| s.stats.chunks_decoded == 3).await;
        assert!((status.playback_cursor - 0.035).abs() < 1e-9);

        rig.output.advance_frames(600);
        let rendered = rig.output.rendered();
        assert!(rendered[240..840].iter().all(|&s| s == 0.25));

        handle.stop().await;
    }

    #[tokio::test]
    async fn remote_close_twice_tears_down_once() {
        let rig = Rig::new();
        let mut handle = rig.open().await;

        rig.send_audio(&[16_384; 600]);
        rig.send_audio(&[16_384; 600]);
        wait_until(&handle, |s| s.stats.chunks_decoded == 2).await;

        rig.channel.emit(ChannelEvent::Close { reason: Some("done".into()) });
        rig.channel.emit(ChannelEvent::Close { reason: None });
        let status = wait_until(&handle, |s| s.state == ConnectionState::Closed).await;
        handle.stop().await;
        handle.stop().await;

        // The teardown flush is not an interruption.
        assert_eq!(status.stats.flushes, 1);
        assert_eq!(status.stats.interruptions, 0);
        assert_eq!(status.playback_cursor, 0.0);
        assert!(status.message.is_none());
        assert_eq!(rig.capture.stops(), 1);
        assert!(!rig.capture.holds_device());
        assert_eq!(rig.output.stops(), 2);
        assert_eq!(rig.output.closes(), 1);
        assert_eq!(rig.channel.closes(), 1);
    }

    #[tokio::test]
    async fn malformed_chunk_is_dropped_and_the_session_continues() {
        let rig = Rig::new();
        let mut handle = rig.open().await;

        rig.send_raw(&[0, 0, 0]);
        let status = wait_until(&handle, |s| s.stats.chunks_dropped == 1).await;
        assert_eq!(status.state, ConnectionState::Open);
        assert_eq!(status.scheduled, 0);

        rig.send_audio(&[0; 240]);
        wait_until(&handle, |s| s.stats.chunks_decoded == 1).await;

        handle.stop().await;
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn channel_error_closes_with_a_user_message() {
        let rig = Rig::new();
        let mut handle = rig.open().await;
        rig.send_audio(&[0; 600]);
        wait_until(&handle, |s| s.stats.chunks_decoded == 1).await;

        rig.channel.emit(ChannelEvent::Error("socket reset".into()));
        let status = wait_until(&handle, |s| s.state == ConnectionState::Closed).await;
        handle.closed().await;

        assert_eq!(
            status.message.as_deref(),
            Some("Connection to the voice service was lost.")
        );
        assert_eq!(status.scheduled, 0);
        assert_eq!(rig.capture.stops(), 1);
        assert_eq!(rig.output.closes(), 1);
    }

    #[tokio::test]
    async fn output_failure_closes_the_session() {
        let rig = Rig::new();
        let mut handle = rig.open().await;

        rig.output.fail("device unplugged");
        let status = wait_until(&handle, |s| s.state == ConnectionState::Closed).await;
        handle.closed().await;

        assert_eq!(status.message.as_deref(), Some("The audio output device failed."));
        assert_eq!(rig.capture.stops(), 1);
        assert_eq!(rig.channel.closes(), 1);
    }

    #[tokio::test]
    async fn send_failure_closes_the_session() {
        let rig = Rig::new();
        let mut handle = rig.open().await;
        rig.channel.fail_sends();

        assert!(rig.capture.feed(vec![0.0; 4096]).await);
        let status = wait_until(&handle, |s| s.state == ConnectionState::Closed).await;
        handle.closed().await;

        assert_eq!(status.stats.frames_sent, 0);
        assert!(status.message.is_some());
    }

    #[tokio::test]
    async fn permission_denied_never_starts_capture() {
        let rig = Rig {
            capture: ScriptedCapture::denied(),
            ..Rig::new()
        };

        let err = rig
            .start(&SessionManager::new(AppConfig::default()))
            .await
            .err()
            .expect("start must fail");

        assert!(matches!(err, SessionError::PermissionDenied(_)));
        assert_eq!(err.user_message(), "Microphone access was denied.");
        assert_eq!(rig.capture.starts(), 0);
        assert_eq!(rig.channel.closes(), 1);
        assert_eq!(rig.output.closes(), 1);
    }

    #[tokio::test]
    async fn connection_failure_releases_the_microphone() {
        let rig = Rig {
            channel: ScriptedChannel::refusing("unreachable"),
            ..Rig::new()
        };

        let err = rig
            .start(&SessionManager::new(AppConfig::default()))
            .await
            .err()
            .expect("start must fail");

        assert!(matches!(err, SessionError::Connection(_)));
        assert!(!rig.capture.holds_device());
        assert_eq!(rig.capture.starts(), 0);
        assert_eq!(rig.output.closes(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let rig = Rig::new();
        let mut handle = rig.open().await;

        handle.stop().await;
        handle.stop().await;

        assert_eq!(handle.state(), ConnectionState::Closed);
        assert_eq!(rig.capture.stops(), 1);
        assert_eq!(rig.channel.closes(), 1);
        assert_eq!(rig.output.closes(), 1);
    }

    #[tokio::test]
    async fn capture_drops_are_reported() {
        let rig = Rig::new();
        let mut handle = rig.open().await;

        rig.capture.set_dropped(4);
        assert!(rig.capture.feed(vec![0.0; 4096]).await);
        wait_until(&handle, |s| s.stats.capture_blocks_dropped == 4).await;

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn next_session_waits_for_previous_teardown() {
        let manager = SessionManager::new(AppConfig::default());
        let first = Rig::new();
        let mut handle = first.start(&manager).await.expect("first session");

        let second = Rig::new();
        let blocked = tokio::time::timeout(Duration::from_secs(1), second.start(&manager)).await;
        assert!(blocked.is_err(), "second session started during the first");

        handle.stop().await;
        let mut next = second.start(&manager).await.expect("second session");
        assert_eq!(next.state(), ConnectionState::Connecting);
        next.stop().await;
    }
}
