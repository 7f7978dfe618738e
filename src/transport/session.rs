//! Transport Session: owns the channel lifecycle and mediates all traffic.
//!
//! The session is the only writer of [`ConnectionState`].  Channel callbacks
//! arrive as [`ChannelEvent`]s and are fed through
//! [`handle_event`](TransportSession::handle_event), which applies the state
//! transition and returns what the session loop must act on as
//! [`Inbound`] values, in arrival order.
//!
//! Outbound frames are only sent while the state is `Open`; frames produced
//! earlier are dropped and counted, never queued.

use tokio::sync::mpsc;

use crate::audio::EncodedFrame;
use crate::config::SessionConfig;
use crate::pipeline::ConnectionState;

use super::channel::{ChannelEvent, SpeechChannel, TransportError};
use super::wire::{decode_payload, ClientMessage, ServerMessage};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// One encoded audio payload from the remote side, tagged with its arrival
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundChunk {
    /// Arrival sequence number, starting at 0 for each session.
    pub seq: u64,
    /// Raw PCM16 little-endian bytes (already base64-decoded).
    pub payload: Vec<u8>,
}

/// Work for the session loop produced by one channel event.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The channel is open and set up; capture may start forwarding.
    Opened,
    /// Audio to decode and schedule.
    Chunk(InboundChunk),
    /// The remote side detected barge-in; playback must flush now.
    Interrupted,
    /// The remote side closed the channel.
    Closed { reason: Option<String> },
    /// Transport-level failure; the session is now `Errored`.
    Failed(String),
}

/// Outbound and inbound counters kept by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub payloads_rejected: u64,
}

// ---------------------------------------------------------------------------
// TransportSession
// ---------------------------------------------------------------------------

pub struct TransportSession {
    channel: Box<dyn SpeechChannel>,
    setup: ClientMessage,
    state: ConnectionState,
    severed: bool,
    next_seq: u64,
    stats: TransportStats,
}

impl TransportSession {
    pub fn new(channel: Box<dyn SpeechChannel>, config: &SessionConfig) -> Self {
        Self {
            channel,
            setup: ClientMessage::setup(config),
            state: ConnectionState::Idle,
            severed: false,
            next_seq: 0,
            stats: TransportStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// `idle → connecting`, then open the channel.
    ///
    /// On failure the session converges to `Closed` and the error is
    /// returned.
    pub async fn connect(&mut self) -> Result<mpsc::Receiver<ChannelEvent>, TransportError> {
        self.transition(ConnectionState::Connecting);
        match self.channel.connect().await {
            Ok(events) => Ok(events),
            Err(e) => {
                log::error!("transport: connect failed: {e}");
                self.transition(ConnectionState::Errored);
                self.close().await;
                Err(e)
            }
        }
    }

    /// Apply one channel event.
    pub async fn handle_event(&mut self, event: ChannelEvent) -> Vec<Inbound> {
        match event {
            ChannelEvent::Open => self.on_open().await,
            ChannelEvent::Message(text) => self.on_message(&text),
            ChannelEvent::Close { reason } => {
                if self.state.is_terminal() {
                    return Vec::new();
                }
                log::info!("transport: remote closed ({})", reason.as_deref().unwrap_or("no reason"));
                self.transition(ConnectionState::Closed);
                vec![Inbound::Closed { reason }]
            }
            ChannelEvent::Error(message) => {
                if self.state.is_terminal() {
                    return Vec::new();
                }
                log::error!("transport: channel error: {message}");
                self.transition(ConnectionState::Errored);
                vec![Inbound::Failed(message)]
            }
        }
    }

    async fn on_open(&mut self) -> Vec<Inbound> {
        if self.state != ConnectionState::Connecting {
            log::debug!("transport: ignoring open in state {:?}", self.state);
            return Vec::new();
        }

        let sent = match self.setup.to_json() {
            Ok(json) => self.channel.send(json).await,
            Err(e) => Err(e.into()),
        };

        match sent {
            Ok(()) => {
                self.transition(ConnectionState::Open);
                vec![Inbound::Opened]
            }
            Err(e) => {
                log::error!("transport: setup failed: {e}");
                self.transition(ConnectionState::Errored);
                vec![Inbound::Failed(e.to_string())]
            }
        }
    }

    fn on_message(&mut self, text: &str) -> Vec<Inbound> {
        if self.state != ConnectionState::Open {
            log::trace!("transport: dropping message in state {:?}", self.state);
            return Vec::new();
        }

        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("transport: unparseable message dropped: {e}");
                self.stats.payloads_rejected += 1;
                return Vec::new();
            }
        };

        if message.is_setup_complete() {
            log::debug!("transport: setup complete");
        }

        let mut out = Vec::new();
        for data in message.audio_payloads() {
            match decode_payload(data) {
                Ok(payload) => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    out.push(Inbound::Chunk(InboundChunk { seq, payload }));
                }
                Err(e) => {
                    log::warn!("transport: invalid base64 payload dropped: {e}");
                    self.stats.payloads_rejected += 1;
                }
            }
        }

        if message.is_interrupted() {
            log::debug!("transport: interrupted by remote");
            out.push(Inbound::Interrupted);
        }
        if message.is_turn_complete() {
            log::debug!("transport: turn complete");
        }
        out
    }

    /// Send one encoded frame.
    ///
    /// Returns [`TransportError::NotOpen`] (logged, counted, otherwise
    /// harmless) when the channel is not open.  Any other error means the
    /// channel failed and the session is now `Errored`.
    pub async fn send(&mut self, frame: EncodedFrame) -> Result<(), TransportError> {
        if self.state != ConnectionState::Open {
            self.stats.frames_dropped += 1;
            log::trace!(
                "transport: dropped {} samples while {}",
                frame.len(),
                self.state.label()
            );
            return Err(TransportError::NotOpen);
        }

        let json = ClientMessage::audio(&frame).to_json()?;
        match self.channel.send(json).await {
            Ok(()) => {
                self.stats.frames_sent += 1;
                Ok(())
            }
            Err(e) => {
                log::error!("transport: send failed: {e}");
                self.transition(ConnectionState::Errored);
                Err(e)
            }
        }
    }

    /// Record a failure reported by another component (output device,
    /// capture) so the session converges through `Errored`.
    pub fn mark_errored(&mut self) {
        if !self.state.is_terminal() {
            self.transition(ConnectionState::Errored);
        }
    }

    /// Sever the channel and move to `Closed`.  Idempotent.
    pub async fn close(&mut self) {
        if !self.severed {
            self.severed = true;
            self.channel.close().await;
        }
        if self.state != ConnectionState::Closed {
            self.transition(ConnectionState::Closed);
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            log::warn!("transport: refusing {:?} → {:?}", self.state, next);
            return;
        }
        log::info!("transport: {} → {}", self.state.label(), next.label());
        self.state = next;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
