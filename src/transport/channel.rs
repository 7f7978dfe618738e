//! The remote speech channel seam.
//!
//! A [`SpeechChannel`] is a duplex text-message channel to the speech
//! service.  `connect` hands back the inbound event stream; lifecycle
//! callbacks (`open`, `message`, `close`, `error`) arrive on it as
//! [`ChannelEvent`]s in the order the remote side produced them.  The
//! network implementation lives outside this crate; the
//! [`LoopbackChannel`](super::LoopbackChannel) is the in-process one.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// ChannelEvent
// ---------------------------------------------------------------------------

/// Lifecycle and data events emitted by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The remote side acknowledged the channel.
    Open,
    /// One JSON text message.
    Message(String),
    /// The channel closed; `reason` is the remote close reason, if any.
    Close { reason: Option<String> },
    /// Transport-level failure.  A `Close` may or may not follow.
    Error(String),
}

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

/// Errors that can surface from the transport layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel could not be opened.
    #[error("failed to connect: {0}")]
    Connect(String),

    /// `send` was called while the channel was not open.
    #[error("channel is not open")]
    NotOpen,

    /// The remote side went away mid-send.
    #[error("channel closed by remote")]
    Closed,

    /// An outbound message could not be serialised.
    #[error("failed to encode outbound message: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Encode(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// SpeechChannel trait
// ---------------------------------------------------------------------------

/// Duplex message channel to the remote speech service.
///
/// Implementors must be `Send` so the session loop can own them inside a
/// spawned task.
#[async_trait]
pub trait SpeechChannel: Send {
    /// Open the channel and return its event stream.
    ///
    /// Returning `Ok` does not mean the channel is open: that is signalled
    /// by [`ChannelEvent::Open`] on the returned receiver.
    async fn connect(&mut self) -> Result<mpsc::Receiver<ChannelEvent>, TransportError>;

    /// Send one JSON text message.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Sever the channel.  Must be safe to call repeatedly.
    async fn close(&mut self);
}
