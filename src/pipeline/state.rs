//! Connection state machine and the status snapshot read by the rendering
//! layer.
//!
//! [`ConnectionState`] is written only by the
//! [`TransportSession`](crate::transport::TransportSession); everything else
//! sees it through [`SessionStatus`], which the session loop publishes on a
//! `tokio::sync::watch` channel after every event.

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// States of the remote channel.
///
/// ```text
/// Idle ──start──▶ Connecting ──open──▶ Open ──stop / remote close──▶ Closed
///                     │                  │
///                     │                  └──failure──▶ Errored ──teardown──▶ Closed
///                     └──failure──▶ Errored
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session requested yet.
    #[default]
    Idle,
    /// Device acquisition and channel open are in flight.
    Connecting,
    /// The remote side acknowledged the channel; audio flows both ways.
    Open,
    /// A transport or device failure occurred; teardown follows at once.
    Errored,
    /// Terminal.  All resources have been released.
    Closed,
}

impl ConnectionState {
    /// Whether `self → next` is an edge of the state machine.
    ///
    /// ```
    /// use voice_live::pipeline::ConnectionState::*;
    ///
    /// assert!(Idle.can_transition_to(Connecting));
    /// assert!(Open.can_transition_to(Errored));
    /// assert!(!Closed.can_transition_to(Open));
    /// assert!(!Idle.can_transition_to(Open));
    /// ```
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Closed)
                | (Connecting, Open)
                | (Connecting, Errored)
                | (Connecting, Closed)
                | (Open, Errored)
                | (Open, Closed)
                | (Errored, Closed)
        )
    }

    /// Returns `true` once the session can no longer carry audio.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Errored | ConnectionState::Closed)
    }

    /// A short human-readable label suitable for a status bar.
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Open => "Live",
            ConnectionState::Errored => "Error",
            ConnectionState::Closed => "Disconnected",
        }
    }
}

// ---------------------------------------------------------------------------
// SessionStats
// ---------------------------------------------------------------------------

/// Running counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Encoded frames handed to the open channel.
    pub frames_sent: u64,
    /// Encoded frames dropped because the channel was not open yet.
    pub frames_dropped: u64,
    /// Capture blocks dropped at the device callback.
    pub capture_blocks_dropped: u64,
    /// Inbound chunks decoded and scheduled.
    pub chunks_decoded: u64,
    /// Inbound chunks dropped as malformed.
    pub chunks_dropped: u64,
    /// Flushes that stopped at least one buffer, for any reason.
    pub flushes: u64,
    /// Interruption signals received from the remote side.
    pub interruptions: u64,
}

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// Snapshot of a session for the rendering layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    /// Current connection state.
    pub state: ConnectionState,
    /// Next safe start time on the output timeline, in seconds.
    pub playback_cursor: f64,
    /// Buffers currently scheduled or playing.
    pub scheduled: usize,
    /// Single user-facing status line after a failure.
    pub message: Option<String>,
    pub stats: SessionStats,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
