//! Remote speech channel: the duplex channel seam, its JSON wire format, and
//! the Transport Session that owns the connection state machine.
//!
//! ```text
//! EncodedFrame ──▶ TransportSession::send ──▶ ClientMessage (JSON, base64) ──▶ SpeechChannel
//! SpeechChannel ──▶ ChannelEvent ──▶ TransportSession::handle_event ──▶ Inbound
//!                                         (Opened | Chunk | Interrupted | Closed | Failed)
//! ```

pub mod channel;
pub mod loopback;
pub mod session;
pub mod wire;

pub use channel::{ChannelEvent, SpeechChannel, TransportError};
pub use loopback::LoopbackChannel;
pub use session::{Inbound, InboundChunk, TransportSession, TransportStats};
pub use wire::{ClientMessage, ServerMessage};
