//! Scripted capture source and speech channel for session tests.
//!
//! Both doubles are cheap `Clone` handles over shared state, so a test keeps
//! one handle while the session owns the other.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::{CaptureError, CaptureFrame, CaptureSource};
use crate::transport::wire::{decode_payload, ClientMessage};
use crate::transport::{ChannelEvent, SpeechChannel, TransportError};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ScriptedCapture
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CaptureInner {
    denied: bool,
    sample_rate: u32,
    sink: Option<mpsc::Sender<CaptureFrame>>,
    holds_device: bool,
    starts: usize,
    stops: usize,
    dropped: u64,
}

/// Capture source driven by the test via [`feed`](Self::feed).
#[derive(Clone, Default)]
pub struct ScriptedCapture {
    inner: Arc<Mutex<CaptureInner>>,
}

impl ScriptedCapture {
    pub fn new(sample_rate: u32) -> Self {
        let capture = Self::default();
        lock(&capture.inner).sample_rate = sample_rate;
        capture
    }

    /// A source whose permission step always fails.
    pub fn denied() -> Self {
        let capture = Self::new(48_000);
        lock(&capture.inner).denied = true;
        capture
    }

    /// Deliver one block as the device callback would, waiting for room.
    /// Returns `false` when the source is not started.
    pub async fn feed(&self, samples: Vec<f32>) -> bool {
        let (sink, sample_rate) = {
            let inner = lock(&self.inner);
            (inner.sink.clone(), inner.sample_rate)
        };
        match sink {
            Some(sink) => sink
                .send(CaptureFrame {
                    samples,
                    sample_rate,
                })
                .await
                .is_ok(),
            None => false,
        }
    }

    pub fn set_dropped(&self, dropped: u64) {
        lock(&self.inner).dropped = dropped;
    }

    pub fn starts(&self) -> usize {
        lock(&self.inner).starts
    }

    pub fn stops(&self) -> usize {
        lock(&self.inner).stops
    }

    pub fn holds_device(&self) -> bool {
        lock(&self.inner).holds_device
    }
}

#[async_trait]
impl CaptureSource for ScriptedCapture {
    async fn acquire(&mut self) -> Result<u32, CaptureError> {
        let mut inner = lock(&self.inner);
        if inner.denied {
            return Err(CaptureError::Denied("scripted".into()));
        }
        inner.holds_device = true;
        Ok(inner.sample_rate)
    }

    async fn start(&mut self, sink: mpsc::Sender<CaptureFrame>) -> Result<(), CaptureError> {
        let mut inner = lock(&self.inner);
        if !inner.holds_device {
            return Err(CaptureError::NotAcquired);
        }
        inner.sink = Some(sink);
        inner.starts += 1;
        Ok(())
    }

    async fn stop(&mut self) {
        let mut inner = lock(&self.inner);
        inner.sink = None;
        inner.holds_device = false;
        inner.stops += 1;
    }

    fn dropped_blocks(&self) -> u64 {
        lock(&self.inner).dropped
    }
}

// ---------------------------------------------------------------------------
// ScriptedChannel
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChannelInner {
    refuse: Option<String>,
    fail_sends: bool,
    events: Option<mpsc::Sender<ChannelEvent>>,
    sent: Vec<String>,
    closes: usize,
}

/// Speech channel whose inbound events are pushed by the test via
/// [`emit`](Self::emit) and whose outbound messages are recorded.
#[derive(Clone, Default)]
pub struct ScriptedChannel {
    inner: Arc<Mutex<ChannelInner>>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel whose `connect` fails with `reason`.
    pub fn refusing(reason: &str) -> Self {
        let channel = Self::new();
        lock(&channel.inner).refuse = Some(reason.to_string());
        channel
    }

    /// Make every following `send` fail.
    pub fn fail_sends(&self) {
        lock(&self.inner).fail_sends = true;
    }

    /// Push an inbound event.  Returns `false` if the channel is not
    /// connected.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        match &lock(&self.inner).events {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Every outbound message, in send order.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.inner).sent.clone()
    }

    /// Samples of every outbound audio chunk, in send order.
    pub fn sent_audio(&self) -> Vec<Vec<i16>> {
        self.sent()
            .iter()
            .filter_map(|text| match serde_json::from_str::<ClientMessage>(text) {
                Ok(ClientMessage::RealtimeInput(input)) => Some(input.media_chunks),
                _ => None,
            })
            .flatten()
            .filter_map(|blob| decode_payload(&blob.data).ok())
            .map(|bytes| {
                bytes
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect()
            })
            .collect()
    }

    pub fn closes(&self) -> usize {
        lock(&self.inner).closes
    }
}

#[async_trait]
impl SpeechChannel for ScriptedChannel {
    async fn connect(&mut self) -> Result<mpsc::Receiver<ChannelEvent>, TransportError> {
        let mut inner = lock(&self.inner);
        if let Some(reason) = &inner.refuse {
            return Err(TransportError::Connect(reason.clone()));
        }
        let (tx, rx) = mpsc::channel(64);
        inner.events = Some(tx);
        Ok(rx)
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.fail_sends {
            return Err(TransportError::Closed);
        }
        inner.sent.push(text);
        Ok(())
    }

    async fn close(&mut self) {
        let mut inner = lock(&self.inner);
        inner.events = None;
        inner.closes += 1;
    }
}
