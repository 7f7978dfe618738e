//! In-process echo channel for device checks.
//!
//! [`LoopbackChannel`] behaves like a speech service that answers every
//! upstream audio chunk with the same audio, converted from 16 kHz to the
//! 24 kHz downstream layout.  It opens immediately, acknowledges setup with
//! `setupComplete`, and reports `Close` when closed locally.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::{DOWNSTREAM_SAMPLE_RATE, UPSTREAM_SAMPLE_RATE};

use super::channel::{ChannelEvent, SpeechChannel, TransportError};
use super::wire::{decode_payload, ClientMessage, ServerMessage};

const DOWNSTREAM_MIME_TYPE: &str = "audio/pcm;rate=24000";
const EVENT_CAPACITY: usize = 64;

#[derive(Default)]
pub struct LoopbackChannel {
    events: Option<mpsc::Sender<ChannelEvent>>,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, event: ChannelEvent) {
        let Some(tx) = &self.events else { return };
        if let Err(e) = tx.try_send(event) {
            log::warn!("loopback: event dropped: {e}");
        }
    }

    fn echo(&self, data: &str) -> Result<(), TransportError> {
        let bytes = decode_payload(data).map_err(|e| TransportError::Encode(e.to_string()))?;
        let upstream: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        let downstream = resample_pcm16(&upstream, UPSTREAM_SAMPLE_RATE, DOWNSTREAM_SAMPLE_RATE);
        let pcm: Vec<u8> = downstream.iter().flat_map(|s| s.to_le_bytes()).collect();

        let reply = serde_json::to_string(&ServerMessage::audio(DOWNSTREAM_MIME_TYPE, &pcm))?;
        self.emit(ChannelEvent::Message(reply));
        Ok(())
    }
}

#[async_trait]
impl SpeechChannel for LoopbackChannel {
    async fn connect(&mut self) -> Result<mpsc::Receiver<ChannelEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        self.events = Some(tx);
        self.emit(ChannelEvent::Open);
        Ok(rx)
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.events.is_none() {
            return Err(TransportError::NotOpen);
        }

        match serde_json::from_str::<ClientMessage>(&text)? {
            ClientMessage::Setup(setup) => {
                log::debug!("loopback: setup for {}", setup.model);
                self.emit(ChannelEvent::Message(r#"{"setupComplete":{}}"#.into()));
            }
            ClientMessage::RealtimeInput(input) => {
                for chunk in &input.media_chunks {
                    self.echo(&chunk.data)?;
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.emit(ChannelEvent::Close { reason: None });
        self.events = None;
    }
}

/// Nearest-neighbour rate conversion of PCM16 samples.
fn resample_pcm16(samples: &[i16], from: u32, to: u32) -> Vec<i16> {
    if from == to || from == 0 || to == 0 {
        return samples.to_vec();
    }
    let ratio = f64::from(from) / f64::from(to);
    let len = (samples.len() as f64 / ratio).round() as usize;
    (0..len)
        .map(|i| {
            let index = (i as f64 * ratio).floor() as usize;
            samples.get(index).copied().unwrap_or(0)
        })
        .collect()
}
