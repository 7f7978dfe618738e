//! Downstream audio decoding: PCM16 little-endian bytes → normalised `f32`.
//!
//! The remote side streams synthesized speech as raw PCM16 at **24 kHz
//! mono**.  [`decode_pcm16`] turns one payload into a [`DecodedBuffer`].
//!
//! Note the scale factor: decoding divides by 32768 while encoding multiplies
//! by 32767.  The asymmetry is part of the remote format contract.

use thiserror::Error;

/// Fixed downstream sample rate in Hz.
pub const DOWNSTREAM_SAMPLE_RATE: u32 = 24_000;

/// Fixed downstream channel count.
pub const DOWNSTREAM_CHANNELS: u16 = 1;

const DECODE_SCALE: f32 = 32_768.0;

// ---------------------------------------------------------------------------
// DecodeError
// ---------------------------------------------------------------------------

/// Reasons an inbound payload could not be decoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Byte length is not a whole number of frames.
    #[error("malformed payload: {len} bytes is not a multiple of {frame_bytes} ({channels} channel(s) × 2)")]
    MalformedPayload {
        len: usize,
        channels: u16,
        frame_bytes: usize,
    },

    /// Zero channels or a zero sample rate was requested.
    #[error("invalid stream layout: {channels} channel(s) at {sample_rate} Hz")]
    InvalidLayout { channels: u16, sample_rate: u32 },
}

// ---------------------------------------------------------------------------
// DecodedBuffer
// ---------------------------------------------------------------------------

/// Planar `f32` audio ready for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    /// One `Vec` per channel, all of equal length.
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl DecodedBuffer {
    /// Build a single-channel buffer.
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            channels: vec![samples],
            sample_rate,
        }
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Samples for channel `index`, if it exists.
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Frames per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Returns `true` when the buffer holds no frames.
    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Consume the buffer into a mono mix (averaging channels).
    pub fn into_mono(mut self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels.swap_remove(0),
            n => {
                let frames = self.frames();
                (0..frames)
                    .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / n as f32)
                    .collect()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// decode_pcm16
// ---------------------------------------------------------------------------

/// Decode interleaved little-endian PCM16 bytes into a [`DecodedBuffer`].
///
/// `frames = bytes.len() / 2 / channels`; each sample is divided by 32768.
///
/// # Errors
///
/// [`DecodeError::MalformedPayload`] when `bytes.len()` is not a multiple of
/// `2 * channels`; [`DecodeError::InvalidLayout`] for zero channels or rate.
///
/// # Example
///
/// ```rust
/// use voice_live::audio::decode_pcm16;
///
/// let buf = decode_pcm16(&[0x00, 0x40, 0x00, 0xC0], 24_000, 1).unwrap();
/// assert_eq!(buf.frames(), 2);
/// assert_eq!(buf.channel(0).unwrap(), &[0.5, -0.5]);
/// ```
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<DecodedBuffer, DecodeError> {
    if channels == 0 || sample_rate == 0 {
        return Err(DecodeError::InvalidLayout {
            channels,
            sample_rate,
        });
    }

    let frame_bytes = 2 * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(DecodeError::MalformedPayload {
            len: bytes.len(),
            channels,
            frame_bytes,
        });
    }

    let frames = bytes.len() / frame_bytes;
    let mut planes = vec![Vec::with_capacity(frames); channels as usize];

    for frame in bytes.chunks_exact(frame_bytes) {
        for (plane, sample) in planes.iter_mut().zip(frame.chunks_exact(2)) {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            plane.push(f32::from(value) / DECODE_SCALE);
        }
    }

    Ok(DecodedBuffer {
        channels: planes,
        sample_rate,
    })
}

/// Decode a downstream payload at the fixed 24 kHz mono layout.
pub fn decode_downstream(bytes: &[u8]) -> Result<DecodedBuffer, DecodeError> {
    decode_pcm16(bytes, DOWNSTREAM_SAMPLE_RATE, DOWNSTREAM_CHANNELS)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn le_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn decodes_full_scale_with_32768_divisor() {
        let buf = decode_downstream(&le_bytes(&[i16::MIN, i16::MAX, 0])).unwrap();
        let ch = buf.channel(0).unwrap();
        assert_eq!(ch[0], -1.0);
        assert_eq!(ch[1], 32_767.0 / 32_768.0);
        assert_eq!(ch[2], 0.0);
    }

    #[test]
    fn odd_length_is_malformed() {
        for len in [1_usize, 3, 2_401] {
            let err = decode_downstream(&vec![0_u8; len]).unwrap_err();
            assert!(matches!(err, DecodeError::MalformedPayload { .. }), "len {len}");
        }
    }

    #[test]
    fn stereo_requires_multiple_of_four() {
        let err = decode_pcm16(&[0; 6], 24_000, 2).unwrap_err();
        assert_eq!(
            err,
            DecodeError::MalformedPayload {
                len: 6,
                channels: 2,
                frame_bytes: 4
            }
        );
    }

    #[test]
    fn stereo_is_deinterleaved() {
        let buf = decode_pcm16(&le_bytes(&[16_384, -16_384, 8_192, -8_192]), 24_000, 2).unwrap();
        assert_eq!(buf.frames(), 2);
        assert_eq!(buf.channel(0).unwrap(), &[0.5, 0.25]);
        assert_eq!(buf.channel(1).unwrap(), &[-0.5, -0.25]);
        assert_eq!(buf.into_mono(), vec![0.0, 0.0]);
    }

    #[test]
    fn zero_channels_is_rejected() {
        assert!(matches!(
            decode_pcm16(&[0; 4], 24_000, 0),
            Err(DecodeError::InvalidLayout { .. })
        ));
    }

    #[test]
    fn duration_of_600_samples_is_25ms() {
        let buf = decode_downstream(&vec![0_u8; 1_200]).unwrap();
        assert_eq!(buf.frames(), 600);
        assert_eq!(buf.duration(), 0.025);
    }

    #[test]
    fn empty_payload_is_an_empty_buffer() {
        let buf = decode_downstream(&[]).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.duration(), 0.0);
    }
}
