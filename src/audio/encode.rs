//! Upstream audio encoding: channel mixing, resampling and PCM16 conversion.
//!
//! The speech service expects **16 kHz mono PCM16**.  This module provides
//! the conversion steps applied to every captured block:
//!
//! 1. [`stereo_to_mono`]: downmix any number of interleaved channels to mono.
//! 2. [`encode_pcm16`]: resample to 16 000 Hz and scale to `i16`.
//!
//! ## Resampling quality
//!
//! The resampler is nearest-neighbour (sample at `floor(i * ratio)`), not
//! bandlimited.  The remote side was tuned against exactly this output, so
//! the algorithm stays as-is for wire compatibility.

/// Fixed upstream sample rate in Hz.
pub const UPSTREAM_SAMPLE_RATE: u32 = 16_000;

/// Mime tag attached to every upstream frame.
pub const UPSTREAM_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Scale factor from normalised `f32` to `i16` on the encode path.
const ENCODE_SCALE: f32 = 32_767.0;

// ---------------------------------------------------------------------------
// EncodedFrame
// ---------------------------------------------------------------------------

/// One block of upstream audio: 16 kHz mono PCM16 plus its mime tag.
///
/// Produced by the capture pipeline and moved by value into the transport
/// session; nothing else holds a reference to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Signed 16-bit samples at [`UPSTREAM_SAMPLE_RATE`].
    pub samples: Vec<i16>,
    /// Always [`UPSTREAM_MIME_TYPE`].
    pub mime_type: &'static str,
}

impl EncodedFrame {
    /// Wrap already-encoded samples.
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples,
            mime_type: UPSTREAM_MIME_TYPE,
        }
    }

    /// Raw little-endian byte buffer, as carried (base64'd) on the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Number of samples in the frame.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when the frame holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of the frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / f64::from(UPSTREAM_SAMPLE_RATE)
    }
}

// ---------------------------------------------------------------------------
// stereo_to_mono
// ---------------------------------------------------------------------------

/// Mix interleaved multi-channel audio down to mono by averaging all channels.
///
/// The output length is `samples.len() / channels`; a trailing partial frame
/// is discarded.
///
/// * If `channels == 1` the input slice is copied with no averaging.
/// * If `channels == 0` an empty vector is returned.
///
/// # Example
///
/// ```rust
/// use voice_live::audio::stereo_to_mono;
///
/// let stereo = vec![0.5_f32, -0.5, 0.2, 0.4]; // L R L R
/// let mono = stereo_to_mono(&stereo, 2);
/// assert_eq!(mono.len(), 2);
/// assert!((mono[1] - 0.3).abs() < 1e-6);
/// ```
pub fn stereo_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// encode_pcm16
// ---------------------------------------------------------------------------

/// Convert a block of normalised `f32` samples at `source_rate` Hz into
/// 16 kHz PCM16.
///
/// * `source_rate == 16_000`: every sample is clamped to `[-1, 1]` and scaled
///   by 32767; output length equals input length.
/// * otherwise: `ratio = source_rate / 16_000`, output length is
///   `round(len / ratio)` and output sample `i` is input sample
///   `floor(i * ratio)`, clamped and scaled the same way.
///
/// Scaling truncates toward zero.  `NaN` input encodes as silence.  A
/// `source_rate` of zero yields an empty frame.
///
/// # Example
///
/// ```rust
/// use voice_live::audio::encode_pcm16;
///
/// // 300 samples @ 48 kHz → 100 samples @ 16 kHz
/// let out = encode_pcm16(&vec![0.5_f32; 300], 48_000);
/// assert_eq!(out.len(), 100);
/// assert_eq!(out[0], 16_383);
/// ```
pub fn encode_pcm16(frame: &[f32], source_rate: u32) -> Vec<i16> {
    if source_rate == UPSTREAM_SAMPLE_RATE {
        return frame.iter().map(|&s| scale_to_i16(s)).collect();
    }

    if source_rate == 0 || frame.is_empty() {
        return Vec::new();
    }

    let ratio = f64::from(source_rate) / f64::from(UPSTREAM_SAMPLE_RATE);
    let output_len = (frame.len() as f64 / ratio).round() as usize;

    (0..output_len)
        .map(|i| {
            let index = (i as f64 * ratio).floor() as usize;
            // Out-of-range reads encode as silence.
            scale_to_i16(frame.get(index).copied().unwrap_or(0.0))
        })
        .collect()
}

/// Encode a block into an [`EncodedFrame`] ready for the transport.
pub fn encode_frame(frame: &[f32], source_rate: u32) -> EncodedFrame {
    EncodedFrame::new(encode_pcm16(frame, source_rate))
}

fn scale_to_i16(sample: f32) -> i16 {
    // `as` saturates and maps NaN to 0.
    (sample.clamp(-1.0, 1.0) * ENCODE_SCALE) as i16
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
