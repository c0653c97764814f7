//! Stateless audio transcoding between the three representations in play:
//! telephony narrowband (8 kHz G.711 mu-law), wideband PCM (24 kHz signed
//! 16-bit little-endian), and the wire transport encoding (base64 text).
//!
//! Every function is pure and safe to call concurrently from any number of
//! sessions. Failures are per-frame `MalformedAudio` errors: the caller drops
//! the frame, bumps an error counter, and keeps streaming.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

use crate::errors::{VoiceError, VoiceResult};

/// Narrowband (telephony) sample rate in Hz.
pub const NARROWBAND_RATE: u32 = 8_000;
/// Wideband (upstream PCM) sample rate in Hz.
pub const WIDEBAND_RATE: u32 = 24_000;
/// Resampling factor between the two rates.
const RATE_FACTOR: usize = (WIDEBAND_RATE / NARROWBAND_RATE) as usize;

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32_635;

/// Decode one G.711 mu-law byte to a linear PCM16 sample.
fn mulaw_decode_sample(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode one linear PCM16 sample as a G.711 mu-law byte.
fn mulaw_encode_sample(sample: i16) -> u8 {
    let mut value = sample as i32;
    let sign: u8 = if value < 0 {
        value = -value;
        0x80
    } else {
        0
    };
    if value > MULAW_CLIP {
        value = MULAW_CLIP;
    }
    value += MULAW_BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (value & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((value >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Convert a telephony mu-law frame (8 kHz) into wideband PCM16 (24 kHz).
///
/// Upsamples by linear interpolation. The output holds exactly three samples
/// per input byte.
pub fn telephony_to_wideband(payload: &[u8]) -> VoiceResult<Vec<i16>> {
    if payload.is_empty() {
        return Err(VoiceError::MalformedAudio(
            "empty telephony frame".to_string(),
        ));
    }

    let narrow: Vec<i16> = payload.iter().map(|&b| mulaw_decode_sample(b)).collect();

    let mut wide = Vec::with_capacity(narrow.len() * RATE_FACTOR);
    for (i, &current) in narrow.iter().enumerate() {
        let next = narrow.get(i + 1).copied().unwrap_or(current);
        let step = (next as i32 - current as i32) / RATE_FACTOR as i32;
        for k in 0..RATE_FACTOR {
            wide.push((current as i32 + step * k as i32) as i16);
        }
    }
    Ok(wide)
}

/// Convert wideband PCM16 (24 kHz) into a telephony mu-law frame (8 kHz).
///
/// Downsamples by averaging each group of three samples; a trailing partial
/// group is averaged over its actual length.
pub fn wideband_to_telephony(pcm: &[i16]) -> VoiceResult<Vec<u8>> {
    if pcm.is_empty() {
        return Err(VoiceError::MalformedAudio("empty PCM frame".to_string()));
    }

    let mut narrow = Vec::with_capacity(pcm.len().div_ceil(RATE_FACTOR));
    for group in pcm.chunks(RATE_FACTOR) {
        let sum: i32 = group.iter().map(|&s| s as i32).sum();
        let mean = (sum / group.len() as i32) as i16;
        narrow.push(mulaw_encode_sample(mean));
    }
    Ok(narrow)
}

/// Encode PCM16 samples as the base64 wire format (little-endian byte order).
pub fn pcm16_to_wire(pcm: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(pcm.len() * 2);
    for sample in pcm {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    B64.encode(bytes)
}

/// Decode the base64 wire format back into PCM16 samples.
///
/// Rejects invalid base64 characters and odd byte counts.
pub fn wire_to_pcm16(text: &str) -> VoiceResult<Vec<i16>> {
    let bytes = B64
        .decode(text)
        .map_err(|e| VoiceError::MalformedAudio(format!("invalid base64 audio: {e}")))?;
    pcm16_from_le_bytes(&bytes)
}

/// Reinterpret little-endian bytes as PCM16 samples, rejecting odd lengths.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> VoiceResult<Vec<i16>> {
    if bytes.is_empty() {
        return Err(VoiceError::MalformedAudio("empty PCM payload".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::MalformedAudio(format!(
            "odd byte length {} for 16-bit samples",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Serialize PCM16 samples to little-endian bytes.
pub fn pcm16_to_le_bytes(pcm: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(pcm.len() * 2);
    for sample in pcm {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}
