//! # PCM Formats and Validation
//!
//! Two PCM formats cross the relay:
//! - **Inbound** (microphone → transcriber): signed 16-bit little-endian, mono, 16kHz
//! - **Outbound** (synthesizer → speakers): 32-bit float little-endian, mono, 24kHz,
//!   carried base64-encoded inside `audio` control messages
//!
//! ## Key Functions:
//! - **Frame validation**: reject binary frames that cannot be PCM16
//! - **Format conversion**: f32 ↔ i16 with clamping, f32le bytes ↔ samples
//! - **Chunk decoding**: base64 `audio` payloads into playable samples

use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::time::Duration;

use crate::error::{RelayError, RelayResult};

/// Sample rate of microphone frames sent to the transcriber.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of synthesized chunks sent to the client.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Samples per captured frame (4096 samples ≈ 256ms at 16kHz).
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

/// Check that a binary frame can be 16-bit PCM.
///
/// ## Validation Checks:
/// 1. **Non-empty**: empty frames carry nothing for the transcriber
/// 2. **Even length**: every sample is two bytes
///
/// Sample content is not inspected: silence is valid audio and the transcriber
/// needs it to detect endpoints.
pub fn validate_pcm16_frame(data: &[u8]) -> RelayResult<()> {
    if data.is_empty() {
        return Err(RelayError::InvalidAudio("audio frame is empty".to_string()));
    }

    if data.len() % 2 != 0 {
        return Err(RelayError::InvalidAudio(format!(
            "frame length {} is not a whole number of 16-bit samples",
            data.len()
        )));
    }

    Ok(())
}

/// Convert one float sample in [-1, 1] to PCM16.
///
/// Out-of-range input is clamped first. Negative values scale by 0x8000 and
/// positive ones by 0x7FFF so that both -1.0 and 1.0 map to the extremes of i16.
pub fn f32_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Encode float samples as a PCM16 little-endian byte frame.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(f32_to_i16(sample));
    }
    bytes
}

/// Read PCM16 little-endian bytes back into integer samples. A trailing odd byte is ignored.
pub fn decode_pcm16(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

/// Read 32-bit float little-endian bytes into samples.
///
/// ## Returns:
/// - **Err**: the byte count is not a multiple of four (a truncated chunk)
pub fn decode_f32le(data: &[u8]) -> RelayResult<Vec<f32>> {
    if data.len() % 4 != 0 {
        return Err(RelayError::InvalidAudio(format!(
            "chunk length {} is not a whole number of 32-bit samples",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 4);
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

pub fn encode_f32le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for &sample in samples {
        let _ = bytes.write_f32::<LittleEndian>(sample);
    }
    bytes
}

/// Decode the `data` field of an `audio` control message.
pub fn decode_audio_chunk(base64_data: &str) -> RelayResult<Vec<f32>> {
    let bytes = STANDARD
        .decode(base64_data.trim())
        .map_err(|e| RelayError::InvalidAudio(format!("audio chunk is not base64: {}", e)))?;
    decode_f32le(&bytes)
}

/// Encode float samples the way synthesized chunks travel to the client.
pub fn encode_audio_chunk(samples: &[f32]) -> String {
    STANDARD.encode(encode_f32le(samples))
}

/// Playback duration of `samples` at `sample_rate`, truncated to whole nanoseconds.
pub fn duration_of(samples: usize, sample_rate: u32) -> Duration {
    let nanos = samples as u128 * 1_000_000_000 / sample_rate.max(1) as u128;
    Duration::from_nanos(nanos as u64)
}

/// Frame nearest to `time` at `sample_rate`.
///
/// Inverse of `duration_of`: `frame_at(duration_of(n, rate), rate) == n` for every `n`,
/// since truncation loses less than a nanosecond.
pub fn frame_at(time: Duration, sample_rate: u32) -> u64 {
    let scaled = time.as_nanos() * sample_rate.max(1) as u128 + 500_000_000;
    (scaled / 1_000_000_000) as u64
}
