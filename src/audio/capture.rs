//! # Audio Capture Encoder
//!
//! Turns a raw microphone stream (32-bit float samples at 16kHz mono) into
//! fixed-size PCM16 frames ready for the Transport Channel.
//!
//! ## Behaviour:
//! - Samples are buffered until a full frame (`CAPTURE_FRAME_SAMPLES`) is available
//! - Each full frame is converted to PCM16 with clamping and handed off immediately
//! - `start` while already capturing is a no-op
//! - `stop` discards any partially filled frame
//!
//! Frame size only trades latency for overhead; the transcriber accepts any size.
//! The device side (opening the microphone) lives in `audio::device` behind the
//! `device` feature.

use bytes::Bytes;
use tracing::debug;

use crate::audio::pcm::{encode_pcm16, CAPTURE_FRAME_SAMPLES};

/// One captured frame: PCM16 little-endian, mono, 16kHz.
///
/// `Bytes` is immutable and cheap to hand over, so ownership moves from the
/// encoder to the transport without copying.
pub type AudioFrame = Bytes;

/// Buffers float samples into fixed-size PCM16 frames.
#[derive(Debug)]
pub struct CaptureEncoder {
    frame_samples: usize,
    pending: Vec<f32>,
    capturing: bool,
}

impl Default for CaptureEncoder {
    fn default() -> Self {
        Self::new(CAPTURE_FRAME_SAMPLES)
    }
}

impl CaptureEncoder {
    /// Create an encoder producing frames of `frame_samples` samples.
    ///
    /// A frame size of 0 is treated as 1.
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
            capturing: false,
        }
    }

    /// Begin accepting samples.
    ///
    /// ## Returns:
    /// - **true**: capture started now
    /// - **false**: capture was already running (nothing changed)
    pub fn start(&mut self) -> bool {
        if self.capturing {
            return false;
        }
        self.pending.clear();
        self.capturing = true;
        debug!(frame_samples = self.frame_samples, "Audio capture started");
        true
    }

    /// Stop accepting samples and drop the partial frame.
    ///
    /// ## Returns:
    /// Number of buffered samples that were discarded.
    pub fn stop(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        if self.capturing {
            debug!(discarded, "Audio capture stopped");
        }
        self.capturing = false;
        discarded
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Feed microphone samples and collect every frame they complete.
    ///
    /// Samples arriving while not capturing are ignored.
    pub fn push_samples(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        if !self.capturing {
            return Vec::new();
        }

        let mut frames = Vec::new();
        let mut remaining = samples;
        while !remaining.is_empty() {
            let room = self.frame_samples - self.pending.len();
            let take = room.min(remaining.len());
            self.pending.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];

            if self.pending.len() == self.frame_samples {
                frames.push(Bytes::from(encode_pcm16(&self.pending)));
                self.pending.clear();
            }
        }
        frames
    }
}
