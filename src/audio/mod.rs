//! # Audio Module
//!
//! Everything that touches raw samples, on both ends of the Transport Channel.
//!
//! ## Key Components:
//! - **PCM**: format constants, frame validation, f32/i16 conversion, base64 chunk codec
//! - **Capture Encoder**: microphone samples → fixed-size PCM16 frames (client side)
//! - **Gapless Scheduler**: incoming chunks → back-to-back playback with hard stop (client side)
//! - **Mixer**: the sample-accurate playback timeline the scheduler drives
//! - **Device**: cpal microphone/speaker glue (`device` feature)
//!
//! ## Audio Format Requirements:
//! - **Upstream**: 16kHz, 16-bit signed PCM, mono, little-endian
//! - **Downstream**: 24kHz, 32-bit float PCM, mono, little-endian, base64 in JSON

pub mod capture;      // Microphone frame encoder
pub mod device;       // cpal input/output streams
pub mod mixer;        // Playback timeline
pub mod pcm;          // Formats and conversions
pub mod playback;     // Gapless scheduler

pub use capture::{AudioFrame, CaptureEncoder};
pub use mixer::{Mixer, SharedMixer};
pub use playback::{AudioOutput, GaplessScheduler, ScheduledChunk, SourceId};
