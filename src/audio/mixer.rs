//! # Playback Timeline
//!
//! A sample-accurate mixer that plays scheduled sources on a device clock.
//! The clock is the number of frames rendered so far, so it only advances when
//! the output device (or a test) pulls audio through `render`.
//!
//! ## Rust Concepts:
//! - **Trait implementation for a wrapper**: `AudioOutput` is implemented both for
//!   `Mixer` (single owner, used in tests and offline rendering) and for
//!   `Arc<Mutex<Mixer>>` (shared between the scheduler and a device callback thread)

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::audio::pcm::{duration_of, frame_at};
use crate::audio::playback::{AudioOutput, SourceId};

#[derive(Debug)]
struct MixerSource {
    id: SourceId,
    samples: Vec<f32>,
    start_frame: u64,
}

impl MixerSource {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mono mixer with a frame-counting clock.
#[derive(Debug)]
pub struct Mixer {
    sample_rate: u32,
    position: u64,
    sources: Vec<MixerSource>,
    finished: Vec<SourceId>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            position: 0,
            sources: Vec::new(),
            finished: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current device time.
    pub fn now(&self) -> Duration {
        duration_of(self.position as usize, self.sample_rate)
    }

    /// Schedule `samples` to begin at `start_at`.
    ///
    /// A start time already in the past begins at the current position, so
    /// late sources are never truncated.
    pub fn add_source(&mut self, id: SourceId, samples: Vec<f32>, start_at: Duration) {
        let start_frame = frame_at(start_at, self.sample_rate).max(self.position);
        self.sources.push(MixerSource {
            id,
            samples,
            start_frame,
        });
    }

    /// Remove a source, whether or not it has started. It is not reported as finished.
    pub fn stop_source(&mut self, id: SourceId) {
        self.sources.retain(|source| source.id != id);
    }

    /// Mix the next `out.len()` frames into `out` and advance the clock.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let begin = self.position;
        let end = begin + out.len() as u64;

        for source in &self.sources {
            let from = source.start_frame.max(begin);
            let to = source.end_frame().min(end);
            for frame in from..to {
                out[(frame - begin) as usize] += source.samples[(frame - source.start_frame) as usize];
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.position = end;
        let finished = &mut self.finished;
        self.sources.retain(|source| {
            let done = source.end_frame() <= end;
            if done {
                finished.push(source.id);
            }
            !done
        });
    }

    /// Sources that played to completion since the last call.
    pub fn take_finished(&mut self) -> Vec<SourceId> {
        std::mem::take(&mut self.finished)
    }

    /// Number of sources that are playing or waiting to play.
    pub fn scheduled_sources(&self) -> usize {
        self.sources.len()
    }
}

impl AudioOutput for Mixer {
    fn current_time(&self) -> Duration {
        self.now()
    }

    fn start_source(&mut self, id: SourceId, samples: Vec<f32>, start_at: Duration) {
        self.add_source(id, samples, start_at);
    }

    fn stop_source(&mut self, id: SourceId) {
        Mixer::stop_source(self, id);
    }

    fn drain_finished(&mut self) -> Vec<SourceId> {
        self.take_finished()
    }
}

/// Mixer shared with a real-time device callback.
pub type SharedMixer = Arc<Mutex<Mixer>>;

impl AudioOutput for SharedMixer {
    fn current_time(&self) -> Duration {
        self.lock().unwrap_or_else(PoisonError::into_inner).now()
    }

    fn start_source(&mut self, id: SourceId, samples: Vec<f32>, start_at: Duration) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_source(id, samples, start_at);
    }

    fn stop_source(&mut self, id: SourceId) {
        self.lock().unwrap_or_else(PoisonError::into_inner).stop_source(id);
    }

    fn drain_finished(&mut self) -> Vec<SourceId> {
        self.lock().unwrap_or_else(PoisonError::into_inner).take_finished()
    }
}
