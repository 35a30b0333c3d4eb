//! # Gapless Audio Scheduler
//!
//! Plays an unbounded sequence of independently arriving PCM chunks back-to-back,
//! with no gap and no overlap, and can hard-stop everything instantly.
//!
//! ## Scheduling law:
//! For each chunk, in arrival order:
//! ```text
//! start          = max(device_now, next_play_time)
//! next_play_time = start + chunk_duration
//! ```
//! The cursor is kept in whole frames and converted to device time only when a source
//! is started, so thousands of tiny chunks never drift into overlap.
//!
//! When the last active source finishes naturally, `next_play_time` snaps back to the
//! *current* device time (not zero), so a chunk arriving after a pause plays right away
//! instead of at a stale point in the future.
//!
//! ## Hard stop:
//! Halts every active source (including ones scheduled in the future), clears the
//! active set and the queue of undecoded chunks, and resets `next_play_time` to now.
//!
//! The device itself is abstracted behind `AudioOutput`; `audio::mixer::Mixer` is the
//! in-process implementation.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use tracing::{debug, warn};

use crate::audio::pcm::{decode_audio_chunk, duration_of, frame_at, OUTPUT_SAMPLE_RATE};

/// Identifier of one scheduled buffer.
pub type SourceId = u64;

/// A playback device with its own monotonic clock.
pub trait AudioOutput {
    /// Current position of the device clock.
    fn current_time(&self) -> Duration;

    /// Schedule `samples` to begin at `start_at` on the device clock.
    fn start_source(&mut self, id: SourceId, samples: Vec<f32>, start_at: Duration);

    /// Halt a source immediately, whether it has started or not.
    fn stop_source(&mut self, id: SourceId);

    /// Sources that played to completion since the previous call.
    fn drain_finished(&mut self) -> Vec<SourceId>;
}

/// Where one chunk landed on the device timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub id: SourceId,
    pub start: Duration,
    pub duration: Duration,
}

impl ScheduledChunk {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

pub struct GaplessScheduler<O: AudioOutput> {
    output: O,
    sample_rate: u32,
    /// Cursor in whole frames, so consecutive chunks tile the timeline exactly
    next_play_frame: u64,
    active_sources: BTreeSet<SourceId>,
    pending: VecDeque<String>,
    next_id: SourceId,
}

impl<O: AudioOutput> GaplessScheduler<O> {
    /// Scheduler for 24kHz synthesized audio.
    pub fn new(output: O) -> Self {
        Self::with_sample_rate(output, OUTPUT_SAMPLE_RATE)
    }

    pub fn with_sample_rate(output: O, sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        let next_play_frame = frame_at(output.current_time(), sample_rate);
        Self {
            output,
            sample_rate,
            next_play_frame,
            active_sources: BTreeSet::new(),
            pending: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Queue one base64 chunk exactly as received in an `audio` message.
    pub fn enqueue(&mut self, base64_chunk: impl Into<String>) {
        self.pending.push_back(base64_chunk.into());
    }

    /// Decode and schedule every queued chunk, in arrival order.
    ///
    /// Chunks that fail to decode are logged and skipped; they do not move the cursor.
    pub fn process_pending(&mut self) -> Vec<ScheduledChunk> {
        let mut scheduled = Vec::new();
        while let Some(chunk) = self.pending.pop_front() {
            match decode_audio_chunk(&chunk) {
                Ok(samples) => scheduled.extend(self.schedule_samples(samples)),
                Err(e) => warn!("Dropping undecodable audio chunk: {}", e),
            }
        }
        scheduled
    }

    /// Queue a chunk and schedule it immediately.
    pub fn push(&mut self, base64_chunk: impl Into<String>) -> Vec<ScheduledChunk> {
        self.enqueue(base64_chunk);
        self.process_pending()
    }

    /// Schedule already-decoded samples right after everything scheduled so far.
    ///
    /// ## Returns:
    /// - **None** for an empty buffer (nothing to play, cursor unchanged)
    pub fn schedule_samples(&mut self, samples: Vec<f32>) -> Option<ScheduledChunk> {
        if samples.is_empty() {
            return None;
        }

        self.reap_finished();

        let start_frame = self.now_frame().max(self.next_play_frame);
        let end_frame = start_frame + samples.len() as u64;
        let start = self.time_of(start_frame);
        let duration = self.time_of(end_frame) - start;

        let id = self.next_id;
        self.next_id += 1;

        self.output.start_source(id, samples, start);
        self.next_play_frame = end_frame;
        self.active_sources.insert(id);

        Some(ScheduledChunk { id, start, duration })
    }

    /// Collect natural completions from the device.
    pub fn reap_finished(&mut self) {
        for id in self.output.drain_finished() {
            self.source_ended(id);
        }
    }

    fn source_ended(&mut self, id: SourceId) {
        if self.active_sources.remove(&id) && self.active_sources.is_empty() {
            self.next_play_frame = self.now_frame();
        }
    }

    /// Stop all pending and playing audio now.
    pub fn hard_stop(&mut self) {
        let halted = self.active_sources.len();
        let discarded = self.pending.len();

        for id in std::mem::take(&mut self.active_sources) {
            self.output.stop_source(id);
        }
        self.pending.clear();
        // Completions reported before the stop are stale now
        self.output.drain_finished();
        self.next_play_frame = self.now_frame();

        debug!(halted, discarded, "Playback hard-stopped");
    }

    pub fn next_play_time(&self) -> Duration {
        self.time_of(self.next_play_frame)
    }

    fn now_frame(&self) -> u64 {
        frame_at(self.output.current_time(), self.sample_rate)
    }

    fn time_of(&self, frame: u64) -> Duration {
        duration_of(frame as usize, self.sample_rate)
    }

    pub fn active_sources(&self) -> usize {
        self.active_sources.len()
    }

    pub fn pending_chunks(&self) -> usize {
        self.pending.len()
    }

    /// True while anything is scheduled or playing.
    pub fn is_playing(&mut self) -> bool {
        self.reap_finished();
        !self.active_sources.is_empty()
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }
}
