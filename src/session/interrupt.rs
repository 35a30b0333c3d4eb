//! Barge-in detection.
//!
//! The coordinator owns the session's "AI is speaking" flag. The session task sets it
//! when synthesis starts; the speech loop reads it before forwarding every chunk; and
//! a trigger clears it, which is the cooperative half of cancelling the reply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::providers::{TranscriptEvent, TranscriptKind};

#[derive(Debug, Clone)]
pub struct InterruptCoordinator {
    ai_speaking: Arc<AtomicBool>,
    partial_fallback: bool,
}

impl InterruptCoordinator {
    /// ## Parameters:
    /// - `partial_fallback`: also treat a non-empty partial transcript as user speech
    pub fn new(partial_fallback: bool) -> Self {
        Self {
            ai_speaking: Arc::new(AtomicBool::new(false)),
            partial_fallback,
        }
    }

    pub fn is_ai_speaking(&self) -> bool {
        self.ai_speaking.load(Ordering::SeqCst)
    }

    pub fn begin_speaking(&self) {
        self.ai_speaking.store(true, Ordering::SeqCst);
    }

    /// Clear the flag after synthesis ended on its own.
    pub fn finish_speaking(&self) {
        self.ai_speaking.store(false, Ordering::SeqCst);
    }

    /// Whether `event` means the user is talking over the assistant.
    ///
    /// A non-empty final transcript counts as well, so an utterance the transcriber
    /// never flagged as voice activity still stops the reply.
    pub fn should_interrupt(&self, event: &TranscriptEvent) -> bool {
        if !self.is_ai_speaking() {
            return false;
        }
        match event.kind {
            TranscriptKind::SpeechStart => true,
            TranscriptKind::Partial => self.partial_fallback && !event.text().is_empty(),
            TranscriptKind::Final => !event.text().is_empty(),
        }
    }

    /// Stop the assistant.
    ///
    /// ## Returns:
    /// - **true**: the assistant was speaking and is now stopped
    /// - **false**: nothing was speaking; the call had no effect
    pub fn trigger(&self) -> bool {
        self.ai_speaking.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speech_start_interrupts_only_while_speaking() {
        let coordinator = InterruptCoordinator::new(true);
        assert!(!coordinator.should_interrupt(&TranscriptEvent::speech_start()));

        coordinator.begin_speaking();
        assert!(coordinator.should_interrupt(&TranscriptEvent::speech_start()));
    }

    #[test]
    fn test_partial_fallback_can_be_disabled() {
        let with_fallback = InterruptCoordinator::new(true);
        let without = InterruptCoordinator::new(false);
        with_fallback.begin_speaking();
        without.begin_speaking();

        let partial = TranscriptEvent::partial("wait");
        assert!(with_fallback.should_interrupt(&partial));
        assert!(!without.should_interrupt(&partial));
        assert!(!with_fallback.should_interrupt(&TranscriptEvent::partial("  ")));
    }

    #[test]
    fn test_trigger_is_idempotent() {
        let coordinator = InterruptCoordinator::new(true);
        let reader = coordinator.clone();
        coordinator.begin_speaking();

        assert!(coordinator.trigger());
        assert!(!coordinator.trigger());
        assert!(!reader.is_ai_speaking());
    }
}
