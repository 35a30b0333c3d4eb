//! # Application State Management
//!
//! This module manages state shared by every HTTP handler and every WebSocket session:
//! the live configuration, the relay-wide counters, and the provider clients.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows many sessions to share ownership of the same data
//! - **Why needed**: Each WebSocket connection runs its own session task, and all of them
//!   report into the same counters
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time
//! - **Why needed**: `/api/v1/config` can replace the config while sessions read it
//!
//! ### What is *not* shared:
//! A session's conversation history and its "AI is speaking" flag live inside the
//! session task (see `session::machine`) and never appear here. Sessions only ever
//! *increment* counters in this module, so there is no cross-session coupling.

use crate::config::AppConfig;
use crate::providers::Providers;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The state shared across all HTTP request handlers and WebSocket sessions.
///
/// ## Thread Safety Pattern:
/// `AppState` is cheap to clone: every field is either an `Arc` or `Copy`.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Relay configuration (session defaults can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by sessions and read by `/health` and `/api/v1/metrics`
    pub metrics: RelayMetrics,

    /// Provider clients, built once from the startup configuration
    pub providers: Providers,

    /// When the server started
    pub start_time: Instant,
}

/// Relay-wide counters.
///
/// ## Why these metrics matter:
/// - **active_sessions / total_sessions / rejected_sessions**: capacity planning
/// - **completed_turns**: assistant replies that were fully spoken
/// - **interrupts**: barge-ins (high values mean replies are too long)
/// - **provider_errors**: STT/LLM/TTS failures surfaced to users
/// - **dropped_audio_frames / malformed_messages**: client bugs or early audio
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub active_sessions: u32,
    pub total_sessions: u64,
    pub rejected_sessions: u64,
    pub completed_turns: u64,
    pub interrupts: u64,
    pub provider_errors: u64,
    pub dropped_audio_frames: u64,
    pub malformed_messages: u64,
}

/// Events a session reports while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCounter {
    CompletedTurn,
    Interrupt,
    ProviderError,
    DroppedAudioFrame,
    MalformedMessage,
}

/// Shared handle to the relay counters.
///
/// Sessions hold a clone of this handle instead of the whole `AppState`, which keeps
/// the session state machine testable without a server around it.
#[derive(Debug, Clone, Default)]
pub struct RelayMetrics {
    inner: Arc<RwLock<AppMetrics>>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment one counter.
    pub fn record(&self, counter: RelayCounter) {
        let mut metrics = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match counter {
            RelayCounter::CompletedTurn => metrics.completed_turns += 1,
            RelayCounter::Interrupt => metrics.interrupts += 1,
            RelayCounter::ProviderError => metrics.provider_errors += 1,
            RelayCounter::DroppedAudioFrame => metrics.dropped_audio_frames += 1,
            RelayCounter::MalformedMessage => metrics.malformed_messages += 1,
        }
    }

    /// Reserve a session slot if the relay is below `limit`.
    ///
    /// ## Returns:
    /// - **true**: the slot is taken; the caller must call `close_session` later
    /// - **false**: the limit is reached and the rejection has been counted
    ///
    /// Check and increment happen under one write lock so that two simultaneous
    /// upgrades cannot both take the last slot.
    pub fn try_open_session(&self, limit: usize) -> bool {
        let mut metrics = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if metrics.active_sessions as usize >= limit {
            metrics.rejected_sessions += 1;
            return false;
        }
        metrics.active_sessions += 1;
        metrics.total_sessions += 1;
        true
    }

    /// Release a slot taken by `try_open_session`.
    pub fn close_session(&self) {
        let mut metrics = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        // Underflow guard
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Consistent copy of all counters, taken under one read lock.
    pub fn snapshot(&self) -> AppMetrics {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl AppState {
    pub fn new(config: AppConfig, providers: Providers) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: RelayMetrics::new(),
            providers,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately; sessions keep their copy for their whole life.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.snapshot()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
