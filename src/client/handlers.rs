//! # Client Event Handlers
//!
//! The client connection lives as long as the program; the code reacting to its events
//! does not. Each event kind therefore has a `HandlerSlot`: a shared, replaceable
//! reference to the current handler, read at dispatch time. Swapping a handler never
//! touches the connection.
//!
//! ## Key Rust Concepts:
//! - **`Arc<dyn Fn(T) + Send + Sync>`**: a handler callable from the reader task
//! - **RwLock<Option<...>>**: the slot itself; dispatch clones the `Arc` and releases
//!   the lock before calling, so a handler may replace itself
//!
//! ## Status mapping:
//! | event | status text |
//! |---|---|
//! | socket opened | `Connected` |
//! | socket closed | `Disconnected` |
//! | `status` message | its `message`, verbatim |
//! | `partial_transcript` | `Listening: "<text>"` |
//! | `error` message | `Error: <message>` |

use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::protocol::ServerMessage;
use crate::session::{Role, Turn};

pub const STATUS_CONNECTED: &str = "Connected";
pub const STATUS_DISCONNECTED: &str = "Disconnected";
pub const STATUS_SOCKET_ERROR: &str = "WebSocket error";

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Replaceable handler for one event kind.
pub struct HandlerSlot<T> {
    current: Arc<RwLock<Option<Handler<T>>>>,
}

impl<T> HandlerSlot<T> {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
        }
    }

    /// Install `handler`, replacing the previous one.
    pub fn set(&self, handler: impl Fn(T) + Send + Sync + 'static) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn clear(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_set(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Call the handler installed right now.
    ///
    /// ## Returns:
    /// - **true**: a handler ran
    /// - **false**: the slot was empty and `value` was dropped
    pub fn call(&self, value: T) -> bool {
        let handler = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => {
                handler(value);
                true
            }
            None => false,
        }
    }
}

impl<T> Default for HandlerSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Clones share the slot, so a handler set through any clone is seen by all of them
impl<T> Clone for HandlerSlot<T> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
        }
    }
}

impl<T> std::fmt::Debug for HandlerSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSlot").field("set", &self.is_set()).finish()
    }
}

/// Every event a voice client reacts to.
#[derive(Debug, Clone, Default)]
pub struct ClientHandlers {
    /// Human-readable connection and session status
    pub status: HandlerSlot<String>,
    /// Finalized user and assistant utterances
    pub transcript: HandlerSlot<Turn>,
    /// Base64 audio chunks, in arrival order
    pub audio: HandlerSlot<String>,
    /// Barge-in: playback must stop now
    pub interrupt: HandlerSlot<()>,
}

impl ClientHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one server message to the matching slot.
    pub fn dispatch(&self, message: ServerMessage) {
        match message {
            ServerMessage::Status { message } => {
                self.status.call(message);
            }
            ServerMessage::PartialTranscript { text } => {
                self.status.call(format!("Listening: \"{}\"", text));
            }
            ServerMessage::UserTranscript { text } => {
                self.transcript.call(Turn::new(Role::User, text));
            }
            ServerMessage::AiTranscript { text } => {
                self.transcript.call(Turn::new(Role::Assistant, text));
            }
            ServerMessage::Audio { data } => {
                if !self.audio.call(data) {
                    debug!("Audio chunk arrived with no audio handler installed");
                }
            }
            ServerMessage::Interrupt { .. } => {
                self.interrupt.call(());
            }
            ServerMessage::Error { message } => {
                self.status.call(format!("Error: {}", message));
            }
        }
    }
}
