//! # Voice Session
//!
//! Everything that happens between "a client connected" and "the client left".
//!
//! ## Key Components:
//! - **Session State Machine** (`machine`): sequences listening, thinking and speaking
//! - **Conversation History** (`history`): the append-only turns sent to the language model
//! - **Interrupt Coordinator** (`interrupt`): barge-in detection and the speaking flag
//! - **Session Settings** (`settings`): the `start` message's overrides merged over defaults
//!
//! A session is owned by exactly one task. Nothing in this module is shared between
//! sessions apart from the provider clients and the relay counters.

pub mod history;      // Turns and their ordering rules
pub mod interrupt;    // Barge-in coordinator
pub mod machine;      // Per-connection state machine
pub mod settings;     // Per-session provider settings

pub use history::{ConversationHistory, Role, Turn};
pub use interrupt::InterruptCoordinator;
pub use machine::{Session, SessionEvent, SessionHandle, SessionState};
pub use settings::SessionSettings;
