//! # Voice Relay Backend
//!
//! Real-time voice conversation relay: a client streams microphone audio over one
//! WebSocket, the relay pipes it through streaming speech-to-text, a streaming chat
//! model and streaming text-to-speech, and sends the synthesized audio back on the
//! same socket. The user can interrupt the assistant mid-sentence.
//!
//! ## Module Map:
//! - **protocol**: JSON control messages shared by server and client
//! - **websocket**: the `/ws` endpoint, one actor per connection
//! - **session**: per-connection state machine, history and barge-in
//! - **providers**: STT / LLM / TTS adapter traits and their HTTP clients
//! - **audio**: PCM codecs, capture encoder, gapless playback scheduler
//! - **client**: the client end of `/ws`
//! - **config**, **error**, **state**, **health**, **handlers**: the service around it

pub mod audio;      // Sample formats, capture and playback (audio/ directory)
pub mod client;     // WebSocket client (client/ directory)
pub mod config;     // Configuration management (config.rs)
pub mod error;      // Error handling types (error.rs)
pub mod handlers;   // REST handlers (handlers/ directory)
pub mod health;     // Health check endpoints (health.rs)
pub mod protocol;   // Wire format (protocol.rs)
pub mod providers;  // Provider adapters (providers/ directory)
pub mod session;    // Voice sessions (session/ directory)
pub mod state;      // Application state management (state.rs)
pub mod websocket;  // WebSocket endpoint (websocket.rs)
