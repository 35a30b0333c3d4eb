//! # Voice Client
//!
//! The other end of `/ws`: what a browser page does, as a library.
//!
//! - **socket**: `VoiceClient`, the tokio-tungstenite connection
//! - **outbound**: bounded buffer for messages sent before the socket opens
//! - **handlers**: swappable event handlers and the status text mapping

pub mod handlers;
pub mod outbound;
pub mod socket;

pub use handlers::{ClientHandlers, HandlerSlot};
pub use outbound::OutboundBuffer;
pub use socket::VoiceClient;
