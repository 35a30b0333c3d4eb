//! # WebSocket Voice Handler
//!
//! Server side of the Transport Channel. Clients connect to `/ws`; each connection
//! becomes one `VoiceSocket` actor paired with one `Session` task.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Client connects (refused with 503 at the session limit)
//! 2. **Start**: Client sends `{"type":"start", ...}`; server answers `Ready to listen`
//! 3. **Audio Streaming**: Binary messages carry PCM16 mono 16kHz audio
//! 4. **Replies**: Server sends transcripts, `audio` chunks, `interrupt` and `error` messages
//! 5. **Disconnect**: Closing the socket destroys the session and everything it holds
//!
//! ## Actor / task split:
//! The actor only translates frames. Parsing happens here so malformed input never
//! reaches the session; everything else is forwarded to the session's inbox, and the
//! session's outbound messages come back as a stream attached to the actor.

use crate::config::AppConfig;
use crate::error::AppError;
use crate::protocol::{parse_client_message, ServerMessage};
use crate::providers::Providers;
use crate::session::{Session, SessionEvent, SessionHandle};
use crate::state::{AppState, RelayCounter, RelayMetrics};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// WebSocket actor for one voice connection.
///
/// ## Actor Model:
/// Each connection is an independent actor. The session it feeds runs as a separate
/// tokio task, so a slow provider never stalls frame handling.
pub struct VoiceSocket {
    /// Inbox of the session this connection drives
    session: SessionHandle,

    /// Session waiting to be spawned once the actor starts
    pending_session: Option<Session>,

    /// Session output, attached to the actor as a stream once it starts
    outbound: Option<UnboundedReceiver<ServerMessage>>,

    /// Relay counters (the slot taken at upgrade is released in `stopped`)
    metrics: RelayMetrics,

    /// Last time anything arrived from the client
    last_heartbeat: Instant,

    heartbeat_interval: Duration,
    client_timeout: Duration,

    /// Why the connection ended, when it did not close cleanly
    close_reason: Option<String>,
}

impl VoiceSocket {
    pub fn new(config: AppConfig, providers: Providers, metrics: RelayMetrics) -> Self {
        let heartbeat_interval = Duration::from_secs(config.performance.heartbeat_interval_secs);
        let client_timeout = Duration::from_secs(config.performance.client_timeout_secs);
        let (session, handle, outbound) = Session::new(config, providers, metrics.clone());

        Self {
            session: handle,
            pending_session: Some(session),
            outbound: Some(outbound),
            metrics,
            last_heartbeat: Instant::now(),
            heartbeat_interval,
            client_timeout,
            close_reason: None,
        }
    }

    /// Ping the client on a fixed interval and drop it when it stops answering.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session.id(), "WebSocket heartbeat timeout, closing connection");
                act.close_reason = Some("heartbeat timeout".to_string());
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn handle_text(&mut self, text: &str) {
        match parse_client_message(text) {
            Ok(message) => {
                debug!(session_id = %self.session.id(), "Control message: {:?}", message);
                self.session.send(SessionEvent::Client(message));
            }
            Err(err) => {
                warn!(session_id = %self.session.id(), "Ignoring malformed control message: {}", err);
                self.metrics.record(RelayCounter::MalformedMessage);
            }
        }
    }
}

/// Implement Actor trait for WebSocket handling.
impl Actor for VoiceSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session.id(), "WebSocket connection started");

        if let Some(session) = self.pending_session.take() {
            tokio::spawn(session.run());
        }
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }
        self.start_heartbeat(ctx);
    }

    /// Called when the WebSocket connection stops.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session.id(), "WebSocket connection stopped");
        self.session
            .send(SessionEvent::Disconnected(self.close_reason.take()));
        self.metrics.close_session();
    }
}

/// Handle incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text),
            Ok(ws::Message::Binary(data)) => {
                self.session.send(SessionEvent::Audio(data));
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session.id(), "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                // Fragmented frames are not part of the protocol
                warn!(session_id = %self.session.id(), "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session.id(), "WebSocket protocol error: {}", err);
                self.close_reason = Some(err.to_string());
                ctx.stop();
            }
        }
    }
}

/// Forward session output to the client.
impl StreamHandler<ServerMessage> for VoiceSocket {
    fn handle(&mut self, msg: ServerMessage, ctx: &mut Self::Context) {
        ctx.text(msg.to_json());
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!(session_id = %self.session.id(), "Session output ended");
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Reserves a session slot, then upgrades the connection. The slot is released when
/// the actor stops, or right away if the handshake fails.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    let config = app_state.get_config();
    let limit = config.performance.max_concurrent_sessions;
    if !app_state.metrics.try_open_session(limit) {
        warn!(limit, "Refusing WebSocket connection: session limit reached");
        return Err(AppError::Unavailable(format!("Session limit reached ({} active)", limit)).into());
    }

    let socket = VoiceSocket::new(config, app_state.providers.clone(), app_state.metrics.clone());
    ws::start(socket, &req, stream).map_err(|err| {
        app_state.metrics.close_session();
        err
    })
}
