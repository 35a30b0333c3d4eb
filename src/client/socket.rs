//! # Voice Client Connection
//!
//! Client side of the Transport Channel, over tokio-tungstenite.
//!
//! ## Connection Flow:
//! 1. **Before open**: control messages go into the bounded `OutboundBuffer`;
//!    audio frames are dropped with a warning (stale audio is worse than none)
//! 2. **Open**: buffered messages are flushed in the order they were sent, then
//!    `Connected` is reported
//! 3. **Running**: a writer task owns the sink, a reader task owns the stream and
//!    dispatches every server message through `ClientHandlers`
//! 4. **Closed**: the client goes back to buffering and reports `Disconnected`
//!
//! ## Key Rust Concepts:
//! - **`StreamExt::split`**: one half per task, so reading never waits on writing
//! - **mpsc channel to the writer**: senders stay synchronous, ordering is the channel's
//! - **std Mutex**: the link state is only held for a few instructions, never across `.await`

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::handlers::{ClientHandlers, STATUS_CONNECTED, STATUS_DISCONNECTED, STATUS_SOCKET_ERROR};
use super::outbound::OutboundBuffer;
use crate::audio::AudioFrame;
use crate::error::{RelayError, RelayResult};
use crate::protocol::{ClientMessage, ServerMessage};

/// Where outgoing messages go right now.
#[derive(Debug)]
enum Link {
    Pending(OutboundBuffer),
    Open(mpsc::UnboundedSender<Message>),
}

/// A voice session seen from the client.
///
/// Cheap to clone; clones share the link and the handlers.
#[derive(Debug, Clone)]
pub struct VoiceClient {
    url: String,
    capacity: usize,
    link: Arc<Mutex<Link>>,
    handlers: ClientHandlers,
}

impl VoiceClient {
    /// Create a client for `url` (for example `ws://127.0.0.1:3000/ws`).
    ///
    /// ## Parameters:
    /// - `outbound_capacity`: control messages kept while the socket is not open
    pub fn new(url: impl Into<String>, handlers: ClientHandlers, outbound_capacity: usize) -> Self {
        Self {
            url: url.into(),
            capacity: outbound_capacity,
            link: Arc::new(Mutex::new(Link::Pending(OutboundBuffer::new(outbound_capacity)))),
            handlers,
        }
    }

    pub fn handlers(&self) -> &ClientHandlers {
        &self.handlers
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.lock_link(), Link::Open(_))
    }

    /// Messages waiting for the socket to open.
    pub fn pending_messages(&self) -> usize {
        match &*self.lock_link() {
            Link::Pending(buffer) => buffer.len(),
            Link::Open(_) => 0,
        }
    }

    /// Open the connection and start the reader and writer tasks.
    ///
    /// ## Returns:
    /// The reader task; it completes when the connection ends, after `Disconnected`
    /// has been reported.
    pub async fn connect(&self) -> RelayResult<JoinHandle<()>> {
        info!(url = %self.url, "Connecting voice client");
        let (socket, _) = connect_async(self.url.as_str()).await.map_err(|err| {
            self.handlers.status.call(STATUS_SOCKET_ERROR.to_string());
            RelayError::Transport(err.to_string())
        })?;
        let (mut sink, mut stream) = socket.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        {
            let mut link = self.lock_link();
            if let Link::Pending(buffer) = &mut *link {
                let queued = buffer.drain();
                if !queued.is_empty() {
                    debug!(count = queued.len(), "Flushing queued control messages");
                }
                flush_queued(queued, &tx);
            }
            *link = Link::Open(tx);
        }
        self.handlers.status.call(STATUS_CONNECTED.to_string());

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(err) = sink.send(message).await {
                    warn!("Voice client send failed: {}", err);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let client = self.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => client.handlers.dispatch(message),
                        Err(err) => warn!("Unknown server message: {}", err),
                    },
                    Ok(Message::Close(frame)) => {
                        debug!("Server closed the connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!("Voice client connection error: {}", err);
                        client.handlers.status.call(STATUS_SOCKET_ERROR.to_string());
                        break;
                    }
                }
            }
            client.reset();
            client.handlers.status.call(STATUS_DISCONNECTED.to_string());
        });

        Ok(reader)
    }

    /// Send a control message, or queue it until the socket opens.
    ///
    /// Fails with `Backpressure` when the queue is full.
    pub fn send_message(&self, message: ClientMessage) -> RelayResult<()> {
        let mut link = self.lock_link();
        match &mut *link {
            Link::Open(tx) => {
                let text = to_text(&message)?;
                tx.send(Message::Text(text))
                    .map_err(|_| RelayError::Transport("connection writer stopped".to_string()))
            }
            Link::Pending(buffer) => {
                debug!("Socket not open, queueing control message");
                buffer.push(message)
            }
        }
    }

    /// Send one PCM16 frame.
    ///
    /// ## Returns:
    /// - **true**: the frame was handed to the writer
    /// - **false**: the socket is not open and the frame was dropped
    pub fn send_audio(&self, frame: AudioFrame) -> bool {
        match &*self.lock_link() {
            Link::Open(tx) => tx.send(Message::Binary(frame.to_vec())).is_ok(),
            Link::Pending(_) => {
                warn!(bytes = frame.len(), "Cannot send audio, socket not open");
                false
            }
        }
    }

    /// Close the connection. Later messages are queued for the next `connect`.
    pub fn close(&self) {
        let mut link = self.lock_link();
        if let Link::Open(tx) = &*link {
            let _ = tx.send(Message::Close(None));
        }
        *link = Link::Pending(OutboundBuffer::new(self.capacity));
    }

    fn reset(&self) {
        let mut link = self.lock_link();
        if let Link::Open(_) = &*link {
            *link = Link::Pending(OutboundBuffer::new(self.capacity));
        }
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_text<M: Serialize>(message: &M) -> RelayResult<String> {
    serde_json::to_string(message).map_err(|err| RelayError::MalformedMessage(err.to_string()))
}

/// Hand queued messages to the writer in order.
///
/// A message that fails to serialize is logged and skipped; the rest still go out.
///
/// ## Returns:
/// How many messages were sent.
fn flush_queued<M: Serialize>(queued: Vec<M>, tx: &mpsc::UnboundedSender<Message>) -> usize {
    let mut sent = 0;
    for message in queued {
        match to_text(&message) {
            Ok(text) => {
                if tx.send(Message::Text(text)).is_ok() {
                    sent += 1;
                }
            }
            Err(err) => warn!("Dropping queued control message: {}", err),
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Accepts one connection and hands the server side of it to the test.
    async fn local_server() -> (
        String,
        JoinHandle<tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            accept_async(tcp).await.unwrap()
        });
        (format!("ws://{}", addr), accept)
    }

    async fn next_text(
        server: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) -> String {
        loop {
            match server.next().await.unwrap().unwrap() {
                Message::Text(text) => return text,
                _ => continue,
            }
        }
    }

    fn recorded_statuses(handlers: &ClientHandlers) -> (Arc<Mutex<Vec<String>>>, mpsc::UnboundedReceiver<String>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = seen.clone();
        handlers.status.set(move |status: String| {
            sink.lock().unwrap().push(status.clone());
            let _ = tx.send(status);
        });
        (seen, rx)
    }

    #[tokio::test]
    async fn test_queued_messages_flush_in_order_on_open() {
        let (url, accept) = local_server().await;
        let client = VoiceClient::new(url, ClientHandlers::new(), 8);

        client
            .send_message(ClientMessage::Start {
                timestamp: Some(7),
                config: None,
            })
            .unwrap();
        client
            .send_message(ClientMessage::WelcomeMessage {
                text: "Hi!".to_string(),
            })
            .unwrap();
        assert_eq!(client.pending_messages(), 2);

        client.connect().await.unwrap();
        let mut server = accept.await.unwrap();
        assert!(client.is_connected());

        assert_eq!(next_text(&mut server).await, r#"{"type":"start","timestamp":7}"#);
        assert_eq!(
            next_text(&mut server).await,
            r#"{"type":"welcome_message","text":"Hi!"}"#
        );
    }

    /// Serializes as an error, like a map with non-string keys would.
    enum Queued {
        Good(&'static str),
        Unserializable,
    }

    impl Serialize for Queued {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            match self {
                Queued::Good(text) => serializer.serialize_str(text),
                Queued::Unserializable => Err(serde::ser::Error::custom("cannot serialize")),
            }
        }
    }

    #[test]
    fn test_unserializable_queued_message_is_skipped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queued = vec![Queued::Good("first"), Queued::Unserializable, Queued::Good("last")];

        assert_eq!(flush_queued(queued, &tx), 2);
        assert_eq!(rx.try_recv().unwrap(), Message::Text("\"first\"".to_string()));
        assert_eq!(rx.try_recv().unwrap(), Message::Text("\"last\"".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_audio_before_open_is_dropped() {
        let (url, accept) = local_server().await;
        let client = VoiceClient::new(url, ClientHandlers::new(), 8);

        assert!(!client.send_audio(Bytes::from_static(&[1, 0])));

        client.connect().await.unwrap();
        let mut server = accept.await.unwrap();
        assert!(client.send_audio(Bytes::from_static(&[2, 0, 3, 0])));

        let frame = loop {
            match server.next().await.unwrap().unwrap() {
                Message::Binary(data) => break data,
                _ => continue,
            }
        };
        assert_eq!(frame, vec![2, 0, 3, 0]);
    }

    #[tokio::test]
    async fn test_server_messages_reach_handlers() {
        let (url, accept) = local_server().await;
        let handlers = ClientHandlers::new();
        let (interrupt_tx, mut interrupt_rx) = mpsc::unbounded_channel();
        handlers.interrupt.set(move |_| {
            let _ = interrupt_tx.send(());
        });
        let (_, mut statuses) = recorded_statuses(&handlers);

        let client = VoiceClient::new(url, handlers, 8);
        client.connect().await.unwrap();
        let mut server = accept.await.unwrap();
        assert_eq!(statuses.recv().await.unwrap(), "Connected");

        server
            .send(Message::Text(ServerMessage::status("Ready to listen").to_json()))
            .await
            .unwrap();
        server
            .send(Message::Text("{\"type\":\"unknown\"}".to_string()))
            .await
            .unwrap();
        server
            .send(Message::Text(ServerMessage::interrupt().to_json()))
            .await
            .unwrap();

        assert_eq!(statuses.recv().await.unwrap(), "Ready to listen");
        tokio::time::timeout(Duration::from_secs(5), interrupt_rx.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_close_reports_disconnected_and_requeues() {
        let (url, accept) = local_server().await;
        let handlers = ClientHandlers::new();
        let (seen, _rx) = recorded_statuses(&handlers);

        let client = VoiceClient::new(url, handlers, 8);
        let reader = client.connect().await.unwrap();
        let mut server = accept.await.unwrap();
        server.close(None).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(!client.is_connected());
        assert_eq!(seen.lock().unwrap().last().map(String::as_str), Some("Disconnected"));

        client
            .send_message(ClientMessage::WelcomeMessage {
                text: "later".to_string(),
            })
            .unwrap();
        assert_eq!(client.pending_messages(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = VoiceClient::new(format!("ws://{}", addr), ClientHandlers::new(), 8);
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
    }
}
