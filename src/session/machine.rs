//! # Session State Machine
//!
//! One `Session` per WebSocket connection. It owns the conversation history, the
//! transcriber connection and the "AI is speaking" flag, and it is the only writer of
//! all three.
//!
//! ## States:
//! ```text
//! Idle → Initializing → Listening ⇄ Thinking → Speaking → Listening
//!                                              ↓
//!                                         Interrupted → Listening
//! any state → Closed
//! ```
//!
//! ## Concurrency model:
//! `run()` is a single task that selects over three inputs:
//! - **inbox**: control messages, audio frames and the disconnect notice from the socket
//! - **transcriber events**: partial/final transcripts and voice activity
//! - **internal updates**: results of work the session spawned (transcriber connect,
//!   reply generation, speech synthesis)
//!
//! Reply generation and synthesis run in spawned tasks so a slow provider never blocks
//! barge-in. Every reply cycle gets a generation number and a cancellation token;
//! updates from any other generation are dropped, and a new cycle only starts after the
//! previous one reported that it finished. At most one LLM stream and one TTS stream
//! exist per session at any time.
//!
//! ## Final transcripts during a reply:
//! A final transcript that arrives while a cycle is active is queued. If the assistant
//! is speaking it also interrupts the reply, so the queued utterance is answered as
//! soon as the interrupted cycle has wound down.

use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::history::{ConversationHistory, Turn};
use super::interrupt::InterruptCoordinator;
use super::settings::{LlmSettings, SessionSettings, TtsSettings};
use crate::audio::pcm::validate_pcm16_frame;
use crate::config::AppConfig;
use crate::error::{RelayError, RelayResult};
use crate::protocol::{ClientMessage, ServerMessage, StartConfig, STATUS_READY, STATUS_SESSION_STARTED};
use crate::providers::{
    AudioChunk, LanguageModel, Providers, SttConnection, SttEvent, TextToSpeech, TranscriptEvent,
    TranscriptKind,
};
use crate::state::{RelayCounter, RelayMetrics};

/// Error text sent when the language model fails mid-reply.
pub const AI_RESPONSE_FAILED: &str = "AI response failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    Listening,
    Thinking,
    Speaking,
    Interrupted,
    Closed,
}

/// Input delivered by the connection that owns the session.
#[derive(Debug)]
pub enum SessionEvent {
    Client(ClientMessage),
    Audio(Bytes),
    /// The connection ended; `Some(reason)` when it failed instead of closing cleanly
    Disconnected(Option<String>),
}

/// Sending side of a session's inbox.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns false once the session has closed.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

enum Internal {
    SttAttached(RelayResult<SttConnection>),
    Cycle { generation: u64, update: CycleUpdate },
}

#[derive(Debug)]
enum CycleUpdate {
    /// The language model finished; the complete reply text
    Reply(String),
    Audio(AudioChunk),
    /// Terminal: the provider failed
    Failed(RelayError),
    /// Terminal: the stage ended normally or observed cancellation
    Finished,
}

#[derive(Debug)]
enum PendingReply {
    User(String),
    Welcome(String),
}

struct ActiveCycle {
    generation: u64,
    cancel: CancellationToken,
}

struct SttLink {
    audio: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
}

pub struct Session {
    id: Uuid,
    state: SessionState,
    config: AppConfig,
    settings: SessionSettings,
    history: ConversationHistory,
    coordinator: InterruptCoordinator,
    providers: Providers,
    metrics: RelayMetrics,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    outbound_closed: bool,
    inbox: mpsc::UnboundedReceiver<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    stt: Option<SttLink>,
    stt_events: Option<mpsc::Receiver<SttEvent>>,
    stt_connecting: bool,
    early_audio: VecDeque<Bytes>,
    cycle: Option<ActiveCycle>,
    next_generation: u64,
    pending: VecDeque<PendingReply>,
}

impl Session {
    /// Create a session.
    ///
    /// ## Parameters:
    /// - `config`: snapshot of the relay configuration; later updates do not affect this session
    /// - `providers`: shared provider clients
    /// - `metrics`: relay-wide counters this session reports into
    ///
    /// ## Returns:
    /// The session (drive it with `run`), the handle the connection feeds it through,
    /// and the receiver of everything the session sends to the peer.
    pub fn new(
        config: AppConfig,
        providers: Providers,
        metrics: RelayMetrics,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = Uuid::new_v4();
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let session = Self {
            id,
            state: SessionState::Idle,
            settings: SessionSettings::from_defaults(&config),
            coordinator: InterruptCoordinator::new(config.interruption.partial_transcript_fallback),
            config,
            history: ConversationHistory::new(),
            providers,
            metrics,
            outbound,
            outbound_closed: false,
            inbox,
            internal_tx,
            internal_rx,
            stt: None,
            stt_events: None,
            stt_connecting: false,
            early_audio: VecDeque::new(),
            cycle: None,
            next_generation: 0,
            pending: VecDeque::new(),
        };
        let handle = SessionHandle { id, tx: inbox_tx };
        (session, handle, outbound_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until the connection goes away.
    pub async fn run(mut self) {
        info!(session_id = %self.id, "Session opened");
        while self.state != SessionState::Closed {
            tokio::select! {
                event = self.inbox.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => self.close(None),
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                event = next_stt_event(&mut self.stt_events) => self.handle_stt(event),
            }

            if self.outbound_closed && self.state != SessionState::Closed {
                self.close(Some(RelayError::Transport("peer stopped reading".to_string())));
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Client(ClientMessage::Start { config, .. }) => self.start(config.as_ref()),
            SessionEvent::Client(ClientMessage::WelcomeMessage { text }) => self.welcome(text),
            SessionEvent::Audio(frame) => self.forward_audio(frame),
            SessionEvent::Disconnected(reason) => self.close(reason.map(RelayError::Transport)),
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::SttAttached(result) => self.stt_attached(result),
            Internal::Cycle { generation, update } => {
                if self.cycle.as_ref().map(|c| c.generation) != Some(generation) {
                    debug!(session_id = %self.id, generation, "Dropping update from a finished cycle");
                    return;
                }
                self.cycle_update(update);
            }
        }
    }

    fn handle_stt(&mut self, event: SttEvent) {
        match event {
            SttEvent::Transcript(event) => self.on_transcript(event),
            SttEvent::Error(e) => {
                error!(session_id = %self.id, "Transcriber failed: {}", e);
                self.metrics.record(RelayCounter::ProviderError);
                self.report(&e);
                self.detach_stt();
            }
            SttEvent::Ended => {
                info!(session_id = %self.id, "Transcriber session ended");
                self.detach_stt();
            }
        }
    }

    // ---- start / transcriber ----

    fn start(&mut self, overrides: Option<&StartConfig>) {
        if self.stt.is_some() || self.stt_connecting {
            debug!(session_id = %self.id, "Ignoring start: transcriber already attached or connecting");
            return;
        }

        self.settings = SessionSettings::merge(&self.config, overrides);
        if self.state == SessionState::Idle {
            self.set_state(SessionState::Initializing);
        }
        self.stt_connecting = true;

        let stt = self.providers.stt.clone();
        let settings = self.settings.stt.clone();
        let queue = self.config.performance.stt_audio_queue;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = stt.connect(&settings, queue).await;
            // A closed session drops the connection, which shuts it down
            let _ = tx.send(Internal::SttAttached(result));
        });
    }

    fn stt_attached(&mut self, result: RelayResult<SttConnection>) {
        self.stt_connecting = false;
        match result {
            Ok(SttConnection { audio, events, shutdown }) => {
                if self.history.set_system(self.settings.system_prompt.clone()) {
                    debug!(session_id = %self.id, "System prompt set");
                }
                self.stt = Some(SttLink { audio, shutdown });
                self.stt_events = Some(events);

                let early: Vec<Bytes> = self.early_audio.drain(..).collect();
                for frame in early {
                    self.push_audio(frame);
                }

                if self.state == SessionState::Initializing {
                    self.set_state(SessionState::Listening);
                }
                info!(session_id = %self.id, provider = self.providers.stt.name(), "Transcriber attached");
                self.send(ServerMessage::status(STATUS_READY));
                self.send(ServerMessage::status(STATUS_SESSION_STARTED));
                self.drain_pending();
            }
            Err(e) => {
                error!(session_id = %self.id, "Transcriber initialization failed: {}", e);
                self.metrics.record(RelayCounter::ProviderError);
                self.early_audio.clear();
                if self.state == SessionState::Initializing {
                    self.set_state(SessionState::Idle);
                }
                self.report(&e);
            }
        }
    }

    fn detach_stt(&mut self) {
        if let Some(stt) = self.stt.take() {
            stt.shutdown.cancel();
        }
        self.stt_events = None;
        if self.cycle.is_none() && self.state == SessionState::Listening {
            self.set_state(SessionState::Idle);
        }
    }

    fn forward_audio(&mut self, frame: Bytes) {
        if let Err(e) = validate_pcm16_frame(&frame) {
            warn!(session_id = %self.id, "Dropping inbound audio: {}", e);
            self.metrics.record(RelayCounter::DroppedAudioFrame);
            return;
        }

        if self.stt.is_none() && self.stt_connecting {
            if self.early_audio.len() < self.config.performance.stt_audio_queue {
                self.early_audio.push_back(frame);
            } else {
                self.metrics.record(RelayCounter::DroppedAudioFrame);
            }
            return;
        }
        self.push_audio(frame);
    }

    fn push_audio(&mut self, frame: Bytes) {
        let Some(stt) = &self.stt else {
            debug!(session_id = %self.id, "Dropping audio: no transcriber attached");
            self.metrics.record(RelayCounter::DroppedAudioFrame);
            return;
        };

        match stt.audio.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %self.id, "Transcriber queue full, dropping audio frame");
                self.metrics.record(RelayCounter::DroppedAudioFrame);
            }
            Err(TrySendError::Closed(_)) => {
                // The transcriber's own end-of-session event follows
                self.metrics.record(RelayCounter::DroppedAudioFrame);
            }
        }
    }

    // ---- transcripts / interrupt ----

    fn on_transcript(&mut self, event: TranscriptEvent) {
        if self.coordinator.should_interrupt(&event) {
            self.interrupt();
        }

        let text = event.text().to_string();
        match event.kind {
            TranscriptKind::Partial if !text.is_empty() => {
                self.send(ServerMessage::PartialTranscript { text });
            }
            TranscriptKind::Final if !text.is_empty() => {
                debug!(session_id = %self.id, text = %text, "Final transcript");
                self.send(ServerMessage::UserTranscript { text: text.clone() });
                self.pending.push_back(PendingReply::User(text));
                self.drain_pending();
            }
            _ => {}
        }
    }

    fn interrupt(&mut self) {
        if !self.coordinator.trigger() {
            return;
        }
        let generation = self.cycle.as_ref().map(|c| c.generation);
        if let Some(cycle) = &self.cycle {
            cycle.cancel.cancel();
        }
        self.set_state(SessionState::Interrupted);
        self.metrics.record(RelayCounter::Interrupt);
        info!(session_id = %self.id, generation = ?generation, "User interrupted the assistant");
        self.send(ServerMessage::interrupt());
    }

    // ---- reply cycles ----

    fn welcome(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            warn!(session_id = %self.id, "Ignoring empty welcome message");
            return;
        }
        if !self.history.has_system() && !self.stt_connecting {
            warn!(session_id = %self.id, "Ignoring welcome message received before start");
            return;
        }
        self.pending.push_back(PendingReply::Welcome(text));
        self.drain_pending();
    }

    fn drain_pending(&mut self) {
        if self.cycle.is_some() || !self.history.has_system() {
            return;
        }
        match self.pending.pop_front() {
            Some(PendingReply::User(text)) => self.begin_reply(text),
            Some(PendingReply::Welcome(text)) => {
                self.open_cycle();
                self.speak(text);
            }
            None => {}
        }
    }

    fn open_cycle(&mut self) -> (u64, CancellationToken) {
        self.next_generation += 1;
        let cancel = CancellationToken::new();
        self.cycle = Some(ActiveCycle {
            generation: self.next_generation,
            cancel: cancel.clone(),
        });
        (self.next_generation, cancel)
    }

    fn begin_reply(&mut self, text: String) {
        self.history.push_user(text);
        let (generation, cancel) = self.open_cycle();
        self.set_state(SessionState::Thinking);
        debug!(session_id = %self.id, generation, "Generating reply");

        let llm = self.providers.llm.clone();
        let turns = self.history.turns().to_vec();
        let settings = self.settings.llm.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let update = generate_reply(llm, turns, settings, cancel).await;
            let _ = tx.send(Internal::Cycle { generation, update });
        });
    }

    fn speak(&mut self, text: String) {
        let Some(cycle) = &self.cycle else {
            return;
        };
        let generation = cycle.generation;
        let cancel = cycle.cancel.clone();

        self.send(ServerMessage::AiTranscript { text: text.clone() });
        self.history.push_assistant(text.clone());
        self.set_state(SessionState::Speaking);
        self.coordinator.begin_speaking();
        debug!(session_id = %self.id, generation, "Synthesizing reply");

        let tts = self.providers.tts.clone();
        let settings = self.settings.tts.clone();
        let coordinator = self.coordinator.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(synthesize(tts, text, settings, coordinator, cancel, generation, tx));
    }

    fn cycle_update(&mut self, update: CycleUpdate) {
        match update {
            CycleUpdate::Reply(text) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    info!(session_id = %self.id, "Language model returned an empty reply");
                    self.finish_cycle();
                } else {
                    self.speak(text);
                }
            }
            CycleUpdate::Audio(chunk) => {
                if self.state == SessionState::Speaking && self.coordinator.is_ai_speaking() {
                    self.send(ServerMessage::Audio { data: chunk.base64 });
                }
            }
            CycleUpdate::Failed(e) => {
                self.metrics.record(RelayCounter::ProviderError);
                match self.state {
                    SessionState::Thinking => {
                        error!(session_id = %self.id, "Reply generation failed: {}", e);
                        self.send(ServerMessage::error(AI_RESPONSE_FAILED));
                    }
                    SessionState::Interrupted => {
                        debug!(session_id = %self.id, "Provider error after interrupt: {}", e);
                    }
                    _ => {
                        error!(session_id = %self.id, "Speech synthesis failed: {}", e);
                        self.report(&e);
                    }
                }
                self.finish_cycle();
            }
            CycleUpdate::Finished => {
                if self.state == SessionState::Speaking {
                    self.metrics.record(RelayCounter::CompletedTurn);
                }
                self.finish_cycle();
            }
        }
    }

    fn finish_cycle(&mut self) {
        self.cycle = None;
        self.coordinator.finish_speaking();
        let next = if self.stt.is_some() {
            SessionState::Listening
        } else if self.stt_connecting {
            SessionState::Initializing
        } else {
            SessionState::Idle
        };
        self.set_state(next);
        self.drain_pending();
    }

    // ---- plumbing ----

    fn close(&mut self, reason: Option<RelayError>) {
        if self.state == SessionState::Closed {
            return;
        }
        match &reason {
            Some(e) => warn!(session_id = %self.id, "Closing session: {}", e),
            None => debug!(session_id = %self.id, "Closing session"),
        }

        if let Some(cycle) = self.cycle.take() {
            cycle.cancel.cancel();
        }
        self.coordinator.finish_speaking();
        if let Some(stt) = self.stt.take() {
            stt.shutdown.cancel();
        }
        self.stt_events = None;
        self.stt_connecting = false;
        self.pending.clear();
        self.early_audio.clear();

        let turns = self.history.len();
        self.history.clear();
        self.set_state(SessionState::Closed);
        info!(session_id = %self.id, turns, "Session closed");
    }

    fn report(&mut self, error: &RelayError) {
        if let Some(message) = error.client_message() {
            self.send(ServerMessage::error(message));
        }
    }

    fn send(&mut self, message: ServerMessage) {
        if self.outbound.send(message).is_err() && !self.outbound_closed {
            debug!(session_id = %self.id, "Outbound channel closed");
            self.outbound_closed = true;
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!(session_id = %self.id, from = ?self.state, to = ?next, "State change");
            self.state = next;
        }
    }
}

async fn next_stt_event(events: &mut Option<mpsc::Receiver<SttEvent>>) -> SttEvent {
    match events {
        Some(events) => events.recv().await.unwrap_or(SttEvent::Ended),
        None => std::future::pending().await,
    }
}

/// Accumulate one complete reply. Cancellation is checked before every token.
async fn generate_reply(
    llm: Arc<dyn LanguageModel>,
    turns: Vec<Turn>,
    settings: LlmSettings,
    cancel: CancellationToken,
) -> CycleUpdate {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return CycleUpdate::Finished,
        opened = llm.stream(&turns, &settings) => opened,
    };
    let mut tokens = match opened {
        Ok(tokens) => tokens,
        Err(e) => return CycleUpdate::Failed(e),
    };

    let mut reply = String::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return CycleUpdate::Finished,
            token = tokens.next() => match token {
                Some(Ok(token)) => reply.push_str(&token),
                Some(Err(e)) => return CycleUpdate::Failed(e),
                None => return CycleUpdate::Reply(reply),
            },
        }
    }
}

/// Forward synthesized chunks until the stream ends, fails, or the assistant is
/// interrupted. Both the speaking flag and the cycle token are checked per chunk.
async fn synthesize(
    tts: Arc<dyn TextToSpeech>,
    text: String,
    settings: TtsSettings,
    coordinator: InterruptCoordinator,
    cancel: CancellationToken,
    generation: u64,
    tx: mpsc::UnboundedSender<Internal>,
) {
    let report = |update: CycleUpdate| tx.send(Internal::Cycle { generation, update }).is_ok();

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            report(CycleUpdate::Finished);
            return;
        }
        opened = tts.stream(&text, &settings) => opened,
    };
    let mut chunks = match opened {
        Ok(chunks) => chunks,
        Err(e) => {
            report(CycleUpdate::Failed(e));
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = chunks.next() => next,
        };
        if !coordinator.is_ai_speaking() {
            break;
        }
        match next {
            Some(Ok(chunk)) => {
                if !report(CycleUpdate::Audio(chunk)) {
                    return;
                }
            }
            Some(Err(e)) => {
                report(CycleUpdate::Failed(e));
                return;
            }
            None => break,
        }
    }

    // Dropping the stream closes the provider response
    drop(chunks);
    report(CycleUpdate::Finished);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SYSTEM_PROMPT;
    use crate::providers::{AudioStream, SpeechToText, TokenStream};
    use crate::session::history::Role;
    use crate::session::settings::SttSettings;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    // ---- mock providers ----

    struct SttLinkForTest {
        events: mpsc::Sender<SttEvent>,
        audio: mpsc::Receiver<Bytes>,
        shutdown: CancellationToken,
    }

    #[derive(Default)]
    struct MockStt {
        failures_left: AtomicUsize,
        connects: AtomicUsize,
        link: Mutex<Option<SttLinkForTest>>,
    }

    impl MockStt {
        fn take_link(&self) -> SttLinkForTest {
            self.link.lock().unwrap().take().expect("transcriber was not connected")
        }
    }

    #[async_trait]
    impl SpeechToText for MockStt {
        fn name(&self) -> &'static str {
            "Mock STT"
        }

        async fn connect(&self, _settings: &SttSettings, audio_queue: usize) -> RelayResult<SttConnection> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(RelayError::init("Mock STT", "rejected credentials"));
            }

            let (audio_tx, audio_rx) = mpsc::channel(audio_queue);
            let (events_tx, events_rx) = mpsc::channel(16);
            let shutdown = CancellationToken::new();
            *self.link.lock().unwrap() = Some(SttLinkForTest {
                events: events_tx,
                audio: audio_rx,
                shutdown: shutdown.clone(),
            });
            Ok(SttConnection {
                audio: audio_tx,
                events: events_rx,
                shutdown,
            })
        }
    }

    enum Script {
        Tokens(Vec<&'static str>),
        Fail,
    }

    #[derive(Default)]
    struct MockLlm {
        scripts: Mutex<VecDeque<Script>>,
        histories: Mutex<Vec<Vec<Turn>>>,
    }

    impl MockLlm {
        fn script(&self, script: Script) {
            self.scripts.lock().unwrap().push_back(script);
        }

        fn history(&self, call: usize) -> Vec<Turn> {
            self.histories.lock().unwrap()[call].clone()
        }

        fn calls(&self) -> usize {
            self.histories.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LanguageModel for MockLlm {
        fn name(&self) -> &'static str {
            "Mock LLM"
        }

        async fn stream(&self, history: &[Turn], _settings: &LlmSettings) -> RelayResult<TokenStream> {
            self.histories.lock().unwrap().push(history.to_vec());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Tokens(vec!["Sure", "."]));
            match script {
                Script::Tokens(tokens) => {
                    let items: Vec<RelayResult<String>> = tokens.into_iter().map(|t| Ok(t.to_string())).collect();
                    Ok(Box::pin(stream::iter(items)))
                }
                Script::Fail => Err(RelayError::stream("Mock LLM", "HTTP 500")),
            }
        }
    }

    type ChunkFeed = mpsc::Sender<RelayResult<AudioChunk>>;

    struct ActiveGuard(Arc<AtomicUsize>);

    impl Drop for ActiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockTts {
        texts: Mutex<Vec<String>>,
        feeds: Mutex<VecDeque<mpsc::Receiver<RelayResult<AudioChunk>>>>,
        active: Arc<AtomicUsize>,
        max_active: AtomicUsize,
    }

    impl MockTts {
        /// The next synthesis streams whatever the test pushes into the returned sender.
        fn expect_call(&self) -> ChunkFeed {
            let (tx, rx) = mpsc::channel(16);
            self.feeds.lock().unwrap().push_back(rx);
            tx
        }

        fn texts(&self) -> Vec<String> {
            self.texts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TextToSpeech for MockTts {
        fn name(&self) -> &'static str {
            "Mock TTS"
        }

        async fn stream(&self, text: &str, _settings: &TtsSettings) -> RelayResult<AudioStream> {
            self.texts.lock().unwrap().push(text.to_string());
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            let guard = ActiveGuard(self.active.clone());

            // No feed means a reply with no audio
            let Some(feed) = self.feeds.lock().unwrap().pop_front() else {
                return Ok(Box::pin(stream::unfold(guard, |_guard| async {
                    None::<(RelayResult<AudioChunk>, ActiveGuard)>
                })));
            };
            Ok(Box::pin(stream::unfold((feed, guard), |(mut feed, guard)| async move {
                feed.recv().await.map(|item| (item, (feed, guard)))
            })))
        }
    }

    // ---- harness ----

    struct Harness {
        handle: SessionHandle,
        outbound: mpsc::UnboundedReceiver<ServerMessage>,
        stt: Arc<MockStt>,
        llm: Arc<MockLlm>,
        tts: Arc<MockTts>,
        metrics: RelayMetrics,
        task: tokio::task::JoinHandle<()>,
    }

    fn harness() -> Harness {
        let stt = Arc::new(MockStt::default());
        let llm = Arc::new(MockLlm::default());
        let tts = Arc::new(MockTts::default());
        let providers = Providers {
            stt: stt.clone(),
            llm: llm.clone(),
            tts: tts.clone(),
        };
        let metrics = RelayMetrics::new();
        let (session, handle, outbound) = Session::new(AppConfig::default(), providers, metrics.clone());
        let task = tokio::spawn(session.run());
        Harness {
            handle,
            outbound,
            stt,
            llm,
            tts,
            metrics,
            task,
        }
    }

    fn audio(data: &str) -> AudioChunk {
        AudioChunk { base64: data.to_string() }
    }

    impl Harness {
        fn send(&self, message: ClientMessage) {
            assert!(self.handle.send(SessionEvent::Client(message)));
        }

        fn start_message() -> ClientMessage {
            ClientMessage::Start {
                timestamp: Some(1),
                config: None,
            }
        }

        async fn next(&mut self) -> ServerMessage {
            tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
                .await
                .expect("timed out waiting for the session")
                .expect("session hung up")
        }

        async fn assert_quiet(&mut self) {
            let next = tokio::time::timeout(Duration::from_millis(100), self.outbound.recv()).await;
            assert!(next.is_err(), "unexpected message: {:?}", next);
        }

        /// Send `start` and wait for readiness.
        async fn start(&mut self) -> SttLinkForTest {
            self.send(Self::start_message());
            assert_eq!(self.next().await, ServerMessage::status(STATUS_READY));
            assert_eq!(self.next().await, ServerMessage::status(STATUS_SESSION_STARTED));
            self.stt.take_link()
        }

        async fn wait_for_completed_turns(&self, expected: u64) {
            for _ in 0..400 {
                if self.metrics.snapshot().completed_turns >= expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("reply cycle did not complete");
        }
    }

    async fn say(link: &SttLinkForTest, event: TranscriptEvent) {
        link.events.send(SttEvent::Transcript(event)).await.unwrap();
    }

    // ---- scenarios ----

    #[tokio::test]
    async fn test_start_without_config_uses_default_prompt() {
        let mut h = harness();
        let link = h.start().await;

        say(&link, TranscriptEvent::finalized("hello")).await;
        assert_eq!(h.next().await, ServerMessage::UserTranscript { text: "hello".into() });
        assert_eq!(h.next().await, ServerMessage::AiTranscript { text: "Sure.".into() });

        let history = h.llm.history(0);
        assert_eq!(history[0], Turn::new(Role::System, DEFAULT_SYSTEM_PROMPT));
    }

    #[tokio::test]
    async fn test_full_reply_cycle() {
        let mut h = harness();
        let mut link = h.start().await;

        let frame = Bytes::from(vec![0u8; 8192]);
        assert!(h.handle.send(SessionEvent::Audio(frame.clone())));
        assert_eq!(link.audio.recv().await.unwrap(), frame);

        h.llm.script(Script::Tokens(vec!["Hi", " there", "!"]));
        let feed = h.tts.expect_call();
        say(&link, TranscriptEvent::finalized("hello")).await;

        assert_eq!(h.next().await, ServerMessage::UserTranscript { text: "hello".into() });
        assert_eq!(h.next().await, ServerMessage::AiTranscript { text: "Hi there!".into() });
        assert_eq!(
            h.llm.history(0),
            vec![
                Turn::new(Role::System, DEFAULT_SYSTEM_PROMPT),
                Turn::new(Role::User, "hello")
            ]
        );

        feed.send(Ok(audio("AAAA"))).await.unwrap();
        feed.send(Ok(audio("BBBB"))).await.unwrap();
        drop(feed);
        assert_eq!(h.next().await, ServerMessage::Audio { data: "AAAA".into() });
        assert_eq!(h.next().await, ServerMessage::Audio { data: "BBBB".into() });
        h.assert_quiet().await;

        assert_eq!(h.tts.texts(), vec!["Hi there!".to_string()]);
        assert_eq!(h.llm.calls(), 1);
        h.wait_for_completed_turns(1).await;

        // The next cycle sees the completed exchange
        say(&link, TranscriptEvent::finalized("and you?")).await;
        assert_eq!(h.next().await, ServerMessage::UserTranscript { text: "and you?".into() });
        assert_eq!(h.next().await, ServerMessage::AiTranscript { text: "Sure.".into() });
        assert_eq!(h.llm.history(1)[2], Turn::new(Role::Assistant, "Hi there!"));
    }

    #[tokio::test]
    async fn test_voice_activity_interrupts_speech_once() {
        let mut h = harness();
        let link = h.start().await;

        h.llm.script(Script::Tokens(vec!["Once upon a time"]));
        let feed = h.tts.expect_call();
        say(&link, TranscriptEvent::finalized("tell me a story")).await;
        assert!(matches!(h.next().await, ServerMessage::UserTranscript { .. }));
        assert!(matches!(h.next().await, ServerMessage::AiTranscript { .. }));

        feed.send(Ok(audio("AAAA"))).await.unwrap();
        assert_eq!(h.next().await, ServerMessage::Audio { data: "AAAA".into() });

        say(&link, TranscriptEvent::speech_start()).await;
        assert_eq!(h.next().await, ServerMessage::interrupt());

        // A second trigger with no new speaking phase changes nothing
        say(&link, TranscriptEvent::speech_start()).await;
        say(&link, TranscriptEvent::partial("wait")).await;
        // The synthesis loop may already have dropped its stream
        let _ = feed.send(Ok(audio("LATE"))).await;

        assert_eq!(h.next().await, ServerMessage::PartialTranscript { text: "wait".into() });
        say(&link, TranscriptEvent::finalized("wait a second")).await;
        assert_eq!(h.next().await, ServerMessage::UserTranscript { text: "wait a second".into() });
        assert_eq!(h.next().await, ServerMessage::AiTranscript { text: "Sure.".into() });

        let metrics = h.metrics.snapshot();
        assert_eq!(metrics.interrupts, 1);
        assert_eq!(h.tts.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_final_while_speaking_interrupts_and_queues() {
        let mut h = harness();
        let link = h.start().await;

        h.llm.script(Script::Tokens(vec!["First reply"]));
        h.llm.script(Script::Tokens(vec!["Second reply"]));
        let feed = h.tts.expect_call();
        say(&link, TranscriptEvent::finalized("first")).await;
        assert!(matches!(h.next().await, ServerMessage::UserTranscript { .. }));
        assert!(matches!(h.next().await, ServerMessage::AiTranscript { .. }));
        feed.send(Ok(audio("AAAA"))).await.unwrap();
        assert!(matches!(h.next().await, ServerMessage::Audio { .. }));

        say(&link, TranscriptEvent::finalized("second")).await;
        assert_eq!(h.next().await, ServerMessage::interrupt());
        assert_eq!(h.next().await, ServerMessage::UserTranscript { text: "second".into() });
        assert_eq!(h.next().await, ServerMessage::AiTranscript { text: "Second reply".into() });

        let roles: Vec<Role> = h.llm.history(1).iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
        assert_eq!(h.tts.max_active.load(Ordering::SeqCst), 1);
        drop(feed);
    }

    #[tokio::test]
    async fn test_history_after_several_cycles() {
        let mut h = harness();
        let link = h.start().await;

        for i in 0..3u64 {
            say(&link, TranscriptEvent::finalized(format!("question {}", i))).await;
            assert!(matches!(h.next().await, ServerMessage::UserTranscript { .. }));
            assert!(matches!(h.next().await, ServerMessage::AiTranscript { .. }));
            h.wait_for_completed_turns(i + 1).await;
        }
        say(&link, TranscriptEvent::finalized("last one")).await;
        assert!(matches!(h.next().await, ServerMessage::UserTranscript { .. }));
        assert!(matches!(h.next().await, ServerMessage::AiTranscript { .. }));

        let history = h.llm.history(3);
        assert_eq!(history.len(), 8);
        assert_eq!(history.iter().filter(|t| t.role == Role::System).count(), 1);
        for (i, pair) in history[1..7].chunks(2).enumerate() {
            assert_eq!(pair[0], Turn::new(Role::User, format!("question {}", i)));
            assert_eq!(pair[1], Turn::new(Role::Assistant, "Sure."));
        }
    }

    #[tokio::test]
    async fn test_welcome_message_speaks_without_user_turn() {
        let mut h = harness();
        let link = h.start().await;

        h.send(ClientMessage::WelcomeMessage { text: "Hi!".into() });
        assert_eq!(h.next().await, ServerMessage::AiTranscript { text: "Hi!".into() });
        h.wait_for_completed_turns(1).await;
        assert_eq!(h.tts.texts(), vec!["Hi!".to_string()]);

        say(&link, TranscriptEvent::finalized("hello")).await;
        assert!(matches!(h.next().await, ServerMessage::UserTranscript { .. }));
        assert!(matches!(h.next().await, ServerMessage::AiTranscript { .. }));

        let history = h.llm.history(0);
        assert_eq!(history[0].role, Role::System);
        assert_eq!(history[1], Turn::new(Role::Assistant, "Hi!"));
        assert_eq!(history[2], Turn::new(Role::User, "hello"));
    }

    #[tokio::test]
    async fn test_welcome_before_start_is_ignored() {
        let mut h = harness();
        h.send(ClientMessage::WelcomeMessage { text: "Hi!".into() });
        h.assert_quiet().await;
        assert!(h.tts.texts().is_empty());
    }

    #[tokio::test]
    async fn test_init_failure_is_reported_and_retryable() {
        let mut h = harness();
        h.stt.failures_left.store(1, Ordering::SeqCst);

        h.send(Harness::start_message());
        assert_eq!(h.next().await, ServerMessage::error("Failed to initialize Mock STT"));

        let _link = h.start().await;
        assert_eq!(h.stt.connects.load(Ordering::SeqCst), 2);
        assert_eq!(h.metrics.snapshot().provider_errors, 1);
    }

    #[tokio::test]
    async fn test_repeated_start_is_a_no_op() {
        let mut h = harness();
        let _link = h.start().await;
        h.send(Harness::start_message());
        h.assert_quiet().await;
        assert_eq!(h.stt.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_llm_failure_returns_to_listening() {
        let mut h = harness();
        let link = h.start().await;

        h.llm.script(Script::Fail);
        say(&link, TranscriptEvent::finalized("hello")).await;
        assert!(matches!(h.next().await, ServerMessage::UserTranscript { .. }));
        assert_eq!(h.next().await, ServerMessage::error(AI_RESPONSE_FAILED));

        say(&link, TranscriptEvent::finalized("still there?")).await;
        assert!(matches!(h.next().await, ServerMessage::UserTranscript { .. }));
        assert_eq!(h.next().await, ServerMessage::AiTranscript { text: "Sure.".into() });

        // No assistant turn for the failed reply
        let roles: Vec<Role> = h.llm.history(1).iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::User]);
    }

    #[tokio::test]
    async fn test_tts_failure_is_reported() {
        let mut h = harness();
        let link = h.start().await;

        let feed = h.tts.expect_call();
        say(&link, TranscriptEvent::finalized("hello")).await;
        assert!(matches!(h.next().await, ServerMessage::UserTranscript { .. }));
        assert!(matches!(h.next().await, ServerMessage::AiTranscript { .. }));

        feed.send(Err(RelayError::stream("Mock TTS", "voice not found"))).await.unwrap();
        assert_eq!(h.next().await, ServerMessage::error("Mock TTS failed: voice not found"));
        assert_eq!(h.metrics.snapshot().completed_turns, 0);
    }

    #[tokio::test]
    async fn test_empty_reply_skips_synthesis() {
        let mut h = harness();
        let link = h.start().await;

        h.llm.script(Script::Tokens(vec!["  "]));
        say(&link, TranscriptEvent::finalized("hello")).await;
        assert!(matches!(h.next().await, ServerMessage::UserTranscript { .. }));
        h.assert_quiet().await;
        assert!(h.tts.texts().is_empty());
    }

    #[tokio::test]
    async fn test_partials_are_forwarded_and_blank_ones_dropped() {
        let mut h = harness();
        let link = h.start().await;

        say(&link, TranscriptEvent::partial("hel")).await;
        say(&link, TranscriptEvent::partial(" ")).await;
        say(&link, TranscriptEvent::partial("hello")).await;
        assert_eq!(h.next().await, ServerMessage::PartialTranscript { text: "hel".into() });
        assert_eq!(h.next().await, ServerMessage::PartialTranscript { text: "hello".into() });
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_audio_before_start_and_invalid_frames_are_dropped() {
        let mut h = harness();
        assert!(h.handle.send(SessionEvent::Audio(Bytes::from(vec![0u8; 64]))));
        assert!(h.handle.send(SessionEvent::Audio(Bytes::from(vec![0u8; 3]))));

        let mut link = h.start().await;
        assert!(h.handle.send(SessionEvent::Audio(Bytes::new())));
        assert!(h.handle.send(SessionEvent::Audio(Bytes::from(vec![1u8; 4]))));
        assert_eq!(link.audio.recv().await.unwrap(), Bytes::from(vec![1u8; 4]));

        assert_eq!(h.metrics.snapshot().dropped_audio_frames, 3);
    }

    #[tokio::test]
    async fn test_transcriber_failure_detaches_and_start_reattaches() {
        let mut h = harness();
        let link = h.start().await;

        link.events
            .send(SttEvent::Error(RelayError::stream("Mock STT", "socket reset")))
            .await
            .unwrap();
        assert_eq!(h.next().await, ServerMessage::error("Mock STT failed: socket reset"));
        assert!(link.shutdown.is_cancelled());

        let _link = h.start().await;
        assert_eq!(h.stt.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_tears_everything_down() {
        let mut h = harness();
        let link = h.start().await;

        let feed = h.tts.expect_call();
        say(&link, TranscriptEvent::finalized("hello")).await;
        assert!(matches!(h.next().await, ServerMessage::UserTranscript { .. }));
        assert!(matches!(h.next().await, ServerMessage::AiTranscript { .. }));

        assert!(h.handle.send(SessionEvent::Disconnected(Some("connection reset".into()))));
        tokio::time::timeout(Duration::from_secs(2), &mut h.task)
            .await
            .expect("session did not stop")
            .unwrap();

        assert!(link.shutdown.is_cancelled());
        assert!(!h.handle.send(SessionEvent::Audio(Bytes::from(vec![0u8; 2]))));
        // The synthesis task notices the cancelled cycle and drops its stream
        for _ in 0..400 {
            if feed.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(feed.is_closed());
    }

    // ---- state transitions, driven step by step ----

    struct Stepped {
        session: Session,
        outbound: mpsc::UnboundedReceiver<ServerMessage>,
        // Keeps the transcriber event channel open
        _stt_events: Option<mpsc::Sender<SttEvent>>,
    }

    fn stepped() -> Stepped {
        stepped_with(AppConfig::default())
    }

    fn stepped_with(config: AppConfig) -> Stepped {
        let providers = Providers {
            stt: Arc::new(MockStt::default()),
            llm: Arc::new(MockLlm::default()),
            tts: Arc::new(MockTts::default()),
        };
        let (session, _handle, outbound) = Session::new(config, providers, RelayMetrics::new());
        Stepped {
            session,
            outbound,
            _stt_events: None,
        }
    }

    impl Stepped {
        fn start(&mut self) {
            self.session.handle_event(SessionEvent::Client(Harness::start_message()));
        }

        fn attach(&mut self) {
            let (audio, _audio_rx) = mpsc::channel(4);
            let (events_tx, events) = mpsc::channel(4);
            self._stt_events = Some(events_tx);
            self.session.stt_attached(Ok(SttConnection {
                audio,
                events,
                shutdown: CancellationToken::new(),
            }));
        }

        fn generation(&self) -> u64 {
            self.session.cycle.as_ref().map(|c| c.generation).expect("no active cycle")
        }

        fn update(&mut self, generation: u64, update: CycleUpdate) {
            self.session.handle_internal(Internal::Cycle { generation, update });
        }

        fn drain_outbound(&mut self) -> Vec<ServerMessage> {
            let mut messages = Vec::new();
            while let Ok(message) = self.outbound.try_recv() {
                messages.push(message);
            }
            messages
        }
    }

    #[tokio::test]
    async fn test_init_failure_returns_to_idle() {
        let mut s = stepped();
        assert_eq!(s.session.state(), SessionState::Idle);

        s.start();
        assert_eq!(s.session.state(), SessionState::Initializing);

        s.session.stt_attached(Err(RelayError::init("Mock STT", "rejected credentials")));
        assert_eq!(s.session.state(), SessionState::Idle);
        assert_eq!(s.drain_outbound(), vec![ServerMessage::error("Failed to initialize Mock STT")]);

        s.start();
        assert_eq!(s.session.state(), SessionState::Initializing);
        s.attach();
        assert_eq!(s.session.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn test_reply_cycle_states() {
        let mut s = stepped();
        s.start();
        s.attach();

        s.session.on_transcript(TranscriptEvent::finalized("hello"));
        assert_eq!(s.session.state(), SessionState::Thinking);

        let generation = s.generation();
        s.update(generation, CycleUpdate::Reply("Hi there.".to_string()));
        assert_eq!(s.session.state(), SessionState::Speaking);
        assert!(s.session.coordinator.is_ai_speaking());

        s.update(generation, CycleUpdate::Finished);
        assert_eq!(s.session.state(), SessionState::Listening);
        assert!(!s.session.coordinator.is_ai_speaking());
        assert_eq!(s.session.metrics.snapshot().completed_turns, 1);
    }

    #[tokio::test]
    async fn test_interrupted_cycle_winds_down_to_listening() {
        let mut s = stepped();
        s.start();
        s.attach();
        s.session.on_transcript(TranscriptEvent::finalized("hello"));
        let generation = s.generation();
        s.update(generation, CycleUpdate::Reply("A long answer.".to_string()));
        s.drain_outbound();

        s.session.on_transcript(TranscriptEvent::speech_start());
        assert_eq!(s.session.state(), SessionState::Interrupted);
        assert_eq!(s.drain_outbound(), vec![ServerMessage::interrupt()]);

        // Late audio from the cancelled synthesis is not forwarded
        s.update(generation, CycleUpdate::Audio(audio("AAAA")));
        assert!(s.drain_outbound().is_empty());

        s.update(generation, CycleUpdate::Finished);
        assert_eq!(s.session.state(), SessionState::Listening);
        assert_eq!(s.session.metrics.snapshot().completed_turns, 0);
        assert_eq!(s.session.metrics.snapshot().interrupts, 1);
    }

    #[tokio::test]
    async fn test_stale_generation_does_not_move_state() {
        let mut s = stepped();
        s.start();
        s.attach();
        s.session.on_transcript(TranscriptEvent::finalized("hello"));
        let generation = s.generation();

        s.update(generation + 7, CycleUpdate::Finished);
        assert_eq!(s.session.state(), SessionState::Thinking);

        s.update(generation, CycleUpdate::Failed(RelayError::stream("Mock LLM", "HTTP 500")));
        assert_eq!(s.session.state(), SessionState::Listening);
        assert!(s.drain_outbound().contains(&ServerMessage::error(AI_RESPONSE_FAILED)));
    }

    #[tokio::test]
    async fn test_transcriber_end_while_listening_goes_idle() {
        let mut s = stepped();
        s.start();
        s.attach();

        s.session.handle_stt(SttEvent::Ended);
        assert_eq!(s.session.state(), SessionState::Idle);
        assert!(s.session.stt.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_closes_session() {
        let mut s = stepped();
        s.start();
        s.attach();
        s.session.on_transcript(TranscriptEvent::finalized("hello"));
        let cancel = s.session.cycle.as_ref().map(|c| c.cancel.clone()).unwrap();

        s.session.handle_event(SessionEvent::Disconnected(Some("connection reset".to_string())));
        assert_eq!(s.session.state(), SessionState::Closed);
        assert!(cancel.is_cancelled());
        assert!(s.session.history.is_empty());
        assert!(s.session.stt.is_none());
    }

    #[tokio::test]
    async fn test_partial_fallback_follows_config() {
        let mut config = AppConfig::default();
        config.interruption.partial_transcript_fallback = false;
        let mut s = stepped_with(config);
        s.start();
        s.attach();
        s.session.on_transcript(TranscriptEvent::finalized("hello"));
        let generation = s.generation();
        s.update(generation, CycleUpdate::Reply("A long answer.".to_string()));

        s.session.on_transcript(TranscriptEvent::partial("wait"));
        assert_eq!(s.session.state(), SessionState::Speaking);

        s.session.on_transcript(TranscriptEvent::speech_start());
        assert_eq!(s.session.state(), SessionState::Interrupted);
    }
}
