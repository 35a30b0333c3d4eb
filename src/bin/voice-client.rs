//! # Voice Client
//!
//! Talk to a running relay from the terminal: microphone in, speakers out.
//!
//! ```text
//! voice-client [URL] [--welcome <TEXT>]
//! ```
//!
//! The outbound buffer size comes from the same configuration the server reads
//! (`performance.outbound_buffer_capacity`).

use anyhow::Result;
use clap::Parser;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_relay_backend::audio::device::{Microphone, Speaker};
use voice_relay_backend::audio::pcm::OUTPUT_SAMPLE_RATE;
use voice_relay_backend::audio::{GaplessScheduler, Mixer, SharedMixer};
use voice_relay_backend::client::{ClientHandlers, VoiceClient};
use voice_relay_backend::config::AppConfig;
use voice_relay_backend::protocol::ClientMessage;

const DEFAULT_URL: &str = "ws://127.0.0.1:3000/ws";

/// Voice conversation with a relay server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket endpoint of the relay
    #[arg(env = "VOICE_RELAY_URL", default_value = DEFAULT_URL)]
    url: String,

    /// Text the assistant speaks before the user says anything
    #[arg(short, long, env = "VOICE_WELCOME")]
    welcome: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=info,voice_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = AppConfig::load()?;
    config.validate()?;

    // Playback: scheduler → mixer → speaker callback
    let mixer: SharedMixer = Arc::new(Mutex::new(Mixer::new(OUTPUT_SAMPLE_RATE)));
    let _speaker = Speaker::open(mixer.clone())?;
    let scheduler = Arc::new(Mutex::new(GaplessScheduler::new(mixer)));

    let handlers = ClientHandlers::new();
    handlers.status.set(|status| info!("{}", status));
    handlers
        .transcript
        .set(|turn| println!("{}: {}", turn.role.as_str(), turn.text));
    let audio_scheduler = scheduler.clone();
    handlers.audio.set(move |chunk| {
        audio_scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chunk);
    });
    let interrupt_scheduler = scheduler.clone();
    handlers.interrupt.set(move |_| {
        interrupt_scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .hard_stop();
    });

    let client = VoiceClient::new(args.url, handlers, config.performance.outbound_buffer_capacity);

    // Queued until the socket opens, then sent in this order
    client.send_message(ClientMessage::Start {
        timestamp: Some(chrono::Utc::now().timestamp_millis().max(0) as u64),
        config: None,
    })?;
    if let Some(text) = args.welcome.filter(|text| !text.trim().is_empty()) {
        client.send_message(ClientMessage::WelcomeMessage { text })?;
    }

    let mut connection = client.connect().await?;

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let mut microphone = Microphone::new(frames_tx);
    microphone.start()?;

    let uplink = client.clone();
    let forward = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            uplink.send_audio(frame);
        }
    });

    // Finished sources leave the active set here, outside the device callback
    let mut reap = tokio::time::interval(Duration::from_millis(50));
    loop {
        tokio::select! {
            _ = reap.tick() => {
                scheduler.lock().unwrap_or_else(PoisonError::into_inner).reap_finished();
            }
            _ = &mut connection => {
                info!("Relay closed the connection");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping");
                break;
            }
        }
    }

    microphone.stop();
    forward.abort();
    scheduler.lock().unwrap_or_else(PoisonError::into_inner).hard_stop();
    client.close();
    Ok(())
}
