//! # Audio Device I/O
//!
//! Connects the capture encoder and the playback mixer to real hardware through `cpal`.
//! Only compiled into the `voice-client` binary (`device` feature); the server never
//! touches an audio device.
//!
//! ## Input path:
//! device (any rate, any channel count) → downmix to mono → resample to 16kHz (rubato) →
//! `CaptureEncoder` → PCM16 frames on a channel
//!
//! ## Output path:
//! `SharedMixer` at 24kHz → duplicated to every device channel
//!
//! Echo cancellation and noise suppression are left to the operating system's
//! input processing; cpal exposes no switch for them.

/// Average interleaved frames down to one channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

#[cfg(feature = "device")]
pub use resample::StreamResampler;

#[cfg(feature = "device")]
mod resample {
    use anyhow::{Context, Result};
    use rubato::{FftFixedIn, Resampler};

    /// Input frames per resampler call, at the device rate.
    const CHUNK_FRAMES: usize = 1024;

    /// Mono resampler fed from a device callback of any size.
    ///
    /// Samples are collected until rubato's next fixed-size input chunk is complete,
    /// so one resampler instance (and its filter state) spans the whole stream.
    pub struct StreamResampler {
        inner: Option<FftFixedIn<f32>>,
        pending: Vec<f32>,
    }

    impl StreamResampler {
        pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
            let inner = if from_rate == to_rate {
                None
            } else {
                Some(
                    FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_FRAMES, 2, 1)
                        .with_context(|| format!("Cannot resample {} Hz to {} Hz", from_rate, to_rate))?,
                )
            };
            Ok(Self {
                inner,
                pending: Vec::with_capacity(CHUNK_FRAMES * 2),
            })
        }

        pub fn is_passthrough(&self) -> bool {
            self.inner.is_none()
        }

        /// Samples waiting for a complete input chunk.
        pub fn pending(&self) -> usize {
            self.pending.len()
        }

        /// Resampler latency in output samples.
        pub fn output_delay(&self) -> usize {
            self.inner.as_ref().map_or(0, |inner| inner.output_delay())
        }

        pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
            let Some(inner) = self.inner.as_mut() else {
                return Ok(input.to_vec());
            };

            self.pending.extend_from_slice(input);
            let mut output = Vec::new();
            loop {
                let needed = inner.input_frames_next();
                if self.pending.len() < needed {
                    break;
                }
                let chunk: Vec<f32> = self.pending.drain(..needed).collect();
                let frames = inner.process(&[chunk], None).context("Resampling failed")?;
                output.extend_from_slice(&frames[0]);
            }
            Ok(output)
        }
    }
}

#[cfg(feature = "device")]
pub use hardware::{Microphone, Speaker};

#[cfg(feature = "device")]
mod hardware {
    use anyhow::{anyhow, Context, Result};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::PoisonError;
    use tokio::sync::mpsc;
    use tracing::{error, info, warn};

    use super::{downmix, StreamResampler};
    use crate::audio::capture::{AudioFrame, CaptureEncoder};
    use crate::audio::mixer::SharedMixer;
    use crate::audio::pcm::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};

    /// Default input device feeding a `CaptureEncoder`.
    ///
    /// The cpal stream is held only while capturing; dropping it releases the device.
    pub struct Microphone {
        frames: mpsc::UnboundedSender<AudioFrame>,
        stream: Option<cpal::Stream>,
    }

    impl Microphone {
        pub fn new(frames: mpsc::UnboundedSender<AudioFrame>) -> Self {
            Self { frames, stream: None }
        }

        pub fn is_capturing(&self) -> bool {
            self.stream.is_some()
        }

        /// Open the default input device and start producing frames. No-op if already capturing.
        pub fn start(&mut self) -> Result<()> {
            if self.stream.is_some() {
                return Ok(());
            }

            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| anyhow!("No input device available"))?;
            let supported = device
                .default_input_config()
                .context("Failed to query input device configuration")?;
            let channels = supported.channels() as usize;
            let device_rate = supported.sample_rate().0;
            let config = supported.config();

            info!(
                device = %device.name().unwrap_or_default(),
                channels,
                device_rate,
                "Opening microphone"
            );

            let mut resampler = StreamResampler::new(device_rate, INPUT_SAMPLE_RATE)?;
            let mut encoder = CaptureEncoder::default();
            encoder.start();
            let frames = self.frames.clone();

            let stream = device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix(data, channels);
                    let resampled = match resampler.process(&mono) {
                        Ok(resampled) => resampled,
                        Err(e) => {
                            warn!("Dropping microphone block: {:#}", e);
                            return;
                        }
                    };
                    for frame in encoder.push_samples(&resampled) {
                        // Receiver gone means the client is shutting down
                        let _ = frames.send(frame);
                    }
                },
                |err| error!("Microphone stream error: {}", err),
                None,
            )
            .context("Input device does not deliver f32 samples")?;
            stream.play()?;
            self.stream = Some(stream);
            Ok(())
        }

        /// Release the input device. The partially filled frame dies with the callback.
        pub fn stop(&mut self) {
            if self.stream.take().is_some() {
                info!("Microphone released");
            }
        }
    }

    /// Default output device rendering a `SharedMixer`.
    pub struct Speaker {
        _stream: cpal::Stream,
    }

    impl Speaker {
        pub fn open(mixer: SharedMixer) -> Result<Self> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| anyhow!("No output device available"))?;
            let channels = device
                .default_output_config()
                .context("Failed to query output device configuration")?
                .channels()
                .max(1);

            let config = cpal::StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(OUTPUT_SAMPLE_RATE),
                buffer_size: cpal::BufferSize::Default,
            };

            let mut mono = Vec::new();
            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let frames = data.len() / channels as usize;
                        mono.resize(frames, 0.0);
                        mixer
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .render(&mut mono);
                        for (frame, sample) in data.chunks_mut(channels as usize).zip(&mono) {
                            frame.fill(*sample);
                        }
                    },
                    |err| error!("Speaker stream error: {}", err),
                    None,
                )
                .with_context(|| {
                    format!("Output device does not accept {} Hz playback", OUTPUT_SAMPLE_RATE)
                })?;
            stream.play()?;

            if channels > 2 {
                warn!(channels, "Playing mono audio on a multichannel device");
            }
            Ok(Self { _stream: stream })
        }
    }
}
