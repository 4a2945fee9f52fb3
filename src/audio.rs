//! Real-time Audio Capture and Playback
//!
//! Microphone capture feeding the shared local track, playback of remote
//! voice, and playback of Ask AI answers. Uses CPAL for device I/O; each
//! device stream lives on its own thread because CPAL streams are not `Send`.

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Stream, StreamConfig};
use log::{error, info, warn};
use ringbuf::{HeapProducer, HeapRb};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::ask_ai::{AudioSink, PlaybackError};
use crate::audio_codec::{OpusEncoder, OPUS_FRAME_MS, OPUS_SAMPLE_RATE};
use crate::config::AudioConfig;
use crate::media::{LocalStream, LocalTrack, MediaCapture, MediaError};

/// How often device threads check whether they should stop
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const PLAYBACK_BUFFER_MS: usize = 200;

fn device_error(e: BuildStreamError) -> MediaError {
    match e {
        BuildStreamError::DeviceNotAvailable => MediaError::NoDevice,
        other => MediaError::Device(other.to_string()),
    }
}

/// Run `open` on a dedicated thread that owns the resulting stream until
/// `keep_running` turns false, reporting the open result back.
async fn spawn_device_thread<F, K>(name: &str, open: F, keep_running: K) -> Result<(), MediaError>
where
    F: FnOnce() -> Result<Stream, MediaError> + Send + 'static,
    K: Fn() -> bool + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match open() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            while keep_running() {
                std::thread::sleep(POLL_INTERVAL);
            }
            drop(stream);
        })
        .map_err(|e| MediaError::Device(e.to_string()))?;

    ready_rx
        .await
        .map_err(|_| MediaError::Device("audio thread exited".to_string()))?
}

/// Microphone capture through the default input device
#[derive(Debug, Clone)]
pub struct CpalCapture {
    config: AudioConfig,
}

impl CpalCapture {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MediaCapture for CpalCapture {
    async fn acquire_audio(&self) -> Result<LocalStream, MediaError> {
        if self.config.sample_rate != OPUS_SAMPLE_RATE {
            return Err(MediaError::Device(format!(
                "unsupported capture rate {}Hz",
                self.config.sample_rate
            )));
        }
        if !OPUS_FRAME_MS.contains(&self.config.frame_ms) {
            return Err(MediaError::Device(format!(
                "unsupported frame length {}ms",
                self.config.frame_ms
            )));
        }

        let track = Arc::new(LocalTrack::new());
        let config = self.config.clone();
        let capture_track = Arc::clone(&track);
        let watched = Arc::clone(&track);

        spawn_device_thread(
            "mic-capture",
            move || open_input(&config, capture_track),
            move || !watched.is_stopped(),
        )
        .await?;

        Ok(LocalStream::new(vec![track]))
    }
}

/// Build the input stream: downmix to mono, cut into Opus frames and publish
/// them on `track`. Frames captured while the track is disabled go out as
/// silence.
fn open_input(config: &AudioConfig, track: Arc<LocalTrack>) -> Result<Stream, MediaError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(MediaError::NoDevice)?;
    info!(
        "Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let frame = config.frame_samples();
    let channels = usize::from(config.channels.max(1));
    let mut encoder = OpusEncoder::new(frame).map_err(|e| MediaError::Codec(e.to_string()))?;
    let mut pending: Vec<f32> = Vec::with_capacity(frame * 2);
    let silence = vec![0f32; frame];

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for sample in data.chunks(channels) {
                    pending.push(sample.iter().sum::<f32>() / sample.len() as f32);
                }

                while pending.len() >= frame {
                    let chunk: Vec<f32> = pending.drain(..frame).collect();
                    let input = if track.is_enabled() { &chunk } else { &silence };
                    match encoder.encode(input) {
                        Ok(packet) => track.publish(Bytes::from(packet)),
                        Err(e) => warn!("Dropping captured frame: {}", e),
                    }
                }
            },
            |err| {
                error!("Audio input error: {}", err);
            },
            None,
        )
        .map_err(device_error)?;

    stream.play().map_err(|e| MediaError::Device(e.to_string()))?;
    info!(
        "Audio capture started: {}Hz, {} channel(s), {} samples per frame",
        config.sample_rate, config.channels, frame
    );
    Ok(stream)
}

/// Playback of one remote participant's decoded audio.
///
/// Output stops when this is dropped.
pub struct RemotePlayback {
    producer: HeapProducer<f32>,
    running: Arc<AtomicBool>,
}

impl RemotePlayback {
    pub async fn start(config: &AudioConfig) -> Result<Self, MediaError> {
        let buffer_samples = (OPUS_SAMPLE_RATE as usize * PLAYBACK_BUFFER_MS) / 1000;
        let ring_buffer = HeapRb::<f32>::new(buffer_samples);
        let (producer, mut consumer) = ring_buffer.split();

        let channels = config.channels.max(1);
        let running = Arc::new(AtomicBool::new(true));
        let watched = Arc::clone(&running);

        spawn_device_thread(
            "voice-playback",
            move || {
                let host = cpal::default_host();
                let device = host.default_output_device().ok_or(MediaError::NoDevice)?;
                let stream_config = StreamConfig {
                    channels,
                    sample_rate: cpal::SampleRate(OPUS_SAMPLE_RATE),
                    buffer_size: cpal::BufferSize::Default,
                };
                let stream = device
                    .build_output_stream(
                        &stream_config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            for frame in data.chunks_mut(usize::from(channels)) {
                                let sample = consumer.pop().unwrap_or(0.0);
                                frame.fill(sample);
                            }
                        },
                        |err| {
                            error!("Audio output error: {}", err);
                        },
                        None,
                    )
                    .map_err(device_error)?;
                stream.play().map_err(|e| MediaError::Device(e.to_string()))?;
                Ok(stream)
            },
            move || watched.load(Ordering::Acquire),
        )
        .await?;

        info!("Remote audio playback started");
        Ok(Self { producer, running })
    }

    /// Queue decoded samples; whatever does not fit is dropped
    pub fn push(&mut self, samples: &[f32]) -> usize {
        self.producer.push_slice(samples)
    }
}

impl Drop for RemotePlayback {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Plays Ask AI answers (MP3) on the default output device
#[derive(Debug, Default, Clone)]
pub struct RodioPlayer;

impl RodioPlayer {
    pub fn new() -> Self {
        Self
    }
}

fn play_blocking(encoded: Vec<u8>) -> Result<(), PlaybackError> {
    let (_stream, handle) = rodio::OutputStream::try_default().map_err(|_| PlaybackError::NoDevice)?;
    let sink = rodio::Sink::try_new(&handle).map_err(|e| PlaybackError::Failed(e.to_string()))?;
    let source =
        rodio::Decoder::new(Cursor::new(encoded)).map_err(|e| PlaybackError::Decode(e.to_string()))?;
    sink.append(source);
    sink.sleep_until_end();
    Ok(())
}

#[async_trait]
impl AudioSink for RodioPlayer {
    async fn play(&self, encoded: Vec<u8>) -> Result<(), PlaybackError> {
        tokio::task::spawn_blocking(move || play_blocking(encoded))
            .await
            .map_err(|e| PlaybackError::Failed(e.to_string()))?
    }
}
