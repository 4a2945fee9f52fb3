//! Media Handling
//!
//! The local capture stream shared by every peer link, and the capture seam.

use async_trait::async_trait;
use bytes::Bytes;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Encoded frames buffered per subscriber before it starts lagging
const FRAME_BACKLOG: usize = 64;

/// Media-related errors
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("No audio input device found")]
    NoDevice,
    #[error("Microphone access denied")]
    PermissionDenied,
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Codec error: {0}")]
    Codec(String),
}

/// One outbound audio track.
///
/// Capture publishes encoded frames; every peer link subscribes to the same
/// track. `enabled` is read by the capture side on every frame, so muting is
/// visible to all links at once.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    frames: broadcast::Sender<Bytes>,
}

impl Default for LocalTrack {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTrack {
    pub fn new() -> Self {
        let (frames, _) = broadcast::channel(FRAME_BACKLOG);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            frames,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the track; capture ends and no further frames are published
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Publish one encoded frame to every subscriber
    pub fn publish(&self, frame: Bytes) {
        if !self.is_stopped() {
            // No subscribers yet is fine
            let _ = self.frames.send(frame);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.frames.subscribe()
    }
}

/// The local capture stream
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// Enable or disable every track in place
    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }

    /// Stop every track. Safe to call more than once.
    pub fn stop(&self) {
        let mut stopped_any = false;
        for track in &self.tracks {
            if !track.is_stopped() {
                track.stop();
                stopped_any = true;
            }
        }
        if stopped_any {
            info!("Local stream {} stopped", self.id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }
}

/// Acquires the local microphone
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire_audio(&self) -> Result<LocalStream, MediaError>;
}
