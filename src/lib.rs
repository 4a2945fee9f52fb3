//! StudyConnect RTC - Course Chat and Voice Client Library
//!
//! This library provides the realtime side of StudyConnect: per-course and
//! per-group text chat over WebSocket, full-mesh WebRTC voice channels with
//! server-relayed signaling, and the course Ask AI helper offered inside a
//! voice channel.

pub mod api;
pub mod ask_ai;
pub mod audio;
pub mod audio_codec;
pub mod channel;
pub mod chat;
pub mod config;
pub mod media;
pub mod peer;
pub mod protocol;
pub mod rtc;
pub mod voice;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiClient, ApiError};
pub use ask_ai::{AskAi, AskAiError, AskOutcome, Delivery};
pub use channel::{ChannelSettings, Connector, TransportError, WsConnector};
pub use chat::{ChatEvent, ChatResource, ChatScope, ChatSession};
pub use config::ClientConfig;
pub use protocol::{ChatMessage, UserId};
pub use voice::{VoiceDeps, VoiceError, VoiceEvent, VoiceSession, VoiceState};
