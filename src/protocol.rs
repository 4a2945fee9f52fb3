//! Signaling Protocol
//!
//! Defines the JSON frames exchanged over the chat and voice channels.
//! Every frame set is closed: anything that does not deserialize into one of
//! the variants below is rejected at the channel boundary.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Signaling protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decode one text frame into a member of a closed frame set
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Identifier of a user as assigned by the backend.
///
/// The backend hands out integer ids but the wire format is plain JSON, so
/// string ids are accepted as well. The original form is kept when the id is
/// echoed back in a `target_user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    Numeric(i64),
    Text(String),
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserId::Numeric(id) => write!(f, "{}", id),
            UserId::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId::Numeric(id)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        UserId::Text(id.to_string())
    }
}

/// SDP message kind, as carried in the browser `RTCSessionDescription` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description exchanged in `offer` and `answer` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Entry of the initial roster enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub user_id: UserId,
}

/// Frames the voice server sends to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceFrame {
    Peers {
        #[serde(default)]
        peers: Vec<PeerEntry>,
    },
    UserJoined {
        user_id: UserId,
    },
    UserLeft {
        user_id: UserId,
    },
    Offer {
        sdp: SessionDescription,
        from_user_id: UserId,
    },
    Answer {
        sdp: SessionDescription,
        from_user_id: UserId,
    },
    Ice {
        candidate: IceCandidateInit,
        from_user_id: UserId,
    },
}

/// Frames a client sends to the voice server; the server relays them to the
/// target with `from_user_id` filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceSignal {
    Offer {
        sdp: SessionDescription,
        target_user_id: UserId,
    },
    Answer {
        sdp: SessionDescription,
        target_user_id: UserId,
    },
    Ice {
        candidate: IceCandidateInit,
        target_user_id: UserId,
    },
}

impl VoiceSignal {
    /// The participant this signal is addressed to
    pub fn target(&self) -> &UserId {
        match self {
            VoiceSignal::Offer { target_user_id, .. }
            | VoiceSignal::Answer { target_user_id, .. }
            | VoiceSignal::Ice { target_user_id, .. } => target_user_id,
        }
    }
}

/// Message composed by the local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatOutbound {
    pub content: String,
}

/// Chat message broadcast by the chat backend (also the history row shape)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user_email: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl ChatMessage {
    /// Parse the backend timestamp (ISO-8601, with or without an offset)
    pub fn parsed_timestamp(&self) -> Option<chrono::NaiveDateTime> {
        let raw = self.timestamp.as_deref()?;
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
            return Some(dt.naive_local());
        }
        raw.parse::<chrono::NaiveDateTime>().ok()
    }
}
