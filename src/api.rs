//! REST Collaborator
//!
//! The few backend endpoints the realtime features lean on: resource lookup,
//! chat history and the course AI voice query.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::chat::{ChatResource, ChatScope};
use crate::config::ClientConfig;
use crate::protocol::ChatMessage;

/// Largest history page the backend serves
pub const MAX_HISTORY_LIMIT: u32 = 200;

/// REST errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Network(String),
    #[error("{detail} (HTTP {status})")]
    Status { status: u16, detail: String },
    #[error("Unexpected response: {0}")]
    Parse(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Answer returned by the course AI endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiAnswer {
    pub answer: String,
    /// Synthesized speech, base64 encoded MP3
    #[serde(default)]
    pub audio_base64: Option<String>,
}

impl AiAnswer {
    /// Decoded audio bytes, if the answer carries any
    pub fn audio(&self) -> Result<Option<Vec<u8>>, ApiError> {
        match self.audio_base64.as_deref() {
            None | Some("") => Ok(None),
            Some(encoded) => BASE64
                .decode(encoded)
                .map(Some)
                .map_err(|e| ApiError::Parse(format!("audio: {}", e))),
        }
    }
}

#[derive(Serialize)]
struct VoiceQuery<'a> {
    question: &'a str,
}

#[derive(Deserialize)]
struct ResourceRow {
    #[serde(default)]
    name: Option<String>,
}

/// Extract the user-facing message from an error body.
///
/// The backend sends `{"detail": "..."}` or, for validation failures,
/// `{"detail": [{"msg": "...", "loc": [...]}]}`.
pub fn error_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        serde_json::Value::String(detail) => Some(detail.clone()),
        serde_json::Value::Array(items) => items
            .iter()
            .find_map(|item| item.get("msg").and_then(|m| m.as_str()))
            .map(str::to_string),
        _ => None,
    }
}

/// Backend REST client
#[derive(Clone)]
pub struct ApiClient {
    base: Url,
    token: Option<String>,
    http: reqwest::Client,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base", &self.base.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ApiClient {
    pub fn new(base: Url, token: Option<String>, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self { base, token, http })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ApiError> {
        let base = config
            .api_base()
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        Self::new(
            base,
            config.token.clone(),
            Duration::from_secs(config.ai.request_timeout_secs),
        )
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn history_url(&self, scope: ChatScope, id: &str, limit: u32) -> Result<Url, ApiError> {
        let mut url = self.endpoint(&[scope.collection(), id, "messages"])?;
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = error_detail(&body)
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| "Request failed".to_string());
        Err(ApiError::Status {
            status: status.as_u16(),
            detail,
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        response
            .json()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }

    /// Look up a course or group; fails if it does not exist or is not visible
    pub async fn fetch_resource(&self, scope: ChatScope, id: &str) -> Result<ChatResource, ApiError> {
        let url = self.endpoint(&[scope.collection(), id])?;
        debug!("GET {}", url);
        let row: ResourceRow = Self::json(self.send(self.http.get(url)).await?).await?;
        Ok(ChatResource {
            scope,
            id: id.to_string(),
            name: row.name,
        })
    }

    /// Most recent chat messages of a resource, oldest first
    pub async fn fetch_messages(
        &self,
        scope: ChatScope,
        id: &str,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        let url = self.history_url(scope, id, limit)?;
        debug!("GET {}", url.path());
        Self::json(self.send(self.http.get(url)).await?).await
    }

    /// Ask the course AI a question
    pub async fn voice_query(&self, course_id: &str, question: &str) -> Result<AiAnswer, ApiError> {
        let url = self.endpoint(&["courses", course_id, "ai", "voice-query"])?;
        debug!("POST {}", url.path());
        let request = self.http.post(url).json(&VoiceQuery { question });
        Self::json(self.send(request).await?).await
    }
}
