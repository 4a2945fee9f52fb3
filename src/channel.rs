//! Signaling Channel
//!
//! A per-resource persistent message channel carrying typed JSON frames.
//! The transport is reached through a [`Connector`]; the channel itself only
//! deals with text frames, the connected flag and frame validation.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::protocol;

/// Transport-level errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Kind of resource a channel is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Course,
    Group,
    Voice,
}

impl ResourceKind {
    fn path_segment(self) -> &'static str {
        match self {
            ResourceKind::Course => "course",
            ResourceKind::Group => "group",
            ResourceKind::Voice => "voice",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// Where channels are opened and how they authenticate
#[derive(Clone)]
pub struct ChannelSettings {
    pub ws_base: Url,
    pub token: String,
}

impl fmt::Debug for ChannelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSettings")
            .field("ws_base", &self.ws_base.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

impl ChannelSettings {
    pub fn new(ws_base: Url, token: impl Into<String>) -> Self {
        Self {
            ws_base,
            token: token.into(),
        }
    }

    /// Endpoint for one resource: `{base}/ws/{kind}/{id}?token=...`
    pub fn endpoint(&self, kind: ResourceKind, resource_id: &str) -> Result<Url, TransportError> {
        if resource_id.is_empty() {
            return Err(TransportError::InvalidEndpoint("empty resource id".to_string()));
        }

        let mut url = self.ws_base.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidEndpoint(self.ws_base.to_string()))?
            .pop_if_empty()
            .extend(&["ws", kind.path_segment(), resource_id]);
        url.set_query(None);
        if !self.token.is_empty() {
            url.query_pairs_mut().append_pair("token", &self.token);
        }
        Ok(url)
    }
}

/// Url with the token query parameter stripped, for logging
fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

/// Both directions of an established transport connection.
///
/// The inbound side yields text frames until the transport closes; dropping
/// the outbound sender closes the connection.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens transport connections to signaling endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<TransportLink, TransportError>;
}

/// WebSocket connector
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<TransportLink, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let endpoint = redacted(url);

        // Forward outbound frames; a dropped sender closes the socket
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_write.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if inbound_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => {
                        info!("Server closed channel {}", endpoint);
                        break;
                    }
                    Err(e) => {
                        warn!("WebSocket error on {}: {}", endpoint, e);
                        break;
                    }
                    _ => {}
                }
            }
            writer.abort();
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Open a channel at `url` and split it into its sending handle and its
/// inbound frame stream.
pub async fn open<In, Out>(
    connector: &dyn Connector,
    url: &Url,
) -> Result<(SignalingChannel<Out>, Inbound<In>), TransportError>
where
    In: DeserializeOwned,
    Out: Serialize,
{
    let link = connector.connect(url).await?;
    let endpoint = redacted(url);
    info!("Channel connected: {}", endpoint);

    let (state, _) = watch::channel(true);
    let state = Arc::new(state);

    let channel = SignalingChannel {
        endpoint: endpoint.clone(),
        outbound: Mutex::new(Some(link.outbound)),
        state: Arc::clone(&state),
        _frames: PhantomData,
    };
    let inbound = Inbound {
        endpoint,
        rx: link.inbound,
        state_rx: state.subscribe(),
        state,
        _frames: PhantomData,
    };
    Ok((channel, inbound))
}

/// Sending half of an open channel
pub struct SignalingChannel<Out> {
    endpoint: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    state: Arc<watch::Sender<bool>>,
    _frames: PhantomData<fn(Out)>,
}

impl<Out: Serialize> SignalingChannel<Out> {
    /// Serialize and send one frame
    pub fn send(&self, frame: &Out) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)?;
        let outbound = self.outbound.lock();
        let sender = outbound.as_ref().ok_or(TransportError::NotConnected)?;
        if !*self.state.borrow() || sender.send(text).is_err() {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }
}

impl<Out> SignalingChannel<Out> {
    pub fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    /// Observe the connected flag
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Close the channel. Safe to call more than once.
    pub fn close(&self) {
        if self.outbound.lock().take().is_some() {
            info!("Channel closed: {}", self.endpoint);
        }
        self.state.send_replace(false);
    }
}

impl<Out> Drop for SignalingChannel<Out> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receiving half of an open channel
pub struct Inbound<In> {
    endpoint: String,
    rx: mpsc::UnboundedReceiver<String>,
    state: Arc<watch::Sender<bool>>,
    state_rx: watch::Receiver<bool>,
    _frames: PhantomData<fn() -> In>,
}

impl<In: DeserializeOwned> Inbound<In> {
    /// Next valid frame, or `None` once the channel is closed.
    ///
    /// Frames that fail to parse are dropped here and never reach the caller.
    pub async fn next(&mut self) -> Option<In> {
        loop {
            if !*self.state_rx.borrow_and_update() {
                return None;
            }

            tokio::select! {
                text = self.rx.recv() => match text {
                    Some(text) => match protocol::decode::<In>(&text) {
                        Ok(frame) => return Some(frame),
                        Err(e) => {
                            debug!("Dropping frame on {}: {}", self.endpoint, e);
                        }
                    },
                    None => {
                        if self.state.send_replace(false) {
                            info!("Channel disconnected: {}", self.endpoint);
                        }
                        return None;
                    }
                },
                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}
