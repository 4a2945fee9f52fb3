//! Chat Session
//!
//! Text chat scoped to one course or study group. Messages are sent
//! fire-and-forget and only appear in the transcript once the server
//! broadcasts them back.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{self, ChannelSettings, Connector, Inbound, ResourceKind, SignalingChannel, TransportError};
use crate::protocol::{ChatMessage, ChatOutbound};

/// Chat session errors
#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Join cancelled by leave")]
    Cancelled,
}

/// What a chat belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatScope {
    Course,
    Group,
}

impl ChatScope {
    pub fn resource_kind(self) -> ResourceKind {
        match self {
            ChatScope::Course => ResourceKind::Course,
            ChatScope::Group => ResourceKind::Group,
        }
    }

    /// REST collection name
    pub fn collection(self) -> &'static str {
        match self {
            ChatScope::Course => "courses",
            ChatScope::Group => "groups",
        }
    }
}

impl fmt::Display for ChatScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.resource_kind(), f)
    }
}

/// A course or group known to exist on the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatResource {
    pub scope: ChatScope,
    pub id: String,
    pub name: Option<String>,
}

impl ChatResource {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{} {}", self.scope, self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Connected(ChatResource),
    Message(ChatMessage),
    /// The channel closed without a local leave
    Disconnected,
}

type ChatChannel = SignalingChannel<ChatOutbound>;

#[derive(Default)]
struct ChatInner {
    epoch: u64,
    resource: Option<ChatResource>,
    channel: Option<Arc<ChatChannel>>,
    transcript: Vec<ChatMessage>,
    pump: Option<JoinHandle<()>>,
}

struct ChatShared {
    connector: Arc<dyn Connector>,
    settings: ChannelSettings,
    max_message_length: usize,
    inner: Mutex<ChatInner>,
    events: mpsc::UnboundedSender<ChatEvent>,
}

impl ChatShared {
    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}

/// Chat for one resource at a time
#[derive(Clone)]
pub struct ChatSession {
    shared: Arc<ChatShared>,
}

impl ChatSession {
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: ChannelSettings,
        max_message_length: usize,
    ) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChatShared {
            connector,
            settings,
            max_message_length,
            inner: Mutex::new(ChatInner::default()),
            events,
        });
        (Self { shared }, event_rx)
    }

    /// Open the chat of `resource`, seeding the transcript with `history`.
    ///
    /// Any chat already open is left first. If the channel cannot be opened
    /// the history stays visible and the session is disconnected.
    pub async fn join(
        &self,
        resource: ChatResource,
        history: Vec<ChatMessage>,
    ) -> Result<(), ChatError> {
        self.leave();
        let url = self
            .shared
            .settings
            .endpoint(resource.scope.resource_kind(), &resource.id)?;

        let epoch = {
            let mut inner = self.shared.inner.lock();
            inner.epoch += 1;
            inner.resource = Some(resource.clone());
            inner.transcript = history;
            inner.epoch
        };

        let (channel, inbound) =
            match channel::open::<ChatMessage, ChatOutbound>(self.shared.connector.as_ref(), &url).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Chat for {} unavailable: {}", resource.display_name(), e);
                    return Err(e.into());
                }
            };
        let channel = Arc::new(channel);

        {
            let mut inner = self.shared.inner.lock();
            if inner.epoch != epoch {
                channel.close();
                return Err(ChatError::Cancelled);
            }
            inner.channel = Some(channel);
            inner.pump = Some(tokio::spawn(pump(
                Arc::downgrade(&self.shared),
                epoch,
                inbound,
            )));
        }

        info!("Chat connected: {}", resource.display_name());
        self.shared.emit(ChatEvent::Connected(resource));
        Ok(())
    }

    /// Send a message. Returns whether anything was sent.
    ///
    /// Blank text and a disconnected channel are silent no-ops. The text is
    /// trimmed and clamped to the backend's maximum length.
    pub fn send_message(&self, text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return false;
        }
        let Some(channel) = self.connected_channel() else {
            debug!("Chat message dropped: not connected");
            return false;
        };

        let content: String = trimmed.chars().take(self.shared.max_message_length).collect();
        match channel.send(&ChatOutbound { content }) {
            Ok(()) => true,
            Err(e) => {
                debug!("Chat message not sent: {}", e);
                false
            }
        }
    }

    fn connected_channel(&self) -> Option<Arc<ChatChannel>> {
        self.shared
            .inner
            .lock()
            .channel
            .as_ref()
            .filter(|channel| channel.is_connected())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.connected_channel().is_some()
    }

    pub fn resource(&self) -> Option<ChatResource> {
        self.shared.inner.lock().resource.clone()
    }

    /// Messages in arrival order, history first
    pub fn transcript(&self) -> Vec<ChatMessage> {
        self.shared.inner.lock().transcript.clone()
    }

    /// Close the chat and forget its transcript. Safe to call repeatedly.
    pub fn leave(&self) {
        let (channel, pump, resource) = {
            let mut inner = self.shared.inner.lock();
            inner.epoch += 1;
            inner.transcript.clear();
            (inner.channel.take(), inner.pump.take(), inner.resource.take())
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(channel) = channel {
            channel.close();
        }
        if let Some(resource) = resource {
            info!("Left chat: {}", resource.display_name());
        }
    }
}

async fn pump(shared: Weak<ChatShared>, epoch: u64, mut inbound: Inbound<ChatMessage>) {
    loop {
        let frame = inbound.next().await;
        let Some(session) = shared.upgrade() else {
            break;
        };

        let Some(message) = frame else {
            let current = session.inner.lock().epoch == epoch;
            if current {
                warn!("Chat channel closed");
                session.emit(ChatEvent::Disconnected);
            }
            break;
        };

        {
            let mut inner = session.inner.lock();
            if inner.epoch != epoch {
                break;
            }
            inner.transcript.push(message.clone());
        }
        session.emit(ChatEvent::Message(message));
    }
}
