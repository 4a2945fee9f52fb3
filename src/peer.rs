//! Peer Links
//!
//! The peer connection seam and the registry of remote participants owned by
//! a voice session.

use async_trait::async_trait;
use log::debug;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::LocalTrack;
use crate::protocol::{IceCandidateInit, SessionDescription, UserId};

/// ICE/SDP failures for a single peer
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Peer connection setup failed: {0}")]
    Setup(String),
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),
    #[error("Negotiation failed: {0}")]
    Failed(String),
    #[error("Peer connection closed")]
    Closed,
}

/// Where a link stands in its offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    /// Local offer sent, awaiting the answer
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

/// Connectivity of the underlying peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Identity of one PeerLink instance; never reused within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Events raised by a peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate {
        link: LinkId,
        remote: UserId,
        candidate: IceCandidateInit,
    },
    RemoteTrack {
        link: LinkId,
        remote: UserId,
    },
    StateChanged {
        link: LinkId,
        remote: UserId,
        state: PeerConnectionState,
    },
}

/// Handle a peer connection uses to report events for its link
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    link: LinkId,
    remote: UserId,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(link: LinkId, remote: UserId, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { link, remote, tx }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    pub fn local_candidate(&self, candidate: IceCandidateInit) {
        let _ = self.tx.send(PeerEvent::LocalCandidate {
            link: self.link,
            remote: self.remote.clone(),
            candidate,
        });
    }

    pub fn remote_track(&self) {
        let _ = self.tx.send(PeerEvent::RemoteTrack {
            link: self.link,
            remote: self.remote.clone(),
        });
    }

    pub fn state_changed(&self, state: PeerConnectionState) {
        let _ = self.tx.send(PeerEvent::StateChanged {
            link: self.link,
            remote: self.remote.clone(),
            state,
        });
    }
}

/// One direct connection to a remote participant
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach a local track; the track is shared, not copied
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), NegotiationError>;
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), NegotiationError>;
    /// Close the connection. Closing twice is a no-op.
    fn close(&self);
}

/// Creates peer connections
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

/// A remote participant's connection and its negotiation state
pub struct PeerLink {
    pub id: LinkId,
    pub remote: UserId,
    pub connection: Arc<dyn PeerConnection>,
    pub state: NegotiationState,
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state)
            .finish()
    }
}

enum Slot {
    /// Known participant waiting for its offer
    Pending,
    Linked(PeerLink),
}

/// Roster and PeerLinks of one voice session, keyed by participant.
///
/// Every roster entry is either pending or owns exactly one link, so the
/// link count is always the roster size minus the pending entries.
#[derive(Default)]
pub struct PeerRegistry {
    slots: BTreeMap<UserId, Slot>,
    next_link: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a link id for a connection about to be created
    pub fn allocate_link(&mut self) -> LinkId {
        self.next_link += 1;
        LinkId(self.next_link)
    }

    /// Add a participant without a link. Returns false if already known.
    pub fn add_pending(&mut self, remote: UserId) -> bool {
        if self.slots.contains_key(&remote) {
            return false;
        }
        self.slots.insert(remote, Slot::Pending);
        true
    }

    /// Attach a link to a participant.
    ///
    /// Fails, handing the connection back, if the participant already has one.
    pub fn insert_link(
        &mut self,
        id: LinkId,
        remote: UserId,
        connection: Arc<dyn PeerConnection>,
    ) -> Result<(), Arc<dyn PeerConnection>> {
        if self.is_linked(&remote) {
            return Err(connection);
        }
        let link = PeerLink {
            id,
            remote: remote.clone(),
            connection,
            state: NegotiationState::New,
        };
        self.slots.insert(remote, Slot::Linked(link));
        Ok(())
    }

    pub fn contains(&self, remote: &UserId) -> bool {
        self.slots.contains_key(remote)
    }

    pub fn is_linked(&self, remote: &UserId) -> bool {
        matches!(self.slots.get(remote), Some(Slot::Linked(_)))
    }

    pub fn link(&self, remote: &UserId) -> Option<&PeerLink> {
        match self.slots.get(remote) {
            Some(Slot::Linked(link)) => Some(link),
            _ => None,
        }
    }

    /// The link for `remote`, only if it is still the instance `id`
    pub fn link_by_id(&self, remote: &UserId, id: LinkId) -> Option<&PeerLink> {
        self.link(remote).filter(|link| link.id == id)
    }

    /// Move link `id` to `state`; false if the link is gone or replaced
    pub fn set_state(&mut self, remote: &UserId, id: LinkId, state: NegotiationState) -> bool {
        match self.slots.get_mut(remote) {
            Some(Slot::Linked(link)) if link.id == id => {
                debug!("{} {} -> {:?}", link.id, remote, state);
                link.state = state;
                true
            }
            _ => false,
        }
    }

    /// Remove a participant, closing its link. Idempotent.
    pub fn remove(&mut self, remote: &UserId) -> bool {
        match self.slots.remove(remote) {
            Some(Slot::Linked(mut link)) => {
                link.state = NegotiationState::Closed;
                link.connection.close();
                true
            }
            Some(Slot::Pending) => true,
            None => false,
        }
    }

    /// Remove `remote` only if its link is still instance `id`
    pub fn remove_link(&mut self, remote: &UserId, id: LinkId) -> bool {
        if self.link_by_id(remote, id).is_some() {
            self.remove(remote)
        } else {
            false
        }
    }

    /// Close every link and forget every participant
    pub fn clear(&mut self) {
        let remotes: Vec<UserId> = self.slots.keys().cloned().collect();
        for remote in remotes {
            self.remove(&remote);
        }
    }

    pub fn roster(&self) -> Vec<UserId> {
        self.slots.keys().cloned().collect()
    }

    pub fn roster_len(&self) -> usize {
        self.slots.len()
    }

    pub fn link_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Linked(_)))
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.roster_len() - self.link_count()
    }
}
