//! Voice Session
//!
//! Joins a voice channel, captures the microphone once, and builds a full
//! mesh of peer links through offer/answer/ICE frames relayed by the voice
//! signaling channel.
//!
//! All frames and peer events of one session are handled in order by a single
//! pump task. Every asynchronous step re-checks the session epoch before it
//! touches state, so results that arrive after a leave are dropped.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{self, ChannelSettings, Connector, Inbound, ResourceKind, SignalingChannel, TransportError};
use crate::media::{LocalStream, MediaCapture, MediaError};
use crate::peer::{
    LinkId, NegotiationError, NegotiationState, PeerConnection, PeerConnectionState, PeerConnector,
    PeerEvent, PeerEventSink, PeerRegistry,
};
use crate::protocol::{
    IceCandidateInit, SessionDescription, UserId, VoiceFrame, VoiceSignal,
};

/// Voice session errors
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Already in a voice channel")]
    AlreadyActive,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Join cancelled by leave")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Joining,
    Joined,
}

/// Session events for the UI
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    StateChanged(VoiceState),
    ParticipantJoined(UserId),
    ParticipantLeft(UserId),
    PeerConnectionState {
        user_id: UserId,
        state: PeerConnectionState,
    },
    /// The signaling channel closed while joined
    Disconnected,
}

/// The seams a voice session talks through
#[derive(Clone)]
pub struct VoiceDeps {
    pub connector: Arc<dyn Connector>,
    pub capture: Arc<dyn MediaCapture>,
    pub peers: Arc<dyn PeerConnector>,
}

type VoiceChannel = SignalingChannel<VoiceSignal>;

struct Inner {
    state: VoiceState,
    epoch: u64,
    muted: bool,
    channel_id: Option<String>,
    stream: Option<Arc<LocalStream>>,
    channel: Option<Arc<VoiceChannel>>,
    registry: PeerRegistry,
    pump: Option<JoinHandle<()>>,
}

/// What ended the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Leave,
    Failure,
    ChannelClosed,
}

struct Shared {
    deps: VoiceDeps,
    settings: ChannelSettings,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<VoiceEvent>,
    /// Set while an Ask AI query of this session is outstanding
    query_in_flight: Arc<AtomicBool>,
}

impl Shared {
    fn emit(&self, event: VoiceEvent) {
        let _ = self.events.send(event);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.inner.lock().epoch == epoch
    }

    /// Release everything the session holds and return to `Idle`.
    ///
    /// With an epoch, only tears down if that session is still the current
    /// one. Returns whether anything changed.
    fn teardown(&self, epoch: Option<u64>, cause: Teardown) -> bool {
        let (previous, stream, channel, pump) = {
            let mut inner = self.inner.lock();
            if epoch.is_some_and(|e| e != inner.epoch) || inner.state == VoiceState::Idle {
                return false;
            }
            inner.epoch += 1;
            inner.registry.clear();
            inner.channel_id = None;
            let previous = std::mem::replace(&mut inner.state, VoiceState::Idle);
            (
                previous,
                inner.stream.take(),
                inner.channel.take(),
                inner.pump.take(),
            )
        };

        if let Some(stream) = stream {
            stream.stop();
        }
        if let Some(channel) = channel {
            channel.close();
        }
        if let Some(pump) = pump {
            if cause == Teardown::Leave {
                pump.abort();
            }
        }

        info!("Voice session ended from {:?} ({:?})", previous, cause);
        if cause == Teardown::ChannelClosed {
            self.emit(VoiceEvent::Disconnected);
        }
        self.emit(VoiceEvent::StateChanged(VoiceState::Idle));
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.registry.clear();
        if let Some(stream) = inner.stream.take() {
            stream.stop();
        }
        if let Some(channel) = inner.channel.take() {
            channel.close();
        }
    }
}

/// A voice channel membership. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct VoiceSession {
    shared: Arc<Shared>,
}

impl VoiceSession {
    pub fn new(deps: VoiceDeps, settings: ChannelSettings) -> (Self, mpsc::UnboundedReceiver<VoiceEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            deps,
            settings,
            inner: Mutex::new(Inner {
                state: VoiceState::Idle,
                epoch: 0,
                muted: false,
                channel_id: None,
                stream: None,
                channel: None,
                registry: PeerRegistry::new(),
                pump: None,
            }),
            events,
            query_in_flight: Arc::new(AtomicBool::new(false)),
        });
        (Self { shared }, event_rx)
    }

    /// Join a voice channel.
    ///
    /// The microphone is acquired before the channel is opened; if capture
    /// fails no connection is attempted. A `leave` while this is in flight
    /// makes it release what it acquired and return `Cancelled`.
    pub async fn join(&self, channel_id: &str) -> Result<(), VoiceError> {
        let url = self.shared.settings.endpoint(ResourceKind::Voice, channel_id)?;

        let epoch = {
            let mut inner = self.shared.inner.lock();
            if inner.state != VoiceState::Idle {
                return Err(VoiceError::AlreadyActive);
            }
            inner.epoch += 1;
            inner.state = VoiceState::Joining;
            inner.channel_id = Some(channel_id.to_string());
            inner.epoch
        };
        self.shared.emit(VoiceEvent::StateChanged(VoiceState::Joining));
        info!("Joining voice channel {}", channel_id);

        let stream = match self.shared.deps.capture.acquire_audio().await {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                warn!("Microphone unavailable: {}", e);
                if !self.shared.teardown(Some(epoch), Teardown::Failure) {
                    return Err(VoiceError::Cancelled);
                }
                return Err(e.into());
            }
        };

        {
            let inner = self.shared.inner.lock();
            if inner.epoch != epoch {
                stream.stop();
                return Err(VoiceError::Cancelled);
            }
            stream.set_audio_enabled(!inner.muted);
        }

        let opened =
            channel::open::<VoiceFrame, VoiceSignal>(self.shared.deps.connector.as_ref(), &url).await;
        let (channel, inbound) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Voice channel {} unreachable: {}", channel_id, e);
                stream.stop();
                if !self.shared.teardown(Some(epoch), Teardown::Failure) {
                    return Err(VoiceError::Cancelled);
                }
                return Err(e.into());
            }
        };
        let channel = Arc::new(channel);

        {
            let mut inner = self.shared.inner.lock();
            if inner.epoch != epoch {
                channel.close();
                stream.stop();
                return Err(VoiceError::Cancelled);
            }
            inner.registry.clear();
            inner.state = VoiceState::Joined;
            inner.stream = Some(stream);
            inner.channel = Some(channel);
            inner.pump = Some(tokio::spawn(pump(
                Arc::downgrade(&self.shared),
                epoch,
                inbound,
            )));
        }

        info!("Joined voice channel {}", channel_id);
        self.shared.emit(VoiceEvent::StateChanged(VoiceState::Joined));
        Ok(())
    }

    /// Leave the channel from any state. Safe to call repeatedly.
    pub fn leave(&self) {
        if self.shared.teardown(None, Teardown::Leave) {
            info!("Left voice channel");
        }
    }

    /// Enable or disable outbound audio on the shared capture stream.
    ///
    /// The preference is kept and applied to the stream of later joins.
    pub fn set_muted(&self, muted: bool) {
        let mut inner = self.shared.inner.lock();
        inner.muted = muted;
        if let Some(stream) = &inner.stream {
            stream.set_audio_enabled(!muted);
        }
        debug!("Microphone {}", if muted { "muted" } else { "unmuted" });
    }

    pub fn is_muted(&self) -> bool {
        self.shared.inner.lock().muted
    }

    pub fn state(&self) -> VoiceState {
        self.shared.inner.lock().state
    }

    /// Identity of the current membership while joined.
    ///
    /// Every join and teardown moves the epoch, so a value captured before
    /// an await only matches afterwards if the same membership is still live.
    pub fn joined_epoch(&self) -> Option<u64> {
        let inner = self.shared.inner.lock();
        (inner.state == VoiceState::Joined).then_some(inner.epoch)
    }

    /// Outstanding-query flag shared by every Ask AI helper of this session
    pub(crate) fn query_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.query_in_flight)
    }

    pub fn channel_id(&self) -> Option<String> {
        self.shared.inner.lock().channel_id.clone()
    }

    /// Remote participants currently known, linked or pending
    pub fn roster(&self) -> Vec<UserId> {
        self.shared.inner.lock().registry.roster()
    }

    pub fn peer_link_count(&self) -> usize {
        self.shared.inner.lock().registry.link_count()
    }

    /// Participants announced by `user_joined` whose offer has not arrived yet
    pub fn pending_count(&self) -> usize {
        self.shared.inner.lock().registry.pending_count()
    }

    /// People in the channel including the local user, zero when not joined
    pub fn participant_count(&self) -> usize {
        let inner = self.shared.inner.lock();
        match inner.state {
            VoiceState::Joined => inner.registry.roster_len() + 1,
            _ => 0,
        }
    }

    pub fn negotiation_state(&self, remote: &UserId) -> Option<NegotiationState> {
        self.shared.inner.lock().registry.link(remote).map(|link| link.state)
    }
}

enum Step {
    Frame(VoiceFrame),
    Peer(PeerEvent),
    Closed,
}

/// Handle inbound frames and peer events of one session, in order
async fn pump(shared: Weak<Shared>, epoch: u64, mut inbound: Inbound<VoiceFrame>) {
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel::<PeerEvent>();

    loop {
        let step = tokio::select! {
            frame = inbound.next() => match frame {
                Some(frame) => Step::Frame(frame),
                None => Step::Closed,
            },
            Some(event) = peer_rx.recv() => Step::Peer(event),
        };

        let Some(session) = shared.upgrade() else {
            break;
        };
        if !session.is_current(epoch) {
            break;
        }
        let handler = Handler {
            shared: &session,
            epoch,
            peer_tx: &peer_tx,
        };

        match step {
            Step::Frame(frame) => handler.on_frame(frame).await,
            Step::Peer(event) => handler.on_peer_event(event),
            Step::Closed => {
                warn!("Voice channel closed unexpectedly");
                session.teardown(Some(epoch), Teardown::ChannelClosed);
                break;
            }
        }
    }
    debug!("Voice pump for epoch {} finished", epoch);
}

struct Handler<'a> {
    shared: &'a Shared,
    epoch: u64,
    peer_tx: &'a mpsc::UnboundedSender<PeerEvent>,
}

impl Handler<'_> {
    async fn on_frame(&self, frame: VoiceFrame) {
        match frame {
            VoiceFrame::Peers { peers } => {
                info!("Voice roster: {} participant(s) already present", peers.len());
                for entry in peers {
                    if !self.shared.is_current(self.epoch) {
                        return;
                    }
                    self.offer_to(entry.user_id).await;
                }
            }
            VoiceFrame::UserJoined { user_id } => {
                let added = {
                    let mut inner = self.shared.inner.lock();
                    inner.epoch == self.epoch && inner.registry.add_pending(user_id.clone())
                };
                if added {
                    info!("{} joined voice, awaiting their offer", user_id);
                    self.shared.emit(VoiceEvent::ParticipantJoined(user_id));
                }
            }
            VoiceFrame::UserLeft { user_id } => {
                let removed = {
                    let mut inner = self.shared.inner.lock();
                    inner.epoch == self.epoch && inner.registry.remove(&user_id)
                };
                if removed {
                    info!("{} left voice", user_id);
                    self.shared.emit(VoiceEvent::ParticipantLeft(user_id));
                }
            }
            VoiceFrame::Offer { sdp, from_user_id } => self.answer(from_user_id, sdp).await,
            VoiceFrame::Answer { sdp, from_user_id } => self.accept_answer(from_user_id, sdp).await,
            VoiceFrame::Ice {
                candidate,
                from_user_id,
            } => self.apply_candidate(from_user_id, candidate).await,
        }
    }

    fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate {
                link,
                remote,
                candidate,
            } => {
                let channel = {
                    let inner = self.shared.inner.lock();
                    if inner.registry.link_by_id(&remote, link).is_none() {
                        return;
                    }
                    inner.channel.clone()
                };
                if let Some(channel) = channel {
                    let signal = VoiceSignal::Ice {
                        candidate,
                        target_user_id: remote,
                    };
                    if let Err(e) = channel.send(&signal) {
                        debug!("Candidate not sent: {}", e);
                    }
                }
            }
            PeerEvent::RemoteTrack { link, remote } => {
                info!("Receiving audio from {} ({})", remote, link);
            }
            PeerEvent::StateChanged {
                link,
                remote,
                state,
            } => {
                let (current, removed) = {
                    let mut inner = self.shared.inner.lock();
                    let current = inner.registry.link_by_id(&remote, link).is_some();
                    let removed = current
                        && state == PeerConnectionState::Closed
                        && inner.registry.remove_link(&remote, link);
                    (current, removed)
                };
                if !current {
                    return;
                }
                debug!("Peer {} connection {:?}", remote, state);
                self.shared.emit(VoiceEvent::PeerConnectionState {
                    user_id: remote.clone(),
                    state,
                });
                if removed {
                    info!("Peer connection to {} closed", remote);
                    self.shared.emit(VoiceEvent::ParticipantLeft(remote));
                }
            }
        }
    }

    /// Create a link for `remote` with the local tracks attached.
    ///
    /// Returns `None` if the participant is already linked or the session moved on.
    async fn open_link(
        &self,
        remote: &UserId,
    ) -> Option<(LinkId, Arc<dyn PeerConnection>, Arc<VoiceChannel>)> {
        let (link, stream, channel) = {
            let mut inner = self.shared.inner.lock();
            if inner.epoch != self.epoch || inner.registry.is_linked(remote) {
                return None;
            }
            let stream = inner.stream.clone()?;
            let channel = inner.channel.clone()?;
            (inner.registry.allocate_link(), stream, channel)
        };

        let sink = PeerEventSink::new(link, remote.clone(), self.peer_tx.clone());
        let connection = match self.shared.deps.peers.connect(sink).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Could not create peer connection for {}: {}", remote, e);
                return None;
            }
        };

        let newcomer = {
            let mut inner = self.shared.inner.lock();
            if inner.epoch != self.epoch {
                None
            } else {
                let newcomer = !inner.registry.contains(remote);
                match inner.registry.insert_link(link, remote.clone(), Arc::clone(&connection)) {
                    Ok(()) => Some(newcomer),
                    Err(_) => None,
                }
            }
        };
        let Some(newcomer) = newcomer else {
            connection.close();
            return None;
        };
        if newcomer {
            self.shared.emit(VoiceEvent::ParticipantJoined(remote.clone()));
        }

        for track in stream.tracks() {
            if let Err(e) = connection.add_track(Arc::clone(track)).await {
                self.negotiation_failed(remote, e);
                return None;
            }
        }
        Some((link, connection, channel))
    }

    async fn offer_to(&self, remote: UserId) {
        let Some((link, connection, channel)) = self.open_link(&remote).await else {
            return;
        };

        let offer = match create_local_offer(connection.as_ref()).await {
            Ok(offer) => offer,
            Err(e) => return self.negotiation_failed(&remote, e),
        };
        if !self.set_state(&remote, link, NegotiationState::HaveLocalOffer) {
            return;
        }

        debug!("Sending offer to {}", remote);
        let signal = VoiceSignal::Offer {
            sdp: offer,
            target_user_id: remote,
        };
        if let Err(e) = channel.send(&signal) {
            warn!("Offer not sent: {}", e);
        }
    }

    async fn answer(&self, remote: UserId, offer: SessionDescription) {
        let linked = self.shared.inner.lock().registry.is_linked(&remote);
        if linked {
            debug!("Ignoring offer from {}: already linked", remote);
            return;
        }
        let Some((link, connection, channel)) = self.open_link(&remote).await else {
            return;
        };

        if let Err(e) = connection.set_remote_description(offer).await {
            return self.negotiation_failed(&remote, e);
        }
        if !self.set_state(&remote, link, NegotiationState::HaveRemoteOffer) {
            return;
        }

        let answer = match create_local_answer(connection.as_ref()).await {
            Ok(answer) => answer,
            Err(e) => return self.negotiation_failed(&remote, e),
        };
        if !self.set_state(&remote, link, NegotiationState::Stable) {
            return;
        }

        debug!("Sending answer to {}", remote);
        let signal = VoiceSignal::Answer {
            sdp: answer,
            target_user_id: remote,
        };
        if let Err(e) = channel.send(&signal) {
            warn!("Answer not sent: {}", e);
        }
    }

    async fn accept_answer(&self, remote: UserId, answer: SessionDescription) {
        let target = {
            let inner = self.shared.inner.lock();
            match inner.registry.link(&remote) {
                Some(link) if link.state == NegotiationState::HaveLocalOffer => {
                    Some((link.id, Arc::clone(&link.connection)))
                }
                Some(link) => {
                    debug!("Ignoring answer from {} in state {:?}", remote, link.state);
                    None
                }
                None => {
                    debug!("Ignoring answer from unknown peer {}", remote);
                    None
                }
            }
        };
        let Some((link, connection)) = target else {
            return;
        };

        match connection.set_remote_description(answer).await {
            Ok(()) => {
                self.set_state(&remote, link, NegotiationState::Stable);
            }
            Err(e) => self.negotiation_failed(&remote, e),
        }
    }

    async fn apply_candidate(&self, remote: UserId, candidate: IceCandidateInit) {
        let connection = self
            .shared
            .inner
            .lock()
            .registry
            .link(&remote)
            .map(|link| Arc::clone(&link.connection));
        match connection {
            Some(connection) => {
                if let Err(e) = connection.add_ice_candidate(candidate).await {
                    debug!("Ignoring candidate from {}: {}", remote, e);
                }
            }
            None => debug!("Ignoring candidate from unknown peer {}", remote),
        }
    }

    fn set_state(&self, remote: &UserId, link: LinkId, state: NegotiationState) -> bool {
        let mut inner = self.shared.inner.lock();
        inner.epoch == self.epoch && inner.registry.set_state(remote, link, state)
    }

    fn negotiation_failed(&self, remote: &UserId, error: NegotiationError) {
        warn!("Negotiation with {} failed: {}", remote, error);
    }
}

async fn create_local_offer(
    connection: &dyn PeerConnection,
) -> Result<SessionDescription, NegotiationError> {
    let offer = connection.create_offer().await?;
    connection.set_local_description(offer.clone()).await?;
    Ok(offer)
}

async fn create_local_answer(
    connection: &dyn PeerConnection,
) -> Result<SessionDescription, NegotiationError> {
    let answer = connection.create_answer().await?;
    connection.set_local_description(answer.clone()).await?;
    Ok(answer)
}
