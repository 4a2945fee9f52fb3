//! In-memory stand-ins for the transport, capture and peer seams.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use url::Url;

use crate::channel::{Connector, TransportError, TransportLink};
use crate::media::{LocalStream, LocalTrack, MediaCapture, MediaError};
use crate::peer::{NegotiationError, PeerConnection, PeerConnectionState, PeerConnector, PeerEventSink};
use crate::protocol::{
    IceCandidateInit, PeerEntry, SessionDescription, UserId, VoiceFrame, VoiceSignal,
};

const WAIT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds, panicking after a few seconds
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within {:?}", WAIT);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Connector whose connections are picked up in-process through `accept`
pub(crate) struct MemoryConnector {
    accepted_tx: mpsc::UnboundedSender<ServerEnd>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEnd>>,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub(crate) fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            refuse: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }
    }

    pub(crate) fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Connection attempts, refused ones included
    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Server side of the next connection
    pub(crate) async fn accept(&self) -> ServerEnd {
        let mut rx = self.accepted_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .ok()
            .flatten()
            .expect("no connection accepted")
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<TransportLink, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed("connection refused".into()));
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let _ = self.accepted_tx.send(ServerEnd {
            url: url.clone(),
            rx: server_rx,
            tx: server_tx,
        });
        Ok(TransportLink {
            outbound: client_tx,
            inbound: client_rx,
        })
    }
}

/// Server half of an in-memory connection. Dropping it closes the connection.
pub(crate) struct ServerEnd {
    pub url: Url,
    rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<String>,
}

impl ServerEnd {
    /// Next frame from the client; `None` once the client closed or after a timeout
    pub(crate) async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(WAIT, self.rx.recv()).await.ok().flatten()
    }

    pub(crate) fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    pub(crate) async fn recv_signal(&mut self) -> VoiceSignal {
        let text = self.recv().await.expect("client sent nothing");
        serde_json::from_str(&text).expect("not a voice signal")
    }

    pub(crate) fn send_text(&self, text: &str) {
        let _ = self.tx.send(text.to_string());
    }

    pub(crate) fn send_json<T: Serialize>(&self, frame: &T) {
        let text = serde_json::to_string(frame).expect("frame serializes");
        self.send_text(&text);
    }
}

/// Capture that hands out silent tracks, optionally failing or blocking
#[derive(Default)]
pub(crate) struct FakeCapture {
    fail: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    tracks: Mutex<Vec<Arc<LocalTrack>>>,
    acquisitions: AtomicUsize,
}

impl FakeCapture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make every acquisition fail with a permission error
    pub(crate) fn deny(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Hold acquisitions until the returned gate is notified
    pub(crate) fn gate(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&notify));
        notify
    }

    pub(crate) fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub(crate) fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.tracks.lock().clone()
    }

    pub(crate) fn last_track(&self) -> Arc<LocalTrack> {
        self.tracks.lock().last().cloned().expect("no track captured")
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn acquire_audio(&self) -> Result<LocalStream, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        let track = Arc::new(LocalTrack::new());
        self.tracks.lock().push(Arc::clone(&track));
        Ok(LocalStream::new(vec![track]))
    }
}

/// Scripted peer connection recording what the session does to it
pub(crate) struct FakePeer {
    remote: UserId,
    events: Option<PeerEventSink>,
    emit_candidates: bool,
    tracks: Mutex<Vec<Arc<LocalTrack>>>,
    local: Mutex<Vec<SessionDescription>>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidateInit>>,
    closed: AtomicBool,
}

impl FakePeer {
    pub(crate) fn new(remote: UserId) -> Self {
        Self::build(remote, None, false)
    }

    fn build(remote: UserId, events: Option<PeerEventSink>, emit_candidates: bool) -> Self {
        Self {
            remote,
            events,
            emit_candidates,
            tracks: Mutex::new(Vec::new()),
            local: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn remote(&self) -> &UserId {
        &self.remote
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.tracks.lock().clone()
    }

    pub(crate) fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.local.lock().clone()
    }

    pub(crate) fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().clone()
    }

    pub(crate) fn candidates(&self) -> Vec<IceCandidateInit> {
        self.candidates.lock().clone()
    }

    /// Report a connectivity change as the underlying connection would
    pub(crate) fn emit_state(&self, state: PeerConnectionState) {
        if let Some(events) = &self.events {
            events.state_changed(state);
        }
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.is_closed() {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.tracks.lock().push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!("offer-for-{}", self.remote)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if self.remote_descriptions.lock().is_empty() {
            return Err(NegotiationError::Failed("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!("answer-for-{}", self.remote)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.local.lock().push(desc);
        if let (true, Some(events)) = (self.emit_candidates, &self.events) {
            events.local_candidate(IceCandidateInit {
                candidate: format!("candidate-to-{}", self.remote),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            });
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.remote_descriptions.lock().push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if candidate.candidate == "bad" {
            return Err(NegotiationError::Failed("unparseable candidate".into()));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`FakePeer`]s and keeps every one it created
#[derive(Default)]
pub(crate) struct FakePeerConnector {
    emit_candidates: bool,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Peers gather one local candidate whenever a local description is set
    pub(crate) fn with_candidates() -> Self {
        Self {
            emit_candidates: true,
            ..Self::default()
        }
    }

    pub(crate) fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    /// Most recent peer created for `remote`
    pub(crate) fn peer_for(&self, remote: impl Into<UserId>) -> Arc<FakePeer> {
        let remote = remote.into();
        self.peers
            .lock()
            .iter()
            .rev()
            .find(|p| p.remote() == &remote)
            .cloned()
            .expect("no peer for remote")
    }

    pub(crate) fn open_count(&self) -> usize {
        self.peers.lock().iter().filter(|p| !p.is_closed()).count()
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn connect(
        &self,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let peer = Arc::new(FakePeer::build(
            events.remote().clone(),
            Some(events),
            self.emit_candidates,
        ));
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

#[derive(Default)]
struct HubState {
    next_id: i64,
    members: BTreeMap<i64, mpsc::UnboundedSender<String>>,
    offers: Vec<(i64, i64)>,
}

impl HubState {
    fn deliver(&self, to: i64, frame: &VoiceFrame) {
        if let (Some(tx), Ok(text)) = (self.members.get(&to), serde_json::to_string(frame)) {
            let _ = tx.send(text);
        }
    }

    fn broadcast(&self, frame: &VoiceFrame) {
        for id in self.members.keys() {
            self.deliver(*id, frame);
        }
    }
}

/// In-process voice relay: numbers members from 1 in connect order, sends
/// the roster to newcomers, announces joins and leaves, and routes signals
/// to their target with the sender filled in.
#[derive(Default)]
pub(crate) struct VoiceHub {
    state: Arc<Mutex<HubState>>,
}

impl VoiceHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    pub(crate) fn offers_sent_by(&self, from: i64) -> usize {
        self.state.lock().offers.iter().filter(|(f, _)| *f == from).count()
    }

    pub(crate) fn offers_between(&self, from: i64, to: i64) -> usize {
        self.state
            .lock()
            .offers
            .iter()
            .filter(|(f, t)| *f == from && *t == to)
            .count()
    }
}

#[async_trait]
impl Connector for VoiceHub {
    async fn connect(&self, _url: &Url) -> Result<TransportLink, TransportError> {
        let (client_tx, mut server_rx) = mpsc::unbounded_channel::<String>();
        let (server_tx, client_rx) = mpsc::unbounded_channel::<String>();

        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = state.next_id;
            let peers = state
                .members
                .keys()
                .map(|member| PeerEntry {
                    user_id: UserId::Numeric(*member),
                })
                .collect();
            state.broadcast(&VoiceFrame::UserJoined {
                user_id: UserId::Numeric(id),
            });
            state.members.insert(id, server_tx);
            state.deliver(id, &VoiceFrame::Peers { peers });
            id
        };

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(text) = server_rx.recv().await {
                let Ok(signal) = serde_json::from_str::<VoiceSignal>(&text) else {
                    continue;
                };
                let &UserId::Numeric(target) = signal.target() else {
                    continue;
                };
                let from_user_id = UserId::Numeric(id);
                let frame = match signal {
                    VoiceSignal::Offer { sdp, .. } => VoiceFrame::Offer { sdp, from_user_id },
                    VoiceSignal::Answer { sdp, .. } => VoiceFrame::Answer { sdp, from_user_id },
                    VoiceSignal::Ice { candidate, .. } => VoiceFrame::Ice {
                        candidate,
                        from_user_id,
                    },
                };
                let mut state = state.lock();
                if matches!(frame, VoiceFrame::Offer { .. }) {
                    state.offers.push((id, target));
                }
                state.deliver(target, &frame);
            }

            let mut state = state.lock();
            state.members.remove(&id);
            state.broadcast(&VoiceFrame::UserLeft {
                user_id: UserId::Numeric(id),
            });
        });

        Ok(TransportLink {
            outbound: client_tx,
            inbound: client_rx,
        })
    }
}
