//! WebRTC peer connections
//!
//! [`PeerConnector`] backed by webrtc-rs. Local Opus frames from the shared
//! capture track are written as samples; remote audio is decoded and played
//! on the default output device.

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::RemotePlayback;
use crate::audio_codec::OpusDecoder;
use crate::config::{AudioConfig, IceServerConfig};
use crate::media::LocalTrack;
use crate::peer::{
    NegotiationError, PeerConnection, PeerConnectionState, PeerConnector, PeerEventSink,
};
use crate::protocol::{IceCandidateInit, SdpKind, SessionDescription, UserId};

const STREAM_ID: &str = "studyconnect-voice";

fn setup_error(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Setup(e.to_string())
}

fn failed(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Failed(e.to_string())
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            return Err(NegotiationError::InvalidDescription(
                "rollback is not supported".to_string(),
            ))
        }
    };
    parsed.map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(NegotiationError::InvalidDescription(
                "unspecified description type".to_string(),
            ))
        }
    };
    Ok(SessionDescription { kind, sdp: desc.sdp })
}

fn to_rtc_candidate(candidate: IceCandidateInit) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(candidate: RTCIceCandidateInit) -> IceCandidateInit {
    IceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn connection_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Creates webrtc-rs peer connections sharing one media engine setup
pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    audio: AudioConfig,
    play_remote_audio: bool,
}

impl WebRtcConnector {
    pub fn new(ice_servers: &[IceServerConfig], audio: AudioConfig) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup_error)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(setup_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api,
            ice_servers,
            audio,
            play_remote_audio: true,
        })
    }

    /// Keep received audio off the output device
    pub fn without_playback(mut self) -> Self {
        self.play_remote_audio = false;
        self
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(setup_error)?);

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.local_candidate(from_rtc_candidate(init)),
                    Err(e) => debug!("Skipping local candidate: {}", e),
                }
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                if let Some(state) = connection_state(state) {
                    sink.state_changed(state);
                }
            })
        }));

        let sink = events.clone();
        let audio = self.audio.clone();
        let play = self.play_remote_audio;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = sink.clone();
            let audio = audio.clone();
            Box::pin(async move {
                sink.remote_track();
                if play && track.kind() == RTPCodecType::Audio {
                    tokio::spawn(play_remote(track, sink.remote().clone(), audio));
                }
            })
        }));

        debug!("Peer connection created for {}", events.remote());
        Ok(Arc::new(WebRtcPeer {
            pc,
            remote: events.remote().clone(),
            frame_duration: Duration::from_millis(u64::from(self.audio.frame_ms)),
            writers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

async fn play_remote(track: Arc<TrackRemote>, remote: UserId, audio: AudioConfig) {
    let mut decoder = match OpusDecoder::new() {
        Ok(decoder) => decoder,
        Err(e) => {
            warn!("Cannot decode audio from {}: {}", remote, e);
            return;
        }
    };
    let mut playback = match RemotePlayback::start(&audio).await {
        Ok(playback) => playback,
        Err(e) => {
            warn!("Cannot play audio from {}: {}", remote, e);
            return;
        }
    };

    info!("Playing audio from {} (ssrc {})", remote, track.ssrc());
    while let Ok((packet, _)) = track.read_rtp().await {
        if packet.payload.is_empty() {
            continue;
        }
        match decoder.decode(&packet.payload) {
            Ok(samples) => {
                playback.push(&samples);
            }
            Err(e) => debug!("Dropping packet from {}: {}", remote, e),
        }
    }
    info!("Audio from {} ended", remote);
}

/// One webrtc-rs peer connection
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    remote: UserId,
    frame_duration: Duration,
    writers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::Acquire) {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            track.id().to_string(),
            STREAM_ID.to_string(),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&rtc_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(failed)?;

        // RTCP has to be read for interceptors to run
        let rtcp = tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });

        let mut frames = track.subscribe();
        let duration = self.frame_duration;
        let remote = self.remote.clone();
        let writer = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(data) => {
                        let sample = Sample {
                            data,
                            duration,
                            ..Default::default()
                        };
                        if let Err(e) = rtc_track.write_sample(&sample).await {
                            debug!("Sample to {} not written: {}", remote, e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Sender to {} skipped {} frames", remote, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut writers = self.writers.lock();
        writers.push(rtcp);
        writers.push(writer);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await.map_err(failed)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        let answer = self.pc.create_answer(None).await.map_err(failed)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(failed)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(failed)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(failed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for writer in self.writers.lock().drain(..) {
            writer.abort();
        }

        let pc = Arc::clone(&self.pc);
        let remote = self.remote.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pc.close().await {
                        debug!("Closing peer connection to {}: {}", remote, e);
                    }
                });
            }
            Err(_) => warn!("No runtime to close peer connection to {}", remote),
        }
    }
}

impl Drop for WebRtcPeer {
    fn drop(&mut self) {
        self.close();
    }
}
