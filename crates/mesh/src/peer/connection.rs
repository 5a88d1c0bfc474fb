//! Per-peer connection seam and its webrtc-rs implementation
//!
//! The mesh runtime drives connections only through [`MeshConnection`] and
//! creates them through a [`ConnectionFactory`]. Callbacks from the WebRTC
//! stack never touch mesh state directly: they post [`ConnectionEvent`]s,
//! tagged with the peer ID and connection generation, into the runtime's
//! event channel.

use crate::config::MeshConfig;
use crate::media::{MediaKind, MediaTrack};
use crate::signaling::IceCandidatePayload;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Overall connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Created, ICE not started
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Transient loss of connectivity
    Disconnected,
    /// ICE failed; recoverable only by an ICE restart
    Failed,
    /// Closed, terminal
    Closed,
}

/// Offer/answer state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    /// No description exchanged yet
    New,
    /// Local offer sent, waiting for the answer
    HaveLocalOffer,
    /// Remote offer received, answer not yet sent
    HaveRemoteOffer,
    /// Offer/answer complete
    Stable,
    /// Connection closed
    Closed,
}

/// Result of swapping the outgoing video track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackReplacement {
    /// Existing sender now carries the new track; no renegotiation
    Replaced,
    /// No video sender existed; a new one was added and needs an offer
    Added,
    /// Nothing to do
    Unchanged,
}

/// Track received from a remote peer
#[derive(Clone)]
pub struct RemoteTrack {
    pub track_id: String,
    pub kind: MediaKind,
    pub stream_id: String,
    /// RTP source, absent for connections without a real media stack
    pub handle: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(track_id: impl Into<String>, kind: MediaKind, stream_id: impl Into<String>) -> Self {
        Self {
            track_id: track_id.into(),
            kind,
            stream_id: stream_id.into(),
            handle: None,
        }
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Tracks received from one remote peer
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Add a track, keeping only the newest track per kind
    ///
    /// A peer sends at most one audio and one video track; a second video
    /// track after renegotiation supersedes the first.
    pub fn add_track(&mut self, track: RemoteTrack) {
        self.tracks.retain(|t| t.kind != track.kind);
        self.tracks.push(track);
    }

    pub fn video_track(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == MediaKind::Video)
    }

    pub fn audio_track(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == MediaKind::Audio)
    }
}

/// Notification posted by a connection into the mesh runtime
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A local ICE candidate was gathered
    LocalCandidate {
        peer_id: String,
        generation: u64,
        candidate: IceCandidatePayload,
    },
    /// Overall connection state changed
    StateChanged {
        peer_id: String,
        generation: u64,
        state: ConnectionState,
    },
    /// A remote track arrived
    RemoteTrack {
        peer_id: String,
        generation: u64,
        track: RemoteTrack,
    },
}

/// One peer-to-peer connection as seen by the mesh runtime
#[async_trait]
pub trait MeshConnection: Send + Sync {
    /// Remote peer ID
    fn peer_id(&self) -> &str;

    /// Generation this connection was created for
    fn generation(&self) -> u64;

    /// Attach a local track for sending
    async fn add_local_track(&self, track: &MediaTrack) -> Result<()>;

    /// Create an offer and set it as the local description
    async fn create_offer(&self, ice_restart: bool) -> Result<String>;

    /// Apply a remote offer and return the local answer
    async fn accept_offer(&self, sdp: String) -> Result<String>;

    /// Apply the remote answer to our outstanding offer
    async fn apply_answer(&self, sdp: String) -> Result<()>;

    /// Drop our outstanding offer and return to stable, keeping ICE and DTLS
    async fn rollback_offer(&self) -> Result<()>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<()>;

    /// Swap the outgoing video track in place
    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<TrackReplacement>;

    /// Close the connection; idempotent
    async fn close(&self) -> Result<()>;
}

/// Creates connections for the mesh runtime
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a connection to `peer_id` whose callbacks post into `events`
    async fn create(
        &self,
        peer_id: &str,
        generation: u64,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn MeshConnection>>;
}

impl From<IceCandidatePayload> for RTCIceCandidateInit {
    fn from(payload: IceCandidatePayload) -> Self {
        RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_m_line_index,
            username_fragment: payload.username_fragment,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidatePayload {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidatePayload {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_m_line_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

/// Factory producing webrtc-rs backed [`PeerConnection`]s
///
/// One `API` instance (media engine plus interceptors) is shared by every
/// connection of the session.
pub struct WebRtcConnectionFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcConnectionFactory {
    /// Build the WebRTC API with default codecs and interceptors
    pub fn new(config: &MeshConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
        })
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        peer_id: &str,
        generation: u64,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn MeshConnection>> {
        let connection = PeerConnection::new(
            &self.api,
            self.ice_servers.clone(),
            peer_id.to_string(),
            generation,
            events,
        )
        .await?;
        Ok(Arc::new(connection))
    }
}

/// WebRTC peer connection wrapper
pub struct PeerConnection {
    peer_id: String,
    generation: u64,
    peer_connection: Arc<RTCPeerConnection>,

    /// Sender carrying the outgoing video, if one was negotiated
    video_sender: RwLock<Option<Arc<RTCRtpSender>>>,
}

impl PeerConnection {
    /// Create a new peer connection and wire its callbacks to `events`
    #[instrument(skip(api, ice_servers, events), fields(peer_id = %peer_id))]
    pub async fn new(
        api: &API,
        ice_servers: Vec<RTCIceServer>,
        peer_id: String,
        generation: u64,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self> {
        info!("Creating peer connection: peer_id={}, generation={}", peer_id, generation);

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let candidate_tx = events.clone();
        let candidate_peer = peer_id.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_tx.clone();
            let peer_id = candidate_peer.clone();

            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };

                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(ConnectionEvent::LocalCandidate {
                            peer_id,
                            generation,
                            candidate: init.into(),
                        });
                    }
                    Err(e) => warn!("Failed to serialize local candidate for {}: {}", peer_id, e),
                }
            })
        }));

        let state_tx = events.clone();
        let state_peer = peer_id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let events = state_tx.clone();
                let peer_id = state_peer.clone();

                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };

                    debug!("Peer {} connection state: {:?}", peer_id, state);
                    let _ = events.send(ConnectionEvent::StateChanged {
                        peer_id,
                        generation,
                        state,
                    });
                })
            },
        ));

        let track_tx = events;
        let track_peer = peer_id.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_tx.clone();
                let peer_id = track_peer.clone();

                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        _ => return,
                    };

                    info!("Remote track added for peer {}: kind={}", peer_id, kind);
                    let remote = RemoteTrack {
                        track_id: track.id(),
                        kind,
                        stream_id: track.stream_id(),
                        handle: Some(track),
                    };
                    let _ = events.send(ConnectionEvent::RemoteTrack {
                        peer_id,
                        generation,
                        track: remote,
                    });
                })
            },
        ));

        Ok(Self {
            peer_id,
            generation,
            peer_connection,
            video_sender: RwLock::new(None),
        })
    }

    async fn add_track_internal(&self, track: &MediaTrack) -> Result<Arc<RTCRtpSender>> {
        let sender = self
            .peer_connection
            .add_track(track.local_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| {
                Error::MediaTrackError(format!("Failed to add {} track: {}", track.kind(), e))
            })?;

        // Drain RTCP so the interceptors keep running
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        Ok(sender)
    }

    /// Ensure an offer has media sections even without local tracks
    async fn ensure_receive_transceivers(&self) -> Result<()> {
        if !self.peer_connection.get_transceivers().await.is_empty() {
            return Ok(());
        }

        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            self.peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| {
                    Error::PeerConnectionError(format!("Failed to add transceiver: {}", e))
                })?;
        }

        Ok(())
    }

    async fn local_sdp(&self, what: &str) -> Result<String> {
        self.peer_connection
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| Error::SdpError(format!("No local description after setting {}", what)))
    }
}

#[async_trait]
impl MeshConnection for PeerConnection {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    async fn add_local_track(&self, track: &MediaTrack) -> Result<()> {
        let sender = self.add_track_internal(track).await?;
        if track.kind() == MediaKind::Video {
            let mut video_sender = self.video_sender.write().await;
            if video_sender.is_none() {
                *video_sender = Some(sender);
            }
        }
        debug!("Added local {} track {} for peer {}", track.kind(), track.id(), self.peer_id);
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        self.ensure_receive_transceivers().await?;

        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!("Created SDP offer for peer {} (ice_restart={})", self.peer_id, ice_restart);
        self.local_sdp("offer").await
    }

    async fn accept_offer(&self, sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!("Created SDP answer for peer {}", self.peer_id);
        self.local_sdp("answer").await
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn rollback_offer(&self) -> Result<()> {
        let Some(mut rollback) = self.peer_connection.pending_local_description().await else {
            debug!("No pending offer to roll back for peer {}", self.peer_id);
            return Ok(());
        };
        rollback.sdp_type = RTCSdpType::Rollback;

        self.peer_connection
            .set_local_description(rollback)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to roll back offer: {}", e)))?;

        debug!("Rolled back local offer for peer {}", self.peer_id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<TrackReplacement> {
        let existing = self.video_sender.read().await.clone();

        match (existing, track) {
            (Some(sender), track) => {
                let local = track.map(|t| t.local_track() as Arc<dyn TrackLocal + Send + Sync>);
                sender.replace_track(local).await.map_err(|e| {
                    Error::MediaTrackError(format!("Failed to replace video track: {}", e))
                })?;
                Ok(TrackReplacement::Replaced)
            }
            (None, Some(track)) => {
                let sender = self.add_track_internal(track).await?;
                *self.video_sender.write().await = Some(sender);
                Ok(TrackReplacement::Added)
            }
            (None, None) => Ok(TrackReplacement::Unchanged),
        }
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for peer {}", self.peer_id);
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close connection: {}", e)))
    }
}
