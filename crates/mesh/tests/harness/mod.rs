//! Mesh integration test harness
//!
//! Provides:
//! - An in-process fake connection network (no ICE, no DTLS) whose
//!   connections record what the session asked of them
//! - Participant setup over an in-memory signaling hub
//! - A signaling tap and polling helpers
//!
//! Fake session descriptions are plain text:
//! `fake-offer;owner=alice;tracks=audio,video;restart=0`.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use studysync_mesh::media::MediaKind;
use studysync_mesh::peer::{ConnectionEvent, TrackReplacement};
use studysync_mesh::signaling::{IceCandidatePayload, MessageKind};
use studysync_mesh::{
    ConnectionFactory, ConnectionState, Error, InMemorySignalingHub, MediaTrack, MeshConfig,
    MeshConnection, MeshHandle, MeshNotice, MeshSession, MeshSnapshot, NegotiationState, Phase,
    RemoteTrack, Result, SignalingChannel, SignalingMessage, SyntheticMediaSource,
};
use tokio::sync::{broadcast, mpsc};

pub const WAIT: Duration = Duration::from_secs(5);

/// Registry of every fake connection created by any participant
#[derive(Default)]
pub struct FakeNetwork {
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    rejected_replacements: Mutex<HashSet<(String, String)>>,
    blocked: Mutex<HashSet<(String, String)>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>, owner: &str) -> Arc<FakeConnectionFactory> {
        Arc::new(FakeConnectionFactory {
            owner: owner.to_string(),
            network: Arc::clone(self),
        })
    }

    /// Make `owner`'s connection to `remote` fail every track replacement
    pub fn reject_replacement(&self, owner: &str, remote: &str) {
        self.rejected_replacements
            .lock()
            .unwrap()
            .insert((owner.to_string(), remote.to_string()));
    }

    fn rejects_replacement(&self, owner: &str, remote: &str) -> bool {
        self.rejected_replacements
            .lock()
            .unwrap()
            .contains(&(owner.to_string(), remote.to_string()))
    }

    /// Keep `owner`'s connections to `remote` from ever reporting connected
    pub fn block_connectivity(&self, owner: &str, remote: &str) {
        self.blocked
            .lock()
            .unwrap()
            .insert((owner.to_string(), remote.to_string()));
    }

    fn is_blocked(&self, owner: &str, remote: &str) -> bool {
        self.blocked
            .lock()
            .unwrap()
            .contains(&(owner.to_string(), remote.to_string()))
    }

    /// Every connection `owner` ever created towards `remote`, oldest first
    pub fn connections(&self, owner: &str, remote: &str) -> Vec<Arc<FakeConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.owner == owner && c.remote == remote)
            .cloned()
            .collect()
    }

    pub fn open_connections(&self, owner: &str, remote: &str) -> Vec<Arc<FakeConnection>> {
        self.connections(owner, remote)
            .into_iter()
            .filter(|c| !c.is_closed())
            .collect()
    }

    /// Video `receiver` currently gets from `sender` over their open connection
    pub fn receiving_video(&self, receiver: &str, sender: &str) -> Option<MediaTrack> {
        self.open_connections(sender, receiver)
            .last()
            .and_then(|connection| connection.sending_video())
    }

    /// The single open connection `owner` holds towards `remote`
    pub fn live(&self, owner: &str, remote: &str) -> Arc<FakeConnection> {
        let open = self.open_connections(owner, remote);
        assert_eq!(open.len(), 1, "{} has {} open connections to {}", owner, open.len(), remote);
        Arc::clone(&open[0])
    }
}

pub struct FakeConnectionFactory {
    owner: String,
    network: Arc<FakeNetwork>,
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn create(
        &self,
        peer_id: &str,
        generation: u64,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Arc<dyn MeshConnection>> {
        let connection = Arc::new(FakeConnection {
            owner: self.owner.clone(),
            remote: peer_id.to_string(),
            generation,
            events,
            network: Arc::clone(&self.network),
            state: Mutex::new(FakeState::default()),
        });
        self.network.connections.lock().unwrap().push(Arc::clone(&connection));
        Ok(connection)
    }
}

#[derive(Default)]
struct FakeState {
    negotiation: Option<NegotiationState>,
    remote_description: bool,
    closed: bool,
    local_tracks: Vec<MediaTrack>,
    video: Option<MediaTrack>,
    video_sender: bool,
    offers: usize,
    ice_restart_offers: usize,
    answers: usize,
    rollbacks: usize,
    candidates: Vec<IceCandidatePayload>,
    replacements: usize,
}

/// Connection that negotiates by string matching
pub struct FakeConnection {
    pub owner: String,
    pub remote: String,
    pub generation: u64,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    network: Arc<FakeNetwork>,
    state: Mutex<FakeState>,
}

pub fn fake_description(kind: &str, owner: &str, tracks: &[MediaKind], restart: bool) -> String {
    let tracks: Vec<String> = tracks.iter().map(|k| k.to_string()).collect();
    format!(
        "fake-{};owner={};tracks={};restart={}",
        kind,
        owner,
        tracks.join(","),
        u8::from(restart)
    )
}

fn description_tracks(sdp: &str) -> Vec<MediaKind> {
    sdp.split(';')
        .find_map(|part| part.strip_prefix("tracks="))
        .map(|tracks| {
            tracks
                .split(',')
                .filter_map(|t| match t {
                    "audio" => Some(MediaKind::Audio),
                    "video" => Some(MediaKind::Video),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

impl FakeConnection {
    fn sent_kinds(state: &FakeState) -> Vec<MediaKind> {
        let mut kinds: Vec<MediaKind> = state
            .local_tracks
            .iter()
            .map(|t| t.kind())
            .filter(|k| *k == MediaKind::Audio)
            .collect();
        if state.video_sender {
            kinds.push(MediaKind::Video);
        }
        kinds
    }

    fn post(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn on_remote_description(&self, sdp: &str) {
        let remote = sdp
            .split(';')
            .find_map(|p| p.strip_prefix("owner="))
            .unwrap_or("unknown")
            .to_string();
        for kind in description_tracks(sdp) {
            self.post(ConnectionEvent::RemoteTrack {
                peer_id: self.remote.clone(),
                generation: self.generation,
                track: RemoteTrack::new(format!("{}-{}", remote, kind), kind, format!("{}-stream", remote)),
            });
        }
    }

    fn local_candidate(&self) {
        self.post(ConnectionEvent::LocalCandidate {
            peer_id: self.remote.clone(),
            generation: self.generation,
            candidate: IceCandidatePayload {
                candidate: format!("candidate:{} 1 udp 1 10.0.0.1 9 typ host", self.generation),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            },
        });
    }

    /// Report a connection state as if ICE/DTLS produced it
    pub fn emit_state(&self, state: ConnectionState) {
        self.post(ConnectionEvent::StateChanged {
            peer_id: self.remote.clone(),
            generation: self.generation,
            state,
        });
    }

    fn report_connected(&self) {
        if !self.network.is_blocked(&self.owner, &self.remote) {
            self.emit_state(ConnectionState::Connected);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn negotiation(&self) -> Option<NegotiationState> {
        self.state.lock().unwrap().negotiation
    }

    /// Track currently carried by the video sender
    pub fn sending_video(&self) -> Option<MediaTrack> {
        self.state.lock().unwrap().video.clone()
    }

    pub fn offers(&self) -> usize {
        self.state.lock().unwrap().offers
    }

    pub fn ice_restart_offers(&self) -> usize {
        self.state.lock().unwrap().ice_restart_offers
    }

    pub fn answers(&self) -> usize {
        self.state.lock().unwrap().answers
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }

    pub fn candidates(&self) -> Vec<IceCandidatePayload> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub fn replacements(&self) -> usize {
        self.state.lock().unwrap().replacements
    }
}

#[async_trait]
impl MeshConnection for FakeConnection {
    fn peer_id(&self) -> &str {
        &self.remote
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    async fn add_local_track(&self, track: &MediaTrack) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if track.kind() == MediaKind::Video {
            state.video_sender = true;
            state.video = Some(track.clone());
        }
        state.local_tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        let sdp = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(Error::PeerConnectionError("connection closed".to_string()));
            }
            state.negotiation = Some(NegotiationState::HaveLocalOffer);
            state.offers += 1;
            if ice_restart {
                state.ice_restart_offers += 1;
            }
            fake_description("offer", &self.owner, &Self::sent_kinds(&state), ice_restart)
        };
        self.local_candidate();
        Ok(sdp)
    }

    async fn accept_offer(&self, sdp: String) -> Result<String> {
        if !sdp.starts_with("fake-offer") {
            return Err(Error::SdpError(format!("Failed to set remote description: {}", sdp)));
        }
        let answer = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(Error::PeerConnectionError("connection closed".to_string()));
            }
            if state.negotiation == Some(NegotiationState::HaveLocalOffer) {
                return Err(Error::SdpError("Offer received in have-local-offer".to_string()));
            }
            state.negotiation = Some(NegotiationState::Stable);
            state.remote_description = true;
            state.answers += 1;
            fake_description("answer", &self.owner, &Self::sent_kinds(&state), false)
        };
        self.on_remote_description(&sdp);
        self.local_candidate();
        self.report_connected();
        Ok(answer)
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.negotiation != Some(NegotiationState::HaveLocalOffer) || !sdp.starts_with("fake-answer") {
                return Err(Error::SdpError(format!("Failed to set remote description: {}", sdp)));
            }
            state.negotiation = Some(NegotiationState::Stable);
            state.remote_description = true;
        }
        self.on_remote_description(&sdp);
        self.report_connected();
        Ok(())
    }

    async fn rollback_offer(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.negotiation == Some(NegotiationState::HaveLocalOffer) {
            state.negotiation = Some(NegotiationState::Stable);
            state.rollbacks += 1;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.remote_description {
            return Err(Error::IceCandidateError("No remote description".to_string()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<TrackReplacement> {
        if self.network.rejects_replacement(&self.owner, &self.remote) {
            return Err(Error::MediaTrackError("replacement rejected".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        state.replacements += 1;
        if state.video_sender {
            state.video = track.cloned();
            return Ok(TrackReplacement::Replaced);
        }
        match track {
            Some(track) => {
                state.video_sender = true;
                state.video = Some(track.clone());
                Ok(TrackReplacement::Added)
            }
            None => Ok(TrackReplacement::Unchanged),
        }
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.negotiation = Some(NegotiationState::Closed);
        }
        self.emit_state(ConnectionState::Closed);
        Ok(())
    }
}

/// Config with no join jitter so tests do not wait
pub fn test_config(peer_id: &str) -> MeshConfig {
    MeshConfig {
        peer_id: Some(peer_id.to_string()),
        join_jitter_max_ms: 0,
        ..Default::default()
    }
}

pub struct Participant {
    pub id: String,
    pub handle: MeshHandle,
    pub source: Arc<SyntheticMediaSource>,
}

pub async fn join(hub: &InMemorySignalingHub, network: &Arc<FakeNetwork>, room: &str, id: &str) -> Participant {
    join_with(hub, network, room, test_config(id), Arc::new(SyntheticMediaSource::new())).await
}

pub async fn join_with(
    hub: &InMemorySignalingHub,
    network: &Arc<FakeNetwork>,
    room: &str,
    config: MeshConfig,
    source: Arc<SyntheticMediaSource>,
) -> Participant {
    let id = config.peer_id.clone().unwrap();
    let handle = MeshSession::start(
        config,
        Arc::new(hub.channel(room)),
        network.factory(&id),
        source.clone(),
    )
    .await
    .unwrap();

    Participant { id, handle, source }
}

/// Wait until the participant's snapshot satisfies `predicate`
pub async fn wait_for(handle: &MeshHandle, what: &str, predicate: impl Fn(&MeshSnapshot) -> bool) -> MeshSnapshot {
    let mut rx = handle.subscribe();
    let snapshot = match tokio::time::timeout(WAIT, rx.wait_for(|s| predicate(s))).await {
        Ok(Ok(snapshot)) => snapshot.clone(),
        Ok(Err(_)) => panic!("session ended while waiting for {}", what),
        Err(_) => panic!("timed out waiting for {}: {:#?}", what, handle.snapshot()),
    };
    snapshot
}

/// True once `peer` is stable, connected and sending both kinds
pub fn connected_to(snapshot: &MeshSnapshot, peer: &str) -> bool {
    snapshot.peer(peer).is_some_and(|p| {
        p.negotiation == NegotiationState::Stable
            && p.connection == ConnectionState::Connected
            && p.remote_stream.as_ref().is_some_and(|s| s.tracks.len() == 2)
    })
}

pub async fn wait_connected(participant: &Participant, peers: &[&str]) -> MeshSnapshot {
    wait_for(&participant.handle, &format!("{} connected to {:?}", participant.id, peers), |s| {
        s.peers.len() == peers.len() && peers.iter().all(|p| connected_to(s, p))
    })
    .await
}

/// Raw observer of a room's signaling traffic
pub struct SignalingTap {
    rx: broadcast::Receiver<SignalingMessage>,
}

impl SignalingTap {
    pub fn new(hub: &InMemorySignalingHub, room: &str) -> Self {
        Self {
            rx: hub.channel(room).subscribe(),
        }
    }

    /// Everything published since the last drain
    pub fn drain(&mut self) -> Vec<SignalingMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Wait for the next message of `kind` sent by `from`
    pub async fn next(&mut self, kind: MessageKind, from: &str) -> SignalingMessage {
        let wait = async {
            loop {
                match self.rx.recv().await {
                    Ok(m) if m.kind == kind && m.from_peer_id == from => return m,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("tap closed: {}", e),
                }
            }
        };
        tokio::time::timeout(WAIT, wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {} from {}", kind, from))
    }
}

/// Hand-driven remote participant publishing raw messages
pub struct ScriptedPeer {
    pub id: String,
    channel: Arc<dyn SignalingChannel>,
}

impl ScriptedPeer {
    pub fn new(hub: &InMemorySignalingHub, room: &str, id: &str) -> Self {
        Self {
            id: id.to_string(),
            channel: Arc::new(hub.channel(room)),
        }
    }

    pub async fn send(&self, message: SignalingMessage) {
        self.channel.publish(&message).await.unwrap();
    }

    pub async fn join(&self) {
        self.send(SignalingMessage::join(&self.id)).await;
    }

    pub async fn offer(&self, to: &str) {
        let sdp = fake_description("offer", &self.id, &[MediaKind::Audio, MediaKind::Video], false);
        self.send(SignalingMessage::offer(&self.id, to, sdp)).await;
    }

    pub async fn answer(&self, to: &str) {
        let sdp = fake_description("answer", &self.id, &[MediaKind::Audio, MediaKind::Video], false);
        self.send(SignalingMessage::answer(&self.id, to, sdp)).await;
    }

    pub async fn candidate(&self, to: &str, n: u32) -> IceCandidatePayload {
        let candidate = IceCandidatePayload {
            candidate: format!("candidate:{} 1 udp 2122260223 192.168.1.{} 5000 typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        self.send(SignalingMessage::ice_candidate(&self.id, to, &candidate)).await;
        candidate
    }

    pub async fn leave(&self) {
        self.send(SignalingMessage::leave(&self.id)).await;
    }
}

/// Poll `condition` until it holds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for the first notice matching `predicate`
pub async fn next_notice(
    notices: &mut broadcast::Receiver<MeshNotice>,
    predicate: impl Fn(&MeshNotice) -> bool,
) -> MeshNotice {
    let wait = async {
        loop {
            match notices.recv().await {
                Ok(notice) if predicate(&notice) => return notice,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("notice channel closed: {}", e),
            }
        }
    };
    tokio::time::timeout(WAIT, wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for notice"))
}

/// alice, bob and carol fully connected in `room`
pub async fn three_party(hub: &InMemorySignalingHub, network: &Arc<FakeNetwork>, room: &str) -> (Participant, Participant, Participant) {
    let alice = join(hub, network, room, "alice").await;
    wait_for(&alice.handle, "alice joined", |s| s.phase == Phase::Joined).await;
    let bob = join(hub, network, room, "bob").await;
    wait_connected(&alice, &["bob"]).await;
    let carol = join(hub, network, room, "carol").await;

    wait_connected(&alice, &["bob", "carol"]).await;
    wait_connected(&bob, &["alice", "carol"]).await;
    wait_connected(&carol, &["alice", "bob"]).await;
    (alice, bob, carol)
}
