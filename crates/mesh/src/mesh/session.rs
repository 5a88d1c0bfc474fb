//! Mesh session runtime
//!
//! One spawned task owns the [`MeshState`], the [`PeerManager`] arena and
//! the [`LocalMediaController`]. It multiplexes UI commands, connection
//! callbacks, timers and signaling, runs each input through the state
//! machine and executes the resulting effects in order. [`MeshHandle`] is
//! the cloneable front end the UI talks to.

use super::snapshot::{MeshNotice, MeshSnapshot, PeerSnapshot};
use super::state::{Effect, MeshEvent, MeshState, Phase, RemovalReason, StateConfig};
use crate::config::MeshConfig;
use crate::media::{LocalMediaController, MediaError, MediaSource, MediaStream, MediaTrack};
use crate::peer::{
    ConnectionEvent, ConnectionFactory, IceRestartPolicy, PeerManager, RemoteStream, TrackReplacement,
};
use crate::signaling::{SignalingChannel, SignalingMessage};
use crate::{Error, Result};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, info_span, warn, Instrument};

const NOTICE_CAPACITY: usize = 64;

/// Request from a [`MeshHandle`] to the session task
enum Command {
    SetVideoEnabled(Option<bool>, oneshot::Sender<bool>),
    SetAudioEnabled(Option<bool>, oneshot::Sender<bool>),
    StartScreenShare(oneshot::Sender<bool>),
    StopScreenShare(oneshot::Sender<bool>),
    ToggleScreenShare(oneshot::Sender<bool>),
    Leave(oneshot::Sender<()>),
}

/// Timer expiries and watcher signals posted back into the session task
enum Internal {
    Mesh(MeshEvent),
    DisplayEnded(String),
}

/// Session task state
pub struct MeshSession {
    state: MeshState,
    peers: PeerManager,
    media: LocalMediaController,
    channel: Arc<dyn SignalingChannel>,
    factory: Arc<dyn ConnectionFactory>,
    ice_restart: IceRestartPolicy,
    connection_tx: mpsc::UnboundedSender<ConnectionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    snapshot_tx: watch::Sender<MeshSnapshot>,
    notice_tx: broadcast::Sender<MeshNotice>,
}

impl MeshSession {
    /// Acquire local media, subscribe to signaling and start joining the room
    ///
    /// Media failure does not prevent joining; it is reported through
    /// `media_error` and a [`MeshNotice::MediaUnavailable`] notice.
    pub async fn start(
        config: MeshConfig,
        channel: Arc<dyn SignalingChannel>,
        factory: Arc<dyn ConnectionFactory>,
        source: Arc<dyn MediaSource>,
    ) -> Result<MeshHandle> {
        config.validate()?;

        let local_peer_id = config.local_peer_id();
        let peers = PeerManager::new(config.max_peers)?;
        let signals = channel.subscribe();

        info!(
            "Starting mesh session {} in room {}",
            local_peer_id,
            channel.room_id()
        );

        let mut media = LocalMediaController::new(source);
        media.acquire(&config.media).await;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(MeshSnapshot::initial(&local_peer_id));
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);

        let session = MeshSession {
            state: MeshState::new(local_peer_id.clone(), StateConfig::from(&config)),
            peers,
            media,
            channel,
            factory,
            ice_restart: config.ice_restart.clone(),
            connection_tx,
            internal_tx,
            snapshot_tx,
            notice_tx: notice_tx.clone(),
        };
        session.publish_snapshot();

        let span = info_span!("mesh_session", peer_id = %local_peer_id);
        tokio::spawn(
            session
                .run(command_rx, connection_rx, internal_rx, signals)
                .instrument(span),
        );

        Ok(MeshHandle {
            inner: Arc::new(HandleInner {
                local_peer_id,
                commands: command_tx,
                snapshot: snapshot_rx,
                notices: notice_tx,
            }),
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut signals: broadcast::Receiver<SignalingMessage>,
    ) {
        if let Some(error) = self.media.last_error().cloned() {
            self.notify(MeshNotice::MediaUnavailable { error });
        }
        self.dispatch(MeshEvent::JoinRequested).await;
        self.publish_snapshot();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All mesh handles dropped, leaving");
                        self.dispatch(MeshEvent::LeaveRequested).await;
                    }
                },

                Some(event) = connection_events.recv() => self.handle_connection_event(event).await,

                Some(event) = internal.recv() => match event {
                    Internal::Mesh(event) => self.dispatch(event).await,
                    Internal::DisplayEnded(track_id) => {
                        if self.media.display_track().is_some_and(|t| t.id() == track_id) {
                            info!("Display capture ended by the platform");
                            self.stop_screen_share().await;
                        }
                    }
                },

                signal = signals.recv() => match signal {
                    Ok(message) => self.dispatch(MeshEvent::SignalReceived(message)).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Signaling receiver lagged, skipped {} messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Signaling channel closed, leaving");
                        self.dispatch(MeshEvent::LeaveRequested).await;
                    }
                },
            }

            self.publish_snapshot();
            if self.state.phase() == Phase::Left {
                break;
            }
        }

        info!("Mesh session stopped");
    }

    /// Run an event and every follow-up event it causes to completion
    async fn dispatch(&mut self, event: MeshEvent) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            for effect in self.state.handle(event) {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<MeshEvent> {
        match effect {
            Effect::Publish(message) => {
                if let Err(e) = self.channel.publish(&message).await {
                    warn!("Failed to publish {}: {}", message.kind, e);
                }
                None
            }

            Effect::OpenConnection {
                peer_id,
                generation,
            } => match self.open_connection(&peer_id, generation).await {
                Ok(()) => None,
                Err(e) => Some(MeshEvent::NegotiationFailed {
                    peer_id,
                    generation,
                    error: e.to_string(),
                }),
            },

            Effect::CreateOffer {
                peer_id,
                generation,
                ice_restart,
            } => {
                let connection = self.peers.connection_for(&peer_id, generation)?;
                match connection.create_offer(ice_restart).await {
                    Ok(sdp) => Some(MeshEvent::OfferCreated {
                        peer_id,
                        generation,
                        sdp,
                    }),
                    Err(e) => Some(MeshEvent::NegotiationFailed {
                        peer_id,
                        generation,
                        error: e.to_string(),
                    }),
                }
            }

            Effect::RollbackOffer {
                peer_id,
                generation,
            } => {
                let connection = self.peers.connection_for(&peer_id, generation)?;
                match connection.rollback_offer().await {
                    Ok(()) => None,
                    Err(e) => Some(MeshEvent::NegotiationFailed {
                        peer_id,
                        generation,
                        error: e.to_string(),
                    }),
                }
            }

            Effect::AcceptOffer {
                peer_id,
                generation,
                sdp,
            } => {
                let connection = self.peers.connection_for(&peer_id, generation)?;
                match connection.accept_offer(sdp).await {
                    Ok(sdp) => Some(MeshEvent::AnswerCreated {
                        peer_id,
                        generation,
                        sdp,
                    }),
                    Err(e) => Some(MeshEvent::NegotiationFailed {
                        peer_id,
                        generation,
                        error: e.to_string(),
                    }),
                }
            }

            Effect::ApplyAnswer {
                peer_id,
                generation,
                sdp,
            } => {
                let connection = self.peers.connection_for(&peer_id, generation)?;
                match connection.apply_answer(sdp).await {
                    Ok(()) => Some(MeshEvent::AnswerApplied {
                        peer_id,
                        generation,
                    }),
                    Err(e) => Some(MeshEvent::NegotiationFailed {
                        peer_id,
                        generation,
                        error: e.to_string(),
                    }),
                }
            }

            Effect::AddCandidate {
                peer_id,
                generation,
                candidate,
            } => {
                let connection = self.peers.connection_for(&peer_id, generation)?;
                if let Err(e) = connection.add_ice_candidate(candidate).await {
                    warn!("Failed to add candidate from {}: {}", peer_id, e);
                }
                None
            }

            Effect::CloseConnection {
                peer_id,
                generation,
            } => {
                if let Err(e) = self.peers.remove_peer(&peer_id, Some(generation)).await {
                    debug!("Close for {} skipped: {}", peer_id, e);
                }
                None
            }

            Effect::PeerAdded { peer_id } => {
                self.notify(MeshNotice::PeerJoined { peer_id });
                None
            }

            Effect::PeerRemoved { peer_id, reason } => {
                match reason {
                    RemovalReason::LocalLeave => {}
                    RemovalReason::Left => self.notify(MeshNotice::PeerLeft { peer_id }),
                    reason => self.notify(MeshNotice::PeerDropped { peer_id, reason }),
                }
                None
            }

            Effect::ScheduleJoinAnnouncement { max_jitter } => {
                let max_ms = max_jitter.as_millis() as u64;
                let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms));
                debug!("Announcing join in {:?}", delay);
                self.schedule(delay, MeshEvent::JoinTimerElapsed);
                None
            }

            Effect::ScheduleIceRestart {
                peer_id,
                generation,
                attempt,
            } => {
                let delay = self.ice_restart.calculate_backoff(attempt);
                debug!("ICE restart {} for {} in {:?}", attempt, peer_id, delay);
                self.schedule(
                    delay,
                    MeshEvent::IceRestartDue {
                        peer_id,
                        generation,
                        attempt,
                    },
                );
                None
            }

            Effect::ScheduleOfferTimeout {
                peer_id,
                generation,
                offer_seq,
                after,
            } => {
                self.schedule(
                    after,
                    MeshEvent::OfferTimedOut {
                        peer_id,
                        generation,
                        offer_seq,
                    },
                );
                None
            }

            Effect::Shutdown => {
                self.peers.clear().await;
                self.media.release();
                if let Err(e) = self.channel.close().await {
                    warn!("Failed to close signaling channel: {}", e);
                }
                info!("Left room {}", self.channel.room_id());
                None
            }
        }
    }

    async fn open_connection(&mut self, peer_id: &str, generation: u64) -> Result<()> {
        let connection = self
            .factory
            .create(peer_id, generation, self.connection_tx.clone())
            .await?;

        for track in self.media.outgoing_tracks() {
            if let Err(e) = connection.add_local_track(&track).await {
                warn!("Failed to attach {} track for {}: {}", track.kind(), peer_id, e);
            }
        }

        if let Err(e) = self.peers.add_peer(Arc::clone(&connection)) {
            let _ = connection.close().await;
            return Err(e);
        }
        Ok(())
    }

    fn schedule(&self, delay: Duration, event: MeshEvent) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::Mesh(event));
        });
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalCandidate {
                peer_id,
                generation,
                candidate,
            } => {
                self.dispatch(MeshEvent::LocalCandidate {
                    peer_id,
                    generation,
                    candidate,
                })
                .await
            }
            ConnectionEvent::StateChanged {
                peer_id,
                generation,
                state,
            } => {
                self.dispatch(MeshEvent::ConnectionStateChanged {
                    peer_id,
                    generation,
                    state,
                })
                .await
            }
            ConnectionEvent::RemoteTrack {
                peer_id,
                generation,
                track,
            } => {
                if !self.peers.attach_remote_track(&peer_id, generation, track) {
                    debug!("Dropping remote track from stale connection to {}", peer_id);
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetVideoEnabled(enabled, reply) => {
                let enabled = enabled.unwrap_or(!self.media.is_video_enabled());
                self.media.set_video_enabled(enabled);
                let _ = reply.send(self.media.is_video_enabled());
            }
            Command::SetAudioEnabled(enabled, reply) => {
                let enabled = enabled.unwrap_or(!self.media.is_audio_enabled());
                self.media.set_audio_enabled(enabled);
                let _ = reply.send(self.media.is_audio_enabled());
            }
            Command::StartScreenShare(reply) => {
                self.start_screen_share().await;
                let _ = reply.send(self.media.is_screen_sharing());
            }
            Command::StopScreenShare(reply) => {
                self.stop_screen_share().await;
                let _ = reply.send(self.media.is_screen_sharing());
            }
            Command::ToggleScreenShare(reply) => {
                if self.media.is_screen_sharing() {
                    self.stop_screen_share().await;
                } else {
                    self.start_screen_share().await;
                }
                let _ = reply.send(self.media.is_screen_sharing());
            }
            Command::Leave(reply) => {
                self.dispatch(MeshEvent::LeaveRequested).await;
                let _ = reply.send(());
            }
        }
    }

    /// Swap every peer's outgoing video to the display track
    ///
    /// If any peer rejects the swap, peers that accepted it are put back on
    /// the camera and sharing is abandoned.
    async fn start_screen_share(&mut self) {
        if self.media.is_screen_sharing() {
            return;
        }

        let display = match self.media.start_screen_share().await {
            Ok(track) => track,
            Err(e) => {
                warn!("Screen share unavailable: {}", e);
                self.notify(MeshNotice::ScreenShareFailed {
                    error: e.to_string(),
                });
                return;
            }
        };

        let outcomes = self.peers.replace_outgoing_video_track(Some(&display)).await;
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(replacement) => accepted.push((outcome.peer_id, outcome.generation, replacement)),
                Err(e) => rejected.push((outcome.peer_id, e)),
            }
        }

        if rejected.is_empty() {
            for (peer_id, generation, replacement) in accepted {
                if replacement == TrackReplacement::Added {
                    self.dispatch(MeshEvent::RenegotiationNeeded {
                        peer_id,
                        generation,
                    })
                    .await;
                }
            }
            self.watch_display(&display);
            return;
        }

        warn!("Screen share rejected by {} peers, reverting", rejected.len());
        let camera = self.media.camera_track();
        for (peer_id, generation, _) in accepted {
            if let Some(connection) = self.peers.connection_for(&peer_id, generation) {
                if let Err(e) = connection.replace_video_track(camera.as_ref()).await {
                    warn!("Failed to restore camera for {}: {}", peer_id, e);
                }
            }
        }
        self.media.stop_screen_share();

        for (peer_id, e) in rejected {
            self.notify(MeshNotice::TrackReplacementFailed {
                peer_id,
                error: e.to_string(),
            });
        }
        self.notify(MeshNotice::ScreenShareFailed {
            error: "Outgoing video could not be replaced on every peer".to_string(),
        });
    }

    /// Put every peer back on the camera (or no video) and end the display
    async fn stop_screen_share(&mut self) {
        if !self.media.is_screen_sharing() {
            return;
        }

        let camera = self.media.camera_track();
        let outcomes = self.peers.replace_outgoing_video_track(camera.as_ref()).await;
        for outcome in outcomes {
            match outcome.result {
                Ok(TrackReplacement::Added) => {
                    self.dispatch(MeshEvent::RenegotiationNeeded {
                        peer_id: outcome.peer_id,
                        generation: outcome.generation,
                    })
                    .await
                }
                Ok(_) => {}
                Err(e) => self.notify(MeshNotice::TrackReplacementFailed {
                    peer_id: outcome.peer_id,
                    error: e.to_string(),
                }),
            }
        }
        self.media.stop_screen_share();
    }

    /// Revert automatically when the platform ends the display capture
    fn watch_display(&self, display: &MediaTrack) {
        let display = display.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            display.ended().await;
            let _ = tx.send(Internal::DisplayEnded(display.id().to_string()));
        });
    }

    fn notify(&self, notice: MeshNotice) {
        debug!("Mesh notice: {:?}", notice);
        // No subscribers is fine
        let _ = self.notice_tx.send(notice);
    }

    fn publish_snapshot(&self) {
        let peers = self
            .state
            .peers()
            .map(|(peer_id, peer)| PeerSnapshot {
                peer_id: peer_id.clone(),
                negotiation: peer.negotiation,
                connection: peer.connection,
                remote_stream: self.peers.remote_stream(peer_id).cloned(),
            })
            .collect();

        self.snapshot_tx.send_replace(MeshSnapshot {
            local_peer_id: self.state.local_peer_id().to_string(),
            phase: self.state.phase(),
            local_stream: self.media.stream().cloned(),
            video_enabled: self.media.is_video_enabled(),
            audio_enabled: self.media.is_audio_enabled(),
            screen_sharing: self.media.is_screen_sharing(),
            media_error: self.media.last_error().cloned(),
            peers,
        });
    }
}

impl Drop for MeshSession {
    fn drop(&mut self) {
        if self.state.phase() == Phase::Left {
            return;
        }

        warn!("Mesh session dropped without leaving, cleaning up");
        self.media.release();

        let connections: Vec<_> = self.peers.drain().into_iter().map(|e| e.connection).collect();
        let channel = Arc::clone(&self.channel);
        let leave = SignalingMessage::leave(self.state.local_peer_id());
        let announced = self.state.phase() != Phase::Idle;

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if announced {
                    let _ = channel.publish(&leave).await;
                }
                for connection in connections {
                    let _ = connection.close().await;
                }
                let _ = channel.close().await;
            });
        }
    }
}

struct HandleInner {
    local_peer_id: String,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<MeshSnapshot>,
    notices: broadcast::Sender<MeshNotice>,
}

/// UI-facing handle to a running session
///
/// Cheap to clone. Dropping the last clone leaves the room.
#[derive(Clone)]
pub struct MeshHandle {
    inner: Arc<HandleInner>,
}

impl MeshHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(command(tx))
            .map_err(|_| Error::SessionClosed(self.inner.local_peer_id.clone()))?;
        rx.await
            .map_err(|_| Error::SessionClosed(self.inner.local_peer_id.clone()))
    }

    pub fn local_peer_id(&self) -> &str {
        &self.inner.local_peer_id
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Receiver that observes every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<MeshSnapshot> {
        self.inner.snapshot.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<MeshNotice> {
        self.inner.notices.subscribe()
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.inner.snapshot.borrow().local_stream.clone()
    }

    pub fn remote_streams(&self) -> Vec<(String, RemoteStream)> {
        self.inner.snapshot.borrow().remote_streams()
    }

    pub fn is_video_enabled(&self) -> bool {
        self.inner.snapshot.borrow().video_enabled
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.inner.snapshot.borrow().audio_enabled
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.inner.snapshot.borrow().screen_sharing
    }

    pub fn media_error(&self) -> Option<MediaError> {
        self.inner.snapshot.borrow().media_error.clone()
    }

    /// Returns the new video enabled state
    pub async fn toggle_video(&self) -> Result<bool> {
        self.request(|tx| Command::SetVideoEnabled(None, tx)).await
    }

    /// Returns the new audio enabled state
    pub async fn toggle_audio(&self) -> Result<bool> {
        self.request(|tx| Command::SetAudioEnabled(None, tx)).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<bool> {
        self.request(|tx| Command::SetVideoEnabled(Some(enabled), tx)).await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<bool> {
        self.request(|tx| Command::SetAudioEnabled(Some(enabled), tx)).await
    }

    /// Returns whether the session is sharing afterwards
    pub async fn start_screen_share(&self) -> Result<bool> {
        self.request(Command::StartScreenShare).await
    }

    pub async fn stop_screen_share(&self) -> Result<bool> {
        self.request(Command::StopScreenShare).await
    }

    pub async fn toggle_screen_share(&self) -> Result<bool> {
        self.request(Command::ToggleScreenShare).await
    }

    /// Leave the room; idempotent
    pub async fn leave(&self) -> Result<()> {
        match self.request(Command::Leave).await {
            Ok(()) | Err(Error::SessionClosed(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Resolve once the session has left the room
    pub async fn left(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| s.phase == Phase::Left).await;
    }
}
