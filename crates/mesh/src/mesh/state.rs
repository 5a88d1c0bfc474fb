//! Mesh presence and negotiation state machine
//!
//! [`MeshState::handle`] is a pure transition function: it consumes one
//! [`MeshEvent`] and returns the [`Effect`]s the runtime must execute, in
//! order. Results of asynchronous effects come back as further events
//! tagged with the generation they were issued for; anything whose
//! generation no longer matches the live peer entry is dropped.

use crate::peer::{ConnectionState, IceRestartPolicy, NegotiationState};
use crate::signaling::{IceCandidatePayload, MessageKind, SignalingMessage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Presence phase of the local participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    /// Waiting out the join jitter; already reacting to signaling
    Joining,
    Joined,
    Leaving,
    Left,
}

impl Phase {
    /// Signaling is only acted on in these phases
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Joining | Phase::Joined)
    }
}

/// Why a peer entry was destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemovalReason {
    /// Remote sent `leave`
    Left,
    /// ICE failed and the restart budget is spent
    IceFailed,
    /// Remote closed the connection
    ConnectionClosed,
    /// Our offer went unanswered for the configured timeout
    OfferTimeout,
    /// Offer/answer could not be applied
    NegotiationFailed,
    /// We left the room
    LocalLeave,
}

/// Input to the state machine
#[derive(Debug, Clone)]
pub enum MeshEvent {
    JoinRequested,
    JoinTimerElapsed,
    LeaveRequested,
    SignalReceived(SignalingMessage),
    OfferCreated {
        peer_id: String,
        generation: u64,
        sdp: String,
    },
    AnswerCreated {
        peer_id: String,
        generation: u64,
        sdp: String,
    },
    AnswerApplied {
        peer_id: String,
        generation: u64,
    },
    /// Opening, offering, answering or applying failed
    NegotiationFailed {
        peer_id: String,
        generation: u64,
        error: String,
    },
    LocalCandidate {
        peer_id: String,
        generation: u64,
        candidate: IceCandidatePayload,
    },
    ConnectionStateChanged {
        peer_id: String,
        generation: u64,
        state: ConnectionState,
    },
    IceRestartDue {
        peer_id: String,
        generation: u64,
        attempt: u32,
    },
    OfferTimedOut {
        peer_id: String,
        generation: u64,
        offer_seq: u64,
    },
    /// A new sender was added outside negotiation
    RenegotiationNeeded {
        peer_id: String,
        generation: u64,
    },
}

/// Work the runtime must perform
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Publish(SignalingMessage),
    /// Create a connection and attach the current outgoing tracks
    OpenConnection {
        peer_id: String,
        generation: u64,
    },
    CreateOffer {
        peer_id: String,
        generation: u64,
        ice_restart: bool,
    },
    /// Discard our outstanding offer, keeping the connection
    RollbackOffer {
        peer_id: String,
        generation: u64,
    },
    AcceptOffer {
        peer_id: String,
        generation: u64,
        sdp: String,
    },
    ApplyAnswer {
        peer_id: String,
        generation: u64,
        sdp: String,
    },
    AddCandidate {
        peer_id: String,
        generation: u64,
        candidate: IceCandidatePayload,
    },
    CloseConnection {
        peer_id: String,
        generation: u64,
    },
    PeerAdded {
        peer_id: String,
    },
    PeerRemoved {
        peer_id: String,
        reason: RemovalReason,
    },
    /// Post `JoinTimerElapsed` after a random delay in `[0, max_jitter]`
    ScheduleJoinAnnouncement {
        max_jitter: Duration,
    },
    /// Post `IceRestartDue` after the policy backoff for `attempt`
    ScheduleIceRestart {
        peer_id: String,
        generation: u64,
        attempt: u32,
    },
    /// Post `OfferTimedOut` after `after`
    ScheduleOfferTimeout {
        peer_id: String,
        generation: u64,
        offer_seq: u64,
        after: Duration,
    },
    /// Release local media and close the signaling channel
    Shutdown,
}

/// Tunables of the state machine
#[derive(Debug, Clone)]
pub struct StateConfig {
    pub max_peers: usize,
    pub join_jitter_max: Duration,
    pub buffer_early_candidates: bool,
    pub candidate_buffer_limit: usize,
    pub offer_timeout: Option<Duration>,
    pub ice_restart: IceRestartPolicy,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_peers: 8,
            join_jitter_max: Duration::from_millis(1000),
            buffer_early_candidates: true,
            candidate_buffer_limit: 64,
            offer_timeout: None,
            ice_restart: IceRestartPolicy::default(),
        }
    }
}

impl From<&crate::config::MeshConfig> for StateConfig {
    fn from(config: &crate::config::MeshConfig) -> Self {
        Self {
            max_peers: config.max_peers as usize,
            join_jitter_max: config.join_jitter_max(),
            buffer_early_candidates: config.buffer_early_candidates,
            candidate_buffer_limit: config.candidate_buffer_limit,
            offer_timeout: config.offer_timeout(),
            ice_restart: config.ice_restart.clone(),
        }
    }
}

/// Negotiation bookkeeping for one remote peer
#[derive(Debug, Clone)]
pub struct PeerState {
    pub generation: u64,
    pub negotiation: NegotiationState,
    pub connection: ConnectionState,
    pub remote_description_set: bool,
    pub ice_restart_attempts: u32,
    /// Candidates waiting for a remote description
    pub pending_candidates: VecDeque<IceCandidatePayload>,
    /// Incremented on every offer we create
    pub offer_seq: u64,
    /// Renegotiate once the current exchange reaches stable
    pub renegotiate_when_stable: bool,
}

impl PeerState {
    fn new(generation: u64, negotiation: NegotiationState) -> Self {
        Self {
            generation,
            negotiation,
            connection: ConnectionState::New,
            remote_description_set: false,
            ice_restart_attempts: 0,
            pending_candidates: VecDeque::new(),
            offer_seq: 0,
            renegotiate_when_stable: false,
        }
    }
}

/// True if `local` yields to `remote` on offer collision
///
/// The lexicographically smaller ID is polite.
pub fn is_polite(local: &str, remote: &str) -> bool {
    local < remote
}

fn push_bounded(queue: &mut VecDeque<IceCandidatePayload>, candidate: IceCandidatePayload, limit: usize) {
    while queue.len() >= limit.max(1) {
        queue.pop_front();
    }
    queue.push_back(candidate);
}

/// Mesh presence and per-peer negotiation state
pub struct MeshState {
    local_peer_id: String,
    phase: Phase,
    config: StateConfig,
    peers: BTreeMap<String, PeerState>,
    early_candidates: HashMap<String, VecDeque<IceCandidatePayload>>,
    next_generation: u64,
}

impl MeshState {
    pub fn new(local_peer_id: impl Into<String>, config: StateConfig) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            phase: Phase::Idle,
            config,
            peers: BTreeMap::new(),
            early_candidates: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerState> {
        self.peers.get(peer_id)
    }

    /// Peers ordered by ID
    pub fn peers(&self) -> impl Iterator<Item = (&String, &PeerState)> {
        self.peers.iter()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Candidates buffered for a peer that has no entry yet
    pub fn early_candidate_count(&self, peer_id: &str) -> usize {
        self.early_candidates.get(peer_id).map_or(0, |q| q.len())
    }

    /// Apply one event and return the effects to execute
    pub fn handle(&mut self, event: MeshEvent) -> Vec<Effect> {
        let mut effects = Vec::new();

        match event {
            MeshEvent::JoinRequested => self.on_join_requested(&mut effects),
            MeshEvent::JoinTimerElapsed => self.on_join_timer(&mut effects),
            MeshEvent::LeaveRequested => self.on_leave_requested(&mut effects),
            MeshEvent::SignalReceived(message) => self.on_signal(message, &mut effects),
            MeshEvent::OfferCreated {
                peer_id,
                generation,
                sdp,
            } => self.on_offer_created(peer_id, generation, sdp, &mut effects),
            MeshEvent::AnswerCreated {
                peer_id,
                generation,
                sdp,
            } => self.on_answer_created(peer_id, generation, sdp, &mut effects),
            MeshEvent::AnswerApplied {
                peer_id,
                generation,
            } => self.on_answer_applied(peer_id, generation, &mut effects),
            MeshEvent::NegotiationFailed {
                peer_id,
                generation,
                error,
            } => {
                if self.is_live(&peer_id, generation) {
                    warn!("Negotiation with {} failed: {}", peer_id, error);
                    self.remove_peer(&peer_id, RemovalReason::NegotiationFailed, &mut effects);
                }
            }
            MeshEvent::LocalCandidate {
                peer_id,
                generation,
                candidate,
            } => {
                if self.phase.is_active() && self.is_live(&peer_id, generation) {
                    effects.push(Effect::Publish(SignalingMessage::ice_candidate(
                        &self.local_peer_id,
                        peer_id,
                        &candidate,
                    )));
                }
            }
            MeshEvent::ConnectionStateChanged {
                peer_id,
                generation,
                state,
            } => self.on_connection_state(peer_id, generation, state, &mut effects),
            MeshEvent::IceRestartDue {
                peer_id,
                generation,
                attempt,
            } => self.on_ice_restart_due(peer_id, generation, attempt, &mut effects),
            MeshEvent::OfferTimedOut {
                peer_id,
                generation,
                offer_seq,
            } => {
                let expired = self.peers.get(&peer_id).is_some_and(|p| {
                    p.generation == generation
                        && p.offer_seq == offer_seq
                        && p.negotiation == NegotiationState::HaveLocalOffer
                });
                if expired {
                    warn!("Offer to {} went unanswered, dropping peer", peer_id);
                    self.remove_peer(&peer_id, RemovalReason::OfferTimeout, &mut effects);
                }
            }
            MeshEvent::RenegotiationNeeded {
                peer_id,
                generation,
            } => self.on_renegotiation_needed(peer_id, generation, &mut effects),
        }

        effects
    }

    fn is_live(&self, peer_id: &str, generation: u64) -> bool {
        self.peers.get(peer_id).is_some_and(|p| p.generation == generation)
    }

    fn allocate_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn on_join_requested(&mut self, effects: &mut Vec<Effect>) {
        if self.phase != Phase::Idle {
            debug!("Join ignored in phase {:?}", self.phase);
            return;
        }

        self.phase = Phase::Joining;
        effects.push(Effect::ScheduleJoinAnnouncement {
            max_jitter: self.config.join_jitter_max,
        });
    }

    fn on_join_timer(&mut self, effects: &mut Vec<Effect>) {
        if self.phase != Phase::Joining {
            return;
        }

        info!("Announcing {} to the room", self.local_peer_id);
        self.phase = Phase::Joined;
        effects.push(Effect::Publish(SignalingMessage::join(&self.local_peer_id)));
    }

    fn on_leave_requested(&mut self, effects: &mut Vec<Effect>) {
        match self.phase {
            Phase::Leaving | Phase::Left => return,
            Phase::Idle => {}
            Phase::Joining | Phase::Joined => {
                self.phase = Phase::Leaving;
                effects.push(Effect::Publish(SignalingMessage::leave(&self.local_peer_id)));

                let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
                for peer_id in peer_ids {
                    self.remove_peer(&peer_id, RemovalReason::LocalLeave, effects);
                }
            }
        }

        self.early_candidates.clear();
        self.phase = Phase::Left;
        effects.push(Effect::Shutdown);
    }

    fn on_signal(&mut self, message: SignalingMessage, effects: &mut Vec<Effect>) {
        if !self.phase.is_active() {
            debug!("Ignoring {} from {} in phase {:?}", message.kind, message.from_peer_id, self.phase);
            return;
        }

        if message.from_peer_id == self.local_peer_id {
            return;
        }

        if !message.is_addressed_to(&self.local_peer_id) {
            return;
        }

        if message.from_peer_id.is_empty() {
            warn!("Dropping {} without sender", message.kind);
            return;
        }

        match message.kind {
            MessageKind::Join => self.on_remote_join(message.from_peer_id, effects),
            MessageKind::Offer => match message.session_description() {
                Ok(desc) => self.on_remote_offer(message.from_peer_id, desc.sdp, effects),
                Err(e) => warn!("{}", e),
            },
            MessageKind::Answer => match message.session_description() {
                Ok(desc) => self.on_remote_answer(message.from_peer_id, desc.sdp, effects),
                Err(e) => warn!("{}", e),
            },
            MessageKind::IceCandidate => match message.ice_candidate_payload() {
                Ok(candidate) => self.on_remote_candidate(message.from_peer_id, candidate, effects),
                Err(e) => warn!("{}", e),
            },
            MessageKind::Leave => self.on_remote_leave(message.from_peer_id, effects),
        }
    }

    fn has_capacity(&self, peer_id: &str) -> bool {
        if self.peers.len() >= self.config.max_peers {
            warn!(
                "Ignoring {}: mesh is full ({} peers)",
                peer_id, self.config.max_peers
            );
            return false;
        }
        true
    }

    /// Create an entry, carrying over any early candidates
    fn insert_peer(&mut self, peer_id: &str, negotiation: NegotiationState) -> u64 {
        let generation = self.allocate_generation();
        let mut state = PeerState::new(generation, negotiation);
        if let Some(early) = self.early_candidates.remove(peer_id) {
            debug!("Moving {} early candidates onto {}", early.len(), peer_id);
            state.pending_candidates = early;
        }
        self.peers.insert(peer_id.to_string(), state);
        generation
    }

    fn begin_offer(&mut self, peer_id: &str, ice_restart: bool, effects: &mut Vec<Effect>) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.negotiation = NegotiationState::HaveLocalOffer;
            peer.offer_seq += 1;
            effects.push(Effect::CreateOffer {
                peer_id: peer_id.to_string(),
                generation: peer.generation,
                ice_restart,
            });
        }
    }

    fn on_remote_join(&mut self, peer_id: String, effects: &mut Vec<Effect>) {
        if self.peers.contains_key(&peer_id) {
            debug!("Duplicate join from {}", peer_id);
            return;
        }
        if !self.has_capacity(&peer_id) {
            return;
        }

        info!("Peer {} joined, sending offer", peer_id);
        let generation = self.insert_peer(&peer_id, NegotiationState::New);
        effects.push(Effect::OpenConnection {
            peer_id: peer_id.clone(),
            generation,
        });
        effects.push(Effect::PeerAdded {
            peer_id: peer_id.clone(),
        });
        self.begin_offer(&peer_id, false, effects);
    }

    fn on_remote_offer(&mut self, peer_id: String, sdp: String, effects: &mut Vec<Effect>) {
        let local_polite = is_polite(&self.local_peer_id, &peer_id);

        let generation = match self.peers.get_mut(&peer_id) {
            None => {
                if !self.has_capacity(&peer_id) {
                    return;
                }
                info!("Offer from unknown peer {}, accepting", peer_id);
                let generation = self.insert_peer(&peer_id, NegotiationState::HaveRemoteOffer);
                effects.push(Effect::OpenConnection {
                    peer_id: peer_id.clone(),
                    generation,
                });
                effects.push(Effect::PeerAdded {
                    peer_id: peer_id.clone(),
                });
                generation
            }
            Some(peer) => match peer.negotiation {
                NegotiationState::HaveRemoteOffer => {
                    debug!("Duplicate offer from {}", peer_id);
                    return;
                }
                NegotiationState::HaveLocalOffer if !local_polite => {
                    debug!("Offer collision with {}: keeping our offer", peer_id);
                    return;
                }
                NegotiationState::HaveLocalOffer if peer.remote_description_set => {
                    info!("Renegotiation collision with {}: rolling back our offer", peer_id);
                    peer.negotiation = NegotiationState::HaveRemoteOffer;
                    peer.renegotiate_when_stable = true;
                    effects.push(Effect::RollbackOffer {
                        peer_id: peer_id.clone(),
                        generation: peer.generation,
                    });
                    peer.generation
                }
                NegotiationState::HaveLocalOffer => {
                    info!("Offer collision with {}: yielding", peer_id);
                    let stale = peer.generation;
                    let pending = std::mem::take(&mut peer.pending_candidates);
                    let attempts = peer.ice_restart_attempts;
                    effects.push(Effect::CloseConnection {
                        peer_id: peer_id.clone(),
                        generation: stale,
                    });

                    let generation = self.allocate_generation();
                    let mut fresh = PeerState::new(generation, NegotiationState::HaveRemoteOffer);
                    fresh.pending_candidates = pending;
                    fresh.ice_restart_attempts = attempts;
                    self.peers.insert(peer_id.clone(), fresh);
                    effects.push(Effect::OpenConnection {
                        peer_id: peer_id.clone(),
                        generation,
                    });
                    generation
                }
                NegotiationState::New | NegotiationState::Stable => {
                    debug!("Renegotiation offer from {}", peer_id);
                    peer.negotiation = NegotiationState::HaveRemoteOffer;
                    peer.generation
                }
                NegotiationState::Closed => return,
            },
        };

        effects.push(Effect::AcceptOffer {
            peer_id,
            generation,
            sdp,
        });
    }

    fn on_remote_answer(&mut self, peer_id: String, sdp: String, effects: &mut Vec<Effect>) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            debug!("Answer from unknown peer {}", peer_id);
            return;
        };

        if peer.negotiation != NegotiationState::HaveLocalOffer {
            debug!(
                "Unexpected answer from {} in state {:?}",
                peer_id, peer.negotiation
            );
            return;
        }

        peer.negotiation = NegotiationState::Stable;
        effects.push(Effect::ApplyAnswer {
            peer_id,
            generation: peer.generation,
            sdp,
        });
    }

    fn on_remote_candidate(
        &mut self,
        peer_id: String,
        candidate: IceCandidatePayload,
        effects: &mut Vec<Effect>,
    ) {
        let limit = self.config.candidate_buffer_limit;

        match self.peers.get_mut(&peer_id) {
            Some(peer) if peer.remote_description_set => {
                effects.push(Effect::AddCandidate {
                    peer_id,
                    generation: peer.generation,
                    candidate,
                });
            }
            Some(peer) => push_bounded(&mut peer.pending_candidates, candidate, limit),
            None if self.config.buffer_early_candidates => {
                let queue = self.early_candidates.entry(peer_id).or_default();
                push_bounded(queue, candidate, limit);
            }
            None => debug!("Dropping candidate from unknown peer {}", peer_id),
        }
    }

    fn on_remote_leave(&mut self, peer_id: String, effects: &mut Vec<Effect>) {
        self.early_candidates.remove(&peer_id);
        if self.peers.contains_key(&peer_id) {
            info!("Peer {} left", peer_id);
            self.remove_peer(&peer_id, RemovalReason::Left, effects);
        }
    }

    fn on_offer_created(&mut self, peer_id: String, generation: u64, sdp: String, effects: &mut Vec<Effect>) {
        if !self.phase.is_active() {
            return;
        }
        let Some(peer) = self.peers.get(&peer_id).filter(|p| p.generation == generation) else {
            debug!("Dropping stale offer for {} (generation {})", peer_id, generation);
            return;
        };
        if peer.negotiation != NegotiationState::HaveLocalOffer {
            debug!("Dropping rolled back offer for {}", peer_id);
            return;
        }

        effects.push(Effect::Publish(SignalingMessage::offer(
            &self.local_peer_id,
            &peer_id,
            sdp,
        )));

        if let Some(after) = self.config.offer_timeout {
            effects.push(Effect::ScheduleOfferTimeout {
                peer_id,
                generation,
                offer_seq: peer.offer_seq,
                after,
            });
        }
    }

    fn on_answer_created(&mut self, peer_id: String, generation: u64, sdp: String, effects: &mut Vec<Effect>) {
        if !self.phase.is_active() || !self.is_live(&peer_id, generation) {
            debug!("Dropping stale answer for {} (generation {})", peer_id, generation);
            return;
        }

        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.negotiation = NegotiationState::Stable;
        }
        effects.push(Effect::Publish(SignalingMessage::answer(
            &self.local_peer_id,
            &peer_id,
            sdp,
        )));
        self.on_remote_description_set(&peer_id, effects);
    }

    fn on_answer_applied(&mut self, peer_id: String, generation: u64, effects: &mut Vec<Effect>) {
        if !self.is_live(&peer_id, generation) {
            return;
        }
        self.on_remote_description_set(&peer_id, effects);
    }

    /// Flush queued candidates and run a deferred renegotiation
    fn on_remote_description_set(&mut self, peer_id: &str, effects: &mut Vec<Effect>) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };

        peer.remote_description_set = true;
        let generation = peer.generation;
        for candidate in peer.pending_candidates.drain(..) {
            effects.push(Effect::AddCandidate {
                peer_id: peer_id.to_string(),
                generation,
                candidate,
            });
        }

        if peer.renegotiate_when_stable && peer.negotiation == NegotiationState::Stable {
            peer.renegotiate_when_stable = false;
            self.begin_offer(peer_id, false, effects);
        }
    }

    fn on_connection_state(
        &mut self,
        peer_id: String,
        generation: u64,
        state: ConnectionState,
        effects: &mut Vec<Effect>,
    ) {
        let local_polite = is_polite(&self.local_peer_id, &peer_id);
        let Some(peer) = self.peers.get_mut(&peer_id).filter(|p| p.generation == generation) else {
            return;
        };

        debug!("Peer {} connection {:?} -> {:?}", peer_id, peer.connection, state);
        peer.connection = state;

        match state {
            ConnectionState::Connected => {
                peer.ice_restart_attempts = 0;
            }
            ConnectionState::Failed => {
                peer.ice_restart_attempts += 1;
                let attempt = peer.ice_restart_attempts;

                if !self.config.ice_restart.should_restart(attempt) {
                    warn!("ICE restarts exhausted for {}, dropping peer", peer_id);
                    self.remove_peer(&peer_id, RemovalReason::IceFailed, effects);
                } else if local_polite {
                    debug!("ICE failed with {}, waiting for restart offer", peer_id);
                } else {
                    info!("ICE failed with {}, scheduling restart {}", peer_id, attempt);
                    effects.push(Effect::ScheduleIceRestart {
                        peer_id,
                        generation,
                        attempt,
                    });
                }
            }
            ConnectionState::Closed => {
                info!("Connection to {} closed remotely", peer_id);
                self.remove_peer(&peer_id, RemovalReason::ConnectionClosed, effects);
            }
            ConnectionState::New | ConnectionState::Connecting | ConnectionState::Disconnected => {}
        }
    }

    fn on_ice_restart_due(&mut self, peer_id: String, generation: u64, attempt: u32, effects: &mut Vec<Effect>) {
        if !self.phase.is_active() {
            return;
        }
        let Some(peer) = self.peers.get(&peer_id).filter(|p| p.generation == generation) else {
            return;
        };

        if peer.ice_restart_attempts != attempt || peer.connection != ConnectionState::Failed {
            debug!("Skipping stale ICE restart {} for {}", attempt, peer_id);
            return;
        }
        if peer.negotiation != NegotiationState::Stable {
            debug!("Skipping ICE restart for {}: negotiation in progress", peer_id);
            return;
        }

        self.begin_offer(&peer_id, true, effects);
    }

    fn on_renegotiation_needed(&mut self, peer_id: String, generation: u64, effects: &mut Vec<Effect>) {
        if !self.phase.is_active() {
            return;
        }
        let Some(peer) = self.peers.get_mut(&peer_id).filter(|p| p.generation == generation) else {
            return;
        };

        if peer.negotiation == NegotiationState::Stable && peer.remote_description_set {
            self.begin_offer(&peer_id, false, effects);
        } else {
            peer.renegotiate_when_stable = true;
        }
    }

    fn remove_peer(&mut self, peer_id: &str, reason: RemovalReason, effects: &mut Vec<Effect>) {
        if let Some(peer) = self.peers.remove(peer_id) {
            effects.push(Effect::CloseConnection {
                peer_id: peer_id.to_string(),
                generation: peer.generation,
            });
            effects.push(Effect::PeerRemoved {
                peer_id: peer_id.to_string(),
                reason,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(local: &str) -> MeshState {
        let mut state = MeshState::new(local, StateConfig::default());
        state.handle(MeshEvent::JoinRequested);
        state.handle(MeshEvent::JoinTimerElapsed);
        state
    }

    fn signal(message: SignalingMessage) -> MeshEvent {
        MeshEvent::SignalReceived(message)
    }

    fn candidate(n: u32) -> IceCandidatePayload {
        IceCandidatePayload {
            candidate: format!("candidate:{} 1 udp 1 10.0.0.1 9 typ host", n),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    fn published(effects: &[Effect]) -> Vec<&SignalingMessage> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Publish(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_join_is_announced_after_timer() {
        let mut state = MeshState::new("alice", StateConfig::default());

        let effects = state.handle(MeshEvent::JoinRequested);
        assert_eq!(state.phase(), Phase::Joining);
        assert!(matches!(effects[..], [Effect::ScheduleJoinAnnouncement { .. }]));
        assert!(state.handle(MeshEvent::JoinRequested).is_empty());

        let effects = state.handle(MeshEvent::JoinTimerElapsed);
        assert_eq!(state.phase(), Phase::Joined);
        assert_eq!(published(&effects)[0].kind, MessageKind::Join);
    }

    #[test]
    fn test_join_receiver_offers() {
        let mut state = joined("alice");
        let effects = state.handle(signal(SignalingMessage::join("bob")));

        assert_eq!(
            effects,
            vec![
                Effect::OpenConnection {
                    peer_id: "bob".to_string(),
                    generation: 1
                },
                Effect::PeerAdded {
                    peer_id: "bob".to_string()
                },
                Effect::CreateOffer {
                    peer_id: "bob".to_string(),
                    generation: 1,
                    ice_restart: false
                },
            ]
        );
        assert_eq!(
            state.peer("bob").unwrap().negotiation,
            NegotiationState::HaveLocalOffer
        );
    }

    #[test]
    fn test_duplicate_join_creates_no_second_entry() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::join("bob")));
        assert!(state.handle(signal(SignalingMessage::join("bob"))).is_empty());
        assert_eq!(state.peer_count(), 1);
    }

    #[test]
    fn test_self_echo_ignored() {
        let mut state = joined("alice");
        assert!(state.handle(signal(SignalingMessage::join("alice"))).is_empty());
        assert!(state
            .handle(signal(SignalingMessage::offer("alice", "alice", "v=0")))
            .is_empty());
        assert_eq!(state.peer_count(), 0);
    }

    #[test]
    fn test_messages_for_other_peers_ignored() {
        let mut state = joined("alice");
        assert!(state
            .handle(signal(SignalingMessage::offer("bob", "carol", "v=0")))
            .is_empty());
        assert_eq!(state.peer_count(), 0);
    }

    #[test]
    fn test_signals_ignored_before_join() {
        let mut state = MeshState::new("alice", StateConfig::default());
        assert!(state.handle(signal(SignalingMessage::join("bob"))).is_empty());
    }

    #[test]
    fn test_offer_from_unknown_peer_is_implicit_join() {
        let mut state = joined("alice");
        let effects = state.handle(signal(SignalingMessage::offer("bob", "alice", "v=0")));

        assert!(matches!(effects[0], Effect::OpenConnection { generation: 1, .. }));
        assert!(matches!(
            effects.last(),
            Some(Effect::AcceptOffer { sdp, .. }) if sdp == "v=0"
        ));

        let effects = state.handle(MeshEvent::AnswerCreated {
            peer_id: "bob".to_string(),
            generation: 1,
            sdp: "answer".to_string(),
        });
        let messages = published(&effects);
        assert_eq!(messages[0].kind, MessageKind::Answer);
        assert_eq!(messages[0].to_peer_id.as_deref(), Some("bob"));
        assert_eq!(state.peer("bob").unwrap().negotiation, NegotiationState::Stable);
    }

    #[test]
    fn test_duplicate_offer_dropped() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::offer("bob", "alice", "v=0")));
        assert!(state
            .handle(signal(SignalingMessage::offer("bob", "alice", "v=0")))
            .is_empty());
    }

    #[test]
    fn test_unexpected_answer_dropped() {
        let mut state = joined("alice");
        assert!(state
            .handle(signal(SignalingMessage::answer("bob", "alice", "v=0")))
            .is_empty());

        state.handle(signal(SignalingMessage::offer("bob", "alice", "v=0")));
        assert!(state
            .handle(signal(SignalingMessage::answer("bob", "alice", "v=0")))
            .is_empty());
    }

    #[test]
    fn test_answer_applies_once() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::join("bob")));

        let effects = state.handle(signal(SignalingMessage::answer("bob", "alice", "a")));
        assert!(matches!(effects[..], [Effect::ApplyAnswer { .. }]));
        assert!(state
            .handle(signal(SignalingMessage::answer("bob", "alice", "a")))
            .is_empty());
    }

    #[test]
    fn test_early_candidates_buffered_and_flushed() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::ice_candidate("bob", "alice", &candidate(1))));
        state.handle(signal(SignalingMessage::ice_candidate("bob", "alice", &candidate(2))));
        assert_eq!(state.early_candidate_count("bob"), 2);

        state.handle(signal(SignalingMessage::offer("bob", "alice", "v=0")));
        assert_eq!(state.early_candidate_count("bob"), 0);
        assert_eq!(state.peer("bob").unwrap().pending_candidates.len(), 2);

        let effects = state.handle(MeshEvent::AnswerCreated {
            peer_id: "bob".to_string(),
            generation: 1,
            sdp: "answer".to_string(),
        });
        let added: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::AddCandidate { candidate, .. } => Some(candidate.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(added, vec![candidate(1), candidate(2)]);

        let effects = state.handle(signal(SignalingMessage::ice_candidate("bob", "alice", &candidate(3))));
        assert!(matches!(effects[..], [Effect::AddCandidate { .. }]));
    }

    #[test]
    fn test_early_candidate_buffer_is_bounded() {
        let config = StateConfig {
            candidate_buffer_limit: 2,
            ..Default::default()
        };
        let mut state = MeshState::new("alice", config);
        state.handle(MeshEvent::JoinRequested);

        for n in 0..5 {
            state.handle(signal(SignalingMessage::ice_candidate("bob", "alice", &candidate(n))));
        }
        assert_eq!(state.early_candidate_count("bob"), 2);

        state.handle(signal(SignalingMessage::offer("bob", "alice", "v=0")));
        let pending: Vec<_> = state.peer("bob").unwrap().pending_candidates.iter().cloned().collect();
        assert_eq!(pending, vec![candidate(3), candidate(4)]);
    }

    #[test]
    fn test_early_candidates_dropped_when_disabled() {
        let config = StateConfig {
            buffer_early_candidates: false,
            ..Default::default()
        };
        let mut state = MeshState::new("alice", config);
        state.handle(MeshEvent::JoinRequested);
        state.handle(signal(SignalingMessage::ice_candidate("bob", "alice", &candidate(1))));
        assert_eq!(state.early_candidate_count("bob"), 0);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::join("bob")));
        state.handle(signal(SignalingMessage::ice_candidate("carol", "alice", &candidate(1))));

        let effects = state.handle(signal(SignalingMessage::leave("bob")));
        assert!(effects.contains(&Effect::CloseConnection {
            peer_id: "bob".to_string(),
            generation: 1
        }));
        assert!(effects.contains(&Effect::PeerRemoved {
            peer_id: "bob".to_string(),
            reason: RemovalReason::Left
        }));
        assert!(state.handle(signal(SignalingMessage::leave("bob"))).is_empty());

        state.handle(signal(SignalingMessage::leave("carol")));
        assert_eq!(state.early_candidate_count("carol"), 0);
    }

    #[test]
    fn test_local_leave_tears_everything_down() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::join("bob")));
        state.handle(signal(SignalingMessage::join("carol")));

        let effects = state.handle(MeshEvent::LeaveRequested);
        assert_eq!(published(&effects)[0].kind, MessageKind::Leave);
        assert_eq!(
            effects
                .iter()
                .filter(|e| matches!(e, Effect::CloseConnection { .. }))
                .count(),
            2
        );
        assert_eq!(effects.last(), Some(&Effect::Shutdown));
        assert_eq!(state.phase(), Phase::Left);
        assert_eq!(state.peer_count(), 0);

        assert!(state.handle(MeshEvent::LeaveRequested).is_empty());
        assert!(state.handle(signal(SignalingMessage::join("dave"))).is_empty());
    }

    #[test]
    fn test_leave_before_join_announcement() {
        let mut state = MeshState::new("alice", StateConfig::default());
        state.handle(MeshEvent::JoinRequested);
        state.handle(MeshEvent::LeaveRequested);

        assert!(state.handle(MeshEvent::JoinTimerElapsed).is_empty());
        assert_eq!(state.phase(), Phase::Left);
    }

    #[test]
    fn test_stale_results_dropped() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::join("bob")));

        let effects = state.handle(MeshEvent::OfferCreated {
            peer_id: "bob".to_string(),
            generation: 99,
            sdp: "stale".to_string(),
        });
        assert!(effects.is_empty());

        let effects = state.handle(MeshEvent::LocalCandidate {
            peer_id: "bob".to_string(),
            generation: 99,
            candidate: candidate(1),
        });
        assert!(effects.is_empty());

        let effects = state.handle(MeshEvent::ConnectionStateChanged {
            peer_id: "bob".to_string(),
            generation: 99,
            state: ConnectionState::Closed,
        });
        assert!(effects.is_empty());
        assert_eq!(state.peer_count(), 1);
    }

    #[test]
    fn test_polite_rule() {
        assert!(is_polite("alice", "bob"));
        assert!(!is_polite("bob", "alice"));
    }

    #[test]
    fn test_glare_impolite_keeps_offer() {
        let mut state = joined("bob");
        state.handle(signal(SignalingMessage::join("alice")));
        assert!(state
            .handle(signal(SignalingMessage::offer("alice", "bob", "v=0")))
            .is_empty());
        assert_eq!(
            state.peer("alice").unwrap().negotiation,
            NegotiationState::HaveLocalOffer
        );
    }

    #[test]
    fn test_glare_polite_rebuilds_connection() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::join("bob")));

        let effects = state.handle(signal(SignalingMessage::offer("bob", "alice", "v=0")));
        assert_eq!(
            effects,
            vec![
                Effect::CloseConnection {
                    peer_id: "bob".to_string(),
                    generation: 1
                },
                Effect::OpenConnection {
                    peer_id: "bob".to_string(),
                    generation: 2
                },
                Effect::AcceptOffer {
                    peer_id: "bob".to_string(),
                    generation: 2,
                    sdp: "v=0".to_string()
                },
            ]
        );
        assert_eq!(state.peer_count(), 1);
        assert_eq!(state.peer("bob").unwrap().generation, 2);
    }

    /// alice (polite) and bob with a completed first exchange at generation 1
    fn established_with_bob() -> MeshState {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::join("bob")));
        state.handle(MeshEvent::OfferCreated {
            peer_id: "bob".to_string(),
            generation: 1,
            sdp: "offer".to_string(),
        });
        state.handle(signal(SignalingMessage::answer("bob", "alice", "answer")));
        state.handle(MeshEvent::AnswerApplied {
            peer_id: "bob".to_string(),
            generation: 1,
        });
        state.handle(MeshEvent::ConnectionStateChanged {
            peer_id: "bob".to_string(),
            generation: 1,
            state: ConnectionState::Connected,
        });
        state
    }

    #[test]
    fn test_renegotiation_glare_rolls_back_on_same_connection() {
        let mut state = established_with_bob();

        let effects = state.handle(MeshEvent::RenegotiationNeeded {
            peer_id: "bob".to_string(),
            generation: 1,
        });
        assert!(matches!(effects[..], [Effect::CreateOffer { generation: 1, .. }]));

        let effects = state.handle(signal(SignalingMessage::offer("bob", "alice", "reoffer")));
        assert_eq!(
            effects,
            vec![
                Effect::RollbackOffer {
                    peer_id: "bob".to_string(),
                    generation: 1
                },
                Effect::AcceptOffer {
                    peer_id: "bob".to_string(),
                    generation: 1,
                    sdp: "reoffer".to_string()
                },
            ]
        );
        let bob = state.peer("bob").unwrap();
        assert_eq!(bob.generation, 1);
        assert_eq!(bob.connection, ConnectionState::Connected);
        assert_eq!(bob.negotiation, NegotiationState::HaveRemoteOffer);

        // Our offer resolved after the rollback is never sent
        let effects = state.handle(MeshEvent::OfferCreated {
            peer_id: "bob".to_string(),
            generation: 1,
            sdp: "late".to_string(),
        });
        assert!(published(&effects).is_empty());

        // Answering bob lets our own change go out again
        let effects = state.handle(MeshEvent::AnswerCreated {
            peer_id: "bob".to_string(),
            generation: 1,
            sdp: "answer".to_string(),
        });
        assert_eq!(published(&effects)[0].kind, MessageKind::Answer);
        assert!(matches!(
            effects.last(),
            Some(Effect::CreateOffer { generation: 1, ice_restart: false, .. })
        ));
        assert_eq!(state.peer("bob").unwrap().negotiation, NegotiationState::HaveLocalOffer);
    }

    #[test]
    fn test_renegotiation_glare_impolite_side_ignores_offer() {
        let mut state = joined("bob");
        state.handle(signal(SignalingMessage::join("alice")));
        state.handle(signal(SignalingMessage::answer("alice", "bob", "answer")));
        state.handle(MeshEvent::AnswerApplied {
            peer_id: "alice".to_string(),
            generation: 1,
        });
        state.handle(MeshEvent::RenegotiationNeeded {
            peer_id: "alice".to_string(),
            generation: 1,
        });

        assert!(state
            .handle(signal(SignalingMessage::offer("alice", "bob", "reoffer")))
            .is_empty());
        assert_eq!(state.peer("alice").unwrap().generation, 1);
    }

    /// Deliver `inbox` to `state`, completing async effects immediately
    /// and queueing published messages on `outbox`
    fn step(state: &mut MeshState, inbox: &mut Vec<MeshEvent>, outbox: &mut Vec<MeshEvent>) {
        let events: Vec<_> = inbox.drain(..).collect();
        for event in events {
            for effect in state.handle(event) {
                match effect {
                    Effect::Publish(m) => outbox.push(MeshEvent::SignalReceived(m)),
                    Effect::CreateOffer {
                        peer_id, generation, ..
                    } => inbox.push(MeshEvent::OfferCreated {
                        peer_id,
                        generation,
                        sdp: format!("offer-{}", generation),
                    }),
                    Effect::AcceptOffer {
                        peer_id, generation, ..
                    } => inbox.push(MeshEvent::AnswerCreated {
                        peer_id,
                        generation,
                        sdp: format!("answer-{}", generation),
                    }),
                    Effect::ApplyAnswer {
                        peer_id, generation, ..
                    } => inbox.push(MeshEvent::AnswerApplied {
                        peer_id,
                        generation,
                    }),
                    _ => {}
                }
            }
        }
    }

    /// Drive two state machines against each other until both go quiet
    fn run_pair(a: &mut MeshState, b: &mut MeshState, mut inbox_a: Vec<MeshEvent>, mut inbox_b: Vec<MeshEvent>) {
        for _ in 0..100 {
            if inbox_a.is_empty() && inbox_b.is_empty() {
                return;
            }
            step(a, &mut inbox_a, &mut inbox_b);
            step(b, &mut inbox_b, &mut inbox_a);
        }
        panic!("pair did not settle");
    }

    #[test]
    fn test_simultaneous_join_converges() {
        for (first, second) in [("alice", "bob"), ("bob", "alice")] {
            let mut a = joined(first);
            let mut b = joined(second);

            // Both see each other's join before either offer arrives
            let join_a = signal(SignalingMessage::join(first));
            let join_b = signal(SignalingMessage::join(second));
            run_pair(&mut a, &mut b, vec![join_b], vec![join_a]);

            for (state, remote) in [(&a, second), (&b, first)] {
                assert_eq!(state.peer_count(), 1);
                assert_eq!(state.peer(remote).unwrap().negotiation, NegotiationState::Stable);
            }

            // The polite side (alice) rebuilt once; bob kept his first connection
            let alice = if first == "alice" { &a } else { &b };
            let bob = if first == "alice" { &b } else { &a };
            assert_eq!(alice.peer("bob").unwrap().generation, 2);
            assert_eq!(bob.peer("alice").unwrap().generation, 1);
        }
    }

    #[test]
    fn test_ice_restart_bounded() {
        let config = StateConfig {
            ice_restart: IceRestartPolicy {
                max_attempts: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut state = MeshState::new("bob", config);
        state.handle(MeshEvent::JoinRequested);
        state.handle(signal(SignalingMessage::join("alice")));
        state.handle(signal(SignalingMessage::answer("alice", "bob", "a")));
        state.handle(MeshEvent::AnswerApplied {
            peer_id: "alice".to_string(),
            generation: 1,
        });

        let failed = || MeshEvent::ConnectionStateChanged {
            peer_id: "alice".to_string(),
            generation: 1,
            state: ConnectionState::Failed,
        };

        // bob is impolite towards alice and drives the restart
        let effects = state.handle(failed());
        assert_eq!(
            effects,
            vec![Effect::ScheduleIceRestart {
                peer_id: "alice".to_string(),
                generation: 1,
                attempt: 1
            }]
        );

        let effects = state.handle(MeshEvent::IceRestartDue {
            peer_id: "alice".to_string(),
            generation: 1,
            attempt: 1,
        });
        assert!(matches!(effects[..], [Effect::CreateOffer { ice_restart: true, .. }]));
        state.handle(signal(SignalingMessage::answer("alice", "bob", "a2")));

        assert!(matches!(state.handle(failed())[..], [Effect::ScheduleIceRestart { attempt: 2, .. }]));

        let effects = state.handle(failed());
        assert!(effects.contains(&Effect::PeerRemoved {
            peer_id: "alice".to_string(),
            reason: RemovalReason::IceFailed
        }));
        assert_eq!(state.peer_count(), 0);
    }

    #[test]
    fn test_connected_resets_restart_counter() {
        let mut state = joined("bob");
        state.handle(signal(SignalingMessage::join("alice")));

        for s in [ConnectionState::Failed, ConnectionState::Connected] {
            state.handle(MeshEvent::ConnectionStateChanged {
                peer_id: "alice".to_string(),
                generation: 1,
                state: s,
            });
        }
        assert_eq!(state.peer("alice").unwrap().ice_restart_attempts, 0);
    }

    #[test]
    fn test_polite_side_waits_for_restart() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::offer("bob", "alice", "v=0")));

        let effects = state.handle(MeshEvent::ConnectionStateChanged {
            peer_id: "bob".to_string(),
            generation: 1,
            state: ConnectionState::Failed,
        });
        assert!(effects.is_empty());
        assert_eq!(state.peer("bob").unwrap().ice_restart_attempts, 1);
    }

    #[test]
    fn test_disconnected_is_recorded_only() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::join("bob")));
        let effects = state.handle(MeshEvent::ConnectionStateChanged {
            peer_id: "bob".to_string(),
            generation: 1,
            state: ConnectionState::Disconnected,
        });
        assert!(effects.is_empty());
        assert_eq!(state.peer("bob").unwrap().connection, ConnectionState::Disconnected);
    }

    #[test]
    fn test_remote_close_tears_down() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::join("bob")));
        let effects = state.handle(MeshEvent::ConnectionStateChanged {
            peer_id: "bob".to_string(),
            generation: 1,
            state: ConnectionState::Closed,
        });
        assert!(effects.contains(&Effect::PeerRemoved {
            peer_id: "bob".to_string(),
            reason: RemovalReason::ConnectionClosed
        }));
    }

    #[test]
    fn test_offer_timeout_only_when_configured() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::join("bob")));
        let effects = state.handle(MeshEvent::OfferCreated {
            peer_id: "bob".to_string(),
            generation: 1,
            sdp: "o".to_string(),
        });
        assert!(!effects.iter().any(|e| matches!(e, Effect::ScheduleOfferTimeout { .. })));

        let config = StateConfig {
            offer_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let mut state = MeshState::new("alice", config);
        state.handle(MeshEvent::JoinRequested);
        state.handle(signal(SignalingMessage::join("bob")));
        let effects = state.handle(MeshEvent::OfferCreated {
            peer_id: "bob".to_string(),
            generation: 1,
            sdp: "o".to_string(),
        });
        assert!(effects.contains(&Effect::ScheduleOfferTimeout {
            peer_id: "bob".to_string(),
            generation: 1,
            offer_seq: 1,
            after: Duration::from_secs(5)
        }));

        let effects = state.handle(MeshEvent::OfferTimedOut {
            peer_id: "bob".to_string(),
            generation: 1,
            offer_seq: 1,
        });
        assert!(effects.contains(&Effect::PeerRemoved {
            peer_id: "bob".to_string(),
            reason: RemovalReason::OfferTimeout
        }));
    }

    #[test]
    fn test_answered_offer_does_not_time_out() {
        let config = StateConfig {
            offer_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let mut state = MeshState::new("alice", config);
        state.handle(MeshEvent::JoinRequested);
        state.handle(signal(SignalingMessage::join("bob")));
        state.handle(signal(SignalingMessage::answer("bob", "alice", "a")));

        assert!(state
            .handle(MeshEvent::OfferTimedOut {
                peer_id: "bob".to_string(),
                generation: 1,
                offer_seq: 1,
            })
            .is_empty());
        assert_eq!(state.peer_count(), 1);
    }

    #[test]
    fn test_max_peers_enforced() {
        let config = StateConfig {
            max_peers: 1,
            ..Default::default()
        };
        let mut state = MeshState::new("alice", config);
        state.handle(MeshEvent::JoinRequested);
        state.handle(signal(SignalingMessage::join("bob")));

        assert!(state.handle(signal(SignalingMessage::join("carol"))).is_empty());
        assert!(state
            .handle(signal(SignalingMessage::offer("dave", "alice", "v=0")))
            .is_empty());
        assert_eq!(state.peer_count(), 1);
    }

    #[test]
    fn test_renegotiation_deferred_until_stable() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::join("bob")));

        let effects = state.handle(MeshEvent::RenegotiationNeeded {
            peer_id: "bob".to_string(),
            generation: 1,
        });
        assert!(effects.is_empty());

        state.handle(signal(SignalingMessage::answer("bob", "alice", "a")));
        let effects = state.handle(MeshEvent::AnswerApplied {
            peer_id: "bob".to_string(),
            generation: 1,
        });
        assert!(matches!(
            effects.last(),
            Some(Effect::CreateOffer { ice_restart: false, .. })
        ));
        assert_eq!(state.peer("bob").unwrap().offer_seq, 2);
    }

    #[test]
    fn test_negotiation_failure_drops_peer() {
        let mut state = joined("alice");
        state.handle(signal(SignalingMessage::join("bob")));
        let effects = state.handle(MeshEvent::NegotiationFailed {
            peer_id: "bob".to_string(),
            generation: 1,
            error: "bad sdp".to_string(),
        });
        assert!(effects.contains(&Effect::PeerRemoved {
            peer_id: "bob".to_string(),
            reason: RemovalReason::NegotiationFailed
        }));
    }

    #[test]
    fn test_malformed_payload_dropped() {
        let mut state = joined("alice");
        let mut offer = SignalingMessage::offer("bob", "alice", "v=0");
        offer.payload = serde_json::json!("garbage");
        assert!(state.handle(signal(offer)).is_empty());
        assert_eq!(state.peer_count(), 0);
    }
}
