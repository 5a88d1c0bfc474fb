//! Room-scoped broadcast channel contract and an in-process implementation

use super::protocol::SignalingMessage;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered messages per subscriber before it starts lagging
pub const CHANNEL_CAPACITY: usize = 256;

/// Room-scoped broadcast channel used for mesh signaling
///
/// Every published message is delivered to every subscriber of the same
/// room, including the publisher's own subscriptions. Delivery order between
/// different senders is not guaranteed.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Room this channel is bound to
    fn room_id(&self) -> &str;

    /// Broadcast a message to the room
    async fn publish(&self, message: &SignalingMessage) -> Result<()>;

    /// Subscribe to messages delivered to the room
    fn subscribe(&self) -> broadcast::Receiver<SignalingMessage>;

    /// Stop publishing; subsequent `publish` calls fail
    async fn close(&self) -> Result<()>;
}

/// In-process signaling hub: one broadcast bus per room
///
/// Useful for tests and for meshes whose peers live in one process.
#[derive(Clone, Default)]
pub struct InMemorySignalingHub {
    rooms: Arc<Mutex<HashMap<String, broadcast::Sender<SignalingMessage>>>>,
}

impl InMemorySignalingHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel onto `room_id`, creating the room on first use
    pub fn channel(&self, room_id: &str) -> InMemorySignalingChannel {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let sender = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();

        InMemorySignalingChannel {
            room_id: room_id.to_string(),
            sender,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of rooms opened so far
    pub fn room_count(&self) -> usize {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Channel handle returned by [`InMemorySignalingHub::channel`]
pub struct InMemorySignalingChannel {
    room_id: String,
    sender: broadcast::Sender<SignalingMessage>,
    closed: AtomicBool,
}

impl InMemorySignalingChannel {
    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for InMemorySignalingChannel {
    fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn publish(&self, message: &SignalingMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SignalingError(format!(
                "Channel for room {} is closed",
                self.room_id
            )));
        }

        debug!(
            room_id = %self.room_id,
            kind = %message.kind,
            from = %message.from_peer_id,
            "Publishing signaling message"
        );

        // No subscribers is not an error: the room may simply be empty
        let _ = self.sender.send(message.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingMessage> {
        self.sender.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
