//! WebSocket signaling client bound to one room

use super::room_url;
use crate::signaling::channel::{SignalingChannel, CHANNEL_CAPACITY};
use crate::signaling::protocol::SignalingMessage;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// [`SignalingChannel`] over a WebSocket connection to a room relay
pub struct WebSocketSignalingChannel {
    room_id: String,

    /// Outgoing frames, drained by the sender task
    tx: mpsc::UnboundedSender<Message>,

    /// Decoded incoming messages; taken once the relay connection ends so
    /// subscribers observe `RecvError::Closed`
    incoming: Arc<Mutex<Option<broadcast::Sender<SignalingMessage>>>>,

    closed: Arc<AtomicBool>,
}

impl WebSocketSignalingChannel {
    /// Connect to `{base_url}/rooms/{room_id}`
    ///
    /// Spawns background tasks for sending and receiving frames.
    pub async fn connect(base_url: &str, room_id: &str) -> Result<Self> {
        let url = room_url(base_url, room_id);
        info!("Connecting to signaling relay: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect to {}: {}", url, e)))?;

        info!(room_id = %room_id, "Connected to signaling relay");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let incoming = Arc::new(Mutex::new(Some(sender.clone())));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(Self::sender_task(write, rx));
        tokio::spawn(Self::receiver_task(
            read,
            sender,
            Arc::clone(&incoming),
            Arc::clone(&closed),
        ));

        Ok(Self {
            room_id: room_id.to_string(),
            tx,
            incoming,
            closed,
        })
    }

    /// Sender task: forwards queued frames to the socket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if is_close {
                break;
            }
        }

        debug!("Sender task terminated");
    }

    /// Receiver task: decodes text frames and rebroadcasts them
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        incoming: broadcast::Sender<SignalingMessage>,
        shared: Arc<Mutex<Option<broadcast::Sender<SignalingMessage>>>>,
        closed: Arc<AtomicBool>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match SignalingMessage::from_json(&text) {
                    Ok(message) => {
                        let _ = incoming.send(message);
                    }
                    Err(e) => {
                        warn!("Dropping malformed signaling frame: {}", e);
                    }
                },
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        closed.store(true, Ordering::SeqCst);
        // Last senders go away here; every subscriber sees the channel close
        shared.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(incoming);
        debug!("Receiver task terminated");
    }

    /// Whether the channel was closed locally or by the relay
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignalingChannel {
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

        let json = message.to_json()?;
        self.tx
            .send(Message::Text(json))
            .map_err(|_| Error::WebSocketError("Sender task has terminated".to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingMessage> {
        match self.incoming.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                // Relay already gone: hand out a receiver that is closed
                let (_, rx) = broadcast::channel(1);
                rx
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!(room_id = %self.room_id, "Closing signaling channel");
        // The sender task may already be gone if the relay hung up
        let _ = self.tx.send(Message::Close(None));
        Ok(())
    }
}
