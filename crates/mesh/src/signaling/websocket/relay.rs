//! Room-scoped WebSocket relay
//!
//! A deliberately dumb broadcast bus: every text frame received on
//! `/rooms/{room_id}` is forwarded to every socket connected to the same
//! room, the sender included. The relay never inspects the envelope.

use super::parse_room_path;
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Frames buffered per room before slow sockets start lagging
const ROOM_CAPACITY: usize = 512;

type Rooms = Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>;

/// WebSocket signaling relay
pub struct SignalingRelay {
    listener: TcpListener,
    rooms: Rooms,
}

impl SignalingRelay {
    /// Bind the relay to `addr`
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            rooms: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Address the relay is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Signaling relay listening on ws://{}/rooms/{{room_id}}", addr);

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted connection from {}", peer_addr);
                            let rooms = Arc::clone(&self.rooms);
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, rooms).await {
                                    warn!("Relay connection from {} ended with error: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => {
                    info!("Signaling relay received shutdown signal");
                    break;
                }
            }
        }

        connections.abort_all();
        info!("Signaling relay stopped");
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, rooms: Rooms) -> Result<()> {
    let mut path = String::new();
    let callback = |request: &Request, response: Response| {
        path = request.uri().path().to_string();
        Ok(response)
    };

    let mut ws = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| Error::WebSocketError(format!("Handshake failed: {}", e)))?;

    let Some(room_id) = parse_room_path(&path) else {
        let _ = ws.close(None).await;
        return Err(Error::InvalidData(format!("Unsupported relay path: {}", path)));
    };

    let (room_tx, mut room_rx) = {
        let mut rooms = rooms.write().await;
        let tx = rooms
            .entry(room_id.clone())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .clone();
        let rx = tx.subscribe();
        (tx, rx)
    };
    info!(room_id = %room_id, members = room_tx.receiver_count(), "Socket joined room");

    let (mut write, mut read) = ws.split();

    let result = loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let _ = room_tx.send(text);
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(Error::WebSocketError(e.to_string())),
                }
            }
            forwarded = room_rx.recv() => {
                match forwarded {
                    Ok(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            break Err(Error::WebSocketError(e.to_string()));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(room_id = %room_id, skipped, "Relay socket lagging, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                }
            }
        }
    };

    drop(room_rx);
    let mut rooms = rooms.write().await;
    if room_tx.receiver_count() == 0 {
        rooms.remove(&room_id);
        debug!(room_id = %room_id, "Room emptied");
    }

    result
}
