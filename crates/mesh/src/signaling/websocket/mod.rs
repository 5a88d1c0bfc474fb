//! WebSocket transport for room signaling
//!
//! Clients connect to `{base}/rooms/{room_id}`; the relay forwards every
//! text frame to every socket in the same room.

mod client;
mod relay;

pub use client::WebSocketSignalingChannel;
pub use relay::SignalingRelay;

/// Extract the room ID from a `/rooms/{room_id}` request path
pub(crate) fn parse_room_path(path: &str) -> Option<String> {
    let room = path.strip_prefix("/rooms/")?.trim_end_matches('/');
    if room.is_empty() || room.contains('/') {
        return None;
    }
    Some(room.to_string())
}

/// Build the room URL for a relay base URL
pub(crate) fn room_url(base_url: &str, room_id: &str) -> String {
    format!("{}/rooms/{}", base_url.trim_end_matches('/'), room_id)
}
