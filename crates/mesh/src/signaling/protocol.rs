//! Room signaling envelope
//!
//! Every message on a room channel is a JSON object of the form
//! `{"type": ..., "fromPeerId": ..., "toPeerId": ..., "payload": ...}`.
//! `join` and `leave` are broadcast; `offer`, `answer` and `ice-candidate`
//! are addressed to a single peer through `toPeerId`.

use serde::{Deserialize, Serialize};

/// Signaling message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Peer announces its presence in the room
    Join,
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// Trickled ICE candidate
    IceCandidate,
    /// Peer leaves the room
    Leave,
}

impl MessageKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Join => "join",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
            MessageKind::Leave => "leave",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Room-scoped signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    /// Message kind
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Sender peer ID
    pub from_peer_id: String,

    /// Recipient peer ID; absent for room-wide messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_peer_id: Option<String>,

    /// Kind-specific payload (`null` for join/leave)
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Offer/answer payload (`RTCSessionDescriptionInit` shape)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptionPayload {
    /// "offer" or "answer"
    #[serde(rename = "type")]
    pub sdp_type: String,

    /// SDP text
    pub sdp: String,
}

/// ICE candidate payload (`RTCIceCandidateInit` shape)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,

    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl SignalingMessage {
    /// Room-wide presence announcement
    pub fn join(from: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Join,
            from_peer_id: from.into(),
            to_peer_id: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Room-wide departure notice
    pub fn leave(from: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Leave,
            from_peer_id: from.into(),
            to_peer_id: None,
            payload: serde_json::Value::Null,
        }
    }

    /// SDP offer addressed to `to`
    pub fn offer(from: impl Into<String>, to: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self::description(MessageKind::Offer, "offer", from.into(), to.into(), sdp.into())
    }

    /// SDP answer addressed to `to`
    pub fn answer(from: impl Into<String>, to: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self::description(MessageKind::Answer, "answer", from.into(), to.into(), sdp.into())
    }

    /// ICE candidate addressed to `to`
    pub fn ice_candidate(
        from: impl Into<String>,
        to: impl Into<String>,
        candidate: &IceCandidatePayload,
    ) -> Self {
        Self {
            kind: MessageKind::IceCandidate,
            from_peer_id: from.into(),
            to_peer_id: Some(to.into()),
            payload: serde_json::to_value(candidate).unwrap_or(serde_json::Value::Null),
        }
    }

    fn description(kind: MessageKind, sdp_type: &str, from: String, to: String, sdp: String) -> Self {
        let payload = serde_json::json!({ "type": sdp_type, "sdp": sdp });
        Self {
            kind,
            from_peer_id: from,
            to_peer_id: Some(to),
            payload,
        }
    }

    /// True if the message is room-wide or addressed to `peer_id`
    pub fn is_addressed_to(&self, peer_id: &str) -> bool {
        self.to_peer_id.as_deref().map_or(true, |to| to == peer_id)
    }

    /// Decode an offer/answer payload
    pub fn session_description(&self) -> crate::Result<SessionDescriptionPayload> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            crate::Error::InvalidData(format!(
                "Malformed {} payload from {}: {}",
                self.kind, self.from_peer_id, e
            ))
        })
    }

    /// Decode an ice-candidate payload
    pub fn ice_candidate_payload(&self) -> crate::Result<IceCandidatePayload> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            crate::Error::InvalidData(format!(
                "Malformed ice-candidate payload from {}: {}",
                self.from_peer_id, e
            ))
        })
    }

    /// Convert message to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize signaling message: {}",
                e
            ))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize signaling message: {}",
                e
            ))
        })
    }
}
