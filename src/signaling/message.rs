use crate::error::SignalingError;
use crate::session::{Role, SessionId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Kind tag of a signaling message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Publisher's session description
    Offer,
    /// Viewer's session description
    Answer,
    /// Transport candidate from either side
    Candidate,
    /// Orderly teardown
    Bye,
    /// Liveness probe on an established session
    Keepalive,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Candidate => "candidate",
            MessageKind::Bye => "bye",
            MessageKind::Keepalive => "keepalive",
        }
    }
}

/// One signaling record on a session's relay channel.
///
/// The payload is opaque to this layer; only the media engine boundary
/// parses it. Sequence numbers are monotonic per (session, sender) and
/// assigned by the sender; the incarnation names the negotiation
/// lifetime the message belongs to so late arrivals from a finished
/// cycle are recognizably stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub session: SessionId,
    pub sender: Role,
    pub seq: u64,
    pub incarnation: u64,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl SignalingMessage {
    pub fn offer(
        session: SessionId,
        sender: Role,
        seq: u64,
        incarnation: u64,
        payload: String,
    ) -> Self {
        Self {
            session,
            sender,
            seq,
            incarnation,
            kind: MessageKind::Offer,
            payload: Some(payload),
        }
    }

    pub fn answer(
        session: SessionId,
        sender: Role,
        seq: u64,
        incarnation: u64,
        payload: String,
    ) -> Self {
        Self {
            session,
            sender,
            seq,
            incarnation,
            kind: MessageKind::Answer,
            payload: Some(payload),
        }
    }

    pub fn candidate(
        session: SessionId,
        sender: Role,
        seq: u64,
        incarnation: u64,
        payload: String,
    ) -> Self {
        Self {
            session,
            sender,
            seq,
            incarnation,
            kind: MessageKind::Candidate,
            payload: Some(payload),
        }
    }

    pub fn bye(session: SessionId, sender: Role, seq: u64, incarnation: u64) -> Self {
        Self {
            session,
            sender,
            seq,
            incarnation,
            kind: MessageKind::Bye,
            payload: None,
        }
    }

    pub fn keepalive(session: SessionId, sender: Role, seq: u64, incarnation: u64) -> Self {
        Self {
            session,
            sender,
            seq,
            incarnation,
            kind: MessageKind::Keepalive,
            payload: None,
        }
    }

    /// Encode for the relay wire
    pub fn encode(&self) -> Result<Bytes, SignalingError> {
        let raw = serde_json::to_vec(self).map_err(|e| SignalingError::Encode {
            details: e.to_string(),
        })?;
        Ok(Bytes::from(raw))
    }

    /// Decode a relay record; `path` names where it was read from, for
    /// error context
    pub fn decode(path: &str, raw: &[u8]) -> Result<Self, SignalingError> {
        serde_json::from_slice(raw).map_err(|e| SignalingError::Decode {
            path: path.to_string(),
            details: e.to_string(),
        })
    }

    /// Opaque payload, or empty for payload-less kinds
    pub fn payload_str(&self) -> &str {
        self.payload.as_deref().unwrap_or("")
    }
}
