//! JSON wire protocol shared by the Signaling, ICE and TURN services.
//!
//! Every client frame is one JSON document of at most [`MAX_FRAME_LEN`]
//! bytes, or the bare heartbeat token. Server frames are JSON documents of
//! the shape `{"response": "success" | "info" | "error", ...}`.
//!
//! The relay services additionally speak an origin-tag convention: a relayed
//! peer payload is prefixed with the single byte [`ORIGIN_PEER`], and on the
//! datagram transport every server-originated JSON frame is prefixed with
//! [`ORIGIN_SERVER`]. The tag is exactly one ASCII byte, positional; it is
//! the entire demultiplexing contract the client relies on.

use crate::types::MeetingId;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Maximum length of one request frame on the stream services.
pub const MAX_FRAME_LEN: usize = 128;

/// Liveness token, echoed between server and client. Not JSON.
pub const HEARTBEAT: &[u8] = b"HEARTBEAT";

/// Origin tag for server-originated datagrams.
pub const ORIGIN_SERVER: u8 = b'S';

/// Origin tag for relayed counterparty payloads.
pub const ORIGIN_PEER: u8 = b'C';

/// Heartbeats a client may miss before being reaped.
pub const CLIENT_TTL: u8 = 2;

/// Requests understood by the Signaling service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum SignalingRequest {
    Start,
    Join { id: MeetingId, password: String },
    Switch,
    Leave,
    End,
}

/// Requests understood by the ICE broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum IceRequest {
    Connect { id: MeetingId, password: String },
    Disconnect,
}

/// Requests understood by the TURN relay. Forwarding is implicit: anything
/// that is not a request is a peer-bound datagram.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum TurnRequest {
    Connect { id: MeetingId, password: String },
}

/// Event discriminator carried in `type` fields of success/info frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Connected,
    Disconnected,
    Switched,
    Ended,
    Left,
}

/// Error reasons, serialized as the literal client-facing strings.
///
/// The strings are wire-compatible constants; do not edit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReason {
    #[serde(rename = "Invalid request")]
    InvalidRequest,
    #[serde(rename = "You've already created a meeting recently")]
    AlreadyCreated,
    #[serde(rename = "You're already in a meeting")]
    AlreadyInMeeting,
    #[serde(rename = "You're not in a meeting")]
    NotInMeeting,
    #[serde(rename = "An invalid meeting ID was entered")]
    InvalidMeetingId,
    #[serde(rename = "The password for this meeting is incorrect")]
    InvalidPassword,
    #[serde(rename = "This meeting is full")]
    MeetingFull,
    #[serde(rename = "You're alone in this meeting")]
    AloneInMeeting,
    #[serde(rename = "Insufficient permissions")]
    InsufficientPermissions,
    #[serde(rename = "You're waiting for a peer")]
    WaitingForPeer,
    #[serde(rename = "You already have a connected peer")]
    AlreadyPaired,
    #[serde(rename = "You're not connected")]
    NotConnected,
    #[serde(rename = "This IP address is not connected to this meeting via the Signaling service")]
    UnknownParticipant,
    #[serde(rename = "The other user is not connected yet.")]
    PeerNotConnected,
    #[serde(rename = "An unknown error occurred")]
    Unknown,
}

/// A server-originated frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "lowercase")]
pub enum ServerMessage {
    Success {
        #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
        kind: Option<EventKind>,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<MeetingId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        waiting: Option<bool>,
    },
    Info {
        #[serde(rename = "type")]
        kind: EventKind,
    },
    Error {
        reason: ErrorReason,
    },
}

impl ServerMessage {
    /// `{"response":"success","type":"created","id":...,"password":...}`
    #[must_use]
    pub fn created(id: MeetingId, password: String) -> Self {
        Self::Success {
            kind: Some(EventKind::Created),
            id: Some(id),
            password: Some(password),
            waiting: None,
        }
    }

    /// Join acknowledgement: `waiting` is true iff the caller is the sole
    /// participant.
    #[must_use]
    pub fn joined(waiting: bool) -> Self {
        Self::Success {
            kind: Some(EventKind::Connected),
            id: None,
            password: None,
            waiting: Some(waiting),
        }
    }

    /// Pairing acknowledgement on the relay services; carries no `type`.
    #[must_use]
    pub fn paired(waiting: bool) -> Self {
        Self::Success {
            kind: None,
            id: None,
            password: None,
            waiting: Some(waiting),
        }
    }

    /// Bare `{"response":"success"}` acknowledgement.
    #[must_use]
    pub fn ack() -> Self {
        Self::Success {
            kind: None,
            id: None,
            password: None,
            waiting: None,
        }
    }

    /// Success acknowledgement carrying only a `type`.
    #[must_use]
    pub fn done(kind: EventKind) -> Self {
        Self::Success {
            kind: Some(kind),
            id: None,
            password: None,
            waiting: None,
        }
    }

    /// `{"response":"info","type":...}` side notification.
    #[must_use]
    pub fn info(kind: EventKind) -> Self {
        Self::Info { kind }
    }

    /// `{"response":"error","reason":...}` frame.
    #[must_use]
    pub fn error(reason: ErrorReason) -> Self {
        Self::Error { reason }
    }

    /// Serialize to a wire frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Serialize to a wire frame prefixed with one origin-tag byte.
    #[must_use]
    pub fn encode_tagged(&self, tag: u8) -> Bytes {
        let body = serde_json::to_vec(self).unwrap_or_default();
        let mut buf = BytesMut::with_capacity(body.len() + 1);
        buf.put_u8(tag);
        buf.put_slice(&body);
        buf.freeze()
    }
}

/// Prefix an opaque peer payload with the counterparty origin tag.
#[must_use]
pub fn tag_peer_payload(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(ORIGIN_PEER);
    buf.put_slice(payload);
    buf.freeze()
}

/// Classification of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame<R> {
    /// The bare heartbeat token.
    Heartbeat,
    /// A well-formed request for this engine.
    Request(R),
    /// A JSON object that is not a valid request.
    Invalid,
    /// Anything that is not a JSON object: peer-bound on the relay
    /// services, malformed input on Signaling.
    Opaque,
}

/// Classify one inbound frame.
///
/// A frame is a request only if it parses as a JSON *object* carrying a
/// recognized `request` verb with its required fields. A JSON object that
/// fails the second step is an invalid request; any other payload (raw
/// bytes, JSON arrays, scalars) is opaque and, on the relay services,
/// belongs to the peer.
#[must_use]
pub fn parse_frame<R: DeserializeOwned>(payload: &[u8]) -> InboundFrame<R> {
    if payload == HEARTBEAT {
        return InboundFrame::Heartbeat;
    }

    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Object(_)) => match serde_json::from_slice::<R>(payload) {
            Ok(request) => InboundFrame::Request(request),
            Err(_) => InboundFrame::Invalid,
        },
        _ => InboundFrame::Opaque,
    }
}
