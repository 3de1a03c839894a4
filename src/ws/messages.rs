use serde::{Deserialize, Serialize};

use crate::ice::IceServer;
use crate::models::{ChatMessage, ParticipantInfo};

/// Init payload for a discovered network path, relayed verbatim between peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Everything a client may send to the server.
///
/// A closed union: unknown or malformed frames fail to deserialize and are
/// dropped at the socket boundary instead of leaking into handler code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEnvelope {
    #[serde(rename = "room:join")]
    RoomJoin { room: String, display_name: String },

    #[serde(rename = "room:leave")]
    Leave,

    #[serde(rename = "chat:message")]
    Chat { text: String },

    #[serde(rename = "call:offer")]
    Offer { to: String, sdp: String },

    #[serde(rename = "call:answer")]
    Answer { to: String, sdp: String },

    #[serde(rename = "ice:candidate")]
    Candidate { to: String, candidate: CandidateInit },

    #[serde(rename = "call:end")]
    CallEnd { to: String },

    #[serde(rename = "ping")]
    Ping,
}

/// Everything the server may send to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEnvelope {
    /// Join succeeded; `members` is the full current membership including
    /// the joiner, so the joiner can identify the existing peer.
    #[serde(rename = "room:joined")]
    RoomJoined {
        room: String,
        you: String,
        members: Vec<ParticipantInfo>,
        ice_servers: Vec<IceServer>,
    },

    #[serde(rename = "room:full")]
    RoomFull { room: String, reason: String },

    #[serde(rename = "user:joined")]
    UserJoined { id: String, display_name: String },

    #[serde(rename = "user:left")]
    UserLeft { id: String, display_name: String },

    #[serde(rename = "call:incoming")]
    CallIncoming {
        from: String,
        sdp: String,
        display_name: String,
    },

    #[serde(rename = "call:accepted")]
    CallAccepted {
        from: String,
        sdp: String,
        display_name: String,
    },

    #[serde(rename = "ice:candidate")]
    IceCandidate { from: String, candidate: CandidateInit },

    #[serde(rename = "call:ended")]
    CallEnded { from: String },

    #[serde(rename = "chat:message")]
    Chat(ChatMessage),

    #[serde(rename = "error")]
    Error { code: u16, message: String },

    #[serde(rename = "pong")]
    Pong,
}

impl ServerEnvelope {
    pub fn error(code: u16, message: &str) -> Self {
        ServerEnvelope::Error {
            code,
            message: message.to_string(),
        }
    }
}
