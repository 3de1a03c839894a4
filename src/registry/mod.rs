use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::{AppError, Result};
use crate::models::{ChatMessage, ParticipantInfo, RoomInfo, RoomStatus};
use crate::ws::ServerEnvelope;

/// A session pairs exactly two participants; a third join is rejected.
pub const ROOM_CAPACITY: usize = 2;

/// Connection handle for a participant, used to push envelopes to them.
#[derive(Clone)]
pub struct MemberHandle {
    pub conn_id: String,
    pub display_name: String,
    sender: mpsc::UnboundedSender<ServerEnvelope>,
}

impl MemberHandle {
    pub fn new(
        conn_id: String,
        display_name: String,
        sender: mpsc::UnboundedSender<ServerEnvelope>,
    ) -> Self {
        Self {
            conn_id,
            display_name,
            sender,
        }
    }

    pub fn send(&self, env: ServerEnvelope) -> bool {
        self.sender.send(env).is_ok()
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.conn_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

struct RoomInner {
    members: Vec<MemberHandle>,
    chat: Vec<ChatMessage>,
    next_chat_id: u64,
}

/// A call session: at most two members plus an ephemeral ordered chat log.
pub struct Room {
    pub room_id: String,
    pub created_at: DateTime<Utc>,
    inner: Mutex<RoomInner>,
}

impl Room {
    fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            created_at: Utc::now(),
            inner: Mutex::new(RoomInner {
                members: Vec::new(),
                chat: Vec::new(),
                next_chat_id: 0,
            }),
        }
    }
}

/// Session registry: tracks room membership and enforces the two-party cap.
///
/// Rooms are created on first join and evicted when the last member leaves;
/// the chat log is dropped with the room.
pub struct Registry {
    rooms: DashMap<String, Arc<Room>>,
    chat_history_limit: usize,
}

impl Registry {
    pub fn new(chat_history_limit: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            chat_history_limit,
        }
    }

    /// Add a participant to a room, creating the room on first join.
    ///
    /// Returns the full current membership (joiner included) so the joiner
    /// can identify the existing peer. Room-full is terminal for this
    /// attempt; nothing is queued.
    pub fn join(&self, room_id: &str, member: MemberHandle) -> Result<Vec<ParticipantInfo>> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(AppError::BadRequest("Room id is required".to_string()));
        }

        let room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(room_id)))
            .clone();

        let mut inner = room.inner.lock().unwrap();
        if inner.members.len() >= ROOM_CAPACITY {
            return Err(AppError::RoomFull);
        }

        inner.members.push(member);

        tracing::info!(
            room_id = %room_id,
            members = inner.members.len(),
            "Participant joined room"
        );

        Ok(inner.members.iter().map(MemberHandle::info).collect())
    }

    /// Remove a participant from a room. Empty rooms are evicted together
    /// with their chat history.
    pub fn leave(&self, room_id: &str, conn_id: &str) -> Option<MemberHandle> {
        let room_id = room_id.trim();
        let room = self.rooms.get(room_id)?.clone();

        let handle = {
            let mut inner = room.inner.lock().unwrap();
            let pos = inner.members.iter().position(|m| m.conn_id == conn_id)?;
            Some(inner.members.remove(pos))
        };

        self.rooms
            .remove_if(room_id, |_, r| r.inner.lock().unwrap().members.is_empty());

        tracing::info!(room_id = %room_id, conn_id = %conn_id, "Participant left room");

        handle
    }

    /// Membership snapshot for a room.
    pub fn lookup(&self, room_id: &str) -> Option<RoomInfo> {
        let room = self.rooms.get(room_id.trim())?;
        let inner = room.inner.lock().unwrap();

        let participants: Vec<ParticipantInfo> =
            inner.members.iter().map(MemberHandle::info).collect();

        let status = if participants.is_empty() {
            RoomStatus::Inactive
        } else {
            RoomStatus::Active
        };

        Some(RoomInfo {
            room_id: room.room_id.clone(),
            participants_count: participants.len(),
            participants,
            status,
            created_at: room.created_at,
        })
    }

    /// Stamp and store a chat message, returning it for broadcast.
    /// Ids are monotonic per room.
    pub fn append_chat(&self, room_id: &str, sender: &str, text: String) -> Option<ChatMessage> {
        let room = self.rooms.get(room_id.trim())?;
        let mut inner = room.inner.lock().unwrap();

        let msg = ChatMessage {
            id: inner.next_chat_id,
            sender: sender.to_string(),
            text,
            timestamp: Utc::now(),
        };
        inner.next_chat_id += 1;

        if inner.chat.len() >= self.chat_history_limit {
            inner.chat.remove(0);
        }
        inner.chat.push(msg.clone());

        Some(msg)
    }

    /// Deliver an envelope to one addressed member. Returns false when the
    /// target is not reachable; the caller treats that as a silent drop.
    pub fn unicast(&self, room_id: &str, to_conn_id: &str, env: ServerEnvelope) -> bool {
        let Some(room) = self.rooms.get(room_id.trim()) else {
            return false;
        };
        let inner = room.inner.lock().unwrap();

        match inner.members.iter().find(|m| m.conn_id == to_conn_id) {
            Some(member) => member.send(env),
            None => false,
        }
    }

    /// Deliver an envelope to every member, optionally excluding one.
    pub fn broadcast(&self, room_id: &str, env: ServerEnvelope, exclude_conn_id: Option<&str>) {
        let Some(room) = self.rooms.get(room_id.trim()) else {
            return;
        };
        let inner = room.inner.lock().unwrap();

        for member in &inner.members {
            if let Some(exclude) = exclude_conn_id {
                if member.conn_id == exclude {
                    continue;
                }
            }
            member.send(env.clone());
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_count(&self) -> usize {
        self.rooms
            .iter()
            .map(|r| r.inner.lock().unwrap().members.len())
            .sum()
    }
}
