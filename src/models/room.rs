use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Participant identity as seen by other clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub id: String,
    pub display_name: String,
}

/// Room information returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub participants: Vec<ParticipantInfo>,
    pub participants_count: usize,
    pub status: RoomStatus,
    pub created_at: DateTime<Utc>,
}

/// Room status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Active,
    Inactive,
}
