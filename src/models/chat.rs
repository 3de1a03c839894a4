use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chat line stored in a room's ephemeral history.
///
/// Ids are monotonic per room; clients use them to suppress duplicate
/// deliveries of the same message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: u64,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}
