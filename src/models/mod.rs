pub mod chat;
pub mod room;

pub use chat::ChatMessage;
pub use room::{ParticipantInfo, RoomInfo, RoomStatus};
