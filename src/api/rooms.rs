use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use crate::error::{AppError, Result};
use crate::models::RoomInfo;
use crate::state::AppState;

/// Room routes
pub fn room_routes() -> Router<AppState> {
    Router::new().route("/{room_id}", get(get_room))
}

/// GET /api/v1/rooms/:room_id - Membership snapshot for a room
async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomInfo>> {
    let info = state
        .registry
        .lookup(&room_id)
        .ok_or_else(|| AppError::NotFound(format!("Room {} not found", room_id)))?;

    Ok(Json(info))
}
