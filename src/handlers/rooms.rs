//! Thin control plane for rooms: allocate an id, inspect a room.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct CreatedRoom {
    pub room_id: String,
}

#[derive(Debug, Serialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub participants: usize,
    pub created_at: String,
}

/// `GET /create-room`: reserve a fresh room id. The room comes to life
/// when the first participant joins it.
pub async fn create_room(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let room_id = state.registry.create_room();
    info!(room_id = %room_id, "Room id issued");
    Ok(HttpResponse::Ok().json(CreatedRoom { room_id }))
}

/// `GET /rooms/{room_id}`: current head count of a live room.
pub async fn room_info(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let room_id = path.into_inner();
    let room = state
        .registry
        .get(&room_id)
        .ok_or_else(|| AppError::NotFound(format!("Room {} not found", room_id)))?;

    Ok(HttpResponse::Ok().json(RoomInfo {
        room_id,
        participants: room.len(),
        created_at: room.created_at().to_rfc3339(),
    }))
}
