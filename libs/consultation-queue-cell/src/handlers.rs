use axum::{
    extract::{Path, State},
    response::Json,
    Extension,
};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use shared_models::auth::{Actor, User};

use crate::error::QueueError;
use crate::models::{
    CancelQueueItemRequest, CreateEmergencyBroadcastRequest, CreateQueueItemRequest,
    RejectQueueItemRequest,
};
use crate::router::ConsultationQueueState;

fn actor_from(user: &User) -> Result<Actor, QueueError> {
    user.to_actor().map_err(QueueError::Forbidden)
}

/// Join the queue with a walk-in or appointment entry.
pub async fn create_queue_item(
    State(state): State<ConsultationQueueState>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateQueueItemRequest>,
) -> Result<Json<Value>, QueueError> {
    let actor = actor_from(&user)?;
    info!("Queue item creation request from {}", actor.id);

    let item = state.lifecycle.create_queue_item(actor, request).await?;
    Ok(Json(json!({ "item": item })))
}

/// Fan an emergency out to several candidate doctors at once.
pub async fn create_emergency_broadcast(
    State(state): State<ConsultationQueueState>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateEmergencyBroadcastRequest>,
) -> Result<Json<Value>, QueueError> {
    let actor = actor_from(&user)?;
    info!("Emergency broadcast request from {}", actor.id);

    let siblings = state.broadcast.create_broadcast(actor, request).await?;
    let group_id = siblings.first().and_then(|item| item.emergency_group_id);
    Ok(Json(json!({
        "emergency_group_id": group_id,
        "items": siblings,
    })))
}

/// The doctor's live queue in priority order.
pub async fn list_queue(
    State(state): State<ConsultationQueueState>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, QueueError> {
    let actor = actor_from(&user)?;
    let items = state.lifecycle.list_queue_for_doctor(actor).await?;
    Ok(Json(json!({ "items": items })))
}

pub async fn get_queue_item(
    State(state): State<ConsultationQueueState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, QueueError> {
    let actor = actor_from(&user)?;
    let item = state.lifecycle.get_queue_item(actor, id).await?;
    Ok(Json(json!({ "item": item })))
}

pub async fn accept_queue_item(
    State(state): State<ConsultationQueueState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, QueueError> {
    let actor = actor_from(&user)?;
    let item = state.lifecycle.accept(actor, id).await?;
    Ok(Json(json!({ "item": item })))
}

pub async fn reject_queue_item(
    State(state): State<ConsultationQueueState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
    Json(request): Json<RejectQueueItemRequest>,
) -> Result<Json<Value>, QueueError> {
    let actor = actor_from(&user)?;
    let item = state.lifecycle.reject(actor, id, request.reason).await?;
    Ok(Json(json!({ "item": item })))
}

pub async fn cancel_queue_item(
    State(state): State<ConsultationQueueState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelQueueItemRequest>,
) -> Result<Json<Value>, QueueError> {
    let actor = actor_from(&user)?;
    let item = state.lifecycle.cancel(actor, id, request.reason).await?;
    Ok(Json(json!({ "item": item })))
}

pub async fn start_consultation(
    State(state): State<ConsultationQueueState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, QueueError> {
    let actor = actor_from(&user)?;
    let item = state.lifecycle.start(actor, id).await?;
    Ok(Json(json!({
        "consultation_id": item.item.consultation_id,
        "item": item,
    })))
}

pub async fn close_consultation(
    State(state): State<ConsultationQueueState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, QueueError> {
    let actor = actor_from(&user)?;
    let item = state.lifecycle.close(actor, id).await?;
    Ok(Json(json!({ "item": item })))
}

/// Doctor opts to charge for this entry; the handle carries what the
/// client needs to complete checkout.
pub async fn enable_payment(
    State(state): State<ConsultationQueueState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, QueueError> {
    let actor = actor_from(&user)?;
    let (handle, item) = state.lifecycle.enable_payment(actor, id).await?;
    Ok(Json(json!({
        "payment": handle,
        "item": item,
    })))
}

/// Checkout completion callback from the patient's client.
pub async fn complete_payment(
    State(state): State<ConsultationQueueState>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, QueueError> {
    let actor = actor_from(&user)?;
    let item = state.lifecycle.complete_payment(actor, id).await?;
    Ok(Json(json!({ "item": item })))
}
