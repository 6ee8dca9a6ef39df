use std::collections::HashSet;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pickline_core::{
    ItemAction, ItemId, MaterialId, Mutation, MutationError, MutationEvent, OrderId, PairingGrant,
    Role, Session, SessionId, SessionSnapshot,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::collaborators::{PackagingSuggestions, PhotoUpload};
use crate::error::{ApiError, ApiResult};
use crate::room::{Applied, PackCommand};
use crate::state::AppState;
use crate::websocket::websocket_handler;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/sessions", post(start_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/pairing", post(issue_pairing))
        .route("/pairing/redeem", post(redeem_pairing))
        .route("/sessions/:id/items/:item_id", post(update_item))
        .route("/sessions/:id/orders/:order_id/pack", post(pack_order))
        .route("/sessions/:id/orders/:order_id/navigate", post(navigate_order))
        .route(
            "/sessions/:id/orders/:order_id/suggestions",
            get(packaging_suggestions),
        )
        .route("/sessions/:id/orders/:order_id/photo", post(upload_photo))
        .route("/sessions/:id/complete", post(complete_session))
        .route("/sessions/:id/cancel", post(cancel_session))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub order_ids: Vec<OrderId>,
}

async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<SessionSnapshot>), ApiError> {
    if request.order_ids.is_empty() {
        return Err(ApiError::Validation("order_ids must not be empty".into()));
    }
    let mut seen = HashSet::new();
    if let Some(duplicate) = request.order_ids.iter().find(|id| !seen.insert(**id)) {
        return Err(ApiError::Validation(format!(
            "order {duplicate} is listed more than once"
        )));
    }

    let session_id = Uuid::new_v4();
    let orders = state
        .collaborators
        .orders
        .lock_orders_for_session(session_id, &request.order_ids)
        .await?;
    let snapshot = state.store.insert(Session::new(session_id, orders));
    info!(
        session = %session_id,
        orders = request.order_ids.len(),
        "session started"
    );
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<SessionSnapshot> {
    Ok(Json(state.store.snapshot(session_id)?))
}

async fn issue_pairing(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<PairingGrant> {
    state.store.snapshot(session_id)?.session.ensure_active()?;
    Ok(Json(state.pairing.issue(session_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RedeemResponse {
    pub session_id: SessionId,
}

async fn redeem_pairing(
    State(state): State<AppState>,
    Json(request): Json<RedeemRequest>,
) -> ApiResult<RedeemResponse> {
    let session_id = state.pairing.redeem(&request.token).await?;
    Ok(Json(RedeemResponse { session_id }))
}

/// Outcome of a mutation submitted over HTTP.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MutationResponse {
    Applied { event: MutationEvent },
    Duplicate { request_id: Uuid },
}

impl From<Applied> for MutationResponse {
    fn from(applied: Applied) -> Self {
        match applied {
            Applied::Event(event) => MutationResponse::Applied { event },
            Applied::Duplicate(request_id) => MutationResponse::Duplicate { request_id },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ItemRequest {
    pub role: Role,
    pub action: ItemAction,
    #[serde(default)]
    pub request_id: Option<Uuid>,
}

async fn update_item(
    State(state): State<AppState>,
    Path((session_id, item_id)): Path<(SessionId, ItemId)>,
    Json(request): Json<ItemRequest>,
) -> ApiResult<MutationResponse> {
    let mutation = Mutation::Item {
        item_id,
        action: request.action,
    };
    let applied = state
        .rooms
        .mutate(session_id, request.role, mutation, request.request_id)
        .await?;
    Ok(Json(applied.into()))
}

#[derive(Debug, Deserialize)]
pub struct PackOrderRequest {
    pub role: Role,
    #[serde(default)]
    pub packaging_material_id: Option<MaterialId>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub send_email: bool,
    #[serde(default)]
    pub request_id: Option<Uuid>,
}

async fn pack_order(
    State(state): State<AppState>,
    Path((session_id, order_id)): Path<(SessionId, OrderId)>,
    Json(request): Json<PackOrderRequest>,
) -> ApiResult<MutationResponse> {
    if request.weight.is_some_and(|weight| !weight.is_finite() || weight < 0.0) {
        return Err(ApiError::Validation(
            "weight must be a non-negative number".into(),
        ));
    }
    let pack = PackCommand {
        order_id,
        packaging_material_id: request.packaging_material_id,
        weight: request.weight,
        send_email: request.send_email,
    };
    let applied = state
        .rooms
        .pack(session_id, request.role, pack, request.request_id)
        .await?;
    Ok(Json(applied.into()))
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: Role,
    #[serde(default)]
    pub request_id: Option<Uuid>,
}

async fn navigate_order(
    State(state): State<AppState>,
    Path((session_id, order_id)): Path<(SessionId, OrderId)>,
    Json(request): Json<RoleRequest>,
) -> ApiResult<MutationResponse> {
    let applied = state
        .rooms
        .mutate(
            session_id,
            request.role,
            Mutation::Navigate { order_id },
            request.request_id,
        )
        .await?;
    Ok(Json(applied.into()))
}

async fn complete_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Json(request): Json<RoleRequest>,
) -> ApiResult<MutationResponse> {
    end_session(&state, session_id, request, Mutation::Complete).await
}

async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Json(request): Json<RoleRequest>,
) -> ApiResult<MutationResponse> {
    end_session(&state, session_id, request, Mutation::Cancel).await
}

async fn end_session(
    state: &AppState,
    session_id: SessionId,
    request: RoleRequest,
    mutation: Mutation,
) -> ApiResult<MutationResponse> {
    let applied = state
        .rooms
        .mutate(session_id, request.role, mutation, request.request_id)
        .await?;
    state.suggestions.evict_session(session_id);
    Ok(Json(applied.into()))
}

async fn packaging_suggestions(
    State(state): State<AppState>,
    Path((session_id, order_id)): Path<(SessionId, OrderId)>,
) -> ApiResult<PackagingSuggestions> {
    let snapshot = state.store.snapshot(session_id)?;
    snapshot.session.ensure_active()?;
    if snapshot.session.order(order_id).is_none() {
        return Err(MutationError::OrderNotFound(order_id).into());
    }
    let suggestions = state.suggestions.get_or_fetch(session_id, order_id).await?;
    // The session may have ended while the service was answering.
    if state
        .store
        .status(session_id)
        .map_or(true, |status| status.is_terminal())
    {
        state.suggestions.evict_session(session_id);
    }
    Ok(Json(suggestions))
}

#[derive(Debug, Deserialize)]
pub struct PhotoQuery {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PhotoResponse {
    pub order_id: OrderId,
    pub photo_url: String,
}

/// Mobile camera upload. The pairing token doubles as the upload credential.
async fn upload_photo(
    State(state): State<AppState>,
    Path((session_id, order_id)): Path<(SessionId, OrderId)>,
    Query(query): Query<PhotoQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<PhotoResponse> {
    if body.is_empty() {
        return Err(ApiError::Validation("photo body must not be empty".into()));
    }
    state.pairing.redeem_for(&query.token, session_id).await?;

    let snapshot = state.store.snapshot(session_id)?;
    snapshot.session.ensure_active()?;
    if snapshot.session.order(order_id).is_none() {
        return Err(MutationError::OrderNotFound(order_id).into());
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let photo_url = state
        .collaborators
        .photos
        .upload(PhotoUpload {
            session_id,
            session_token: query.token,
            order_id,
            content_type,
            bytes: body,
        })
        .await?;
    state
        .rooms
        .photo_uploaded(session_id, order_id, photo_url.clone())
        .await?;
    info!(session = %session_id, order = order_id, "packing photo uploaded");
    Ok(Json(PhotoResponse {
        order_id,
        photo_url,
    }))
}
