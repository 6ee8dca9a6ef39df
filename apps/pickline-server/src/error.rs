use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pickline_core::{ErrorKind, MutationError, OrderId, PairingError, ServerMessage, SessionId};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::collaborators::CollaboratorError;

/// Failure of an HTTP call or websocket request.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("session room {0} is shutting down")]
    RoomUnavailable(SessionId),
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Mutation(err) => err.kind(),
            ApiError::Pairing(err) => err.kind(),
            ApiError::Collaborator(err) => err.kind(),
            ApiError::Validation(_) => ErrorKind::Validation,
            ApiError::RoomUnavailable(_) => ErrorKind::TransportFailure,
        }
    }

    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            ApiError::Mutation(err) => err.order_id(),
            _ => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::StateConflict => StatusCode::CONFLICT,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::CollaboratorFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::TransportFailure => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Websocket `error` frame addressed to the requester.
    pub fn to_frame(&self, request_id: Option<Uuid>) -> ServerMessage {
        match self {
            ApiError::Mutation(err) => ServerMessage::rejection(err, request_id),
            other => ServerMessage::Error {
                kind: other.kind(),
                message: other.to_string(),
                request_id,
                order_id: other.order_id(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_id: Option<OrderId>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ApiErrorBody {
            error: self.kind().as_str(),
            message: self.to_string(),
            order_id: self.order_id(),
        };
        (status, Json(body)).into_response()
    }
}
