use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ItemId, OrderId, Role, SessionId, SessionStatus};

/// Coarse classification shared by the server's HTTP mapping, the websocket
/// `error` frame and the client reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    StateConflict,
    NotFound,
    Forbidden,
    TransportFailure,
    CollaboratorFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::StateConflict => "state_conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::TransportFailure => "transport_failure",
            ErrorKind::CollaboratorFailure => "collaborator_failure",
        }
    }
}

/// Rejection of a single mutation. Rejections are reported to the requester
/// only and never reach the broadcast stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("session is {0}, not active")]
    SessionNotActive(SessionStatus),
    #[error("order item {0} does not belong to this session")]
    ItemNotFound(ItemId),
    #[error("order {0} does not belong to this session")]
    OrderNotFound(OrderId),
    #[error("order {order_id} is not fully picked ({picked}/{total})")]
    OrderNotFullyPicked {
        order_id: OrderId,
        picked: u64,
        total: u64,
    },
    #[error("order {0} is already packed")]
    AlreadyPacked(OrderId),
    #[error("order {0} is packed and closed for picking")]
    OrderPacked(OrderId),
    #[error("{role} clients may not {action}")]
    Forbidden { role: Role, action: &'static str },
    #[error("invalid request: {0}")]
    Validation(String),
}

impl MutationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MutationError::SessionNotFound(_)
            | MutationError::ItemNotFound(_)
            | MutationError::OrderNotFound(_) => ErrorKind::NotFound,
            MutationError::SessionNotActive(_)
            | MutationError::OrderNotFullyPicked { .. }
            | MutationError::AlreadyPacked(_)
            | MutationError::OrderPacked(_) => ErrorKind::StateConflict,
            MutationError::Forbidden { .. } => ErrorKind::Forbidden,
            MutationError::Validation(_) => ErrorKind::Validation,
        }
    }

    /// Order the rejection is scoped to, when there is one.
    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            MutationError::OrderNotFullyPicked { order_id, .. } => Some(*order_id),
            MutationError::AlreadyPacked(order_id)
            | MutationError::OrderPacked(order_id)
            | MutationError::OrderNotFound(order_id) => Some(*order_id),
            _ => None,
        }
    }
}
