use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, MutationError};
use crate::event::{ControlEvent, EventKind, MutationEvent};
use crate::model::{
    ItemAction, ItemId, ItemSummary, MaterialId, OrderId, OrderSummary, Role, Session,
    SessionId, SessionProgress, SessionStatus,
};
use crate::store::SessionSnapshot;

/// Messages sent from a client to the session server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a session. Mobile clients present their pairing token and may
    /// omit the session id.
    JoinSession {
        #[serde(default)]
        session_id: Option<SessionId>,
        role: Role,
        #[serde(default)]
        token: Option<String>,
        /// Stable id of the client process across reconnects.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<Uuid>,
    },
    UpdateItemStatus {
        order_item_id: ItemId,
        action: ItemAction,
        #[serde(default)]
        request_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_seq: Option<u64>,
    },
    MarkOrderPacked {
        order_id: OrderId,
        #[serde(default)]
        packaging_material_id: Option<MaterialId>,
        #[serde(default)]
        weight: Option<f64>,
        #[serde(default)]
        send_email: bool,
        #[serde(default)]
        request_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_seq: Option<u64>,
    },
    NavigateOrder {
        order_id: OrderId,
        #[serde(default)]
        request_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_seq: Option<u64>,
    },
    /// Ask for a fresh `session_state`, e.g. after detecting a sequence gap.
    Resync,
    /// Heartbeat to keep connection alive
    Ping,
}

impl ClientMessage {
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            ClientMessage::UpdateItemStatus { request_id, .. }
            | ClientMessage::MarkOrderPacked { request_id, .. }
            | ClientMessage::NavigateOrder { request_id, .. } => *request_id,
            _ => None,
        }
    }

    /// Position of a mutation request in its client's request stream.
    pub fn client_seq(&self) -> Option<u64> {
        match self {
            ClientMessage::UpdateItemStatus { client_seq, .. }
            | ClientMessage::MarkOrderPacked { client_seq, .. }
            | ClientMessage::NavigateOrder { client_seq, .. } => *client_seq,
            _ => None,
        }
    }

    /// Stamps a mutation request with its client sequence; other messages
    /// are returned unchanged.
    pub fn with_client_seq(mut self, seq: u64) -> Self {
        match &mut self {
            ClientMessage::UpdateItemStatus { client_seq, .. }
            | ClientMessage::MarkOrderPacked { client_seq, .. }
            | ClientMessage::NavigateOrder { client_seq, .. } => *client_seq = Some(seq),
            _ => {}
        }
        self
    }
}

/// Messages sent from the session server to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full snapshot, sent on join and on resync
    SessionState {
        session: Session,
        sequence: u64,
        connected_roles: Vec<Role>,
        /// Highest request sequence applied for the joining client.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_seq: Option<u64>,
    },
    ItemStatusUpdated {
        sequence: u64,
        caused_by: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        item: ItemSummary,
        previous_picked_quantity: u32,
        order: OrderSummary,
        session: SessionProgress,
    },
    OrderPacked {
        sequence: u64,
        caused_by: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        order: OrderSummary,
        session: SessionProgress,
        packed_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        low_stock_warning: Option<String>,
    },
    OrderNavigated {
        sequence: u64,
        caused_by: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        order_id: OrderId,
    },
    SessionEnded {
        sequence: u64,
        caused_by: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        status: SessionStatus,
        message: String,
        session: SessionProgress,
        ended_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        released_order_ids: Vec<OrderId>,
    },
    PhoneConnected,
    PhoneDisconnected,
    PackingPhotoUploaded {
        order_id: OrderId,
        photo_url: String,
    },
    /// Addressed only to a connection replaced by a newer join of its role
    Superseded { role: Role, message: String },
    /// A retried request that had already been applied
    Acknowledged { request_id: Uuid },
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_id: Option<OrderId>,
    },
    /// Response to ping
    Pong,
}

impl ServerMessage {
    pub fn session_state(snapshot: SessionSnapshot, connected_roles: Vec<Role>) -> Self {
        Self::session_state_for(snapshot, connected_roles, None)
    }

    pub fn session_state_for(
        snapshot: SessionSnapshot,
        connected_roles: Vec<Role>,
        client_seq: Option<u64>,
    ) -> Self {
        ServerMessage::SessionState {
            session: snapshot.session,
            sequence: snapshot.sequence,
            connected_roles,
            client_seq,
        }
    }

    pub fn rejection(error: &MutationError, request_id: Option<Uuid>) -> Self {
        ServerMessage::Error {
            kind: error.kind(),
            message: error.to_string(),
            request_id,
            order_id: error.order_id(),
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind,
            message: message.into(),
            request_id: None,
            order_id: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::SessionState { .. } => "session_state",
            ServerMessage::ItemStatusUpdated { .. } => "item_status_updated",
            ServerMessage::OrderPacked { .. } => "order_packed",
            ServerMessage::OrderNavigated { .. } => "order_navigated",
            ServerMessage::SessionEnded { .. } => "session_ended",
            ServerMessage::PhoneConnected => "phone_connected",
            ServerMessage::PhoneDisconnected => "phone_disconnected",
            ServerMessage::PackingPhotoUploaded { .. } => "packing_photo_uploaded",
            ServerMessage::Superseded { .. } => "superseded",
            ServerMessage::Acknowledged { .. } => "acknowledged",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong => "pong",
        }
    }

    /// Recovers the sequenced event carried by this frame, if any.
    pub fn into_event(self) -> Option<MutationEvent> {
        let (sequence, caused_by, request_id, kind) = match self {
            ServerMessage::ItemStatusUpdated {
                sequence,
                caused_by,
                request_id,
                item,
                previous_picked_quantity,
                order,
                session,
            } => (
                sequence,
                caused_by,
                request_id,
                EventKind::ItemDelta {
                    item,
                    previous_picked_quantity,
                    order,
                    session,
                },
            ),
            ServerMessage::OrderPacked {
                sequence,
                caused_by,
                request_id,
                order,
                session,
                packed_at,
                low_stock_warning,
            } => (
                sequence,
                caused_by,
                request_id,
                EventKind::OrderPacked {
                    order,
                    session,
                    packed_at,
                    low_stock_warning,
                },
            ),
            ServerMessage::OrderNavigated {
                sequence,
                caused_by,
                request_id,
                order_id,
            } => (
                sequence,
                caused_by,
                request_id,
                EventKind::Navigate { order_id },
            ),
            ServerMessage::SessionEnded {
                sequence,
                caused_by,
                request_id,
                status,
                session,
                ended_at,
                released_order_ids,
                ..
            } => {
                let kind = match status {
                    SessionStatus::Cancelled => EventKind::SessionCancelled {
                        session,
                        ended_at,
                        released_order_ids,
                    },
                    _ => EventKind::SessionCompleted { session, ended_at },
                };
                (sequence, caused_by, request_id, kind)
            }
            _ => return None,
        };
        Some(MutationEvent {
            sequence,
            caused_by,
            request_id,
            kind,
        })
    }

    pub fn into_control(self) -> Option<ControlEvent> {
        match self {
            ServerMessage::PhoneConnected => Some(ControlEvent::PhoneConnected),
            ServerMessage::PhoneDisconnected => Some(ControlEvent::PhoneDisconnected),
            ServerMessage::PackingPhotoUploaded {
                order_id,
                photo_url,
            } => Some(ControlEvent::PackingPhotoUploaded {
                order_id,
                photo_url,
            }),
            ServerMessage::Superseded { role, .. } => Some(ControlEvent::Superseded { role }),
            _ => None,
        }
    }
}

impl From<MutationEvent> for ServerMessage {
    fn from(event: MutationEvent) -> Self {
        let MutationEvent {
            sequence,
            caused_by,
            request_id,
            kind,
        } = event;
        match kind {
            EventKind::ItemDelta {
                item,
                previous_picked_quantity,
                order,
                session,
            } => ServerMessage::ItemStatusUpdated {
                sequence,
                caused_by,
                request_id,
                item,
                previous_picked_quantity,
                order,
                session,
            },
            EventKind::OrderPacked {
                order,
                session,
                packed_at,
                low_stock_warning,
            } => ServerMessage::OrderPacked {
                sequence,
                caused_by,
                request_id,
                order,
                session,
                packed_at,
                low_stock_warning,
            },
            EventKind::Navigate { order_id } => ServerMessage::OrderNavigated {
                sequence,
                caused_by,
                request_id,
                order_id,
            },
            EventKind::SessionCompleted { session, ended_at } => ServerMessage::SessionEnded {
                sequence,
                caused_by,
                request_id,
                status: SessionStatus::Completed,
                message: "Picking session completed".to_string(),
                session,
                ended_at,
                released_order_ids: Vec::new(),
            },
            EventKind::SessionCancelled {
                session,
                ended_at,
                released_order_ids,
            } => ServerMessage::SessionEnded {
                sequence,
                caused_by,
                request_id,
                status: SessionStatus::Cancelled,
                message: "Picking session cancelled; orders released".to_string(),
                session,
                ended_at,
                released_order_ids,
            },
        }
    }
}

impl From<ControlEvent> for ServerMessage {
    fn from(event: ControlEvent) -> Self {
        match event {
            ControlEvent::PhoneConnected => ServerMessage::PhoneConnected,
            ControlEvent::PhoneDisconnected => ServerMessage::PhoneDisconnected,
            ControlEvent::PackingPhotoUploaded {
                order_id,
                photo_url,
            } => ServerMessage::PackingPhotoUploaded {
                order_id,
                photo_url,
            },
            ControlEvent::Superseded { role } => ServerMessage::Superseded {
                role,
                message: format!("another {role} client joined this session"),
            },
        }
    }
}
