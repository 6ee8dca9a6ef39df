use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ItemSummary, OrderId, OrderSummary, Role, SessionProgress};

/// One applied state change, sequenced by the session room. Sequence numbers
/// start at 1 and are gapless per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub sequence: u64,
    pub caused_by: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    ItemDelta {
        item: ItemSummary,
        previous_picked_quantity: u32,
        order: OrderSummary,
        session: SessionProgress,
    },
    OrderPacked {
        order: OrderSummary,
        session: SessionProgress,
        packed_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        low_stock_warning: Option<String>,
    },
    SessionCompleted {
        session: SessionProgress,
        ended_at: DateTime<Utc>,
    },
    SessionCancelled {
        session: SessionProgress,
        ended_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        released_order_ids: Vec<OrderId>,
    },
    Navigate {
        order_id: OrderId,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ItemDelta { .. } => "item_delta",
            EventKind::OrderPacked { .. } => "order_packed",
            EventKind::SessionCompleted { .. } => "session_completed",
            EventKind::SessionCancelled { .. } => "session_cancelled",
            EventKind::Navigate { .. } => "navigate",
        }
    }

    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            EventKind::SessionCompleted { .. } | EventKind::SessionCancelled { .. }
        )
    }
}

/// Out-of-band notices. They never consume a sequence number, so pairing
/// churn and photo relays cannot disturb item-event ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlEvent {
    PhoneConnected,
    PhoneDisconnected,
    PackingPhotoUploaded { order_id: OrderId, photo_url: String },
    Superseded { role: Role },
}
