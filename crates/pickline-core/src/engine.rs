//! The only writer of the session store.
//!
//! Callers are expected to serialise calls per session (the server's session
//! room does this); the engine itself is synchronous and holds no state
//! besides the store handle.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::MutationError;
use crate::event::{EventKind, MutationEvent};
use crate::model::{ItemAction, ItemId, MaterialId, OrderId, PackingDetails, Role, SessionId};
use crate::store::SessionStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackRequest {
    pub material_id: Option<MaterialId>,
    pub weight: Option<f64>,
    #[serde(default)]
    pub photo_url: Option<String>,
    /// Advisory produced by the order repository while persisting the pack.
    #[serde(default)]
    pub low_stock_warning: Option<String>,
    /// Ask the order repository to notify the customer.
    #[serde(default)]
    pub send_email: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mutation", rename_all = "snake_case")]
pub enum Mutation {
    Item { item_id: ItemId, action: ItemAction },
    Pack { order_id: OrderId, request: PackRequest },
    Navigate { order_id: OrderId },
    Complete,
    Cancel,
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Item { .. } => "item",
            Mutation::Pack { .. } => "pack",
            Mutation::Navigate { .. } => "navigate",
            Mutation::Complete => "complete",
            Mutation::Cancel => "cancel",
        }
    }
}

/// Mobile devices pick, pack and navigate; ending the session is reserved for
/// the desktop.
pub fn authorize(role: Role, mutation: &Mutation) -> Result<(), MutationError> {
    match (role, mutation) {
        (Role::Mobile, Mutation::Complete) => Err(MutationError::Forbidden {
            role,
            action: "complete the session",
        }),
        (Role::Mobile, Mutation::Cancel) => Err(MutationError::Forbidden {
            role,
            action: "cancel the session",
        }),
        _ => Ok(()),
    }
}

#[derive(Clone)]
pub struct MutationEngine {
    store: Arc<SessionStore>,
}

impl MutationEngine {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Pack guard evaluation ahead of the external repository write.
    pub fn ensure_packable(
        &self,
        session_id: SessionId,
        order_id: OrderId,
    ) -> Result<(), MutationError> {
        self.store.ensure_packable(session_id, order_id)
    }

    pub fn apply(
        &self,
        session_id: SessionId,
        role: Role,
        mutation: Mutation,
        request_id: Option<Uuid>,
    ) -> Result<MutationEvent, MutationError> {
        authorize(role, &mutation)?;

        let (sequence, kind) = match mutation {
            Mutation::Item { item_id, action } => {
                let applied = self.store.apply_delta(session_id, item_id, action)?;
                let outcome = applied.value;
                (
                    applied.sequence,
                    EventKind::ItemDelta {
                        item: outcome.item,
                        previous_picked_quantity: outcome.previous_picked_quantity,
                        order: outcome.order,
                        session: outcome.session,
                    },
                )
            }
            Mutation::Pack { order_id, request } => {
                let packed_at = Utc::now();
                let details = PackingDetails {
                    material_id: request.material_id,
                    weight: request.weight,
                    photo_url: request.photo_url,
                    packed_at,
                };
                let applied = self.store.mark_packed(session_id, order_id, details)?;
                (
                    applied.sequence,
                    EventKind::OrderPacked {
                        order: applied.value.order,
                        session: applied.value.session,
                        packed_at,
                        low_stock_warning: request.low_stock_warning,
                    },
                )
            }
            Mutation::Navigate { order_id } => {
                let applied = self.store.navigate(session_id, order_id)?;
                (
                    applied.sequence,
                    EventKind::Navigate {
                        order_id: applied.value,
                    },
                )
            }
            Mutation::Complete => {
                let ended_at = Utc::now();
                let applied = self.store.complete_session(session_id, ended_at)?;
                (
                    applied.sequence,
                    EventKind::SessionCompleted {
                        session: applied.value,
                        ended_at,
                    },
                )
            }
            Mutation::Cancel => {
                let ended_at = Utc::now();
                let applied = self.store.cancel_session(session_id, ended_at)?;
                let (session, released_order_ids) = applied.value;
                (
                    applied.sequence,
                    EventKind::SessionCancelled {
                        session,
                        ended_at,
                        released_order_ids,
                    },
                )
            }
        };

        debug!(
            session = %session_id,
            sequence,
            kind = kind.name(),
            caused_by = %role,
            "mutation applied"
        );

        Ok(MutationEvent {
            sequence,
            caused_by: role,
            request_id,
            kind,
        })
    }
}
