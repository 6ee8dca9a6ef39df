//! Client-side view of a session.
//!
//! Local actions are applied optimistically with the same clamping rule as
//! the store. Every sequenced event, including the echo of this client's own
//! request, then overwrites the touched fields from the authoritative
//! payload, so a wrong guess is corrected within one round trip.

use std::collections::HashSet;

use uuid::Uuid;

use crate::engine::PackRequest;
use crate::error::{ErrorKind, MutationError};
use crate::event::{ControlEvent, EventKind, MutationEvent};
use crate::model::{ItemAction, ItemId, MaterialId, Order, OrderId, Role, Session};
use crate::protocol::ClientMessage;
use crate::store::SessionSnapshot;

/// UI mode of a client. Desktop clients start in `Selecting` and collapse
/// into `Preview` as soon as a phone pairs; mobile clients are always
/// `Mobile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Selecting,
    Desktop,
    AwaitingPhone,
    Preview,
    Mobile,
}

/// Outcome of merging one sequenced event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    Applied,
    /// Already reflected in the loaded snapshot.
    Stale,
    /// Events were missed; the caller must request a full resync.
    Gap { expected: u64, received: u64 },
    /// The event referenced state this view does not have; resync.
    Diverged,
    /// No snapshot loaded yet.
    Unsynced,
}

impl Reconcile {
    pub fn needs_resync(&self) -> bool {
        matches!(
            self,
            Reconcile::Gap { .. } | Reconcile::Diverged | Reconcile::Unsynced
        )
    }
}

#[derive(Debug, Clone)]
pub struct ClientView {
    role: Role,
    session: Option<Session>,
    sequence: u64,
    mode: ClientMode,
    current_order_id: Option<OrderId>,
    connected_roles: Vec<Role>,
    pack_pending: HashSet<OrderId>,
    pack_blocked: HashSet<OrderId>,
    connected: bool,
    superseded: bool,
}

impl ClientView {
    pub fn new(role: Role) -> Self {
        let mode = match role {
            Role::Desktop => ClientMode::Selecting,
            Role::Mobile => ClientMode::Mobile,
        };
        Self {
            role,
            session: None,
            sequence: 0,
            mode,
            current_order_id: None,
            connected_roles: Vec::new(),
            pack_pending: HashSet::new(),
            pack_blocked: HashSet::new(),
            connected: false,
            superseded: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn mode(&self) -> ClientMode {
        self.mode
    }

    pub fn current_order_id(&self) -> Option<OrderId> {
        self.current_order_id
    }

    pub fn current_order(&self) -> Option<&Order> {
        let order_id = self.current_order_id?;
        self.session.as_ref()?.order(order_id)
    }

    pub fn connected_roles(&self) -> &[Role] {
        &self.connected_roles
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Drives the persistent "reconnecting" indicator. Local interaction
    /// continues while disconnected.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded
    }

    /// Replaces all local state with an authoritative snapshot.
    pub fn load_snapshot(&mut self, snapshot: SessionSnapshot, connected_roles: Vec<Role>) {
        let SessionSnapshot { session, sequence } = snapshot;
        let keep_current = self
            .current_order_id
            .filter(|id| session.order(*id).is_some());
        self.current_order_id = session.current_order_id.or(keep_current);
        if self.role == Role::Desktop && connected_roles.contains(&Role::Mobile) {
            self.mode = ClientMode::Preview;
        }
        self.session = Some(session);
        self.sequence = sequence;
        self.connected_roles = connected_roles;
        self.pack_pending.clear();
        self.pack_blocked.clear();
        self.connected = true;
    }

    /// Applies an item action locally and returns the request to send, or
    /// the local reason it cannot be sent.
    pub fn apply_local(
        &mut self,
        item_id: ItemId,
        action: ItemAction,
    ) -> Result<ClientMessage, MutationError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| MutationError::Validation("no session loaded".into()))?;
        session.ensure_active()?;
        let (order_idx, item_idx) = session
            .locate_item(item_id)
            .ok_or(MutationError::ItemNotFound(item_id))?;
        let order = &mut session.orders[order_idx];
        if order.is_packed() {
            return Err(MutationError::OrderPacked(order.id));
        }
        let item = &mut order.items[item_idx];
        item.picked_quantity = action.apply(item.picked_quantity, item.quantity);

        Ok(ClientMessage::UpdateItemStatus {
            order_item_id: item_id,
            action,
            request_id: Some(Uuid::new_v4()),
            client_seq: None,
        })
    }

    /// Whether the pack control should be enabled for `order_id`.
    pub fn is_packable(&self, order_id: OrderId) -> bool {
        let Some(order) = self.session.as_ref().and_then(|s| s.order(order_id)) else {
            return false;
        };
        order.is_fully_picked()
            && !order.is_packed()
            && !self.pack_pending.contains(&order_id)
            && !self.pack_blocked.contains(&order_id)
    }

    pub fn begin_pack(
        &mut self,
        order_id: OrderId,
        request: &PackRequest,
    ) -> Result<ClientMessage, MutationError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| MutationError::Validation("no session loaded".into()))?;
        session.ensure_packable(order_id)?;
        self.pack_pending.insert(order_id);
        Ok(pack_message(
            order_id,
            request.material_id,
            request.weight,
            request.send_email,
        ))
    }

    pub fn navigate_local(&mut self, order_id: OrderId) -> Result<ClientMessage, MutationError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| MutationError::Validation("no session loaded".into()))?;
        if session.order(order_id).is_none() {
            return Err(MutationError::OrderNotFound(order_id));
        }
        self.current_order_id = Some(order_id);
        Ok(ClientMessage::NavigateOrder {
            order_id,
            request_id: Some(Uuid::new_v4()),
            client_seq: None,
        })
    }

    /// Handles a rejection addressed to this client. Only the affected
    /// order's packable flag is reverted; item counters are left to the
    /// broadcast stream.
    pub fn handle_rejection(&mut self, order_id: Option<OrderId>, error: &MutationError) {
        let Some(order_id) = order_id.or_else(|| error.order_id()) else {
            return;
        };
        match error {
            MutationError::AlreadyPacked(_) | MutationError::OrderNotFullyPicked { .. } => {
                self.pack_pending.remove(&order_id);
                self.pack_blocked.insert(order_id);
            }
            _ => {
                self.pack_pending.remove(&order_id);
            }
        }
    }

    /// Same as [`ClientView::handle_rejection`] for an `error` frame, which
    /// carries only the error kind.
    pub fn handle_error_frame(&mut self, order_id: Option<OrderId>, kind: ErrorKind) {
        let Some(order_id) = order_id else {
            return;
        };
        self.pack_pending.remove(&order_id);
        if kind == ErrorKind::StateConflict {
            self.pack_blocked.insert(order_id);
        }
    }

    pub fn apply_event(&mut self, event: &MutationEvent) -> Reconcile {
        let Some(session) = self.session.as_mut() else {
            return Reconcile::Unsynced;
        };
        if event.sequence <= self.sequence {
            return Reconcile::Stale;
        }
        let expected = self.sequence + 1;
        if event.sequence != expected {
            return Reconcile::Gap {
                expected,
                received: event.sequence,
            };
        }

        match &event.kind {
            EventKind::ItemDelta { item, order, .. } => {
                let Some(local_order) = session.order_mut(item.order_id) else {
                    return Reconcile::Diverged;
                };
                let Some(local_item) = local_order.items.iter_mut().find(|i| i.id == item.id)
                else {
                    return Reconcile::Diverged;
                };
                local_item.picked_quantity = item.picked_quantity.min(local_item.quantity);
                local_order.overwrite_packing(order);
                self.pack_blocked.remove(&order.id);
            }
            EventKind::OrderPacked { order, .. } => {
                let Some(local_order) = session.order_mut(order.id) else {
                    return Reconcile::Diverged;
                };
                local_order.overwrite_packing(order);
                self.pack_pending.remove(&order.id);
                self.pack_blocked.remove(&order.id);
                if let Some(next) = session.next_unpacked_after(order.id) {
                    self.current_order_id = Some(next);
                }
            }
            EventKind::Navigate { order_id } => {
                if session.order(*order_id).is_none() {
                    return Reconcile::Diverged;
                }
                session.current_order_id = Some(*order_id);
                self.current_order_id = Some(*order_id);
            }
            EventKind::SessionCompleted { ended_at, .. } => {
                session.status = crate::model::SessionStatus::Completed;
                session.ended_at = Some(*ended_at);
            }
            EventKind::SessionCancelled { ended_at, .. } => {
                session.status = crate::model::SessionStatus::Cancelled;
                session.ended_at = Some(*ended_at);
            }
        }

        self.sequence = event.sequence;
        Reconcile::Applied
    }

    pub fn apply_control(&mut self, event: &ControlEvent) {
        match event {
            ControlEvent::PhoneConnected => {
                if !self.connected_roles.contains(&Role::Mobile) {
                    self.connected_roles.push(Role::Mobile);
                }
                if self.role == Role::Desktop {
                    self.mode = ClientMode::Preview;
                }
            }
            ControlEvent::PhoneDisconnected => {
                self.connected_roles.retain(|role| *role != Role::Mobile);
                if self.mode == ClientMode::Preview {
                    self.mode = ClientMode::AwaitingPhone;
                }
            }
            ControlEvent::PackingPhotoUploaded {
                order_id,
                photo_url,
            } => {
                if let Some(order) = self.session.as_mut().and_then(|s| s.order_mut(*order_id)) {
                    order.packing_photo_url = Some(photo_url.clone());
                }
            }
            ControlEvent::Superseded { .. } => {
                self.superseded = true;
                self.connected = false;
            }
        }
    }

    /// Desktop operator chose to pick on this screen.
    pub fn choose_desktop(&mut self) {
        if matches!(self.mode, ClientMode::Selecting | ClientMode::AwaitingPhone) {
            self.mode = ClientMode::Desktop;
        }
    }

    /// Desktop operator chose to pick with a phone and is showing the QR code.
    pub fn choose_phone(&mut self) {
        if matches!(self.mode, ClientMode::Selecting | ClientMode::Desktop) {
            self.mode = ClientMode::AwaitingPhone;
        }
    }
}

fn pack_message(
    order_id: OrderId,
    packaging_material_id: Option<MaterialId>,
    weight: Option<f64>,
    send_email: bool,
) -> ClientMessage {
    ClientMessage::MarkOrderPacked {
        order_id,
        packaging_material_id,
        weight,
        send_email,
        request_id: Some(Uuid::new_v4()),
        client_seq: None,
    }
}
