//! Session, order and item state for one picking batch.
//!
//! Every mutation of picked quantities goes through [`Session::apply_delta`],
//! which clamps into `0..=quantity`. Order and session aggregates are derived
//! from the items on read, so they can never be observed out of step with the
//! item counters they summarise.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MutationError;

pub type SessionId = Uuid;
pub type OrderId = i64;
pub type ItemId = i64;
pub type MaterialId = i64;

/// The two client kinds that may join a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Desktop,
    Mobile,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Desktop => "desktop",
            Role::Mobile => "mobile",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter change requested for a single order item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemAction {
    Increment,
    Decrement,
    PickAll,
}

impl ItemAction {
    /// Clamped picked quantity after applying this action. Shared by the
    /// authoritative store and the optimistic client path so both agree on
    /// boundary behaviour.
    pub fn apply(self, picked: u32, quantity: u32) -> u32 {
        let next = match self {
            ItemAction::Increment => picked.saturating_add(1),
            ItemAction::Decrement => picked.saturating_sub(1),
            ItemAction::PickAll => quantity,
        };
        next.min(quantity)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemAction::Increment => "increment",
            ItemAction::Decrement => "decrement",
            ItemAction::PickAll => "pick_all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    NotStarted,
    Partial,
    Picked,
}

impl ItemStatus {
    pub fn from_counts(picked: u32, quantity: u32) -> Self {
        if picked == 0 && quantity > 0 {
            ItemStatus::NotStarted
        } else if picked >= quantity {
            ItemStatus::Picked
        } else {
            ItemStatus::Partial
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub name: String,
    pub quantity: u32,
    #[serde(default)]
    pub picked_quantity: u32,
}

impl Item {
    pub fn new(id: ItemId, sku: impl Into<String>, name: impl Into<String>, quantity: u32) -> Self {
        Self {
            id,
            sku: sku.into(),
            name: name.into(),
            quantity,
            picked_quantity: 0,
        }
    }

    pub fn status(&self) -> ItemStatus {
        ItemStatus::from_counts(self.picked_quantity, self.quantity)
    }

    fn summary(&self, order_id: OrderId) -> ItemSummary {
        ItemSummary {
            id: self.id,
            order_id,
            quantity: self.quantity,
            picked_quantity: self.picked_quantity,
            status: self.status(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_number: String,
    #[serde(default)]
    pub customer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_request_id: Option<i64>,
    pub items: Vec<Item>,
    #[serde(default)]
    pub packing_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub packaging_material_id: Option<MaterialId>,
    #[serde(default)]
    pub package_weight: Option<f64>,
    #[serde(default)]
    pub packing_photo_url: Option<String>,
}

impl Order {
    pub fn new(
        id: OrderId,
        order_number: impl Into<String>,
        customer_name: impl Into<String>,
        items: Vec<Item>,
    ) -> Self {
        Self {
            id,
            order_number: order_number.into(),
            customer_name: customer_name.into(),
            shipping_request_id: None,
            items,
            packing_completed_at: None,
            packaging_material_id: None,
            package_weight: None,
            packing_photo_url: None,
        }
    }

    pub fn total_quantity(&self) -> u64 {
        self.items.iter().map(|item| u64::from(item.quantity)).sum()
    }

    pub fn picked_quantity(&self) -> u64 {
        self.items
            .iter()
            .map(|item| u64::from(item.picked_quantity))
            .sum()
    }

    pub fn picked_percentage(&self) -> f64 {
        ratio(self.picked_quantity(), self.total_quantity())
    }

    pub fn is_fully_picked(&self) -> bool {
        let total = self.total_quantity();
        total > 0 && self.picked_quantity() == total
    }

    pub fn is_packed(&self) -> bool {
        self.packing_completed_at.is_some()
    }

    pub fn item(&self, item_id: ItemId) -> Option<&Item> {
        self.items.iter().find(|item| item.id == item_id)
    }

    pub fn summary(&self) -> OrderSummary {
        OrderSummary {
            id: self.id,
            order_number: self.order_number.clone(),
            customer_name: self.customer_name.clone(),
            shipping_request_id: self.shipping_request_id,
            total_quantity: self.total_quantity(),
            picked_quantity: self.picked_quantity(),
            picked_percentage: self.picked_percentage(),
            is_fully_picked: self.is_fully_picked(),
            packing_completed_at: self.packing_completed_at,
            packaging_material_id: self.packaging_material_id,
            package_weight: self.package_weight,
            packing_photo_url: self.packing_photo_url.clone(),
        }
    }

    /// Copies the packing fields of an authoritative summary onto this order.
    pub fn overwrite_packing(&mut self, summary: &OrderSummary) {
        self.packing_completed_at = summary.packing_completed_at;
        self.packaging_material_id = summary.packaging_material_id;
        self.package_weight = summary.package_weight;
        self.packing_photo_url = summary.packing_photo_url.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: ItemId,
    pub order_id: OrderId,
    pub quantity: u32,
    pub picked_quantity: u32,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: OrderId,
    pub order_number: String,
    pub customer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_request_id: Option<i64>,
    pub total_quantity: u64,
    pub picked_quantity: u64,
    pub picked_percentage: f64,
    pub is_fully_picked: bool,
    pub packing_completed_at: Option<DateTime<Utc>>,
    pub packaging_material_id: Option<MaterialId>,
    pub package_weight: Option<f64>,
    pub packing_photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionProgress {
    pub total_orders: usize,
    pub packed_orders: usize,
    pub total_quantity: u64,
    pub picked_quantity: u64,
    pub picked_percentage: f64,
}

/// Packing choices recorded when an order is finalised.
#[derive(Debug, Clone, PartialEq)]
pub struct PackingDetails {
    pub material_id: Option<MaterialId>,
    pub weight: Option<f64>,
    pub photo_url: Option<String>,
    pub packed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeltaOutcome {
    pub item: ItemSummary,
    pub previous_picked_quantity: u32,
    pub order: OrderSummary,
    pub session: SessionProgress,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackOutcome {
    pub order: OrderSummary,
    pub session: SessionProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub orders: Vec<Order>,
    #[serde(default)]
    pub current_order_id: Option<OrderId>,
}

impl Session {
    /// Builds an active session over `orders`, preserving their order as the
    /// picking queue. Seeded pick counts are clamped to each item's quantity.
    pub fn new(id: SessionId, mut orders: Vec<Order>) -> Self {
        for item in orders.iter_mut().flat_map(|order| order.items.iter_mut()) {
            item.picked_quantity = item.picked_quantity.min(item.quantity);
        }
        let current_order_id = orders
            .iter()
            .find(|order| !order.is_packed())
            .or_else(|| orders.first())
            .map(|order| order.id);
        Self {
            id,
            status: SessionStatus::Active,
            created_at: Utc::now(),
            ended_at: None,
            orders,
            current_order_id,
        }
    }

    pub fn order(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.iter().find(|order| order.id == order_id)
    }

    pub fn order_mut(&mut self, order_id: OrderId) -> Option<&mut Order> {
        self.orders.iter_mut().find(|order| order.id == order_id)
    }

    pub fn order_ids(&self) -> Vec<OrderId> {
        self.orders.iter().map(|order| order.id).collect()
    }

    /// Position of an item as (order index, item index).
    pub fn locate_item(&self, item_id: ItemId) -> Option<(usize, usize)> {
        self.orders.iter().enumerate().find_map(|(order_idx, order)| {
            order
                .items
                .iter()
                .position(|item| item.id == item_id)
                .map(|item_idx| (order_idx, item_idx))
        })
    }

    pub fn progress(&self) -> SessionProgress {
        let total_quantity = self.orders.iter().map(Order::total_quantity).sum();
        let picked_quantity = self.orders.iter().map(Order::picked_quantity).sum();
        SessionProgress {
            total_orders: self.orders.len(),
            packed_orders: self.orders.iter().filter(|order| order.is_packed()).count(),
            total_quantity,
            picked_quantity,
            picked_percentage: ratio(picked_quantity, total_quantity),
        }
    }

    pub fn ensure_active(&self) -> Result<(), MutationError> {
        if self.status.is_terminal() {
            return Err(MutationError::SessionNotActive(self.status));
        }
        Ok(())
    }

    pub fn apply_delta(
        &mut self,
        item_id: ItemId,
        action: ItemAction,
    ) -> Result<DeltaOutcome, MutationError> {
        self.ensure_active()?;
        let (order_idx, item_idx) = self
            .locate_item(item_id)
            .ok_or(MutationError::ItemNotFound(item_id))?;

        let order = &mut self.orders[order_idx];
        if order.is_packed() {
            return Err(MutationError::OrderPacked(order.id));
        }

        let item = &mut order.items[item_idx];
        let previous_picked_quantity = item.picked_quantity;
        item.picked_quantity = action.apply(item.picked_quantity, item.quantity);
        let item = item.summary(order.id);
        let order = order.summary();

        Ok(DeltaOutcome {
            item,
            previous_picked_quantity,
            order,
            session: self.progress(),
        })
    }

    pub fn ensure_packable(&self, order_id: OrderId) -> Result<(), MutationError> {
        self.ensure_active()?;
        let order = self
            .order(order_id)
            .ok_or(MutationError::OrderNotFound(order_id))?;
        if order.is_packed() {
            return Err(MutationError::AlreadyPacked(order_id));
        }
        if !order.is_fully_picked() {
            return Err(MutationError::OrderNotFullyPicked {
                order_id,
                picked: order.picked_quantity(),
                total: order.total_quantity(),
            });
        }
        Ok(())
    }

    pub fn mark_packed(
        &mut self,
        order_id: OrderId,
        details: PackingDetails,
    ) -> Result<PackOutcome, MutationError> {
        self.ensure_packable(order_id)?;
        let order = self
            .order_mut(order_id)
            .ok_or(MutationError::OrderNotFound(order_id))?;
        order.packing_completed_at = Some(details.packed_at);
        order.packaging_material_id = details.material_id;
        order.package_weight = details.weight;
        if details.photo_url.is_some() {
            order.packing_photo_url = details.photo_url;
        }
        let order = order.summary();
        Ok(PackOutcome {
            order,
            session: self.progress(),
        })
    }

    pub fn navigate(&mut self, order_id: OrderId) -> Result<(), MutationError> {
        self.ensure_active()?;
        if self.order(order_id).is_none() {
            return Err(MutationError::OrderNotFound(order_id));
        }
        self.current_order_id = Some(order_id);
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<SessionProgress, MutationError> {
        self.ensure_active()?;
        self.status = SessionStatus::Completed;
        self.ended_at = Some(now);
        Ok(self.progress())
    }

    /// Cancels the session and returns the order ids whose soft-lock must be
    /// released.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<Vec<OrderId>, MutationError> {
        self.ensure_active()?;
        self.status = SessionStatus::Cancelled;
        self.ended_at = Some(now);
        Ok(self.order_ids())
    }

    pub fn attach_photo(
        &mut self,
        order_id: OrderId,
        photo_url: String,
    ) -> Result<OrderSummary, MutationError> {
        self.ensure_active()?;
        let order = self
            .order_mut(order_id)
            .ok_or(MutationError::OrderNotFound(order_id))?;
        order.packing_photo_url = Some(photo_url);
        Ok(order.summary())
    }

    /// First order in queue order that still needs packing, skipping `after`.
    pub fn next_unpacked_after(&self, after: OrderId) -> Option<OrderId> {
        self.orders
            .iter()
            .find(|order| order.id != after && !order.is_packed())
            .map(|order| order.id)
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(quantities: &[u32]) -> Session {
        let items = quantities
            .iter()
            .enumerate()
            .map(|(idx, qty)| Item::new(idx as ItemId + 1, format!("SKU-{idx}"), "widget", *qty))
            .collect();
        Session::new(Uuid::new_v4(), vec![Order::new(10, "A-10", "Ada", items)])
    }

    #[test]
    fn seeded_pick_counts_are_clamped_to_quantity() {
        let mut item = Item::new(1, "SKU-0", "widget", 2);
        item.picked_quantity = 5;
        let session = Session::new(Uuid::new_v4(), vec![Order::new(10, "A-10", "Ada", vec![item])]);

        let seeded = &session.orders[0].items[0];
        assert_eq!(seeded.picked_quantity, 2);
        assert_eq!(seeded.status(), ItemStatus::Picked);
        assert_eq!(session.progress().picked_percentage, 1.0);
    }

    #[test]
    fn increment_clamps_at_quantity() {
        let mut session = session_with(&[1]);
        session.apply_delta(1, ItemAction::Increment).unwrap();
        let outcome = session.apply_delta(1, ItemAction::Increment).unwrap();
        assert_eq!(outcome.item.picked_quantity, 1);
        assert_eq!(outcome.previous_picked_quantity, 1);
        assert_eq!(outcome.item.status, ItemStatus::Picked);
    }

    #[test]
    fn decrement_clamps_at_zero() {
        let mut session = session_with(&[3]);
        let outcome = session.apply_delta(1, ItemAction::Decrement).unwrap();
        assert_eq!(outcome.item.picked_quantity, 0);
        assert_eq!(outcome.item.status, ItemStatus::NotStarted);
    }

    #[test]
    fn aggregates_follow_item_writes() {
        let mut session = session_with(&[2, 2]);
        session.apply_delta(1, ItemAction::PickAll).unwrap();
        let outcome = session.apply_delta(2, ItemAction::Increment).unwrap();
        assert_eq!(outcome.order.picked_quantity, 3);
        assert_eq!(outcome.order.total_quantity, 4);
        assert!((outcome.order.picked_percentage - 0.75).abs() < f64::EPSILON);
        assert!(!outcome.order.is_fully_picked);
        assert_eq!(outcome.session.picked_quantity, 3);
    }

    #[test]
    fn empty_order_reports_zero_percent_and_is_not_fully_picked() {
        let order = Order::new(1, "A-1", "Ada", Vec::new());
        assert_eq!(order.picked_percentage(), 0.0);
        assert!(!order.is_fully_picked());
    }

    #[test]
    fn unknown_item_is_rejected() {
        let mut session = session_with(&[1]);
        assert_eq!(
            session.apply_delta(99, ItemAction::Increment),
            Err(MutationError::ItemNotFound(99))
        );
    }

    #[test]
    fn terminal_session_rejects_everything() {
        let mut session = session_with(&[1]);
        session.complete(Utc::now()).unwrap();
        assert_eq!(
            session.apply_delta(1, ItemAction::Increment),
            Err(MutationError::SessionNotActive(SessionStatus::Completed))
        );
        assert_eq!(
            session.cancel(Utc::now()),
            Err(MutationError::SessionNotActive(SessionStatus::Completed))
        );
    }

    #[test]
    fn next_unpacked_skips_packed_and_current() {
        let mut session = Session::new(
            Uuid::new_v4(),
            vec![
                Order::new(1, "A-1", "Ada", vec![Item::new(1, "S1", "a", 1)]),
                Order::new(2, "A-2", "Bob", vec![Item::new(2, "S2", "b", 1)]),
                Order::new(3, "A-3", "Cy", vec![Item::new(3, "S3", "c", 1)]),
            ],
        );
        session.orders[1].packing_completed_at = Some(Utc::now());
        assert_eq!(session.next_unpacked_after(1), Some(3));
        assert_eq!(session.next_unpacked_after(3), Some(1));
    }
}
