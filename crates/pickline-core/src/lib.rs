//! Core primitives shared by the Pickline session server and its clients.
//!
//! The server owns a [`store::SessionStore`] and drives every write through a
//! [`engine::MutationEngine`]; clients keep a [`reconciler::ClientView`] that
//! merges the resulting events. Both sides speak [`protocol`] over the wire.

pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod pairing;
pub mod protocol;
pub mod reconciler;
pub mod store;

pub use engine::{authorize, Mutation, MutationEngine, PackRequest};
pub use error::{ErrorKind, MutationError};
pub use event::{ControlEvent, EventKind, MutationEvent};
pub use model::{
    Item, ItemAction, ItemId, ItemStatus, ItemSummary, MaterialId, Order, OrderId, OrderSummary,
    Role, Session, SessionId, SessionProgress, SessionStatus,
};
pub use pairing::{PairingError, PairingGrant, PairingRecord};
pub use protocol::{ClientMessage, ServerMessage};
pub use reconciler::{ClientMode, ClientView, Reconcile};
pub use store::{SessionSnapshot, SessionStore};
