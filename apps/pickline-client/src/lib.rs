//! Websocket client for Pickline sessions: a socket-free [`SessionDriver`]
//! plus a reconnecting [`PickClient`] around it.

pub mod backoff;
pub mod connection;
pub mod driver;

pub use connection::PickClient;
pub use driver::{Action, Notice, SessionDriver, Step};
