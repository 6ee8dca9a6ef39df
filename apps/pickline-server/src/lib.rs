//! Pickline session server: per-session rooms over a shared store, mobile
//! pairing, and the HTTP and websocket surface.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod pairing;
pub mod room;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod websocket;

pub use config::{Cli, ServerConfig};
pub use error::ApiError;
pub use routes::build_router;
pub use state::AppState;
