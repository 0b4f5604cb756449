//! Network side of the bridge
//!
//! - `bridge`: protocol event dispatcher and the host/transport seams
//! - `ws`: WebSocket listener and per-connection tasks

pub mod bridge;
pub mod ws;

pub use bridge::{EndpointConfig, Host, InputModes, Link, Outbox};
pub use ws::Server;
