//! tunl: expose a local HTTP server through a public relay
//!
//! The relay accepts public requests under `/{subdomain}/...` and forwards
//! them over a single WebSocket per client. The client replays each request
//! against its local server and sends the response back on the same
//! connection.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod ingress;
pub mod pending;
pub mod registry;
pub mod server;
pub mod tunnel;

pub use error::{Result, TunnelError};
