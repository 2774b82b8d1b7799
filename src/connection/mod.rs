//! Remote connection management
//!
//! Maintains one WebSocket session to the remote GPIO endpoint, publishes
//! connection state, and reconnects with exponential backoff.

mod backoff;
mod machine;
mod manager;
mod state;
mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use manager::{ConnectionEvent, ConnectionManager, ManagerOptions};
pub use state::ConnectionState;
pub use transport::{ConnectRequest, RequestSource, WsConnector};
