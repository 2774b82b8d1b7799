//! Wire protocol for the remote command endpoint
//!
//! Outbound frames are compact JSON objects `{"command": .., "led"?: ..}`.
//! Inbound frames carry an opaque selection token that is passed through
//! verbatim once decoded to text.

mod messages;

pub use messages::*;
