//! Side channel between the orchestrator and the dashboard
//!
//! Status events are pushed to dashboard clients connected to the local
//! listener and over an outbound link to the dashboard itself. Control
//! messages arriving on either path are forwarded to the application loop.
//! Losing the side channel never affects a deployment.

pub mod bus;
pub mod link;
pub mod protocol;
pub mod server;
