//! Horizon Maestro Library
//!
//! Fleet deployment orchestrator: builds one container image and rolls it
//! out to every configured host concurrently, with a WebSocket side channel
//! for dashboard status and control.

pub mod app;
pub mod config;
pub mod dashboard;
pub mod deploy;
pub mod errors;
pub mod logs;
pub mod notifier;
pub mod utils;
