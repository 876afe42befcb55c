//! Deployment module

pub mod builder;
pub mod connector;
pub mod coordinator;
pub mod deployer;
pub mod engine;
pub mod fsm;
pub mod installer;
pub mod runtime;
pub mod ssh;
pub mod summary;
