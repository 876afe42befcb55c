//! Unit tests for Maestro

mod mocks;
mod test_app;
mod test_engine;
mod test_fsm;
mod test_installer;
