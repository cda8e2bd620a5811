//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod mock_transport;

pub use mock_transport::{MockExec, MockTransport};
