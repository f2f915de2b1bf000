//! Shared helpers for the sessionizer integration tests.

pub mod containers;
pub mod setup;
