//! Testing utilities and mock implementations
//!
//! This module provides an in-memory broker for exercising the shadow and
//! jobs components without an MQTT endpoint.

pub mod mocks;

pub use mocks::*;
