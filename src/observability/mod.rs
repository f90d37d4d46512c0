//! Observability for the thing runtime
//!
//! Structured logging only; every component reports through `tracing`.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{call_span, job_span, mqtt_span, shadow_span};
