//! Reserved-topic protocol for device shadows and jobs
//!
//! This module defines topic construction, routing rules and the JSON
//! documents exchanged on the `$aws/things/{thing}/...` topic families.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
