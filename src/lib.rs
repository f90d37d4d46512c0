//! thingsync - device shadows and remote jobs over one MQTT connection
//!
//! A constrained device talks to its fleet-management service through the
//! reserved `$aws/things/{thing}/...` topics. This crate turns that
//! publish/subscribe channel into:
//! - fire-and-forget shadow reports and a reconciling delta callback
//! - correlated, deadline-bounded jobs calls (list, describe, update)
//! - a coalescing "jobs changed" flag fed by `jobs/notify`
//! - a FOTA coordinator built on the jobs API
//!
//! Every component receives an `Arc<ThingSession>` explicitly; there is no
//! global connection.
//!
//! # Quick Start
//!
//! ```rust
//! use thingsync::protocol::{ShadowReport, ThingName, ThingTopics};
//! use serde_json::json;
//!
//! let thing = ThingName::new("sensor-01").unwrap();
//! let topics = ThingTopics::new(&thing);
//! assert_eq!(topics.shadow_update(), "$aws/things/sensor-01/shadow/update");
//!
//! let report = ShadowReport::new(json!({"led": "on"}).as_object().unwrap().clone());
//! let body = serde_json::to_value(&report).unwrap();
//! assert_eq!(body, json!({"state": {"reported": {"led": "on"}}}));
//! ```

pub mod config;
pub mod correlation;
pub mod error;
pub mod jobs;
pub mod observability;
pub mod ota;
pub mod protocol;
pub mod router;
pub mod session;
pub mod shadow;
pub mod testing;
pub mod transport;

pub use config::ThingConfig;
pub use error::{CallError, ThingError, ThingResult};
pub use jobs::{Job, JobListing, JobPhase, Jobs, JobsOptions, JobsProtocol};
pub use ota::{FirmwareUpdater, FotaAction, FotaCoordinator};
pub use protocol::{JobId, JobStatus, StateMap, StatusDetails, ThingName, TopicMatch};
pub use router::TopicRouter;
pub use session::{Subscription, ThingSession};
pub use shadow::Shadow;
pub use transport::mqtt::MqttClient;
