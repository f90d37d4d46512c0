//! Job update protocol variants
//!
//! Two generations of the jobs service acknowledge updates differently:
//!
//! | Variant | Acknowledgment topics | Acknowledgment body |
//! |---|---|---|
//! | `current` | `jobs/{id}/update/accepted`, `.../update/rejected` | `{"executionState": {"status": ...}}` |
//! | `legacy` | `jobs/{id}/updated/...` | bare status string |
//!
//! The variant is chosen once in configuration and applies to every job
//! handle created by a [`Jobs`](super::Jobs) directory.

use crate::correlation::{decode, rejection};
use crate::error::CallError;
use crate::protocol::{
    JobStatus, JobTopics, ResponseKind, StatusDetails, TopicMatch, UpdateAccepted, UpdateRequest,
};
use crate::transport::InboundMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// Protocol generation selected in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobsProtocol {
    #[default]
    Current,
    Legacy,
}

impl JobsProtocol {
    /// Strategy implementing this variant
    pub fn strategy(self, include_job_document: bool) -> Arc<dyn UpdateProtocol> {
        match self {
            JobsProtocol::Current => Arc::new(CurrentUpdate {
                include_job_document,
            }),
            JobsProtocol::Legacy => Arc::new(LegacyUpdate),
        }
    }
}

impl fmt::Display for JobsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobsProtocol::Current => write!(f, "current"),
            JobsProtocol::Legacy => write!(f, "legacy"),
        }
    }
}

impl FromStr for JobsProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "current" => Ok(JobsProtocol::Current),
            "legacy" => Ok(JobsProtocol::Legacy),
            other => Err(format!("unknown jobs protocol '{other}'")),
        }
    }
}

/// How one protocol variant shapes an update and reads its acknowledgment
pub trait UpdateProtocol: Send + Sync + fmt::Debug {
    fn variant(&self) -> JobsProtocol;

    fn request(
        &self,
        status: JobStatus,
        status_details: StatusDetails,
        expected_version: Option<u64>,
        client_token: &str,
    ) -> UpdateRequest;

    /// Broker subscription the acknowledgment arrives through
    fn response_filter(&self, topics: &JobTopics) -> String;

    /// Routing rule selecting acknowledgments (never the request topic itself)
    fn response_rule(&self, topics: &JobTopics) -> TopicMatch;

    /// Succeed iff the acknowledgment reports `requested`
    fn interpret(&self, requested: JobStatus, message: &InboundMessage) -> Result<(), CallError>;
}

fn compare(requested: JobStatus, reported: JobStatus) -> Result<(), CallError> {
    if requested == reported {
        Ok(())
    } else {
        warn!(%requested, %reported, "Update acknowledged with a different status");
        Err(CallError::StatusMismatch {
            requested,
            reported: reported.to_string(),
        })
    }
}

/// `/update/#` acknowledgments carrying `executionState`
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentUpdate {
    pub include_job_document: bool,
}

impl UpdateProtocol for CurrentUpdate {
    fn variant(&self) -> JobsProtocol {
        JobsProtocol::Current
    }

    fn request(
        &self,
        status: JobStatus,
        status_details: StatusDetails,
        expected_version: Option<u64>,
        client_token: &str,
    ) -> UpdateRequest {
        UpdateRequest {
            status,
            status_details,
            expected_version,
            include_job_execution_state: Some(true),
            include_job_document: self.include_job_document.then_some(true),
            client_token: client_token.to_string(),
        }
    }

    fn response_filter(&self, topics: &JobTopics) -> String {
        format!("{}/#", topics.update())
    }

    fn response_rule(&self, topics: &JobTopics) -> TopicMatch {
        TopicMatch::Child(topics.update())
    }

    fn interpret(&self, requested: JobStatus, message: &InboundMessage) -> Result<(), CallError> {
        match ResponseKind::of(&message.topic) {
            ResponseKind::Rejected => Err(rejection(message)),
            ResponseKind::Accepted => {
                let accepted: UpdateAccepted = decode(message)?;
                compare(requested, accepted.execution_state.status)
            }
            ResponseKind::Other => Err(CallError::malformed(
                &message.topic,
                "unexpected acknowledgment topic",
            )),
        }
    }
}

/// `/updated/#` acknowledgments carrying a bare status string
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyUpdate;

impl LegacyUpdate {
    fn reported_status(message: &InboundMessage) -> Result<String, CallError> {
        // Either a JSON string or plain text
        if let Ok(status) = serde_json::from_slice::<String>(&message.payload) {
            return Ok(status);
        }
        if let Ok(accepted) = serde_json::from_slice::<UpdateAccepted>(&message.payload) {
            return Ok(accepted.execution_state.status.to_string());
        }
        std::str::from_utf8(&message.payload)
            .map(|text| text.trim().to_string())
            .map_err(|e| CallError::malformed(&message.topic, e.to_string()))
    }
}

impl UpdateProtocol for LegacyUpdate {
    fn variant(&self) -> JobsProtocol {
        JobsProtocol::Legacy
    }

    fn request(
        &self,
        status: JobStatus,
        status_details: StatusDetails,
        expected_version: Option<u64>,
        client_token: &str,
    ) -> UpdateRequest {
        UpdateRequest {
            status,
            status_details,
            expected_version,
            include_job_execution_state: None,
            include_job_document: None,
            client_token: client_token.to_string(),
        }
    }

    fn response_filter(&self, topics: &JobTopics) -> String {
        format!("{}/#", topics.updated())
    }

    fn response_rule(&self, topics: &JobTopics) -> TopicMatch {
        TopicMatch::Prefix(topics.updated())
    }

    fn interpret(&self, requested: JobStatus, message: &InboundMessage) -> Result<(), CallError> {
        if ResponseKind::of(&message.topic) == ResponseKind::Rejected {
            return Err(rejection(message));
        }
        let text = Self::reported_status(message)?;
        match text.parse::<JobStatus>() {
            Ok(reported) => compare(requested, reported),
            Err(_) => {
                warn!(topic = %message.topic, status = %text, "Unrecognized acknowledgment status");
                Err(CallError::StatusMismatch {
                    requested,
                    reported: text,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JobId, ThingName, ThingTopics};
    use serde_json::json;

    fn topics() -> JobTopics {
        ThingTopics::new(&ThingName::new("t").unwrap()).job(&JobId::new("j1").unwrap())
    }

    #[test]
    fn test_protocol_parse_and_display() {
        assert_eq!("CURRENT".parse::<JobsProtocol>(), Ok(JobsProtocol::Current));
        assert_eq!("legacy".parse::<JobsProtocol>(), Ok(JobsProtocol::Legacy));
        assert!("v3".parse::<JobsProtocol>().is_err());
        assert_eq!(JobsProtocol::default().to_string(), "current");
    }

    #[test]
    fn test_current_rule_excludes_request_topic() {
        let strategy = CurrentUpdate::default();
        let rule = strategy.response_rule(&topics());

        assert_eq!(strategy.response_filter(&topics()), "$aws/things/t/jobs/j1/update/#");
        assert!(!rule.matches("$aws/things/t/jobs/j1/update"));
        assert!(rule.matches("$aws/things/t/jobs/j1/update/accepted"));
        assert!(rule.matches("$aws/things/t/jobs/j1/update/rejected"));
        assert!(!rule.matches("$aws/things/t/jobs/j10/update/accepted"));
    }

    #[test]
    fn test_current_request_shape() {
        let mut details = StatusDetails::new();
        details.insert("step".to_string(), "2".to_string());

        let request = CurrentUpdate {
            include_job_document: false,
        }
        .request(JobStatus::InProgress, details, Some(4), "tok");

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "status": "IN_PROGRESS",
                "statusDetails": {"step": "2"},
                "expectedVersion": 4,
                "includeJobExecutionState": true,
                "clientToken": "tok"
            })
        );
    }

    #[test]
    fn test_current_interpret() {
        let strategy = CurrentUpdate::default();
        let accepted = InboundMessage::new(
            "$aws/things/t/jobs/j1/update/accepted",
            json!({"executionState": {"status": "SUCCEEDED", "versionNumber": 3}}).to_string(),
        );
        assert!(strategy.interpret(JobStatus::Succeeded, &accepted).is_ok());
        assert!(matches!(
            strategy.interpret(JobStatus::Failed, &accepted),
            Err(CallError::StatusMismatch { .. })
        ));

        let rejected = InboundMessage::new(
            "$aws/things/t/jobs/j1/update/rejected",
            json!({"code": "VersionMismatch"}).to_string(),
        );
        assert!(matches!(
            strategy.interpret(JobStatus::Succeeded, &rejected),
            Err(CallError::Rejected { .. })
        ));

        let garbage = InboundMessage::new("$aws/things/t/jobs/j1/update/accepted", "{}");
        assert!(matches!(
            strategy.interpret(JobStatus::Succeeded, &garbage),
            Err(CallError::Malformed { .. })
        ));
    }

    #[test]
    fn test_legacy_topics_and_request() {
        let strategy = LegacyUpdate;
        assert_eq!(strategy.response_filter(&topics()), "$aws/things/t/jobs/j1/updated/#");
        assert!(strategy
            .response_rule(&topics())
            .matches("$aws/things/t/jobs/j1/updated/accepted"));

        let body = serde_json::to_value(strategy.request(
            JobStatus::Succeeded,
            StatusDetails::new(),
            None,
            "tok",
        ))
        .unwrap();
        assert_eq!(
            body,
            json!({"status": "SUCCEEDED", "statusDetails": {}, "clientToken": "tok"})
        );
    }

    #[test]
    fn test_legacy_interpret_bare_status() {
        let strategy = LegacyUpdate;
        let topic = "$aws/things/t/jobs/j1/updated";

        assert!(strategy
            .interpret(JobStatus::Succeeded, &InboundMessage::new(topic, "SUCCEEDED"))
            .is_ok());
        assert!(strategy
            .interpret(JobStatus::Succeeded, &InboundMessage::new(topic, "\"SUCCEEDED\""))
            .is_ok());

        match strategy.interpret(JobStatus::Succeeded, &InboundMessage::new(topic, "REJECTED")) {
            Err(CallError::StatusMismatch { reported, .. }) => assert_eq!(reported, "REJECTED"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
