//! Wire documents for the shadow and jobs reserved topics
//!
//! Field names follow the service's camelCase JSON. Response types only
//! declare the fields the device reads; anything else in a payload is ignored.

use super::topics::JobId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Flat key/value state as carried in shadow documents
pub type StateMap = Map<String, Value>;

/// Free-form status details attached to a job execution update
pub type StatusDetails = BTreeMap<String, String>;

/// Job execution status as tracked by the service
///
/// `TimedOut`, `Canceled` and `Removed` are only ever set by the service; a
/// device reports one of the other statuses.
///
/// # Examples
/// ```
/// use thingsync::protocol::JobStatus;
///
/// let status: JobStatus = "IN_PROGRESS".parse().unwrap();
/// assert_eq!(status, JobStatus::InProgress);
/// assert!(!status.is_terminal());
/// assert_eq!(serde_json::to_string(&JobStatus::Succeeded).unwrap(), "\"SUCCEEDED\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Rejected,
    TimedOut,
    Canceled,
    Removed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Rejected => "REJECTED",
            JobStatus::TimedOut => "TIMED_OUT",
            JobStatus::Canceled => "CANCELED",
            JobStatus::Removed => "REMOVED",
        }
    }

    /// Whether the execution can no longer change status
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::InProgress)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "REJECTED" => Ok(JobStatus::Rejected),
            "TIMED_OUT" => Ok(JobStatus::TimedOut),
            "CANCELED" => Ok(JobStatus::Canceled),
            "REMOVED" => Ok(JobStatus::Removed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// `{"state": {"reported": {...}}}` published on `shadow/update`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShadowReport {
    pub state: ReportedState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportedState {
    pub reported: StateMap,
}

impl ShadowReport {
    pub fn new(reported: StateMap) -> Self {
        Self {
            state: ReportedState { reported },
        }
    }
}

/// Delta document pushed on `shadow/update/delta`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DeltaDocument {
    pub state: StateMap,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// Request body for the `get` topics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientTokenRequest {
    pub client_token: String,
}

/// One entry of a `jobs/get/accepted` listing
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,
}

/// `jobs/get/accepted` body; both collections may be absent
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    #[serde(default)]
    pub in_progress_jobs: Vec<JobSummary>,
    #[serde(default)]
    pub queued_jobs: Vec<JobSummary>,
}

/// `jobs/{jobId}/get/accepted` body
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DescribeResponse {
    pub execution: ExecutionDescription,
}

/// Every field is required; a partial execution is rejected as a whole
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDescription {
    pub status: JobStatus,
    pub version_number: u64,
    pub job_document: Value,
}

/// Body published on `jobs/{jobId}/update`
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub status: JobStatus,
    pub status_details: StatusDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_job_execution_state: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_job_document: Option<bool>,
    pub client_token: String,
}

/// `jobs/{jobId}/update/accepted` body when execution state was requested
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccepted {
    pub execution_state: ExecutionState,
    #[serde(default)]
    pub job_document: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub status: JobStatus,
    #[serde(default)]
    pub version_number: Option<u64>,
}

/// Body of any `.../rejected` response
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub client_token: Option<String>,
}
