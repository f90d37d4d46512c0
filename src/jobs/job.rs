//! Job execution handle
//!
//! A handle starts undescribed. `describe` replaces status, version and
//! document together from an accepted response, or leaves all three as they
//! were. `update` posts a new status with the last known version as the
//! expected-version precondition.

use super::protocol::UpdateProtocol;
use crate::correlation::{call, decode, rejection, CorrelatedRequest};
use crate::error::CallError;
use crate::protocol::{
    ClientTokenRequest, DescribeResponse, JobId, JobStatus, JobTopics, ResponseKind,
    StatusDetails, TopicMatch,
};
use crate::session::ThingSession;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

/// Lifecycle position derived from the last known status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Never described or updated
    Undescribed,
    /// Status known and still changeable (queued or in progress)
    Described,
    /// Status known and final
    Terminal(JobStatus),
}

/// Handle on one job execution of this thing
#[derive(Debug)]
pub struct Job {
    session: Arc<ThingSession>,
    id: JobId,
    topics: JobTopics,
    protocol: Arc<dyn UpdateProtocol>,
    timeout: Duration,
    status: Option<JobStatus>,
    version: Option<u64>,
    document: Option<Value>,
    status_details: StatusDetails,
}

impl Job {
    pub fn new(
        session: Arc<ThingSession>,
        id: JobId,
        protocol: Arc<dyn UpdateProtocol>,
        timeout: Duration,
    ) -> Self {
        let topics = session.topics().job(&id);
        Self {
            session,
            id,
            topics,
            protocol,
            timeout,
            status: None,
            version: None,
            document: None,
            status_details: StatusDetails::new(),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn status(&self) -> Option<JobStatus> {
        self.status
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn document(&self) -> Option<&Value> {
        self.document.as_ref()
    }

    /// Details sent with the last successful update
    pub fn status_details(&self) -> &StatusDetails {
        &self.status_details
    }

    pub fn phase(&self) -> JobPhase {
        match self.status {
            None => JobPhase::Undescribed,
            Some(status) if status.is_terminal() => JobPhase::Terminal(status),
            Some(_) => JobPhase::Described,
        }
    }

    /// Fetch status, version and document from the service
    pub async fn describe(&mut self) -> Result<(), CallError> {
        let span = crate::job_span!(job_id = %self.id, thing = %self.session.thing(), op = "describe");
        self.describe_inner().instrument(span).await
    }

    async fn describe_inner(&mut self) -> Result<(), CallError> {
        let request = CorrelatedRequest::json(
            self.topics.get(),
            &ClientTokenRequest {
                client_token: self.session.client_token().to_string(),
            },
            self.topics.get_responses(),
            TopicMatch::Child(self.topics.get()),
            self.timeout,
        )?;
        let message = call(&self.session, request).await?;

        let response: DescribeResponse = match ResponseKind::of(&message.topic) {
            ResponseKind::Rejected => return Err(rejection(&message)),
            _ => decode(&message).map_err(|e| {
                warn!("Describe response unusable, keeping previous state: {}", e);
                e
            })?,
        };

        let execution = response.execution;
        self.status = Some(execution.status);
        self.version = Some(execution.version_number);
        self.document = Some(execution.job_document);
        debug!(status = %execution.status, version = execution.version_number, "Job described");
        Ok(())
    }

    /// Post a new execution status
    ///
    /// Succeeds iff the acknowledgment reports `status`. On success only the
    /// local status (and details) change; call [`Job::describe`] for the new
    /// version.
    pub async fn update(&mut self, status: JobStatus, details: StatusDetails) -> Result<(), CallError> {
        let span = crate::job_span!(
            job_id = %self.id,
            thing = %self.session.thing(),
            op = "update",
            %status,
            protocol = %self.protocol.variant()
        );
        self.update_inner(status, details).instrument(span).await
    }

    async fn update_inner(&mut self, status: JobStatus, details: StatusDetails) -> Result<(), CallError> {
        let body = self.protocol.request(
            status,
            details.clone(),
            self.version,
            self.session.client_token(),
        );
        let request = CorrelatedRequest::json(
            self.topics.update(),
            &body,
            self.protocol.response_filter(&self.topics),
            self.protocol.response_rule(&self.topics),
            self.timeout,
        )?;
        let message = call(&self.session, request).await?;

        self.protocol.interpret(status, &message)?;
        self.status = Some(status);
        self.status_details = details;
        info!("Job status updated");
        Ok(())
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.session.thing())
    }
}
