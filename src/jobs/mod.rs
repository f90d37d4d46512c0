//! Remote job execution
//!
//! [`Jobs`] is the per-thing directory: it lists pending executions and
//! exposes a coalescing change flag fed by `jobs/notify`. Each [`Job`] handle
//! describes and updates one execution.

pub mod job;
pub mod protocol;

pub use job::{Job, JobPhase};
pub use protocol::{CurrentUpdate, JobsProtocol, LegacyUpdate, UpdateProtocol};

use crate::config::JobsSection;
use crate::correlation::{call, decode, rejection, CorrelatedRequest};
use crate::error::CallError;
use crate::protocol::{ClientTokenRequest, JobId, JobListResponse, ResponseKind, TopicMatch};
use crate::router::Handler;
use crate::session::{Subscription, ThingSession};
use crate::transport::{InboundMessage, MqttError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

/// Settings shared by a directory and the handles it creates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobsOptions {
    pub protocol: JobsProtocol,
    pub call_timeout: Duration,
    pub include_job_document: bool,
}

impl Default for JobsOptions {
    fn default() -> Self {
        Self::from(&JobsSection::default())
    }
}

impl From<&JobsSection> for JobsOptions {
    fn from(section: &JobsSection) -> Self {
        Self {
            protocol: section.protocol,
            call_timeout: section.call_timeout(),
            include_job_document: section.include_job_document,
        }
    }
}

/// Result of [`Jobs::list`]
#[derive(Debug, Default)]
pub struct JobListing {
    pub in_progress: Vec<Job>,
    pub queued: Vec<Job>,
}

impl JobListing {
    pub fn is_empty(&self) -> bool {
        self.in_progress.is_empty() && self.queued.is_empty()
    }
}

/// Jobs directory for one thing
pub struct Jobs {
    session: Arc<ThingSession>,
    options: JobsOptions,
    strategy: Arc<dyn UpdateProtocol>,
    changed: Arc<AtomicBool>,
    // Held for the directory's lifetime; dropping it removes the notify route
    _notify: Subscription,
    call_lock: tokio::sync::Mutex<()>,
}

impl Jobs {
    /// Create the directory and install the `jobs/notify` listener
    pub async fn new(session: Arc<ThingSession>, options: JobsOptions) -> Result<Self, MqttError> {
        let changed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&changed);
        let handler: Handler = Arc::new(move |message: &InboundMessage| {
            debug!(topic = %message.topic, "Jobs notification");
            flag.store(true, Ordering::SeqCst);
        });

        let notify_topic = session.topics().jobs_notify();
        let notify = session
            .subscribe(notify_topic.clone(), TopicMatch::Exact(notify_topic), handler)
            .await?;
        info!(thing = %session.thing(), protocol = %options.protocol, "Jobs directory ready");

        Ok(Self {
            strategy: options.protocol.strategy(options.include_job_document),
            session,
            options,
            changed,
            _notify: notify,
            call_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn options(&self) -> &JobsOptions {
        &self.options
    }

    /// Whether a notification arrived since the previous call; clears the flag
    pub fn changed(&self) -> bool {
        self.changed.swap(false, Ordering::SeqCst)
    }

    /// Set the change flag again, as if a notification had arrived
    pub(crate) fn mark_changed(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }

    /// Handle for a job execution by id, without contacting the service
    pub fn job(&self, id: JobId) -> Job {
        Job::new(
            Arc::clone(&self.session),
            id,
            Arc::clone(&self.strategy),
            self.options.call_timeout,
        )
    }

    /// Pending executions, split into in-progress and queued
    ///
    /// A malformed or empty response yields an empty listing. A timeout or an
    /// explicit rejection is an error.
    pub async fn list(&self) -> Result<JobListing, CallError> {
        let _serialized = self.call_lock.lock().await;
        let span = crate::job_span!(thing = %self.session.thing(), op = "list");
        self.list_inner().instrument(span).await
    }

    async fn list_inner(&self) -> Result<JobListing, CallError> {
        let topics = self.session.topics();
        let request = CorrelatedRequest::json(
            topics.jobs_get(),
            &ClientTokenRequest {
                client_token: self.session.client_token().to_string(),
            },
            topics.jobs_get_responses(),
            TopicMatch::Child(topics.jobs_get()),
            self.options.call_timeout,
        )?;
        let message = call(&self.session, request).await?;

        if ResponseKind::of(&message.topic) == ResponseKind::Rejected {
            return Err(rejection(&message));
        }

        let response: JobListResponse = match decode(&message) {
            Ok(response) => response,
            Err(e) => {
                warn!("Treating unusable job list as empty: {}", e);
                JobListResponse::default()
            }
        };

        let listing = JobListing {
            in_progress: response
                .in_progress_jobs
                .into_iter()
                .map(|summary| self.job(summary.job_id))
                .collect(),
            queued: response
                .queued_jobs
                .into_iter()
                .map(|summary| self.job(summary.job_id))
                .collect(),
        };
        debug!(
            in_progress = listing.in_progress.len(),
            queued = listing.queued.len(),
            "Jobs listed"
        );
        Ok(listing)
    }
}

impl fmt::Debug for Jobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jobs")
            .field("thing", self.session.thing())
            .field("options", &self.options)
            .field("changed", &self.changed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mock_session;
    use serde_json::json;

    fn options() -> JobsOptions {
        JobsOptions {
            call_timeout: Duration::from_millis(200),
            ..JobsOptions::default()
        }
    }

    #[test]
    fn test_options_from_section() {
        let section = JobsSection {
            protocol: JobsProtocol::Legacy,
            call_timeout_ms: 1500,
            include_job_document: true,
            poll_interval_ms: 10,
        };
        let options = JobsOptions::from(&section);
        assert_eq!(options.protocol, JobsProtocol::Legacy);
        assert_eq!(options.call_timeout, Duration::from_millis(1500));
        assert!(options.include_job_document);
    }

    #[tokio::test]
    async fn test_notify_subscribed_at_construction() {
        let (session, mock) = mock_session("dir-thing");
        let jobs = Jobs::new(session, options()).await.unwrap();

        assert_eq!(
            mock.active_subscriptions().await,
            vec!["$aws/things/dir-thing/jobs/notify".to_string()]
        );
        assert!(!jobs.changed());
    }

    #[tokio::test]
    async fn test_list_rejected_is_error() {
        let (session, mock) = mock_session("dir-thing");
        let jobs = Jobs::new(session, options()).await.unwrap();
        mock.reply_to(
            "$aws/things/dir-thing/jobs/get",
            "$aws/things/dir-thing/jobs/get/rejected",
            json!({"code": "Throttled", "message": "slow down"}),
        )
        .await;

        match jobs.list().await {
            Err(CallError::Rejected { code, .. }) => assert_eq!(code.as_deref(), Some("Throttled")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_malformed_is_empty() {
        let (session, mock) = mock_session("dir-thing");
        let jobs = Jobs::new(session, options()).await.unwrap();
        mock.reply_raw(
            "$aws/things/dir-thing/jobs/get",
            "$aws/things/dir-thing/jobs/get/accepted",
            b"not json".to_vec(),
        )
        .await;

        let listing = jobs.list().await.unwrap();
        assert!(listing.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_directory_removes_notify_route() {
        let (session, mock) = mock_session("dir-thing");
        let jobs = Jobs::new(Arc::clone(&session), options()).await.unwrap();
        drop(jobs);

        assert!(session.router().is_empty());
        let delivered = mock
            .deliver_unfiltered("$aws/things/dir-thing/jobs/notify", json!({}))
            .await;
        assert_eq!(delivered, 0);
    }
}
