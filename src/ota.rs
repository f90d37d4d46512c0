//! Firmware-over-the-air job handling
//!
//! A FOTA job is a job whose document carries `"operation": "fota"` and a
//! target `"version"`. One [`FotaCoordinator::poll`] pass confirms or fails
//! jobs left in progress by a previous boot, then starts at most one queued
//! update while none of its own is still running. Nothing is retried; the
//! caller decides when to poll again.

use crate::error::CallError;
use crate::jobs::{Job, Jobs};
use crate::protocol::{JobId, JobStatus, StatusDetails};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const FOTA_OPERATION: &str = "fota";

/// Job document of a firmware update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FotaDocument {
    pub operation: String,
    pub version: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl FotaDocument {
    /// Parse a job document, `None` unless it describes a FOTA operation
    pub fn from_document(document: &Value) -> Option<Self> {
        let parsed: FotaDocument = serde_json::from_value(document.clone()).ok()?;
        (parsed.operation == FOTA_OPERATION).then_some(parsed)
    }
}

#[derive(Debug, Error)]
pub enum FotaError {
    #[error("Update command failed: {0}")]
    CommandFailed(String),

    #[error("Failed to start update command: {0}")]
    Io(#[from] std::io::Error),

    #[error("No update command configured")]
    NotConfigured,
}

/// Device side of a firmware update
#[async_trait]
pub trait FirmwareUpdater: Send + Sync {
    /// Version of the firmware currently running
    async fn running_version(&self) -> u64;

    /// Start installing the firmware described by `document`
    async fn begin_update(&self, document: &FotaDocument) -> Result<(), FotaError>;
}

/// What one poll did to one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FotaAction {
    /// Running firmware matches an in-progress job; reported SUCCEEDED
    Confirmed { job_id: JobId, version: u64 },
    /// Reported FAILED
    Failed { job_id: JobId, reason: String },
    /// Queued job moved to IN_PROGRESS and the updater accepted it
    Started { job_id: JobId, version: u64 },
    /// Job left untouched because a call failed
    Skipped { job_id: JobId, reason: String },
}

pub struct FotaCoordinator {
    jobs: Arc<Jobs>,
    updater: Arc<dyn FirmwareUpdater>,
    // Jobs this coordinator moved to IN_PROGRESS and handed to the updater
    started: Mutex<HashSet<JobId>>,
}

impl FotaCoordinator {
    pub fn new(jobs: Arc<Jobs>, updater: Arc<dyn FirmwareUpdater>) -> Self {
        Self {
            jobs,
            updater,
            started: Mutex::new(HashSet::new()),
        }
    }

    /// Handle pending FOTA jobs if the directory changed or `force` is set
    ///
    /// A failed listing keeps the pending change, so the next unforced poll
    /// lists again.
    pub async fn poll(&self, force: bool) -> Result<Vec<FotaAction>, CallError> {
        let changed = self.jobs.changed();
        if !changed && !force {
            return Ok(Vec::new());
        }

        let listing = match self.jobs.list().await {
            Ok(listing) => listing,
            Err(e) => {
                if changed {
                    self.jobs.mark_changed();
                }
                return Err(e);
            }
        };
        debug!(
            in_progress = listing.in_progress.len(),
            queued = listing.queued.len(),
            "Checking jobs for firmware updates"
        );

        let mut actions = Vec::new();
        let running = self.updater.running_version().await;

        let ours: HashSet<JobId> = {
            let mut started = self.started();
            started.retain(|id| listing.in_progress.iter().any(|job| job.id() == id));
            started.clone()
        };

        for mut job in listing.in_progress {
            if ours.contains(job.id()) {
                debug!(job_id = %job.id(), "Firmware update still running");
                continue;
            }
            let Some(document) = describe_fota(&mut job, &mut actions).await else {
                continue;
            };
            actions.push(self.settle(&mut job, &document, running).await);
        }

        if !ours.is_empty() {
            return Ok(actions);
        }

        for mut job in listing.queued {
            let Some(document) = describe_fota(&mut job, &mut actions).await else {
                continue;
            };
            actions.push(self.start(&mut job, &document).await);
            break;
        }

        Ok(actions)
    }

    async fn settle(&self, job: &mut Job, document: &FotaDocument, running: u64) -> FotaAction {
        let job_id = job.id().clone();
        if running == document.version {
            match job.update(JobStatus::Succeeded, details(document)).await {
                Ok(()) => {
                    info!(%job_id, version = running, "Firmware update confirmed");
                    FotaAction::Confirmed {
                        job_id,
                        version: running,
                    }
                }
                Err(e) => skipped(job_id, e),
            }
        } else {
            let reason = format!(
                "running version {running} after update to {}",
                document.version
            );
            fail(job, reason).await
        }
    }

    async fn start(&self, job: &mut Job, document: &FotaDocument) -> FotaAction {
        let job_id = job.id().clone();
        if let Err(e) = job.update(JobStatus::InProgress, details(document)).await {
            return skipped(job_id, e);
        }

        match self.updater.begin_update(document).await {
            Ok(()) => {
                info!(%job_id, version = document.version, "Firmware update started");
                self.started().insert(job_id.clone());
                FotaAction::Started {
                    job_id,
                    version: document.version,
                }
            }
            Err(e) => fail(job, e.to_string()).await,
        }
    }

    fn started(&self) -> std::sync::MutexGuard<'_, HashSet<JobId>> {
        self.started.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn describe_fota(job: &mut Job, actions: &mut Vec<FotaAction>) -> Option<FotaDocument> {
    if let Err(e) = job.describe().await {
        actions.push(skipped(job.id().clone(), e));
        return None;
    }
    let document = job.document().and_then(FotaDocument::from_document);
    if document.is_none() {
        debug!(job_id = %job.id(), "Not a firmware update job");
    }
    document
}

async fn fail(job: &mut Job, reason: String) -> FotaAction {
    let job_id = job.id().clone();
    let mut status_details = StatusDetails::new();
    status_details.insert("reason".to_string(), reason.clone());

    match job.update(JobStatus::Failed, status_details).await {
        Ok(()) => {
            warn!(%job_id, %reason, "Firmware update failed");
            FotaAction::Failed { job_id, reason }
        }
        Err(e) => skipped(job_id, e),
    }
}

fn details(document: &FotaDocument) -> StatusDetails {
    let mut details = StatusDetails::new();
    details.insert("version".to_string(), document.version.to_string());
    details
}

fn skipped(job_id: JobId, error: CallError) -> FotaAction {
    warn!(%job_id, "Leaving firmware job untouched: {}", error);
    FotaAction::Skipped {
        job_id,
        reason: error.to_string(),
    }
}

/// Updater that runs an external command with the target version as argument
#[derive(Debug, Clone)]
pub struct CommandUpdater {
    running_version: u64,
    command: Option<String>,
}

impl CommandUpdater {
    pub fn new(running_version: u64, command: Option<String>) -> Self {
        Self {
            running_version,
            command,
        }
    }
}

#[async_trait]
impl FirmwareUpdater for CommandUpdater {
    async fn running_version(&self) -> u64 {
        self.running_version
    }

    async fn begin_update(&self, document: &FotaDocument) -> Result<(), FotaError> {
        let command = self.command.as_deref().ok_or(FotaError::NotConfigured)?;
        info!(command, version = document.version, "Running update command");

        let status = tokio::process::Command::new(command)
            .arg(document.version.to_string())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(FotaError::CommandFailed(format!("{command} exited with {status}")))
        }
    }
}
