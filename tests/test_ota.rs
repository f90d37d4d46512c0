//! FOTA coordinator decisions against the in-memory broker

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thingsync::jobs::{Jobs, JobsOptions};
use thingsync::ota::{FirmwareUpdater, FotaAction, FotaCoordinator, FotaDocument, FotaError};
use thingsync::protocol::JobId;
use thingsync::testing::{mock_session, MockTransport};

const ROOT: &str = "$aws/things/node-3/jobs";

struct RecordingUpdater {
    running: u64,
    fail: bool,
    started: Mutex<Vec<u64>>,
}

impl RecordingUpdater {
    fn new(running: u64, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            running,
            fail,
            started: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl FirmwareUpdater for RecordingUpdater {
    async fn running_version(&self) -> u64 {
        self.running
    }

    async fn begin_update(&self, document: &FotaDocument) -> Result<(), FotaError> {
        self.started.lock().unwrap().push(document.version);
        if self.fail {
            Err(FotaError::CommandFailed("flash error".to_string()))
        } else {
            Ok(())
        }
    }
}

async fn coordinator(updater: Arc<RecordingUpdater>) -> (FotaCoordinator, Arc<MockTransport>) {
    let (session, mock) = mock_session("node-3");
    let jobs = Jobs::new(
        session,
        JobsOptions {
            call_timeout: Duration::from_millis(150),
            ..JobsOptions::default()
        },
    )
    .await
    .unwrap();
    (FotaCoordinator::new(Arc::new(jobs), updater), mock)
}

async fn script_listing(mock: &MockTransport, in_progress: &[&str], queued: &[&str]) {
    let summaries = |ids: &[&str]| -> Vec<Value> { ids.iter().map(|id| json!({"jobId": id})).collect() };
    mock.reply_to(
        &format!("{ROOT}/get"),
        &format!("{ROOT}/get/accepted"),
        json!({"inProgressJobs": summaries(in_progress), "queuedJobs": summaries(queued)}),
    )
    .await;
}

async fn script_job(mock: &MockTransport, job: &str, status: &str, document: Value) {
    mock.reply_to(
        &format!("{ROOT}/{job}/get"),
        &format!("{ROOT}/{job}/get/accepted"),
        json!({"execution": {"status": status, "versionNumber": 2, "jobDocument": document}}),
    )
    .await;
    mock.reply_with(
        &format!("{ROOT}/{job}/update"),
        &format!("{ROOT}/{job}/update/accepted"),
        |request| json!({"executionState": {"status": request["status"]}}),
    )
    .await;
}

fn id(raw: &str) -> JobId {
    JobId::new(raw).unwrap()
}

#[tokio::test]
async fn test_poll_without_change_does_nothing() {
    let updater = RecordingUpdater::new(1, false);
    let (coordinator, mock) = coordinator(updater).await;

    let actions = coordinator.poll(false).await.unwrap();

    assert!(actions.is_empty());
    assert!(mock.published().await.is_empty());
}

#[tokio::test]
async fn test_in_progress_job_confirmed_when_version_matches() {
    let updater = RecordingUpdater::new(5, false);
    let (coordinator, mock) = coordinator(Arc::clone(&updater)).await;
    script_listing(&mock, &["fw5"], &[]).await;
    script_job(&mock, "fw5", "IN_PROGRESS", json!({"operation": "fota", "version": 5})).await;

    let actions = coordinator.poll(true).await.unwrap();

    assert_eq!(
        actions,
        vec![FotaAction::Confirmed {
            job_id: id("fw5"),
            version: 5
        }]
    );
    let updates = mock.published_on(&format!("{ROOT}/fw5/update")).await;
    assert_eq!(updates[0]["status"], "SUCCEEDED");
    assert_eq!(updates[0]["expectedVersion"], 2);
    assert!(updater.started.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_in_progress_job_failed_when_version_differs() {
    let updater = RecordingUpdater::new(4, false);
    let (coordinator, mock) = coordinator(updater).await;
    script_listing(&mock, &["fw5"], &[]).await;
    script_job(&mock, "fw5", "IN_PROGRESS", json!({"operation": "fota", "version": 5})).await;

    let actions = coordinator.poll(true).await.unwrap();

    assert!(matches!(&actions[..], [FotaAction::Failed { .. }]));
    let updates = mock.published_on(&format!("{ROOT}/fw5/update")).await;
    assert_eq!(updates[0]["status"], "FAILED");
    assert!(updates[0]["statusDetails"]["reason"].is_string());
}

#[tokio::test]
async fn test_first_queued_fota_job_is_started() {
    let updater = RecordingUpdater::new(1, false);
    let (coordinator, mock) = coordinator(Arc::clone(&updater)).await;
    script_listing(&mock, &[], &["reboot", "fw2", "fw3"]).await;
    script_job(&mock, "reboot", "QUEUED", json!({"operation": "reboot"})).await;
    script_job(&mock, "fw2", "QUEUED", json!({"operation": "fota", "version": 2})).await;
    script_job(&mock, "fw3", "QUEUED", json!({"operation": "fota", "version": 3})).await;

    let actions = coordinator.poll(true).await.unwrap();

    assert_eq!(
        actions,
        vec![FotaAction::Started {
            job_id: id("fw2"),
            version: 2
        }]
    );
    assert_eq!(*updater.started.lock().unwrap(), vec![2]);
    assert!(mock.published_on(&format!("{ROOT}/reboot/update")).await.is_empty());
    assert!(mock.published_on(&format!("{ROOT}/fw3/get")).await.is_empty());
}

#[tokio::test]
async fn test_updater_failure_marks_job_failed() {
    let updater = RecordingUpdater::new(1, true);
    let (coordinator, mock) = coordinator(updater).await;
    script_listing(&mock, &[], &["fw2"]).await;
    script_job(&mock, "fw2", "QUEUED", json!({"operation": "fota", "version": 2})).await;

    let actions = coordinator.poll(true).await.unwrap();

    assert!(matches!(&actions[..], [FotaAction::Failed { reason, .. }] if reason.contains("flash error")));
    let statuses: Vec<Value> = mock
        .published_on(&format!("{ROOT}/fw2/update"))
        .await
        .into_iter()
        .map(|body| body["status"].clone())
        .collect();
    assert_eq!(statuses, vec![json!("IN_PROGRESS"), json!("FAILED")]);
}

#[tokio::test]
async fn test_notification_triggers_poll() {
    let updater = RecordingUpdater::new(1, false);
    let (coordinator, mock) = coordinator(updater).await;
    script_listing(&mock, &[], &[]).await;

    mock.deliver(&format!("{ROOT}/notify"), json!({})).await;
    let actions = coordinator.poll(false).await.unwrap();

    assert!(actions.is_empty());
    assert_eq!(mock.published_on(&format!("{ROOT}/get")).await.len(), 1);
}

#[tokio::test]
async fn test_list_failure_is_returned_without_retry() {
    let updater = RecordingUpdater::new(1, false);
    let (coordinator, mock) = coordinator(updater).await;

    let result = coordinator.poll(true).await;

    assert!(result.unwrap_err().is_timeout());
    assert_eq!(mock.published_on(&format!("{ROOT}/get")).await.len(), 1);
}

#[tokio::test]
async fn test_failed_listing_keeps_pending_change() {
    let updater = RecordingUpdater::new(1, false);
    let (coordinator, mock) = coordinator(Arc::clone(&updater)).await;

    mock.deliver(&format!("{ROOT}/notify"), json!({})).await;
    assert!(coordinator.poll(false).await.unwrap_err().is_timeout());

    script_listing(&mock, &[], &["fw2"]).await;
    script_job(&mock, "fw2", "QUEUED", json!({"operation": "fota", "version": 2})).await;
    let actions = coordinator.poll(false).await.unwrap();

    assert_eq!(
        actions,
        vec![FotaAction::Started {
            job_id: id("fw2"),
            version: 2
        }]
    );
    assert_eq!(mock.published_on(&format!("{ROOT}/get")).await.len(), 2);

    // The change was consumed by the successful pass
    assert!(coordinator.poll(false).await.unwrap().is_empty());
    assert_eq!(mock.published_on(&format!("{ROOT}/get")).await.len(), 2);
}

#[tokio::test]
async fn test_forced_poll_failure_does_not_invent_a_change() {
    let updater = RecordingUpdater::new(1, false);
    let (coordinator, mock) = coordinator(updater).await;

    assert!(coordinator.poll(true).await.is_err());
    assert!(coordinator.poll(false).await.unwrap().is_empty());
    assert_eq!(mock.published_on(&format!("{ROOT}/get")).await.len(), 1);
}

#[tokio::test]
async fn test_own_running_update_is_not_judged() {
    let updater = RecordingUpdater::new(1, false);
    let (coordinator, mock) = coordinator(Arc::clone(&updater)).await;
    script_listing(&mock, &[], &["fw2"]).await;
    script_job(&mock, "fw2", "QUEUED", json!({"operation": "fota", "version": 2})).await;
    assert!(matches!(
        &coordinator.poll(true).await.unwrap()[..],
        [FotaAction::Started { .. }]
    ));

    // The service now reports the update as running, with another one queued
    mock.clear_replies().await;
    mock.clear_history().await;
    script_listing(&mock, &["fw2"], &["fw3"]).await;
    script_job(&mock, "fw2", "IN_PROGRESS", json!({"operation": "fota", "version": 2})).await;
    script_job(&mock, "fw3", "QUEUED", json!({"operation": "fota", "version": 3})).await;
    mock.deliver(&format!("{ROOT}/notify"), json!({})).await;

    let actions = coordinator.poll(false).await.unwrap();

    assert!(actions.is_empty());
    assert!(mock.published_on(&format!("{ROOT}/fw2/update")).await.is_empty());
    assert!(mock.published_on(&format!("{ROOT}/fw3/update")).await.is_empty());
    assert_eq!(*updater.started.lock().unwrap(), vec![2]);
}
