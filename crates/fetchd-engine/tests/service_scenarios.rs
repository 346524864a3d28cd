//! End-to-end scenarios against the assembled service with a scripted
//! downloader. No network, no real downloader binary.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{RecordingSink, Script, ScriptedDriver, wait_until};

use fetchd_core::config::ServiceConfig;
use fetchd_core::error::ServiceError;
use fetchd_core::events::EventKind;
use fetchd_core::job::{JobId, JobStatus};
use fetchd_core::listing::RemoteEntry;
use fetchd_core::options::DownloadOptions;
use fetchd_core::batch::BatchStatus;
use fetchd_engine::Service;

const HOOK: &str = "https://hooks.example/notify";

fn test_config(storage: &std::path::Path) -> ServiceConfig {
    ServiceConfig {
        storage_root: storage.to_path_buf(),
        public_base_url: "https://media.example.com".to_string(),
        worker_count: 2,
        max_concurrent_downloads: 3,
        file_retention_hours: 0.0,
        ..ServiceConfig::default()
    }
}

fn options_with_hook() -> DownloadOptions {
    DownloadOptions {
        webhook_url: Some(HOOK.to_string()),
        ..DownloadOptions::default()
    }
}

struct Harness {
    _storage: tempfile::TempDir,
    driver: Arc<ScriptedDriver>,
    sink: Arc<RecordingSink>,
    service: Service,
}

fn harness(mutate: impl FnOnce(&mut ServiceConfig)) -> Harness {
    let storage = tempfile::tempdir().unwrap();
    let mut config = test_config(storage.path());
    mutate(&mut config);

    let driver = ScriptedDriver::new();
    let sink = RecordingSink::new();
    let service = Service::new(config, driver.clone(), sink.clone()).unwrap();
    Harness {
        _storage: storage,
        driver,
        sink,
        service,
    }
}

async fn wait_terminal(service: &Service, id: &JobId, timeout: Duration) -> JobStatus {
    assert!(
        wait_until(timeout, || {
            service.job(id).map(|r| r.status.is_terminal()).unwrap_or(false)
        })
        .await,
        "job {id} did not reach a terminal state in {timeout:?}"
    );
    service.job(id).unwrap().status
}

async fn wait_batch_terminal(
    service: &Service,
    batch_id: &fetchd_core::batch::BatchId,
    timeout: Duration,
) {
    assert!(
        wait_until(timeout, || {
            service
                .batch(batch_id)
                .map(|(record, _)| record.is_terminal())
                .unwrap_or(false)
        })
        .await,
        "batch {batch_id} did not finish in {timeout:?}"
    );
}

#[tokio::test]
async fn single_url_success_end_to_end() {
    let h = harness(|config| {
        config.worker_count = 1;
        config.max_concurrent_downloads = 1;
        // ~150ms retention, scaled down from the production hours.
        config.file_retention_hours = 0.15 / 3600.0;
    });

    let size = 1_048_576u64;
    h.driver.script("https://ex/v.mp4", Script::quick_success(size));

    let options = DownloadOptions {
        timeout_secs: Some(60),
        ..options_with_hook()
    };
    let job_id = h.service.submit("https://ex/v.mp4", options).unwrap();

    let status = wait_terminal(&h.service, &job_id, Duration::from_secs(5)).await;
    assert_eq!(status, JobStatus::Completed);

    let record = h.service.job(&job_id).unwrap();
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());
    assert!(record.started_at.unwrap() <= record.completed_at.unwrap());
    assert_eq!(record.progress.downloaded_bytes, size);
    assert!((record.progress.percent - 100.0).abs() < f64::EPSILON);

    let artifact = record.artifact.expect("completed job has an artifact");
    assert!(artifact.path.starts_with(h.service.files().root()));
    assert!(artifact.path.exists(), "artifact present before retention");
    assert_eq!(artifact.size_bytes, size);
    assert!(
        artifact.public_url.as_deref().unwrap().starts_with("https://media.example.com/files/"),
        "public URL mapped: {:?}",
        artifact.public_url
    );

    // Webhook stream: started, some progress, completed - in that order.
    let events = h.sink.events_for(job_id.as_str());
    assert_eq!(events.first().map(|e| e.kind), Some(EventKind::Started));
    assert_eq!(events.last().map(|e| e.kind), Some(EventKind::Completed));
    assert!(events.iter().any(|e| e.kind == EventKind::Progress));

    // Retention: gone shortly after the deadline.
    assert!(
        wait_until(Duration::from_secs(2), || !artifact.path.exists()).await,
        "artifact should be deleted after retention"
    );
}

#[tokio::test]
async fn batch_continues_past_failures_when_not_stopping() {
    let h = harness(|_| {});

    h.driver.script("https://ex/1", Script::quick_success(512));
    h.driver.script(
        "https://ex/2",
        Script::Fail {
            after: Duration::from_millis(50),
            error: ServiceError::download("scripted failure"),
        },
    );
    h.driver.script("https://ex/3", Script::quick_success(512));

    let (batch_id, child_ids) = h
        .service
        .submit_batch(
            vec![
                "https://ex/1".to_string(),
                "https://ex/2".to_string(),
                "https://ex/3".to_string(),
            ],
            DownloadOptions::default(),
            2,
            false,
        )
        .unwrap();
    assert_eq!(child_ids.len(), 3);

    wait_batch_terminal(&h.service, &batch_id, Duration::from_secs(5)).await;

    let (record, children) = h.service.batch(&batch_id).unwrap();
    let statuses: Vec<JobStatus> = children.iter().map(|c| c.status).collect();
    assert_eq!(
        statuses,
        [JobStatus::Completed, JobStatus::Failed, JobStatus::Completed]
    );

    // Continue-on-error: the batch completes and reports the counts.
    assert_eq!(record.status, BatchStatus::Completed);
    assert_eq!(record.summary.completed, 2);
    assert_eq!(record.summary.failed, 1);
    assert_eq!(record.message.as_deref(), Some("2 succeeded, 1 failed, 0 cancelled"));

    // The per-batch cap held.
    assert!(
        h.driver.max_concurrent_seen() <= 2,
        "batch ran {} children at once",
        h.driver.max_concurrent_seen()
    );
}

#[tokio::test]
async fn batch_stop_on_error_cancels_waiting_children() {
    let h = harness(|_| {});

    // Child 1 holds its permit long enough for child 2 to fail first.
    h.driver.script(
        "https://ex/slow-ok",
        Script::Sleep {
            duration: Duration::from_millis(400),
        },
    );
    h.driver.script(
        "https://ex/bad",
        Script::Fail {
            after: Duration::from_millis(80),
            error: ServiceError::download("mid-run failure"),
        },
    );
    h.driver.script("https://ex/never", Script::quick_success(256));

    let (batch_id, child_ids) = h
        .service
        .submit_batch(
            vec![
                "https://ex/slow-ok".to_string(),
                "https://ex/bad".to_string(),
                "https://ex/never".to_string(),
            ],
            DownloadOptions::default(),
            2,
            true,
        )
        .unwrap();

    wait_batch_terminal(&h.service, &batch_id, Duration::from_secs(5)).await;

    let (record, children) = h.service.batch(&batch_id).unwrap();
    assert_eq!(record.status, BatchStatus::Failed);

    // The third child never ran: cancelled straight from queued.
    let third = &children[2];
    assert_eq!(third.id, child_ids[2]);
    assert_eq!(third.status, JobStatus::Cancelled);
    assert!(third.started_at.is_none(), "child 3 must never reach running");

    // The running child kept its result.
    assert_eq!(children[0].status, JobStatus::Completed);
    assert_eq!(children[1].status, JobStatus::Failed);
}

#[tokio::test]
async fn cancel_in_flight_job() {
    let h = harness(|_| {});
    h.driver.script(
        "https://ex/long",
        Script::Sleep {
            duration: Duration::from_secs(10),
        },
    );

    let job_id = h
        .service
        .submit("https://ex/long", options_with_hook())
        .unwrap();

    // Let it reach running.
    assert!(
        wait_until(Duration::from_secs(2), || {
            h.service.job(&job_id).map(|r| r.status == JobStatus::Running).unwrap_or(false)
        })
        .await
    );

    let status = h.service.cancel_job(&job_id).await.unwrap();
    assert!(matches!(status, JobStatus::Running | JobStatus::Cancelled));

    let final_status = wait_terminal(&h.service, &job_id, Duration::from_secs(3)).await;
    assert_eq!(final_status, JobStatus::Cancelled);

    let record = h.service.job(&job_id).unwrap();
    assert!(record.artifact.is_none(), "no artifact for a cancelled job");
    assert_eq!(record.failure.unwrap().kind, "cancelled");

    // Terminal webhook policy: a failed event carrying kind "cancelled",
    // never a completed event.
    let events = h.sink.events_for(job_id.as_str());
    assert!(events.iter().all(|e| e.kind != EventKind::Completed));
    let terminal: Vec<_> = events.iter().filter(|e| e.kind == EventKind::Failed).collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].error_kind.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn cancel_queued_job_never_runs() {
    let h = harness(|config| {
        config.worker_count = 1;
        config.max_concurrent_downloads = 1;
    });
    h.driver.script(
        "https://ex/hog",
        Script::Sleep {
            duration: Duration::from_millis(600),
        },
    );
    h.driver.script("https://ex/parked", Script::quick_success(64));

    let hog = h.service.submit("https://ex/hog", DownloadOptions::default()).unwrap();
    let parked = h
        .service
        .submit("https://ex/parked", DownloadOptions::default())
        .unwrap();

    // Cancel the parked job while the hog occupies the only slot.
    let status = h.service.cancel_job(&parked).await.unwrap();
    assert_eq!(status, JobStatus::Cancelled);
    let record = h.service.job(&parked).unwrap();
    assert!(record.started_at.is_none());

    // The hog is unaffected.
    let hog_status = wait_terminal(&h.service, &hog, Duration::from_secs(3)).await;
    assert_eq!(hog_status, JobStatus::Completed);
}

#[tokio::test]
async fn queue_rejects_submissions_over_capacity() {
    let h = harness(|config| {
        config.worker_count = 1;
        config.max_concurrent_downloads = 1; // capacity = 2
    });
    for i in 0..3 {
        h.driver.script(
            &format!("https://ex/slot{i}"),
            Script::Sleep {
                duration: Duration::from_secs(5),
            },
        );
    }

    let first = h
        .service
        .submit("https://ex/slot0", DownloadOptions::default())
        .unwrap();
    let _second = h
        .service
        .submit("https://ex/slot1", DownloadOptions::default())
        .unwrap();

    let err = h
        .service
        .submit("https://ex/slot2", DownloadOptions::default())
        .unwrap_err();
    assert!(matches!(err, ServiceError::QueueFull { .. }));
    assert_eq!(err.status_class(), 503);

    // The rejected submission left no record behind.
    let stats = h.service.stats();
    assert_eq!(stats.jobs.total(), 2);

    h.service.cancel_job(&first).await.unwrap();
}

#[tokio::test]
async fn global_concurrency_cap_holds() {
    let h = harness(|config| {
        config.worker_count = 4;
        config.max_concurrent_downloads = 2; // capacity = 4
    });
    for i in 0..4 {
        h.driver.script(
            &format!("https://ex/c{i}"),
            Script::Sleep {
                duration: Duration::from_millis(200),
            },
        );
    }

    let ids: Vec<JobId> = (0..4)
        .map(|i| {
            h.service
                .submit(format!("https://ex/c{i}"), DownloadOptions::default())
                .unwrap()
        })
        .collect();

    for id in &ids {
        let status = wait_terminal(&h.service, id, Duration::from_secs(5)).await;
        assert_eq!(status, JobStatus::Completed);
    }
    assert!(
        h.driver.max_concurrent_seen() <= 2,
        "ran {} downloads at once",
        h.driver.max_concurrent_seen()
    );
}

#[tokio::test]
async fn traversal_is_rejected_at_the_storage_boundary() {
    let h = harness(|_| {});
    let err = h
        .service
        .files()
        .validate_path("../../../etc/passwd")
        .unwrap_err();
    assert!(matches!(err, ServiceError::StorageError { .. }));
}

#[tokio::test]
async fn playlist_expansion_submits_selected_children() {
    let h = harness(|_| {});
    h.driver.set_listing(vec![
        RemoteEntry {
            title: Some("first".into()),
            url: "https://ex/p1".into(),
            ..RemoteEntry::default()
        },
        RemoteEntry {
            title: Some("second".into()),
            url: "https://ex/p2".into(),
            ..RemoteEntry::default()
        },
        RemoteEntry {
            title: Some("third".into()),
            url: "https://ex/p3".into(),
            ..RemoteEntry::default()
        },
    ]);
    h.driver.script("https://ex/p1", Script::quick_success(128));
    h.driver.script("https://ex/p2", Script::quick_success(128));

    let selection = fetchd_core::listing::PlaylistSelection::parse("1-2", false).unwrap();
    let (batch_id, child_ids) = h
        .service
        .submit_playlist(
            "https://ex/playlist",
            Some(&selection),
            DownloadOptions::default(),
            2,
            false,
        )
        .await
        .unwrap();
    assert_eq!(child_ids.len(), 2);

    wait_batch_terminal(&h.service, &batch_id, Duration::from_secs(5)).await;
    let (record, children) = h.service.batch(&batch_id).unwrap();
    assert_eq!(record.status, BatchStatus::Completed);
    assert_eq!(children[0].url, "https://ex/p1");
    assert_eq!(children[1].url, "https://ex/p2");
    assert_eq!(
        children[1].origin.as_ref().and_then(|o| o.playlist_index),
        Some(2)
    );
}

#[tokio::test]
async fn cancel_batch_cascades() {
    let h = harness(|_| {});
    for i in 0..3 {
        h.driver.script(
            &format!("https://ex/b{i}"),
            Script::Sleep {
                duration: Duration::from_secs(10),
            },
        );
    }

    let (batch_id, _children) = h
        .service
        .submit_batch(
            (0..3).map(|i| format!("https://ex/b{i}")).collect(),
            DownloadOptions::default(),
            2,
            false,
        )
        .unwrap();

    // Let the first children start.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let cancelled = h.service.cancel_batch(&batch_id).await.unwrap();
    assert!(cancelled >= 2, "cancelled only {cancelled} children");

    wait_batch_terminal(&h.service, &batch_id, Duration::from_secs(5)).await;
    let (record, children) = h.service.batch(&batch_id).unwrap();
    assert_eq!(record.status, BatchStatus::Failed);
    assert!(children.iter().all(|c| c.status == JobStatus::Cancelled));
}

#[tokio::test]
async fn shutdown_cancels_active_work() {
    let h = harness(|_| {});
    h.driver.script(
        "https://ex/lingering",
        Script::Sleep {
            duration: Duration::from_secs(30),
        },
    );

    let job_id = h
        .service
        .submit("https://ex/lingering", DownloadOptions::default())
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            h.service.job(&job_id).map(|r| r.status == JobStatus::Running).unwrap_or(false)
        })
        .await
    );

    h.service.shutdown(false).await;

    let status = wait_terminal(&h.service, &job_id, Duration::from_secs(3)).await;
    assert_eq!(status, JobStatus::Cancelled);

    // New submissions are refused after shutdown.
    let err = h
        .service
        .submit("https://ex/late", DownloadOptions::default())
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict { .. }));
}

#[tokio::test]
async fn batch_validation_rejects_bad_shapes() {
    let h = harness(|config| {
        config.max_batch_size = 3;
    });

    // Empty after dedup.
    let err = h
        .service
        .submit_batch(vec![], DownloadOptions::default(), 2, false)
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationFailed { .. }));

    // Oversized.
    let urls: Vec<String> = (0..5).map(|i| format!("https://ex/{i}")).collect();
    assert!(h
        .service
        .submit_batch(urls, DownloadOptions::default(), 2, false)
        .is_err());

    // Concurrency out of range.
    assert!(h
        .service
        .submit_batch(
            vec!["https://ex/a".to_string()],
            DownloadOptions::default(),
            0,
            false
        )
        .is_err());

    // Duplicates collapse to one child.
    let (_batch, children) = h
        .service
        .submit_batch(
            vec!["https://ex/dup".to_string(), "https://ex/dup".to_string()],
            DownloadOptions::default(),
            1,
            false,
        )
        .unwrap();
    assert_eq!(children.len(), 1);
}
