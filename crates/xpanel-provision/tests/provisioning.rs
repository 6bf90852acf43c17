mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{FailingReconciler, harness, harness_with, test_config};
use xpanel_core::Protocol;
use xpanel_provision::{ClientTemplate, JobStatus, ProvisionError};

fn emails(results: &[xpanel_provision::jobs::JobResult]) -> Vec<String> {
    results.iter().map(|r| r.email.clone()).collect()
}

#[tokio::test]
async fn multi_target_numbering_matches_across_inbounds() {
    let h = harness(test_config(100, 0)).await;
    let a = h.storage.add_inbound(Protocol::Vless);
    let b = h.storage.add_inbound(Protocol::Shadowsocks);

    let jobs = h
        .app
        .planner()
        .plan_multi_target(&ClientTemplate::default(), 50, &[a, b])
        .await
        .unwrap();
    assert_eq!(jobs.len(), 2);

    let done_a = h.wait(jobs[0].id).await;
    let done_b = h.wait(jobs[1].id).await;
    assert_eq!(done_a.status, JobStatus::Completed);
    assert_eq!(done_b.status, JobStatus::Completed);

    let emails_a = emails(&done_a.results);
    let emails_b = emails(&done_b.results);
    assert_eq!(emails_a, emails_b);
    assert_eq!(emails_a.iter().collect::<BTreeSet<_>>().len(), 50);
    assert_eq!(emails_a[0], "user_0001");
    assert_eq!(emails_a[49], "user_0050");

    // Both stores agree for every created client
    for inbound in [a, b] {
        let rows = h.rows(inbound).await;
        assert_eq!(rows.len(), 50);
        for row in rows {
            let doc = h.document(inbound, &row.email).await.expect("document");
            assert_eq!(doc["enable"], row.enable);
            assert_eq!(doc["totalGB"], row.total);
            assert_eq!(doc["expiryTime"], row.expiry_time);
        }
    }
    assert!(h.app.auditor().audit(None).await.unwrap().is_clean());
}

#[tokio::test]
async fn chunks_continue_numbering_within_a_target() {
    let h = harness(test_config(100, 0)).await;
    let a = h.storage.add_inbound(Protocol::Trojan);
    let template = ClientTemplate {
        prefix: "vip".into(),
        ..ClientTemplate::default()
    };

    let jobs = h
        .app
        .planner()
        .plan_multi_target(&template, 150, &[a])
        .await
        .unwrap();
    assert_eq!(jobs.len(), 2);

    let first = h.wait(jobs[0].id).await;
    let second = h.wait(jobs[1].id).await;
    assert_eq!(first.results.last().unwrap().email, "vip_0100");
    assert_eq!(second.results.first().unwrap().email, "vip_0101");
    assert_eq!(h.rows(a).await.len(), 150);
}

#[tokio::test]
async fn request_caps() {
    let h = harness(test_config(100, 0)).await;
    let targets: Vec<_> = (0..9).map(|_| h.storage.add_inbound(Protocol::Vmess)).collect();
    let template = ClientTemplate::default();

    let err = h
        .app
        .planner()
        .plan_multi_target(&template, 600, &targets)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::QuotaExceeded { .. }));
    assert!(h.app.jobs().list(None).await.is_empty());

    let eleven: Vec<_> = (0..11).map(|_| h.storage.add_inbound(Protocol::Vmess)).collect();
    let err = h
        .app
        .planner()
        .plan_multi_target(&template, 1, &eleven)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::QuotaExceeded { .. }));

    let jobs = h
        .app
        .planner()
        .plan_multi_target(&template, 500, &targets)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 45);
    for job in &jobs {
        let _ = h.app.jobs().cancel(job.id).await;
    }
}

#[tokio::test]
async fn cancellation_freezes_progress() {
    let h = harness(test_config(10, 100)).await;
    let a = h.storage.add_inbound(Protocol::Vless);
    let job = h
        .app
        .planner()
        .submit_bulk_create(&ClientTemplate::default(), 100, a)
        .await
        .unwrap();

    // Cancel once the job has made progress
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let current = h.app.jobs().get(job.id).await.unwrap();
            if current.progress.completed > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    h.app.jobs().cancel(job.id).await.unwrap();

    let cancelled = h.wait(job.id).await;
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = h.app.jobs().get(job.id).await.unwrap();
    let progress = settled.progress;
    assert!(progress.processed() < progress.total);
    assert!(progress.processed() <= cancelled.progress.processed() + 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let later = h.app.jobs().get(job.id).await.unwrap();
    assert_eq!(later.status, JobStatus::Cancelled);
    assert_eq!(later.progress, progress);
    assert_eq!(h.rows(a).await.len(), progress.completed);
}

#[tokio::test]
async fn cancellation_inside_a_batch_reports_every_created_client() {
    let h = harness(test_config(100, 0)).await;
    let a = h.storage.add_inbound(Protocol::Vless);
    h.storage.slow_inserts(Duration::from_millis(20));
    let job = h
        .app
        .planner()
        .submit_bulk_create(&ClientTemplate::default(), 100, a)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let current = h.app.jobs().get(job.id).await.unwrap();
            if current.progress.completed >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    h.app.jobs().cancel(job.id).await.unwrap();

    // Let an insert that was in flight finish
    tokio::time::sleep(Duration::from_millis(200)).await;
    let done = h.app.jobs().get(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Cancelled);
    assert_eq!(done.progress.current_batch, 1);
    assert!(done.progress.processed() < 100);
    assert_eq!(done.progress.failed, 0);

    let rows = h.rows(a).await;
    assert_eq!(rows.len(), done.progress.completed);
    assert_eq!(done.results.len(), done.progress.completed);
    let reported: BTreeSet<_> = done.results.iter().map(|r| r.email.clone()).collect();
    let stored: BTreeSet<_> = rows.into_iter().map(|r| r.email).collect();
    assert_eq!(reported, stored);
    assert_eq!(h.documents(a).await.len(), done.progress.completed);
    // A cancelled batch is not reconciled
    assert_eq!(h.app.reconciler().calls(), 0);
}

#[tokio::test]
async fn failing_creates_keep_latest_fifty_errors() {
    let h = harness(test_config(100, 0)).await;
    let a = h.storage.add_inbound(Protocol::Trojan);
    h.storage.fail_inserts(true);

    let job = h
        .app
        .planner()
        .submit_bulk_create(&ClientTemplate::default(), 200, a)
        .await
        .unwrap();
    let done = h.wait(job.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress.failed, 200);
    assert_eq!(done.progress.completed, 0);
    assert_eq!(done.errors.len(), 50);
    assert!(done.errors[0].starts_with("user_0151:"));
    assert!(done.errors[49].starts_with("user_0200:"));
    // Nothing changed, nothing to reconcile
    assert_eq!(h.app.reconciler().calls(), 0);
}

#[tokio::test]
async fn reconciles_once_per_batch() {
    let h = harness(test_config(100, 0)).await;
    let a = h.storage.add_inbound(Protocol::Vless);

    let job = h
        .app
        .planner()
        .submit_bulk_create(&ClientTemplate::default(), 250, a)
        .await
        .unwrap();
    let done = h.wait(job.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress.completed, 250);
    assert_eq!(done.progress.total_batches, 3);
    assert_eq!(h.app.reconciler().calls(), 3);
}

#[tokio::test]
async fn reconcile_failure_is_recorded_and_job_continues() {
    let h = harness_with(test_config(100, 0), Arc::new(FailingReconciler)).await;
    let a = h.storage.add_inbound(Protocol::Vmess);

    let job = h
        .app
        .planner()
        .submit_bulk_create(&ClientTemplate::default(), 150, a)
        .await
        .unwrap();
    let done = h.wait(job.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress.completed, 150);
    assert_eq!(
        done.errors
            .iter()
            .filter(|e| e.starts_with("reconciliation after batch"))
            .count(),
        2
    );
    assert!(done.errors[0].starts_with("reconciliation after batch 1 failed:"));
    assert_eq!(h.rows(a).await.len(), 150);
}

#[tokio::test]
async fn unknown_target_rejects_whole_request() {
    let h = harness(test_config(100, 0)).await;
    let a = h.storage.add_inbound(Protocol::Vless);
    let err = h
        .app
        .planner()
        .plan_multi_target(&ClientTemplate::default(), 10, &[a, 999])
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::TargetNotFound(999)));
    assert!(h.app.jobs().list(None).await.is_empty());
    assert!(h.rows(a).await.is_empty());
}
