//! The notes-backed receipt ledger: round trips, filters, verification.

mod common;

use std::collections::BTreeMap;

use common::TestRepo;
use gitvan::model::{CommitId, JobId, fingerprint};
use gitvan::receipt::{Receipt, ReceiptFilter, ReceiptStatus, ReceiptStore};
use gitvan::refs;
use serde_json::json;

fn receipt_for(repo: &TestRepo, commit: &CommitId, job: &str, status: ReceiptStatus) -> Receipt {
    let job_id = JobId::new(job).expect("job id");
    let payload = json!({"commit": commit});
    let fp = fingerprint(&job_id, commit, repo.root(), &payload);
    let mut meta = BTreeMap::new();
    meta.insert("payload".to_owned(), payload);
    Receipt {
        id: format!("{fp}-test"),
        job_id: Some(job_id),
        event_id: None,
        status,
        commit: commit.clone(),
        branch: "main".to_owned(),
        worktree: repo.root().to_string_lossy().into_owned(),
        started_at: "2024-01-15T10:30:00Z".to_owned(),
        duration_ms: 5,
        result: Some(json!({"ok": true})),
        error: None,
        artifacts: Vec::new(),
        fingerprint: fp,
        meta,
    }
}

#[test]
fn append_then_reread_yields_the_same_receipt() {
    let repo = TestRepo::new();
    let head = repo.git.head().unwrap();
    let store = ReceiptStore::new(&repo.git, refs::RESULTS_REF);

    let receipt = receipt_for(&repo, &head, "build", ReceiptStatus::Success);
    store.append(&receipt).unwrap();

    let read_back = store.for_commit(&head).unwrap();
    assert_eq!(read_back, vec![receipt]);
}

#[test]
fn multiple_receipts_attach_to_one_commit() {
    let repo = TestRepo::new();
    let head = repo.git.head().unwrap();
    let store = ReceiptStore::new(&repo.git, refs::RESULTS_REF);

    store
        .append(&receipt_for(&repo, &head, "build", ReceiptStatus::Success))
        .unwrap();
    store
        .append(&receipt_for(&repo, &head, "deploy", ReceiptStatus::Error))
        .unwrap();

    assert_eq!(store.for_commit(&head).unwrap().len(), 2);
}

#[test]
fn list_is_newest_commit_first_and_filters() {
    let repo = TestRepo::new();
    let c1 = repo.git.head().unwrap();
    let store = ReceiptStore::new(&repo.git, refs::RESULTS_REF);
    store
        .append(&receipt_for(&repo, &c1, "build", ReceiptStatus::Success))
        .unwrap();

    let c2 = repo.commit_file("later.txt", "x\n", "later");
    store
        .append(&receipt_for(&repo, &c2, "deploy", ReceiptStatus::Error))
        .unwrap();

    let all = store.list(&ReceiptFilter::default()).unwrap();
    assert_eq!(all.receipts.len(), 2);
    assert_eq!(all.receipts[0].commit, c2);
    assert_eq!(all.receipts[1].commit, c1);
    assert_eq!(all.skipped_lines, 0);

    let errors_only = store
        .list(&ReceiptFilter {
            status: Some(ReceiptStatus::Error),
            ..ReceiptFilter::default()
        })
        .unwrap();
    assert_eq!(errors_only.receipts.len(), 1);
    assert_eq!(
        errors_only.receipts[0].job_id.as_ref().map(|j| j.as_str()),
        Some("deploy")
    );

    let by_job = store
        .list(&ReceiptFilter {
            job_id: Some(JobId::new("build").unwrap()),
            ..ReceiptFilter::default()
        })
        .unwrap();
    assert_eq!(by_job.receipts.len(), 1);
}

#[test]
fn get_finds_recent_receipts_by_id() {
    let repo = TestRepo::new();
    let head = repo.git.head().unwrap();
    let store = ReceiptStore::new(&repo.git, refs::RESULTS_REF);
    let receipt = receipt_for(&repo, &head, "build", ReceiptStatus::Success);
    store.append(&receipt).unwrap();

    assert_eq!(store.get(&receipt.id).unwrap(), Some(receipt));
    assert_eq!(store.get("absent-id").unwrap(), None);
}

#[test]
fn truncated_trailing_line_is_skipped_with_a_count() {
    let repo = TestRepo::new();
    let head = repo.git.head().unwrap();
    let store = ReceiptStore::new(&repo.git, refs::RESULTS_REF);

    let receipt = receipt_for(&repo, &head, "build", ReceiptStatus::Success);
    store.append(&receipt).unwrap();
    // a writer died mid-line
    let line = receipt.to_canonical_json().unwrap();
    repo.git
        .note_append(refs::RESULTS_REF, &head, &line[..line.len() / 2])
        .unwrap();

    let page = store.list(&ReceiptFilter::default()).unwrap();
    assert_eq!(page.receipts.len(), 1);
    assert_eq!(page.skipped_lines, 1);
}

#[test]
fn empty_repository_lists_nothing() {
    let repo = TestRepo::empty();
    let store = ReceiptStore::new(&repo.git, refs::RESULTS_REF);
    let page = store.list(&ReceiptFilter::default()).unwrap();
    assert!(page.receipts.is_empty());
}

#[test]
fn verification_round_trips_through_the_ledger() {
    let repo = TestRepo::new();
    let head = repo.git.head().unwrap();
    let store = ReceiptStore::new(&repo.git, refs::RESULTS_REF);
    store
        .append(&receipt_for(&repo, &head, "build", ReceiptStatus::Success))
        .unwrap();

    let read_back = &store.for_commit(&head).unwrap()[0];
    let verdict = read_back.verify();
    assert!(verdict.valid, "{:?}", verdict.reason);
}

#[test]
fn stats_count_by_status() {
    let repo = TestRepo::new();
    let head = repo.git.head().unwrap();
    let store = ReceiptStore::new(&repo.git, refs::RESULTS_REF);
    store
        .append(&receipt_for(&repo, &head, "a", ReceiptStatus::Success))
        .unwrap();
    store
        .append(&receipt_for(&repo, &head, "b", ReceiptStatus::Success))
        .unwrap();
    store
        .append(&receipt_for(&repo, &head, "c", ReceiptStatus::Error))
        .unwrap();
    store
        .append(&receipt_for(&repo, &head, "d", ReceiptStatus::Skipped))
        .unwrap();

    let stats = store.stats(&ReceiptFilter::default()).unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.success, 2);
    assert_eq!(stats.error, 1);
    assert_eq!(stats.skipped, 1);
    let expected = 2.0 / 3.0;
    assert!((stats.success_rate - expected).abs() < 1e-9);
}
