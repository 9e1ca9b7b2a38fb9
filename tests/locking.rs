//! Cross-thread mutual exclusion through git refs.
//!
//! These races run real concurrent acquisitions against one repository, the
//! same shape two daemons on a shared repo would produce.

mod common;

use std::sync::Barrier;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use common::TestRepo;
use gitvan::config::Config;
use gitvan::context::Context;
use gitvan::jobs::JobDef;
use gitvan::lock::LockManager;
use gitvan::model::{Invocation, JobId, Worktree};
use gitvan::receipt::{ReceiptStatus, ReceiptStore};
use gitvan::runner::Runner;
use gitvan::{git::Git, refs};
use serde_json::json;

#[test]
fn concurrent_acquisitions_have_a_single_winner() {
    let repo = TestRepo::new();
    let workers = 8;
    let barrier = Barrier::new(workers);
    let wins = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                let git = Git::new(repo.root());
                let locks = LockManager::new(&git, refs::LOCK_PREFIX, 30_000);
                barrier.wait();
                if locks
                    .acquire("contended", repo.root(), Utc::now())
                    .expect("acquire must not error on a lost race")
                    .is_some()
                {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(wins.load(Ordering::SeqCst), 1);
}

#[test]
fn racing_runners_produce_one_success() {
    let repo = TestRepo::new();
    let head = repo.commit_file("src/a.js", "x\n", "change");
    let job = JobDef::parse(
        JobId::new("slow").unwrap(),
        repo.root().join("jobs/slow.toml").as_path(),
        "[run]\nshell = \"sleep 1; echo done\"\n",
    )
    .unwrap();

    let barrier = Barrier::new(2);
    let statuses: Vec<ReceiptStatus> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    let git = Git::new(repo.root());
                    let store = ReceiptStore::new(&git, refs::RESULTS_REF);
                    let locks = LockManager::new(&git, refs::LOCK_PREFIX, 30_000);
                    let runner = Runner::new(&store, &locks);
                    let ctx = Context::new(repo.root(), std::sync::Arc::new(Config::default()));
                    let worktree = Worktree {
                        path: repo.root().to_path_buf(),
                        head: head.clone(),
                        branch: Some("main".to_owned()),
                        is_main: true,
                    };
                    let invocation = Invocation::new(
                        None,
                        JobId::new("slow").unwrap(),
                        head.clone(),
                        repo.root(),
                        json!({}),
                    );
                    barrier.wait();
                    runner
                        .run(&ctx, &worktree, &job, &invocation)
                        .expect("runner must not fail on infrastructure")
                        .status
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("join")).collect()
    });

    let successes = statuses
        .iter()
        .filter(|s| **s == ReceiptStatus::Success)
        .count();
    let skips = statuses
        .iter()
        .filter(|s| **s == ReceiptStatus::Skipped)
        .count();
    assert_eq!(successes, 1, "exactly one racer may run the job");
    assert_eq!(skips, 1, "the loser records a skip");

    // ledger agrees: one success for the fingerprint, at most one skip
    let receipts = repo.receipts_on(&head);
    let ledger_successes = receipts
        .iter()
        .filter(|r| r.status == ReceiptStatus::Success)
        .count();
    assert_eq!(ledger_successes, 1);
    assert!(receipts.len() <= 2);

    // and the loser's skip names its reason
    if let Some(skip) = receipts.iter().find(|r| r.status == ReceiptStatus::Skipped) {
        let reason = skip.meta["reason"].as_str().unwrap_or_default();
        assert!(
            reason == "lock-held" || reason == "duplicate-fingerprint",
            "unexpected skip reason: {reason}"
        );
    }
}

#[test]
fn released_lock_can_be_retaken_by_another_manager() {
    let repo = TestRepo::new();
    let git_a = Git::new(repo.root());
    let git_b = Git::new(repo.root());
    let locks_a = LockManager::new(&git_a, refs::LOCK_PREFIX, 30_000);
    let locks_b = LockManager::new(&git_b, refs::LOCK_PREFIX, 30_000);

    let lock = locks_a
        .acquire("handoff", repo.root(), Utc::now())
        .unwrap()
        .unwrap();
    assert!(locks_b.acquire("handoff", repo.root(), Utc::now()).unwrap().is_none());

    assert!(locks_a.release(&lock).unwrap());
    assert!(locks_b.acquire("handoff", repo.root(), Utc::now()).unwrap().is_some());
}
