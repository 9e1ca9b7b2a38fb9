//! Integration test infrastructure.
#![allow(dead_code)]
//!
//! Provides [`TestRepo`], a self-contained git repository in a temporary
//! directory with helpers for writing job/event/schedule definitions and
//! driving single daemon ticks. Each `TestRepo` is parallel-safe (own temp
//! dir, own context) and cleans up on drop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use gitvan::config::Config;
use gitvan::context::Context;
use gitvan::daemon::{Daemon, TickReport};
use gitvan::git::Git;
use gitvan::model::CommitId;
use gitvan::receipt::{Receipt, ReceiptFilter, ReceiptStore};

/// A disposable repository with one initial commit on `main`.
pub struct TestRepo {
    _dir: TempDir,
    root: PathBuf,
    pub git: Git,
}

impl TestRepo {
    #[must_use]
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let root = dir.path().to_path_buf();
        let git = Git::new(&root);

        git.run(&["init"]).expect("git init");
        git.run(&["config", "user.name", "Test"]).expect("config");
        git.run(&["config", "user.email", "test@localhost"])
            .expect("config");
        git.run(&["config", "commit.gpgsign", "false"]).expect("config");
        git.run(&["checkout", "-B", "main"]).expect("checkout");
        std::fs::write(root.join("README.md"), "# fixture\n").expect("write");
        git.add(&[]).expect("add");
        git.commit("initial").expect("commit");

        Self {
            _dir: dir,
            root,
            git,
        }
    }

    /// A repository with no commits at all.
    #[must_use]
    pub fn empty() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let root = dir.path().to_path_buf();
        let git = Git::new(&root);
        git.run(&["init"]).expect("git init");
        git.run(&["config", "user.name", "Test"]).expect("config");
        git.run(&["config", "user.email", "test@localhost"])
            .expect("config");
        git.run(&["config", "commit.gpgsign", "false"]).expect("config");
        git.run(&["checkout", "-B", "main"]).expect("checkout");
        Self {
            _dir: dir,
            root,
            git,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Commit a file change and return the new HEAD.
    pub fn commit_file(&self, path: &str, content: &str, message: &str) -> CommitId {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(full, content).expect("write");
        self.git.add(&[]).expect("add");
        self.git.commit(message).expect("commit")
    }

    /// An empty commit, for histories where content doesn't matter.
    pub fn commit_empty(&self, message: &str) -> CommitId {
        self.git.commit(message).expect("commit")
    }

    /// Write a definition file without committing it — discovery reads the
    /// working tree.
    pub fn write_def(&self, rel: &str, content: &str) {
        let full = self.root.join(rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(full, content).expect("write");
    }

    pub fn write_job(&self, id: &str, content: &str) {
        self.write_def(&format!("jobs/{id}.toml"), content);
    }

    pub fn write_event(&self, id: &str, content: &str) {
        self.write_def(&format!("events/{id}.toml"), content);
    }

    pub fn write_schedule(&self, id: &str, content: &str) {
        self.write_def(&format!("schedules/{id}.toml"), content);
    }

    /// A context over this repo; the config is read from the working tree.
    #[must_use]
    pub fn ctx(&self) -> Arc<Context> {
        let config = Config::load(&self.root).expect("config");
        Arc::new(Context::new(self.root.clone(), Arc::new(config)))
    }

    /// A context with a pinned clock.
    #[must_use]
    pub fn ctx_at(&self, now: DateTime<Utc>) -> Arc<Context> {
        let config = Config::load(&self.root).expect("config");
        Arc::new(Context::new(self.root.clone(), Arc::new(config)).with_now(now))
    }

    /// Run exactly one daemon tick under the given context.
    pub fn tick(&self, ctx: &Arc<Context>) -> TickReport {
        let (_tx, rx) = crossbeam_channel::bounded::<()>(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let mut daemon = Daemon::new(Arc::clone(ctx), rx, cancel).expect("daemon construction");
        daemon.tick().expect("tick")
    }

    /// All receipts reachable from HEAD under the default results ref.
    #[must_use]
    pub fn receipts(&self) -> Vec<Receipt> {
        let store = ReceiptStore::new(&self.git, gitvan::refs::RESULTS_REF);
        store
            .list(&ReceiptFilter {
                limit: Some(500),
                ..ReceiptFilter::default()
            })
            .expect("list receipts")
            .receipts
    }

    /// Receipts attached to one specific commit.
    #[must_use]
    pub fn receipts_on(&self, commit: &CommitId) -> Vec<Receipt> {
        let store = ReceiptStore::new(&self.git, gitvan::refs::RESULTS_REF);
        store.for_commit(commit).expect("receipts for commit")
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// A job body that answers with `{"built": "<payload.file>"}` — extracts the
/// matched file from the canonical payload JSON with sed.
pub const BUILD_JOB: &str = r#"
[meta]
name = "build"

[run]
shell = 'printf "{\"built\": \"%s\"}" "$(printf %s "$GITVAN_PAYLOAD" | sed -n "s/.*\"file\":\"\([^\"]*\)\".*/\1/p")"'
"#;
