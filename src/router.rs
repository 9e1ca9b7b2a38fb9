//! The event router: turns new commits into deduplicated invocations.
//!
//! Per worktree and per tick:
//!
//! 1. `rev-list` the commits since the watermark (bounded by the lookback
//!    window when there is no watermark yet).
//! 2. Gather each commit's metadata once, ancestor-first.
//! 3. Evaluate every non-cron event definition in discovery order.
//! 4. For each match, build the payload (derived fields, then the event's
//!    template with string leaves interpolated), fingerprint it, and drop
//!    anything already receipted or already planned this tick.
//!
//! Ordering: within a worktree, invocations come out in commit-ancestor
//! order; within one commit, in event discovery order. Across worktrees
//! nothing is promised.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::events::EventDef;
use crate::git::{Git, GitError};
use crate::model::{CommitId, CommitMeta, Invocation, Worktree};
use crate::receipt::{ReceiptError, ReceiptStore};

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// One planned invocation plus the index of the event that produced it
/// (into the router's definition slice).
#[derive(Clone, Debug)]
pub struct PlannedInvocation {
    pub invocation: Invocation,
    pub event_index: usize,
}

/// Everything one routing pass produced for one worktree.
#[derive(Clone, Debug)]
pub struct TickPlan {
    pub invocations: Vec<PlannedInvocation>,
    /// The head the watermark should advance to once the plan completes.
    pub head: CommitId,
    pub commits_seen: usize,
    /// Whether the per-tick cap cut the plan short.
    pub capped: bool,
    /// Invocations dropped because their fingerprint was already receipted
    /// or already planned.
    pub deduped: usize,
    /// Events skipped because their payload template failed to render.
    pub template_errors: usize,
}

/// Errors from the router.
#[derive(Debug)]
pub enum RouterError {
    Git(GitError),
    Receipt(ReceiptError),
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Git(e) => write!(f, "routing failed on git: {e}"),
            Self::Receipt(e) => write!(f, "routing failed on the receipt ledger: {e}"),
        }
    }
}

impl std::error::Error for RouterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Git(e) => Some(e),
            Self::Receipt(e) => Some(e),
        }
    }
}

impl From<GitError> for RouterError {
    fn from(e: GitError) -> Self {
        Self::Git(e)
    }
}

impl From<ReceiptError> for RouterError {
    fn from(e: ReceiptError) -> Self {
        Self::Receipt(e)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Stateless routing over one worktree's git handle. Watermarks live with
/// the daemon; the router only reads them.
pub struct Router<'a> {
    git: &'a Git,
    store: &'a ReceiptStore<'a>,
    events: &'a [EventDef],
    max_per_tick: usize,
    env: minijinja::Environment<'static>,
}

impl<'a> Router<'a> {
    #[must_use]
    pub fn new(
        git: &'a Git,
        store: &'a ReceiptStore<'a>,
        events: &'a [EventDef],
        max_per_tick: usize,
    ) -> Self {
        Self {
            git,
            store,
            events,
            max_per_tick,
            env: minijinja::Environment::new(),
        }
    }

    /// Route all commits between the watermark and the worktree's HEAD.
    ///
    /// # Errors
    /// Git and ledger failures; individual event template failures are
    /// counted, not raised.
    pub fn plan(
        &self,
        worktree: &Worktree,
        watermark: Option<&CommitId>,
        lookback_floor: Option<DateTime<Utc>>,
    ) -> Result<TickPlan, RouterError> {
        let mut plan = TickPlan {
            invocations: Vec::new(),
            head: worktree.head.clone(),
            commits_seen: 0,
            capped: false,
            deduped: 0,
            template_errors: 0,
        };

        if watermark == Some(&worktree.head) {
            return Ok(plan);
        }

        let mut commits = self
            .git
            .rev_list(watermark, &worktree.head, lookback_floor)?;
        commits.reverse(); // ancestor-first
        plan.commits_seen = commits.len();

        let mut planned: HashSet<String> = HashSet::new();

        'commits: for commit in &commits {
            let meta = self.git.commit_meta(commit)?;
            let receipted = self.store.fingerprints_for(commit)?;

            for (event_index, event) in self.events.iter().enumerate() {
                if event.predicate.cron().is_some() {
                    continue; // the scheduler owns cron events
                }
                if !event.predicate.evaluate(&meta, worktree) {
                    continue;
                }
                let payload = match self.build_payload(event, &meta, worktree) {
                    Ok(payload) => payload,
                    Err(detail) => {
                        warn!(target: "gitvan::router", event = %event.id, %detail,
                            "payload template failed; event skipped for this commit");
                        plan.template_errors += 1;
                        continue;
                    }
                };
                let Ok(job_id) = event.target_job_id() else {
                    plan.template_errors += 1;
                    continue;
                };
                let invocation = Invocation::new(
                    Some(event.id.clone()),
                    job_id,
                    commit.clone(),
                    &worktree.path,
                    payload,
                );
                if receipted.contains(&invocation.fingerprint)
                    || !planned.insert(invocation.fingerprint.clone())
                {
                    plan.deduped += 1;
                    continue;
                }
                debug!(target: "gitvan::router", event = %event.id, commit = %commit.abbrev(),
                    fingerprint = %invocation.fingerprint, "planned invocation");
                plan.invocations.push(PlannedInvocation {
                    invocation,
                    event_index,
                });
                if plan.invocations.len() >= self.max_per_tick {
                    plan.capped = true;
                    break 'commits;
                }
            }
        }

        Ok(plan)
    }

    /// Assemble an invocation payload: `{commit, branch}` base, the
    /// predicate's derived fields, then the event's template (string leaves
    /// rendered) merged on top.
    fn build_payload(
        &self,
        event: &EventDef,
        meta: &CommitMeta,
        worktree: &Worktree,
    ) -> Result<Value, String> {
        let mut payload = json!({
            "commit": meta.id,
            "branch": worktree.branch_or_detached(),
        });
        merge_into(&mut payload, &event.predicate.payload_seed(meta));

        if let Some(template) = &event.payload_template {
            let ctx = json!({
                "commit": {
                    "id": meta.id,
                    "parents": meta.parents,
                    "author": meta.author,
                    "committer": meta.committer,
                    "message": meta.message,
                    "branches": meta.branches,
                    "tags": meta.tags,
                    "changed_paths": meta.changed_paths,
                },
                "worktree": {
                    "path": worktree.path_str(),
                    "branch": worktree.branch_or_detached(),
                },
                "event": { "id": event.id },
            });
            let rendered = self.render_value(template, &ctx)?;
            merge_into(&mut payload, &rendered);
        }
        Ok(payload)
    }

    /// Render every string leaf of a template tree that contains template
    /// syntax; everything else passes through untouched.
    fn render_value(&self, template: &Value, ctx: &Value) -> Result<Value, String> {
        match template {
            Value::String(s) if s.contains("{{") || s.contains("{%") => {
                let rendered = self
                    .env
                    .render_str(s, minijinja::Value::from_serialize(ctx))
                    .map_err(|e| e.to_string())?;
                Ok(Value::String(rendered))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_value(v, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.render_value(v, ctx)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

/// Deep-merge `overlay` into `base`; overlay wins on conflicts, objects
/// merge recursively.
fn merge_into(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(k) {
                    Some(slot) => merge_into(slot, v),
                    None => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (slot, v) => *slot = v.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDef;
    use crate::model::EventId;
    use crate::refs;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn repo() -> (TempDir, Git) {
        let dir = TempDir::new().unwrap();
        let git = Git::new(dir.path());
        git.run(&["init"]).unwrap();
        git.run(&["config", "user.name", "Test"]).unwrap();
        git.run(&["config", "user.email", "test@localhost"]).unwrap();
        git.run(&["config", "commit.gpgsign", "false"]).unwrap();
        git.run(&["checkout", "-B", "main"]).unwrap();
        (dir, git)
    }

    fn commit(git: &Git, message: &str, files: &[(&str, &str)]) -> CommitId {
        for (path, content) in files {
            let full = git.workdir().join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(full, content).unwrap();
        }
        git.run(&["add", "-A"]).unwrap();
        git.run(&["commit", "--allow-empty", "-m", message]).unwrap();
        git.head().unwrap()
    }

    fn worktree_of(git: &Git) -> Worktree {
        Worktree {
            path: git.workdir().to_path_buf(),
            head: git.head().unwrap(),
            branch: Some("main".to_owned()),
            is_main: true,
        }
    }

    fn event(id: &str, text: &str) -> EventDef {
        EventDef::parse(EventId::new(id).unwrap(), Path::new("/repo/events/x.toml"), text).unwrap()
    }

    #[test]
    fn path_event_produces_one_invocation() {
        let (_dir, git) = repo();
        commit(&git, "initial", &[("README.md", "#")]);
        commit(&git, "touch source", &[("src/a.js", "x")]);
        let store = ReceiptStore::new(&git, refs::RESULTS_REF);
        let events = vec![event("path/src", "type = \"path\"\npattern = \"src/**\"\njob = \"build\"")];
        let router = Router::new(&git, &store, &events, 50);

        let plan = router.plan(&worktree_of(&git), None, None).unwrap();
        assert_eq!(plan.invocations.len(), 1);
        let inv = &plan.invocations[0].invocation;
        assert_eq!(inv.job_id.as_str(), "build");
        assert_eq!(inv.payload["file"], "src/a.js");
        assert_eq!(inv.payload["branch"], "main");
        assert_eq!(inv.fingerprint.len(), 16);
    }

    #[test]
    fn invocations_come_out_ancestor_first() {
        let (_dir, git) = repo();
        let c1 = commit(&git, "one", &[("src/a.js", "1")]);
        let c2 = commit(&git, "two", &[("src/b.js", "2")]);
        let store = ReceiptStore::new(&git, refs::RESULTS_REF);
        let events = vec![event("e", "type = \"path\"\npattern = \"src/**\"\njob = \"build\"")];
        let router = Router::new(&git, &store, &events, 50);

        let plan = router.plan(&worktree_of(&git), None, None).unwrap();
        let commits: Vec<_> = plan
            .invocations
            .iter()
            .map(|p| p.invocation.commit.clone())
            .collect();
        assert_eq!(commits, vec![c1, c2]);
    }

    #[test]
    fn watermark_at_head_is_a_noop() {
        let (_dir, git) = repo();
        let head = commit(&git, "one", &[("src/a.js", "1")]);
        let store = ReceiptStore::new(&git, refs::RESULTS_REF);
        let events = vec![event("e", "type = \"any\"\njob = \"build\"")];
        let router = Router::new(&git, &store, &events, 50);

        let plan = router.plan(&worktree_of(&git), Some(&head), None).unwrap();
        assert!(plan.invocations.is_empty());
        assert_eq!(plan.commits_seen, 0);
    }

    #[test]
    fn no_events_no_invocations() {
        let (_dir, git) = repo();
        commit(&git, "one", &[("src/a.js", "1")]);
        let store = ReceiptStore::new(&git, refs::RESULTS_REF);
        let router = Router::new(&git, &store, &[], 50);
        let plan = router.plan(&worktree_of(&git), None, None).unwrap();
        assert!(plan.invocations.is_empty());
    }

    #[test]
    fn per_tick_cap_applies() {
        let (_dir, git) = repo();
        for i in 0..5 {
            commit(&git, &format!("c{i}"), &[("src/f.js", &i.to_string())]);
        }
        let store = ReceiptStore::new(&git, refs::RESULTS_REF);
        let events = vec![event("e", "type = \"any\"\njob = \"build\"")];
        let router = Router::new(&git, &store, &events, 3);

        let plan = router.plan(&worktree_of(&git), None, None).unwrap();
        assert_eq!(plan.invocations.len(), 3);
        assert!(plan.capped);
    }

    #[test]
    fn template_is_interpolated() {
        let (_dir, git) = repo();
        let head = commit(&git, "feat: add", &[("src/a.js", "x")]);
        let store = ReceiptStore::new(&git, refs::RESULTS_REF);
        let events = vec![event(
            "e",
            "type = \"any\"\njob = \"build\"\n[payload]\nnote = \"commit {{ commit.id }} on {{ worktree.branch }}\"\nfixed = 7",
        )];
        let router = Router::new(&git, &store, &events, 50);

        let plan = router.plan(&worktree_of(&git), None, None).unwrap();
        let payload = &plan.invocations[0].invocation.payload;
        assert_eq!(payload["note"], format!("commit {head} on main"));
        assert_eq!(payload["fixed"], 7);
    }

    #[test]
    fn merge_into_is_deep_and_overlay_wins() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "keep": true});
        merge_into(&mut base, &json!({"a": {"y": 9, "z": 3}}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 9, "z": 3}, "keep": true}));
    }
}
