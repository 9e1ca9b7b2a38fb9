//! Typed facade over the `git` binary.
//!
//! Single chokepoint for all Git interaction. Every invocation takes an
//! argument vector (never a shell-interpolated string), runs with `TZ=UTC`
//! and `LANG=C` forced into the child environment, and returns trimmed
//! stdout on success.
//!
//! Error classification:
//! - nonzero exit → [`GitError::Command`] with the argv, exit code and stderr
//! - "object not found" shapes → [`GitError::NotFound`]
//! - ref lock contention on `update-ref` → [`GitError::Conflict`]
//! - empty-repository `rev-list`/`log` → empty result, not an error

use std::fmt;
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::context::Context;
use crate::model::{CommitId, CommitMeta, Worktree};
use crate::refs::ZERO_OID;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from the git driver.
#[derive(Debug)]
pub enum GitError {
    /// A git command exited nonzero.
    Command {
        /// The argv that was run (without the leading `git`).
        args: Vec<String>,
        /// Process exit code, if the process exited at all.
        exit_code: Option<i32>,
        /// Stderr output, trimmed.
        stderr: String,
    },
    /// The named object or ref does not exist.
    NotFound {
        /// What was looked up (revspec, ref name, OID).
        what: String,
    },
    /// A ref update lost a race: another writer holds or created the ref.
    Conflict {
        /// The ref that could not be updated.
        ref_name: String,
    },
    /// Git produced output the driver could not parse.
    Parse {
        /// What was being parsed.
        what: String,
        /// The offending output, truncated.
        detail: String,
    },
    /// Git could not be spawned.
    Io(std::io::Error),
}

impl fmt::Display for GitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command {
                args,
                exit_code,
                stderr,
            } => {
                write!(f, "`git {}` failed", args.join(" "))?;
                if let Some(code) = exit_code {
                    write!(f, " (exit code {code})")?;
                }
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            Self::NotFound { what } => write!(f, "git object not found: {what}"),
            Self::Conflict { ref_name } => {
                write!(
                    f,
                    "ref '{ref_name}' was modified concurrently — lost the race, retry or treat as held"
                )
            }
            Self::Parse { what, detail } => {
                write!(f, "failed to parse git output for {what}: {detail}")
            }
            Self::Io(e) => write!(f, "failed to spawn git: {e}"),
        }
    }
}

impl std::error::Error for GitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GitError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl GitError {
    /// Whether this is a lost-race ref conflict (retryable by policy).
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

fn stderr_means_not_found(stderr: &str) -> bool {
    stderr.contains("Not a valid object name")
        || stderr.contains("unknown revision")
        || stderr.contains("bad revision")
        || stderr.contains("ambiguous argument")
        || stderr.contains("Needed a single revision")
        || stderr.contains("does not have any commits yet")
        || stderr.contains("no such ref")
}

fn stderr_means_ref_conflict(stderr: &str) -> bool {
    stderr.contains("cannot lock ref")
        || stderr.contains("reference already exists")
        || stderr.contains("but expected")
        || stderr.contains("Unable to create") && stderr.contains(".lock")
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// A handle on one working directory.
///
/// Cheap to construct; holds no open resources. The daemon builds one per
/// worktree per tick from the ambient context.
#[derive(Clone, Debug)]
pub struct Git {
    workdir: PathBuf,
    env: Vec<(String, String)>,
}

impl Git {
    /// A driver rooted at `workdir` with only the forced determinism env.
    #[must_use]
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            env: vec![
                ("TZ".to_owned(), "UTC".to_owned()),
                ("LANG".to_owned(), "C".to_owned()),
            ],
        }
    }

    /// A driver rooted at the context's `cwd`, inheriting its child
    /// environment (which forces `TZ`/`LANG` last).
    #[must_use]
    pub fn from_context(ctx: &Context) -> Self {
        Self {
            workdir: ctx.cwd.clone(),
            env: ctx.child_env(),
        }
    }

    /// Same environment, different working directory. Used to address an
    /// individual worktree.
    #[must_use]
    pub fn at(&self, workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            env: self.env.clone(),
        }
    }

    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }

    fn raw(&self, args: &[&str]) -> Result<Output, GitError> {
        trace!(target: "gitvan::git", ?args, workdir = %self.workdir.display(), "spawn git");
        Ok(self.command(args).output()?)
    }

    /// Run git, returning trimmed stdout on success.
    ///
    /// # Errors
    /// Classifies nonzero exits into [`GitError`] variants.
    pub fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.raw(args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
        } else {
            Err(self.classify(args, &output))
        }
    }

    /// Run git with bytes piped to stdin, returning trimmed stdout.
    ///
    /// # Errors
    /// Same classification as [`Self::run`].
    pub fn run_with_stdin(&self, args: &[&str], input: &[u8]) -> Result<String, GitError> {
        let mut child = self
            .command(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        {
            let stdin = child.stdin.as_mut().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "failed to open git stdin")
            })?;
            stdin.write_all(input)?;
        } // stdin dropped here, git sees EOF
        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
        } else {
            Err(self.classify(args, &output))
        }
    }

    fn classify(&self, args: &[&str], output: &Output) -> GitError {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if args.first() == Some(&"update-ref") && stderr_means_ref_conflict(&stderr) {
            let ref_name = args
                .iter()
                .find(|a| a.starts_with("refs/"))
                .map_or_else(|| "<unknown>".to_owned(), ToString::to_string);
            return GitError::Conflict { ref_name };
        }
        if stderr_means_not_found(&stderr) {
            return GitError::NotFound {
                what: args.join(" "),
            };
        }
        GitError::Command {
            args: args.iter().map(ToString::to_string).collect(),
            exit_code: output.status.code(),
            stderr,
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// `git version` — cheap availability probe.
    ///
    /// # Errors
    /// [`GitError::Io`] when the binary is missing.
    pub fn version(&self) -> Result<String, GitError> {
        self.run(&["version"])
    }

    /// Absolute path of the repository's top-level directory.
    ///
    /// # Errors
    /// Fails when the working directory is not inside a git repository.
    pub fn repo_root(&self) -> Result<PathBuf, GitError> {
        Ok(PathBuf::from(self.run(&["rev-parse", "--show-toplevel"])?))
    }

    /// Current HEAD commit. Fails with [`GitError::NotFound`] when the
    /// repository has no commits.
    ///
    /// # Errors
    /// See above; plus the usual spawn/command failures.
    pub fn head(&self) -> Result<CommitId, GitError> {
        let out = self.run(&["rev-parse", "HEAD"]).map_err(|e| match e {
            GitError::Command { stderr, .. } if stderr_means_not_found(&stderr) => {
                GitError::NotFound {
                    what: "HEAD".to_owned(),
                }
            }
            other => other,
        })?;
        CommitId::new(&out).map_err(|e| GitError::Parse {
            what: "HEAD".to_owned(),
            detail: e.to_string(),
        })
    }

    /// Current branch name, or the sentinel `"HEAD"` when detached.
    ///
    /// # Errors
    /// Only on spawn failure or repository corruption — a detached HEAD is
    /// not an error.
    pub fn branch(&self) -> Result<String, GitError> {
        match self.run(&["symbolic-ref", "--quiet", "--short", "HEAD"]) {
            Ok(name) if !name.is_empty() => Ok(name),
            // exit 1 with empty stderr is how symbolic-ref reports detached
            Ok(_) | Err(GitError::Command { exit_code: Some(1), .. }) => Ok("HEAD".to_owned()),
            Err(e) => Err(e),
        }
    }

    /// Enumerate worktrees from `git worktree list --porcelain`.
    ///
    /// Bare entries and worktrees with an unborn HEAD are skipped; the first
    /// listed non-bare entry is the main worktree.
    ///
    /// # Errors
    /// Fails when the porcelain output cannot be parsed.
    pub fn list_worktrees(&self) -> Result<Vec<Worktree>, GitError> {
        let out = self.run(&["worktree", "list", "--porcelain"])?;
        let mut result = Vec::new();
        let mut first_non_bare = true;

        for block in out.split("\n\n").filter(|b| !b.trim().is_empty()) {
            let mut path: Option<PathBuf> = None;
            let mut head: Option<String> = None;
            let mut branch: Option<String> = None;
            let mut bare = false;
            for line in block.lines() {
                if let Some(p) = line.strip_prefix("worktree ") {
                    path = Some(PathBuf::from(p));
                } else if let Some(h) = line.strip_prefix("HEAD ") {
                    head = Some(h.to_owned());
                } else if let Some(b) = line.strip_prefix("branch ") {
                    branch = Some(b.strip_prefix("refs/heads/").unwrap_or(b).to_owned());
                } else if line == "bare" {
                    bare = true;
                }
            }
            let Some(path) = path else {
                return Err(GitError::Parse {
                    what: "worktree list".to_owned(),
                    detail: block.chars().take(200).collect(),
                });
            };
            if bare {
                continue;
            }
            // Unborn worktrees have a zero or missing HEAD; nothing can
            // trigger there until the first commit.
            let Some(head) = head.filter(|h| h != ZERO_OID) else {
                first_non_bare = false;
                continue;
            };
            let head = CommitId::new(&head).map_err(|e| GitError::Parse {
                what: format!("worktree HEAD for {}", path.display()),
                detail: e.to_string(),
            })?;
            result.push(Worktree {
                path,
                head,
                branch,
                is_main: first_non_bare,
            });
            first_non_bare = false;
        }
        Ok(result)
    }

    /// Ancestors of `until` not reachable from `since`, newest first.
    ///
    /// With no `since`, the walk is bounded by `floor` (commit date). An
    /// empty repository yields an empty list, not an error.
    ///
    /// # Errors
    /// Fails on anything other than the empty-repository shape.
    pub fn rev_list(
        &self,
        since: Option<&CommitId>,
        until: &CommitId,
        floor: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommitId>, GitError> {
        let range;
        let since_arg;
        let mut args = vec!["rev-list"];
        match since {
            Some(s) => {
                range = format!("{s}..{until}");
                args.push(&range);
            }
            None => {
                range = until.to_string();
                if let Some(t) = floor {
                    since_arg = format!("--since={}", t.to_rfc3339());
                    args.push(&since_arg);
                }
                args.push(&range);
            }
        }
        match self.run(&args) {
            Ok(out) => out
                .lines()
                .filter(|l| !l.is_empty())
                .map(|l| {
                    CommitId::new(l).map_err(|e| GitError::Parse {
                        what: "rev-list".to_owned(),
                        detail: e.to_string(),
                    })
                })
                .collect(),
            Err(GitError::NotFound { .. }) => Ok(Vec::new()),
            Err(GitError::Command { exit_code: Some(128), .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Whether `a` is an ancestor of `b`. Never raises: lookup failures
    /// report `false`.
    #[must_use]
    pub fn is_ancestor(&self, a: &CommitId, b: &CommitId) -> bool {
        self.raw(&["merge-base", "--is-ancestor", a.as_str(), b.as_str()])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Resolve a revspec to a commit, or `None` when it doesn't exist.
    ///
    /// # Errors
    /// Only on spawn failure or unparsable output.
    pub fn rev_parse_opt(&self, spec: &str) -> Result<Option<CommitId>, GitError> {
        let verify = format!("{spec}^{{commit}}");
        match self.run(&["rev-parse", "--verify", "--quiet", &verify]) {
            Ok(out) if out.is_empty() => Ok(None),
            Ok(out) => CommitId::new(&out).map(Some).map_err(|e| GitError::Parse {
                what: spec.to_owned(),
                detail: e.to_string(),
            }),
            Err(GitError::NotFound { .. }) => Ok(None),
            // --quiet makes rev-parse exit 1 with no stderr for missing refs
            Err(GitError::Command { exit_code: Some(1), stderr, .. }) if stderr.is_empty() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Raw `cat-file -p` of an object.
    ///
    /// # Errors
    /// [`GitError::NotFound`] when the object doesn't exist.
    pub fn cat_file_pretty(&self, object: &str) -> Result<String, GitError> {
        self.run(&["cat-file", "-p", object])
    }

    /// Gather one commit's metadata: a single `cat-file -p` parse plus a
    /// `diff-tree --name-only` against the first parent, tags and branches
    /// pointing at it.
    ///
    /// # Errors
    /// Fails when the commit is missing or its object is unparsable.
    pub fn commit_meta(&self, commit: &CommitId) -> Result<CommitMeta, GitError> {
        let raw = self.cat_file_pretty(commit.as_str())?;
        let mut parents = Vec::new();
        let mut author = String::new();
        let mut committer = String::new();
        let mut lines = raw.lines();
        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
            if let Some(p) = line.strip_prefix("parent ") {
                parents.push(CommitId::new(p).map_err(|e| GitError::Parse {
                    what: format!("parent of {commit}"),
                    detail: e.to_string(),
                })?);
            } else if let Some(a) = line.strip_prefix("author ") {
                author = strip_ident_timestamp(a);
            } else if let Some(c) = line.strip_prefix("committer ") {
                committer = strip_ident_timestamp(c);
            }
        }
        let message = lines.collect::<Vec<_>>().join("\n").trim_end().to_owned();

        let changed_paths = self.changed_paths(commit, parents.first())?;
        let tags = self.tags_at(commit)?;
        let branches = self.branches_at(commit)?;

        Ok(CommitMeta {
            id: commit.clone(),
            parents,
            author,
            committer,
            message,
            branches,
            tags,
            changed_paths,
        })
    }

    /// Paths changed by `commit` relative to `first_parent` (or the empty
    /// tree for a root commit). For merge commits this is exactly the
    /// first-parent diff.
    ///
    /// # Errors
    /// Propagates driver failures.
    pub fn changed_paths(
        &self,
        commit: &CommitId,
        first_parent: Option<&CommitId>,
    ) -> Result<Vec<String>, GitError> {
        let out = match first_parent {
            Some(parent) => self.run(&[
                "diff-tree",
                "--no-commit-id",
                "--name-only",
                "-r",
                parent.as_str(),
                commit.as_str(),
            ])?,
            None => self.run(&[
                "diff-tree",
                "--root",
                "--no-commit-id",
                "--name-only",
                "-r",
                commit.as_str(),
            ])?,
        };
        Ok(out.lines().filter(|l| !l.is_empty()).map(ToOwned::to_owned).collect())
    }

    /// Tags pointing at the given commit.
    ///
    /// # Errors
    /// Propagates driver failures.
    pub fn tags_at(&self, commit: &CommitId) -> Result<Vec<String>, GitError> {
        let out = self.run(&["tag", "--points-at", commit.as_str()])?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(ToOwned::to_owned).collect())
    }

    /// Local branches whose tip is the given commit.
    ///
    /// # Errors
    /// Propagates driver failures.
    pub fn branches_at(&self, commit: &CommitId) -> Result<Vec<String>, GitError> {
        let points_at = format!("--points-at={commit}");
        let out = self.run(&[
            "for-each-ref",
            "refs/heads",
            &points_at,
            "--format=%(refname:short)",
        ])?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(ToOwned::to_owned).collect())
    }

    /// Committer time of a commit.
    ///
    /// # Errors
    /// Fails when the commit is missing or the date is unparsable.
    pub fn commit_time(&self, commit: &CommitId) -> Result<DateTime<Utc>, GitError> {
        let out = self.run(&["show", "-s", "--format=%cI", commit.as_str()])?;
        DateTime::parse_from_rfc3339(out.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| GitError::Parse {
                what: format!("committer date of {commit}"),
                detail: e.to_string(),
            })
    }

    /// Read a ref, `None` when it doesn't exist.
    ///
    /// # Errors
    /// Propagates driver failures other than missing refs.
    pub fn show_ref(&self, name: &str) -> Result<Option<CommitId>, GitError> {
        self.rev_parse_opt(name)
    }

    /// List refs under a pattern as `(refname, oid)` pairs.
    ///
    /// # Errors
    /// Propagates driver failures.
    pub fn for_each_ref(&self, pattern: &str) -> Result<Vec<(String, CommitId)>, GitError> {
        let out = self.run(&[
            "for-each-ref",
            "--format=%(refname)%00%(objectname)",
            pattern,
        ])?;
        out.lines()
            .filter(|l| !l.is_empty())
            .map(|line| {
                let (name, oid) = line.split_once('\0').ok_or_else(|| GitError::Parse {
                    what: "for-each-ref".to_owned(),
                    detail: line.to_owned(),
                })?;
                let oid = CommitId::new(oid).map_err(|e| GitError::Parse {
                    what: name.to_owned(),
                    detail: e.to_string(),
                })?;
                Ok((name.to_owned(), oid))
            })
            .collect()
    }

    /// `git status --porcelain` for the working tree.
    ///
    /// # Errors
    /// Propagates driver failures.
    pub fn status_porcelain(&self) -> Result<String, GitError> {
        self.run(&["status", "--porcelain"])
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Stage paths; with no paths, stage everything.
    ///
    /// # Errors
    /// Propagates driver failures.
    pub fn add(&self, paths: &[&str]) -> Result<(), GitError> {
        if paths.is_empty() {
            self.run(&["add", "-A"])?;
        } else {
            let mut args = vec!["add", "--"];
            args.extend_from_slice(paths);
            self.run(&args)?;
        }
        Ok(())
    }

    /// Commit the index, returning the new HEAD.
    ///
    /// # Errors
    /// Propagates driver failures.
    pub fn commit(&self, message: &str) -> Result<CommitId, GitError> {
        self.run(&["commit", "--allow-empty", "-m", message])?;
        self.head()
    }

    /// Create a lightweight tag at a commit (HEAD when `target` is `None`).
    ///
    /// # Errors
    /// Propagates driver failures.
    pub fn tag(&self, name: &str, target: Option<&CommitId>) -> Result<(), GitError> {
        match target {
            Some(commit) => self.run(&["tag", name, commit.as_str()])?,
            None => self.run(&["tag", name])?,
        };
        Ok(())
    }

    /// Set a ref unconditionally.
    ///
    /// # Errors
    /// Propagates driver failures; ref lock contention maps to
    /// [`GitError::Conflict`].
    pub fn update_ref(&self, name: &str, value: &CommitId) -> Result<(), GitError> {
        self.run(&["update-ref", name, value.as_str()])?;
        Ok(())
    }

    /// Create a ref iff it does not already exist.
    ///
    /// Returns `true` iff this call created the ref, `false` when another
    /// creator won. The protocol is: check existence, attempt a create-only
    /// CAS (expected old value = the zero OID), and on failure re-check
    /// existence to distinguish a lost race from a real error.
    ///
    /// # Errors
    /// Only on failures unrelated to the race.
    pub fn update_ref_create_atomic(
        &self,
        name: &str,
        value: &CommitId,
    ) -> Result<bool, GitError> {
        if self.show_ref(name)?.is_some() {
            return Ok(false);
        }
        match self.run(&["update-ref", name, value.as_str(), ZERO_OID]) {
            Ok(_) => Ok(true),
            Err(GitError::Conflict { .. }) => Ok(false),
            Err(e) => {
                // Disambiguate: if the ref now exists, we simply lost.
                if self.show_ref(name)?.is_some() {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Delete a ref. Idempotent: deleting a missing ref is a no-op.
    ///
    /// Returns `true` iff the ref existed and was deleted by this call.
    ///
    /// # Errors
    /// Propagates failures other than the ref already being absent.
    pub fn update_ref_delete(&self, name: &str) -> Result<bool, GitError> {
        match self.run(&["update-ref", "-d", name]) {
            Ok(_) => Ok(true),
            Err(e) => {
                if self.show_ref(name)?.is_none() {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// `git notes add -f` — create or replace the note on a commit.
    ///
    /// # Errors
    /// Propagates driver failures.
    pub fn note_add(
        &self,
        notes_ref: &str,
        commit: &CommitId,
        message: &str,
    ) -> Result<(), GitError> {
        self.run(&[
            "notes", "--ref", notes_ref, "add", "-f", "-m", message, commit.as_str(),
        ])?;
        Ok(())
    }

    /// `git notes append` — attach another message to a commit's note.
    ///
    /// Concurrent appends can lose the notes-ref race; that surfaces as
    /// [`GitError::Conflict`] for the caller to retry.
    ///
    /// # Errors
    /// See above.
    pub fn note_append(
        &self,
        notes_ref: &str,
        commit: &CommitId,
        message: &str,
    ) -> Result<(), GitError> {
        self.run(&[
            "notes", "--ref", notes_ref, "append", "-m", message, commit.as_str(),
        ])
        .map_err(|e| match e {
            GitError::Command { ref stderr, .. } if stderr_means_ref_conflict(stderr) => {
                GitError::Conflict {
                    ref_name: notes_ref.to_owned(),
                }
            }
            other => other,
        })?;
        Ok(())
    }

    /// Read a commit's note, `None` when it has none.
    ///
    /// # Errors
    /// Propagates failures other than a missing note.
    pub fn note_show(
        &self,
        notes_ref: &str,
        commit: &CommitId,
    ) -> Result<Option<String>, GitError> {
        match self.run(&["notes", "--ref", notes_ref, "show", commit.as_str()]) {
            Ok(out) => Ok(Some(out)),
            Err(GitError::Command { stderr, .. })
                if stderr.contains("no note found") || stderr.contains("No note found") =>
            {
                Ok(None)
            }
            Err(GitError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Walk commits from `HEAD` with their notes under `notes_ref`, newest
    /// first, bounded by `limit` commits.
    ///
    /// Returns `(commit, note lines)` pairs; commits without a note have an
    /// empty vector. An empty repository yields an empty walk.
    ///
    /// # Errors
    /// Propagates driver failures.
    pub fn log_with_notes(
        &self,
        notes_ref: &str,
        limit: usize,
    ) -> Result<Vec<(CommitId, Vec<String>)>, GitError> {
        let n = limit.to_string();
        let notes_arg = format!("--notes={notes_ref}");
        // %N inlines the note body under its commit marker line
        let out = match self.run(&[
            "--no-pager",
            "log",
            "--no-color",
            "-n",
            &n,
            "--pretty=--,%H%n%N",
            &notes_arg,
            "HEAD",
        ]) {
            Ok(out) => out,
            Err(GitError::NotFound { .. }) => return Ok(Vec::new()),
            Err(GitError::Command { exit_code: Some(128), .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut walk: Vec<(CommitId, Vec<String>)> = Vec::new();
        for line in out.lines() {
            if let Some(hash) = line.strip_prefix("--,") {
                let id = CommitId::new(hash.trim()).map_err(|e| GitError::Parse {
                    what: "log --pretty".to_owned(),
                    detail: e.to_string(),
                })?;
                walk.push((id, Vec::new()));
            } else if let Some((_, lines)) = walk.last_mut() {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_owned());
                }
            }
        }
        Ok(walk)
    }

    /// Store bytes as a blob via `hash-object -w --stdin`, returning the OID.
    ///
    /// # Errors
    /// Propagates driver failures.
    pub fn hash_object(&self, data: &[u8]) -> Result<String, GitError> {
        self.run_with_stdin(&["hash-object", "-w", "--stdin"], data)
    }

    /// Write the index as a tree, returning the tree OID.
    ///
    /// # Errors
    /// Propagates driver failures.
    pub fn write_tree(&self) -> Result<String, GitError> {
        self.run(&["write-tree"])
    }
}

/// Drop the `<epoch> <zone>` suffix from a raw `author`/`committer` line,
/// leaving `Name <email>`.
fn strip_ident_timestamp(ident: &str) -> String {
    match ident.rfind('>') {
        Some(pos) => ident[..=pos].to_owned(),
        None => ident.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
