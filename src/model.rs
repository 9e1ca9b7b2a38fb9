//! Core domain types for GitVan.
//!
//! Foundation types used throughout the engine: commit identifiers, job and
//! event identifiers, worktree descriptors, per-commit metadata, and the
//! deduplicated unit of work — the [`Invocation`] with its fingerprint.
//!
//! Canonical JSON rules (used for fingerprints and receipts):
//! - Object keys sorted (serde_json's default `Map` is a `BTreeMap`)
//! - No insignificant whitespace
//! - Deterministic: serialize twice → identical bytes

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// Which kind of identifier failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    CommitId,
    JobId,
    EventId,
}

/// An identifier string failed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub kind: ErrorKind,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            ErrorKind::CommitId => "commit id",
            ErrorKind::JobId => "job id",
            ErrorKind::EventId => "event id",
        };
        write!(f, "invalid {what} {:?}: {}", self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// CommitId
// ---------------------------------------------------------------------------

/// A validated 40-character lowercase hex Git commit id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitId(String);

impl CommitId {
    /// Create a new `CommitId` from a string, validating format.
    ///
    /// # Errors
    /// Returns an error unless the string is exactly 40 lowercase hex
    /// characters.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the inner hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first 12 characters, for log lines and lock names.
    #[must_use]
    pub fn abbrev(&self) -> &str {
        &self.0[..12]
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        if s.len() != 40 {
            return Err(ValidationError {
                kind: ErrorKind::CommitId,
                value: s.to_owned(),
                reason: format!("expected 40 hex characters, got {}", s.len()),
            });
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(ValidationError {
                kind: ErrorKind::CommitId,
                value: s.to_owned(),
                reason: "must contain only lowercase hex characters (0-9, a-f)".to_owned(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CommitId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CommitId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<CommitId> for String {
    fn from(id: CommitId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// JobId / EventId
// ---------------------------------------------------------------------------

/// Shared validation for path-derived identifiers.
///
/// Identifiers come from file paths relative to the definitions root, with
/// separators normalized to `/` and the extension stripped. They must be
/// non-empty, use `/`-separated non-empty segments, and stay within a safe
/// character set.
fn validate_path_id(kind: ErrorKind, s: &str) -> Result<(), ValidationError> {
    if s.is_empty() {
        return Err(ValidationError {
            kind,
            value: s.to_owned(),
            reason: "must not be empty".to_owned(),
        });
    }
    if s.starts_with('/') || s.ends_with('/') {
        return Err(ValidationError {
            kind,
            value: s.to_owned(),
            reason: "must not start or end with '/'".to_owned(),
        });
    }
    if s.split('/').any(str::is_empty) {
        return Err(ValidationError {
            kind,
            value: s.to_owned(),
            reason: "must not contain empty segments".to_owned(),
        });
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '*' | ' '))
    {
        return Err(ValidationError {
            kind,
            value: s.to_owned(),
            reason: "contains characters outside [a-zA-Z0-9/_-.* ]".to_owned(),
        });
    }
    Ok(())
}

/// A path-derived job identifier, e.g. `deploy/docs`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Create a new `JobId`, validating format.
    ///
    /// # Errors
    /// Returns an error if the id is empty or malformed.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        validate_path_id(ErrorKind::JobId, s)?;
        Ok(Self(s.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        validate_path_id(ErrorKind::JobId, &s)?;
        Ok(Self(s))
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

/// A path-derived event identifier, e.g. `path/src__star__`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId(String);

impl EventId {
    /// Create a new `EventId`, validating format.
    ///
    /// # Errors
    /// Returns an error if the id is empty or malformed.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        validate_path_id(ErrorKind::EventId, s)?;
        Ok(Self(s.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EventId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EventId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        validate_path_id(ErrorKind::EventId, &s)?;
        Ok(Self(s))
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Worktree
// ---------------------------------------------------------------------------

/// The sentinel branch name reported for a detached HEAD.
pub const DETACHED: &str = "HEAD";

/// One checkout of the repository, as reported by `git worktree list`.
///
/// Identity is the absolute path. Worktrees are enumerated fresh each tick;
/// they come and go through external git operations.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Worktree {
    /// Absolute path of the checkout.
    pub path: PathBuf,
    /// Current HEAD commit.
    pub head: CommitId,
    /// Checked-out branch, `None` when detached.
    pub branch: Option<String>,
    /// Whether this is the repository's main worktree.
    pub is_main: bool,
}

impl Worktree {
    /// The branch name for receipts: the real branch, or `"HEAD"` when
    /// detached.
    #[must_use]
    pub fn branch_or_detached(&self) -> &str {
        self.branch.as_deref().unwrap_or(DETACHED)
    }

    /// The worktree path rendered for receipts and fingerprints.
    #[must_use]
    pub fn path_str(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

// ---------------------------------------------------------------------------
// CommitMeta
// ---------------------------------------------------------------------------

/// Metadata for one commit, gathered once per tick and cached.
///
/// Predicates are pure functions of this struct plus the worktree state;
/// nothing here ever reflects uncommitted working-tree content.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitMeta {
    pub id: CommitId,
    pub parents: Vec<CommitId>,
    /// `Name <email>` of the author.
    pub author: String,
    /// `Name <email>` of the committer.
    pub committer: String,
    /// Full commit message, subject and body.
    pub message: String,
    /// Local branches whose tip is this commit.
    pub branches: Vec<String>,
    /// Tags pointing at this commit.
    pub tags: Vec<String>,
    /// Paths changed relative to the first parent (or the empty tree for a
    /// root commit).
    pub changed_paths: Vec<String>,
}

impl CommitMeta {
    #[must_use]
    pub fn is_merge(&self) -> bool {
        self.parents.len() >= 2
    }
}

// ---------------------------------------------------------------------------
// Invocation + fingerprint
// ---------------------------------------------------------------------------

/// How many hex characters of the SHA-256 digest make up a fingerprint.
pub const FINGERPRINT_LEN: usize = 16;

/// A deduplicated unit of work: one job, bound to one commit on one worktree
/// with a concrete payload.
///
/// Two invocations with equal fingerprints run at most once in aggregate
/// across every daemon observing the same repository.
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub event_id: Option<EventId>,
    pub job_id: JobId,
    pub commit: CommitId,
    pub worktree: PathBuf,
    pub payload: serde_json::Value,
    pub fingerprint: String,
}

impl Invocation {
    /// Build an invocation, deriving the fingerprint from the identity-bearing
    /// fields.
    #[must_use]
    pub fn new(
        event_id: Option<EventId>,
        job_id: JobId,
        commit: CommitId,
        worktree: &Path,
        payload: serde_json::Value,
    ) -> Self {
        let fingerprint = fingerprint(&job_id, &commit, worktree, &payload);
        Self {
            event_id,
            job_id,
            commit,
            worktree: worktree.to_path_buf(),
            payload,
            fingerprint,
        }
    }
}

/// Serialize a JSON value canonically: sorted object keys, no extra
/// whitespace. serde_json's default `Map` is a `BTreeMap`, so plain
/// serialization is already key-sorted.
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_owned())
}

/// Compute the dedup fingerprint over an invocation's identity-bearing
/// fields: `sha256(job_id ∥ commit ∥ worktree ∥ canonical(payload))`,
/// truncated to [`FINGERPRINT_LEN`] hex characters.
#[must_use]
pub fn fingerprint(
    job_id: &JobId,
    commit: &CommitId,
    worktree: &Path,
    payload: &serde_json::Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(commit.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(worktree.to_string_lossy().as_bytes());
    hasher.update([0]);
    hasher.update(canonical_json(payload).as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..FINGERPRINT_LEN].to_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn oid(c: char) -> CommitId {
        CommitId::new(&c.to_string().repeat(40)).unwrap()
    }

    // -- CommitId --

    #[test]
    fn commit_id_accepts_lowercase_hex() {
        let id = CommitId::new(&"a1".repeat(20)).unwrap();
        assert_eq!(id.as_str().len(), 40);
    }

    #[test]
    fn commit_id_rejects_short() {
        let err = CommitId::new("abc123").unwrap_err();
        assert!(err.reason.contains("40 hex characters"));
    }

    #[test]
    fn commit_id_rejects_uppercase() {
        let err = CommitId::new(&"A".repeat(40)).unwrap_err();
        assert!(err.reason.contains("lowercase"));
    }

    #[test]
    fn commit_id_abbrev_is_twelve_chars() {
        assert_eq!(oid('b').abbrev().len(), 12);
    }

    #[test]
    fn commit_id_serde_round_trip() {
        let id = oid('c');
        let json = serde_json::to_string(&id).unwrap();
        let back: CommitId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn commit_id_serde_rejects_invalid() {
        let result: Result<CommitId, _> = serde_json::from_str("\"nope\"");
        assert!(result.is_err());
    }

    // -- JobId / EventId --

    #[test]
    fn job_id_accepts_nested() {
        assert!(JobId::new("deploy/docs").is_ok());
    }

    #[test]
    fn job_id_rejects_empty() {
        assert!(JobId::new("").is_err());
    }

    #[test]
    fn job_id_rejects_leading_slash() {
        assert!(JobId::new("/deploy").is_err());
    }

    #[test]
    fn job_id_rejects_empty_segment() {
        assert!(JobId::new("a//b").is_err());
    }

    #[test]
    fn event_id_accepts_unrouted_forms() {
        assert!(EventId::new("path/src__star__").is_ok());
        assert!(EventId::new("cron/0_3_*_*_*").is_ok());
    }

    // -- Worktree --

    #[test]
    fn detached_worktree_reports_sentinel() {
        let wt = Worktree {
            path: PathBuf::from("/repo"),
            head: oid('d'),
            branch: None,
            is_main: true,
        };
        assert_eq!(wt.branch_or_detached(), "HEAD");
    }

    // -- canonical JSON + fingerprint --

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({"zeta": 1, "alpha": 2});
        assert_eq!(canonical_json(&value), r#"{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn fingerprint_is_sixteen_hex() {
        let fp = fingerprint(
            &JobId::new("build").unwrap(),
            &oid('e'),
            Path::new("/repo"),
            &json!({"file": "src/a.js"}),
        );
        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_stable_across_key_order() {
        let job = JobId::new("build").unwrap();
        let a = fingerprint(&job, &oid('f'), Path::new("/w"), &json!({"a": 1, "b": 2}));
        let b = fingerprint(&job, &oid('f'), Path::new("/w"), &json!({"b": 2, "a": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_per_commit() {
        let job = JobId::new("build").unwrap();
        let payload = json!({});
        let a = fingerprint(&job, &oid('a'), Path::new("/w"), &payload);
        let b = fingerprint(&job, &oid('b'), Path::new("/w"), &payload);
        assert_ne!(a, b);
    }

    #[test]
    fn invocation_carries_fingerprint() {
        let inv = Invocation::new(
            Some(EventId::new("path/src__star__").unwrap()),
            JobId::new("build").unwrap(),
            oid('1'),
            Path::new("/repo"),
            json!({"file": "src/a.js"}),
        );
        assert_eq!(inv.fingerprint.len(), FINGERPRINT_LEN);
    }
}
