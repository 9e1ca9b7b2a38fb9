//! Event definitions and predicate evaluation.
//!
//! An event file under `events/**` is TOML:
//!
//! ```toml
//! name = "build on source change"
//! type = "path"
//! pattern = "src/**"
//! job = "build"
//!
//! [payload]
//! reason = "changed {{ commit.id }}"
//! ```
//!
//! `type` and `pattern` may be omitted when the file path itself encodes them
//! through the unrouting grammar (`events/path/src__star__.toml`). The target
//! is either a `job` reference or an inline `[run]` spec.
//!
//! Predicates are a tagged sum with one evaluation dispatcher. They are pure
//! functions of committed state — commit metadata plus worktree identity —
//! and never look at the working tree.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use crate::cron::CronExpr;
use crate::discovery::{DefinitionError, unroute};
use crate::jobs::RunSpec;
use crate::model::{CommitMeta, EventId, JobId, Worktree};

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// The tagged sum of trigger kinds.
#[derive(Clone, Debug)]
pub enum Predicate {
    /// Fires on a schedule; never matches a commit (the daemon's scheduler
    /// owns it).
    Cron(CronExpr),
    /// The worktree's branch matches the glob.
    Branch(glob::Pattern),
    /// Any changed path matches the glob.
    Path(glob::Pattern),
    /// A tag pointing at the commit matches the glob.
    Tag(glob::Pattern),
    /// The commit message matches the regex.
    Message(Regex),
    /// The author (`Name <email>`) matches the regex.
    Author(Regex),
    /// The commit has two or more parents.
    Merge,
    /// Always matches.
    Any,
}

impl Predicate {
    /// The kind name as written in definition files.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Cron(_) => "cron",
            Self::Branch(_) => "branch",
            Self::Path(_) => "path",
            Self::Tag(_) => "tag",
            Self::Message(_) => "message",
            Self::Author(_) => "author",
            Self::Merge => "merge",
            Self::Any => "any",
        }
    }

    /// The schedule, for cron-kind predicates.
    #[must_use]
    pub const fn cron(&self) -> Option<&CronExpr> {
        match self {
            Self::Cron(expr) => Some(expr),
            _ => None,
        }
    }

    /// Evaluate against one commit on one worktree.
    ///
    /// Branch predicates never match a detached worktree; cron predicates
    /// never match here at all.
    #[must_use]
    pub fn evaluate(&self, meta: &CommitMeta, worktree: &Worktree) -> bool {
        match self {
            Self::Cron(_) => false,
            Self::Branch(pattern) => worktree
                .branch
                .as_deref()
                .is_some_and(|b| pattern.matches(b)),
            Self::Path(pattern) => meta.changed_paths.iter().any(|p| pattern.matches(p)),
            Self::Tag(pattern) => meta.tags.iter().any(|t| pattern.matches(t)),
            Self::Message(re) => re.is_match(&meta.message),
            Self::Author(re) => re.is_match(&meta.author),
            Self::Merge => meta.is_merge(),
            Self::Any => true,
        }
    }

    /// The kind-specific payload fields for a matching commit: the matched
    /// file(s), tag, parents, etc. The router merges these under the common
    /// `{commit, branch}` base and any explicit template.
    #[must_use]
    pub fn payload_seed(&self, meta: &CommitMeta) -> serde_json::Value {
        match self {
            Self::Path(pattern) => {
                let files: Vec<&String> = meta
                    .changed_paths
                    .iter()
                    .filter(|p| pattern.matches(p))
                    .collect();
                json!({ "file": files.first(), "files": files })
            }
            Self::Tag(pattern) => {
                let tag = meta.tags.iter().find(|t| pattern.matches(t));
                json!({ "tag": tag })
            }
            Self::Merge => json!({ "parents": meta.parents }),
            Self::Message(_) => json!({ "message": meta.message }),
            Self::Author(_) => json!({ "author": meta.author }),
            Self::Cron(_) | Self::Branch(_) | Self::Any => json!({}),
        }
    }

    /// Build a predicate from `(kind, pattern)` as written in a file or
    /// derived from a path.
    fn from_kind(kind: &str, pattern: &str, path: &Path) -> Result<Self, DefinitionError> {
        let compile_glob = |p: &str| {
            glob::Pattern::new(p).map_err(|e| DefinitionError::InvalidPattern {
                path: path.to_path_buf(),
                pattern: p.to_owned(),
                reason: e.to_string(),
            })
        };
        let compile_regex = |p: &str| {
            Regex::new(p).map_err(|e| DefinitionError::InvalidPattern {
                path: path.to_path_buf(),
                pattern: p.to_owned(),
                reason: e.to_string(),
            })
        };
        match kind {
            "cron" => {
                let expr = CronExpr::parse(pattern).map_err(|e| DefinitionError::InvalidCron {
                    path: path.to_path_buf(),
                    expr: e.expr,
                    reason: e.reason,
                })?;
                Ok(Self::Cron(expr))
            }
            "branch" => Ok(Self::Branch(compile_glob(pattern)?)),
            "path" => Ok(Self::Path(compile_glob(pattern)?)),
            "tag" => Ok(Self::Tag(compile_glob(pattern)?)),
            "message" => Ok(Self::Message(compile_regex(pattern)?)),
            "author" => Ok(Self::Author(compile_regex(pattern)?)),
            "merge" => Ok(Self::Merge),
            "any" => Ok(Self::Any),
            other => Err(DefinitionError::UnknownKind {
                path: path.to_path_buf(),
                kind: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// EventDef
// ---------------------------------------------------------------------------

/// What a matching event invokes.
#[derive(Clone, Debug)]
pub enum EventAction {
    /// A job defined under `jobs/**`.
    Job { job: JobId },
    /// An inline run spec carried by the event file itself.
    Inline { run: RunSpec },
}

/// A loaded event definition.
#[derive(Clone, Debug)]
pub struct EventDef {
    pub id: EventId,
    pub path: PathBuf,
    pub name: Option<String>,
    pub description: Option<String>,
    pub predicate: Predicate,
    pub action: EventAction,
    /// Template merged over the derived payload; string leaves are
    /// interpolated by the router.
    pub payload_template: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EventFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    cron: Option<String>,
    #[serde(default)]
    tz: Option<String>,
    /// Nested trigger form, equivalent to the top-level fields:
    /// `[on] type = "path" pattern = "src/**"`.
    #[serde(default)]
    on: Option<OnSpec>,
    #[serde(default)]
    job: Option<String>,
    #[serde(default)]
    run: Option<RunSpec>,
    #[serde(default)]
    payload: Option<toml::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OnSpec {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    cron: Option<String>,
    #[serde(default)]
    tz: Option<String>,
}

impl EventDef {
    /// Parse an event file; `type`/`pattern` fall back to what the id
    /// encodes.
    ///
    /// # Errors
    /// Reports schema, pattern, cron, timezone, and target problems as
    /// definition errors.
    pub fn parse(id: EventId, path: &Path, text: &str) -> Result<Self, DefinitionError> {
        let file: EventFile = toml::from_str(text).map_err(|e| DefinitionError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;

        let on = file.on.as_ref();
        let tz = file.tz.as_ref().or_else(|| on.and_then(|o| o.tz.as_ref()));
        if let Some(tz) = tz
            && !tz.eq_ignore_ascii_case("UTC")
        {
            return Err(DefinitionError::UnsupportedTimezone {
                path: path.to_path_buf(),
                tz: tz.clone(),
            });
        }

        let derived = unroute::derive(id.as_str());
        let kind = file
            .kind
            .clone()
            .or_else(|| on.and_then(|o| o.kind.clone()))
            .or_else(|| derived.as_ref().map(|d| d.kind.clone()))
            .ok_or_else(|| DefinitionError::UnknownKind {
                path: path.to_path_buf(),
                kind: "<none>".to_owned(),
            })?;
        let file_pattern = file
            .pattern
            .clone()
            .or_else(|| on.and_then(|o| o.pattern.clone()));
        let file_cron = file.cron.clone().or_else(|| on.and_then(|o| o.cron.clone()));
        let pattern = if kind == "cron" {
            file_cron
                .or(file_pattern)
                .or_else(|| derived.as_ref().map(|d| d.pattern.clone()))
        } else {
            file_pattern.or_else(|| derived.as_ref().map(|d| d.pattern.clone()))
        }
        .unwrap_or_default();

        let predicate = Predicate::from_kind(&kind, &pattern, path)?;

        let action = match (file.job, file.run) {
            (Some(job), None) => EventAction::Job {
                job: JobId::new(&job).map_err(|e| DefinitionError::InvalidId {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                })?,
            },
            (None, Some(run)) => {
                if run.argv().is_none() {
                    return Err(DefinitionError::MissingRun {
                        path: path.to_path_buf(),
                    });
                }
                EventAction::Inline { run }
            }
            _ => {
                return Err(DefinitionError::MissingRun {
                    path: path.to_path_buf(),
                });
            }
        };

        let payload_template = file
            .payload
            .map(|v| {
                serde_json::to_value(v).map_err(|e| DefinitionError::Parse {
                    path: path.to_path_buf(),
                    detail: format!("payload template: {e}"),
                })
            })
            .transpose()?;

        Ok(Self {
            id,
            path: path.to_path_buf(),
            name: file.name,
            description: file.description,
            predicate,
            action,
            payload_template,
        })
    }

    /// The job id receipts are written under: the referenced job, or a
    /// synthetic `events/<id>` id for inline targets.
    ///
    /// # Errors
    /// Fails when the synthetic id would be invalid (never for ids produced
    /// by discovery).
    pub fn target_job_id(&self) -> Result<JobId, DefinitionError> {
        match &self.action {
            EventAction::Job { job } => Ok(job.clone()),
            EventAction::Inline { .. } => JobId::new(&format!("events/{}", self.id)).map_err(|e| {
                DefinitionError::InvalidId {
                    path: self.path.clone(),
                    detail: e.to_string(),
                }
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// A static schedule record from `schedules/*.toml`.
#[derive(Clone, Debug)]
pub struct ScheduleDef {
    pub id: String,
    pub cron: CronExpr,
    pub job: JobId,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScheduleFile {
    #[serde(default)]
    id: Option<String>,
    cron: String,
    #[serde(alias = "jobId")]
    job: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    timezone: Option<String>,
}

const fn default_enabled() -> bool {
    true
}

impl ScheduleDef {
    /// Parse a schedule file; the file stem is the fallback id.
    ///
    /// # Errors
    /// Reports schema, cron and timezone problems as definition errors.
    pub fn parse(fallback_id: &str, path: &Path, text: &str) -> Result<Self, DefinitionError> {
        let file: ScheduleFile = toml::from_str(text).map_err(|e| DefinitionError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        if let Some(tz) = &file.timezone
            && !tz.eq_ignore_ascii_case("UTC")
        {
            return Err(DefinitionError::UnsupportedTimezone {
                path: path.to_path_buf(),
                tz: tz.clone(),
            });
        }
        let cron = CronExpr::parse(&file.cron).map_err(|e| DefinitionError::InvalidCron {
            path: path.to_path_buf(),
            expr: e.expr,
            reason: e.reason,
        })?;
        let job = JobId::new(&file.job).map_err(|e| DefinitionError::InvalidId {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            id: file.id.unwrap_or_else(|| fallback_id.to_owned()),
            cron,
            job,
            enabled: file.enabled,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
