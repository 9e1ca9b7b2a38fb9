//! Job definitions and their subprocess invocable.
//!
//! A job file under `jobs/**` is TOML:
//!
//! ```toml
//! [meta]
//! name = "build"
//! desc = "Compile the site"
//! tags = ["ci"]
//!
//! cron = "0 3 * * *"        # optional: also fire on a schedule
//! timeout_ms = 120000       # optional: cooperative kill deadline
//!
//! [run]
//! command = ["sh", "-c", "make build"]
//! # or: shell = "make build"
//! ```
//!
//! The invocable contract — given a payload and context, produce a
//! canonicalizable result or raise — is realized as a subprocess: the command
//! runs inside the triggering worktree with the payload and commit details in
//! `GITVAN_*` environment variables, and its stdout becomes the result (JSON
//! when it parses, a string otherwise). Jobs are trusted local code; the
//! engine adds determinism (`TZ=UTC`, `LANG=C`), not sandboxing.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::cron::CronExpr;
use crate::discovery::DefinitionError;
use crate::model::JobId;

/// How often the runner polls a child while waiting for exit or deadline.
const WAIT_POLL: Duration = Duration::from_millis(25);

/// How much stderr is kept on failures.
const STDERR_KEEP: usize = 4096;

// ---------------------------------------------------------------------------
// Definition schema
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobFile {
    #[serde(default)]
    meta: Option<MetaFile>,
    #[serde(default)]
    cron: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    run: Option<RunSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MetaFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// How a job or inline event target runs.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSpec {
    /// Argv vector; first element is the program.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Convenience form, executed as `sh -c <shell>`.
    #[serde(default)]
    pub shell: Option<String>,
}

impl RunSpec {
    /// The argv to spawn. Returns `None` when the spec is unusable (neither
    /// or both forms given, or an empty command).
    #[must_use]
    pub fn argv(&self) -> Option<Vec<String>> {
        match (&self.command, &self.shell) {
            (Some(argv), None) if !argv.is_empty() => Some(argv.clone()),
            (None, Some(shell)) => Some(vec!["sh".to_owned(), "-c".to_owned(), shell.clone()]),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// JobDef
// ---------------------------------------------------------------------------

/// A loaded job definition.
#[derive(Clone, Debug)]
pub struct JobDef {
    pub id: JobId,
    pub path: PathBuf,
    pub name: String,
    pub desc: Option<String>,
    pub tags: Vec<String>,
    /// Optional schedule; the daemon fires it alongside cron events.
    pub cron: Option<CronExpr>,
    pub timeout_ms: Option<u64>,
    pub run: RunSpec,
}

impl JobDef {
    /// Parse a job file. The id has already been derived from the path.
    ///
    /// # Errors
    /// Reports schema, run-spec, and cron problems as definition errors.
    pub fn parse(id: JobId, path: &Path, text: &str) -> Result<Self, DefinitionError> {
        let file: JobFile = toml::from_str(text).map_err(|e| DefinitionError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let run = file.run.ok_or_else(|| DefinitionError::MissingRun {
            path: path.to_path_buf(),
        })?;
        if run.argv().is_none() {
            return Err(DefinitionError::MissingRun {
                path: path.to_path_buf(),
            });
        }
        let cron = file
            .cron
            .map(|expr| {
                CronExpr::parse(&expr).map_err(|e| DefinitionError::InvalidCron {
                    path: path.to_path_buf(),
                    expr: e.expr,
                    reason: e.reason,
                })
            })
            .transpose()?;
        let meta = file.meta.unwrap_or(MetaFile {
            name: None,
            desc: None,
            tags: Vec::new(),
        });
        Ok(Self {
            name: meta.name.unwrap_or_else(|| id.as_str().to_owned()),
            desc: meta.desc,
            tags: meta.tags,
            id,
            path: path.to_path_buf(),
            cron,
            timeout_ms: file.timeout_ms,
            run,
        })
    }

    /// A synthetic definition for an event's inline `[run]` target.
    ///
    /// # Errors
    /// Fails when the run spec is unusable.
    pub fn inline(id: JobId, path: &Path, run: RunSpec) -> Result<Self, DefinitionError> {
        if run.argv().is_none() {
            return Err(DefinitionError::MissingRun {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            name: id.as_str().to_owned(),
            desc: None,
            tags: Vec::new(),
            id,
            path: path.to_path_buf(),
            cron: None,
            timeout_ms: None,
            run,
        })
    }

    /// Execute the invocable in `workdir` with the given environment.
    ///
    /// Blocks until the child exits or the definition's deadline elapses; on
    /// deadline the child is killed and [`JobError::Timeout`] is returned.
    ///
    /// # Errors
    /// [`JobError`] for spawn failures, nonzero exits, and timeouts.
    pub fn execute(
        &self,
        workdir: &Path,
        env: &[(String, String)],
    ) -> Result<serde_json::Value, JobError> {
        // parse() guarantees a usable argv
        let argv = self.run.argv().ok_or_else(|| JobError::Spawn {
            detail: "unusable run spec".to_owned(),
        })?;
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in env {
            cmd.env(k, v);
        }
        let mut child = cmd.spawn().map_err(|e| JobError::Spawn {
            detail: e.to_string(),
        })?;

        // Drain pipes on threads so a chatty child can't fill the pipe
        // buffer and deadlock against our wait loop.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_handle = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });
        let stderr_handle = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });

        let deadline = self
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if let Some(deadline) = deadline
                        && Instant::now() >= deadline
                    {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = stdout_handle.join();
                        let _ = stderr_handle.join();
                        return Err(JobError::Timeout {
                            limit_ms: self.timeout_ms.unwrap_or_default(),
                        });
                    }
                    std::thread::sleep(WAIT_POLL);
                }
                Err(e) => {
                    let _ = child.kill();
                    return Err(JobError::Spawn {
                        detail: e.to_string(),
                    });
                }
            }
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();

        if !status.success() {
            let kept = &stderr[..stderr.len().min(STDERR_KEEP)];
            return Err(JobError::Failed {
                exit_code: status.code(),
                stderr: String::from_utf8_lossy(kept).trim().to_owned(),
            });
        }

        Ok(parse_result(&stdout))
    }
}

/// Interpret a job's stdout as a canonicalizable result: JSON when it
/// parses, a plain string otherwise, `null` when empty.
fn parse_result(stdout: &[u8]) -> serde_json::Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(trimmed)
        .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_owned()))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A job invocation failed. These never propagate past the runner — they
/// become `status = "error"` receipts.
#[derive(Debug)]
pub enum JobError {
    /// The child could not be spawned or waited on.
    Spawn { detail: String },
    /// The child exited nonzero.
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    /// The deadline elapsed and the child was killed.
    Timeout { limit_ms: u64 },
}

impl JobError {
    /// The short human string recorded in the receipt's `error` field.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Spawn { detail } => format!("spawn failed: {detail}"),
            Self::Failed { exit_code, .. } => match exit_code {
                Some(code) => format!("exited with code {code}"),
                None => "killed by signal".to_owned(),
            },
            Self::Timeout { .. } => "timeout".to_owned(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { detail } => write!(f, "failed to spawn job: {detail}"),
            Self::Failed { exit_code, stderr } => {
                write!(f, "job failed")?;
                if let Some(code) = exit_code {
                    write!(f, " (exit code {code})")?;
                }
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            Self::Timeout { limit_ms } => write!(f, "job exceeded its {limit_ms}ms deadline"),
        }
    }
}

impl std::error::Error for JobError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_job(text: &str) -> Result<JobDef, DefinitionError> {
        JobDef::parse(
            JobId::new("build").unwrap(),
            Path::new("/repo/jobs/build.toml"),
            text,
        )
    }

    fn minimal() -> JobDef {
        parse_job("[run]\nshell = \"true\"\n").unwrap()
    }

    // -- parsing --

    #[test]
    fn parse_full_definition() {
        let job = parse_job(
            r#"
            [meta]
            name = "site build"
            desc = "Compile the site"
            tags = ["ci", "docs"]

            cron = "0 3 * * *"
            timeout_ms = 5000

            [run]
            command = ["make", "build"]
            "#,
        )
        .unwrap();
        assert_eq!(job.name, "site build");
        assert_eq!(job.tags, vec!["ci", "docs"]);
        assert_eq!(job.cron.as_ref().map(CronExpr::as_str), Some("0 3 * * *"));
        assert_eq!(job.timeout_ms, Some(5000));
        assert_eq!(job.run.argv().unwrap(), vec!["make", "build"]);
    }

    #[test]
    fn name_defaults_to_id() {
        assert_eq!(minimal().name, "build");
    }

    #[test]
    fn missing_run_is_definition_error() {
        let err = parse_job("[meta]\nname = \"x\"\n").unwrap_err();
        assert!(matches!(err, DefinitionError::MissingRun { .. }));
    }

    #[test]
    fn command_and_shell_together_rejected() {
        let err = parse_job("[run]\ncommand = [\"true\"]\nshell = \"true\"\n").unwrap_err();
        assert!(matches!(err, DefinitionError::MissingRun { .. }));
    }

    #[test]
    fn invalid_cron_rejected() {
        let err = parse_job("cron = \"nope\"\n[run]\nshell = \"true\"\n").unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidCron { .. }));
    }

    #[test]
    fn shell_becomes_sh_dash_c() {
        let job = minimal();
        assert_eq!(job.run.argv().unwrap()[..2], ["sh", "-c"]);
    }

    // -- execution --

    #[test]
    fn execute_captures_json_result() {
        let job = parse_job("[run]\nshell = \"printf '{\\\"built\\\": true}'\"\n").unwrap();
        let result = job.execute(Path::new("/tmp"), &[]).unwrap();
        assert_eq!(result, json!({"built": true}));
    }

    #[test]
    fn execute_plain_output_becomes_string() {
        let job = parse_job("[run]\nshell = \"echo done\"\n").unwrap();
        let result = job.execute(Path::new("/tmp"), &[]).unwrap();
        assert_eq!(result, json!("done"));
    }

    #[test]
    fn execute_empty_output_is_null() {
        let job = minimal();
        let result = job.execute(Path::new("/tmp"), &[]).unwrap();
        assert_eq!(result, serde_json::Value::Null);
    }

    #[test]
    fn execute_sees_environment() {
        let job = parse_job("[run]\nshell = \"printf '%s' \\\"$GITVAN_JOB\\\"\"\n").unwrap();
        let env = vec![("GITVAN_JOB".to_owned(), "build".to_owned())];
        let result = job.execute(Path::new("/tmp"), &env).unwrap();
        assert_eq!(result, json!("build"));
    }

    #[test]
    fn execute_nonzero_exit_fails_with_stderr() {
        let job = parse_job("[run]\nshell = \"echo boom >&2; exit 3\"\n").unwrap();
        let err = job.execute(Path::new("/tmp"), &[]).unwrap_err();
        match err {
            JobError::Failed { exit_code, stderr } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn execute_timeout_kills_child() {
        let job = parse_job("timeout_ms = 100\n[run]\nshell = \"sleep 5\"\n").unwrap();
        let started = Instant::now();
        let err = job.execute(Path::new("/tmp"), &[]).unwrap_err();
        assert!(matches!(err, JobError::Timeout { limit_ms: 100 }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn error_summaries_are_short() {
        assert_eq!(
            JobError::Timeout { limit_ms: 10 }.summary(),
            "timeout"
        );
        assert_eq!(
            JobError::Failed {
                exit_code: Some(2),
                stderr: String::new()
            }
            .summary(),
            "exited with code 2"
        );
    }
}
