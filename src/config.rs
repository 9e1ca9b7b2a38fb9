//! GitVan repository configuration (`gitvan.config.toml`).
//!
//! Typed configuration for the execution core: discovery roots, receipt and
//! lock refs, daemon pacing, and the determinism switches. Missing fields use
//! defaults; a missing file means all defaults (no error). Unknown keys are
//! rejected — a daemon quietly ignoring a typo'd knob is worse than refusing
//! to start.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::refs;

/// The config file name looked up in the root directory.
pub const CONFIG_FILE: &str = "gitvan.config.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level GitVan configuration.
#[derive(Clone, Debug, PartialEq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base directory for discovery. Defaults to the process working dir.
    #[serde(default)]
    pub root_dir: Option<PathBuf>,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub receipts: ReceiptsConfig,

    #[serde(default)]
    pub locks: LocksConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Load config from `<root>/gitvan.config.toml`.
    ///
    /// A missing file yields the default config; a present-but-invalid file
    /// is an error (the daemon maps it to exit code 1).
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file exists but cannot be read or
    /// parsed.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError {
            path: Some(path.clone()),
            message: format!("failed to read: {e}"),
        })?;
        toml::from_str(&text).map_err(|e| ConfigError {
            path: Some(path),
            message: e.to_string(),
        })
    }

    /// The effective discovery root: `root_dir` if set, else `fallback`.
    #[must_use]
    pub fn root(&self, fallback: &Path) -> PathBuf {
        self.root_dir
            .clone()
            .unwrap_or_else(|| fallback.to_path_buf())
    }

    /// Absolute jobs directory under the given root.
    #[must_use]
    pub fn jobs_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.jobs.dir)
    }

    /// Absolute events directory under the given root.
    #[must_use]
    pub fn events_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.events.directory)
    }

    /// Absolute schedules directory under the given root.
    #[must_use]
    pub fn schedules_dir(&self, root: &Path) -> PathBuf {
        root.join("schedules")
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Job discovery settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobsConfig {
    /// Jobs root, relative to `root_dir`.
    #[serde(default = "default_jobs_dir")]
    pub dir: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            dir: default_jobs_dir(),
        }
    }
}

fn default_jobs_dir() -> String {
    "jobs".to_owned()
}

/// Event discovery settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventsConfig {
    /// Events root, relative to `root_dir`. (The key is `directory`, not
    /// `dir` — preserved from the original configuration surface.)
    #[serde(default = "default_events_directory")]
    pub directory: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            directory: default_events_directory(),
        }
    }
}

fn default_events_directory() -> String {
    "events".to_owned()
}

/// Receipt ledger settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiptsConfig {
    /// Notes ref the ledger is appended under.
    #[serde(rename = "ref", default = "default_results_ref")]
    pub notes_ref: String,
}

impl Default for ReceiptsConfig {
    fn default() -> Self {
        Self {
            notes_ref: default_results_ref(),
        }
    }
}

fn default_results_ref() -> String {
    refs::RESULTS_REF.to_owned()
}

/// Lock manager settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocksConfig {
    /// Ref prefix lock refs are created under.
    #[serde(rename = "ref", default = "default_locks_ref")]
    pub ref_prefix: String,

    /// Stale-lock threshold in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            ref_prefix: default_locks_ref(),
            timeout_ms: default_lock_timeout_ms(),
        }
    }
}

fn default_locks_ref() -> String {
    refs::LOCK_PREFIX.to_owned()
}

const fn default_lock_timeout_ms() -> u64 {
    30_000
}

/// Daemon pacing and bounds.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Tick interval in milliseconds.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    /// Initial window in seconds when a worktree has no watermark.
    #[serde(default = "default_lookback_s")]
    pub lookback_s: u64,

    /// Cap on invocations per tick per worktree.
    #[serde(default = "default_max_per_tick")]
    pub max_per_tick: usize,

    /// Configured cap on parallel worktree workers. The effective value is
    /// `min(worktree count, this, available CPUs)`.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
            lookback_s: default_lookback_s(),
            max_per_tick: default_max_per_tick(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

const fn default_poll_ms() -> u64 {
    1500
}

const fn default_lookback_s() -> u64 {
    600
}

const fn default_max_per_tick() -> usize {
    50
}

const fn default_max_concurrency() -> usize {
    8
}

/// Determinism switches.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Timezone forced into child environments. Always `UTC`; present so a
    /// config that spells it out round-trips.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Enforce `TZ=UTC`, `LANG=C` and the injected clock.
    #[serde(default = "default_deterministic")]
    pub deterministic: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            deterministic: default_deterministic(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_owned()
}

const fn default_deterministic() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A configuration file could not be loaded or parsed.
#[derive(Debug)]
pub struct ConfigError {
    pub path: Option<PathBuf>,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(
                f,
                "configuration error in '{}': {}\n  To fix: edit the config file and correct the issue.",
                p.display(),
                self.message
            ),
            None => write!(f, "configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.jobs.dir, "jobs");
        assert_eq!(cfg.events.directory, "events");
        assert_eq!(cfg.receipts.notes_ref, "refs/notes/gitvan/results");
        assert_eq!(cfg.locks.ref_prefix, "refs/gitvan/locks");
        assert_eq!(cfg.locks.timeout_ms, 30_000);
        assert_eq!(cfg.daemon.poll_ms, 1500);
        assert_eq!(cfg.daemon.lookback_s, 600);
        assert_eq!(cfg.daemon.max_per_tick, 50);
        assert_eq!(cfg.runtime.timezone, "UTC");
        assert!(cfg.runtime.deterministic);
    }

    #[test]
    fn parses_partial_config() {
        let cfg: Config = toml::from_str(
            r#"
            [daemon]
            poll_ms = 250

            [receipts]
            ref = "refs/notes/custom/results"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.daemon.poll_ms, 250);
        assert_eq!(cfg.daemon.max_per_tick, 50);
        assert_eq!(cfg.receipts.notes_ref, "refs/notes/custom/results");
    }

    #[test]
    fn rejects_unknown_keys() {
        let result: Result<Config, _> = toml::from_str("pollMs = 100\n");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unknown_nested_keys() {
        let result: Result<Config, _> = toml::from_str("[daemon]\nticks = 3\n");
        assert!(result.is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = std::env::temp_dir().join("gitvan-config-absent-test");
        let _ = std::fs::create_dir_all(&dir);
        let cfg = Config::load(&dir).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn root_prefers_configured_dir() {
        let mut cfg = Config::default();
        assert_eq!(cfg.root(Path::new("/cwd")), PathBuf::from("/cwd"));
        cfg.root_dir = Some(PathBuf::from("/repo"));
        assert_eq!(cfg.root(Path::new("/cwd")), PathBuf::from("/repo"));
    }
}
