//! The ambient execution context.
//!
//! A [`Context`] carries `{cwd, env, now, config}` for everything that runs
//! under it: git driver construction, job execution, receipt timestamps.
//! [`with_context`] establishes a dynamically scoped region — nested lookups
//! of [`current`] see the innermost context, scopes nest, and the prior value
//! is restored on every exit path including panics.
//!
//! Determinism lives here: `now()` is injectable (and forced by the
//! `GITVAN_NOW` environment variable), and [`Context::child_env`] is the one
//! place that stamps `TZ=UTC` / `LANG=C` into spawned processes.
//!
//! The scope stack is thread-local. Worker threads do not inherit it; the
//! daemon explicitly re-enters the context inside each worker closure, which
//! also keeps parallel tests isolated.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::Config;

/// Environment variable that freezes the injected clock (RFC 3339).
pub const GITVAN_NOW: &str = "GITVAN_NOW";

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Process-scoped execution context.
#[derive(Clone, Debug)]
pub struct Context {
    /// Working directory: repository root for the driver, discovery base.
    pub cwd: PathBuf,
    /// Extra environment entries applied to every spawned child.
    pub env: BTreeMap<String, String>,
    /// Engine configuration.
    pub config: Arc<Config>,
    now_override: Option<DateTime<Utc>>,
}

impl Context {
    /// Build a context for `cwd`, honoring `GITVAN_NOW` from the process
    /// environment when it parses as RFC 3339.
    #[must_use]
    pub fn new(cwd: impl Into<PathBuf>, config: Arc<Config>) -> Self {
        let now_override = std::env::var(GITVAN_NOW)
            .ok()
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|t| t.with_timezone(&Utc));
        Self {
            cwd: cwd.into(),
            env: BTreeMap::new(),
            config,
            now_override,
        }
    }

    /// Pin the clock to a fixed instant (tests, replay).
    #[must_use]
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now_override = Some(now);
        self
    }

    /// Add an environment entry for spawned children.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The current instant: the injected clock if pinned, wall-clock UTC
    /// otherwise.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.now_override.unwrap_or_else(Utc::now)
    }

    /// `now()` rendered as RFC 3339 UTC with a `Z` suffix.
    #[must_use]
    pub fn now_iso(&self) -> String {
        self.now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Environment entries for child processes: the context's own entries
    /// with `TZ=UTC` and `LANG=C` forced last, replacing any caller-supplied
    /// values.
    #[must_use]
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .env
            .iter()
            .filter(|(k, _)| k.as_str() != "TZ" && k.as_str() != "LANG")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("TZ".to_owned(), "UTC".to_owned()));
        env.push(("LANG".to_owned(), "C".to_owned()));
        env
    }

    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }
}

// ---------------------------------------------------------------------------
// Dynamic scoping
// ---------------------------------------------------------------------------

thread_local! {
    static SCOPE: RefCell<Vec<Arc<Context>>> = const { RefCell::new(Vec::new()) };
}

/// Pops the scope on drop, so the prior context is restored even when `f`
/// panics.
struct ScopeGuard;

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Run `f` with `ctx` as the current context for this thread.
pub fn with_context<T>(ctx: Arc<Context>, f: impl FnOnce() -> T) -> T {
    SCOPE.with(|stack| stack.borrow_mut().push(ctx));
    let _guard = ScopeGuard;
    f()
}

/// The innermost context established by [`with_context`] on this thread, if
/// any.
#[must_use]
pub fn current() -> Option<Arc<Context>> {
    SCOPE.with(|stack| stack.borrow().last().cloned())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(cwd: &str) -> Arc<Context> {
        Arc::new(Context::new(cwd, Arc::new(Config::default())))
    }

    #[test]
    fn no_context_outside_scope() {
        assert!(current().is_none());
    }

    #[test]
    fn scopes_nest_and_restore() {
        let outer = ctx("/outer");
        let inner = ctx("/inner");
        with_context(outer.clone(), || {
            assert_eq!(current().unwrap().cwd, PathBuf::from("/outer"));
            with_context(inner.clone(), || {
                assert_eq!(current().unwrap().cwd, PathBuf::from("/inner"));
            });
            assert_eq!(current().unwrap().cwd, PathBuf::from("/outer"));
        });
        assert!(current().is_none());
    }

    #[test]
    fn scope_restored_after_panic() {
        let outer = ctx("/outer");
        with_context(outer, || {
            let result = std::panic::catch_unwind(|| {
                with_context(ctx("/doomed"), || panic!("boom"));
            });
            assert!(result.is_err());
            assert_eq!(current().unwrap().cwd, PathBuf::from("/outer"));
        });
    }

    #[test]
    fn pinned_clock_is_returned() {
        let t = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        let c = Context::new("/repo", Arc::new(Config::default())).with_now(t);
        assert_eq!(c.now(), t);
        assert_eq!(c.now_iso(), "2024-01-15T10:30:00Z");
    }

    #[test]
    fn child_env_forces_tz_and_lang() {
        let c = Context::new("/repo", Arc::new(Config::default()))
            .with_env("TZ", "America/New_York")
            .with_env("FOO", "bar");
        let env = c.child_env();
        let get = |k: &str| {
            env.iter()
                .rev()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("TZ"), Some("UTC"));
        assert_eq!(get("LANG"), Some("C"));
        assert_eq!(get("FOO"), Some("bar"));
        // the caller-supplied TZ never survives
        assert_eq!(env.iter().filter(|(k, _)| k == "TZ").count(), 1);
    }

    #[test]
    fn wall_clock_when_not_pinned() {
        let c = Context::new("/repo", Arc::new(Config::default()));
        let before = Utc::now();
        let now = c.now();
        assert!(now >= before);
    }
}
