//! Definition discovery: filesystem scanners and the path↔id grammar.
//!
//! Jobs live under `<root>/jobs/**`, events under `<root>/events/**`, static
//! schedules under `<root>/schedules/*`, all as `.toml` files. An
//! identifier is the file path relative to its root with separators
//! normalized to `/` and the extension stripped ("unrouting").
//!
//! The same grammar runs in reverse to read meaning out of an id:
//!
//! ```text
//! cron/<expr with _ for spaces>          → cron expression
//! branch|tag|path|message|author/<pat>   → pattern, decoding
//!                                          __star__ → *, __ → /, _ → space
//! merge | any                            → bare predicate kinds
//! ```
//!
//! Scanning is side-effect-free and restartable; results are sorted by id so
//! "discovery order" is stable. Loading (parsing a file) is cached per
//! `(path, content hash)` — editing a file invalidates its entry.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// The definition file extension.
pub const DEFINITION_EXT: &str = "toml";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A definition file failed to load or validate.
///
/// Definition errors are report-and-continue: one broken file never affects
/// unrelated definitions.
#[derive(Debug)]
pub enum DefinitionError {
    /// The file could not be read.
    Io { path: PathBuf, detail: String },
    /// The file is not valid TOML or does not match the schema.
    Parse { path: PathBuf, detail: String },
    /// A job file has no usable `run` section.
    MissingRun { path: PathBuf },
    /// A cron expression failed validation.
    InvalidCron {
        path: PathBuf,
        expr: String,
        reason: String,
    },
    /// A glob or regex pattern failed to compile.
    InvalidPattern {
        path: PathBuf,
        pattern: String,
        reason: String,
    },
    /// The event `type` is not a known predicate kind.
    UnknownKind { path: PathBuf, kind: String },
    /// A derived identifier failed validation.
    InvalidId { path: PathBuf, detail: String },
    /// Only UTC is supported at runtime.
    UnsupportedTimezone { path: PathBuf, tz: String },
}

impl DefinitionError {
    /// The file the error belongs to, for validation reports.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Io { path, .. }
            | Self::Parse { path, .. }
            | Self::MissingRun { path }
            | Self::InvalidCron { path, .. }
            | Self::InvalidPattern { path, .. }
            | Self::UnknownKind { path, .. }
            | Self::InvalidId { path, .. }
            | Self::UnsupportedTimezone { path, .. } => path,
        }
    }
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, detail } => {
                write!(f, "failed to read '{}': {detail}", path.display())
            }
            Self::Parse { path, detail } => {
                write!(f, "failed to parse '{}': {detail}", path.display())
            }
            Self::MissingRun { path } => {
                write!(
                    f,
                    "'{}' has no run section.\n  To fix: add `[run]` with `command = [...]` or `shell = \"...\"`.",
                    path.display()
                )
            }
            Self::InvalidCron { path, expr, reason } => {
                write!(
                    f,
                    "'{}' has an invalid cron expression {expr:?}: {reason}",
                    path.display()
                )
            }
            Self::InvalidPattern {
                path,
                pattern,
                reason,
            } => {
                write!(
                    f,
                    "'{}' has an invalid pattern {pattern:?}: {reason}",
                    path.display()
                )
            }
            Self::UnknownKind { path, kind } => {
                write!(
                    f,
                    "'{}' has unknown event type {kind:?}.\n  To fix: use one of cron, branch, path, tag, message, author, merge, any.",
                    path.display()
                )
            }
            Self::InvalidId { path, detail } => {
                write!(f, "'{}' yields an invalid id: {detail}", path.display())
            }
            Self::UnsupportedTimezone { path, tz } => {
                write!(
                    f,
                    "'{}' requests timezone {tz:?}; the runtime is UTC-only.",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for DefinitionError {}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// One discovered definition file, before loading.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    /// Absolute path of the file.
    pub path: PathBuf,
    /// Path-derived identifier (relative, `/`-separated, extension stripped).
    pub id: String,
}

/// Derive an identifier from a path relative to `base`.
///
/// Returns `None` when the path is not under `base` or has the wrong
/// extension.
#[must_use]
pub fn id_from_path(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    if path.extension().and_then(|e| e.to_str()) != Some(DEFINITION_EXT) {
        return None;
    }
    let mut segments = Vec::new();
    for component in rel.components() {
        segments.push(component.as_os_str().to_string_lossy().into_owned());
    }
    let last = segments.pop()?;
    let stem = last.strip_suffix(".toml")?;
    segments.push(stem.to_owned());
    Some(segments.join("/"))
}

/// Scan a definitions root recursively, yielding descriptors sorted by id.
///
/// A missing root is not an error — it just means no definitions.
///
/// # Errors
/// Returns a [`DefinitionError::Io`] for directory entries that cannot be
/// visited.
pub fn scan(base: &Path) -> Result<Vec<Descriptor>, DefinitionError> {
    if !base.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(base).follow_links(false) {
        let entry = entry.map_err(|e| DefinitionError::Io {
            path: e.path().map_or_else(|| base.to_path_buf(), Path::to_path_buf),
            detail: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(id) = id_from_path(base, entry.path()) {
            found.push(Descriptor {
                path: entry.path().to_path_buf(),
                id,
            });
        }
    }
    found.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(found)
}

/// Scan a flat directory (no recursion) — used for `schedules/`.
///
/// # Errors
/// Same as [`scan`].
pub fn scan_flat(base: &Path) -> Result<Vec<Descriptor>, DefinitionError> {
    if !base.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(base).max_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| DefinitionError::Io {
            path: e.path().map_or_else(|| base.to_path_buf(), Path::to_path_buf),
            detail: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(id) = id_from_path(base, entry.path()) {
            found.push(Descriptor {
                path: entry.path().to_path_buf(),
                id,
            });
        }
    }
    found.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(found)
}

// ---------------------------------------------------------------------------
// Unrouting
// ---------------------------------------------------------------------------

/// Path↔meaning grammar for identifiers.
pub mod unroute {
    /// Decode a path segment into a pattern: `__star__` → `*`, `__` → `/`,
    /// `_` → space.
    #[must_use]
    pub fn decode(segment: &str) -> String {
        // placeholder keeps the star's underscores out of the __ pass
        segment
            .replace("__star__", "\u{0}")
            .replace("__", "/")
            .replace('_', " ")
            .replace('\u{0}', "*")
    }

    /// Encode a pattern into a path segment — the inverse of [`decode`].
    #[must_use]
    pub fn encode(pattern: &str) -> String {
        pattern
            .replace('*', "\u{0}")
            .replace('/', "__")
            .replace(' ', "_")
            .replace('\u{0}', "__star__")
    }

    /// A predicate derived from an id alone.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Derived {
        /// Predicate kind: `cron`, `branch`, `path`, `tag`, `message`,
        /// `author`, `merge`, `any`.
        pub kind: String,
        /// Decoded pattern (cron expression, glob, regex) — empty for bare
        /// kinds.
        pub pattern: String,
    }

    /// Interpret an id through the grammar, when its first segment names a
    /// predicate kind.
    #[must_use]
    pub fn derive(id: &str) -> Option<Derived> {
        let (kind, rest) = match id.split_once('/') {
            Some((kind, rest)) => (kind, Some(rest)),
            None => (id, None),
        };
        match kind {
            "merge" | "any" => Some(Derived {
                kind: kind.to_owned(),
                pattern: String::new(),
            }),
            "cron" => rest.map(|r| Derived {
                kind: "cron".to_owned(),
                // a cron expression is one segment with _ for spaces
                pattern: r.replace('_', " "),
            }),
            "branch" | "tag" | "path" | "message" | "author" => rest.map(|r| Derived {
                kind: kind.to_owned(),
                pattern: r
                    .split('/')
                    .map(decode)
                    .collect::<Vec<_>>()
                    .join("/"),
            }),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Load cache
// ---------------------------------------------------------------------------

/// Content hash of a definition file, used as the cache key.
#[must_use]
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Per-process cache of parsed definitions, invalidated by content hash.
///
/// Read-mostly: the daemon consults it every tick, entries only churn when
/// files change on disk.
#[derive(Debug)]
pub struct LoadCache<T> {
    entries: HashMap<PathBuf, (String, Arc<T>)>,
}

impl<T> Default for LoadCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> LoadCache<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Load a definition through the cache. `parse` runs only when the file
    /// is new or its content hash changed.
    ///
    /// # Errors
    /// Returns read errors as [`DefinitionError::Io`] and whatever `parse`
    /// reports.
    pub fn load(
        &mut self,
        path: &Path,
        parse: impl FnOnce(&str) -> Result<T, DefinitionError>,
    ) -> Result<Arc<T>, DefinitionError> {
        let text = std::fs::read_to_string(path).map_err(|e| DefinitionError::Io {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let hash = content_hash(&text);
        if let Some((cached_hash, cached)) = self.entries.get(path)
            && *cached_hash == hash
        {
            return Ok(Arc::clone(cached));
        }
        let parsed = Arc::new(parse(&text)?);
        self.entries
            .insert(path.to_path_buf(), (hash, Arc::clone(&parsed)));
        Ok(parsed)
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // -- id derivation --

    #[test]
    fn id_from_nested_path() {
        let base = Path::new("/repo/jobs");
        let id = id_from_path(base, Path::new("/repo/jobs/deploy/docs.toml"));
        assert_eq!(id.as_deref(), Some("deploy/docs"));
    }

    #[test]
    fn id_requires_toml_extension() {
        let base = Path::new("/repo/jobs");
        assert_eq!(id_from_path(base, Path::new("/repo/jobs/a.md")), None);
    }

    // -- scanning --

    #[test]
    fn scan_missing_dir_is_empty() {
        assert!(scan(Path::new("/does/not/exist")).unwrap().is_empty());
    }

    #[test]
    fn scan_sorted_by_id_and_recursive() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("deploy")).unwrap();
        fs::write(dir.path().join("zeta.toml"), "").unwrap();
        fs::write(dir.path().join("deploy/docs.toml"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        let found = scan(dir.path()).unwrap();
        let ids: Vec<_> = found.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["deploy/docs", "zeta"]);
    }

    #[test]
    fn scan_flat_ignores_subdirs() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nightly.toml"), "").unwrap();
        fs::write(dir.path().join("nested/deep.toml"), "").unwrap();
        let found = scan_flat(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "nightly");
    }

    // -- unrouting --

    #[test]
    fn decode_star_and_separators() {
        assert_eq!(unroute::decode("src__star__"), "src*");
        assert_eq!(unroute::decode("src____star____star__"), "src/**");
        assert_eq!(unroute::decode("release__v1"), "release/v1");
        assert_eq!(unroute::decode("fix_me"), "fix me");
    }

    #[test]
    fn encode_decode_round_trip() {
        for pattern in ["src/**", "release/*", "a b/c*d", "plain"] {
            assert_eq!(unroute::decode(&unroute::encode(pattern)), pattern);
        }
    }

    #[test]
    fn derive_cron() {
        let d = unroute::derive("cron/0_3_*_*_*").unwrap();
        assert_eq!(d.kind, "cron");
        assert_eq!(d.pattern, "0 3 * * *");
    }

    #[test]
    fn derive_path_glob() {
        let d = unroute::derive("path/src____star____star__").unwrap();
        assert_eq!(d.kind, "path");
        assert_eq!(d.pattern, "src/**");
    }

    #[test]
    fn derive_bare_kinds() {
        assert_eq!(unroute::derive("merge").unwrap().kind, "merge");
        assert_eq!(unroute::derive("any").unwrap().kind, "any");
    }

    #[test]
    fn derive_unknown_kind_is_none() {
        assert!(unroute::derive("deploy/docs").is_none());
    }

    // -- load cache --

    #[test]
    fn cache_hits_until_content_changes() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("job.toml");
        fs::write(&file, "v = 1").unwrap();

        let mut cache: LoadCache<String> = LoadCache::new();
        let mut parses = 0;
        for _ in 0..3 {
            let loaded = cache
                .load(&file, |text| {
                    parses += 1;
                    Ok(text.to_owned())
                })
                .unwrap();
            assert_eq!(*loaded, "v = 1");
        }
        assert_eq!(parses, 1);

        fs::write(&file, "v = 2").unwrap();
        let loaded = cache
            .load(&file, |text| {
                parses += 1;
                Ok(text.to_owned())
            })
            .unwrap();
        assert_eq!(*loaded, "v = 2");
        assert_eq!(parses, 2);
    }

    #[test]
    fn cache_missing_file_is_io_error() {
        let mut cache: LoadCache<String> = LoadCache::new();
        let err = cache
            .load(Path::new("/absent/definitely.toml"), |t| Ok(t.to_owned()))
            .unwrap_err();
        assert!(matches!(err, DefinitionError::Io { .. }));
    }

    // -- property: encode/decode bijection over the pattern alphabet --

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_inverts_encode(pattern in "[a-z0-9/* ]{0,40}") {
                // a literal "/star/" segment collides with the encoding of
                // "*"; the grammar is lossy there by construction
                prop_assume!(!pattern.contains("star"));
                prop_assert_eq!(unroute::decode(&unroute::encode(&pattern)), pattern);
            }
        }
    }
}
