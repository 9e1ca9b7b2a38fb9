//! Ref naming for GitVan's `refs/gitvan/*` namespace.
//!
//! All engine state that must be shared between processes lives in git refs:
//!
//! ```text
//! refs/gitvan/
//! ├── locks/
//! │   └── <slug(name)>-<worktree-slug>-<short8(name)>   ← HEAD at acquisition
//! └── watermarks/
//!     └── <worktree-slug>                               ← last processed commit
//! refs/notes/gitvan/
//! ├── results                                           ← receipt ledger
//! └── locks                                             ← lock acquisition metadata
//! ```
//!
//! Ref names are derived, never parsed back: the slug is lossy, so anything
//! the engine needs later (holder, acquisition time) is stored in a sidecar
//! note rather than re-derived from the name.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Default ref prefix for lock refs.
pub const LOCK_PREFIX: &str = "refs/gitvan/locks";

/// Default ref prefix for per-worktree watermarks.
pub const WATERMARK_PREFIX: &str = "refs/gitvan/watermarks";

/// Default notes ref for the receipt ledger.
pub const RESULTS_REF: &str = "refs/notes/gitvan/results";

/// Notes ref carrying lock acquisition metadata.
pub const LOCK_META_REF: &str = "refs/notes/gitvan/locks";

/// The all-zero OID, used as the "must not exist" expected value in
/// create-only `update-ref` calls.
pub const ZERO_OID: &str = "0000000000000000000000000000000000000000";

/// Reduce an arbitrary string to a ref-safe slug: runs of characters outside
/// `[a-z0-9]` become single hyphens, trimmed at both ends.
#[must_use]
pub fn slug(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_hyphen = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    if out.is_empty() { "x".to_owned() } else { out }
}

/// First 8 hex characters of SHA-256, used to disambiguate lossy slugs.
#[must_use]
pub fn short_hash(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    hex::encode(digest)[..8].to_owned()
}

/// A stable, ref-safe identifier for a worktree path.
///
/// The trailing hash makes two worktrees with the same directory name (e.g.
/// `ws/build` under different parents) map to distinct refs.
#[must_use]
pub fn worktree_slug(path: &Path) -> String {
    let full = path.to_string_lossy();
    let name = path
        .file_name()
        .map_or_else(|| "root".to_owned(), |n| slug(&n.to_string_lossy()));
    format!("{name}-{}", short_hash(&full))
}

/// Build the lock ref name for `(name, worktree)` under `prefix`.
#[must_use]
pub fn lock_ref(prefix: &str, name: &str, worktree: &Path) -> String {
    format!(
        "{}/{}-{}-{}",
        prefix.trim_end_matches('/'),
        slug(name),
        worktree_slug(worktree),
        short_hash(name)
    )
}

/// Build the watermark ref name for a worktree under `prefix`.
#[must_use]
pub fn watermark_ref(prefix: &str, worktree: &Path) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), worktree_slug(worktree))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn slug_collapses_runs() {
        assert_eq!(slug("job build//deploy"), "job-build-deploy");
        assert_eq!(slug("--Weird--Name--"), "weird-name");
    }

    #[test]
    fn slug_never_empty() {
        assert_eq!(slug("///"), "x");
    }

    #[test]
    fn short_hash_is_eight_hex() {
        let h = short_hash("anything");
        assert_eq!(h.len(), 8);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn worktree_slug_distinguishes_same_basename() {
        let a = worktree_slug(&PathBuf::from("/repos/one/build"));
        let b = worktree_slug(&PathBuf::from("/repos/two/build"));
        assert_ne!(a, b);
        assert!(a.starts_with("build-"));
        assert!(b.starts_with("build-"));
    }

    #[test]
    fn lock_ref_shape() {
        let r = lock_ref(LOCK_PREFIX, "job-build", &PathBuf::from("/repo"));
        assert!(r.starts_with("refs/gitvan/locks/job-build-repo-"));
        // trailing short hash of the name
        assert!(r.ends_with(&short_hash("job-build")));
    }

    #[test]
    fn lock_ref_same_name_different_worktrees_differ() {
        let a = lock_ref(LOCK_PREFIX, "n", &PathBuf::from("/a"));
        let b = lock_ref(LOCK_PREFIX, "n", &PathBuf::from("/b"));
        assert_ne!(a, b);
    }

    #[test]
    fn watermark_ref_shape() {
        let r = watermark_ref(WATERMARK_PREFIX, &PathBuf::from("/repo/main"));
        assert!(r.starts_with("refs/gitvan/watermarks/main-"));
    }

    #[test]
    fn prefixes_tolerate_trailing_slash() {
        let r = lock_ref("refs/gitvan/locks/", "n", &PathBuf::from("/a"));
        assert!(!r.contains("//"));
    }
}
