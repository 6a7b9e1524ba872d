//! Per-stage memoization of source file identities.
//!
//! A [`CacheStore`] remembers, for every file a stage processed successfully,
//! the [`Fingerprint`] it had at the time. A file needs processing again when
//! its current fingerprint differs, when it has no entry, or when its entry
//! was invalidated.
//!
//! # Scopes
//!
//! Entries live in named scopes. A scope is dropped as a whole with
//! [`CacheStore::invalidate_scope`], e.g. every rendered page when the site
//! data changes.
//!
//! # Generations
//!
//! Invalidation may happen while a stage is running. Each scope carries a
//! generation counter that every invalidation bumps. A runner takes a
//! [`Generation`] before selecting files and passes it back to
//! [`CacheStore::record`]; records made against an outdated generation are
//! refused so the file is processed again on the next pass.
//!
//! ```text
//!  runner                       orchestrator
//!  ──────                       ────────────
//!  gen = generation("html")
//!  should_process(page) ─ true
//!                               invalidate_scope("html")   (gen + 1)
//!  record(page, gen) ── refused
//! ```

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};

/// Identity of a source file at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    /// blake3 digest of the file content.
    Digest([u8; 32]),
    /// Modification time and length, without reading the content.
    Modified { mtime: SystemTime, len: u64 },
}

impl Fingerprint {
    pub fn of_content(content: &[u8]) -> Self {
        Self::Digest(*blake3::hash(content).as_bytes())
    }

    pub fn of_metadata(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self::Modified {
            mtime: meta.modified()?,
            len: meta.len(),
        })
    }
}

/// How a stage fingerprints its sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Identity {
    /// Hash the content. Survives `git checkout` and editor touch-saves.
    #[default]
    Content,
    /// Compare modification time and length. Used for large binary inputs.
    Modified,
}

impl Identity {
    /// Whether [`Identity::fingerprint`] needs the file content.
    pub const fn reads_content(self) -> bool {
        matches!(self, Self::Content)
    }

    /// Fingerprint a file. `content` is ignored for [`Identity::Modified`].
    pub fn fingerprint(self, path: &Path, content: &[u8]) -> io::Result<Fingerprint> {
        match self {
            Self::Content => Ok(Fingerprint::of_content(content)),
            Self::Modified => Fingerprint::of_metadata(path),
        }
    }
}

/// Snapshot of a scope's invalidation counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

#[derive(Debug, Default)]
struct Scope {
    generation: u64,
    entries: FxHashMap<PathBuf, Fingerprint>,
}

/// Thread-safe cache of processed file identities.
///
/// All methods take `&self` so a stage can record from parallel workers
/// while the orchestrator invalidates from another thread.
#[derive(Debug, Default)]
pub struct CacheStore {
    scopes: RwLock<FxHashMap<String, Scope>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation of `scope`.
    pub fn generation(&self, scope: &str) -> Generation {
        let scopes = self.scopes.read();
        Generation(scopes.get(scope).map_or(0, |s| s.generation))
    }

    /// Whether `path` must be processed given its current fingerprint.
    ///
    /// A miss is a normal outcome, never an error.
    pub fn should_process(&self, scope: &str, path: &Path, fingerprint: &Fingerprint) -> bool {
        let scopes = self.scopes.read();
        scopes
            .get(scope)
            .and_then(|s| s.entries.get(path))
            .is_none_or(|cached| cached != fingerprint)
    }

    /// Remember that `path` was processed with `fingerprint`.
    ///
    /// Returns `false` and records nothing when `scope` was invalidated
    /// since `generation` was taken.
    pub fn record(
        &self,
        scope: &str,
        path: &Path,
        fingerprint: Fingerprint,
        generation: Generation,
    ) -> bool {
        let mut scopes = self.scopes.write();
        let entry = scopes.entry(scope.to_owned()).or_default();
        if entry.generation != generation.0 {
            return false;
        }
        entry.entries.insert(path.to_path_buf(), fingerprint);
        true
    }

    /// Drop a single entry, e.g. because one of its imports changed.
    pub fn invalidate(&self, scope: &str, path: &Path) {
        let mut scopes = self.scopes.write();
        if let Some(entry) = scopes.get_mut(scope)
            && entry.entries.remove(path).is_some()
        {
            entry.generation += 1;
        }
    }

    /// Drop every entry of `scope`.
    pub fn invalidate_scope(&self, scope: &str) {
        let mut scopes = self.scopes.write();
        let entry = scopes.entry(scope.to_owned()).or_default();
        entry.entries.clear();
        entry.generation += 1;
    }

    /// Number of entries cached in `scope`.
    pub fn len(&self, scope: &str) -> usize {
        self.scopes.read().get(scope).map_or(0, |s| s.entries.len())
    }

    pub fn is_empty(&self, scope: &str) -> bool {
        self.len(scope) == 0
    }
}
