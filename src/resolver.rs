use crate::track::{SourceRef, Track};
use std::path::{Path, PathBuf};

/// A playable handle produced by resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    /// Remote reference, passed through untouched.
    Url(String),
    /// Local file ready for decoding.
    File(PathBuf),
}

/// Turns a track's source reference into something playable.
/// Url and Local references pass through; Library references are fetched
/// from a content-addressed local store.
pub trait SourceResolver {
    fn resolve(&self, track: &Track) -> Result<ResolvedSource, String>;
}

/// Resolver backed by a store directory whose files are named by track key.
pub struct StoreResolver {
    store_dir: PathBuf,
}

impl StoreResolver {
    pub fn new(store_dir: PathBuf) -> Self {
        StoreResolver { store_dir }
    }

    fn lookup(&self, key: &str) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.store_dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let stem = match path.file_stem() {
                Some(s) => s.to_string_lossy().to_string(),
                None => continue,
            };
            if stem == key {
                return Some(path);
            }
        }
        None
    }
}

impl SourceResolver for StoreResolver {
    fn resolve(&self, track: &Track) -> Result<ResolvedSource, String> {
        match &track.source {
            SourceRef::Url(url) => Ok(ResolvedSource::Url(url.clone())),
            SourceRef::Local(path) => {
                if path.exists() {
                    Ok(ResolvedSource::File(path.clone()))
                } else {
                    Err(format!("Track file not found: {}", path.display()))
                }
            }
            SourceRef::Library(key) => self
                .lookup(key)
                .map(ResolvedSource::File)
                .ok_or_else(|| {
                    format!(
                        "No stored media for key '{}' in {}",
                        key,
                        self.store_dir.display()
                    )
                }),
        }
    }
}

/// Resolver that trusts references without touching the filesystem. Used
/// when the host materializes media itself (and by headless tests).
pub struct PassthroughResolver;

impl SourceResolver for PassthroughResolver {
    fn resolve(&self, track: &Track) -> Result<ResolvedSource, String> {
        match &track.source {
            SourceRef::Url(url) => Ok(ResolvedSource::Url(url.clone())),
            SourceRef::Local(path) => Ok(ResolvedSource::File(path.clone())),
            SourceRef::Library(key) => Err(format!(
                "Library key '{}' requires a store-backed resolver",
                key
            )),
        }
    }
}

/// Verify a store directory is still readable. Loss of access disables the
/// library path without interrupting playout.
pub fn verify_store_access(store_dir: &Path) -> bool {
    std::fs::read_dir(store_dir).is_ok()
}
