//! Durable first-touch backup store and marker registry.
//!
//! Backups live on disk under a root directory that mirrors the archive's
//! virtual paths: the pristine bytes of `shaders/postfx/fog.hlsl` are kept at
//! `<root>/shaders/postfx/fog.hlsl`. Directory existence is the only
//! bookkeeping. An entry is written at most once, by whichever patch touches
//! the path first, and is never overwritten afterwards.

use crate::archive::dir::atomic_write;
use crate::log::{PatchLogExt, SharedLog};
use crate::marker::Marker;
use crate::vpath;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("invalid backup path '{0}'")]
    InvalidPath(String),

    #[error("backup I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BackupError {
    fn io(path: &Path, source: io::Error) -> Self {
        BackupError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Registered markers found in one file's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyState {
    pub path: String,
    pub markers: Vec<Marker>,
    pub is_dirty: bool,
}

/// Markers present in `text`, paired with the dirty verdict for `path`.
///
/// A path is dirty when it carries at least one marker but has no backup to
/// restore it from.
pub fn dirty_state<'a>(
    path: &str,
    text: &str,
    markers: impl IntoIterator<Item = &'a Marker>,
    has_backup: bool,
) -> DirtyState {
    let found: Vec<Marker> = markers
        .into_iter()
        .filter(|marker| marker.is_in(text))
        .cloned()
        .collect();
    let is_dirty = !found.is_empty() && !has_backup;
    DirtyState {
        path: path.to_string(),
        markers: found,
        is_dirty,
    }
}

#[derive(Debug, Default)]
struct Inner {
    markers: BTreeMap<String, Marker>,
}

pub struct BackupStore {
    root: PathBuf,
    inner: Mutex<Inner>,
    log: SharedLog,
}

impl std::fmt::Debug for BackupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl BackupStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, log: SharedLog) -> Result<Self, BackupError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| BackupError::io(&root, e))?;
        Ok(Self {
            root,
            inner: Mutex::new(Inner::default()),
            log,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, path: &str) -> Result<PathBuf, BackupError> {
        let normalized = vpath::normalize(path);
        let mut out = self.root.clone();
        let mut parts = 0;
        for part in normalized.split('/') {
            if part.is_empty() || part == "." {
                continue;
            }
            let component = Path::new(part);
            if !matches!(component.components().next(), Some(Component::Normal(_)))
                || component.components().count() != 1
            {
                return Err(BackupError::InvalidPath(path.to_string()));
            }
            out.push(part);
            parts += 1;
        }
        if parts == 0 {
            return Err(BackupError::InvalidPath(path.to_string()));
        }
        Ok(out)
    }

    pub fn has_backup(&self, path: &str) -> bool {
        let _guard = self.inner.lock();
        self.entry_path(path).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Store `data` as the original of `path` unless an entry already exists.
    /// Returns whether a new entry was created.
    pub fn backup(&self, path: &str, data: &[u8]) -> Result<bool, BackupError> {
        self.backup_with(path, || Ok::<_, BackupError>(data.to_vec()))
    }

    /// Like [`backup`](Self::backup), but only produces the bytes when the
    /// entry is missing. The existence check, the read and the write happen
    /// under the store lock, so two threads racing on one path create it
    /// exactly once.
    pub fn backup_with<F, E>(&self, path: &str, produce: F) -> Result<bool, E>
    where
        F: FnOnce() -> Result<Vec<u8>, E>,
        E: From<BackupError>,
    {
        let _guard = self.inner.lock();
        let target = self.entry_path(path)?;
        if target.is_file() {
            return Ok(false);
        }
        let data = produce()?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| BackupError::io(parent, e))?;
        }
        atomic_write(&target, &data).map_err(|e| BackupError::io(&target, e))?;
        self.log.debug(format!("Backed up {path} ({} bytes)", data.len()));
        Ok(true)
    }

    pub fn get(&self, path: &str) -> Result<Option<Vec<u8>>, BackupError> {
        let _guard = self.inner.lock();
        let target = self.entry_path(path)?;
        match fs::read(&target) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackupError::io(&target, e)),
        }
    }

    /// Delete one entry and prune any ancestor directories it leaves empty,
    /// stopping at the store root.
    pub fn remove(&self, path: &str) -> Result<bool, BackupError> {
        let _guard = self.inner.lock();
        let target = self.entry_path(path)?;
        match fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(BackupError::io(&target, e)),
        }

        let mut dir = target.parent().map(Path::to_path_buf);
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            let is_empty = fs::read_dir(&current)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if !is_empty || fs::remove_dir(&current).is_err() {
                break;
            }
            dir = current.parent().map(Path::to_path_buf);
        }
        Ok(true)
    }

    /// Virtual paths of every stored entry, sorted.
    pub fn list_all(&self) -> Result<Vec<String>, BackupError> {
        let _guard = self.inner.lock();
        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.root).to_path_buf();
                BackupError::Io {
                    path,
                    source: e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("directory walk failed")),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                paths.push(vpath::normalize(&relative.to_string_lossy()));
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub fn has_any(&self) -> bool {
        let _guard = self.inner.lock();
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .any(|entry| entry.file_type().is_file())
    }

    /// Delete every entry. Returns how many were removed.
    pub fn clear_all(&self) -> Result<usize, BackupError> {
        let count = self.list_all()?.len();
        let _guard = self.inner.lock();
        let entries = fs::read_dir(&self.root).map_err(|e| BackupError::io(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| BackupError::io(&self.root, e))?;
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|e| BackupError::io(&path, e))?;
        }
        self.log.info(format!("Cleared {count} backup(s)"));
        Ok(count)
    }

    pub fn register_marker(&self, patch_id: &str, marker: Marker) {
        self.inner.lock().markers.insert(patch_id.to_string(), marker);
    }

    /// Registered `(patch id, marker)` pairs.
    pub fn markers(&self) -> Vec<(String, Marker)> {
        self.inner
            .lock()
            .markers
            .iter()
            .map(|(id, marker)| (id.clone(), marker.clone()))
            .collect()
    }

    fn marker_list(&self) -> Vec<Marker> {
        self.inner.lock().markers.values().cloned().collect()
    }

    /// Registered markers present in `text`.
    pub fn check_markers(&self, text: &str) -> Vec<Marker> {
        self.marker_list()
            .into_iter()
            .filter(|marker| marker.is_in(text))
            .collect()
    }

    pub fn check_dirty(&self, path: &str, text: &str) -> DirtyState {
        let markers = self.marker_list();
        dirty_state(path, text, &markers, self.has_backup(path))
    }
}

/// Backup mode for an engine: one durable store, or explicitly none.
#[derive(Debug, Clone)]
pub enum Backups {
    Durable(Arc<BackupStore>),
    Disabled,
}

impl Backups {
    pub fn store(&self) -> Option<&Arc<BackupStore>> {
        match self {
            Backups::Durable(store) => Some(store),
            Backups::Disabled => None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Backups::Durable(_))
    }

    pub fn has_backup(&self, path: &str) -> bool {
        self.store().is_some_and(|store| store.has_backup(path))
    }
}
