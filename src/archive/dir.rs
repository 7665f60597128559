use super::{check_generation, Archive, ArchiveError, Record};
use crate::vpath;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
struct Entry {
    path: String,
    size: u64,
}

/// Directory-tree container: every regular file under `root` is an entry
/// whose virtual path is its root-relative path with `/` separators.
///
/// Writes are staged in memory and only reach disk on
/// [`save`](Archive::save), each file replaced atomically.
#[derive(Debug)]
pub struct DirectoryArchive {
    root: PathBuf,
    entries: BTreeMap<String, Entry>,
    pending: BTreeMap<String, Vec<u8>>,
    generation: u64,
}

impl DirectoryArchive {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let root = root.as_ref();
        if !root.exists() {
            return Err(ArchiveError::NotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(ArchiveError::InvalidFormat {
                path: root.to_path_buf(),
                reason: "expected a directory".to_string(),
            });
        }

        let mut archive = Self {
            root: root.to_path_buf(),
            entries: BTreeMap::new(),
            pending: BTreeMap::new(),
            generation: 0,
        };
        archive.rescan()?;
        Ok(archive)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of staged, unsaved writes.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    fn rescan(&mut self) -> Result<(), ArchiveError> {
        self.entries.clear();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.root).to_path_buf();
                ArchiveError::Io {
                    path,
                    source: e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let path = vpath::normalize(&relative.to_string_lossy());
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            self.entries.insert(vpath::key(&path), Entry { path, size });
        }
        Ok(())
    }

    fn disk_path(&self, virtual_path: &str) -> PathBuf {
        virtual_path
            .split('/')
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }
}

impl Archive for DirectoryArchive {
    fn records(&self) -> Vec<Record> {
        self.entries
            .iter()
            .map(|(key, entry)| {
                let size = self
                    .pending
                    .get(key)
                    .map(|data| data.len() as u64)
                    .unwrap_or(entry.size);
                Record::new(entry.path.clone(), size, self.generation)
            })
            .collect()
    }

    fn find(&self, path: &str) -> Option<Record> {
        let key = vpath::key(path);
        self.entries.get(&key).map(|entry| {
            let size = self
                .pending
                .get(&key)
                .map(|data| data.len() as u64)
                .unwrap_or(entry.size);
            Record::new(entry.path.clone(), size, self.generation)
        })
    }

    fn read(&self, record: &Record) -> Result<Vec<u8>, ArchiveError> {
        check_generation(record, self.generation)?;
        let key = vpath::key(record.path());
        if let Some(data) = self.pending.get(&key) {
            return Ok(data.clone());
        }
        let entry = self
            .entries
            .get(&key)
            .ok_or_else(|| ArchiveError::MissingRecord(record.path().to_string()))?;
        let path = self.disk_path(&entry.path);
        fs::read(&path).map_err(|source| ArchiveError::Io { path, source })
    }

    fn write(&mut self, record: &Record, data: &[u8]) -> Result<(), ArchiveError> {
        check_generation(record, self.generation)?;
        let key = vpath::key(record.path());
        if !self.entries.contains_key(&key) {
            return Err(ArchiveError::MissingRecord(record.path().to_string()));
        }
        self.pending.insert(key, data.to_vec());
        Ok(())
    }

    fn save(&mut self) -> Result<(), ArchiveError> {
        let pending = std::mem::take(&mut self.pending);
        for (key, data) in &pending {
            let Some(entry) = self.entries.get(key) else {
                continue;
            };
            let path = self.disk_path(&entry.path);
            atomic_write(&path, data).map_err(|source| ArchiveError::Io {
                path: path.clone(),
                source,
            })?;
            // Bump mtime so launchers that cache by timestamp notice the change.
            filetime::set_file_mtime(&path, filetime::FileTime::now())
                .map_err(|source| ArchiveError::Io { path, source })?;
        }
        self.generation += 1;
        self.rescan()
    }
}

/// Atomic file write: tempfile + fsync + rename.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Path has no parent directory",
        )
    })?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
