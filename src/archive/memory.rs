use super::{check_generation, Archive, ArchiveError, Record};
use crate::vpath;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone)]
struct Entry {
    path: String,
    data: Vec<u8>,
}

/// Flat indexed bundle held entirely in memory.
///
/// Writes land immediately; [`save`](Archive::save) only bumps the record
/// generation and the save counter, which makes it handy for asserting that
/// a batch saved exactly once.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    entries: BTreeMap<String, Entry>,
    read_only: HashSet<String>,
    generation: u64,
    saves: usize,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, P, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, D)>,
        P: Into<String>,
        D: Into<Vec<u8>>,
    {
        let mut archive = Self::new();
        for (path, data) in entries {
            archive.insert(path, data);
        }
        archive
    }

    /// Add or replace an entry outside of the record protocol.
    pub fn insert(&mut self, path: impl Into<String>, data: impl Into<Vec<u8>>) {
        let path = vpath::normalize(&path.into());
        self.entries.insert(
            vpath::key(&path),
            Entry {
                path,
                data: data.into(),
            },
        );
    }

    /// Current bytes of an entry.
    pub fn contents(&self, path: &str) -> Option<&[u8]> {
        self.entries
            .get(&vpath::key(path))
            .map(|entry| entry.data.as_slice())
    }

    /// Current entry decoded as UTF-8, lossily.
    pub fn text(&self, path: &str) -> Option<String> {
        self.contents(path)
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    /// Reject writes to one entry.
    pub fn set_read_only(&mut self, path: &str) {
        self.read_only.insert(vpath::key(path));
    }

    pub fn save_count(&self) -> usize {
        self.saves
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Archive for MemoryArchive {
    fn records(&self) -> Vec<Record> {
        self.entries
            .values()
            .map(|entry| Record::new(entry.path.clone(), entry.data.len() as u64, self.generation))
            .collect()
    }

    fn find(&self, path: &str) -> Option<Record> {
        self.entries
            .get(&vpath::key(path))
            .map(|entry| Record::new(entry.path.clone(), entry.data.len() as u64, self.generation))
    }

    fn read(&self, record: &Record) -> Result<Vec<u8>, ArchiveError> {
        check_generation(record, self.generation)?;
        self.entries
            .get(&vpath::key(record.path()))
            .map(|entry| entry.data.clone())
            .ok_or_else(|| ArchiveError::MissingRecord(record.path().to_string()))
    }

    fn write(&mut self, record: &Record, data: &[u8]) -> Result<(), ArchiveError> {
        check_generation(record, self.generation)?;
        let key = vpath::key(record.path());
        if self.read_only.contains(&key) {
            return Err(ArchiveError::ReadOnly(record.path().to_string()));
        }
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| ArchiveError::MissingRecord(record.path().to_string()))?;
        entry.data = data.to_vec();
        Ok(())
    }

    fn save(&mut self) -> Result<(), ArchiveError> {
        self.generation += 1;
        self.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_is_case_insensitive() {
        let archive = MemoryArchive::from_entries([("Shaders/Fog.hlsl", "x")]);
        let record = archive.find("shaders\\fog.HLSL").unwrap();
        assert_eq!(record.path(), "Shaders/Fog.hlsl");
        assert_eq!(record.size(), 1);
    }

    #[test]
    fn test_write_then_read() {
        let mut archive = MemoryArchive::from_entries([("a.txt", "old")]);
        let record = archive.find("a.txt").unwrap();
        archive.write(&record, b"new").unwrap();
        assert_eq!(archive.read(&record).unwrap(), b"new");
    }

    #[test]
    fn test_save_invalidates_records() {
        let mut archive = MemoryArchive::from_entries([("a.txt", "old")]);
        let record = archive.find("a.txt").unwrap();
        archive.save().unwrap();

        assert!(matches!(
            archive.read(&record),
            Err(ArchiveError::StaleRecord { .. })
        ));
        assert!(matches!(
            archive.write(&record, b"x"),
            Err(ArchiveError::StaleRecord { .. })
        ));

        let fresh = archive.find("a.txt").unwrap();
        assert_eq!(archive.read(&fresh).unwrap(), b"old");
        assert_eq!(archive.save_count(), 1);
    }

    #[test]
    fn test_read_only_entry_rejects_writes() {
        let mut archive = MemoryArchive::from_entries([("a.txt", "old")]);
        archive.set_read_only("A.TXT");
        let record = archive.find("a.txt").unwrap();
        assert!(matches!(
            archive.write(&record, b"x"),
            Err(ArchiveError::ReadOnly(_))
        ));
    }
}
