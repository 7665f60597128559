//! Per-batch overlay of pending edits.

use crate::vpath;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// In-memory map of path to pending bytes, shared by every patch in one
/// orchestrated batch so later patches see earlier edits before anything is
/// written to the archive. Keys compare case-insensitively; each entry keeps
/// the spelling of the path it was first written under.
#[derive(Debug, Default)]
pub struct PatchContext {
    files: RwLock<HashMap<String, (String, Vec<u8>)>>,
}

impl PatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .read()
            .get(&vpath::key(path))
            .map(|(_, data)| data.clone())
    }

    pub fn put(&self, path: &str, data: Vec<u8>) {
        match self.files.write().entry(vpath::key(path)) {
            Entry::Occupied(mut entry) => entry.get_mut().1 = data,
            Entry::Vacant(entry) => {
                entry.insert((vpath::normalize(path), data));
            }
        }
    }

    /// Take every pending edit, leaving the context empty.
    pub fn drain(&self) -> Vec<(String, Vec<u8>)> {
        let mut drained: Vec<(String, Vec<u8>)> =
            self.files.write().drain().map(|(_, entry)| entry).collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_case_insensitive() {
        let ctx = PatchContext::new();
        ctx.put("Shaders/Fog.hlsl", b"one".to_vec());
        ctx.put("shaders\\fog.HLSL", b"two".to_vec());

        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.get("SHADERS/FOG.HLSL").unwrap(), b"two");
        assert_eq!(ctx.drain()[0].0, "Shaders/Fog.hlsl");
    }

    #[test]
    fn test_drain_empties_context() {
        let ctx = PatchContext::new();
        ctx.put("b.txt", b"b".to_vec());
        ctx.put("a.txt", b"a".to_vec());

        let drained = ctx.drain();
        assert_eq!(drained[0].0, "a.txt");
        assert_eq!(drained.len(), 2);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_concurrent_puts() {
        let ctx = PatchContext::new();
        std::thread::scope(|scope| {
            for i in 0..8 {
                let ctx = &ctx;
                scope.spawn(move || ctx.put(&format!("file{i}.txt"), vec![i as u8]));
            }
        });
        assert_eq!(ctx.len(), 8);
    }
}
