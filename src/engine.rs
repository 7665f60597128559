//! Per-patch state machine: check, apply and revert against one archive.
//!
//! Every failure inside [`PatchEngine::apply`] or [`PatchEngine::revert`] is
//! caught at the patch boundary and folded into a [`PatchOutcome`], so a bad
//! patch never takes its siblings down with it.

use crate::archive::{Archive, Record};
use crate::backup::{dirty_state, Backups, DirtyState};
use crate::cancel::RunControl;
use crate::context::PatchContext;
use crate::error::PatchError;
use crate::log::{PatchLogExt, SharedLog};
use crate::marker::Marker;
use crate::patch::{Patch, Transform};
use crate::select::select;
use crate::text::DecodedText;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchState {
    /// No target carries the marker.
    NotApplied,
    /// Marked, and every marked file has a backup.
    Applied,
    /// Marked, but at least one marked file has no backup to restore from.
    Dirty,
    /// The state could not be determined.
    Failed(String),
}

impl fmt::Display for PatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchState::NotApplied => write!(f, "not applied"),
            PatchState::Applied => write!(f, "applied"),
            PatchState::Dirty => write!(f, "dirty"),
            PatchState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Completed,
    /// One-time patch already present; nothing was touched.
    AlreadyApplied,
    /// Some marked files no longer contain the line a re-patch updates.
    NoMatchFound,
    Cancelled,
    Failed,
}

/// Result of one apply or revert.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "PatchOutcome should be checked for success/failure"]
pub struct PatchOutcome {
    pub patch_id: String,
    pub kind: OutcomeKind,
    pub files_modified: usize,
    pub error: Option<String>,
    /// Files reported by [`OutcomeKind::NoMatchFound`].
    pub unmatched: Vec<String>,
    /// The failure means the archive itself is unusable.
    pub fatal: bool,
}

impl PatchOutcome {
    fn new(patch_id: &str, kind: OutcomeKind, files_modified: usize) -> Self {
        Self {
            patch_id: patch_id.to_string(),
            kind,
            files_modified,
            error: None,
            unmatched: Vec::new(),
            fatal: false,
        }
    }

    pub fn completed(patch_id: &str, files_modified: usize) -> Self {
        Self::new(patch_id, OutcomeKind::Completed, files_modified)
    }

    pub fn already_applied(patch_id: &str) -> Self {
        Self::new(patch_id, OutcomeKind::AlreadyApplied, 0)
    }

    pub fn cancelled(patch_id: &str, files_modified: usize) -> Self {
        let mut outcome = Self::new(patch_id, OutcomeKind::Cancelled, files_modified);
        outcome.error = Some(PatchError::Cancelled { files_modified }.to_string());
        outcome
    }

    pub fn failed(patch_id: &str, files_modified: usize, error: &PatchError) -> Self {
        let mut outcome = Self::new(patch_id, OutcomeKind::Failed, files_modified);
        outcome.error = Some(error.to_string());
        outcome.fatal = error.is_fatal();
        outcome
    }

    pub fn no_match(patch_id: &str, files_modified: usize, unmatched: Vec<String>) -> Self {
        let mut outcome = Self::new(patch_id, OutcomeKind::NoMatchFound, files_modified);
        outcome.error = Some(format!(
            "no updatable line found in {} marked file(s)",
            unmatched.len()
        ));
        outcome.unmatched = unmatched;
        outcome
    }

    pub fn success(&self) -> bool {
        matches!(
            self.kind,
            OutcomeKind::Completed | OutcomeKind::AlreadyApplied
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == OutcomeKind::Cancelled
    }
}

impl fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = &self.patch_id;
        let n = self.files_modified;
        match self.kind {
            OutcomeKind::Completed => write!(f, "{id}: {n} file(s) modified"),
            OutcomeKind::AlreadyApplied => write!(f, "{id}: already applied"),
            OutcomeKind::NoMatchFound => write!(
                f,
                "{id}: {n} file(s) modified, no match in {}",
                self.unmatched.join(", ")
            ),
            OutcomeKind::Cancelled => write!(f, "{id}: cancelled after {n} file(s)"),
            OutcomeKind::Failed => write!(
                f,
                "{id}: failed after {n} file(s): {}",
                self.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

/// Drives check, apply and revert for individual patches.
#[derive(Clone)]
pub struct PatchEngine {
    backups: Backups,
    log: SharedLog,
    control: RunControl,
}

impl fmt::Debug for PatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchEngine")
            .field("backups", &self.backups)
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

impl PatchEngine {
    pub fn new(backups: Backups, log: SharedLog) -> Self {
        Self {
            backups,
            log,
            control: RunControl::default(),
        }
    }

    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = control;
        self
    }

    pub fn backups(&self) -> &Backups {
        &self.backups
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn log(&self) -> &SharedLog {
        &self.log
    }

    /// Same engine, writing no backups. Used for dry runs.
    pub(crate) fn without_backups(&self) -> Self {
        Self {
            backups: Backups::Disabled,
            ..self.clone()
        }
    }

    pub fn register(&self, patch: &Patch) {
        if let Some(store) = self.backups.store() {
            store.register_marker(patch.id(), patch.marker().clone());
        }
    }

    fn known_markers(&self, patch: &Patch) -> Vec<Marker> {
        let mut markers: Vec<Marker> = self
            .backups
            .store()
            .map(|store| store.markers().into_iter().map(|(_, m)| m).collect())
            .unwrap_or_default();
        if !markers.contains(patch.marker()) {
            markers.push(patch.marker().clone());
        }
        markers
    }

    /// Current text of `record`, preferring the batch overlay. Undecodable
    /// files yield `Ok(None)`.
    fn read_text(
        &self,
        archive: &dyn Archive,
        ctx: Option<&PatchContext>,
        record: &Record,
    ) -> Result<Option<DecodedText>, PatchError> {
        let path = record.path();
        let bytes = match ctx.and_then(|ctx| ctx.get(path)) {
            Some(bytes) => bytes,
            None => archive.read(record).map_err(|source| PatchError::Read {
                path: path.to_string(),
                source,
            })?,
        };
        match DecodedText::decode(&bytes, path) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(e) => {
                self.log.debug(format!("Skipping undecodable {path}: {e}"));
                Ok(None)
            }
        }
    }

    /// Paths the marker probe looks at: the marker file alone when one is
    /// declared, otherwise every selected target.
    fn probe_records(&self, patch: &Patch, archive: &dyn Archive) -> Vec<Record> {
        match patch.descriptor().marker_file.as_deref() {
            Some(file) => archive.find(file).into_iter().collect(),
            None => select(archive, &patch.descriptor().targets),
        }
    }

    /// Whether the patch's marker is present. Stops at the first hit.
    pub fn check_applied(
        &self,
        patch: &Patch,
        archive: &dyn Archive,
        ctx: Option<&PatchContext>,
    ) -> bool {
        self.probe_records(patch, archive).iter().any(|record| {
            match self.read_text(archive, ctx, record) {
                Ok(Some(decoded)) => patch.marker().is_in(&decoded.text),
                Ok(None) => false,
                Err(e) => {
                    self.log.debug(format!("[{}] {e}", patch.id()));
                    false
                }
            }
        })
    }

    pub fn check_state(
        &self,
        patch: &Patch,
        archive: &dyn Archive,
        ctx: Option<&PatchContext>,
    ) -> PatchState {
        let mut marked = Vec::new();
        for record in self.probe_records(patch, archive) {
            match self.read_text(archive, ctx, &record) {
                Ok(Some(decoded)) if patch.marker().is_in(&decoded.text) => {
                    marked.push(record.path().to_string());
                }
                Ok(_) => {}
                Err(e) => return PatchState::Failed(e.to_string()),
            }
        }
        if marked.is_empty() {
            PatchState::NotApplied
        } else if marked.iter().all(|path| self.backups.has_backup(path)) {
            PatchState::Applied
        } else {
            PatchState::Dirty
        }
    }

    /// Dirty files among the patch's targets: marked by any known patch but
    /// without a backup.
    pub fn pre_patch_check(
        &self,
        patch: &Patch,
        archive: &dyn Archive,
        ctx: Option<&PatchContext>,
    ) -> Vec<DirtyState> {
        self.register(patch);
        let markers = self.known_markers(patch);
        let Ok(records) = patch.work_list(archive) else {
            return Vec::new();
        };
        records
            .iter()
            .filter_map(|record| match self.read_text(archive, ctx, record) {
                Ok(Some(decoded)) => {
                    let path = record.path();
                    let state =
                        dirty_state(path, &decoded.text, &markers, self.backups.has_backup(path));
                    state.is_dirty.then_some(state)
                }
                _ => None,
            })
            .collect()
    }

    /// Parameter value currently written by a specialized patch.
    pub fn applied_parameter(
        &self,
        patch: &Patch,
        archive: &dyn Archive,
        ctx: Option<&PatchContext>,
    ) -> Option<f64> {
        patch.specialized_params()?;
        self.probe_records(patch, archive)
            .iter()
            .find_map(|record| match self.read_text(archive, ctx, record) {
                Ok(Some(decoded)) if patch.marker().is_in(&decoded.text) => {
                    patch.probe(&decoded.text)
                }
                _ => None,
            })
    }

    /// Apply `patch`. Writes go to `ctx` when given, else straight to the
    /// archive. The archive is never saved here.
    pub fn apply(
        &self,
        patch: &Patch,
        archive: &mut dyn Archive,
        ctx: Option<&PatchContext>,
    ) -> PatchOutcome {
        let id = patch.id();
        self.log.info(format!("[{id}] Starting patch"));
        self.register(patch);
        if !self.backups.is_enabled() {
            self.log
                .warn(format!("[{id}] Backups are disabled, changes cannot be reverted"));
        }

        if !patch.descriptor().repatch && self.check_applied(patch, &*archive, ctx) {
            self.log.info(format!("[{id}] Already applied, skipping"));
            return PatchOutcome::already_applied(id);
        }

        let records = match patch.work_list(&*archive) {
            Ok(records) => records,
            Err(e) => {
                self.log.error(format!("[{id}] {e}"));
                return PatchOutcome::failed(id, 0, &e);
            }
        };
        if records.is_empty() {
            self.log.warn(format!("[{id}] No target files found"));
            return PatchOutcome::completed(id, 0);
        }
        self.log
            .debug(format!("[{id}] {} candidate file(s)", records.len()));

        let run = FileRun {
            engine: self,
            patch,
            ctx,
            markers: self.known_markers(patch),
            archive: Mutex::new(archive),
            modified: AtomicUsize::new(0),
            unmatched: Mutex::new(Vec::new()),
        };
        let result = if patch.descriptor().parallel {
            records.par_iter().try_for_each(|record| run.visit(record))
        } else {
            records.iter().try_for_each(|record| run.visit(record))
        };

        let modified = run.modified.load(Ordering::SeqCst);
        let mut unmatched = run.unmatched.into_inner();
        unmatched.sort();
        match result {
            Ok(()) if unmatched.is_empty() => {
                self.log
                    .info(format!("[{id}] Completed, {modified} file(s) modified"));
                PatchOutcome::completed(id, modified)
            }
            Ok(()) => {
                self.log.warn(format!(
                    "[{id}] Completed with {} unmatched file(s), {modified} file(s) modified",
                    unmatched.len()
                ));
                PatchOutcome::no_match(id, modified, unmatched)
            }
            Err(PatchError::Cancelled { .. }) => {
                self.log
                    .warn(format!("[{id}] Cancelled after {modified} file(s)"));
                PatchOutcome::cancelled(id, modified)
            }
            Err(e) => PatchOutcome::failed(id, modified, &e),
        }
    }

    /// Restore every backed-up file that currently carries this patch's
    /// marker, then drop its backup.
    ///
    /// Backups are shared first-touch copies, so a file also touched by a
    /// different patch returns to its pre-any-patch bytes and that other
    /// patch no longer reports as applied either.
    pub fn revert(&self, patch: &Patch, archive: &mut dyn Archive) -> PatchOutcome {
        let id = patch.id();
        self.log.info(format!("[{id}] Reverting"));
        let Some(store) = self.backups.store() else {
            let e = PatchError::NoBackupStore;
            self.log.error(format!("[{id}] {e}"));
            return PatchOutcome::failed(id, 0, &e);
        };
        let paths = match store.list_all() {
            Ok(paths) => paths,
            Err(e) => {
                let e = PatchError::from(e);
                self.log.error(format!("[{id}] {e}"));
                return PatchOutcome::failed(id, 0, &e);
            }
        };

        let mut restored = 0;
        for path in paths {
            if self.control.is_cancelled() {
                self.log
                    .warn(format!("[{id}] Revert cancelled after {restored} file(s)"));
                return PatchOutcome::cancelled(id, restored);
            }
            self.control.report(&format!("Reverting: {path}"));

            let Some(record) = archive.find(&path) else {
                self.log
                    .debug(format!("[{id}] Backup {path} has no archive entry"));
                continue;
            };
            let result = self
                .read_text(&*archive, None, &record)
                .and_then(|decoded| match decoded {
                    Some(decoded) if patch.marker().is_in(&decoded.text) => {
                        self.restore_one(store, &mut *archive, &record)
                    }
                    _ => Ok(false),
                });
            match result {
                Ok(true) => {
                    restored += 1;
                    self.log.debug(format!("[{id}] Restored {path}"));
                }
                Ok(false) => {}
                Err(e) => {
                    self.log.error(format!(
                        "[{id}] Failed on {path} after {restored} file(s): {e}"
                    ));
                    return PatchOutcome::failed(id, restored, &e);
                }
            }
        }

        self.log
            .info(format!("[{id}] Reverted {restored} file(s)"));
        PatchOutcome::completed(id, restored)
    }

    fn restore_one(
        &self,
        store: &crate::backup::BackupStore,
        archive: &mut dyn Archive,
        record: &Record,
    ) -> Result<bool, PatchError> {
        let path = record.path();
        let Some(original) = store.get(path)? else {
            return Ok(false);
        };
        archive
            .write(record, &original)
            .map_err(|e| PatchError::write(path, e))?;
        store.remove(path)?;
        Ok(true)
    }
}

/// Shared state of one patch's file loop. All archive calls go through the
/// one lock; backups serialize on the store's own lock.
struct FileRun<'a> {
    engine: &'a PatchEngine,
    patch: &'a Patch,
    ctx: Option<&'a PatchContext>,
    markers: Vec<Marker>,
    archive: Mutex<&'a mut dyn Archive>,
    modified: AtomicUsize,
    unmatched: Mutex<Vec<String>>,
}

impl FileRun<'_> {
    fn visit(&self, record: &Record) -> Result<(), PatchError> {
        let control = self.engine.control();
        if control.is_cancelled() {
            return Err(PatchError::Cancelled {
                files_modified: self.modified.load(Ordering::SeqCst),
            });
        }
        control.report(&format!("Patching: {}", record.path()));

        self.process(record).map_err(|e| {
            self.engine.log.error(format!(
                "[{}] Failed on {} after {} file(s): {e}",
                self.patch.id(),
                record.path(),
                self.modified.load(Ordering::SeqCst)
            ));
            e
        })
    }

    fn read_archive(&self, record: &Record) -> Result<Vec<u8>, PatchError> {
        self.archive
            .lock()
            .read(record)
            .map_err(|source| PatchError::Read {
                path: record.path().to_string(),
                source,
            })
    }

    fn process(&self, record: &Record) -> Result<(), PatchError> {
        let id = self.patch.id();
        let path = record.path();
        let log = &self.engine.log;

        let bytes = match self.ctx.and_then(|ctx| ctx.get(path)) {
            Some(bytes) => bytes,
            None => self.read_archive(record)?,
        };
        let decoded = match DecodedText::decode(&bytes, path) {
            Ok(decoded) => decoded,
            Err(e) => {
                log.warn(format!("[{id}] Skipping {path}: {e}"));
                return Ok(());
            }
        };

        let updated = match self.patch.transform(path, &decoded.text) {
            Transform::Unchanged => return Ok(()),
            Transform::NoMatch => {
                log.warn(format!(
                    "[{id}] {path} is marked but the patched line was not found"
                ));
                self.unmatched.lock().push(path.to_string());
                return Ok(());
            }
            Transform::Changed(text) => text,
        };

        if let Some(store) = self.engine.backups.store() {
            if self.markers.iter().any(|m| m.is_in(&decoded.text)) {
                if !store.has_backup(path) {
                    log.warn(format!(
                        "[{id}] {path} already carries a marker but has no backup"
                    ));
                }
            } else {
                let created = store
                    .backup_with(path, || self.read_archive(record))
                    .map_err(|e| match e {
                        PatchError::Backup(e) => PatchError::write(path, e),
                        other => other,
                    })?;
                if created {
                    log.debug(format!("[{id}] Backed up {path}"));
                }
            }
        }

        let encoded = decoded.encode(&updated);
        match self.ctx {
            Some(ctx) => ctx.put(path, encoded),
            None => self
                .archive
                .lock()
                .write(record, &encoded)
                .map_err(|e| PatchError::write(path, e))?,
        }
        let count = self.modified.fetch_add(1, Ordering::SeqCst) + 1;
        log.debug(format!("[{id}] Modified {path} ({count} so far)"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::backup::BackupStore;
    use crate::log::{Level, MemoryLog, NullLog};
    use crate::patch::{PatchDescriptor, Rule, Specialized};
    use std::sync::Arc;

    fn fog_patch() -> Patch {
        let mut desc = PatchDescriptor::new("fog", Marker::new("{{PATCHER_fog}}"));
        desc.targets.extensions = vec![".hlsl".into()];
        Patch::declarative(
            desc,
            vec![Rule::literal("fog = 1;", "fog = 0; //{{PATCHER_fog}}")],
        )
    }

    fn engine() -> (tempfile::TempDir, PatchEngine, Arc<BackupStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BackupStore::open(dir.path(), NullLog::shared()).unwrap());
        let engine = PatchEngine::new(Backups::Durable(Arc::clone(&store)), NullLog::shared());
        (dir, engine, store)
    }

    #[test]
    fn test_apply_then_state_applied() {
        let (_dir, engine, store) = engine();
        let mut archive = MemoryArchive::from_entries([("a.hlsl", "fog = 1;"), ("b.txt", "fog = 1;")]);
        let patch = fog_patch();

        assert_eq!(engine.check_state(&patch, &archive, None), PatchState::NotApplied);
        let outcome = engine.apply(&patch, &mut archive, None);
        assert!(outcome.success(), "{outcome}");
        assert_eq!(outcome.files_modified, 1);
        assert_eq!(archive.text("a.hlsl").unwrap(), "fog = 0; //{{PATCHER_fog}}");
        assert_eq!(archive.text("b.txt").unwrap(), "fog = 1;");
        assert_eq!(store.get("a.hlsl").unwrap().unwrap(), b"fog = 1;");
        assert_eq!(engine.check_state(&patch, &archive, None), PatchState::Applied);
    }

    #[test]
    fn test_no_op_replay() {
        let (_dir, engine, _store) = engine();
        let mut archive = MemoryArchive::from_entries([("a.hlsl", "fog = 1;")]);
        let patch = fog_patch();
        let _ = engine.apply(&patch, &mut archive, None);
        let again = engine.apply(&patch, &mut archive, None);
        assert!(again.success());
        assert_eq!(again.kind, OutcomeKind::AlreadyApplied);
        assert_eq!(again.files_modified, 0);
    }

    #[test]
    fn test_dirty_state_without_backup() {
        let (_dir, engine, _store) = engine();
        let archive = MemoryArchive::from_entries([("a.hlsl", "fog = 0; //{{PATCHER_fog}}")]);
        let patch = fog_patch();
        assert_eq!(engine.check_state(&patch, &archive, None), PatchState::Dirty);
        let dirty = engine.pre_patch_check(&patch, &archive, None);
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].markers, vec![Marker::new("{{PATCHER_fog}}")]);
    }

    #[test]
    fn test_revert_without_store_fails() {
        let engine = PatchEngine::new(Backups::Disabled, NullLog::shared());
        let mut archive = MemoryArchive::from_entries([("a.hlsl", "fog = 1;")]);
        let outcome = engine.revert(&fog_patch(), &mut archive);
        assert_eq!(outcome.kind, OutcomeKind::Failed);
        assert!(!outcome.success());
    }

    #[test]
    fn test_write_error_is_caught_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemoryLog::new();
        let store = Arc::new(BackupStore::open(dir.path(), log.clone()).unwrap());
        let engine = PatchEngine::new(Backups::Durable(store), log.clone());
        let mut archive =
            MemoryArchive::from_entries([("a.hlsl", "fog = 1;"), ("b.hlsl", "fog = 1;")]);
        archive.set_read_only("b.hlsl");

        let outcome = engine.apply(&fog_patch(), &mut archive, None);
        assert_eq!(outcome.kind, OutcomeKind::Failed);
        assert_eq!(outcome.files_modified, 1);
        let errors = log.find(Level::ERROR, "[fog] Failed on b.hlsl after 1 file(s)");
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_no_match_is_distinct() {
        let (_dir, engine, _store) = engine();
        let mut desc = PatchDescriptor::new("gamma", Marker::new("{{PATCHER_gamma}}"));
        desc.targets.files = vec!["gamma.hlsl".into()];
        desc.repatch = true;
        let patch = Patch::specialized(desc, Specialized::gamma(2.0)).unwrap();
        let mut archive =
            MemoryArchive::from_entries([("gamma.hlsl", "float g = 2.0; //{{PATCHER_gamma}}")]);

        let outcome = engine.apply(&patch, &mut archive, None);
        assert_eq!(outcome.kind, OutcomeKind::NoMatchFound);
        assert_eq!(outcome.unmatched, vec!["gamma.hlsl"]);
        assert!(!outcome.success());
    }

    #[test]
    fn test_applied_parameter_probe() {
        let (_dir, engine, _store) = engine();
        let mut desc = PatchDescriptor::new("gamma", Marker::new("{{PATCHER_gamma}}"));
        desc.targets.files = vec!["gamma.hlsl".into()];
        desc.repatch = true;
        let patch = Patch::specialized(desc, Specialized::gamma(1.8)).unwrap();
        let mut archive = MemoryArchive::from_entries([("gamma.hlsl", "float m = 1.0f / 2.4f;")]);

        assert_eq!(engine.applied_parameter(&patch, &archive, None), None);
        let _ = engine.apply(&patch, &mut archive, None);
        assert_eq!(engine.applied_parameter(&patch, &archive, None), Some(1.8));
    }
}
