//! Batch runs of several patches over one open archive.
//!
//! Patches run one after another against a shared [`PatchContext`], so later
//! patches see earlier edits. The context is flushed at the end and the
//! archive is saved exactly once; saving between patches would invalidate
//! the record handles still in use.

use crate::archive::Archive;
use crate::backup::DirtyState;
use crate::context::PatchContext;
use crate::engine::{PatchEngine, PatchOutcome, PatchState};
use crate::error::PatchError;
use crate::log::PatchLogExt;
use crate::patch::Patch;
use crate::text::DecodedText;

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Apply even when targets are dirty.
    pub force: bool,
    /// Compute edits without writing backups, the archive or saving.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Dirty(Vec<DirtyState>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPatch {
    pub patch_id: String,
    pub reason: SkipReason,
}

/// Before/after bytes of one file from a dry run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePreview {
    pub path: String,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
#[must_use = "BatchReport should be checked for failed or cancelled patches"]
pub struct BatchReport {
    pub outcomes: Vec<PatchOutcome>,
    pub skipped: Vec<SkippedPatch>,
    /// Sum of per-patch modification counts.
    pub files_modified: usize,
    /// Distinct files flushed to the archive.
    pub files_written: usize,
    pub saved: bool,
    pub cancelled: bool,
    pub previews: Vec<FilePreview>,
}

impl BatchReport {
    pub fn success(&self) -> bool {
        !self.cancelled
            && self.outcomes.iter().all(PatchOutcome::success)
            && !self
                .skipped
                .iter()
                .any(|s| matches!(s.reason, SkipReason::Dirty(_)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchStatus {
    pub patch_id: String,
    pub name: String,
    pub state: PatchState,
    pub dirty: Vec<DirtyState>,
    pub applied_parameter: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    engine: PatchEngine,
}

impl Orchestrator {
    pub fn new(engine: PatchEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &PatchEngine {
        &self.engine
    }

    fn register_all(&self, patches: &[Patch]) {
        for patch in patches {
            self.engine.register(patch);
        }
    }

    /// Apply `patches` in order and save once.
    ///
    /// Per-patch failures land in the report. Errors returned here come from
    /// the final flush or save, or from an archive that cannot be read at
    /// all, in which case nothing is written.
    pub fn apply_batch(
        &self,
        patches: &[Patch],
        archive: &mut dyn Archive,
        options: &BatchOptions,
    ) -> Result<BatchReport, PatchError> {
        let log = self.engine.log();
        self.register_all(patches);
        let engine = if options.dry_run {
            self.engine.without_backups()
        } else {
            self.engine.clone()
        };

        let ctx = PatchContext::new();
        let mut report = BatchReport::default();
        for patch in patches {
            let id = patch.id();
            if !patch.descriptor().enabled {
                log.info(format!("[{id}] Disabled, skipping"));
                report.skipped.push(SkippedPatch {
                    patch_id: id.to_string(),
                    reason: SkipReason::Disabled,
                });
                continue;
            }
            if !options.force {
                // Archive bytes only: markers this batch just wrote have no
                // backup in dry runs or without a store.
                let dirty = self.engine.pre_patch_check(patch, &*archive, None);
                if !dirty.is_empty() {
                    log.warn(format!(
                        "[{id}] {} target file(s) are marked but have no backup, skipping",
                        dirty.len()
                    ));
                    report.skipped.push(SkippedPatch {
                        patch_id: id.to_string(),
                        reason: SkipReason::Dirty(dirty),
                    });
                    continue;
                }
            }

            let outcome = engine.apply(patch, archive, Some(&ctx));
            if outcome.fatal {
                let message = outcome.error.unwrap_or_default();
                log.error(format!("[{id}] Archive is unusable, aborting batch: {message}"));
                return Err(PatchError::Format(message));
            }
            report.files_modified += outcome.files_modified;
            let cancelled = outcome.is_cancelled();
            report.outcomes.push(outcome);
            if cancelled {
                log.warn("Batch cancelled, remaining patches not run");
                report.cancelled = true;
                break;
            }
        }

        let pending = ctx.drain();
        if options.dry_run {
            for (path, after) in pending {
                let before = match archive.find(&path) {
                    Some(record) => archive.read(&record)?,
                    None => Vec::new(),
                };
                report.previews.push(FilePreview {
                    path,
                    before,
                    after,
                });
            }
            return Ok(report);
        }

        for (path, data) in &pending {
            let record = archive
                .find(path)
                .ok_or_else(|| PatchError::NotFound(path.clone()))?;
            archive
                .write(&record, data)
                .map_err(|e| PatchError::write(path, e))?;
        }
        report.files_written = pending.len();
        if !pending.is_empty() {
            archive.save()?;
            report.saved = true;
            log.info(format!("Saved archive, {} file(s) written", pending.len()));
        }
        Ok(report)
    }

    /// Revert `patches` in order and save once.
    pub fn revert_batch(
        &self,
        patches: &[Patch],
        archive: &mut dyn Archive,
    ) -> Result<BatchReport, PatchError> {
        self.register_all(patches);
        let mut report = BatchReport::default();
        for patch in patches {
            let outcome = self.engine.revert(patch, archive);
            report.files_modified += outcome.files_modified;
            let cancelled = outcome.is_cancelled();
            report.outcomes.push(outcome);
            if cancelled {
                report.cancelled = true;
                break;
            }
        }
        report.files_written = report.files_modified;
        if report.files_modified > 0 {
            archive.save()?;
            report.saved = true;
        }
        Ok(report)
    }

    /// Write every backup back, save, then drop the restored backups.
    pub fn restore_all(&self, archive: &mut dyn Archive) -> Result<usize, PatchError> {
        let log = self.engine.log();
        let store = self
            .engine
            .backups()
            .store()
            .ok_or(PatchError::NoBackupStore)?;

        let mut restored = Vec::new();
        for path in store.list_all()? {
            self.engine.control().report(&format!("Restoring: {path}"));
            let Some(record) = archive.find(&path) else {
                log.warn(format!("Backup {path} has no archive entry, keeping it"));
                continue;
            };
            let Some(original) = store.get(&path)? else {
                continue;
            };
            archive
                .write(&record, &original)
                .map_err(|e| PatchError::write(&path, e))?;
            restored.push(path);
        }

        if !restored.is_empty() {
            archive.save()?;
        }
        for path in &restored {
            store.remove(path)?;
        }
        log.info(format!("Restored {} file(s) from backup", restored.len()));
        Ok(restored.len())
    }

    /// Drop backups left behind after the archive was restored behind our
    /// back: only when no known marker appears anywhere, and only for files
    /// whose current bytes equal the stored original. Returns how many
    /// backups were removed.
    pub fn cleanup_stale_backups(
        &self,
        patches: &[Patch],
        archive: &dyn Archive,
    ) -> Result<usize, PatchError> {
        let Some(store) = self.engine.backups().store() else {
            return Ok(0);
        };
        if !store.has_any() {
            return Ok(0);
        }
        self.register_all(patches);

        if patches
            .iter()
            .any(|patch| self.engine.check_applied(patch, archive, None))
        {
            return Ok(0);
        }

        let mut restored = Vec::new();
        for path in store.list_all()? {
            let Some(record) = archive.find(&path) else {
                continue;
            };
            let Ok(current) = archive.read(&record) else {
                continue;
            };
            if let Ok(decoded) = DecodedText::decode(&current, &path) {
                if !store.check_markers(&decoded.text).is_empty() {
                    return Ok(0);
                }
            }
            if store.get(&path)?.as_deref() == Some(current.as_slice()) {
                restored.push(path);
            } else {
                self.engine.log().debug(format!(
                    "Keeping backup {path}, the file differs from its original"
                ));
            }
        }

        for path in &restored {
            store.remove(path)?;
        }
        if !restored.is_empty() {
            self.engine.log().info(format!(
                "No patch markers found, cleared {} stale backup(s)",
                restored.len()
            ));
        }
        Ok(restored.len())
    }

    pub fn status(&self, patches: &[Patch], archive: &dyn Archive) -> Vec<PatchStatus> {
        self.register_all(patches);
        patches
            .iter()
            .map(|patch| {
                let state = self.engine.check_state(patch, archive, None);
                let dirty = if state == PatchState::Dirty {
                    self.engine.pre_patch_check(patch, archive, None)
                } else {
                    Vec::new()
                };
                PatchStatus {
                    patch_id: patch.id().to_string(),
                    name: patch.name().to_string(),
                    applied_parameter: self.engine.applied_parameter(patch, archive, None),
                    state,
                    dirty,
                }
            })
            .collect()
    }
}
