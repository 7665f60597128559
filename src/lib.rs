//! Bundle Patcher: idempotent, reversible text patching of game asset archives
//!
//! Patches rewrite text entries (shaders, object scripts, particle
//! definitions) inside an archive. Every modified line carries a marker
//! comment so a patch can tell whether it is already applied, and the first
//! time a file is touched its pristine bytes go to a durable backup store so
//! any patch can be reverted byte for byte.
//!
//! # Architecture
//!
//! A [`Patch`] is a descriptor plus one of two variants: declarative
//! find/replace [`Rule`]s, or a [`SpecializedPatch`] with typed parameters
//! that converges to a single marked line when re-applied. The
//! [`PatchEngine`] runs one patch over its selected targets; the
//! [`Orchestrator`] runs a batch against a shared [`PatchContext`] and saves
//! the archive once.
//!
//! # Safety
//!
//! - First-touch backups are written before the archive is modified
//! - Backup files are written atomically (tempfile + fsync + rename)
//! - Backup paths are confined to the store root
//! - Files that fail to decode are skipped, never rewritten
//! - Cancellation happens between files, never inside one
//!
//! # Example
//!
//! ```no_run
//! use bundle_patcher::{
//!     BackupStore, Backups, BatchOptions, DirectoryArchive, Orchestrator, PatchEngine,
//!     PatchLoader, TracingLog,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let log = TracingLog::shared();
//! let patches = PatchLoader::new(log.clone()).load_dir("patches")?;
//! let store = BackupStore::open("backups", log.clone())?;
//! let engine = PatchEngine::new(Backups::Durable(Arc::new(store)), log);
//!
//! let mut archive = DirectoryArchive::open("game/data")?;
//! let report = Orchestrator::new(engine).apply_batch(
//!     &patches,
//!     &mut archive,
//!     &BatchOptions::default(),
//! )?;
//! println!("{} file(s) modified", report.files_modified);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod backup;
pub mod cancel;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod log;
pub mod marker;
pub mod orchestrator;
pub mod patch;
pub mod select;
pub mod text;
pub mod vpath;

// Re-exports
pub use archive::{Archive, ArchiveError, DirectoryArchive, MemoryArchive, Record};
pub use backup::{dirty_state, BackupError, BackupStore, Backups, DirtyState};
pub use cancel::{CancelToken, RunControl};
pub use config::{
    load_from_path, load_from_str, ConfigError, PatchBuilder, PatchDocument, PatchKindName,
    PatchLoader, ValidationError,
};
pub use context::PatchContext;
pub use engine::{OutcomeKind, PatchEngine, PatchOutcome, PatchState};
pub use error::PatchError;
pub use log::{MemoryLog, NullLog, PatchLog, SharedLog, TracingLog};
pub use marker::{Marker, DEFAULT_NAMESPACE};
pub use orchestrator::{BatchOptions, BatchReport, Orchestrator, PatchStatus};
pub use patch::{Patch, PatchDescriptor, PatchKind, Rule, Specialized, SpecializedPatch, Transform};
pub use select::{select, TargetSpec};
pub use text::{DecodedText, TextEncoding, TextError};
