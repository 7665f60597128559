use crate::archive::ArchiveError;
use crate::backup::BackupError;
use crate::config::ConfigError;
use thiserror::Error;

/// Failures of a patch operation.
#[derive(Error, Debug)]
pub enum PatchError {
    /// A target, marker file or archive is absent. Non-fatal.
    #[error("not found: {0}")]
    NotFound(String),

    /// The archive could not be parsed. Aborts the batch.
    #[error("archive format error: {0}")]
    Format(String),

    #[error("cancelled after {files_modified} file(s)")]
    Cancelled { files_modified: usize },

    /// A backup or archive write failed. Aborts the current patch only.
    #[error("write failed for {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("invalid patch configuration: {0}")]
    Config(String),

    #[error("backups are disabled, nothing can be restored")]
    NoBackupStore,

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: ArchiveError,
    },

    #[error(transparent)]
    Backup(#[from] BackupError),
}

impl PatchError {
    pub fn write(path: &str, reason: impl ToString) -> Self {
        PatchError::Write {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error should stop the whole batch rather than one patch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PatchError::Format(_)
                | PatchError::Read {
                    source: ArchiveError::InvalidFormat { .. },
                    ..
                }
        )
    }
}

impl From<ArchiveError> for PatchError {
    fn from(error: ArchiveError) -> Self {
        match error {
            ArchiveError::NotFound(path) => PatchError::NotFound(path.display().to_string()),
            ArchiveError::InvalidFormat { path, reason } => {
                PatchError::Format(format!("{}: {reason}", path.display()))
            }
            ArchiveError::MissingRecord(path) => PatchError::NotFound(path),
            ArchiveError::StaleRecord { ref path } | ArchiveError::ReadOnly(ref path) => {
                PatchError::write(path, &error)
            }
            ArchiveError::Io { ref path, .. } => {
                PatchError::write(&path.display().to_string(), &error)
            }
        }
    }
}

impl From<ConfigError> for PatchError {
    fn from(error: ConfigError) -> Self {
        PatchError::Config(error.to_string())
    }
}
