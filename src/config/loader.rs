use crate::config::builder::PatchBuilder;
use crate::config::schema::{Params, PatchDocument, ValidationError};
use crate::log::{PatchLogExt, SharedLog};
use crate::marker::DEFAULT_NAMESPACE;
use crate::patch::Patch;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Option<Format> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "toml" => Some(Format::Toml),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Toml {
        path: Option<PathBuf>,
        source: toml_edit::de::Error,
    },
    Json {
        path: Option<PathBuf>,
        source: serde_json::Error,
    },
    Validation {
        path: Option<PathBuf>,
        source: ValidationError,
    },
    UnsupportedFormat {
        path: PathBuf,
    },
}

impl ConfigError {
    fn with_path(self, path: &Path) -> Self {
        let path = path.to_path_buf();
        match self {
            ConfigError::Toml { path: None, source } => ConfigError::Toml {
                path: Some(path),
                source,
            },
            ConfigError::Json { path: None, source } => ConfigError::Json {
                path: Some(path),
                source,
            },
            ConfigError::Validation { path: None, source } => ConfigError::Validation {
                path: Some(path),
                source,
            },
            other => other,
        }
    }

    pub(crate) fn validation(source: ValidationError) -> Self {
        ConfigError::Validation { path: None, source }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(
                    f,
                    "failed to read patch config from {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::Toml { path, source } => match path {
                Some(path) => write!(
                    f,
                    "failed to parse patch config TOML ({}): {}",
                    path.display(),
                    source
                ),
                None => write!(f, "failed to parse patch config TOML: {}", source),
            },
            ConfigError::Json { path, source } => match path {
                Some(path) => write!(
                    f,
                    "failed to parse patch config JSON ({}): {}",
                    path.display(),
                    source
                ),
                None => write!(f, "failed to parse patch config JSON: {}", source),
            },
            ConfigError::Validation { path, source } => match path {
                Some(path) => write!(f, "invalid patch config ({}): {}", path.display(), source),
                None => write!(f, "invalid patch config: {}", source),
            },
            ConfigError::UnsupportedFormat { path } => write!(
                f,
                "unsupported patch config format: {} (expected .toml or .json)",
                path.display()
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Toml { source, .. } => Some(source),
            ConfigError::Json { source, .. } => Some(source),
            ConfigError::Validation { source, .. } => Some(source),
            ConfigError::UnsupportedFormat { .. } => None,
        }
    }
}

fn parse(input: &str, format: Format) -> Result<PatchDocument, ConfigError> {
    match format {
        Format::Toml => toml_edit::de::from_str(input)
            .map_err(|source| ConfigError::Toml { path: None, source }),
        Format::Json => serde_json::from_str(input)
            .map_err(|source| ConfigError::Json { path: None, source }),
    }
}

pub fn load_from_str(input: &str, format: Format) -> Result<PatchDocument, ConfigError> {
    let document = parse(input, format)?;
    document.validate().map_err(ConfigError::validation)?;
    Ok(document)
}

/// Read one document. A missing `id` is taken from the file stem.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<PatchDocument, ConfigError> {
    read_document(path.as_ref(), DEFAULT_NAMESPACE)
}

fn read_document(path: &Path, namespace: &str) -> Result<PatchDocument, ConfigError> {
    let format = Format::from_path(path).ok_or_else(|| ConfigError::UnsupportedFormat {
        path: path.to_path_buf(),
    })?;
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut document = parse(&contents, format).map_err(|error| error.with_path(path))?;
    if document.id().is_none() {
        document.id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());
    }
    document
        .validate_with(namespace)
        .map_err(|source| ConfigError::validation(source).with_path(path))?;
    Ok(document)
}

/// Turns patch documents on disk into ready-to-run [`Patch`]es.
pub struct PatchLoader {
    namespace: String,
    overrides: Params,
    log: SharedLog,
}

impl PatchLoader {
    pub fn new(log: SharedLog) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            overrides: Params::default(),
            log,
        }
    }

    /// Namespace used for markers the documents do not spell out.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Runtime parameter values that take precedence over each document's.
    pub fn with_overrides(mut self, overrides: Params) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn build(&self, document: &PatchDocument) -> Result<Patch, ConfigError> {
        PatchBuilder::from_document(document, &self.namespace, &self.overrides)?.build()
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Patch, ConfigError> {
        let path = path.as_ref();
        let document = read_document(path, &self.namespace)?;
        self.build(&document).map_err(|error| error.with_path(path))
    }

    /// Load every `*.toml` and `*.json` under `dir`, sorted by path.
    ///
    /// Documents that fail to parse, validate or build are skipped with a
    /// warning so one broken file does not disable the rest.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<Vec<Patch>, ConfigError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ConfigError::Io {
                path: dir.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "patch directory not found",
                ),
            });
        }

        let mut patches: Vec<Patch> = Vec::new();
        let walker = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| Format::from_path(entry.path()).is_some());
        for entry in walker {
            match self.load_file(entry.path()) {
                Ok(patch) => {
                    if patches.iter().any(|p| p.id() == patch.id()) {
                        self.log.warn(format!(
                            "Duplicate patch id '{}' in {}, skipping",
                            patch.id(),
                            entry.path().display()
                        ));
                        continue;
                    }
                    self.log.debug(format!(
                        "Loaded patch '{}' from {}",
                        patch.id(),
                        entry.path().display()
                    ));
                    patches.push(patch);
                }
                Err(e) => self.log.warn(format!("Skipping patch config: {e}")),
            }
        }
        Ok(patches)
    }
}
