use crate::marker::{Marker, DEFAULT_NAMESPACE};
use crate::select::TargetSpec;
use serde::Deserialize;
use std::fmt;

/// One patch document, as written in a `.toml` or `.json` file.
///
/// Keys are snake_case; the camelCase spellings used by older JSON configs
/// are accepted as aliases.
#[derive(Debug, Deserialize, Clone)]
pub struct PatchDocument {
    /// Defaults to the file stem when loaded from disk.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_impact_level", alias = "impactLevel")]
    pub impact_level: i64,
    #[serde(default, alias = "markerFile")]
    pub marker_file: Option<String>,
    /// Defaults to `{{NAMESPACE_<lowercased id>}}`.
    #[serde(default)]
    pub marker: Option<String>,
    #[serde(default)]
    pub repatch: bool,
    #[serde(default)]
    pub parallel: Option<bool>,
    #[serde(default)]
    pub kind: PatchKindName,
    #[serde(default)]
    pub targets: TargetSpec,
    /// Top-level filename wildcards, merged into `targets.patterns`.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Top-level exclusions, merged into `targets.exclude_paths`.
    #[serde(default, alias = "excludePaths")]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub replacements: Vec<ReplacementDef>,
    #[serde(default)]
    pub params: Params,
}

fn default_enabled() -> bool {
    true
}

fn default_category() -> String {
    "General".to_string()
}

fn default_impact_level() -> i64 {
    5
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PatchKindName {
    #[default]
    Declarative,
    Brightness,
    SdrScale,
    Gamma,
    CameraZoom,
    EnvParticles,
    GlobalIllumination,
}

impl PatchKindName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchKindName::Declarative => "declarative",
            PatchKindName::Brightness => "brightness",
            PatchKindName::SdrScale => "sdr-scale",
            PatchKindName::Gamma => "gamma",
            PatchKindName::CameraZoom => "camera-zoom",
            PatchKindName::EnvParticles => "env-particles",
            PatchKindName::GlobalIllumination => "global-illumination",
        }
    }
}

impl fmt::Display for PatchKindName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ReplacementDef {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
    #[serde(default, alias = "isRegex")]
    pub is_regex: bool,
}

/// Numeric parameters of the specialized kinds. Runtime overrides win.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
pub struct Params {
    #[serde(default)]
    pub multiplier: Option<f64>,
    #[serde(default)]
    pub gamma: Option<f64>,
    #[serde(default, alias = "zoomLevel")]
    pub zoom_level: Option<u32>,
    #[serde(default, alias = "envLight")]
    pub env_light: Option<f64>,
    #[serde(default, alias = "indirectLight")]
    pub indirect_light: Option<f64>,
}

impl Params {
    /// `self`, with every value set in `overrides` replaced.
    pub fn merged(&self, overrides: &Params) -> Params {
        Params {
            multiplier: overrides.multiplier.or(self.multiplier),
            gamma: overrides.gamma.or(self.gamma),
            zoom_level: overrides.zoom_level.or(self.zoom_level),
            env_light: overrides.env_light.or(self.env_light),
            indirect_light: overrides.indirect_light.or(self.indirect_light),
        }
    }
}

impl PatchDocument {
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    /// Declared marker, or the namespace default for this document's id.
    pub fn effective_marker(&self, namespace: &str) -> Option<Marker> {
        match self.marker.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => Some(Marker::new(token)),
            _ => self.id().map(|id| Marker::for_patch(namespace, id)),
        }
    }

    pub fn marker_file(&self) -> Option<&str> {
        self.marker_file
            .as_deref()
            .map(str::trim)
            .filter(|file| !file.is_empty())
    }

    /// Targets with the top-level `patterns`/`exclude_paths` folded in.
    pub fn effective_targets(&self) -> TargetSpec {
        let mut targets = self.targets.clone();
        targets.patterns.extend(self.patterns.iter().cloned());
        targets.exclude_paths.extend(self.exclude_paths.iter().cloned());
        targets
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_with(DEFAULT_NAMESPACE)
    }

    pub fn validate_with(&self, namespace: &str) -> Result<(), ValidationError> {
        let mut issues = Vec::new();
        let patch_id = self.id().map(str::to_string);

        if patch_id.is_none() {
            issues.push(ValidationIssue::MissingField {
                patch_id: None,
                field: "id",
            });
        }
        if !(1..=10).contains(&self.impact_level) {
            issues.push(ValidationIssue::OutOfRange {
                patch_id: patch_id.clone(),
                field: "impact_level",
                value: self.impact_level.to_string(),
                range: "1..=10",
            });
        }
        if self.marker.as_deref().is_some_and(|m| m.trim().is_empty()) {
            issues.push(ValidationIssue::MissingField {
                patch_id: patch_id.clone(),
                field: "marker",
            });
        }

        let targets = self.effective_targets();
        let has_targets = !targets.is_empty() || self.marker_file().is_some();
        match self.kind {
            PatchKindName::Declarative => {
                if self.replacements.is_empty() {
                    issues.push(ValidationIssue::MissingField {
                        patch_id: patch_id.clone(),
                        field: "replacements",
                    });
                }
                for replacement in &self.replacements {
                    if replacement.pattern.is_empty() {
                        issues.push(ValidationIssue::MissingField {
                            patch_id: patch_id.clone(),
                            field: "replacements.pattern",
                        });
                    } else if replacement.is_regex {
                        if let Err(e) = regex::Regex::new(&replacement.pattern) {
                            issues.push(ValidationIssue::InvalidRegex {
                                patch_id: patch_id.clone(),
                                pattern: replacement.pattern.clone(),
                                message: e.to_string(),
                            });
                        }
                    }
                }
                if let Some(marker) = self.effective_marker(namespace) {
                    let emitted = self
                        .replacements
                        .iter()
                        .any(|r| marker.is_in(&r.replacement));
                    if !self.replacements.is_empty() && !emitted {
                        issues.push(ValidationIssue::InvalidCombo {
                            patch_id: patch_id.clone(),
                            message: format!(
                                "no replacement writes the marker {marker}, the patch could never be detected or reverted"
                            ),
                        });
                    }
                }
                if !has_targets {
                    issues.push(ValidationIssue::MissingField {
                        patch_id: patch_id.clone(),
                        field: "targets",
                    });
                }
            }
            PatchKindName::CameraZoom => {
                if self.marker_file().is_none() {
                    issues.push(ValidationIssue::MissingField {
                        patch_id: patch_id.clone(),
                        field: "marker_file",
                    });
                }
            }
            PatchKindName::Brightness
            | PatchKindName::SdrScale
            | PatchKindName::Gamma
            | PatchKindName::GlobalIllumination => {
                if !has_targets {
                    issues.push(ValidationIssue::MissingField {
                        patch_id: patch_id.clone(),
                        field: "targets",
                    });
                }
            }
            PatchKindName::EnvParticles => {}
        }

        if let Some(value) = self.params.multiplier.filter(|v| !v.is_finite()) {
            issues.push(ValidationIssue::OutOfRange {
                patch_id: patch_id.clone(),
                field: "params.multiplier",
                value: value.to_string(),
                range: "finite",
            });
        }
        let numeric = [
            ("params.gamma", self.params.gamma),
            ("params.env_light", self.params.env_light),
            ("params.indirect_light", self.params.indirect_light),
        ];
        for (field, value) in numeric {
            if let Some(value) = value.filter(|v| !v.is_finite()) {
                issues.push(ValidationIssue::OutOfRange {
                    patch_id: patch_id.clone(),
                    field,
                    value: value.to_string(),
                    range: "finite",
                });
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone)]
pub enum ValidationIssue {
    MissingField {
        patch_id: Option<String>,
        field: &'static str,
    },
    OutOfRange {
        patch_id: Option<String>,
        field: &'static str,
        value: String,
        range: &'static str,
    },
    InvalidRegex {
        patch_id: Option<String>,
        pattern: String,
        message: String,
    },
    InvalidCombo {
        patch_id: Option<String>,
        message: String,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::MissingField { patch_id, field } => match patch_id {
                Some(id) => write!(f, "patch '{id}' missing required field '{field}'"),
                None => write!(f, "patch missing required field '{field}'"),
            },
            ValidationIssue::OutOfRange {
                patch_id,
                field,
                value,
                range,
            } => match patch_id {
                Some(id) => write!(f, "patch '{id}' field '{field}' = {value} outside {range}"),
                None => write!(f, "field '{field}' = {value} outside {range}"),
            },
            ValidationIssue::InvalidRegex {
                patch_id,
                pattern,
                message,
            } => match patch_id {
                Some(id) => write!(f, "patch '{id}' has invalid regex '{pattern}': {message}"),
                None => write!(f, "invalid regex '{pattern}': {message}"),
            },
            ValidationIssue::InvalidCombo { patch_id, message } => match patch_id {
                Some(id) => write!(f, "patch '{id}' has invalid configuration: {message}"),
                None => write!(f, "invalid patch configuration: {message}"),
            },
        }
    }
}
