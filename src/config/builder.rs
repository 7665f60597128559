//! Typed construction of [`Patch`]es.
//!
//! Parameterized patches are built from typed values; nothing is produced by
//! substituting placeholders into a config document.

use crate::config::loader::ConfigError;
use crate::config::schema::{Params, PatchDocument, PatchKindName, ValidationError, ValidationIssue};
use crate::marker::Marker;
use crate::patch::{Patch, PatchDescriptor, Rule, Specialized};
use crate::select::TargetSpec;

pub const DEFAULT_MULTIPLIER: f64 = 1.25;
pub const DEFAULT_GAMMA: f64 = 2.0;
pub const DEFAULT_ZOOM_LEVEL: u32 = 2;
pub const DEFAULT_ENV_LIGHT: f64 = 0.15;
pub const DEFAULT_INDIRECT_LIGHT: f64 = 0.1;

const ENV_PARTICLE_PATTERNS: &[&str] = &["*fog*.aoc", "*mist*.aoc", "*dust*.aoc", "*glowworm*.aoc"];

#[derive(Debug, Clone)]
struct RuleDef {
    pattern: String,
    replacement: String,
    is_regex: bool,
}

#[derive(Debug, Clone)]
pub struct PatchBuilder {
    descriptor: PatchDescriptor,
    rules: Vec<RuleDef>,
    specialized: Option<Specialized>,
    name_set: bool,
}

impl PatchBuilder {
    pub fn new(id: impl Into<String>, namespace: &str) -> Self {
        let id = id.into();
        let marker = Marker::for_patch(namespace, &id);
        Self {
            descriptor: PatchDescriptor::new(id, marker),
            rules: Vec::new(),
            specialized: None,
            name_set: false,
        }
    }

    /// HDR brightness boost, re-appliable.
    pub fn brightness(namespace: &str, multiplier: f64) -> Self {
        Self::new("brightness", namespace)
            .category("Visual")
            .repatch(true)
            .specialized(Specialized::brightness(multiplier))
    }

    pub fn sdr_scale(namespace: &str, multiplier: f64) -> Self {
        Self::new("sdrscale", namespace)
            .category("Visual")
            .repatch(true)
            .specialized(Specialized::sdr_scale(multiplier))
    }

    pub fn gamma(namespace: &str, gamma: f64) -> Self {
        Self::new("gamma", namespace)
            .category("Visual")
            .repatch(true)
            .specialized(Specialized::gamma(gamma))
    }

    pub fn camera_zoom(namespace: &str, zoom_level: u32) -> Self {
        Self::new("camerazoom", namespace)
            .category("Gameplay")
            .repatch(true)
            .specialized(Specialized::camera_zoom(zoom_level))
    }

    pub fn global_illumination(namespace: &str, env_light: f64, indirect_light: f64) -> Self {
        Self::new("globalillumination", namespace)
            .category("Performance")
            .repatch(true)
            .specialized(Specialized::global_illumination(env_light, indirect_light))
    }

    /// Environmental particles, with the default `.aoc` terrain targets.
    pub fn env_particles(namespace: &str) -> Self {
        Self::new("envparticles", namespace)
            .category("Performance")
            .parallel(true)
            .targets(TargetSpec {
                extensions: vec![".aoc".to_string()],
                base_paths: vec!["metadata/terrain/".to_string()],
                patterns: ENV_PARTICLE_PATTERNS.iter().map(|p| p.to_string()).collect(),
                ..TargetSpec::default()
            })
            .specialized(Specialized::EnvParticles)
    }

    /// Builder for a parsed document. `overrides` win over the document's
    /// own parameters.
    pub fn from_document(
        document: &PatchDocument,
        namespace: &str,
        overrides: &Params,
    ) -> Result<Self, ConfigError> {
        let id = document.id().ok_or_else(|| {
            ConfigError::validation(ValidationError {
                issues: vec![ValidationIssue::MissingField {
                    patch_id: None,
                    field: "id",
                }],
            })
        })?;
        let params = document.params.merged(overrides);

        let mut builder = match document.kind {
            PatchKindName::Declarative => Self::new(id, namespace),
            PatchKindName::Brightness => {
                Self::brightness(namespace, params.multiplier.unwrap_or(DEFAULT_MULTIPLIER))
            }
            PatchKindName::SdrScale => {
                Self::sdr_scale(namespace, params.multiplier.unwrap_or(DEFAULT_MULTIPLIER))
            }
            PatchKindName::Gamma => Self::gamma(namespace, params.gamma.unwrap_or(DEFAULT_GAMMA)),
            PatchKindName::CameraZoom => Self::camera_zoom(
                namespace,
                params.zoom_level.unwrap_or(DEFAULT_ZOOM_LEVEL),
            ),
            PatchKindName::EnvParticles => Self::env_particles(namespace),
            PatchKindName::GlobalIllumination => Self::global_illumination(
                namespace,
                params.env_light.unwrap_or(DEFAULT_ENV_LIGHT),
                params.indirect_light.unwrap_or(DEFAULT_INDIRECT_LIGHT),
            ),
        };
        // Parameterized kinds stay re-appliable whatever the document says.
        let repatch = document.repatch || builder.descriptor.repatch;
        builder = builder
            .id(id, namespace)
            .description(document.description.clone())
            .impact_level(document.impact_level.clamp(1, 10) as u8)
            .enabled(document.enabled)
            .repatch(repatch);
        // Presets keep their own category unless the document names one.
        if document.kind == PatchKindName::Declarative || document.category != "General" {
            builder = builder.category(document.category.clone());
        }
        if !document.name.trim().is_empty() {
            builder = builder.name(document.name.clone());
        }
        if let Some(marker) = document.effective_marker(namespace) {
            builder = builder.marker(marker);
        }
        if let Some(file) = document.marker_file() {
            builder = builder.marker_file(file);
        }
        let targets = document.effective_targets();
        if !targets.is_empty() {
            builder = builder.targets(targets);
        } else {
            if !targets.patterns.is_empty() {
                builder.descriptor.targets.patterns = targets.patterns;
            }
            builder
                .descriptor
                .targets
                .exclude_paths
                .extend(targets.exclude_paths);
        }
        if let Some(parallel) = document.parallel {
            builder = builder.parallel(parallel);
        }
        for replacement in &document.replacements {
            builder = builder.rule(
                replacement.pattern.clone(),
                replacement.replacement.clone(),
                replacement.is_regex,
            );
        }
        Ok(builder)
    }

    /// Rename the patch. Also resets the marker to the namespace default
    /// for the new id.
    pub fn id(mut self, id: impl Into<String>, namespace: &str) -> Self {
        let id = id.into();
        self.descriptor.marker = Marker::for_patch(namespace, &id);
        if !self.name_set {
            self.descriptor.name = id.clone();
        }
        self.descriptor.id = id;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.descriptor.name = name.into();
        self.name_set = true;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.descriptor.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.descriptor.category = category.into();
        self
    }

    pub fn impact_level(mut self, level: u8) -> Self {
        self.descriptor.impact_level = level.clamp(1, 10);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.descriptor.enabled = enabled;
        self
    }

    pub fn marker(mut self, marker: Marker) -> Self {
        self.descriptor.marker = marker;
        self
    }

    pub fn marker_file(mut self, path: impl Into<String>) -> Self {
        self.descriptor.marker_file = Some(path.into());
        self
    }

    pub fn repatch(mut self, repatch: bool) -> Self {
        self.descriptor.repatch = repatch;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.descriptor.parallel = parallel;
        self
    }

    pub fn targets(mut self, targets: TargetSpec) -> Self {
        self.descriptor.targets = targets;
        self
    }

    pub fn rule(
        mut self,
        pattern: impl Into<String>,
        replacement: impl Into<String>,
        is_regex: bool,
    ) -> Self {
        self.rules.push(RuleDef {
            pattern: pattern.into(),
            replacement: replacement.into(),
            is_regex,
        });
        self
    }

    pub fn literal(self, pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.rule(pattern, replacement, false)
    }

    pub fn regex(self, pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.rule(pattern, replacement, true)
    }

    pub fn specialized(mut self, params: Specialized) -> Self {
        self.specialized = Some(params);
        self
    }

    fn display_name(&self) -> String {
        if self.name_set {
            return self.descriptor.name.clone();
        }
        match self.specialized {
            Some(Specialized::Brightness { multiplier }) => format!("Brightness x{multiplier:.2}"),
            Some(Specialized::SdrScale { multiplier }) => format!("SDR Scale x{multiplier:.2}"),
            Some(Specialized::Gamma { gamma }) => format!("Gamma {gamma:.1}"),
            Some(Specialized::CameraZoom { zoom_level }) => format!("Camera Zoom {zoom_level}"),
            Some(Specialized::EnvParticles) => "Environmental Particles".to_string(),
            Some(Specialized::GlobalIllumination {
                env_light,
                indirect_light,
            }) => format!("Global Illumination {env_light:.2}/{indirect_light:.2}"),
            None => self.descriptor.name.clone(),
        }
    }

    pub fn build(self) -> Result<Patch, ConfigError> {
        let mut descriptor = self.descriptor.clone();
        descriptor.name = self.display_name();
        let id = descriptor.id.clone();
        let invalid = |pattern: &str, error: regex::Error| {
            ConfigError::validation(ValidationError {
                issues: vec![ValidationIssue::InvalidRegex {
                    patch_id: Some(id.clone()),
                    pattern: pattern.to_string(),
                    message: error.to_string(),
                }],
            })
        };

        match self.specialized {
            Some(params) => {
                if params.requires_marker_file() && descriptor.marker_file.is_none() {
                    return Err(ConfigError::validation(ValidationError {
                        issues: vec![ValidationIssue::MissingField {
                            patch_id: Some(id.clone()),
                            field: "marker_file",
                        }],
                    }));
                }
                let marker = descriptor.marker.to_string();
                Patch::specialized(descriptor, params).map_err(|e| invalid(&marker, e))
            }
            None => {
                let mut rules = Vec::with_capacity(self.rules.len());
                for def in &self.rules {
                    let rule = if def.is_regex {
                        Rule::regex(&def.pattern, def.replacement.clone())
                            .map_err(|e| invalid(&def.pattern, e))?
                    } else {
                        Rule::literal(def.pattern.clone(), def.replacement.clone())
                    };
                    rules.push(rule);
                }
                Ok(Patch::declarative(descriptor, rules))
            }
        }
    }
}
