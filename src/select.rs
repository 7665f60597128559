//! Target selection.

use crate::archive::{Archive, Record};
use crate::vpath;
use serde::Deserialize;

/// Declarative rule set choosing which archive entries a patch considers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TargetSpec {
    /// Exact paths. Always selected when present, exclusions notwithstanding.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default, alias = "basePaths")]
    pub base_paths: Vec<String>,
    /// Filename wildcards (`*` only), case-insensitive.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default, alias = "excludePaths")]
    pub exclude_paths: Vec<String>,
}

impl TargetSpec {
    pub fn files<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.extensions.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.files.iter().any(|file| vpath::eq(file, path)) {
            return true;
        }

        let Some(ext) = vpath::extension(path) else {
            return false;
        };
        if !self
            .extensions
            .iter()
            .any(|wanted| vpath::normalize_extension(wanted) == ext)
        {
            return false;
        }
        if !self.base_paths.is_empty()
            && !self
                .base_paths
                .iter()
                .any(|base| vpath::starts_with(path, base))
        {
            return false;
        }
        if self
            .exclude_paths
            .iter()
            .any(|excluded| vpath::starts_with(path, excluded))
        {
            return false;
        }
        if !self.patterns.is_empty() {
            let name = vpath::file_name(path);
            return self
                .patterns
                .iter()
                .any(|pattern| vpath::wildcard_match(name, pattern));
        }
        true
    }
}

/// Records of `archive` matched by `spec`, in archive enumeration order.
pub fn select<A: Archive + ?Sized>(archive: &A, spec: &TargetSpec) -> Vec<Record> {
    archive
        .records()
        .into_iter()
        .filter(|record| spec.matches(record.path()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use proptest::prelude::*;

    fn shader_spec() -> TargetSpec {
        TargetSpec {
            extensions: vec![".hlsl".into()],
            base_paths: vec!["shaders/".into()],
            exclude_paths: vec!["shaders/legacy/".into()],
            ..TargetSpec::default()
        }
    }

    #[test]
    fn test_extension_base_path_and_exclusion() {
        let spec = shader_spec();
        assert!(!spec.matches("shaders/legacy/fog.hlsl"));
        assert!(spec.matches("shaders/postfx/fog.hlsl"));
        assert!(!spec.matches("textures/fog.hlsl"));
        assert!(spec.matches("Shaders\\PostFX\\Fog.HLSL"));
    }

    #[test]
    fn test_explicit_files_ignore_exclusions() {
        let mut spec = shader_spec();
        spec.files.push("Shaders/Legacy/fog.hlsl".into());
        assert!(spec.matches("shaders/legacy/fog.hlsl"));
        assert!(!spec.matches("shaders/legacy/other.hlsl"));
    }

    #[test]
    fn test_patterns_filter_file_names() {
        let spec = TargetSpec {
            extensions: vec!["aoc".into()],
            patterns: vec!["*fog*.aoc".into(), "*mist*.aoc".into()],
            exclude_paths: vec!["metadata/effects/spells/".into()],
            ..TargetSpec::default()
        };
        assert!(spec.matches("metadata/effects/environment/FogBank.aoc"));
        assert!(spec.matches("metadata/effects/environment/swamp_mist_01.aoc"));
        assert!(!spec.matches("metadata/effects/environment/dust.aoc"));
        assert!(!spec.matches("metadata/effects/spells/fogbolt.aoc"));
    }

    #[test]
    fn test_select_over_archive() {
        let archive = MemoryArchive::from_entries([
            ("shaders/legacy/fog.hlsl", "a"),
            ("shaders/postfx/fog.hlsl", "b"),
            ("textures/fog.hlsl", "c"),
            ("shaders/postfx/fog.txt", "d"),
        ]);
        let selected: Vec<String> = select(&archive, &shader_spec())
            .iter()
            .map(|r| r.path().to_string())
            .collect();
        assert_eq!(selected, vec!["shaders/postfx/fog.hlsl"]);
    }

    #[test]
    fn test_deserialize_camel_case_aliases() {
        let spec: TargetSpec = serde_json::from_str(
            r#"{"files":["a.ot"],"extensions":[".hlsl"],"basePaths":["shaders/"],"excludePaths":["shaders/old/"]}"#,
        )
        .unwrap();
        assert_eq!(spec.base_paths, vec!["shaders/"]);
        assert_eq!(spec.exclude_paths, vec!["shaders/old/"]);
    }

    proptest! {
        #[test]
        fn prop_excluded_prefix_never_selected(name in "[a-z]{1,8}") {
            let spec = shader_spec();
            let excluded = format!("shaders/legacy/{name}.hlsl");
            let included = format!("shaders/postfx/{name}.hlsl");
            prop_assert!(!spec.matches(&excluded));
            prop_assert!(spec.matches(&included));
        }
    }
}
