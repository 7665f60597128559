//! Patch model.
//!
//! A [`Patch`] is a descriptor plus one tagged variant: a declarative list of
//! replacement rules, or a specialized parameterized transformation.

pub mod rules;
pub mod specialized;

pub use rules::Rule;
pub use specialized::{Specialized, SpecializedPatch};

use crate::archive::{Archive, Record};
use crate::error::PatchError;
use crate::marker::Marker;
use crate::select::{select, TargetSpec};
use crate::vpath;
use std::borrow::Cow;

/// Outcome of transforming one file's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    Unchanged,
    Changed(String),
    /// The file carries the marker but the previously inserted line could
    /// not be found again.
    NoMatch,
}

impl Transform {
    pub(crate) fn from_edit(original: &str, edited: Cow<'_, str>) -> Self {
        if edited == original {
            Transform::Unchanged
        } else {
            Transform::Changed(edited.into_owned())
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatchDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    /// Estimated visual/performance impact, 1 to 10.
    pub impact_level: u8,
    pub enabled: bool,
    pub targets: TargetSpec,
    pub marker: Marker,
    /// Single file probed to decide applied/not-applied.
    pub marker_file: Option<String>,
    /// Re-application with new parameters is expected.
    pub repatch: bool,
    /// Process target files on the rayon pool.
    pub parallel: bool,
}

impl PatchDescriptor {
    pub fn new(id: impl Into<String>, marker: Marker) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            category: "General".to_string(),
            impact_level: 5,
            enabled: true,
            targets: TargetSpec::default(),
            marker,
            marker_file: None,
            repatch: false,
            parallel: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PatchKind {
    Declarative { rules: Vec<Rule> },
    Specialized(SpecializedPatch),
}

#[derive(Debug, Clone)]
pub struct Patch {
    descriptor: PatchDescriptor,
    kind: PatchKind,
}

impl Patch {
    pub fn declarative(descriptor: PatchDescriptor, rules: Vec<Rule>) -> Self {
        Self {
            descriptor,
            kind: PatchKind::Declarative { rules },
        }
    }

    pub fn specialized(
        descriptor: PatchDescriptor,
        params: Specialized,
    ) -> Result<Self, regex::Error> {
        let logic = SpecializedPatch::new(
            params,
            descriptor.marker.clone(),
            descriptor.marker_file.clone(),
        )?;
        Ok(Self {
            descriptor,
            kind: PatchKind::Specialized(logic),
        })
    }

    pub fn descriptor(&self) -> &PatchDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> &PatchKind {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn marker(&self) -> &Marker {
        &self.descriptor.marker
    }

    pub fn specialized_params(&self) -> Option<Specialized> {
        match &self.kind {
            PatchKind::Specialized(logic) => Some(logic.params()),
            PatchKind::Declarative { .. } => None,
        }
    }

    pub fn transform(&self, path: &str, text: &str) -> Transform {
        match &self.kind {
            PatchKind::Declarative { rules } => {
                Transform::from_edit(text, Cow::Owned(rules::apply_all(rules, text)))
            }
            PatchKind::Specialized(logic) => logic.transform(path, text),
        }
    }

    /// Applied parameter recorded in `text`, for specialized patches.
    pub fn probe(&self, text: &str) -> Option<f64> {
        match &self.kind {
            PatchKind::Specialized(logic) => logic.probe(text),
            PatchKind::Declarative { .. } => None,
        }
    }

    /// Records the patch visits, in order: the marker file first when the
    /// variant needs one, then every target not already listed.
    pub fn work_list<A: Archive + ?Sized>(&self, archive: &A) -> Result<Vec<Record>, PatchError> {
        let mut records = Vec::new();
        let needs_marker_file = self
            .specialized_params()
            .is_some_and(|params| params.requires_marker_file());
        if needs_marker_file {
            let file = self.descriptor.marker_file.as_deref().ok_or_else(|| {
                PatchError::Config(format!("patch '{}' has no marker file", self.id()))
            })?;
            let record = archive
                .find(file)
                .ok_or_else(|| PatchError::NotFound(format!("marker file {file}")))?;
            records.push(record);
        }
        for record in select(archive, &self.descriptor.targets) {
            if !records.iter().any(|r: &Record| vpath::eq(r.path(), record.path())) {
                records.push(record);
            }
        }
        Ok(records)
    }
}
