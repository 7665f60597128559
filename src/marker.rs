//! Patch markers.
//!
//! A marker is a literal token such as `{{PATCHER_fog}}` that a patch embeds
//! as a trailing comment in every file it modifies. Detection is an exact,
//! case-sensitive substring match; nothing is normalized.

use std::fmt;

/// Namespace used when a config does not spell out its marker.
pub const DEFAULT_NAMESPACE: &str = "PATCHER";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Marker(String);

impl Marker {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Default marker for a patch id: `{{NAMESPACE_<lowercased-id>}}`.
    pub fn for_patch(namespace: &str, patch_id: &str) -> Self {
        Self(format!("{{{{{namespace}_{}}}}}", patch_id.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_in(&self, text: &str) -> bool {
        text.contains(self.0.as_str())
    }

    /// Regex-escaped form for embedding in patterns.
    pub fn escaped(&self) -> String {
        regex::escape(&self.0)
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
