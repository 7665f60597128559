//! Literal and regex replacement rules for declarative patches.

use regex::Regex;
use std::borrow::Cow;

#[derive(Debug, Clone)]
enum Matcher {
    Literal(String),
    Regex(Regex),
}

/// One substitution. Regex replacements may reference capture groups as
/// `$1` or `${name}`.
#[derive(Debug, Clone)]
pub struct Rule {
    matcher: Matcher,
    replacement: String,
}

impl Rule {
    pub fn literal(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            matcher: Matcher::Literal(pattern.into()),
            replacement: replacement.into(),
        }
    }

    pub fn regex(pattern: &str, replacement: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            matcher: Matcher::Regex(Regex::new(pattern)?),
            replacement: replacement.into(),
        })
    }

    pub fn apply<'t>(&self, text: &'t str) -> Cow<'t, str> {
        match &self.matcher {
            Matcher::Literal(pattern) if pattern.is_empty() => Cow::Borrowed(text),
            Matcher::Literal(pattern) => {
                if text.contains(pattern.as_str()) {
                    Cow::Owned(text.replace(pattern.as_str(), &self.replacement))
                } else {
                    Cow::Borrowed(text)
                }
            }
            Matcher::Regex(re) => re.replace_all(text, self.replacement.as_str()),
        }
    }
}

/// Apply `rules` in order, each seeing the previous rule's output.
pub fn apply_all(rules: &[Rule], text: &str) -> String {
    rules
        .iter()
        .fold(text.to_string(), |acc, rule| rule.apply(&acc).into_owned())
}
