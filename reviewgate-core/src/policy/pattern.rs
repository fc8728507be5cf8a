//! Glob patterns used by policy rules.

use std::fmt;

use globset::{Glob, GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};

use super::PolicyError;

const GLOB_METACHARACTERS: [char; 4] = ['*', '?', '[', '{'];

/// A compiled glob pattern that remembers its source text.
///
/// `*` stays within one path segment, `**` crosses segments.
#[derive(Clone)]
pub struct Pattern {
    raw: String,
    matcher: GlobMatcher,
    specificity: usize,
}

impl Pattern {
    pub fn new(raw: impl Into<String>) -> Result<Self, PolicyError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(PolicyError::InvalidPattern {
                pattern: raw,
                message: "pattern is empty".to_string(),
            });
        }

        let glob: Glob = GlobBuilder::new(&raw)
            .literal_separator(true)
            .build()
            .map_err(|e| PolicyError::InvalidPattern {
                pattern: raw.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            specificity: literal_prefix_len(&raw),
            matcher: glob.compile_matcher(),
            raw,
        })
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.matcher.is_match(candidate)
    }

    /// Length of the literal prefix, in characters. `modules/network/**` is
    /// more specific than `modules/**`.
    pub fn specificity(&self) -> usize {
        self.specificity
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Number of characters before the first glob metacharacter.
pub fn literal_prefix_len(raw: &str) -> usize {
    raw.chars()
        .take_while(|c| !GLOB_METACHARACTERS.contains(c))
        .count()
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.raw).finish()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Pattern {}

impl Serialize for Pattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}
