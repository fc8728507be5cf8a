//! Policy rule definitions and loading.
//!
//! Rules are read from a YAML document of the form:
//!
//! ```yaml
//! rules:
//!   - name: modules
//!     branch_pattern: main
//!     path_pattern: "modules/**"
//!     reviewers: [alice]
//!     required_approvals: 1
//!     workflows: [terraform-validate.yml]
//! ```
//!
//! Rule order matters: it decides the order workflows are dispatched in.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::pattern::Pattern;
use super::PolicyError;
use crate::model::Login;

/// A single policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    /// Label used in logs and conflict reports.
    #[serde(default)]
    pub name: Option<String>,
    /// `owner/name` glob. Absent means every repository.
    #[serde(default)]
    pub repository_pattern: Option<Pattern>,
    /// Target branch glob. Absent means every branch.
    #[serde(default)]
    pub branch_pattern: Option<Pattern>,
    /// Changed-file glob. Absent means every path.
    #[serde(default)]
    pub path_pattern: Option<Pattern>,
    #[serde(default)]
    pub reviewers: Vec<Login>,
    #[serde(default)]
    pub required_approvals: u32,
    #[serde(default)]
    pub workflows: Vec<String>,
    /// When this is the most specific rule matching a file, less specific
    /// rules do not apply to that file.
    #[serde(default)]
    pub exclusive: bool,
}

impl PolicyRule {
    /// Specificity of the path pattern; rules without one match everything
    /// and are the least specific.
    pub fn path_specificity(&self) -> usize {
        self.path_pattern
            .as_ref()
            .map(Pattern::specificity)
            .unwrap_or(0)
    }

    pub fn matches_repository(&self, full_repo: &str) -> bool {
        self.repository_pattern
            .as_ref()
            .map_or(true, |p| p.is_match(full_repo))
    }

    pub fn matches_branch(&self, branch: &str) -> bool {
        self.branch_pattern
            .as_ref()
            .map_or(true, |p| p.is_match(branch))
    }

    pub fn matches_path(&self, path: &str) -> bool {
        self.path_pattern.as_ref().map_or(true, |p| p.is_match(path))
    }
}

/// An immutable, ordered set of rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySet {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl PolicySet {
    pub fn new(rules: Vec<PolicyRule>) -> Result<Self, PolicyError> {
        let set = Self { rules };
        set.validate()?;
        Ok(set)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, PolicyError> {
        let set: PolicySet = serde_yaml::from_str(yaml)?;
        set.validate()?;
        Ok(set)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Display label for the rule at `index`.
    pub fn label(&self, index: usize) -> String {
        match self.rules.get(index).and_then(|r| r.name.as_deref()) {
            Some(name) => name.to_string(),
            None => format!("rules[{}]", index),
        }
    }

    fn validate(&self) -> Result<(), PolicyError> {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.workflows.iter().any(|w| w.trim().is_empty()) {
                return Err(PolicyError::InvalidRule {
                    rule: self.label(index),
                    message: "workflow reference is empty".to_string(),
                });
            }
            if rule.reviewers.iter().any(|r| r.as_str().is_empty()) {
                return Err(PolicyError::InvalidRule {
                    rule: self.label(index),
                    message: "reviewer login is empty".to_string(),
                });
            }
        }

        let mut names = BTreeSet::new();
        for rule in &self.rules {
            if let Some(name) = &rule.name {
                if !names.insert(name.as_str()) {
                    return Err(PolicyError::InvalidRule {
                        rule: name.clone(),
                        message: "duplicate rule name".to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}
