//! Pure policy resolution.
//!
//! `resolve` maps a repository, a target branch and a set of changed files to
//! the reviewers, approval count and workflows the PR needs. It has no side
//! effects; the same inputs always produce the same `Resolution`.
//!
//! Combination rules:
//! - For each changed file, every matching rule applies, unless the most
//!   specific matching rule is `exclusive`, in which case only the rules of
//!   that specificity apply. Rules of equal specificity always combine.
//! - Across files: reviewers and workflows are unioned (workflows keep rule
//!   order), required approvals take the maximum.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::rules::PolicySet;
use crate::model::{Login, ReviewRequirement};

/// Inputs to a resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionRequest<'a> {
    /// `owner/name`.
    pub repository: &'a str,
    pub target_branch: &'a str,
    pub changed_files: &'a BTreeSet<String>,
    /// Excluded from the reviewer set: nobody can review their own PR.
    pub author: Option<&'a Login>,
}

/// Combined rules disagreed on the approval count; the maximum was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConflict {
    /// Rule label to the count that rule asked for.
    pub counts: BTreeMap<String, u32>,
    pub chosen: u32,
}

/// Output of a resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub requirement: ReviewRequirement,
    /// Workflows to dispatch, in order.
    pub workflows: Vec<String>,
    /// Labels of the rules that applied, in rule order.
    pub matched_rules: Vec<String>,
    pub conflict: Option<PolicyConflict>,
}

pub fn resolve(policy: &PolicySet, request: &ResolutionRequest<'_>) -> Resolution {
    let candidates: Vec<usize> = policy
        .rules
        .iter()
        .enumerate()
        .filter(|(_, rule)| {
            rule.matches_repository(request.repository)
                && rule.matches_branch(request.target_branch)
        })
        .map(|(index, _)| index)
        .collect();

    let mut applying: BTreeSet<usize> = BTreeSet::new();

    if request.changed_files.is_empty() {
        applying.extend(
            candidates
                .iter()
                .copied()
                .filter(|&i| policy.rules[i].path_pattern.is_none()),
        );
    }

    for path in request.changed_files {
        let matching: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| policy.rules[i].matches_path(path))
            .collect();

        let Some(max_specificity) = matching
            .iter()
            .map(|&i| policy.rules[i].path_specificity())
            .max()
        else {
            continue;
        };

        let most_specific: Vec<usize> = matching
            .iter()
            .copied()
            .filter(|&i| policy.rules[i].path_specificity() == max_specificity)
            .collect();

        if most_specific.iter().any(|&i| policy.rules[i].exclusive) {
            applying.extend(most_specific);
        } else {
            applying.extend(matching);
        }
    }

    combine(policy, &applying, request.author)
}

fn combine(policy: &PolicySet, applying: &BTreeSet<usize>, author: Option<&Login>) -> Resolution {
    let mut resolution = Resolution::default();
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();

    for &index in applying {
        let rule = &policy.rules[index];
        let label = policy.label(index);

        for reviewer in &rule.reviewers {
            if Some(reviewer) != author {
                resolution.requirement.reviewers.insert(reviewer.clone());
            }
        }

        for workflow in &rule.workflows {
            if !resolution.workflows.contains(workflow) {
                resolution.workflows.push(workflow.clone());
            }
        }

        resolution.requirement.required_approvals = resolution
            .requirement
            .required_approvals
            .max(rule.required_approvals);

        // Workflow-only rules ask for no approvals and cannot disagree.
        if rule.required_approvals > 0 {
            counts.insert(label.clone(), rule.required_approvals);
        }
        resolution.matched_rules.push(label);
    }

    let distinct: BTreeSet<u32> = counts.values().copied().collect();
    if distinct.len() > 1 {
        resolution.conflict = Some(PolicyConflict {
            counts,
            chosen: resolution.requirement.required_approvals,
        });
    }

    resolution
}
