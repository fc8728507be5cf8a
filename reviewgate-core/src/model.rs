//! Domain types shared by the policy resolver, the assignment tracker and the
//! merge gate evaluator.
//!
//! Identifiers are newtypes so that a commit SHA can never be passed where a
//! reviewer login is expected.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Newtype for commit SHA to prevent mixing with other strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitSha(pub String);

impl CommitSha {
    /// Returns a truncated SHA for display (first 7 characters).
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(7)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for CommitSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CommitSha {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitSha {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A platform account login.
///
/// GitHub logins are case-insensitive, so the value is stored lowercased and
/// two logins compare equal regardless of how the payload spelled them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Login(String);

impl Login {
    pub fn new(login: impl AsRef<str>) -> Self {
        Self(login.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Login {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Login {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Login> for String {
    fn from(login: Login) -> Self {
        login.0
    }
}

/// Unique identifier for a pull request across repositories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrKey {
    pub repo_owner: String,
    pub repo_name: String,
    pub pr_number: u64,
}

impl PrKey {
    pub fn new(repo_owner: impl Into<String>, repo_name: impl Into<String>, pr_number: u64) -> Self {
        Self {
            repo_owner: repo_owner.into(),
            repo_name: repo_name.into(),
            pr_number,
        }
    }

    /// `owner/name`, the form repository patterns are matched against.
    pub fn full_repo(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }
}

impl fmt::Display for PrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.repo_owner, self.repo_name, self.pr_number)
    }
}

/// What a reviewer said in a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewDecision {
    Approve,
    RequestChanges,
    /// A previous review by this reviewer was dismissed.
    Dismissed,
}

impl ReviewDecision {
    fn rank(self) -> u8 {
        match self {
            Self::Approve => 0,
            Self::RequestChanges => 1,
            Self::Dismissed => 2,
        }
    }
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::RequestChanges => write!(f, "request-changes"),
            Self::Dismissed => write!(f, "dismissed"),
        }
    }
}

/// A single review decision. Records are append-only; the latest one per
/// reviewer is what the gate looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub reviewer: Login,
    pub review_id: u64,
    /// Head revision the review was submitted against.
    pub revision: CommitSha,
    pub submitted_at: DateTime<Utc>,
    pub decision: ReviewDecision,
}

impl ApprovalRecord {
    /// Ordering key for "latest". Uses the platform timestamp rather than
    /// arrival order, so redelivered or reordered webhooks converge. A
    /// dismissal carries the timestamp and id of the review it dismisses, so
    /// the decision breaks the tie.
    pub fn order_key(&self) -> (DateTime<Utc>, u64, u8) {
        (self.submitted_at, self.review_id, self.decision.rank())
    }

    pub fn supersedes(&self, other: &ApprovalRecord) -> bool {
        self.order_key() > other.order_key()
    }
}

/// Reviewers and approval count a PR revision needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequirement {
    pub reviewers: BTreeSet<Login>,
    pub required_approvals: u32,
}

impl ReviewRequirement {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Status of a dispatched workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    /// Not yet triggered for the current revision.
    Pending,
    /// Triggered; waiting for the completion webhook.
    Running,
    Succeeded,
    Failed,
    /// The trigger call failed transiently and is backing off.
    Retried,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retried => "retried",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One required workflow for one revision of a PR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Workflow reference as written in the policy (e.g. `terraform-plan.yml`).
    pub workflow: String,
    pub revision: CommitSha,
    pub status: RunStatus,
    /// Number of trigger attempts made so far.
    pub attempts: u32,
    /// Platform run id of the latest completion seen, with its attempt number.
    /// Later completions only win if their `(run_id, run_attempt)` is higher.
    pub completion: Option<(u64, u32)>,
}

impl WorkflowRun {
    pub fn pending(workflow: impl Into<String>, revision: CommitSha) -> Self {
        Self {
            workflow: workflow.into(),
            revision,
            status: RunStatus::Pending,
            attempts: 0,
            completion: None,
        }
    }
}

/// Lifecycle of a tracked pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrLifecycle {
    /// Registered; requirements not yet resolved.
    Open,
    AwaitingApprovals,
    AwaitingChecks,
    Ready,
    Merged,
    Closed,
}

impl PrLifecycle {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Closed)
    }
}

impl fmt::Display for PrLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "Open",
            Self::AwaitingApprovals => "AwaitingApprovals",
            Self::AwaitingChecks => "AwaitingChecks",
            Self::Ready => "Ready",
            Self::Merged => "Merged",
            Self::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Whether the platform still accepts changes to a pull request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestState {
    #[default]
    Open,
    Closed,
    Merged,
}

impl PullRequestState {
    pub fn from_platform(state: &str, merged: bool) -> Self {
        match (state, merged) {
            (_, true) => Self::Merged,
            ("closed", false) => Self::Closed,
            _ => Self::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        *self == Self::Open
    }
}

impl fmt::Display for PullRequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Merged => "merged",
        })
    }
}

/// What the platform says a pull request currently looks like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestSnapshot {
    pub key: PrKey,
    pub revision: CommitSha,
    pub source_branch: String,
    pub target_branch: String,
    pub author: Login,
    pub changed_files: BTreeSet<String>,
    #[serde(default)]
    pub state: PullRequestState,
}
