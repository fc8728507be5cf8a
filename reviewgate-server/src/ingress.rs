//! Webhook payload parsing and normalization.
//!
//! Signature verification happens in the webhook middleware before anything
//! here runs. This module only turns a trusted `(event type, body)` pair into
//! the events the tracker understands.

use chrono::{DateTime, Utc};
use reviewgate_core::{ApprovalRecord, CommitSha, Login, PrKey, ReviewDecision};
use serde::Deserialize;

use crate::error::GateError;

#[derive(Debug, Deserialize)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct Repository {
    pub name: String,
    pub owner: User,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestRef {
    pub sha: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub head: PullRequestRef,
    pub base: PullRequestRef,
    pub user: User,
    #[serde(default)]
    pub merged: bool,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub pull_request: PullRequest,
    pub repository: Repository,
    pub installation: Installation,
}

#[derive(Debug, Deserialize)]
pub struct Review {
    pub id: u64,
    pub user: User,
    pub state: String,
    pub commit_id: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestReviewEvent {
    pub action: String,
    pub review: Review,
    pub pull_request: PullRequest,
    pub repository: Repository,
    pub installation: Installation,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestNumber {
    pub number: u64,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowRunPayload {
    pub id: u64,
    #[serde(default = "first_attempt")]
    pub run_attempt: u32,
    pub head_sha: String,
    pub conclusion: Option<String>,
    pub path: String,
    #[serde(default)]
    pub pull_requests: Vec<PullRequestNumber>,
}

fn first_attempt() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct WorkflowRunEvent {
    pub action: String,
    pub workflow_run: WorkflowRunPayload,
    pub repository: Repository,
    pub installation: Installation,
}

/// An inbound event in the tracker's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    /// Opened, reopened, ready for review or pushed to. Changed files are
    /// fetched separately.
    PrOpened {
        key: PrKey,
        installation_id: u64,
        revision: CommitSha,
        source_branch: String,
        target_branch: String,
        author: Login,
    },
    ReviewSubmitted {
        key: PrKey,
        installation_id: u64,
        review: ApprovalRecord,
    },
    /// `pr_number` is `None` for runs the platform did not associate with a
    /// PR (e.g. `workflow_dispatch` runs); those are matched by revision.
    WorkflowCompleted {
        repo_owner: String,
        repo_name: String,
        pr_number: Option<u64>,
        installation_id: u64,
        workflow: String,
        revision: CommitSha,
        run_id: u64,
        run_attempt: u32,
        succeeded: bool,
    },
    PrClosed {
        key: PrKey,
        installation_id: u64,
        merged: bool,
    },
}

impl NormalizedEvent {
    pub fn installation_id(&self) -> u64 {
        match self {
            Self::PrOpened {
                installation_id, ..
            }
            | Self::ReviewSubmitted {
                installation_id, ..
            }
            | Self::WorkflowCompleted {
                installation_id, ..
            }
            | Self::PrClosed {
                installation_id, ..
            } => *installation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingress {
    Events(Vec<NormalizedEvent>),
    /// Acknowledged but not acted on.
    Ignored(String),
}

fn parse<'a, T: Deserialize<'a>>(event_type: &str, body: &'a [u8]) -> Result<T, GateError> {
    serde_json::from_slice(body).map_err(|e| GateError::malformed(event_type, e.to_string()))
}

fn pr_key(repository: &Repository, number: u64) -> PrKey {
    PrKey::new(&repository.owner.login, &repository.name, number)
}

/// Normalize a verified webhook body by its `X-GitHub-Event` type.
pub fn normalize(event_type: &str, body: &[u8]) -> Result<Ingress, GateError> {
    match event_type {
        "pull_request" => normalize_pull_request(parse(event_type, body)?),
        "pull_request_review" => normalize_review(parse(event_type, body)?),
        "workflow_run" => normalize_workflow_run(parse(event_type, body)?),
        "ping" => Ok(Ingress::Ignored("ping".to_string())),
        other => Ok(Ingress::Ignored(format!("unhandled event type {}", other))),
    }
}

fn normalize_pull_request(event: PullRequestEvent) -> Result<Ingress, GateError> {
    let key = pr_key(&event.repository, event.pull_request.number);
    let installation_id = event.installation.id;
    let pr = event.pull_request;

    let normalized = match event.action.as_str() {
        "opened" | "reopened" | "synchronize" | "ready_for_review" => NormalizedEvent::PrOpened {
            key,
            installation_id,
            revision: CommitSha::from(pr.head.sha),
            source_branch: pr.head.ref_name,
            target_branch: pr.base.ref_name,
            author: Login::new(pr.user.login),
        },
        "closed" => NormalizedEvent::PrClosed {
            key,
            installation_id,
            merged: pr.merged,
        },
        other => {
            return Ok(Ingress::Ignored(format!(
                "pull_request action {}",
                other
            )))
        }
    };
    Ok(Ingress::Events(vec![normalized]))
}

fn normalize_review(event: PullRequestReviewEvent) -> Result<Ingress, GateError> {
    let decision = match (event.action.as_str(), event.review.state.as_str()) {
        ("dismissed", _) => ReviewDecision::Dismissed,
        ("submitted", "approved") => ReviewDecision::Approve,
        ("submitted", "changes_requested") => ReviewDecision::RequestChanges,
        ("submitted", "commented") => {
            return Ok(Ingress::Ignored("comment-only review".to_string()))
        }
        ("submitted", state) => {
            return Err(GateError::malformed(
                "pull_request_review",
                format!("unknown review state {}", state),
            ))
        }
        (action, _) => {
            return Ok(Ingress::Ignored(format!(
                "pull_request_review action {}",
                action
            )))
        }
    };

    let submitted_at = match (event.review.submitted_at, decision) {
        (Some(at), _) => at,
        // Dismissal payloads can omit the timestamp.
        (None, ReviewDecision::Dismissed) => Utc::now(),
        (None, _) => {
            return Err(GateError::malformed(
                "pull_request_review",
                "review.submitted_at is missing",
            ))
        }
    };

    Ok(Ingress::Events(vec![NormalizedEvent::ReviewSubmitted {
        key: pr_key(&event.repository, event.pull_request.number),
        installation_id: event.installation.id,
        review: ApprovalRecord {
            reviewer: Login::new(event.review.user.login),
            review_id: event.review.id,
            revision: CommitSha::from(event.review.commit_id),
            submitted_at,
            decision,
        },
    }]))
}

fn normalize_workflow_run(event: WorkflowRunEvent) -> Result<Ingress, GateError> {
    if event.action != "completed" {
        return Ok(Ingress::Ignored(format!(
            "workflow_run action {}",
            event.action
        )));
    }

    let run = event.workflow_run;
    let workflow = workflow_file_name(&run.path).ok_or_else(|| {
        GateError::malformed("workflow_run", format!("unusable workflow path {:?}", run.path))
    })?;
    let succeeded = matches!(
        run.conclusion.as_deref(),
        Some("success" | "neutral" | "skipped")
    );

    let make = |pr_number| NormalizedEvent::WorkflowCompleted {
        repo_owner: event.repository.owner.login.clone(),
        repo_name: event.repository.name.clone(),
        pr_number,
        installation_id: event.installation.id,
        workflow: workflow.clone(),
        revision: CommitSha::from(run.head_sha.as_str()),
        run_id: run.id,
        run_attempt: run.run_attempt,
        succeeded,
    };

    let events = if run.pull_requests.is_empty() {
        vec![make(None)]
    } else {
        run.pull_requests
            .iter()
            .map(|pr| make(Some(pr.number)))
            .collect()
    };
    Ok(Ingress::Events(events))
}

/// `.github/workflows/plan.yml@refs/heads/main` -> `plan.yml`
fn workflow_file_name(path: &str) -> Option<String> {
    let path = path.split('@').next().unwrap_or(path);
    let name = path.rsplit('/').next().unwrap_or(path);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repository() -> serde_json::Value {
        json!({"name": "infra", "owner": {"login": "acme"}})
    }

    fn pull_request(merged: bool) -> serde_json::Value {
        json!({
            "number": 7,
            "head": {"sha": "abc123", "ref": "feature/vpc"},
            "base": {"sha": "def456", "ref": "main"},
            "user": {"login": "author"},
            "merged": merged,
        })
    }

    fn body(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    fn single(ingress: Ingress) -> NormalizedEvent {
        match ingress {
            Ingress::Events(mut events) if events.len() == 1 => events.remove(0),
            other => panic!("expected one event, got {:?}", other),
        }
    }

    #[test]
    fn test_pull_request_actions_map_to_pr_opened() {
        for action in ["opened", "reopened", "synchronize", "ready_for_review"] {
            let payload = body(json!({
                "action": action,
                "pull_request": pull_request(false),
                "repository": repository(),
                "installation": {"id": 42},
            }));
            let event = single(normalize("pull_request", &payload).unwrap());
            assert_eq!(
                event,
                NormalizedEvent::PrOpened {
                    key: PrKey::new("acme", "infra", 7),
                    installation_id: 42,
                    revision: CommitSha::from("abc123"),
                    source_branch: "feature/vpc".to_string(),
                    target_branch: "main".to_string(),
                    author: Login::new("author"),
                }
            );
        }
    }

    #[test]
    fn test_closed_carries_merged_flag() {
        let payload = body(json!({
            "action": "closed",
            "pull_request": pull_request(true),
            "repository": repository(),
            "installation": {"id": 42},
        }));
        assert_eq!(
            single(normalize("pull_request", &payload).unwrap()),
            NormalizedEvent::PrClosed {
                key: PrKey::new("acme", "infra", 7),
                installation_id: 42,
                merged: true,
            }
        );
    }

    #[test]
    fn test_other_pull_request_actions_are_ignored() {
        let payload = body(json!({
            "action": "labeled",
            "pull_request": pull_request(false),
            "repository": repository(),
            "installation": {"id": 42},
        }));
        assert!(matches!(
            normalize("pull_request", &payload).unwrap(),
            Ingress::Ignored(_)
        ));
    }

    fn review_payload(action: &str, state: &str) -> Vec<u8> {
        body(json!({
            "action": action,
            "review": {
                "id": 99,
                "user": {"login": "alice"},
                "state": state,
                "commit_id": "abc123",
                "submitted_at": "2024-05-01T12:00:00Z",
            },
            "pull_request": pull_request(false),
            "repository": repository(),
            "installation": {"id": 42},
        }))
    }

    #[test]
    fn test_review_decisions() {
        let decision = |action, state| match single(
            normalize("pull_request_review", &review_payload(action, state)).unwrap(),
        ) {
            NormalizedEvent::ReviewSubmitted { review, .. } => review.decision,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(decision("submitted", "approved"), ReviewDecision::Approve);
        assert_eq!(
            decision("submitted", "changes_requested"),
            ReviewDecision::RequestChanges
        );
        assert_eq!(decision("dismissed", "dismissed"), ReviewDecision::Dismissed);
    }

    #[test]
    fn test_review_record_fields() {
        let event = single(
            normalize("pull_request_review", &review_payload("submitted", "approved")).unwrap(),
        );
        let NormalizedEvent::ReviewSubmitted { key, review, .. } = event else {
            panic!("expected a review");
        };
        assert_eq!(key, PrKey::new("acme", "infra", 7));
        assert_eq!(review.reviewer, Login::new("alice"));
        assert_eq!(review.review_id, 99);
        assert_eq!(review.revision, CommitSha::from("abc123"));
        assert_eq!(review.submitted_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_comment_reviews_are_ignored() {
        assert!(matches!(
            normalize("pull_request_review", &review_payload("submitted", "commented")).unwrap(),
            Ingress::Ignored(_)
        ));
    }

    #[test]
    fn test_unknown_review_state_is_malformed() {
        let err =
            normalize("pull_request_review", &review_payload("submitted", "bogus")).unwrap_err();
        assert!(matches!(err, GateError::MalformedEvent { .. }));
    }

    fn workflow_run_payload(conclusion: &str, pull_requests: serde_json::Value) -> Vec<u8> {
        body(json!({
            "action": "completed",
            "workflow_run": {
                "id": 555,
                "run_attempt": 2,
                "head_sha": "abc123",
                "conclusion": conclusion,
                "path": ".github/workflows/terraform-plan.yml",
                "pull_requests": pull_requests,
            },
            "repository": repository(),
            "installation": {"id": 42},
        }))
    }

    #[test]
    fn test_workflow_run_one_event_per_pull_request() {
        let payload = workflow_run_payload("success", json!([{"number": 7}, {"number": 8}]));
        let Ingress::Events(events) = normalize("workflow_run", &payload).unwrap() else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            NormalizedEvent::WorkflowCompleted {
                repo_owner: "acme".to_string(),
                repo_name: "infra".to_string(),
                pr_number: Some(7),
                installation_id: 42,
                workflow: "terraform-plan.yml".to_string(),
                revision: CommitSha::from("abc123"),
                run_id: 555,
                run_attempt: 2,
                succeeded: true,
            }
        );
    }

    #[test]
    fn test_workflow_run_conclusions() {
        let succeeded = |conclusion| match single(
            normalize("workflow_run", &workflow_run_payload(conclusion, json!([{"number": 7}])))
                .unwrap(),
        ) {
            NormalizedEvent::WorkflowCompleted { succeeded, .. } => succeeded,
            other => panic!("unexpected {:?}", other),
        };
        assert!(succeeded("success"));
        assert!(succeeded("skipped"));
        assert!(!succeeded("failure"));
        assert!(!succeeded("cancelled"));
        assert!(!succeeded("timed_out"));
    }

    #[test]
    fn test_workflow_run_without_pull_request_is_matched_later() {
        let payload = workflow_run_payload("success", json!([]));
        assert!(matches!(
            single(normalize("workflow_run", &payload).unwrap()),
            NormalizedEvent::WorkflowCompleted { pr_number: None, .. }
        ));
    }

    #[test]
    fn test_workflow_file_name() {
        assert_eq!(
            workflow_file_name(".github/workflows/plan.yml").as_deref(),
            Some("plan.yml")
        );
        assert_eq!(
            workflow_file_name(".github/workflows/plan.yml@refs/heads/main").as_deref(),
            Some("plan.yml")
        );
        assert_eq!(workflow_file_name(".github/workflows/"), None);
    }

    #[test]
    fn test_schema_mismatch_is_malformed() {
        let err = normalize("pull_request", br#"{"action": "opened"}"#).unwrap_err();
        assert!(matches!(err, GateError::MalformedEvent { .. }));
        let err = normalize("workflow_run", b"not json").unwrap_err();
        assert!(matches!(err, GateError::MalformedEvent { .. }));
    }

    #[test]
    fn test_ping_and_unknown_events_are_ignored() {
        assert!(matches!(
            normalize("ping", b"{}").unwrap(),
            Ingress::Ignored(_)
        ));
        assert!(matches!(
            normalize("issues", b"{}").unwrap(),
            Ingress::Ignored(_)
        ));
    }
}
