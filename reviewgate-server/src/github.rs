//! GitHub REST client authenticated as a GitHub App installation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use reviewgate_core::{CommitSha, Login, PrKey, PullRequestSnapshot, PullRequestState};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::platform::{CallContext, CommitStatus, Platform, PlatformError};
use crate::recording::{RecordingLogger, RecordingMiddleware, CORRELATION_ID_HEADER};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Installation tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(300);

const FILES_PER_PAGE: usize = 100;

const ACCEPT: &str = "application/vnd.github+json";

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    api_url: String,
    app_id: u64,
    private_key: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Serialize)]
struct RequestReviewersBody<'a> {
    reviewers: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct WorkflowDispatchBody<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
    inputs: WorkflowInputs,
}

#[derive(Debug, Serialize)]
struct WorkflowInputs {
    pr_number: String,
    revision: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    number: u64,
    head: RefResponse,
    base: RefResponse,
    user: UserResponse,
    #[serde(default)]
    state: String,
    #[serde(default)]
    merged: bool,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    sha: String,
    #[serde(rename = "ref")]
    ref_name: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    filename: String,
    #[serde(default)]
    previous_filename: Option<String>,
}

impl GitHubClient {
    pub fn new(app_id: u64, private_key: String) -> Self {
        Self::with_api_url(DEFAULT_API_URL, app_id, private_key, None)
    }

    pub fn with_api_url(
        api_url: impl Into<String>,
        app_id: u64,
        private_key: String,
        recording_logger: Option<RecordingLogger>,
    ) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self {
            client: create_github_client(recording_logger),
            api_url,
            app_id,
            private_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn generate_jwt(&self) -> Result<String, PlatformError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| PlatformError::Unexpected(format!("system clock error: {}", e)))?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: self.app_id,
            iat: now.saturating_sub(60), // Clock skew allowance
            exp: now + 600,
        };

        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|e| PlatformError::Unexpected(format!("invalid private key: {}", e)))?;

        encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .map_err(|e| PlatformError::Unexpected(format!("failed to encode JWT: {}", e)))
    }

    async fn installation_token(&self, installation_id: u64) -> Result<String, PlatformError> {
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                let remaining = expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default();
                if remaining > TOKEN_EXPIRY_BUFFER {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, installation_id
        );

        info!(installation_id, "Requesting new installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", ACCEPT)
            .send()
            .await
            .map_err(|e| PlatformError::Transient(e.to_string()))?;

        let token_response: InstallationTokenResponse = read_json(response).await?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .map_err(|e| PlatformError::Unexpected(format!("bad token expiry: {}", e)))?;
        let expires_at = UNIX_EPOCH
            + Duration::from_secs(u64::try_from(expires_at.timestamp()).unwrap_or_default());

        self.token_cache.write().await.insert(
            installation_id,
            (token_response.token.clone(), expires_at),
        );

        Ok(token_response.token)
    }

    async fn authorized(
        &self,
        ctx: &CallContext,
        builder: RequestBuilder,
    ) -> Result<RequestBuilder, PlatformError> {
        let token = self.installation_token(ctx.installation_id).await?;
        let mut builder = builder
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", ACCEPT)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(cid) = &ctx.correlation_id {
            builder = builder.header(CORRELATION_ID_HEADER, cid);
        }
        Ok(builder)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        url: &str,
    ) -> Result<T, PlatformError> {
        let request = self.authorized(ctx, self.client.get(url)).await?;
        let response = request
            .send()
            .await
            .map_err(|e| PlatformError::Transient(e.to_string()))?;
        read_json(response).await
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        ctx: &CallContext,
        url: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<(), PlatformError> {
        let body = serde_json::to_vec(body)
            .map_err(|e| PlatformError::Unexpected(format!("failed to encode body: {}", e)))?;
        let mut request = self
            .authorized(ctx, self.client.post(url))
            .await?
            .header("Content-Type", "application/json")
            .body(body);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PlatformError::Transient(e.to_string()))?;
        check_status(response).await.map(|_| ())
    }

    fn repo_url(&self, key: &PrKey) -> String {
        format!("{}/repos/{}/{}", self.api_url, key.repo_owner, key.repo_name)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!("GitHub API error: {} - {}", status, body);
    Err(PlatformError::from_status(status.as_u16(), error_message(&body)))
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, PlatformError> {
    let response = check_status(response).await?;
    response
        .json()
        .await
        .map_err(|e| PlatformError::Unexpected(format!("failed to parse response: {}", e)))
}

/// GitHub error bodies look like `{"message": "...", ...}`; fall back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl Platform for GitHubClient {
    async fn request_reviewers(
        &self,
        ctx: &CallContext,
        key: &PrKey,
        reviewers: &[Login],
        idempotency_key: &str,
    ) -> Result<(), PlatformError> {
        let url = format!(
            "{}/pulls/{}/requested_reviewers",
            self.repo_url(key),
            key.pr_number
        );
        let body = RequestReviewersBody {
            reviewers: reviewers.iter().map(Login::as_str).collect(),
        };
        info!("Requesting reviewers {:?} on {}", body.reviewers, key);
        self.post_json(ctx, &url, &body, Some(idempotency_key)).await
    }

    async fn trigger_workflow(
        &self,
        ctx: &CallContext,
        key: &PrKey,
        workflow: &str,
        git_ref: &str,
        revision: &CommitSha,
        idempotency_key: &str,
    ) -> Result<(), PlatformError> {
        let url = format!(
            "{}/actions/workflows/{}/dispatches",
            self.repo_url(key),
            workflow
        );
        let body = WorkflowDispatchBody {
            git_ref,
            inputs: WorkflowInputs {
                pr_number: key.pr_number.to_string(),
                revision: revision.0.clone(),
            },
        };
        info!(
            "Triggering workflow {} on {} for {}@{}",
            workflow,
            git_ref,
            key,
            revision.short()
        );
        self.post_json(ctx, &url, &body, Some(idempotency_key)).await
    }

    async fn get_pull_request(
        &self,
        ctx: &CallContext,
        key: &PrKey,
    ) -> Result<PullRequestSnapshot, PlatformError> {
        let url = format!("{}/pulls/{}", self.repo_url(key), key.pr_number);
        let pr: PullRequestResponse = self.get_json(ctx, &url).await?;
        let state = PullRequestState::from_platform(&pr.state, pr.merged);
        // Nobody registers a finished PR, so its files are not worth a fetch.
        let changed_files = if state.is_open() {
            self.list_changed_files(ctx, key).await?
        } else {
            BTreeSet::new()
        };

        Ok(PullRequestSnapshot {
            key: PrKey::new(&key.repo_owner, &key.repo_name, pr.number),
            revision: CommitSha::from(pr.head.sha),
            source_branch: pr.head.ref_name,
            target_branch: pr.base.ref_name,
            author: Login::new(pr.user.login),
            changed_files,
            state,
        })
    }

    async fn list_changed_files(
        &self,
        ctx: &CallContext,
        key: &PrKey,
    ) -> Result<BTreeSet<String>, PlatformError> {
        let mut files = BTreeSet::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{}/pulls/{}/files?per_page={}&page={}",
                self.repo_url(key),
                key.pr_number,
                FILES_PER_PAGE,
                page
            );
            let batch: Vec<FileResponse> = self.get_json(ctx, &url).await?;
            let count = batch.len();
            for file in batch {
                // A rename touches both locations.
                if let Some(previous) = file.previous_filename {
                    files.insert(previous);
                }
                files.insert(file.filename);
            }
            if count < FILES_PER_PAGE {
                break;
            }
            page += 1;
        }
        debug!("{} touches {} file(s)", key, files.len());
        Ok(files)
    }

    async fn create_commit_status(
        &self,
        ctx: &CallContext,
        key: &PrKey,
        sha: &CommitSha,
        status: &CommitStatus,
    ) -> Result<(), PlatformError> {
        let url = format!("{}/statuses/{}", self.repo_url(key), sha);
        self.post_json(ctx, &url, status, None).await
    }
}

pub fn create_github_client(recording_logger: Option<RecordingLogger>) -> ClientWithMiddleware {
    use reqwest_middleware::ClientBuilder;

    let client = Client::builder()
        .user_agent(concat!("reviewgate/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| Client::new());

    let mut builder = ClientBuilder::new(client);

    if let Some(logger) = recording_logger {
        builder = builder.with(RecordingMiddleware::new(logger));
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_prefers_json_message() {
        assert_eq!(
            error_message(r#"{"message":"Reviews may only be requested from collaborators."}"#),
            "Reviews may only be requested from collaborators."
        );
        assert_eq!(error_message("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_workflow_dispatch_body_shape() {
        let body = WorkflowDispatchBody {
            git_ref: "feature/vpc",
            inputs: WorkflowInputs {
                pr_number: "7".to_string(),
                revision: "abc".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "ref": "feature/vpc",
                "inputs": {"pr_number": "7", "revision": "abc"}
            })
        );
    }

    #[test]
    fn test_api_url_trailing_slash_is_trimmed() {
        let client = GitHubClient::with_api_url("http://localhost:1234/", 1, String::new(), None);
        assert_eq!(
            client.repo_url(&PrKey::new("acme", "infra", 1)),
            "http://localhost:1234/repos/acme/infra"
        );
    }
}
