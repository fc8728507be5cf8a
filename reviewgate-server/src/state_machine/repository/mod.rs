//! Repository abstraction for tracker persistence.
//!
//! `StateRepository` stores tracked PRs, webhook delivery claims and the
//! dispatch ledger. The in-memory backend is used by tests; the SQLite
//! backend survives restarts.

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use reviewgate_core::PrKey;
use thiserror::Error;

use super::state::TrackedPullRequest;

/// In-progress delivery claims older than this may be taken over.
pub const STALE_CLAIM_TTL_SECONDS: i64 = 30 * 60;

/// Completed delivery claims are forgotten after this long.
pub const COMPLETED_CLAIM_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Completed ledger entries of PRs that never closed are swept after this
/// long. Closed PRs and superseded revisions are cleared immediately.
pub const COMPLETED_DISPATCH_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("failed to (de)serialize state: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }
}

/// Outcome of trying to claim a webhook delivery for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClaimResult {
    /// This caller owns the delivery and must complete or release it.
    Claimed,
    /// Another handler is processing it right now.
    InProgress,
    /// Already processed.
    Completed,
}

#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn get(&self, key: &PrKey) -> Result<Option<TrackedPullRequest>, RepositoryError>;

    /// Upsert.
    async fn put(&self, state: &TrackedPullRequest) -> Result<(), RepositoryError>;

    async fn delete(&self, key: &PrKey) -> Result<Option<TrackedPullRequest>, RepositoryError>;

    async fn get_all(&self) -> Result<Vec<TrackedPullRequest>, RepositoryError>;

    // =========================================================================
    // Webhook delivery claims
    // =========================================================================

    async fn try_claim_delivery(
        &self,
        delivery_id: &str,
    ) -> Result<DeliveryClaimResult, RepositoryError>;

    async fn complete_delivery(&self, delivery_id: &str) -> Result<(), RepositoryError>;

    /// Forget a claim so the platform's redelivery is processed again.
    async fn release_delivery(&self, delivery_id: &str) -> Result<(), RepositoryError>;

    /// Drop completed claims older than `ttl_seconds`. Returns how many went.
    async fn cleanup_expired_deliveries(&self, ttl_seconds: i64)
        -> Result<usize, RepositoryError>;

    // =========================================================================
    // Dispatch ledger
    // =========================================================================

    /// Returns false if the key is already in flight or completed.
    async fn try_claim_dispatch(&self, idempotency_key: &str) -> Result<bool, RepositoryError>;

    async fn complete_dispatch(&self, idempotency_key: &str) -> Result<(), RepositoryError>;

    async fn release_dispatch(&self, idempotency_key: &str) -> Result<(), RepositoryError>;

    /// Forget every ledger entry of `key`, in flight or completed.
    async fn clear_dispatches(&self, key: &PrKey) -> Result<usize, RepositoryError>;

    /// Drop completed ledger entries older than `ttl_seconds`.
    async fn cleanup_expired_dispatches(&self, ttl_seconds: i64)
        -> Result<usize, RepositoryError>;
}

/// Ledger keys of one PR all start with this; see
/// [`crate::dispatcher::DispatchRequest::idempotency_key`].
pub(crate) fn dispatch_prefix(key: &PrKey) -> String {
    format!("{}:", key)
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
