//! In-memory implementation of `StateRepository`. Everything is lost on
//! restart.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use reviewgate_core::PrKey;
use tokio::sync::RwLock;

use super::{
    dispatch_prefix, now_secs, DeliveryClaimResult, RepositoryError, StateRepository,
    STALE_CLAIM_TTL_SECONDS,
};
use crate::state_machine::state::TrackedPullRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimState {
    InProgress,
    Completed,
}

#[derive(Default)]
pub struct InMemoryRepository {
    states: RwLock<HashMap<PrKey, TrackedPullRequest>>,
    /// Delivery id to claim state and when it was recorded (unix seconds).
    deliveries: RwLock<HashMap<String, (ClaimState, i64)>>,
    in_flight: RwLock<HashSet<String>>,
    /// Completed idempotency keys and when they completed.
    dispatched: RwLock<HashMap<String, i64>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    async fn backdate_delivery(&self, delivery_id: &str, secs: i64) {
        if let Some(entry) = self.deliveries.write().await.get_mut(delivery_id) {
            entry.1 -= secs;
        }
    }

    #[cfg(test)]
    async fn backdate_dispatch(&self, idempotency_key: &str, secs: i64) {
        if let Some(at) = self.dispatched.write().await.get_mut(idempotency_key) {
            *at -= secs;
        }
    }
}

#[async_trait]
impl StateRepository for InMemoryRepository {
    async fn get(&self, key: &PrKey) -> Result<Option<TrackedPullRequest>, RepositoryError> {
        Ok(self.states.read().await.get(key).cloned())
    }

    async fn put(&self, state: &TrackedPullRequest) -> Result<(), RepositoryError> {
        self.states
            .write()
            .await
            .insert(state.key.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, key: &PrKey) -> Result<Option<TrackedPullRequest>, RepositoryError> {
        Ok(self.states.write().await.remove(key))
    }

    async fn get_all(&self) -> Result<Vec<TrackedPullRequest>, RepositoryError> {
        let mut all: Vec<TrackedPullRequest> = self.states.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }

    async fn try_claim_delivery(
        &self,
        delivery_id: &str,
    ) -> Result<DeliveryClaimResult, RepositoryError> {
        let now = now_secs();
        let mut claims = self.deliveries.write().await;
        match claims.entry(delivery_id.to_string()) {
            Entry::Occupied(mut entry) => match entry.get() {
                (ClaimState::Completed, _) => Ok(DeliveryClaimResult::Completed),
                (ClaimState::InProgress, at) if *at <= now - STALE_CLAIM_TTL_SECONDS => {
                    entry.insert((ClaimState::InProgress, now));
                    Ok(DeliveryClaimResult::Claimed)
                }
                (ClaimState::InProgress, _) => Ok(DeliveryClaimResult::InProgress),
            },
            Entry::Vacant(entry) => {
                entry.insert((ClaimState::InProgress, now));
                Ok(DeliveryClaimResult::Claimed)
            }
        }
    }

    async fn complete_delivery(&self, delivery_id: &str) -> Result<(), RepositoryError> {
        if let Some(entry) = self.deliveries.write().await.get_mut(delivery_id) {
            entry.0 = ClaimState::Completed;
        }
        Ok(())
    }

    async fn release_delivery(&self, delivery_id: &str) -> Result<(), RepositoryError> {
        let mut claims = self.deliveries.write().await;
        if let Some((ClaimState::InProgress, _)) = claims.get(delivery_id) {
            claims.remove(delivery_id);
        }
        Ok(())
    }

    async fn cleanup_expired_deliveries(
        &self,
        ttl_seconds: i64,
    ) -> Result<usize, RepositoryError> {
        let cutoff = now_secs() - ttl_seconds;
        let mut claims = self.deliveries.write().await;
        let before = claims.len();
        claims.retain(|_, (state, at)| *state == ClaimState::InProgress || *at > cutoff);
        Ok(before - claims.len())
    }

    async fn try_claim_dispatch(&self, idempotency_key: &str) -> Result<bool, RepositoryError> {
        if self.dispatched.read().await.contains_key(idempotency_key) {
            return Ok(false);
        }
        Ok(self
            .in_flight
            .write()
            .await
            .insert(idempotency_key.to_string()))
    }

    async fn complete_dispatch(&self, idempotency_key: &str) -> Result<(), RepositoryError> {
        // A key cleared while its call was running stays forgotten.
        if self.in_flight.write().await.remove(idempotency_key) {
            self.dispatched
                .write()
                .await
                .insert(idempotency_key.to_string(), now_secs());
        }
        Ok(())
    }

    async fn release_dispatch(&self, idempotency_key: &str) -> Result<(), RepositoryError> {
        self.in_flight.write().await.remove(idempotency_key);
        Ok(())
    }

    async fn clear_dispatches(&self, key: &PrKey) -> Result<usize, RepositoryError> {
        let prefix = dispatch_prefix(key);
        let mut in_flight = self.in_flight.write().await;
        let mut dispatched = self.dispatched.write().await;
        let before = in_flight.len() + dispatched.len();
        in_flight.retain(|k| !k.starts_with(&prefix));
        dispatched.retain(|k, _| !k.starts_with(&prefix));
        Ok(before - in_flight.len() - dispatched.len())
    }

    async fn cleanup_expired_dispatches(
        &self,
        ttl_seconds: i64,
    ) -> Result<usize, RepositoryError> {
        let cutoff = now_secs() - ttl_seconds;
        let mut dispatched = self.dispatched.write().await;
        let before = dispatched.len();
        dispatched.retain(|_, at| *at > cutoff);
        Ok(before - dispatched.len())
    }
}
