//! Delivery claims and the dispatch ledger.
//!
//! Both tables use the same claim semantics: an atomic `INSERT OR IGNORE`
//! takes the claim, `claim_state` 0 means in progress and 1 means done.
//! In-progress delivery claims older than `STALE_CLAIM_TTL_SECONDS` can be
//! reclaimed after a crash.

use rusqlite::{params, Connection};

use super::super::{DeliveryClaimResult, STALE_CLAIM_TTL_SECONDS};

const IN_PROGRESS: i64 = 0;
const COMPLETED: i64 = 1;

pub(super) fn try_claim_delivery_sync(
    conn: &Connection,
    delivery_id: &str,
    now_secs: i64,
) -> Result<DeliveryClaimResult, String> {
    conn.execute(
        "INSERT OR IGNORE INTO delivery_claims (delivery_id, recorded_at, claim_state)
         VALUES (?1, ?2, ?3)",
        params![delivery_id, now_secs, IN_PROGRESS],
    )
    .map_err(|e| e.to_string())?;

    if conn.changes() > 0 {
        return Ok(DeliveryClaimResult::Claimed);
    }

    let (state, recorded_at): (i64, i64) = conn
        .query_row(
            "SELECT claim_state, recorded_at FROM delivery_claims WHERE delivery_id = ?1",
            params![delivery_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| e.to_string())?;

    if state == COMPLETED {
        return Ok(DeliveryClaimResult::Completed);
    }

    let stale_cutoff = now_secs - STALE_CLAIM_TTL_SECONDS;
    if recorded_at > stale_cutoff {
        return Ok(DeliveryClaimResult::InProgress);
    }

    // Conditional so two servers cannot both take over the same stale claim.
    conn.execute(
        "UPDATE delivery_claims SET recorded_at = ?1
         WHERE delivery_id = ?2 AND claim_state = ?3 AND recorded_at <= ?4",
        params![now_secs, delivery_id, IN_PROGRESS, stale_cutoff],
    )
    .map_err(|e| e.to_string())?;

    if conn.changes() > 0 {
        Ok(DeliveryClaimResult::Claimed)
    } else {
        Ok(DeliveryClaimResult::InProgress)
    }
}

pub(super) fn complete_delivery_sync(conn: &Connection, delivery_id: &str) -> Result<(), String> {
    conn.execute(
        "UPDATE delivery_claims SET claim_state = ?1 WHERE delivery_id = ?2",
        params![COMPLETED, delivery_id],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

pub(super) fn release_delivery_sync(conn: &Connection, delivery_id: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM delivery_claims WHERE delivery_id = ?1 AND claim_state = ?2",
        params![delivery_id, IN_PROGRESS],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

pub(super) fn cleanup_expired_deliveries_sync(
    conn: &Connection,
    cutoff: i64,
) -> Result<usize, String> {
    conn.execute(
        "DELETE FROM delivery_claims WHERE claim_state = ?1 AND recorded_at <= ?2",
        params![COMPLETED, cutoff],
    )
    .map_err(|e| e.to_string())
}

pub(super) fn try_claim_dispatch_sync(
    conn: &Connection,
    key: &str,
    now_secs: i64,
) -> Result<bool, String> {
    conn.execute(
        "INSERT OR IGNORE INTO dispatch_ledger (idempotency_key, claim_state, recorded_at)
         VALUES (?1, ?2, ?3)",
        params![key, IN_PROGRESS, now_secs],
    )
    .map_err(|e| e.to_string())?;
    Ok(conn.changes() > 0)
}

pub(super) fn complete_dispatch_sync(
    conn: &Connection,
    key: &str,
    now_secs: i64,
) -> Result<(), String> {
    // A no-op when the PR's entries were cleared while the call ran.
    conn.execute(
        "UPDATE dispatch_ledger SET claim_state = ?1, recorded_at = ?2 WHERE idempotency_key = ?3",
        params![COMPLETED, now_secs, key],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

pub(super) fn release_dispatch_sync(conn: &Connection, key: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM dispatch_ledger WHERE idempotency_key = ?1 AND claim_state = ?2",
        params![key, IN_PROGRESS],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

/// `prefix` is compared literally; `LIKE` would treat `_` in repo names as a
/// wildcard.
pub(super) fn clear_dispatches_sync(conn: &Connection, prefix: &str) -> Result<usize, String> {
    conn.execute(
        "DELETE FROM dispatch_ledger WHERE substr(idempotency_key, 1, length(?1)) = ?1",
        params![prefix],
    )
    .map_err(|e| e.to_string())
}

pub(super) fn cleanup_expired_dispatches_sync(
    conn: &Connection,
    cutoff: i64,
) -> Result<usize, String> {
    conn.execute(
        "DELETE FROM dispatch_ledger WHERE claim_state = ?1 AND recorded_at <= ?2",
        params![COMPLETED, cutoff],
    )
    .map_err(|e| e.to_string())
}
