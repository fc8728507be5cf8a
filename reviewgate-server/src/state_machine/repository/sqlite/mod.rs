//! SQLite implementation of `StateRepository`.
//!
//! # Schema Versioning
//!
//! The `schema_version` table tracks the schema version. When the schema needs
//! to change, increment `CURRENT_SCHEMA_VERSION` and add a step in
//! `run_migrations()`. Steps run in order from the stored version.
//!
//! New fields on `TrackedPullRequest` must be `#[serde(default)]` so rows
//! written by older builds still deserialize.

mod claims;


use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use reviewgate_core::PrKey;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, warn};

use super::{dispatch_prefix, now_secs, DeliveryClaimResult, RepositoryError, StateRepository};
use crate::state_machine::state::TrackedPullRequest;

const CURRENT_SCHEMA_VERSION: i64 = 3;

/// SQLite-backed state repository.
///
/// Synchronous rusqlite calls run on `tokio::task::spawn_blocking`.
pub struct SqliteRepository {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and bring its schema up to
    /// date.
    ///
    /// The connection runs with `journal_mode = WAL`, `synchronous = FULL`
    /// and a 5 second busy timeout.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        #[cfg(unix)]
        if !is_in_memory && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite silently keeps DELETE mode on filesystems without shared
        // memory support. In-memory databases report "memory".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        // Nothing is in flight at startup; entries left by a crash would
        // otherwise block their dispatch forever.
        conn.execute("DELETE FROM dispatch_ledger WHERE claim_state = 0", [])
            .map_err(|e| RepositoryError::storage("reset dispatch ledger", e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS pr_states (
                    repo_owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    pr_number INTEGER NOT NULL,
                    state_json TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (repo_owner, repo_name, pr_number)
                );

                CREATE TABLE IF NOT EXISTS delivery_claims (
                    delivery_id TEXT PRIMARY KEY,
                    recorded_at INTEGER NOT NULL,
                    claim_state INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_delivery_recorded_at
                    ON delivery_claims(recorded_at);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        // v2: ledger of reviewer requests and workflow triggers.
        if from_version < 2 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS dispatch_ledger (
                    idempotency_key TEXT PRIMARY KEY,
                    claim_state INTEGER NOT NULL,
                    recorded_at INTEGER NOT NULL
                );
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v2", e.to_string()))?;
        }

        // v3: the ledger is swept by age.
        if from_version < 3 {
            conn.execute_batch(
                r#"
                CREATE INDEX IF NOT EXISTS idx_dispatch_recorded_at
                    ON dispatch_ledger(recorded_at);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v3", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// In-memory database, used by tests.
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = lock(&conn, operation)?;
            f(&guard)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

fn lock<'a>(
    conn: &'a Mutex<Connection>,
    operation: &'static str,
) -> Result<MutexGuard<'a, Connection>, RepositoryError> {
    conn.lock()
        .map_err(|_| RepositoryError::storage(operation, "connection mutex poisoned"))
}

/// Convert a PR number to i64 for storage without silent wrap-around.
fn pr_number_to_i64(pr_number: u64, operation: &'static str) -> Result<i64, RepositoryError> {
    i64::try_from(pr_number).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("PR number {} exceeds maximum storable value", pr_number),
        )
    })
}

#[async_trait]
impl StateRepository for SqliteRepository {
    async fn get(&self, key: &PrKey) -> Result<Option<TrackedPullRequest>, RepositoryError> {
        let owner = key.repo_owner.clone();
        let name = key.repo_name.clone();
        let pr_num = pr_number_to_i64(key.pr_number, "get")?;

        self.with_conn("get", move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT state_json FROM pr_states
                     WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3",
                    params![owner, name, pr_num],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("get", e.to_string()))?;

            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put(&self, state: &TrackedPullRequest) -> Result<(), RepositoryError> {
        let owner = state.key.repo_owner.clone();
        let name = state.key.repo_name.clone();
        let pr_num = pr_number_to_i64(state.key.pr_number, "put")?;
        let state_json = serde_json::to_string(state)?;
        let now = now_secs();

        self.with_conn("put", move |conn| {
            conn.execute(
                "INSERT INTO pr_states (repo_owner, repo_name, pr_number, state_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(repo_owner, repo_name, pr_number) DO UPDATE SET
                     state_json = excluded.state_json,
                     updated_at = excluded.updated_at",
                params![owner, name, pr_num, state_json, now],
            )
            .map_err(|e| RepositoryError::storage("put", e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &PrKey) -> Result<Option<TrackedPullRequest>, RepositoryError> {
        let owner = key.repo_owner.clone();
        let name = key.repo_name.clone();
        let pr_num = pr_number_to_i64(key.pr_number, "delete")?;

        self.with_conn("delete", move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "DELETE FROM pr_states
                     WHERE repo_owner = ?1 AND repo_name = ?2 AND pr_number = ?3
                     RETURNING state_json",
                    params![owner, name, pr_num],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("delete", e.to_string()))?;

            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_all(&self) -> Result<Vec<TrackedPullRequest>, RepositoryError> {
        self.with_conn("get_all", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT repo_owner, repo_name, pr_number, state_json FROM pr_states
                     ORDER BY repo_owner, repo_name, pr_number",
                )
                .map_err(|e| RepositoryError::storage("get_all", e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(|e| RepositoryError::storage("get_all", e.to_string()))?;

            let mut results = Vec::new();
            for row in rows {
                let (owner, name, pr_num, json) = match row {
                    Ok(data) => data,
                    Err(e) => {
                        error!("Failed to read PR row from SQLite: {}", e);
                        continue;
                    }
                };

                // One corrupt row must not hide every other PR.
                match serde_json::from_str::<TrackedPullRequest>(&json) {
                    Ok(state) => results.push(state),
                    Err(e) => warn!(
                        "Skipping corrupt state for PR {}/{}#{}: {}",
                        owner, name, pr_num, e
                    ),
                }
            }
            Ok(results)
        })
        .await
    }

    async fn try_claim_delivery(
        &self,
        delivery_id: &str,
    ) -> Result<DeliveryClaimResult, RepositoryError> {
        let delivery_id = delivery_id.to_string();
        self.with_conn("try_claim_delivery", move |conn| {
            claims::try_claim_delivery_sync(conn, &delivery_id, now_secs())
                .map_err(|e| RepositoryError::storage("try_claim_delivery", e))
        })
        .await
    }

    async fn complete_delivery(&self, delivery_id: &str) -> Result<(), RepositoryError> {
        let delivery_id = delivery_id.to_string();
        self.with_conn("complete_delivery", move |conn| {
            claims::complete_delivery_sync(conn, &delivery_id)
                .map_err(|e| RepositoryError::storage("complete_delivery", e))
        })
        .await
    }

    async fn release_delivery(&self, delivery_id: &str) -> Result<(), RepositoryError> {
        let delivery_id = delivery_id.to_string();
        self.with_conn("release_delivery", move |conn| {
            claims::release_delivery_sync(conn, &delivery_id)
                .map_err(|e| RepositoryError::storage("release_delivery", e))
        })
        .await
    }

    async fn cleanup_expired_deliveries(
        &self,
        ttl_seconds: i64,
    ) -> Result<usize, RepositoryError> {
        let cutoff = now_secs() - ttl_seconds;
        self.with_conn("cleanup_expired_deliveries", move |conn| {
            claims::cleanup_expired_deliveries_sync(conn, cutoff)
                .map_err(|e| RepositoryError::storage("cleanup_expired_deliveries", e))
        })
        .await
    }

    async fn try_claim_dispatch(&self, idempotency_key: &str) -> Result<bool, RepositoryError> {
        let key = idempotency_key.to_string();
        self.with_conn("try_claim_dispatch", move |conn| {
            claims::try_claim_dispatch_sync(conn, &key, now_secs())
                .map_err(|e| RepositoryError::storage("try_claim_dispatch", e))
        })
        .await
    }

    async fn complete_dispatch(&self, idempotency_key: &str) -> Result<(), RepositoryError> {
        let key = idempotency_key.to_string();
        self.with_conn("complete_dispatch", move |conn| {
            claims::complete_dispatch_sync(conn, &key, now_secs())
                .map_err(|e| RepositoryError::storage("complete_dispatch", e))
        })
        .await
    }

    async fn release_dispatch(&self, idempotency_key: &str) -> Result<(), RepositoryError> {
        let key = idempotency_key.to_string();
        self.with_conn("release_dispatch", move |conn| {
            claims::release_dispatch_sync(conn, &key)
                .map_err(|e| RepositoryError::storage("release_dispatch", e))
        })
        .await
    }

    async fn clear_dispatches(&self, key: &PrKey) -> Result<usize, RepositoryError> {
        let prefix = dispatch_prefix(key);
        self.with_conn("clear_dispatches", move |conn| {
            claims::clear_dispatches_sync(conn, &prefix)
                .map_err(|e| RepositoryError::storage("clear_dispatches", e))
        })
        .await
    }

    async fn cleanup_expired_dispatches(
        &self,
        ttl_seconds: i64,
    ) -> Result<usize, RepositoryError> {
        let cutoff = now_secs() - ttl_seconds;
        self.with_conn("cleanup_expired_dispatches", move |conn| {
            claims::cleanup_expired_dispatches_sync(conn, cutoff)
                .map_err(|e| RepositoryError::storage("cleanup_expired_dispatches", e))
        })
        .await
    }
}
