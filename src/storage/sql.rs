// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the outcome audit log and the local lead status record.
//!
//! ```sql
//! CREATE TABLE sync_outcomes (
//!   seq BIGINT AUTO_INCREMENT PRIMARY KEY,  -- append order
//!   id VARCHAR(36) UNIQUE,                  -- outcome uuid
//!   lead_id VARCHAR(255),
//!   event_type VARCHAR(32),
//!   previous_status_id BIGINT NULL,
//!   candidate_status_id BIGINT NULL,
//!   final_status_id BIGINT NULL,
//!   accepted, success, needs_follow_up BIGINT,  -- 0/1
//!   skip_reason VARCHAR(32) NULL,
//!   qualification VARCHAR(64) NULL,
//!   retry_attempts TEXT,                    -- JSON array
//!   error TEXT NULL,                        -- JSON {class, message}
//!   side_effects TEXT,                      -- JSON array
//!   recorded_at BIGINT
//! )
//!
//! CREATE TABLE lead_statuses (
//!   lead_id VARCHAR(255) PRIMARY KEY,
//!   status_id BIGINT,
//!   updated_at BIGINT
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! JSON lives in TEXT columns, and MySQL TEXT comes back through the `Any`
//! driver as bytes, so every text column is read as `String` first and
//! `Vec<u8>` second. Flags are stored as integers.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};

use super::traits::{LeadStore, OutcomeStore, StorageError};
use crate::event::EventType;
use crate::outcome::{now_millis, SkipReason, SyncOutcome};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const OUTCOME_COLUMNS: &str = "id, lead_id, event_type, previous_status_id, candidate_status_id, final_status_id, \
     accepted, skip_reason, qualification, retry_attempts, success, needs_follow_up, error, side_effects, recorded_at";

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and create tables.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 10 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };
        if is_sqlite {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS sync_outcomes (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    lead_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    previous_status_id INTEGER,
                    candidate_status_id INTEGER,
                    final_status_id INTEGER,
                    accepted INTEGER NOT NULL,
                    skip_reason TEXT,
                    qualification TEXT,
                    retry_attempts TEXT NOT NULL,
                    success INTEGER NOT NULL,
                    needs_follow_up INTEGER NOT NULL,
                    error TEXT,
                    side_effects TEXT NOT NULL,
                    recorded_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_sync_outcomes_lead ON sync_outcomes (lead_id, seq)",
                r#"
                CREATE TABLE IF NOT EXISTS lead_statuses (
                    lead_id TEXT PRIMARY KEY,
                    status_id INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS sync_outcomes (
                    seq BIGINT AUTO_INCREMENT PRIMARY KEY,
                    id VARCHAR(36) NOT NULL UNIQUE,
                    lead_id VARCHAR(255) NOT NULL,
                    event_type VARCHAR(32) NOT NULL,
                    previous_status_id BIGINT NULL,
                    candidate_status_id BIGINT NULL,
                    final_status_id BIGINT NULL,
                    accepted BIGINT NOT NULL,
                    skip_reason VARCHAR(32) NULL,
                    qualification VARCHAR(64) NULL,
                    retry_attempts TEXT NOT NULL,
                    success BIGINT NOT NULL,
                    needs_follow_up BIGINT NOT NULL,
                    error TEXT NULL,
                    side_effects TEXT NOT NULL,
                    recorded_at BIGINT NOT NULL,
                    INDEX idx_lead (lead_id, seq),
                    INDEX idx_follow_up (needs_follow_up)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS lead_statuses (
                    lead_id VARCHAR(255) PRIMARY KEY,
                    status_id BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL
                )
                "#,
            ]
        };

        for sql in statements.iter().copied() {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }
        Ok(())
    }

    async fn select_outcomes(&self, sql: &str, bind: Option<&str>, limit: Option<i64>) -> Result<Vec<SyncOutcome>, StorageError> {
        let rows = retry("sql_select_outcomes", &RetryConfig::query(), || async {
            let mut query = sqlx::query(sql);
            if let Some(value) = bind {
                query = query.bind(value);
            }
            if let Some(limit) = limit {
                query = query.bind(limit);
            }
            query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        rows.iter().map(row_to_outcome).collect()
    }
}

/// Read a text column as String (SQLite), falling back to bytes (MySQL TEXT).
fn text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn required_text(row: &AnyRow, column: &str, id: &str) -> Result<String, StorageError> {
    text(row, column).ok_or_else(|| StorageError::Corrupt {
        id: id.to_string(),
        reason: format!("missing {column}"),
    })
}

fn flag(row: &AnyRow, column: &str) -> bool {
    row.try_get::<i64, _>(column).map(|v| v != 0).unwrap_or(false)
}

fn nullable_id(row: &AnyRow, column: &str) -> Option<i64> {
    row.try_get::<Option<i64>, _>(column).ok().flatten()
}

fn row_to_outcome(row: &AnyRow) -> Result<SyncOutcome, StorageError> {
    let id = text(row, "id").ok_or_else(|| StorageError::Corrupt {
        id: "?".into(),
        reason: "missing id".into(),
    })?;
    let corrupt = |reason: String| StorageError::Corrupt { id: id.clone(), reason };

    let event_type = required_text(row, "event_type", &id)?
        .parse::<EventType>()
        .map_err(|e| corrupt(format!("{e}")))?;
    let skip_reason = match text(row, "skip_reason") {
        Some(s) => Some(SkipReason::parse(&s).ok_or_else(|| corrupt(format!("unknown skip reason '{s}'")))?),
        None => None,
    };
    let retry_attempts = serde_json::from_str(&required_text(row, "retry_attempts", &id)?)
        .map_err(|e| corrupt(format!("retry_attempts: {e}")))?;
    let side_effects = serde_json::from_str(&required_text(row, "side_effects", &id)?)
        .map_err(|e| corrupt(format!("side_effects: {e}")))?;
    let error = match text(row, "error") {
        Some(s) => Some(serde_json::from_str(&s).map_err(|e| corrupt(format!("error: {e}")))?),
        None => None,
    };

    Ok(SyncOutcome {
        lead_id: required_text(row, "lead_id", &id)?,
        event_type,
        previous_status_id: nullable_id(row, "previous_status_id"),
        candidate_status_id: nullable_id(row, "candidate_status_id"),
        final_status_id: nullable_id(row, "final_status_id"),
        accepted: flag(row, "accepted"),
        skip_reason,
        qualification: text(row, "qualification"),
        retry_attempts,
        success: flag(row, "success"),
        needs_follow_up: flag(row, "needs_follow_up"),
        error,
        side_effects,
        recorded_at: row.try_get("recorded_at").unwrap_or(0),
        id,
    })
}

#[async_trait]
impl OutcomeStore for SqlStore {
    async fn append(&self, outcome: &SyncOutcome) -> Result<(), StorageError> {
        let encode = |e: serde_json::Error| StorageError::Corrupt {
            id: outcome.id.clone(),
            reason: e.to_string(),
        };
        let attempts_json = serde_json::to_string(&outcome.retry_attempts).map_err(encode)?;
        let side_effects_json = serde_json::to_string(&outcome.side_effects).map_err(encode)?;
        let error_json = outcome
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(encode)?;

        // Retried inserts must not duplicate the audit entry.
        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO sync_outcomes ({OUTCOME_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO NOTHING"
            )
        } else {
            format!(
                "INSERT IGNORE INTO sync_outcomes ({OUTCOME_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            )
        };

        retry("sql_append_outcome", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(&outcome.id)
                .bind(&outcome.lead_id)
                .bind(outcome.event_type.as_str())
                .bind(outcome.previous_status_id)
                .bind(outcome.candidate_status_id)
                .bind(outcome.final_status_id)
                .bind(outcome.accepted as i64)
                .bind(outcome.skip_reason.map(SkipReason::as_str))
                .bind(outcome.qualification.as_deref())
                .bind(&attempts_json)
                .bind(outcome.success as i64)
                .bind(outcome.needs_follow_up as i64)
                .bind(error_json.as_deref())
                .bind(&side_effects_json)
                .bind(outcome.recorded_at)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn for_lead(&self, lead_id: &str) -> Result<Vec<SyncOutcome>, StorageError> {
        let sql = format!("SELECT {OUTCOME_COLUMNS} FROM sync_outcomes WHERE lead_id = ? ORDER BY seq");
        self.select_outcomes(&sql, Some(lead_id), None).await
    }

    async fn pending_follow_ups(&self, limit: usize) -> Result<Vec<SyncOutcome>, StorageError> {
        let sql = format!(
            "SELECT {OUTCOME_COLUMNS} FROM sync_outcomes o \
             WHERE o.needs_follow_up = 1 AND NOT EXISTS ( \
                 SELECT 1 FROM sync_outcomes n \
                 WHERE n.lead_id = o.lead_id AND n.seq > o.seq AND n.accepted = 1 AND n.success = 1) \
             ORDER BY o.seq LIMIT ?"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.select_outcomes(&sql, None, Some(limit)).await
    }

    async fn count(&self) -> Result<u64, StorageError> {
        retry("sql_count_outcomes", &RetryConfig::query(), || async {
            let row = sqlx::query("SELECT COUNT(*) AS n FROM sync_outcomes")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let n: i64 = row.try_get("n").map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(n as u64)
        })
        .await
    }
}

#[async_trait]
impl LeadStore for SqlStore {
    async fn current_status(&self, lead_id: &str) -> Result<Option<i64>, StorageError> {
        retry("sql_current_status", &RetryConfig::query(), || async {
            let row = sqlx::query("SELECT status_id FROM lead_statuses WHERE lead_id = ?")
                .bind(lead_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(row.and_then(|r| r.try_get::<i64, _>("status_id").ok()))
        })
        .await
    }

    async fn set_status(&self, lead_id: &str, status_id: i64) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO lead_statuses (lead_id, status_id, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(lead_id) DO UPDATE SET status_id = excluded.status_id, updated_at = excluded.updated_at"
        } else {
            "INSERT INTO lead_statuses (lead_id, status_id, updated_at) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE status_id = VALUES(status_id), updated_at = VALUES(updated_at)"
        };
        let now = now_millis();

        retry("sql_set_status", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(lead_id)
                .bind(status_id)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{SideEffect, SideEffectRecord};
    use crate::resilience::classify::{ClassifiedError, ErrorClass};
    use crate::resilience::executor::AttemptRecord;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lead_sync_{}_{}.db", name, uuid::Uuid::new_v4()))
    }

    /// Clean up SQLite database and its WAL files
    fn cleanup_db(path: &PathBuf) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(format!("{}-wal", path.display()));
        let _ = std::fs::remove_file(format!("{}-shm", path.display()));
    }

    async fn open(path: &PathBuf) -> SqlStore {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        SqlStore::new(&url).await.unwrap()
    }

    fn failed_outcome(lead: &str) -> SyncOutcome {
        let mut outcome = SyncOutcome::pending(lead, EventType::ReplyReceived, Some(1), Some(3)).failed(
            ClassifiedError::new(ErrorClass::ServerError, "503 from CRM"),
            vec![
                AttemptRecord { attempt_number: 1, classification: ErrorClass::ServerError, delay_before_next_ms: Some(500) },
                AttemptRecord { attempt_number: 2, classification: ErrorClass::ServerError, delay_before_next_ms: None },
            ],
        );
        outcome.qualification = Some("replied".into());
        outcome.side_effects = vec![SideEffectRecord { effect: SideEffect::LogActivity, success: true, error: None }];
        outcome
    }

    #[tokio::test]
    async fn test_outcome_roundtrip() {
        let path = temp_db_path("roundtrip");
        let store = open(&path).await;

        let outcome = failed_outcome("lead-1");
        store.append(&outcome).await.unwrap();
        let skipped = SyncOutcome::pending("lead-1", EventType::CampaignCompleted, Some(5), Some(2))
            .skipped(SkipReason::Protected);
        store.append(&skipped).await.unwrap();

        let history = store.for_lead("lead-1").await.unwrap();
        assert_eq!(history, vec![outcome, skipped]);

        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_append_twice_is_noop() {
        let path = temp_db_path("dupe");
        let store = open(&path).await;

        let outcome = failed_outcome("lead-1");
        store.append(&outcome).await.unwrap();
        store.append(&outcome).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_pending_follow_ups() {
        let path = temp_db_path("follow_ups");
        let store = open(&path).await;

        store.append(&failed_outcome("a")).await.unwrap();
        store.append(&failed_outcome("b")).await.unwrap();
        let fixed = SyncOutcome::pending("a", EventType::ReplyReceived, Some(1), Some(3)).applied(3, Vec::new());
        store.append(&fixed).await.unwrap();

        let pending = store.pending_follow_ups(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].lead_id, "b");

        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_lead_status_upsert() {
        let path = temp_db_path("leads");
        let store = open(&path).await;

        assert_eq!(store.current_status("lead-1").await.unwrap(), None);
        store.set_status("lead-1", 1).await.unwrap();
        store.set_status("lead-1", 3).await.unwrap();
        assert_eq!(store.current_status("lead-1").await.unwrap(), Some(3));

        cleanup_db(&path);
    }
}
