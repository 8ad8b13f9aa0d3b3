// File: rusty-cores/src/offline.rs
// Purpose: Durable queue of mutations made while the remote was unreachable (SQLite via sqlx)

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{OfflineOperation, OperationType};

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    /// Operations replayed and removed
    pub replayed: Vec<Uuid>,
    /// Operation that failed and halted the pass, with its error
    pub halted_on: Option<(Uuid, String)>,
    /// Operations still queued after the pass
    pub remaining: usize,
}

/// Append-only log of offline operations, replayed in timestamp order
#[derive(Clone)]
pub struct OfflineQueue {
    pool: SqlitePool,
}

impl OfflineQueue {
    /// Open (or create) the queue at a sqlx SQLite URL
    pub async fn open(database_url: &str) -> Result<Self> {
        ensure_parent_dir(database_url)?;

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid offline queue URL: {}", database_url))?
            .create_if_missing(true);

        // A single connection keeps `sqlite::memory:` on one database and serializes writers
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open offline queue database")?;

        Self::init_table(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory queue; not durable, used in tests and ephemeral setups
    pub async fn in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    async fn init_table(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _rusty_cores_offline_ops (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                op_type TEXT NOT NULL,
                data TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create offline queue table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_offline_ops_order
            ON _rusty_cores_offline_ops(timestamp_ms, seq)
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create offline queue index")?;

        Ok(())
    }

    /// Append an operation. Re-enqueueing an id already present is a no-op.
    pub async fn enqueue(&self, operation: &OfflineOperation) -> Result<()> {
        let data = serde_json::to_string(&operation.data)
            .context("Failed to serialize offline operation")?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO _rusty_cores_offline_ops
                (id, op_type, data, timestamp, timestamp_ms, attempts, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(operation.id.to_string())
        .bind(operation.op_type.to_string())
        .bind(data)
        .bind(operation.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .bind(operation.timestamp.timestamp_millis())
        .bind(operation.attempts as i64)
        .bind(operation.last_error.clone())
        .execute(&self.pool)
        .await
        .context("Failed to append offline operation")?;

        tracing::debug!(operation_id = %operation.id, "Offline operation queued");
        Ok(())
    }

    /// All queued operations, oldest first
    pub async fn pending(&self) -> Result<Vec<OfflineOperation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, op_type, data, timestamp, attempts, last_error
            FROM _rusty_cores_offline_ops
            ORDER BY timestamp_ms ASC, seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to read offline operations")?;

        rows.iter()
            .map(|row| -> Result<OfflineOperation> {
                let id: String = row.get("id");
                let op_type: String = row.get("op_type");
                let data: String = row.get("data");
                let timestamp: String = row.get("timestamp");
                let attempts: i64 = row.get("attempts");

                let op_type = match op_type.as_str() {
                    "core_update" => OperationType::CoreUpdate,
                    other => anyhow::bail!("Unknown offline operation type: {}", other),
                };

                Ok(OfflineOperation {
                    id: Uuid::parse_str(&id).context("Corrupt offline operation id")?,
                    op_type,
                    data: serde_json::from_str(&data)
                        .context("Failed to deserialize offline operation")?,
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)
                        .context("Corrupt offline operation timestamp")?
                        .with_timezone(&Utc),
                    attempts: attempts as u32,
                    last_error: row.get("last_error"),
                })
            })
            .collect()
    }

    pub async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _rusty_cores_offline_ops")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count offline operations")?;

        Ok(count as usize)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Remove an operation after it was replayed
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM _rusty_cores_offline_ops WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to remove offline operation")?;

        Ok(())
    }

    /// Keep a failed operation queued and remember why it failed
    pub async fn record_failure(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE _rusty_cores_offline_ops
            SET attempts = attempts + 1, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to record offline replay failure")?;

        Ok(())
    }

    /// Replay queued operations oldest first.
    ///
    /// A successful replay removes the operation. The first failure is recorded
    /// on the operation and stops the pass so later operations never overtake it.
    pub async fn drain_with<F, Fut>(&self, mut replay: F) -> Result<ReplayReport>
    where
        F: FnMut(OfflineOperation) -> Fut,
        Fut: Future<Output = std::result::Result<(), EngineError>>,
    {
        let mut report = ReplayReport::default();

        for operation in self.pending().await? {
            let id = operation.id;
            match replay(operation).await {
                Ok(()) => {
                    self.remove(id).await?;
                    report.replayed.push(id);
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::warn!(operation_id = %id, error = %message, "Offline replay failed, halting drain");
                    self.record_failure(id, &message).await?;
                    report.halted_on = Some((id, message));
                    break;
                }
            }
        }

        report.remaining = self.len().await?;
        Ok(report)
    }
}

/// Create the directory holding a file-backed SQLite URL
fn ensure_parent_dir(database_url: &str) -> Result<()> {
    if database_url.contains(":memory:") {
        return Ok(());
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or(path);

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }

    Ok(())
}
