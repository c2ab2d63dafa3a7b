//! Postgres-backed audit log.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | AuditError |
//! |------------|----------------------|------------|
//! | Database (check constraint violation) | `23514` | `Rejected` |
//! | Database (not null violation) | `23502` | `Rejected` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;
use uuid::Uuid;

use stockrelay_core::MessageId;

use super::{AuditEntryId, AuditError, AuditLog, AuditLogEntry, AuditOutcome, AuditQuery, AuditRecord};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS event_audit_log (
    id            BIGSERIAL PRIMARY KEY,
    message_id    UUID        NOT NULL,
    event_type    TEXT        NOT NULL,
    routing_key   TEXT        NOT NULL,
    source_queue  TEXT        NOT NULL,
    payload       JSONB       NOT NULL,
    attempts      INTEGER     NOT NULL CHECK (attempts >= 0),
    received_at   TIMESTAMPTZ NOT NULL,
    outcome       TEXT        NOT NULL CHECK (outcome IN ('processed', 'dead_lettered')),
    error_detail  TEXT,
    recorded_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_MESSAGE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS event_audit_log_message_id_idx ON event_audit_log (message_id)";

const CREATE_OUTCOME_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS event_audit_log_outcome_idx ON event_audit_log (outcome, id)";

const SELECT_COLUMNS: &str = "SELECT id, message_id, event_type, routing_key, source_queue, payload, \
     attempts, received_at, outcome, error_detail FROM event_audit_log";

/// Append-only audit log in table `event_audit_log`.
///
/// Only INSERT and SELECT are issued; rows are never updated or deleted.
#[derive(Debug, Clone)]
pub struct PostgresAuditLog {
    pool: Arc<PgPool>,
}

impl PostgresAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a small pool against `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, AuditError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the table and indexes if they are missing (idempotent).
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), AuditError> {
        for statement in [CREATE_TABLE, CREATE_MESSAGE_INDEX, CREATE_OUTCOME_INDEX] {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuditLog for PostgresAuditLog {
    #[instrument(
        skip(self, record),
        fields(
            message_id = %record.message_id,
            event_type = %record.event_type,
            outcome = %record.outcome
        ),
        err
    )]
    async fn append(&self, record: AuditRecord) -> Result<AuditEntryId, AuditError> {
        let attempts = i32::try_from(record.attempts)
            .map_err(|_| AuditError::Rejected(format!("attempts out of range: {}", record.attempts)))?;

        let row = sqlx::query(
            r#"
            INSERT INTO event_audit_log (
                message_id,
                event_type,
                routing_key,
                source_queue,
                payload,
                attempts,
                received_at,
                outcome,
                error_detail
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(record.message_id.as_uuid())
        .bind(&record.event_type)
        .bind(&record.routing_key)
        .bind(&record.source_queue)
        .bind(&record.payload)
        .bind(attempts)
        .bind(record.received_at)
        .bind(record.outcome.as_str())
        .bind(&record.error_detail)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| AuditError::Corrupt(format!("missing returned id: {e}")))?;
        Ok(AuditEntryId(id))
    }

    #[instrument(skip(self), err)]
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, AuditError> {
        let mut builder = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        builder.push(" WHERE TRUE");
        if let Some(outcome) = query.outcome {
            builder.push(" AND outcome = ").push_bind(outcome.as_str());
        }
        if let Some(event_type) = &query.event_type {
            builder.push(" AND event_type = ").push_bind(event_type.clone());
        }
        if let Some(message_id) = query.message_id {
            builder
                .push(" AND message_id = ")
                .push_bind(*message_id.as_uuid());
        }
        builder
            .push(" ORDER BY id ASC LIMIT ")
            .push_bind(i64::try_from(query.limit).unwrap_or(i64::MAX));

        let rows = builder
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn count(&self, outcome: AuditOutcome) -> Result<u64, AuditError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM event_audit_log WHERE outcome = $1")
            .bind(outcome.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;

        let n: i64 = row
            .try_get("n")
            .map_err(|e| AuditError::Corrupt(format!("count column: {e}")))?;
        Ok(n.max(0) as u64)
    }
}

fn entry_from_row(row: &PgRow) -> Result<AuditLogEntry, AuditError> {
    let corrupt = |e: sqlx::Error| AuditError::Corrupt(e.to_string());

    let id: i64 = row.try_get("id").map_err(corrupt)?;
    let message_id: Uuid = row.try_get("message_id").map_err(corrupt)?;
    let attempts: i32 = row.try_get("attempts").map_err(corrupt)?;
    let outcome: String = row.try_get("outcome").map_err(corrupt)?;
    let payload: JsonValue = row.try_get("payload").map_err(corrupt)?;
    let received_at: DateTime<Utc> = row.try_get("received_at").map_err(corrupt)?;

    Ok(AuditLogEntry {
        id: AuditEntryId(id),
        record: AuditRecord {
            message_id: MessageId::from_uuid(message_id),
            event_type: row.try_get("event_type").map_err(corrupt)?,
            routing_key: row.try_get("routing_key").map_err(corrupt)?,
            source_queue: row.try_get("source_queue").map_err(corrupt)?,
            payload,
            attempts: u32::try_from(attempts)
                .map_err(|_| AuditError::Corrupt(format!("negative attempts: {attempts}")))?,
            received_at,
            outcome: outcome.parse()?,
            error_detail: row.try_get("error_detail").map_err(corrupt)?,
        },
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> AuditError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") | Some("23502") => AuditError::Rejected(msg),
                _ => AuditError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            AuditError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => AuditError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
