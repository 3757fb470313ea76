//! Durable gateway-event queue with exclusive-claim semantics.
//!
//! The queue is a Postgres table owned by the upstream gateway:
//! `gateway_events (id, source, event_type, external_id, payload, status,
//! created_at, processed_at, error)` with `status` in
//! `pending | processing | done | failed`. Claiming flips pending rows to
//! `processing` inside one statement using `FOR UPDATE SKIP LOCKED`, so
//! concurrent pollers (in this process or another) never receive the same
//! row.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::PgPool;
use sqlx::postgres::PgPoolOptions;
use sqlx::postgres::PgRow;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::event::GatewayEvent;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Claim, complete, and fail gateway rows. The dispatch loop only sees this
/// trait; production uses [`PgEventQueue`].
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Atomically claim up to the configured batch of pending rows for the
    /// configured source, oldest first. Returns an empty batch, never blocks,
    /// when nothing is pending. Storage errors propagate to the caller.
    async fn poll(&self) -> Result<Vec<GatewayEvent>, QueueError>;

    /// Terminal transition to `done`. No-op on an unknown id.
    async fn mark_done(&self, event_id: &str) -> Result<(), QueueError>;

    /// Terminal transition to `failed`, recording the error text. No-op on an
    /// unknown id.
    async fn mark_failed(&self, event_id: &str, error: &str) -> Result<(), QueueError>;

    /// Cooperative pause between empty polls.
    async fn idle(&self, interval: Duration) {
        tokio::time::sleep(interval).await;
    }
}

const CLAIM_SQL: &str = r"
UPDATE gateway_events
SET status = 'processing', processed_at = now()
WHERE id IN (
  SELECT id FROM gateway_events
  WHERE source = $1 AND status = 'pending'
  ORDER BY created_at
  LIMIT $2
  FOR UPDATE SKIP LOCKED
)
RETURNING id, source, event_type, external_id, payload, created_at
";

const DONE_SQL: &str = r"
UPDATE gateway_events
SET status = 'done', processed_at = now()
WHERE id = $1
";

const FAILED_SQL: &str = r"
UPDATE gateway_events
SET status = 'failed', processed_at = now(), error = $2
WHERE id = $1
";

/// Postgres-backed queue. One in-flight claim/commit at a time from this
/// instance; cross-process exclusivity comes from SKIP LOCKED.
pub struct PgEventQueue {
    pool: PgPool,
    source: String,
    batch_size: i64,
    claim_guard: Mutex<()>,
}

impl PgEventQueue {
    pub async fn connect(
        database_url: &str,
        source: &str,
        batch_size: usize,
    ) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self::with_pool(pool, source, batch_size))
    }

    #[must_use]
    pub fn with_pool(pool: PgPool, source: &str, batch_size: usize) -> Self {
        Self {
            pool,
            source: source.to_string(),
            batch_size: batch_size.clamp(1, 100) as i64,
            claim_guard: Mutex::new(()),
        }
    }

    fn row_to_event(row: &PgRow) -> Result<GatewayEvent, QueueError> {
        let payload: Value = row.try_get("payload")?;
        Ok(GatewayEvent {
            id: row.try_get("id")?,
            source: row.try_get("source")?,
            event_type: row.try_get("event_type")?,
            external_id: row.try_get("external_id")?,
            payload: coerce_payload(payload),
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Gateway rows sometimes store the webhook body as a JSON-encoded string
/// rather than a JSON object; decode it best-effort. Payloads that are
/// neither become an empty object so downstream extraction degrades cleanly.
fn coerce_payload(payload: Value) -> Value {
    match payload {
        Value::Object(_) => payload,
        Value::String(encoded) => match serde_json::from_str::<Value>(&encoded) {
            Ok(Value::Object(decoded)) => Value::Object(decoded),
            _ => Value::Object(serde_json::Map::new()),
        },
        _ => Value::Object(serde_json::Map::new()),
    }
}

#[async_trait]
impl EventQueue for PgEventQueue {
    async fn poll(&self) -> Result<Vec<GatewayEvent>, QueueError> {
        let _guard = self.claim_guard.lock().await;
        let rows = sqlx::query(CLAIM_SQL)
            .bind(&self.source)
            .bind(self.batch_size)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn mark_done(&self, event_id: &str) -> Result<(), QueueError> {
        let _guard = self.claim_guard.lock().await;
        sqlx::query(DONE_SQL)
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> Result<(), QueueError> {
        let _guard = self.claim_guard.lock().await;
        sqlx::query(FAILED_SQL)
            .bind(event_id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
