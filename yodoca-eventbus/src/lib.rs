//! Durable, at-least-once event journal and dispatcher.
//!
//! `publish` persists a row before returning; subscriptions are in-memory
//! only and must be re-registered on every startup by extension code or by
//! the loader's event-subscription wiring.

#![warn(missing_docs, clippy::pedantic)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

/// Number of pending rows claimed per dispatcher tick.
const CLAIM_BATCH: i64 = 10;

/// Recovery-safety-net timeout: how long the dispatcher waits on its
/// internal signal before polling anyway.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Result alias for event bus operations.
pub type EventResult<T> = Result<T, EventError>;

/// Errors raised by the event bus.
#[derive(Debug, Error)]
pub enum EventError {
    /// Underlying SQLite storage error.
    #[error("event bus storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// One journaled event, as claimed by the dispatcher and handed to handlers.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Identifier assigned at publish time.
    pub event_id: Uuid,
    /// Topic the event was published under.
    pub topic: String,
    /// Identifier of the publishing extension or kernel component.
    pub source: String,
    /// Event payload.
    pub payload: Value,
    /// Optional correlation id threading related events together.
    pub correlation_id: Option<String>,
}

/// Handler invoked for every claimed event on a subscribed topic.
///
/// Handlers must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Processes a single claimed event.
    ///
    /// # Errors
    ///
    /// Any error marks the event `failed`; remaining handlers for the same
    /// event still run.
    async fn handle(&self, event: &EventRecord) -> EventResult<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Send + Sync + Fn(EventRecord) -> Fut,
    Fut: Future<Output = EventResult<()>> + Send,
{
    async fn handle(&self, event: &EventRecord) -> EventResult<()> {
        (self)(event.clone()).await
    }
}

struct Subscription {
    subscriber_id: String,
    handler: Arc<dyn EventHandler>,
}

/// SQLite-journaled event bus with a single cooperative dispatcher task.
pub struct EventBus {
    pool: SqlitePool,
    subscriptions: RwLock<HashMap<String, Vec<Subscription>>>,
    notify: Notify,
    dispatcher: RwLock<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Opens the event bus against `pool`, creating the journal table if
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Storage`] if the schema cannot be created.
    pub async fn new(pool: SqlitePool) -> EventResult<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS event_journal (
                event_id TEXT PRIMARY KEY,
                topic TEXT NOT NULL,
                source TEXT NOT NULL,
                payload TEXT NOT NULL,
                correlation_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                created_at TEXT NOT NULL,
                processed_at TEXT
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            subscriptions: RwLock::new(HashMap::new()),
            notify: Notify::new(),
            dispatcher: RwLock::new(None),
        })
    }

    /// Persists one event row with status `pending`, then signals the
    /// dispatcher. Fire-and-forget: does not wait for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Storage`] if the row cannot be written.
    pub async fn publish(
        &self,
        topic: &str,
        source: &str,
        payload: Value,
        correlation_id: Option<&str>,
    ) -> EventResult<Uuid> {
        let event_id = Uuid::new_v4();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO event_journal
                (event_id, topic, source, payload, correlation_id, status, created_at)
             VALUES (?, ?, ?, ?, ?, 'pending', ?)",
        )
        .bind(event_id.to_string())
        .bind(topic)
        .bind(source)
        .bind(payload.to_string())
        .bind(correlation_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.notify.notify_one();
        Ok(event_id)
    }

    /// Registers an in-memory subscription. Not durable; callers must
    /// re-subscribe on every startup.
    pub async fn subscribe(&self, topic: &str, subscriber_id: &str, handler: Arc<dyn EventHandler>) {
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.entry(topic.to_owned()).or_default().push(Subscription {
            subscriber_id: subscriber_id.to_owned(),
            handler,
        });
    }

    /// Removes a previously registered subscription.
    pub async fn unsubscribe(&self, topic: &str, subscriber_id: &str) {
        let mut subscriptions = self.subscriptions.write().await;
        if let Some(handlers) = subscriptions.get_mut(topic) {
            handlers.retain(|sub| sub.subscriber_id != subscriber_id);
        }
    }

    /// Resets any row left `processing` by a prior crash back to `pending`.
    /// Called once at startup, before `start`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Storage`] if the update fails.
    pub async fn recover(&self) -> EventResult<u64> {
        let result = sqlx::query("UPDATE event_journal SET status = 'pending' WHERE status = 'processing'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Re-queues a `failed` event for another dispatch attempt. The only
    /// supported retry path; there is no automatic retry.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Storage`] if the update fails.
    pub async fn requeue(&self, event_id: Uuid) -> EventResult<()> {
        sqlx::query("UPDATE event_journal SET status = 'pending', error = NULL WHERE event_id = ? AND status = 'failed'")
            .bind(event_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Starts the dispatcher as a background task. Idempotent only in the
    /// sense that a second call replaces the tracked join handle; callers
    /// should call `stop` first if restarting.
    pub async fn start(self: &Arc<Self>) {
        let bus = Arc::clone(self);
        let handle = tokio::spawn(async move {
            bus.dispatch_loop().await;
        });
        *self.dispatcher.write().await = Some(handle);
    }

    /// Stops the dispatcher task.
    pub async fn stop(&self) {
        if let Some(handle) = self.dispatcher.write().await.take() {
            handle.abort();
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep(POLL_TIMEOUT) => {}
            }

            if let Err(err) = self.dispatch_batch().await {
                error!(?err, "event dispatch batch failed");
            }
        }
    }

    async fn dispatch_batch(&self) -> EventResult<()> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT event_id, topic, source, payload, correlation_id FROM event_journal
             WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?",
        )
        .bind(CLAIM_BATCH)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(());
        }

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let event_id: String = row.try_get("event_id")?;
            sqlx::query("UPDATE event_journal SET status = 'processing' WHERE event_id = ?")
                .bind(&event_id)
                .execute(&mut *tx)
                .await?;

            let payload_text: String = row.try_get("payload")?;
            claimed.push(EventRecord {
                event_id: event_id.parse().unwrap_or_else(|_| Uuid::nil()),
                topic: row.try_get("topic")?,
                source: row.try_get("source")?,
                payload: serde_json::from_str(&payload_text).unwrap_or(Value::Null),
                correlation_id: row.try_get("correlation_id")?,
            });
        }

        tx.commit().await?;

        let subscriptions = self.subscriptions.read().await;
        let mut tasks = Vec::with_capacity(claimed.len());
        for event in claimed {
            let handlers: Vec<Arc<dyn EventHandler>> = subscriptions
                .get(&event.topic)
                .into_iter()
                .flatten()
                .map(|sub| Arc::clone(&sub.handler))
                .collect();
            let pool = self.pool.clone();
            tasks.push(tokio::spawn(run_handlers_for_event(pool, event, handlers)));
        }
        drop(subscriptions);

        for task in tasks {
            let _ = task.await;
        }

        Ok(())
    }
}

/// Runs every handler for one claimed event sequentially, then records the
/// outcome. Distinct events in the same batch run concurrently via the
/// tasks spawned in `dispatch_batch`.
async fn run_handlers_for_event(pool: SqlitePool, event: EventRecord, handlers: Vec<Arc<dyn EventHandler>>) {
    let mut failure: Option<String> = None;
    for handler in &handlers {
        if let Err(err) = handler.handle(&event).await {
            warn!(topic = %event.topic, event_id = %event.event_id, %err, "event handler failed");
            failure = Some(err.to_string());
        }
    }

    let (status, error) = match failure {
        Some(reason) => ("failed", Some(reason)),
        None => ("done", None),
    };

    let now = chrono::Utc::now().to_rfc3339();
    let _ = sqlx::query("UPDATE event_journal SET status = ?, error = ?, processed_at = ? WHERE event_id = ?")
        .bind(status)
        .bind(error)
        .bind(now)
        .bind(event.event_id.to_string())
        .execute(&pool)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    async fn memory_bus() -> Arc<EventBus> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Arc::new(EventBus::new(pool).await.unwrap())
    }

    #[tokio::test]
    async fn publish_is_dispatched_to_subscriber() {
        let bus = memory_bus().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        bus.subscribe(
            "task.progress",
            "counter",
            Arc::new(move |_event: EventRecord| {
                let seen = Arc::clone(&seen_clone);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await;

        bus.start().await;
        bus.publish("task.progress", "taskengine", serde_json::json!({"n": 1}), None)
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(200)).await;
        bus.stop().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recover_resets_processing_rows() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let bus = EventBus::new(pool.clone()).await.unwrap();
        bus.publish("x", "src", Value::Null, None).await.unwrap();
        sqlx::query("UPDATE event_journal SET status = 'processing'")
            .execute(&pool)
            .await
            .unwrap();

        let reset = bus.recover().await.unwrap();
        assert_eq!(reset, 1);
    }

    #[tokio::test]
    async fn failed_handler_does_not_block_others() {
        let bus = memory_bus().await;
        let ok_count = Arc::new(AtomicUsize::new(0));
        let ok_clone = Arc::clone(&ok_count);

        bus.subscribe(
            "topic",
            "failing",
            Arc::new(|_event: EventRecord| async { Err(EventError::Storage(sqlx::Error::RowNotFound)) }),
        )
        .await;
        bus.subscribe(
            "topic",
            "succeeding",
            Arc::new(move |_event: EventRecord| {
                let ok = Arc::clone(&ok_clone);
                async move {
                    ok.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await;

        bus.start().await;
        bus.publish("topic", "src", Value::Null, None).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        bus.stop().await;

        assert_eq!(ok_count.load(Ordering::SeqCst), 1);
    }
}
