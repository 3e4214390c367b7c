//! Durable task engine: `agent_task`/`task_step` tables, a lease-based
//! claim loop, and a ReAct loop dispatched through an [`AgentDispatcher`]
//! supplied by the kernel.
//!
//! The engine has no dependency on the kernel crate; the kernel wires it in
//! directly (tools registered into the shared tool registry, worker loop
//! spawned alongside other background work) rather than through the
//! extension-manifest discovery path, since it is a built-in component, not
//! a discoverable extension.

#![warn(missing_docs, clippy::pedantic)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;
use yodoca_eventbus::EventBus;
use yodoca_tools::registry::{ToolBinding, ToolFuture, ToolMetadata, ToolResult as ToolOpResult};

const DEFAULT_LEASE_TTL_SEC: i64 = 120;
const DEFAULT_MAX_CONCURRENT: usize = 4;
const DEFAULT_MAX_STEPS: i64 = 20;
const DEFAULT_MAX_RETRIES: i64 = 5;
const RETRY_BASE_SEC: f64 = 5.0;
const RETRY_MAX_SEC: f64 = 300.0;
const MAX_SUBTASK_DEPTH: i64 = 3;

/// Result alias for task engine operations.
pub type TaskEngineResult<T> = Result<T, TaskEngineError>;

/// Errors raised by the task engine.
#[derive(Debug, Error)]
pub enum TaskEngineError {
    /// Underlying SQLite storage error.
    #[error("task engine storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// `submit_task` would exceed the subtask depth cap.
    #[error("subtask depth exceeds the cap of {MAX_SUBTASK_DEPTH}")]
    DepthExceeded,

    /// The referenced task does not exist.
    #[error("task `{0}` not found")]
    NotFound(Uuid),
}

/// Context passed to [`AgentDispatcher::dispatch`] for one step.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    /// Running summary of the task's progress so far.
    pub conversation_summary: Option<String>,
    /// Correlation id threading every step of one task run together.
    pub correlation_id: String,
}

/// Outcome status of a single dispatched step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// The agent produced a usable result for this step.
    Success,
    /// The step failed transiently and should be retried.
    Error,
    /// The agent declined to continue; not retryable.
    Refused,
}

/// Result of dispatching one ReAct step to an agent.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Step outcome classification.
    pub status: DispatchStatus,
    /// Text content produced by the step.
    pub content: String,
    /// Set when the agent's response included a `finish_task` tool result.
    pub finished: bool,
}

/// Dispatches one ReAct step to an agent, implemented by the kernel's
/// router/orchestrator wiring and supplied to [`TaskEngine::new`].
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Invokes `agent_id` (or the orchestrator) with `prompt`.
    async fn dispatch(&self, agent_id: &str, prompt: &str, ctx: DispatchContext) -> DispatchOutcome;
}

/// Lifecycle status of an `agent_task` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Eligible for claim.
    Pending,
    /// Claimed and currently being worked.
    Running,
    /// Scheduled for a retry after a transient failure.
    RetryScheduled,
    /// Waiting for all child subtasks to reach a terminal state.
    WaitingSubtasks,
    /// Paused pending a human response.
    HumanReview,
    /// Completed successfully.
    Done,
    /// Exhausted retries or hit a non-retryable error.
    Failed,
    /// Cancelled by `cancel_task`.
    Cancelled,
}

impl TaskStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::RetryScheduled => "retry_scheduled",
            Self::WaitingSubtasks => "waiting_subtasks",
            Self::HumanReview => "human_review",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "running" => Self::Running,
            "retry_scheduled" => Self::RetryScheduled,
            "waiting_subtasks" => Self::WaitingSubtasks,
            "human_review" => Self::HumanReview,
            "done" => Self::Done,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    /// `true` once the task will never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Status record returned by `get_task_status` and `list_active_tasks`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    /// Task identifier.
    pub task_id: Uuid,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Current ReAct step number.
    pub step: i64,
    /// Final or partial result content, once available.
    pub result: Option<String>,
}

/// Durable, lease-based task engine.
pub struct TaskEngine {
    pool: SqlitePool,
    events: Arc<EventBus>,
    dispatcher: Arc<dyn AgentDispatcher>,
    lease_ttl_sec: i64,
    max_steps: i64,
    max_retries: i64,
    concurrency: Arc<Semaphore>,
    worker_id: String,
}

impl TaskEngine {
    /// Creates the task engine, creating its tables if absent.
    ///
    /// # Errors
    ///
    /// Returns [`TaskEngineError::Storage`] if the schema cannot be created.
    pub async fn new(
        pool: SqlitePool,
        events: Arc<EventBus>,
        dispatcher: Arc<dyn AgentDispatcher>,
        max_concurrent_tasks: Option<u32>,
        lease_ttl_sec: Option<u64>,
    ) -> TaskEngineResult<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_task (
                task_id TEXT PRIMARY KEY,
                parent_task_id TEXT,
                depth INTEGER NOT NULL DEFAULT 0,
                goal TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                leased_by TEXT,
                lease_exp TEXT,
                schedule_at TEXT,
                attempt_no INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                max_steps INTEGER NOT NULL,
                step INTEGER NOT NULL DEFAULT 0,
                checkpoint TEXT NOT NULL DEFAULT '{}',
                review_question TEXT,
                result TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS task_step (
                step_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                step_no INTEGER NOT NULL,
                idempotency_key TEXT NOT NULL,
                prompt TEXT NOT NULL,
                response_status TEXT NOT NULL,
                response_content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            events,
            dispatcher,
            lease_ttl_sec: lease_ttl_sec.map_or(DEFAULT_LEASE_TTL_SEC, |v| v as i64),
            max_steps: DEFAULT_MAX_STEPS,
            max_retries: DEFAULT_MAX_RETRIES,
            concurrency: Arc::new(Semaphore::new(
                max_concurrent_tasks.map_or(DEFAULT_MAX_CONCURRENT, |v| v as usize),
            )),
            worker_id: Uuid::new_v4().to_string(),
        })
    }

    /// Crash recovery: rows left `running` with an expired lease are reset
    /// to `pending`, or `retry_scheduled` if they had already been retried.
    ///
    /// # Errors
    ///
    /// Returns [`TaskEngineError::Storage`] if the update fails.
    pub async fn recover(&self) -> TaskEngineResult<u64> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE agent_task
             SET status = CASE WHEN attempt_no > 0 THEN 'retry_scheduled' ELSE 'pending' END
             WHERE status = 'running' AND (lease_exp IS NULL OR lease_exp < ?)",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Submits a new task, failing if the subtask depth cap would be
    /// exceeded.
    ///
    /// # Errors
    ///
    /// Returns [`TaskEngineError::DepthExceeded`] or a storage error.
    pub async fn submit_task(
        &self,
        goal: &str,
        agent_id: &str,
        priority: i64,
        parent_task_id: Option<Uuid>,
        max_steps: Option<i64>,
    ) -> TaskEngineResult<Uuid> {
        let depth = match parent_task_id {
            None => 0,
            Some(parent) => {
                let parent_depth: i64 = sqlx::query("SELECT depth FROM agent_task WHERE task_id = ?")
                    .bind(parent.to_string())
                    .fetch_one(&self.pool)
                    .await?
                    .try_get("depth")?;
                if parent_depth + 1 > MAX_SUBTASK_DEPTH {
                    return Err(TaskEngineError::DepthExceeded);
                }
                parent_depth + 1
            }
        };

        let task_id = Uuid::new_v4();
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO agent_task
                (task_id, parent_task_id, depth, goal, agent_id, priority, status,
                 attempt_no, max_retries, max_steps, step, checkpoint, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, 0, '{}', ?, ?)",
        )
        .bind(task_id.to_string())
        .bind(parent_task_id.map(|id| id.to_string()))
        .bind(depth)
        .bind(goal)
        .bind(agent_id)
        .bind(priority)
        .bind(self.max_retries)
        .bind(max_steps.unwrap_or(self.max_steps))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.events
            .publish(
                "task.submitted",
                "taskengine",
                serde_json::json!({"task_id": task_id.to_string(), "goal": goal}),
                None,
            )
            .await
            .ok();

        Ok(task_id)
    }

    /// Returns the current status of one task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskEngineError::NotFound`] if the task does not exist.
    pub async fn get_task_status(&self, task_id: Uuid) -> TaskEngineResult<TaskStatusView> {
        let row = sqlx::query("SELECT status, step, result FROM agent_task WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TaskEngineError::NotFound(task_id))?;

        let status: String = row.try_get("status")?;
        Ok(TaskStatusView {
            task_id,
            status: TaskStatus::parse(&status),
            step: row.try_get("step")?,
            result: row.try_get("result")?,
        })
    }

    /// Lists every non-terminal task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskEngineError::Storage`] if the query fails.
    pub async fn list_active_tasks(&self) -> TaskEngineResult<Vec<TaskStatusView>> {
        let rows = sqlx::query(
            "SELECT task_id, status, step, result FROM agent_task
             WHERE status NOT IN ('done', 'failed', 'cancelled')
             ORDER BY priority DESC, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let task_id: String = row.try_get("task_id")?;
                let status: String = row.try_get("status")?;
                Ok(TaskStatusView {
                    task_id: task_id.parse().unwrap_or_else(|_| Uuid::nil()),
                    status: TaskStatus::parse(&status),
                    step: row.try_get("step")?,
                    result: row.try_get("result")?,
                })
            })
            .collect()
    }

    /// Cancels a task unconditionally, recording `reason` in its result.
    ///
    /// # Errors
    ///
    /// Returns [`TaskEngineError::Storage`] if the update fails.
    pub async fn cancel_task(&self, task_id: Uuid, reason: Option<&str>) -> TaskEngineResult<()> {
        sqlx::query("UPDATE agent_task SET status = 'cancelled', result = ?, updated_at = ? WHERE task_id = ?")
            .bind(reason.unwrap_or("cancelled"))
            .bind(now_rfc3339())
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Pauses a task pending a human response.
    ///
    /// # Errors
    ///
    /// Returns [`TaskEngineError::Storage`] if the update fails.
    pub async fn request_human_review(&self, task_id: Uuid, question: &str) -> TaskEngineResult<()> {
        sqlx::query(
            "UPDATE agent_task SET status = 'human_review', review_question = ?, updated_at = ? WHERE task_id = ?",
        )
        .bind(question)
        .bind(now_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resumes a task paused for human review, folding `response` into its
    /// checkpoint and returning it to `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskEngineError::Storage`] if the update fails.
    pub async fn respond_to_review(&self, task_id: Uuid, response: &str) -> TaskEngineResult<()> {
        let checkpoint: String = sqlx::query("SELECT checkpoint FROM agent_task WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_one(&self.pool)
            .await?
            .try_get("checkpoint")?;

        let mut state: Value = serde_json::from_str(&checkpoint).unwrap_or_else(|_| serde_json::json!({}));
        state["human_review_response"] = Value::String(response.to_owned());

        sqlx::query(
            "UPDATE agent_task SET status = 'pending', checkpoint = ?, review_question = NULL, updated_at = ?
             WHERE task_id = ?",
        )
        .bind(state.to_string())
        .bind(now_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Claims up to one eligible task via a two-step compare-and-swap.
    async fn claim(&self) -> TaskEngineResult<Option<Uuid>> {
        let now = now_rfc3339();
        let candidate = sqlx::query(
            "SELECT task_id FROM agent_task
             WHERE status IN ('pending', 'retry_scheduled')
               AND (schedule_at IS NULL OR schedule_at <= ?)
               AND (lease_exp IS NULL OR lease_exp < ?)
             ORDER BY priority DESC, created_at ASC LIMIT 1",
        )
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = candidate else {
            return Ok(None);
        };
        let task_id: String = row.try_get("task_id")?;

        let lease_exp = lease_expiry(self.lease_ttl_sec);
        let updated = sqlx::query(
            "UPDATE agent_task SET status = 'running', leased_by = ?, lease_exp = ?, updated_at = ?
             WHERE task_id = ? AND status IN ('pending', 'retry_scheduled')",
        )
        .bind(&self.worker_id)
        .bind(lease_exp)
        .bind(now_rfc3339())
        .bind(&task_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(task_id.parse().unwrap_or_else(|_| Uuid::nil())))
    }

    async fn renew_lease(&self, task_id: Uuid) -> TaskEngineResult<()> {
        sqlx::query("UPDATE agent_task SET lease_exp = ? WHERE task_id = ?")
            .bind(lease_expiry(self.lease_ttl_sec))
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Spawns the background claim loop. Runs until the returned task is
    /// aborted by the caller.
    pub fn spawn_worker_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.claim().await {
                    Ok(Some(task_id)) => {
                        let engine = Arc::clone(&self);
                        let Ok(permit) = Arc::clone(&engine.concurrency).acquire_owned().await else {
                            break;
                        };
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(err) = engine.run_task(task_id).await {
                                warn!(%task_id, %err, "task run failed");
                            }
                        });
                    }
                    Ok(None) => tokio::time::sleep(Duration::from_millis(500)).await,
                    Err(err) => {
                        warn!(%err, "claim failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    async fn run_task(&self, task_id: Uuid) -> TaskEngineResult<()> {
        let row = sqlx::query(
            "SELECT goal, agent_id, step, max_steps, attempt_no, checkpoint, parent_task_id
             FROM agent_task WHERE task_id = ?",
        )
        .bind(task_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        let goal: String = row.try_get("goal")?;
        let agent_id: String = row.try_get("agent_id")?;
        let mut step: i64 = row.try_get("step")?;
        let max_steps: i64 = row.try_get("max_steps")?;
        let attempt_no: i64 = row.try_get("attempt_no")?;
        let checkpoint: String = row.try_get("checkpoint")?;
        let parent_task_id: Option<String> = row.try_get("parent_task_id")?;
        let mut state: Value = serde_json::from_str(&checkpoint).unwrap_or_else(|_| serde_json::json!({}));
        let partial_result = state
            .get("partial_result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        self.renew_lease(task_id).await?;

        let prompt = format!(
            "goal: {goal}\nprogress so far: {partial_result}\nstep: {step}/{max_steps}"
        );
        let idempotency_key = step_idempotency_key(task_id, step, &prompt);
        let correlation_id = Uuid::new_v4().to_string();

        let outcome = self
            .dispatcher
            .dispatch(
                &agent_id,
                &prompt,
                DispatchContext {
                    conversation_summary: Some(partial_result.clone()),
                    correlation_id: correlation_id.clone(),
                },
            )
            .await;

        self.record_step(task_id, step, &idempotency_key, &prompt, &outcome)
            .await?;

        match outcome.status {
            DispatchStatus::Error => {
                self.schedule_retry(task_id, attempt_no).await?;
                return Ok(());
            }
            DispatchStatus::Refused => {
                self.fail_task(task_id, "agent refused to continue").await?;
                return Ok(());
            }
            DispatchStatus::Success => {}
        }

        state["partial_result"] = Value::String(outcome.content.clone());
        step += 1;

        if outcome.finished {
            self.complete_task(task_id, parent_task_id.as_deref(), &outcome.content)
                .await?;
            return Ok(());
        }

        if step >= max_steps {
            self.complete_task_with_warning(task_id, &outcome.content).await?;
            return Ok(());
        }

        let open_children: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM agent_task WHERE parent_task_id = ? AND status NOT IN ('done', 'failed', 'cancelled')",
        )
        .bind(task_id.to_string())
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;
        let next_status = if open_children > 0 { TaskStatus::WaitingSubtasks } else { TaskStatus::Pending };

        sqlx::query(
            "UPDATE agent_task SET status = ?, step = ?, checkpoint = ?, updated_at = ? WHERE task_id = ?",
        )
        .bind(next_status.as_str())
        .bind(step)
        .bind(state.to_string())
        .bind(now_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;

        self.events
            .publish(
                "task.progress",
                "taskengine",
                serde_json::json!({"task_id": task_id.to_string(), "step": step}),
                Some(&correlation_id),
            )
            .await
            .ok();

        Ok(())
    }

    async fn record_step(
        &self,
        task_id: Uuid,
        step_no: i64,
        idempotency_key: &str,
        prompt: &str,
        outcome: &DispatchOutcome,
    ) -> TaskEngineResult<()> {
        let status = match outcome.status {
            DispatchStatus::Success => "success",
            DispatchStatus::Error => "error",
            DispatchStatus::Refused => "refused",
        };
        sqlx::query(
            "INSERT OR IGNORE INTO task_step
                (step_id, task_id, step_no, idempotency_key, prompt, response_status, response_content, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(task_id.to_string())
        .bind(step_no)
        .bind(idempotency_key)
        .bind(prompt)
        .bind(status)
        .bind(&outcome.content)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn schedule_retry(&self, task_id: Uuid, attempt_no: i64) -> TaskEngineResult<()> {
        let next_attempt = attempt_no + 1;
        if next_attempt >= self.max_retries {
            self.fail_task(task_id, "exhausted retries").await?;
            return Ok(());
        }

        let delay = retry_delay_seconds(attempt_no);
        let schedule_at = chrono::Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64);

        sqlx::query(
            "UPDATE agent_task
             SET status = 'retry_scheduled', attempt_no = ?, schedule_at = ?, updated_at = ?
             WHERE task_id = ?",
        )
        .bind(next_attempt)
        .bind(schedule_at.to_rfc3339())
        .bind(now_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_task(&self, task_id: Uuid, reason: &str) -> TaskEngineResult<()> {
        sqlx::query("UPDATE agent_task SET status = 'failed', result = ?, updated_at = ? WHERE task_id = ?")
            .bind(reason)
            .bind(now_rfc3339())
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_task_with_warning(&self, task_id: Uuid, partial_result: &str) -> TaskEngineResult<()> {
        let result = format!("{partial_result}\n[warning: max_steps reached before completion]");
        sqlx::query("UPDATE agent_task SET status = 'done', result = ?, updated_at = ? WHERE task_id = ?")
            .bind(&result)
            .bind(now_rfc3339())
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        parent_task_id: Option<&str>,
        result: &str,
    ) -> TaskEngineResult<()> {
        sqlx::query("UPDATE agent_task SET status = 'done', result = ?, updated_at = ? WHERE task_id = ?")
            .bind(result)
            .bind(now_rfc3339())
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?;

        self.events
            .publish(
                "task.completed",
                "taskengine",
                serde_json::json!({"task_id": task_id.to_string(), "result": result}),
                None,
            )
            .await
            .ok();

        if let Some(parent) = parent_task_id {
            self.maybe_resume_parent(parent).await?;
        } else {
            self.events
                .publish(
                    "system.user.notify",
                    "taskengine",
                    serde_json::json!({"text": format!("Task finished: {result}")}),
                    None,
                )
                .await
                .ok();
        }

        Ok(())
    }

    async fn maybe_resume_parent(&self, parent_task_id: &str) -> TaskEngineResult<()> {
        let siblings = sqlx::query("SELECT status, result FROM agent_task WHERE parent_task_id = ?")
            .bind(parent_task_id)
            .fetch_all(&self.pool)
            .await?;

        let all_terminal = siblings.iter().all(|row| {
            row.try_get::<String, _>("status")
                .map(|status| TaskStatus::parse(&status).is_terminal())
                .unwrap_or(false)
        });

        if !all_terminal {
            return Ok(());
        }

        let results: Vec<Option<String>> = siblings
            .iter()
            .map(|row| row.try_get("result").unwrap_or_default())
            .collect();

        let checkpoint: String = sqlx::query("SELECT checkpoint FROM agent_task WHERE task_id = ?")
            .bind(parent_task_id)
            .fetch_one(&self.pool)
            .await?
            .try_get("checkpoint")?;
        let mut state: Value = serde_json::from_str(&checkpoint).unwrap_or_else(|_| serde_json::json!({}));
        state["subtask_results"] = serde_json::json!(results);

        sqlx::query(
            "UPDATE agent_task SET status = 'pending', checkpoint = ?, updated_at = ?
             WHERE task_id = ? AND status = 'waiting_subtasks'",
        )
        .bind(state.to_string())
        .bind(now_rfc3339())
        .bind(parent_task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Builds the six agent-facing tool bindings this engine exposes.
    ///
    /// There is exactly one task engine per running agent process; this
    /// registers `self` as the process-wide engine handle the bindings'
    /// `fn(Value) -> ToolFuture` executors read from, since that signature
    /// cannot otherwise close over per-instance state.
    ///
    /// # Panics
    ///
    /// Panics if called more than once per process.
    #[must_use]
    pub fn tool_bindings(self: &Arc<Self>) -> Vec<ToolBinding> {
        ENGINE
            .set(Arc::clone(self))
            .expect("tool_bindings must be called at most once per process");

        vec![
            ToolBinding::new(
                ToolMetadata::new("submit_task", "1.0.0")
                    .expect("static metadata")
                    .with_description("Submit a new agent task and return its task id"),
                submit_task_executor,
            ),
            ToolBinding::new(
                ToolMetadata::new("get_task_status", "1.0.0")
                    .expect("static metadata")
                    .with_description("Fetch the current status of a submitted task"),
                get_task_status_executor,
            ),
            ToolBinding::new(
                ToolMetadata::new("list_active_tasks", "1.0.0")
                    .expect("static metadata")
                    .with_description("List every task that has not reached a terminal state"),
                list_active_tasks_executor,
            ),
            ToolBinding::new(
                ToolMetadata::new("cancel_task", "1.0.0")
                    .expect("static metadata")
                    .with_description("Cancel a running or pending task"),
                cancel_task_executor,
            ),
            ToolBinding::new(
                ToolMetadata::new("request_human_review", "1.0.0")
                    .expect("static metadata")
                    .with_description("Pause a task pending a human response to a question"),
                request_human_review_executor,
            ),
            ToolBinding::new(
                ToolMetadata::new("respond_to_review", "1.0.0")
                    .expect("static metadata")
                    .with_description("Resume a task paused for human review with a response"),
                respond_to_review_executor,
            ),
        ]
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn lease_expiry(ttl_sec: i64) -> String {
    (chrono::Utc::now() + chrono::Duration::seconds(ttl_sec)).to_rfc3339()
}

fn step_idempotency_key(task_id: Uuid, step_no: i64, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(step_no.to_le_bytes());
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn retry_delay_seconds(attempt_no: i64) -> f64 {
    let backoff = (RETRY_BASE_SEC * 2f64.powi(attempt_no as i32)).min(RETRY_MAX_SEC);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..=0.3);
    backoff + backoff * jitter
}

/// Process-wide task engine handle used by the tool executors below. Set
/// once by `TaskEngine::tool_bindings`.
static ENGINE: std::sync::OnceLock<Arc<TaskEngine>> = std::sync::OnceLock::new();

fn engine() -> Arc<TaskEngine> {
    Arc::clone(ENGINE.get().expect("task engine tools invoked before tool_bindings() ran"))
}

fn parse_task_id(input: &Value) -> ToolOpResult<Uuid> {
    input
        .get("task_id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| yodoca_tools::registry::ToolError::execution("task_id is required and must be a uuid"))
}

fn execution_error(err: impl std::fmt::Display) -> yodoca_tools::registry::ToolError {
    yodoca_tools::registry::ToolError::execution(err.to_string())
}

fn submit_task_executor(input: Value) -> ToolFuture {
    Box::pin(async move {
        let goal = input
            .get("goal")
            .and_then(Value::as_str)
            .ok_or_else(|| yodoca_tools::registry::ToolError::execution("goal is required"))?;
        let agent_id = input.get("agent_id").and_then(Value::as_str).unwrap_or("orchestrator");
        let priority = input.get("priority").and_then(Value::as_i64).unwrap_or(0);
        let parent_task_id = input
            .get("parent_task_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());
        let max_steps = input.get("max_steps").and_then(Value::as_i64);

        let task_id = engine()
            .submit_task(goal, agent_id, priority, parent_task_id, max_steps)
            .await
            .map_err(execution_error)?;

        Ok(serde_json::json!({"task_id": task_id.to_string()}))
    })
}

fn get_task_status_executor(input: Value) -> ToolFuture {
    Box::pin(async move {
        let task_id = parse_task_id(&input)?;
        let status = engine().get_task_status(task_id).await.map_err(execution_error)?;
        serde_json::to_value(status).map_err(execution_error)
    })
}

fn list_active_tasks_executor(_input: Value) -> ToolFuture {
    Box::pin(async move {
        let tasks = engine().list_active_tasks().await.map_err(execution_error)?;
        serde_json::to_value(tasks).map_err(execution_error)
    })
}

fn cancel_task_executor(input: Value) -> ToolFuture {
    Box::pin(async move {
        let task_id = parse_task_id(&input)?;
        let reason = input.get("reason").and_then(Value::as_str);
        engine().cancel_task(task_id, reason).await.map_err(execution_error)?;
        Ok(serde_json::json!({"success": true}))
    })
}

fn request_human_review_executor(input: Value) -> ToolFuture {
    Box::pin(async move {
        let task_id = parse_task_id(&input)?;
        let question = input
            .get("question")
            .and_then(Value::as_str)
            .ok_or_else(|| yodoca_tools::registry::ToolError::execution("question is required"))?;
        engine()
            .request_human_review(task_id, question)
            .await
            .map_err(execution_error)?;
        Ok(serde_json::json!({"success": true}))
    })
}

fn respond_to_review_executor(input: Value) -> ToolFuture {
    Box::pin(async move {
        let task_id = parse_task_id(&input)?;
        let response = input
            .get("response")
            .and_then(Value::as_str)
            .ok_or_else(|| yodoca_tools::registry::ToolError::execution("response is required"))?;
        engine()
            .respond_to_review(task_id, response)
            .await
            .map_err(execution_error)?;
        Ok(serde_json::json!({"success": true}))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoDispatcher {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentDispatcher for EchoDispatcher {
        async fn dispatch(&self, _agent_id: &str, _prompt: &str, _ctx: DispatchContext) -> DispatchOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                DispatchOutcome {
                    status: DispatchStatus::Success,
                    content: "done".to_owned(),
                    finished: true,
                }
            } else {
                DispatchOutcome {
                    status: DispatchStatus::Success,
                    content: String::new(),
                    finished: true,
                }
            }
        }
    }

    async fn test_engine() -> Arc<TaskEngine> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let events = Arc::new(EventBus::new(pool.clone()).await.unwrap());
        let dispatcher = Arc::new(EchoDispatcher {
            calls: Arc::new(AtomicUsize::new(0)),
        });
        Arc::new(TaskEngine::new(pool, events, dispatcher, None, None).await.unwrap())
    }

    #[tokio::test]
    async fn submit_and_complete_task() {
        let engine = test_engine().await;
        let task_id = engine
            .submit_task("summarize the inbox", "orchestrator", 0, None, None)
            .await
            .unwrap();

        engine.run_task(task_id).await.unwrap();

        let status = engine.get_task_status(task_id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Done);
        assert_eq!(status.result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn cancel_marks_task_cancelled() {
        let engine = test_engine().await;
        let task_id = engine.submit_task("goal", "orchestrator", 0, None, None).await.unwrap();
        engine.cancel_task(task_id, Some("no longer needed")).await.unwrap();
        let status = engine.get_task_status(task_id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn submit_task_rejects_depth_beyond_cap() {
        let engine = test_engine().await;
        let mut current = None;
        for _ in 0..=MAX_SUBTASK_DEPTH {
            current = Some(
                engine
                    .submit_task("nested", "orchestrator", 0, current, None)
                    .await
                    .unwrap(),
            );
        }

        let err = engine
            .submit_task("too deep", "orchestrator", 0, current, None)
            .await
            .expect_err("depth cap should reject further nesting");
        assert!(matches!(err, TaskEngineError::DepthExceeded));
    }

    struct StallingDispatcher;

    #[async_trait]
    impl AgentDispatcher for StallingDispatcher {
        async fn dispatch(&self, _agent_id: &str, _prompt: &str, _ctx: DispatchContext) -> DispatchOutcome {
            DispatchOutcome {
                status: DispatchStatus::Success,
                content: "waiting on child".to_owned(),
                finished: false,
            }
        }
    }

    async fn test_engine_with(dispatcher: Arc<dyn AgentDispatcher>) -> Arc<TaskEngine> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let events = Arc::new(EventBus::new(pool.clone()).await.unwrap());
        Arc::new(TaskEngine::new(pool, events, dispatcher, None, None).await.unwrap())
    }

    #[tokio::test]
    async fn parent_pauses_for_subtasks_and_resumes_once_they_finish() {
        let engine = test_engine_with(Arc::new(StallingDispatcher)).await;
        let parent_id = engine.submit_task("parent goal", "orchestrator", 0, None, None).await.unwrap();
        let child_id = engine
            .submit_task("child goal", "orchestrator", 0, Some(parent_id), None)
            .await
            .unwrap();

        engine.run_task(parent_id).await.unwrap();
        let status = engine.get_task_status(parent_id).await.unwrap();
        assert_eq!(status.status, TaskStatus::WaitingSubtasks);

        engine.cancel_task(child_id, Some("done for test")).await.unwrap();
        engine.maybe_resume_parent(&parent_id.to_string()).await.unwrap();

        let status = engine.get_task_status(parent_id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn maybe_resume_parent_leaves_a_parent_that_was_never_paused_alone() {
        let engine = test_engine_with(Arc::new(StallingDispatcher)).await;
        let parent_id = engine.submit_task("parent goal", "orchestrator", 0, None, None).await.unwrap();
        sqlx::query("UPDATE agent_task SET status = 'running' WHERE task_id = ?")
            .bind(parent_id.to_string())
            .execute(&engine.pool)
            .await
            .unwrap();

        engine.maybe_resume_parent(&parent_id.to_string()).await.unwrap();

        let status = engine.get_task_status(parent_id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Running);
    }

    #[test]
    fn retry_delay_grows_with_backoff_and_stays_capped() {
        let small = retry_delay_seconds(0);
        let large = retry_delay_seconds(10);
        assert!(small >= RETRY_BASE_SEC && small <= RETRY_BASE_SEC * 1.3);
        assert!(large <= RETRY_MAX_SEC * 1.3);
    }
}
