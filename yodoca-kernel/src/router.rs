//! Message router: owns the agent handle and the current session, and
//! serialises every invocation behind a single mutex.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::interfaces::{Channel, ExtensionError, ExtensionResult, StreamingChannel};

/// Direct-callback event names recognised by `subscribe`/`unsubscribe`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DirectEvent {
    /// Fired once per inbound user message, before the agent runs.
    UserMessage,
    /// Fired once the agent's full response text is available.
    AgentResponse,
}

impl DirectEvent {
    /// Parses a direct-callback event name.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason if `name` is not `user_message` or
    /// `agent_response`.
    pub fn parse(name: &str) -> Result<Self, String> {
        match name {
            "user_message" => Ok(Self::UserMessage),
            "agent_response" => Ok(Self::AgentResponse),
            other => Err(format!("unknown direct-callback event `{other}`")),
        }
    }
}

/// A synchronous, in-process hook registered via
/// [`crate::context::ExtensionContext::subscribe`].
pub trait DirectCallback: Send + Sync {
    /// Invoked with the event payload. Must not block for long; this runs
    /// inline on the router's task.
    fn call(&self, payload: &Value);
}

impl<F> DirectCallback for F
where
    F: Fn(&Value) + Send + Sync,
{
    fn call(&self, payload: &Value) {
        (self)(payload);
    }
}

/// The orchestrator agent, installed once via [`MessageRouter::set_agent`]
/// after the loader finishes `build_orchestrator`.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Runs one invocation to completion and returns the final text.
    async fn invoke(&self, prompt: &str, agent_id: Option<&str>) -> ExtensionResult<String>;

    /// Runs one streaming invocation, delivering deltas and tool-call status
    /// through the supplied callbacks, and returns the final accumulated text.
    async fn invoke_streamed(
        &self,
        prompt: &str,
        agent_id: Option<&str>,
        on_chunk: Arc<dyn Fn(&str) + Send + Sync>,
        on_tool_call: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    ) -> ExtensionResult<String>;
}

/// A registered channel, carrying whichever capability the loader detected.
#[derive(Clone)]
pub enum RegisteredChannel {
    /// Supports only whole-message delivery.
    Plain(Arc<dyn Channel>),
    /// Also supports incremental streaming delivery.
    Streaming(Arc<dyn StreamingChannel>),
}

impl RegisteredChannel {
    fn as_channel(&self) -> &(dyn Channel) {
        match self {
            Self::Plain(channel) => channel.as_ref(),
            Self::Streaming(channel) => channel.as_ref(),
        }
    }

    fn as_streaming(&self) -> Option<Arc<dyn StreamingChannel>> {
        match self {
            Self::Plain(_) => None,
            Self::Streaming(channel) => Some(Arc::clone(channel)),
        }
    }
}

enum StreamForwardEvent {
    Chunk(String),
    Status(String),
}

struct SessionState {
    session_id: Uuid,
    last_message_at: Instant,
}

impl SessionState {
    fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            last_message_at: Instant::now(),
        }
    }
}

/// Owns the orchestrator agent handle, the registered channels, and the
/// current conversation session.
pub struct MessageRouter {
    agent: RwLock<Option<Arc<dyn AgentHandle>>>,
    channels: RwLock<HashMap<String, RegisteredChannel>>,
    channel_descriptions: RwLock<HashMap<String, String>>,
    channel_order: RwLock<Vec<String>>,
    direct_callbacks: RwLock<HashMap<DirectEvent, Vec<(String, Arc<dyn DirectCallback>)>>>,
    session: Mutex<SessionState>,
    invocation_lock: Mutex<()>,
    events: Arc<yodoca_eventbus::EventBus>,
    session_timeout: Duration,
}

impl MessageRouter {
    /// Creates a router with no agent or channels registered yet.
    #[must_use]
    pub fn new(events: Arc<yodoca_eventbus::EventBus>, session_timeout: Duration) -> Self {
        Self {
            agent: RwLock::new(None),
            channels: RwLock::new(HashMap::new()),
            channel_descriptions: RwLock::new(HashMap::new()),
            channel_order: RwLock::new(Vec::new()),
            direct_callbacks: RwLock::new(HashMap::new()),
            session: Mutex::new(SessionState::new()),
            invocation_lock: Mutex::new(()),
            events,
            session_timeout,
        }
    }

    /// Installs the orchestrator agent. Intended to be called exactly once,
    /// by the runner, after the loader's `build_orchestrator` phase.
    pub async fn set_agent(&self, agent: Arc<dyn AgentHandle>) {
        *self.agent.write().await = Some(agent);
    }

    /// Registers (or replaces) a channel under `id`. Idempotent: the last
    /// call for a given id wins.
    pub async fn register_channel(&self, id: &str, description: &str, channel: RegisteredChannel) {
        let mut channels = self.channels.write().await;
        let is_new = !channels.contains_key(id);
        channels.insert(id.to_owned(), channel);
        drop(channels);

        self.channel_descriptions
            .write()
            .await
            .insert(id.to_owned(), description.to_owned());

        if is_new {
            self.channel_order.write().await.push(id.to_owned());
        }
    }

    /// `true` if `id` names a currently registered channel.
    pub async fn is_channel_registered(&self, id: &str) -> bool {
        self.channels.read().await.contains_key(id)
    }

    /// Returns `{channel_id, description}` pairs for every registered channel.
    pub async fn list_channels(&self) -> Vec<(String, String)> {
        let descriptions = self.channel_descriptions.read().await;
        self.channel_order
            .read()
            .await
            .iter()
            .filter_map(|id| descriptions.get(id).map(|desc| (id.clone(), desc.clone())))
            .collect()
    }

    /// Registers a direct-callback hook for `event`, keyed by `subscriber_id`
    /// so a later `unsubscribe_direct` call can remove it.
    pub async fn subscribe_direct(&self, event: DirectEvent, subscriber_id: &str, callback: Arc<dyn DirectCallback>) {
        let mut callbacks = self.direct_callbacks.write().await;
        let subs = callbacks.entry(event).or_default();
        subs.retain(|(id, _)| id != subscriber_id);
        subs.push((subscriber_id.to_owned(), callback));
    }

    /// Removes `subscriber_id`'s hook for `event`, if any.
    pub async fn unsubscribe_direct(&self, event: DirectEvent, subscriber_id: &str) {
        if let Some(subs) = self.direct_callbacks.write().await.get_mut(&event) {
            subs.retain(|(id, _)| id != subscriber_id);
        }
    }

    async fn emit_direct(&self, event: DirectEvent, payload: &Value) {
        let callbacks = self.direct_callbacks.read().await;
        if let Some(subs) = callbacks.get(&event) {
            for (_, callback) in subs {
                callback.call(payload);
            }
        }
    }

    /// Rotates the session if the gap since the last message exceeds the
    /// configured timeout, publishing `session.completed` for the old one.
    async fn maybe_rotate_session(&self) {
        let mut session = self.session.lock().await;
        let elapsed = session.last_message_at.elapsed();
        if elapsed >= self.session_timeout {
            let previous = session.session_id;
            *session = SessionState::new();
            drop(session);

            if let Err(err) = self
                .events
                .publish(
                    "session.completed",
                    "router",
                    serde_json::json!({ "session_id": previous.to_string(), "reason": "inactivity_timeout" }),
                    None,
                )
                .await
            {
                warn!(%err, "failed to publish session.completed");
            }
        } else {
            session.last_message_at = Instant::now();
        }
    }

    /// Reactive entry point: routes one inbound user message to the agent
    /// and delivers the response to `channel_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError`] if no agent is installed yet, or the agent
    /// invocation itself fails.
    pub async fn handle_user_message(&self, text: &str, user_id: &str, channel_id: &str) -> ExtensionResult<()> {
        self.maybe_rotate_session().await;
        self.emit_direct(
            DirectEvent::UserMessage,
            &serde_json::json!({ "text": text, "user_id": user_id, "channel_id": channel_id }),
        )
        .await;

        let _guard = self.invocation_lock.lock().await;

        let channels = self.channels.read().await;
        let Some(registered) = channels.get(channel_id).cloned() else {
            drop(channels);
            return Err(ExtensionError::Lifecycle {
                id: channel_id.to_owned(),
                phase: "handle_user_message",
                reason: "channel not registered".to_owned(),
            });
        };
        drop(channels);

        let agent = self.agent.read().await.clone().ok_or_else(|| ExtensionError::Lifecycle {
            id: "router".to_owned(),
            phase: "handle_user_message",
            reason: "no agent installed".to_owned(),
        })?;

        let full_text = if let Some(streaming) = registered.as_streaming() {
            self.deliver_streamed(agent.as_ref(), text, user_id, streaming).await?
        } else {
            let response = agent.invoke(text, None).await?;
            registered.as_channel().send_to_user(user_id, &response).await?;
            response
        };

        self.emit_direct(
            DirectEvent::AgentResponse,
            &serde_json::json!({ "text": full_text, "user_id": user_id, "channel_id": channel_id }),
        )
        .await;

        Ok(())
    }

    async fn deliver_streamed(
        &self,
        agent: &dyn AgentHandle,
        prompt: &str,
        user_id: &str,
        channel: Arc<dyn StreamingChannel>,
    ) -> ExtensionResult<String> {
        channel.on_stream_start(user_id).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<StreamForwardEvent>();

        let on_chunk: Arc<dyn Fn(&str) + Send + Sync> = {
            let tx = tx.clone();
            Arc::new(move |delta: &str| {
                let _ = tx.send(StreamForwardEvent::Chunk(delta.to_owned()));
            })
        };

        let on_tool_call: Arc<dyn Fn(&str) + Send + Sync> = {
            let tx = tx.clone();
            Arc::new(move |tool_name: &str| {
                let _ = tx.send(StreamForwardEvent::Status(format!("Using: {tool_name}")));
            })
        };

        // Drop the original sender; once `on_chunk`/`on_tool_call` are also
        // dropped below, the channel closes and the forwarder task returns.
        drop(tx);

        let forward_channel = Arc::clone(&channel);
        let forward_user_id = user_id.to_owned();
        let forwarder = tokio::spawn(async move {
            let mut buffer = String::new();
            while let Some(event) = rx.recv().await {
                match event {
                    StreamForwardEvent::Chunk(delta) => {
                        buffer.push_str(&delta);
                        forward_channel.on_stream_chunk(&forward_user_id, &delta).await;
                    }
                    StreamForwardEvent::Status(status) => {
                        forward_channel.on_stream_status(&forward_user_id, &status).await;
                    }
                }
            }
            buffer
        });

        let result = agent
            .invoke_streamed(prompt, None, on_chunk, Some(on_tool_call))
            .await;

        let accumulated = forwarder.await.unwrap_or_default();
        let full_text = match result {
            Ok(_) => accumulated,
            Err(err) => format!("{accumulated}\n[error: {err}]"),
        };

        channel.on_stream_end(user_id, &full_text).await;
        Ok(full_text)
    }

    /// Synchronous invocation for extensions that need a response without a
    /// channel. Serialised by the router's mutex.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError`] if no agent is installed or it fails.
    pub async fn invoke_agent(&self, prompt: &str, agent_id: Option<&str>) -> ExtensionResult<String> {
        let _guard = self.invocation_lock.lock().await;
        let agent = self.agent.read().await.clone().ok_or_else(|| ExtensionError::Lifecycle {
            id: "router".to_owned(),
            phase: "invoke_agent",
            reason: "no agent installed".to_owned(),
        })?;
        agent.invoke(prompt, agent_id).await
    }

    /// Streaming invocation variant; holds the router mutex for the entire
    /// stream duration, matching blocking invocation semantics.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError`] if no agent is installed or it fails.
    pub async fn invoke_agent_streamed(
        &self,
        prompt: &str,
        agent_id: Option<&str>,
        on_chunk: Arc<dyn Fn(&str) + Send + Sync>,
        on_tool_call: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    ) -> ExtensionResult<String> {
        let _guard = self.invocation_lock.lock().await;
        let agent = self.agent.read().await.clone().ok_or_else(|| ExtensionError::Lifecycle {
            id: "router".to_owned(),
            phase: "invoke_agent_streamed",
            reason: "no agent installed".to_owned(),
        })?;
        agent.invoke_streamed(prompt, agent_id, on_chunk, on_tool_call).await
    }

    /// Proactive delivery: uses `channel_id` if registered, else the
    /// first-registered channel.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError`] if no channel is registered at all, or the
    /// resolved channel's `send_message` fails.
    pub async fn notify_user(&self, text: &str, channel_id: Option<&str>) -> ExtensionResult<()> {
        let channels = self.channels.read().await;
        let order = self.channel_order.read().await;

        let target_id = channel_id
            .filter(|id| channels.contains_key(*id))
            .or_else(|| order.first().map(String::as_str));

        let Some(target_id) = target_id else {
            return Err(ExtensionError::Lifecycle {
                id: "router".to_owned(),
                phase: "notify_user",
                reason: "no channel registered".to_owned(),
            });
        };

        let registered = channels.get(target_id).cloned().expect("checked above");
        drop(channels);
        drop(order);

        registered.as_channel().send_message(text).await?;
        info!(channel_id = target_id, "delivered proactive notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sqlx::SqlitePool;

    async fn router() -> MessageRouter {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let events = Arc::new(yodoca_eventbus::EventBus::new(pool).await.unwrap());
        MessageRouter::new(events, Duration::from_secs(1800))
    }

    struct EchoChannel {
        id: String,
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Channel for EchoChannel {
        fn channel_id(&self) -> &str {
            &self.id
        }

        fn description(&self) -> &str {
            "echo"
        }

        async fn send_message(&self, text: &str) -> ExtensionResult<()> {
            self.sent.lock().await.push(text.to_owned());
            Ok(())
        }

        async fn send_to_user(&self, _user_id: &str, text: &str) -> ExtensionResult<()> {
            self.sent.lock().await.push(text.to_owned());
            Ok(())
        }
    }

    struct EchoAgent;

    #[async_trait]
    impl AgentHandle for EchoAgent {
        async fn invoke(&self, prompt: &str, _agent_id: Option<&str>) -> ExtensionResult<String> {
            Ok(format!("echo: {prompt}"))
        }

        async fn invoke_streamed(
            &self,
            prompt: &str,
            _agent_id: Option<&str>,
            on_chunk: Arc<dyn Fn(&str) + Send + Sync>,
            _on_tool_call: Option<Arc<dyn Fn(&str) + Send + Sync>>,
        ) -> ExtensionResult<String> {
            on_chunk(prompt);
            Ok(prompt.to_owned())
        }
    }

    #[tokio::test]
    async fn registering_same_channel_twice_keeps_single_order_entry() {
        let router = router().await;
        let sent = Arc::new(Mutex::new(Vec::new()));
        let channel: Arc<dyn Channel> = Arc::new(EchoChannel {
            id: "cli".to_owned(),
            sent: Arc::clone(&sent),
        });
        router.register_channel("cli", "first", RegisteredChannel::Plain(Arc::clone(&channel))).await;
        router.register_channel("cli", "second", RegisteredChannel::Plain(channel)).await;

        let channels = router.list_channels().await;
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].1, "second");
    }

    #[tokio::test]
    async fn direct_callback_fires_and_can_be_removed() {
        let router = router().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        router
            .subscribe_direct(
                DirectEvent::UserMessage,
                "listener",
                Arc::new(move |_: &Value| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        router.set_agent(Arc::new(EchoAgent)).await;
        let sent = Arc::new(Mutex::new(Vec::new()));
        let channel: Arc<dyn Channel> = Arc::new(EchoChannel {
            id: "cli".to_owned(),
            sent: Arc::clone(&sent),
        });
        router.register_channel("cli", "cli channel", RegisteredChannel::Plain(channel)).await;

        router.handle_user_message("hi", "user-1", "cli").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        router.unsubscribe_direct(DirectEvent::UserMessage, "listener").await;
        router.handle_user_message("hi again", "user-1", "cli").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_agent_errors() {
        let router = router().await;
        let channel: Arc<dyn Channel> = Arc::new(EchoChannel {
            id: "cli".to_owned(),
            sent: Arc::new(Mutex::new(Vec::new())),
        });
        router.register_channel("cli", "cli channel", RegisteredChannel::Plain(channel)).await;

        let err = router
            .handle_user_message("hi", "user-1", "cli")
            .await
            .expect_err("no agent installed yet");
        assert!(matches!(err, ExtensionError::Lifecycle { .. }));
    }
}
