//! Agent-facing tools created directly against kernel objects: channel
//! listing/send, and the secure-input request. Task-engine tools are
//! registered separately, straight from `yodoca_taskengine::TaskEngine::tool_bindings`.
//!
//! These close over live `Arc<MessageRouter>`/`Arc<EventBus>` state, so they
//! go through `ToolRegistry::register_tool`'s closure path rather than the
//! `#[tool]` macro's bare-`fn` executor, the same reason agent-extension
//! tool wiring does in `loader::wire_agent_provider`.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;
use yodoca_eventbus::EventBus;
use yodoca_tools::registry::{ToolMetadata, ToolRegistry};

use crate::router::MessageRouter;

const SECURE_INPUT_TOPIC: &str = "system.channel.secure_input_request";

fn is_valid_secret_id(id: &str) -> bool {
    let mut chars = id.chars();
    let Some(first) = chars.next() else { return false };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    id.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Registers `list_channels`, `send_to_channel`, and `request_secure_input`
/// against `tools`. Call once, after the router's channels have been wired
/// by the loader's `detect_and_wire` phase.
pub fn register_core_tools(router: &Arc<MessageRouter>, events: &Arc<EventBus>, tools: &ToolRegistry) {
    let list_router = Arc::clone(router);
    let list_metadata = ToolMetadata::new("list_channels", "1.0.0")
        .expect("static metadata")
        .with_description("List every registered channel as {channel_id, description}");
    if let Err(err) = tools.register_tool(list_metadata, move |_input: Value| {
        let router = Arc::clone(&list_router);
        async move {
            let channels = router.list_channels().await;
            Ok(json!(channels
                .into_iter()
                .map(|(channel_id, description)| json!({ "channel_id": channel_id, "description": description }))
                .collect::<Vec<_>>()))
        }
    }) {
        warn!(%err, "failed to register list_channels");
    }

    let send_router = Arc::clone(router);
    let send_metadata = ToolMetadata::new("send_to_channel", "1.0.0")
        .expect("static metadata")
        .with_description("Deliver text to a channel by id: {channel_id, text} -> {success, error?}");
    if let Err(err) = tools.register_tool(send_metadata, move |input: Value| {
        let router = Arc::clone(&send_router);
        async move {
            let channel_id = input.get("channel_id").and_then(Value::as_str).unwrap_or_default().to_owned();
            let text = input.get("text").and_then(Value::as_str).unwrap_or_default();

            if !router.is_channel_registered(&channel_id).await {
                return Ok(json!({ "success": false, "error": format!("channel `{channel_id}` is not registered") }));
            }

            match router.notify_user(text, Some(channel_id.as_str())).await {
                Ok(()) => Ok(json!({ "success": true })),
                Err(err) => Ok(json!({ "success": false, "error": err.to_string() })),
            }
        }
    }) {
        warn!(%err, "failed to register send_to_channel");
    }

    let secure_input_events = Arc::clone(events);
    let secure_input_metadata = ToolMetadata::new("request_secure_input", "1.0.0")
        .expect("static metadata")
        .with_description("Request a secret value out-of-band: {secret_id, prompt} -> {success, error?}");
    if let Err(err) = tools.register_tool(secure_input_metadata, move |input: Value| {
        let events = Arc::clone(&secure_input_events);
        async move {
            let secret_id = input.get("secret_id").and_then(Value::as_str).unwrap_or_default().to_owned();
            let prompt = input.get("prompt").and_then(Value::as_str).unwrap_or_default().to_owned();

            if !is_valid_secret_id(&secret_id) {
                return Ok(json!({
                    "success": false,
                    "error": "secret_id must match ^[A-Za-z_][A-Za-z0-9_]{0,63}$",
                }));
            }

            let payload = json!({ "secret_id": secret_id, "prompt": prompt, "target_channel": Value::Null });
            match events.publish(SECURE_INPUT_TOPIC, "core_tools", payload, None).await {
                Ok(_) => Ok(json!({ "success": true })),
                Err(err) => Ok(json!({ "success": false, "error": err.to_string() })),
            }
        }
    }) {
        warn!(%err, "failed to register request_secure_input");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_secret_id_shape() {
        assert!(is_valid_secret_id("OPENAI_API_KEY"));
        assert!(is_valid_secret_id("_leading_underscore"));
        assert!(!is_valid_secret_id("1starts_with_digit"));
        assert!(!is_valid_secret_id("has space"));
        assert!(!is_valid_secret_id(""));
        assert!(!is_valid_secret_id(&"a".repeat(65)));
    }

    #[tokio::test]
    async fn list_channels_and_send_to_channel_round_trip() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let events = Arc::new(EventBus::new(pool).await.unwrap());
        let router = Arc::new(MessageRouter::new(Arc::clone(&events), std::time::Duration::from_secs(1800)));

        struct RecordingChannel {
            sent: std::sync::Mutex<Vec<String>>,
        }

        #[async_trait::async_trait]
        impl crate::interfaces::Channel for RecordingChannel {
            fn channel_id(&self) -> &str {
                "cli"
            }

            fn description(&self) -> &str {
                "recording test channel"
            }

            async fn send_message(&self, text: &str) -> crate::interfaces::ExtensionResult<()> {
                self.sent.lock().unwrap().push(text.to_owned());
                Ok(())
            }

            async fn send_to_user(&self, _user_id: &str, text: &str) -> crate::interfaces::ExtensionResult<()> {
                self.sent.lock().unwrap().push(text.to_owned());
                Ok(())
            }
        }

        let channel = Arc::new(RecordingChannel { sent: std::sync::Mutex::new(Vec::new()) });
        router
            .register_channel("cli", "recording test channel", crate::router::RegisteredChannel::Plain(channel.clone()))
            .await;

        let tools = ToolRegistry::new();
        register_core_tools(&router, &events, &tools);

        let listed = tools.invoke("list_channels", json!({})).await.unwrap();
        assert_eq!(listed[0]["channel_id"], "cli");

        let sent = tools
            .invoke("send_to_channel", json!({ "channel_id": "cli", "text": "hello" }))
            .await
            .unwrap();
        assert_eq!(sent["success"], true);
        assert_eq!(channel.sent.lock().unwrap().as_slice(), ["hello"]);

        let unregistered = tools
            .invoke("send_to_channel", json!({ "channel_id": "nonexistent", "text": "hello" }))
            .await
            .unwrap();
        assert_eq!(unregistered["success"], false);
        assert_eq!(channel.sent.lock().unwrap().as_slice(), ["hello"]);

        let missing = tools
            .invoke("request_secure_input", json!({ "secret_id": "bad id", "prompt": "give key" }))
            .await
            .unwrap();
        assert_eq!(missing["success"], false);

        let ok = tools
            .invoke("request_secure_input", json!({ "secret_id": "OPENAI_API_KEY", "prompt": "give key" }))
            .await
            .unwrap();
        assert_eq!(ok["success"], true);
    }
}
