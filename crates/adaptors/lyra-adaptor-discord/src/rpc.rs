//! Management RPC and the `discord_voice` agent tool
//!
//! One JSON dispatch surface shared by both callers: the management
//! socket invokes `voice.join` / `voice.leave` / `voice.speak` /
//! `voice.status`, and the agent gets the same operations as a single
//! tool with an `action` argument.

use crate::manager::SessionManager;
use crate::session::SessionState;
use lyra_core::{create_tool_definition, ToolDefinition, ToolHandler};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Accept Discord snowflakes as either JSON strings or numbers
fn parse_id(params: &Value, key: &str) -> Option<u64> {
    match params.get(key) {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.as_u64(),
        _ => None,
    }
}

fn error_response(message: impl Into<String>) -> Value {
    json!({ "success": false, "error": message.into() })
}

/// Management RPC dispatcher
pub struct VoiceRpc {
    manager: Arc<SessionManager>,
}

impl VoiceRpc {
    /// Create a dispatcher over the session manager
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Handle one request; errors come back as `{success: false, error}`
    pub async fn handle(&self, method: &str, params: &Value) -> Value {
        debug!(method = %method, "Voice RPC");
        match method {
            "voice.join" => self.join(params).await,
            "voice.leave" => self.leave(params).await,
            "voice.speak" => self.speak(params).await,
            "voice.status" => self.status(params).await,
            other => error_response(format!("Unknown method: {}", other)),
        }
    }

    async fn join(&self, params: &Value) -> Value {
        let Some(guild_id) = parse_id(params, "guildId") else {
            return error_response("guildId is required");
        };
        let Some(channel_id) = parse_id(params, "channelId") else {
            return error_response("channelId is required");
        };

        match self.manager.join(guild_id, channel_id).await {
            Ok(outcome) => json!({
                "success": true,
                "guildId": outcome.guild_id.to_string(),
                "channelId": outcome.channel_id.to_string(),
                "mode": outcome.mode.as_str(),
            }),
            Err(e) => error_response(e.to_string()),
        }
    }

    async fn leave(&self, params: &Value) -> Value {
        let Some(guild_id) = parse_id(params, "guildId") else {
            return error_response("guildId is required");
        };

        match self.manager.leave(guild_id).await {
            Ok(()) => json!({ "success": true, "guildId": guild_id.to_string() }),
            Err(e) => error_response(e.to_string()),
        }
    }

    async fn speak(&self, params: &Value) -> Value {
        let Some(guild_id) = parse_id(params, "guildId") else {
            return error_response("guildId is required");
        };
        let Some(text) = params.get("text").and_then(|t| t.as_str()) else {
            return error_response("text is required");
        };
        if text.trim().is_empty() {
            return error_response("text is empty");
        }

        match self.manager.speak(guild_id, text).await {
            Ok(()) => json!({
                "success": true,
                "guildId": guild_id.to_string(),
                "spoken": true,
            }),
            Err(e) => error_response(e.to_string()),
        }
    }

    async fn status(&self, params: &Value) -> Value {
        let guild_id = parse_id(params, "guildId");
        let status = self.manager.status(guild_id).await;
        let mut value = serde_json::to_value(&status).unwrap_or_else(|_| json!({}));
        value["success"] = json!(true);
        if value["state"].is_null() {
            value["state"] = json!(SessionState::Idle.as_str());
        }
        value
    }
}

/// Definition of the `discord_voice` agent tool
pub fn voice_tool_definition() -> ToolDefinition {
    create_tool_definition(
        "discord_voice",
        "Control Discord voice: join or leave a voice channel, speak text aloud, or check status.",
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["join", "leave", "speak", "status"],
                    "description": "Operation to perform",
                },
                "guildId": {
                    "type": "string",
                    "description": "Guild (server) id",
                },
                "channelId": {
                    "type": "string",
                    "description": "Voice channel id (join only)",
                },
                "text": {
                    "type": "string",
                    "description": "Text to speak aloud (speak only)",
                },
            },
            "required": ["action", "guildId"],
        }),
    )
}

/// Register the `discord_voice` tool on the manager; sessions copy it to
/// their bridges, which exposes it to speech-to-speech providers too
pub fn register_voice_tool(manager: &Arc<SessionManager>) {
    let weak: Weak<SessionManager> = Arc::downgrade(manager);

    let handler: ToolHandler = Arc::new(move |args: Value| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(manager) = weak.upgrade() else {
                return Ok(json!({ "error": "voice manager is gone" }));
            };
            let rpc = VoiceRpc::new(manager);

            let action = args.get("action").and_then(|a| a.as_str()).unwrap_or("");
            let method = match action {
                "join" => "voice.join",
                "leave" => "voice.leave",
                "speak" => "voice.speak",
                "status" => "voice.status",
                other => {
                    return Ok(json!({ "error": format!("Unknown action: {}", other) }));
                }
            };

            Ok(rpc.handle(method, &args).await)
        })
    });

    manager.add_tool(voice_tool_definition(), handler);
}
