//! Agent bridge
//!
//! The voice plane's only window into the host agent runtime: a
//! dispatcher that streams buffered text blocks for a user turn, plus the
//! tool registry shared with the speech-to-speech engines.

use async_trait::async_trait;
use lyra_core::{
    ConversationTurn, Result, TextStream, ToolDefinition, ToolHandler, ToolRegistry,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Context handed to the host runtime for one user turn
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Speaking user
    pub user_id: u64,
    /// Display name, when known
    pub display_name: Option<String>,
    /// Stable per-user session key (`voice:<user_id>`)
    pub session_key: String,
    /// Surface tag for the host's routing
    pub surface: String,
    /// The user's utterance
    pub text: String,
    /// Bounded conversation history
    pub history: Vec<ConversationTurn>,
    /// Session system prompt, when configured
    pub system_prompt: Option<String>,
}

/// Host runtime hook: streams the agent's reply as delivered text blocks
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Dispatch one turn and stream the reply
    async fn dispatch(&self, ctx: DispatchContext) -> Result<TextStream>;
}

/// Surface tag for live voice turns
pub const VOICE_SURFACE: &str = "discord-voice";

/// Surface tag for session-end transcripts
pub const VOICE_SUMMARY_SURFACE: &str = "discord-voice-summary";

/// Bridge between the voice session and the host agent runtime
pub struct AgentBridge {
    dispatcher: Arc<dyn AgentDispatcher>,
    tools: Arc<RwLock<ToolRegistry>>,
    system_prompt: Option<String>,
}

impl AgentBridge {
    /// Create a bridge around a host dispatcher
    pub fn new(dispatcher: Arc<dyn AgentDispatcher>, system_prompt: Option<String>) -> Self {
        Self {
            dispatcher,
            tools: Arc::new(RwLock::new(ToolRegistry::new())),
            system_prompt,
        }
    }

    /// Register a tool
    pub async fn register_tool(&self, definition: ToolDefinition, handler: ToolHandler) {
        self.tools.write().await.register(definition, handler);
    }

    /// Tool definitions for S2S session setup
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.read().await.definitions()
    }

    /// Execute a tool; failures come back as `{"error": ...}` values
    pub async fn execute_tool(&self, name: &str, arguments: serde_json::Value) -> serde_json::Value {
        self.tools.read().await.execute(name, arguments).await
    }

    /// Stream the agent's reply for a user turn
    pub async fn stream_response(
        &self,
        user_id: u64,
        display_name: Option<String>,
        text: &str,
        history: Vec<ConversationTurn>,
    ) -> Result<TextStream> {
        let ctx = DispatchContext {
            user_id,
            display_name,
            session_key: format!("voice:{}", user_id),
            surface: VOICE_SURFACE.to_string(),
            text: text.to_string(),
            history,
            system_prompt: self.system_prompt.clone(),
        };
        debug!(user_id = %user_id, text_len = %text.len(), "Dispatching user turn to agent");
        self.dispatcher.dispatch(ctx).await
    }

    /// Deliver a session-end transcript so the agent's memory keeps the
    /// conversation (speech-to-speech sessions only; pipeline turns were
    /// already streamed live)
    pub async fn dispatch_transcript(&self, guild_id: u64, transcript: &str) -> Result<()> {
        if transcript.trim().is_empty() {
            return Ok(());
        }
        info!(guild_id = %guild_id, len = %transcript.len(), "Dispatching session-end transcript");

        let ctx = DispatchContext {
            user_id: 0,
            display_name: None,
            session_key: format!("voice:guild:{}", guild_id),
            surface: VOICE_SUMMARY_SURFACE.to_string(),
            text: format!(
                "[Voice session ended. Transcript follows.]\n{}",
                transcript
            ),
            history: Vec::new(),
            system_prompt: self.system_prompt.clone(),
        };

        // The reply, if any, is not spoken; drain and discard.
        let stream = self.dispatcher.dispatch(ctx).await?;
        let _ = lyra_core::drain_reply(stream).await;
        Ok(())
    }
}
