//! Session manager
//!
//! Guild -> session map with deterministic lifecycle: joining a guild
//! that already has a session stops the old one first, the new session
//! is stored before `start` so concurrent joins collide on the map, and
//! leaving a speech-to-speech session hands its transcript to the agent
//! (pipeline sessions streamed every turn live and need no summary).

use crate::agent::AgentDispatcher;
use crate::engine::EngineMode;
use crate::session::{SessionContext, SessionEvent, VoiceSession};
use crate::settings::VoiceSettings;
use crate::transport::VoiceTransport;
use lyra_core::{ConversationTurn, LyraError, Result, ToolDefinition, ToolHandler, TurnRole};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Snapshot returned by `voice.status`
#[derive(Debug, Clone, serde::Serialize)]
pub struct VoiceStatus {
    /// Whether any session is running
    pub running: bool,
    /// Configured mode string
    pub mode: String,
    /// Whether the queried guild has a session
    pub active: bool,
    /// Queried session state, when active
    pub state: Option<String>,
    /// Queried session engine mode, when active
    #[serde(rename = "engineMode")]
    pub engine_mode: Option<String>,
    /// All guilds with running sessions
    #[serde(rename = "activeGuilds")]
    pub active_guilds: Vec<String>,
}

/// Result of a successful join
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Guild joined
    pub guild_id: u64,
    /// Channel joined
    pub channel_id: u64,
    /// Engine mode the session resolved to
    pub mode: EngineMode,
}

/// Owns every per-guild voice session
pub struct SessionManager {
    transport: Arc<dyn VoiceTransport>,
    dispatcher: Arc<dyn AgentDispatcher>,
    settings: VoiceSettings,
    sessions: RwLock<HashMap<u64, Arc<VoiceSession>>>,
    /// Tools copied onto every new session's bridge before start
    tool_templates: parking_lot::Mutex<Vec<(ToolDefinition, ToolHandler)>>,
    /// Back-reference for the per-session watcher tasks
    weak: Weak<SessionManager>,
}

impl SessionManager {
    /// Create a manager over a transport and the host dispatcher
    pub fn new(
        transport: Arc<dyn VoiceTransport>,
        dispatcher: Arc<dyn AgentDispatcher>,
        settings: VoiceSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            transport,
            dispatcher,
            settings,
            sessions: RwLock::new(HashMap::new()),
            tool_templates: parking_lot::Mutex::new(Vec::new()),
            weak: weak.clone(),
        })
    }

    /// Register a tool made available to every session (and through it to
    /// speech-to-speech providers)
    pub fn add_tool(&self, definition: ToolDefinition, handler: ToolHandler) {
        self.tool_templates.lock().push((definition, handler));
    }

    /// Join a voice channel, replacing any existing session for the guild
    pub async fn join(&self, guild_id: u64, channel_id: u64) -> Result<JoinOutcome> {
        // At most one session per guild: stop the prior one first.
        if self.sessions.read().await.contains_key(&guild_id) {
            info!(guild_id = %guild_id, "Replacing existing voice session");
            self.leave(guild_id).await?;
        }

        let sink = self.transport.connect(guild_id, channel_id).await?;

        let session = VoiceSession::new(
            SessionContext {
                guild_id,
                channel_id,
                settings: self.settings.clone(),
            },
            sink,
            self.dispatcher.clone(),
        );

        let templates: Vec<(ToolDefinition, ToolHandler)> =
            self.tool_templates.lock().clone();
        for (definition, handler) in templates {
            session.bridge().register_tool(definition, handler).await;
        }

        // Store before start so concurrent joins collide deterministically.
        self.sessions
            .write()
            .await
            .insert(guild_id, session.clone());

        if let Err(e) = self.transport.attach(guild_id, session.clone()).await {
            self.sessions.write().await.remove(&guild_id);
            let _ = self.transport.disconnect(guild_id).await;
            return Err(e);
        }

        if let Err(e) = session.start().await {
            // Failed start releases the transport before surfacing.
            self.sessions.write().await.remove(&guild_id);
            let _ = session.stop().await;
            let _ = self.transport.disconnect(guild_id).await;
            return Err(e);
        }

        if let Some(mut events) = session.take_events() {
            let weak = self.weak.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        SessionEvent::Fatal { message } => {
                            error!(guild_id = %guild_id, error = %message, "Session failed");
                            if let Some(manager) = weak.upgrade() {
                                let _ = manager.leave(guild_id).await;
                            }
                        }
                    }
                }
            });
        }

        let mode = session
            .mode()
            .ok_or_else(|| LyraError::session("session started without a mode"))?;
        Ok(JoinOutcome {
            guild_id,
            channel_id,
            mode,
        })
    }

    /// Leave a guild's voice channel
    pub async fn leave(&self, guild_id: u64) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(&guild_id)
            .ok_or_else(|| LyraError::not_found(format!("no session for guild {}", guild_id)))?;

        let history = session.history().await;
        let mode = session.mode();
        let bridge = session.bridge();

        if let Err(e) = session.stop().await {
            warn!(guild_id = %guild_id, error = %e, "Session stop failed");
        }
        let _ = self.transport.disconnect(guild_id).await;

        // Pipeline mode streamed every turn to the agent already; only
        // speech-to-speech sessions owe the agent a transcript.
        if mode == Some(EngineMode::SpeechToSpeech) && !history.is_empty() {
            let transcript = render_transcript(&history);
            if let Err(e) = bridge.dispatch_transcript(guild_id, &transcript).await {
                warn!(guild_id = %guild_id, error = %e, "Transcript dispatch failed");
            }
        }

        info!(guild_id = %guild_id, "Left voice channel");
        Ok(())
    }

    /// Speak text in a guild's voice channel
    pub async fn speak(&self, guild_id: u64, text: &str) -> Result<()> {
        let session = self
            .sessions
            .read()
            .await
            .get(&guild_id)
            .cloned()
            .ok_or_else(|| LyraError::not_found(format!("no session for guild {}", guild_id)))?;
        session.speak(text).await
    }

    /// Status snapshot, optionally focused on one guild
    pub async fn status(&self, guild_id: Option<u64>) -> VoiceStatus {
        let sessions = self.sessions.read().await;
        let active_guilds: Vec<String> = sessions.keys().map(|g| g.to_string()).collect();
        let queried = guild_id.and_then(|g| sessions.get(&g).cloned());

        VoiceStatus {
            running: !sessions.is_empty(),
            mode: self.settings.mode.as_str().to_string(),
            active: queried.is_some(),
            state: queried.as_ref().map(|s| s.state().as_str().to_string()),
            engine_mode: queried
                .as_ref()
                .and_then(|s| s.mode())
                .map(|m| m.as_str().to_string()),
            active_guilds,
        }
    }

    /// Look up a session
    pub async fn get(&self, guild_id: u64) -> Option<Arc<VoiceSession>> {
        self.sessions.read().await.get(&guild_id).cloned()
    }

    /// Best-effort leave of every guild, then transport teardown
    pub async fn stop_all(&self) {
        let guilds: Vec<u64> = self.sessions.read().await.keys().copied().collect();
        for guild_id in guilds {
            if let Err(e) = self.leave(guild_id).await {
                warn!(guild_id = %guild_id, error = %e, "Error leaving during shutdown");
            }
        }
        if let Err(e) = self.transport.shutdown().await {
            warn!(error = %e, "Transport shutdown failed");
        }
        info!("All voice sessions stopped");
    }
}

/// Render history as the plain-text transcript handed to the agent
fn render_transcript(history: &[ConversationTurn]) -> String {
    history
        .iter()
        .map(|turn| match turn.role {
            TurnRole::User => format!(
                "{}: {}",
                turn.display_name.as_deref().unwrap_or("User"),
                turn.content
            ),
            TurnRole::Assistant => format!("Assistant: {}", turn.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_transcript() {
        let mut log = lyra_core::ConversationLog::new(10);
        log.push_user(1, Some("Ada".to_string()), "hello");
        log.push_assistant("hi there");

        let transcript = render_transcript(&log.snapshot());
        assert_eq!(transcript, "Ada: hello\nAssistant: hi there");
    }
}
