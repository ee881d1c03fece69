//! Gemini Live speech-to-speech session
//!
//! Input PCM16 at 16 kHz, output at 24 kHz. Tools must be declared in the
//! setup frame; mid-session tool updates are ignored by the service.
//!
//! Live sessions are subject to a hard server-side time limit (about ten
//! minutes), so the session rotates itself: shortly before the limit a
//! replacement socket is opened and configured with a system instruction
//! carrying the recent conversation, and only once the replacement is up
//! is the old socket closed. The old socket's close is then reported as a
//! planned rotation rather than an error.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use lyra_core::{Result, ToolCall, ToolDefinition};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{instruction_with_history, pcm_to_bytes, HistoryFn, S2sEvent, S2sSession};
use crate::types::VoiceError;
use crate::{WsSink, WsSource};

const GEMINI_WS_BASE: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const GEMINI_INPUT_SAMPLE_RATE: u32 = 16_000;
const GEMINI_OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// How long before the provider limit the replacement socket is opened
pub const GEMINI_SESSION_ROTATION_BUFFER_MS: u64 = 60_000;

/// Turns of context carried across a rotation
const ROTATION_HISTORY_TURNS: usize = 10;

/// Gemini Live session configuration
#[derive(Clone)]
pub struct GeminiLiveConfig {
    /// API key (falls back to GEMINI_API_KEY)
    pub api_key: Option<String>,
    /// Live model name
    pub model: String,
    /// Prebuilt voice name
    pub voice: String,
    /// System instruction
    pub system_prompt: String,
    /// Tools, declared at setup only
    pub tools: Vec<ToolDefinition>,
    /// Provider session limit
    pub session_duration_ms: u64,
    /// Rotation lead time before the limit
    pub rotation_buffer_ms: u64,
    /// Endpoint override (tests, proxies); the API key query parameter is
    /// appended either way
    pub endpoint: Option<String>,
}

impl Default for GeminiLiveConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "models/gemini-2.0-flash-live-001".to_string(),
            voice: "Puck".to_string(),
            system_prompt: String::new(),
            tools: Vec::new(),
            session_duration_ms: 600_000,
            rotation_buffer_ms: GEMINI_SESSION_ROTATION_BUFFER_MS,
            endpoint: None,
        }
    }
}

struct Shared {
    /// Active socket sink; replaced wholesale on rotation
    sink: Mutex<WsSink>,
    /// Monotonically increasing socket generation
    generation: AtomicU64,
    /// True only inside the make-before-break window
    rotating: AtomicBool,
    /// call_id -> tool name, needed for Gemini function responses
    pending_tools: parking_lot::Mutex<HashMap<String, String>>,
    events: mpsc::Sender<S2sEvent>,
}

/// Live Gemini session with transparent rotation
pub struct GeminiLiveSession {
    config: GeminiLiveConfig,
    shared: Arc<Shared>,
    history: HistoryFn,
    shutdown: CancellationToken,
}

impl GeminiLiveSession {
    /// Check whether credentials for this provider are resolvable
    pub fn has_credentials(config: &GeminiLiveConfig) -> bool {
        lyra_core::config::has_api_key(
            config.api_key.as_deref(),
            lyra_core::config::GEMINI_API_KEY,
        )
    }

    /// Connect and configure a Live session
    ///
    /// `history` supplies recent conversation turns when a rotation needs
    /// to rebuild context on the replacement socket.
    pub async fn connect(
        config: GeminiLiveConfig,
        history: HistoryFn,
    ) -> Result<(Self, mpsc::Receiver<S2sEvent>)> {
        let api_key = lyra_core::config::resolve_api_key(
            config.api_key.as_deref(),
            lyra_core::config::GEMINI_API_KEY,
        )
        .ok_or_else(|| {
            VoiceError::Authentication(format!(
                "Gemini API key not found. Set {} or provide a key.",
                lyra_core::config::GEMINI_API_KEY
            ))
        })?;

        let (event_tx, event_rx) = mpsc::channel::<S2sEvent>(128);

        info!(model = %config.model, "Connecting to Gemini Live");
        let (sink, source) =
            Self::open_socket(&config, &api_key, &config.system_prompt).await?;

        let shared = Arc::new(Shared {
            sink: Mutex::new(sink),
            generation: AtomicU64::new(1),
            rotating: AtomicBool::new(false),
            pending_tools: parking_lot::Mutex::new(HashMap::new()),
            events: event_tx,
        });

        tokio::spawn(Self::receive_loop(source, shared.clone(), 1));

        let session = Self {
            config,
            shared,
            history,
            shutdown: CancellationToken::new(),
        };
        session.spawn_rotation_timer(api_key);

        Ok((session, event_rx))
    }

    fn ws_url(config: &GeminiLiveConfig, api_key: &str) -> String {
        let base = config.endpoint.as_deref().unwrap_or(GEMINI_WS_BASE);
        format!("{}?key={}", base, api_key)
    }

    /// Open a socket and send the setup frame; resolves once the socket is
    /// writable (setupComplete arrives asynchronously on the receive loop).
    async fn open_socket(
        config: &GeminiLiveConfig,
        api_key: &str,
        instruction: &str,
    ) -> Result<(WsSink, WsSource)> {
        let (ws, _) = connect_async(Self::ws_url(config, api_key))
            .await
            .map_err(|e| VoiceError::WebSocket(format!("Gemini connect failed: {}", e)))?;
        let (mut sink, source) = ws.split();

        let declarations: Vec<serde_json::Value> = config
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();

        let mut setup = serde_json::json!({
            "setup": {
                "model": config.model,
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                    "speechConfig": {
                        "voiceConfig": {
                            "prebuiltVoiceConfig": { "voiceName": config.voice }
                        }
                    },
                },
                "systemInstruction": {
                    "parts": [{ "text": instruction }]
                },
            }
        });
        if !declarations.is_empty() {
            setup["setup"]["tools"] =
                serde_json::json!([{ "functionDeclarations": declarations }]);
        }

        sink.send(Message::Text(setup.to_string()))
            .await
            .map_err(|e| VoiceError::WebSocket(format!("Gemini setup failed: {}", e)))?;

        Ok((sink, source))
    }

    fn spawn_rotation_timer(&self, api_key: String) {
        let lead = self
            .config
            .session_duration_ms
            .saturating_sub(self.config.rotation_buffer_ms)
            .max(1);
        let config = self.config.clone();
        let shared = self.shared.clone();
        let history = self.history.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(lead)) => {}
                }
                if let Err(e) = Self::rotate(&config, &api_key, &shared, &history).await {
                    warn!(error = %e, "Gemini session rotation failed, keeping current socket");
                    let _ = shared
                        .events
                        .send(S2sEvent::Error {
                            message: format!("Session rotation failed: {}", e),
                        })
                        .await;
                }
            }
        });
    }

    /// Make-before-break replacement of the provider socket
    async fn rotate(
        config: &GeminiLiveConfig,
        api_key: &str,
        shared: &Arc<Shared>,
        history: &HistoryFn,
    ) -> Result<()> {
        shared.rotating.store(true, Ordering::SeqCst);

        let turns = (history)();
        let skip = turns.len().saturating_sub(ROTATION_HISTORY_TURNS);
        let instruction = instruction_with_history(&config.system_prompt, &turns[skip..]);

        // The old socket stays untouched until the replacement is up; a
        // failed connect leaves the session on the current socket.
        let opened = Self::open_socket(config, api_key, &instruction).await;
        let (new_sink, new_source) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                shared.rotating.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(Self::receive_loop(new_source, shared.clone(), generation));

        let mut old_sink = {
            let mut guard = shared.sink.lock().await;
            std::mem::replace(&mut *guard, new_sink)
        };
        let _ = old_sink.send(Message::Close(None)).await;

        shared.rotating.store(false, Ordering::SeqCst);
        info!(generation = %generation, "Gemini session rotated");
        Ok(())
    }

    async fn receive_loop(mut source: WsSource, shared: Arc<Shared>, generation: u64) {
        while let Some(msg) = source.next().await {
            let payload = match msg {
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Binary(bytes)) => bytes,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };

            let value: serde_json::Value = match serde_json::from_slice(&payload) {
                Ok(value) => value,
                Err(e) => {
                    debug!(error = %e, "Unparsed Gemini message");
                    continue;
                }
            };

            if value.get("setupComplete").is_some() {
                debug!(generation = %generation, "Gemini setup complete");
                continue;
            }

            for event in Self::demux(&shared.pending_tools, &value) {
                if shared.events.send(event).await.is_err() {
                    return;
                }
            }
        }

        // A retired socket's close is part of rotation, not a failure.
        let retired = generation < shared.generation.load(Ordering::SeqCst)
            || shared.rotating.load(Ordering::SeqCst);
        let _ = shared.events.send(S2sEvent::Closed { rotating: retired }).await;
    }

    fn demux(
        pending_tools: &parking_lot::Mutex<HashMap<String, String>>,
        value: &serde_json::Value,
    ) -> Vec<S2sEvent> {
        let mut events = Vec::new();

        if let Some(content) = value.get("serverContent") {
            if let Some(parts) = content
                .get("modelTurn")
                .and_then(|t| t.get("parts"))
                .and_then(|p| p.as_array())
            {
                for part in parts {
                    if let Some(data) = part
                        .get("inlineData")
                        .and_then(|d| d.get("data"))
                        .and_then(|d| d.as_str())
                    {
                        match BASE64.decode(data) {
                            Ok(pcm) => events.push(S2sEvent::AudioDelta {
                                pcm: Bytes::from(pcm),
                                sample_rate: GEMINI_OUTPUT_SAMPLE_RATE,
                            }),
                            Err(e) => debug!(error = %e, "Bad inline audio payload"),
                        }
                    }
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        events.push(S2sEvent::AssistantTranscriptDelta {
                            text: text.to_string(),
                        });
                    }
                }
            }
            if content
                .get("interrupted")
                .and_then(|i| i.as_bool())
                .unwrap_or(false)
            {
                events.push(S2sEvent::Interrupted);
            }
            if content
                .get("turnComplete")
                .and_then(|t| t.as_bool())
                .unwrap_or(false)
            {
                events.push(S2sEvent::TurnComplete);
            }
        }

        if let Some(text) = value
            .get("inputTranscription")
            .and_then(|t| t.get("text"))
            .and_then(|t| t.as_str())
        {
            events.push(S2sEvent::InputTranscript {
                text: text.to_string(),
            });
        }

        if let Some(calls) = value
            .get("toolCall")
            .and_then(|t| t.get("functionCalls"))
            .and_then(|c| c.as_array())
        {
            for call in calls {
                let call_id = call
                    .get("id")
                    .and_then(|i| i.as_str())
                    .unwrap_or_default()
                    .to_string();
                let name = call
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string();
                let arguments = call.get("args").cloned().unwrap_or(serde_json::Value::Null);
                pending_tools.lock().insert(call_id.clone(), name.clone());
                events.push(S2sEvent::ToolCall(ToolCall {
                    call_id,
                    name,
                    arguments,
                }));
            }
        }

        events
    }

    async fn send_json(&self, value: serde_json::Value) -> Result<()> {
        let mut sink = self.shared.sink.lock().await;
        sink.send(Message::Text(value.to_string()))
            .await
            .map_err(|e| VoiceError::WebSocket(format!("Gemini send failed: {}", e)).into())
    }
}

#[async_trait]
impl S2sSession for GeminiLiveSession {
    fn provider(&self) -> &str {
        "gemini-live"
    }

    fn input_sample_rate(&self) -> u32 {
        GEMINI_INPUT_SAMPLE_RATE
    }

    fn output_sample_rate(&self) -> u32 {
        GEMINI_OUTPUT_SAMPLE_RATE
    }

    async fn send_audio(&self, pcm: &[i16]) -> Result<()> {
        let data = BASE64.encode(pcm_to_bytes(pcm));
        self.send_json(serde_json::json!({
            "realtimeInput": {
                "mediaChunks": [{
                    "mimeType": "audio/pcm;rate=16000",
                    "data": data,
                }]
            }
        }))
        .await
    }

    async fn end_of_speech(&self) -> Result<()> {
        // Turn boundaries come from the service's own VAD.
        debug!("end_of_speech is implicit for Gemini Live");
        Ok(())
    }

    async fn inject_text(&self, text: &str) -> Result<()> {
        self.send_json(serde_json::json!({
            "clientContent": {
                "turns": [{ "role": "user", "parts": [{ "text": text }] }],
                "turnComplete": true,
            }
        }))
        .await
    }

    async fn send_tool_result(&self, call_id: &str, payload: serde_json::Value) -> Result<()> {
        let name = self
            .shared
            .pending_tools
            .lock()
            .remove(call_id)
            .unwrap_or_default();
        self.send_json(serde_json::json!({
            "toolResponse": {
                "functionResponses": [{
                    "id": call_id,
                    "name": name,
                    "response": payload,
                }]
            }
        }))
        .await
    }

    async fn cancel_response(&self) -> Result<()> {
        // No explicit cancel on this protocol; the service interrupts
        // itself when new user audio arrives.
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let mut sink = self.shared.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demux_audio_and_text() {
        let pending = parking_lot::Mutex::new(HashMap::new());
        let value = serde_json::json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": BASE64.encode([0u8, 1, 2, 3]) } },
                        { "text": "hello" },
                    ]
                },
                "turnComplete": true,
            }
        });

        let events = GeminiLiveSession::demux(&pending, &value);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], S2sEvent::AudioDelta { sample_rate: 24_000, .. }));
        assert!(matches!(events[1], S2sEvent::AssistantTranscriptDelta { .. }));
        assert!(matches!(events[2], S2sEvent::TurnComplete));
    }

    #[test]
    fn test_demux_tool_call_records_name() {
        let pending = parking_lot::Mutex::new(HashMap::new());
        let value = serde_json::json!({
            "toolCall": {
                "functionCalls": [
                    { "id": "fc-1", "name": "discord_voice", "args": { "action": "status" } }
                ]
            }
        });

        let events = GeminiLiveSession::demux(&pending, &value);
        assert_eq!(events.len(), 1);
        match &events[0] {
            S2sEvent::ToolCall(call) => {
                assert_eq!(call.call_id, "fc-1");
                assert_eq!(call.arguments["action"], "status");
            }
            _ => panic!("wrong variant"),
        }
        assert_eq!(
            pending.lock().get("fc-1").map(String::as_str),
            Some("discord_voice")
        );
    }

    #[test]
    fn test_demux_interrupted() {
        let pending = parking_lot::Mutex::new(HashMap::new());
        let value = serde_json::json!({
            "serverContent": { "interrupted": true }
        });
        let events = GeminiLiveSession::demux(&pending, &value);
        assert!(matches!(events[0], S2sEvent::Interrupted));
    }

    #[test]
    fn test_input_transcription_demux() {
        let pending = parking_lot::Mutex::new(HashMap::new());
        let value = serde_json::json!({
            "inputTranscription": { "text": "what time is it" }
        });
        let events = GeminiLiveSession::demux(&pending, &value);
        match &events[0] {
            S2sEvent::InputTranscript { text } => assert_eq!(text, "what time is it"),
            _ => panic!("wrong variant"),
        }
    }
}
