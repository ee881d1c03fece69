//! OpenAI Realtime speech-to-speech session
//!
//! PCM16 at 24 kHz in both directions. Server-side VAD handles turn
//! detection; `end_of_speech` additionally commits the input buffer and
//! requests a response so the pipeline-style explicit EOS path also works.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use lyra_core::{Result, ToolCall, ToolDefinition};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message,
};
use tracing::{debug, info, warn};

use super::{pcm_to_bytes, S2sEvent, S2sSession};
use crate::types::VoiceError;
use crate::WsSink;

const REALTIME_WS_BASE: &str = "wss://api.openai.com/v1/realtime";

/// Audio rate in both directions
const REALTIME_SAMPLE_RATE: u32 = 24_000;

/// Server-side VAD silence window
const SERVER_VAD_SILENCE_MS: u64 = 800;

/// OpenAI Realtime session configuration
#[derive(Clone)]
pub struct OpenAiRealtimeConfig {
    /// API key (falls back to OPENAI_API_KEY)
    pub api_key: Option<String>,
    /// Realtime model name
    pub model: String,
    /// Assistant voice
    pub voice: String,
    /// System instructions
    pub instructions: String,
    /// Tools exposed to the provider
    pub tools: Vec<ToolDefinition>,
}

impl Default for OpenAiRealtimeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "alloy".to_string(),
            instructions: String::new(),
            tools: Vec::new(),
        }
    }
}

/// Server events we consume
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseRef },

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { transcript: String },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallDone {
        call_id: String,
        name: String,
        arguments: String,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "error")]
    Error { error: ErrorDetail },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResponseRef {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

/// Live OpenAI Realtime session
pub struct OpenAiRealtimeSession {
    sink: Arc<Mutex<WsSink>>,
    /// Id of the in-flight response, used to gate `response.cancel`
    response_id: Arc<parking_lot::Mutex<Option<String>>>,
}

impl OpenAiRealtimeSession {
    /// Check whether credentials for this provider are resolvable
    pub fn has_credentials(config: &OpenAiRealtimeConfig) -> bool {
        lyra_core::config::has_api_key(
            config.api_key.as_deref(),
            lyra_core::config::OPENAI_API_KEY,
        )
    }

    /// Connect and configure a Realtime session
    pub async fn connect(config: OpenAiRealtimeConfig) -> Result<(Self, mpsc::Receiver<S2sEvent>)> {
        let api_key = lyra_core::config::resolve_api_key(
            config.api_key.as_deref(),
            lyra_core::config::OPENAI_API_KEY,
        )
        .ok_or_else(|| {
            VoiceError::Authentication(format!(
                "OpenAI API key not found. Set {} or provide a key.",
                lyra_core::config::OPENAI_API_KEY
            ))
        })?;

        let url = format!("{}?model={}", REALTIME_WS_BASE, config.model);
        let mut request = url
            .into_client_request()
            .map_err(|e| VoiceError::WebSocket(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", api_key)
                .parse()
                .map_err(|_| VoiceError::Authentication("Invalid API key bytes".to_string()))?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse().expect("static header"));

        info!(model = %config.model, "Connecting to OpenAI Realtime");
        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| VoiceError::WebSocket(format!("Realtime connect failed: {}", e)))?;

        let (sink, source) = ws.split();
        let sink = Arc::new(Mutex::new(sink));
        let response_id = Arc::new(parking_lot::Mutex::new(None::<String>));
        let (event_tx, event_rx) = mpsc::channel::<S2sEvent>(128);

        let session = Self {
            sink: sink.clone(),
            response_id: response_id.clone(),
        };

        session.send_session_update(&config).await?;

        tokio::spawn(Self::receive_loop(source, event_tx, response_id));

        Ok((session, event_rx))
    }

    async fn send_session_update(&self, config: &OpenAiRealtimeConfig) -> Result<()> {
        let tools: Vec<serde_json::Value> = config
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();

        self.send_json(serde_json::json!({
            "type": "session.update",
            "session": {
                "modalities": ["audio", "text"],
                "voice": config.voice,
                "instructions": config.instructions,
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "input_audio_transcription": { "model": "whisper-1" },
                "turn_detection": {
                    "type": "server_vad",
                    "silence_duration_ms": SERVER_VAD_SILENCE_MS,
                },
                "tools": tools,
                "tool_choice": "auto",
            },
        }))
        .await
    }

    async fn send_json(&self, value: serde_json::Value) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(value.to_string()))
            .await
            .map_err(|e| VoiceError::WebSocket(format!("Realtime send failed: {}", e)).into())
    }

    async fn receive_loop(
        mut source: crate::WsSource,
        event_tx: mpsc::Sender<S2sEvent>,
        response_id: Arc<parking_lot::Mutex<Option<String>>>,
    ) {
        while let Some(msg) = source.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let event = match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            debug!(error = %e, "Unparsed Realtime message");
                            continue;
                        }
                    };
                    let out = match event {
                        ServerEvent::ResponseCreated { response } => {
                            *response_id.lock() = response.id;
                            continue;
                        }
                        ServerEvent::ResponseDone => {
                            *response_id.lock() = None;
                            Some(S2sEvent::TurnComplete)
                        }
                        ServerEvent::AudioDelta { delta } => match BASE64.decode(&delta) {
                            Ok(pcm) => Some(S2sEvent::AudioDelta {
                                pcm: Bytes::from(pcm),
                                sample_rate: REALTIME_SAMPLE_RATE,
                            }),
                            Err(e) => {
                                debug!(error = %e, "Bad audio delta payload");
                                None
                            }
                        },
                        ServerEvent::AudioTranscriptDelta { delta } => {
                            Some(S2sEvent::AssistantTranscriptDelta { text: delta })
                        }
                        ServerEvent::InputTranscriptionCompleted { transcript } => {
                            Some(S2sEvent::InputTranscript { text: transcript })
                        }
                        ServerEvent::FunctionCallDone {
                            call_id,
                            name,
                            arguments,
                        } => {
                            let arguments = serde_json::from_str(&arguments)
                                .unwrap_or(serde_json::Value::Null);
                            Some(S2sEvent::ToolCall(ToolCall {
                                call_id,
                                name,
                                arguments,
                            }))
                        }
                        ServerEvent::SpeechStarted => Some(S2sEvent::Interrupted),
                        ServerEvent::Error { error } => {
                            warn!(error = %error.message, "Realtime error event");
                            Some(S2sEvent::Error {
                                message: error.message,
                            })
                        }
                        ServerEvent::Other => None,
                    };
                    if let Some(event) = out {
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }

        let _ = event_tx.send(S2sEvent::Closed { rotating: false }).await;
    }
}

#[async_trait]
impl S2sSession for OpenAiRealtimeSession {
    fn provider(&self) -> &str {
        "openai-realtime"
    }

    fn input_sample_rate(&self) -> u32 {
        REALTIME_SAMPLE_RATE
    }

    fn output_sample_rate(&self) -> u32 {
        REALTIME_SAMPLE_RATE
    }

    async fn send_audio(&self, pcm: &[i16]) -> Result<()> {
        let audio = BASE64.encode(pcm_to_bytes(pcm));
        self.send_json(serde_json::json!({
            "type": "input_audio_buffer.append",
            "audio": audio,
        }))
        .await
    }

    async fn end_of_speech(&self) -> Result<()> {
        self.send_json(serde_json::json!({ "type": "input_audio_buffer.commit" }))
            .await?;
        self.send_json(serde_json::json!({ "type": "response.create" }))
            .await
    }

    async fn inject_text(&self, text: &str) -> Result<()> {
        self.send_json(serde_json::json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": text }],
            },
        }))
        .await?;
        self.send_json(serde_json::json!({ "type": "response.create" }))
            .await
    }

    async fn send_tool_result(&self, call_id: &str, payload: serde_json::Value) -> Result<()> {
        self.send_json(serde_json::json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call_id,
                "output": payload.to_string(),
            },
        }))
        .await?;
        self.send_json(serde_json::json!({ "type": "response.create" }))
            .await
    }

    async fn cancel_response(&self) -> Result<()> {
        // Only meaningful while a response id is tracked.
        let active = self.response_id.lock().take();
        if active.is_some() {
            self.send_json(serde_json::json!({ "type": "response.cancel" }))
                .await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_event_parsing() {
        let json = r#"{"type":"response.audio.delta","delta":"dGVzdA=="}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, ServerEvent::AudioDelta { .. }));

        let json = r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"hi"}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(
            event,
            ServerEvent::InputTranscriptionCompleted { .. }
        ));

        // Unknown event types must not fail parsing.
        let json = r#"{"type":"rate_limits.updated"}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, ServerEvent::Other));
    }

    #[test]
    fn test_function_call_parsing() {
        let json = r#"{"type":"response.function_call_arguments.done","call_id":"c1","name":"discord_voice","arguments":"{\"action\":\"status\"}"}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::FunctionCallDone {
                call_id,
                name,
                arguments,
            } => {
                assert_eq!(call_id, "c1");
                assert_eq!(name, "discord_voice");
                let args: serde_json::Value = serde_json::from_str(&arguments).unwrap();
                assert_eq!(args["action"], "status");
            }
            _ => panic!("wrong variant"),
        }
    }
}
