//! ElevenLabs TTS
//!
//! Streaming synthesis via the `/stream` endpoint with PCM output.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lyra_core::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::http_client;
use crate::types::*;

const ELEVENLABS_API_BASE: &str = "https://api.elevenlabs.io/v1";

const ELEVENLABS_SAMPLE_RATE: u32 = 24_000;

/// Default voice: Rachel (conversational female)
const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";

#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

#[derive(Debug, Serialize)]
struct ElevenLabsRequest {
    text: String,
    model_id: String,
    voice_settings: VoiceSettings,
}

/// ElevenLabs TTS engine
pub struct ElevenLabsTts {
    /// API key (falls back to ELEVENLABS_API_KEY)
    api_key: Option<String>,
    /// Voice id
    voice_id: String,
    /// Model id
    model_id: String,
    /// Stability (0.0 to 1.0)
    stability: f32,
    /// Similarity boost (0.0 to 1.0)
    similarity_boost: f32,
}

impl ElevenLabsTts {
    /// Create a new ElevenLabs engine
    pub fn new(api_key: Option<String>, voice_id: Option<String>) -> Self {
        Self {
            api_key,
            voice_id: voice_id.unwrap_or_else(|| DEFAULT_VOICE_ID.to_string()),
            model_id: "eleven_turbo_v2_5".to_string(),
            stability: 0.5,
            similarity_boost: 0.75,
        }
    }

    /// Override voice settings
    pub fn with_voice_settings(mut self, stability: f32, similarity_boost: f32) -> Self {
        self.stability = stability;
        self.similarity_boost = similarity_boost;
        self
    }

    fn get_api_key(&self) -> Result<String> {
        lyra_core::config::resolve_api_key(
            self.api_key.as_deref(),
            lyra_core::config::ELEVENLABS_API_KEY,
        )
        .ok_or_else(|| {
            VoiceError::Authentication(format!(
                "ElevenLabs API key not found. Set {} or provide a key.",
                lyra_core::config::ELEVENLABS_API_KEY
            ))
            .into()
        })
    }
}

#[async_trait]
impl TtsEngine for ElevenLabsTts {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize_stream(&self, text: &str) -> Result<TtsStream> {
        let api_key = self.get_api_key()?;

        if text.len() > self.max_text_chars() {
            return Err(VoiceError::TextTooLong {
                length: text.len(),
                max: self.max_text_chars(),
            }
            .into());
        }

        let request = ElevenLabsRequest {
            text: text.to_string(),
            model_id: self.model_id.clone(),
            voice_settings: VoiceSettings {
                stability: self.stability,
                similarity_boost: self.similarity_boost,
            },
        };

        debug!(voice_id = %self.voice_id, text_len = %text.len(), "ElevenLabs TTS request");

        let response = http_client()
            .post(format!(
                "{}/text-to-speech/{}/stream?output_format=pcm_24000",
                ELEVENLABS_API_BASE, self.voice_id
            ))
            .header("xi-api-key", api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 401 {
                return Err(VoiceError::Authentication(body).into());
            }
            if status.as_u16() == 429 {
                return Err(VoiceError::RateLimit(body).into());
            }
            return Err(
                VoiceError::Other(format!("ElevenLabs error ({}): {}", status, body)).into(),
            );
        }

        let (tx, rx) = create_audio_stream(64);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut index = 0usize;

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!("ElevenLabs TTS stream cancelled");
                        return;
                    }
                    chunk = body.next() => {
                        match chunk {
                            Some(Ok(data)) => {
                                let chunk = AudioChunk { data, index, is_final: false };
                                index += 1;
                                if tx.send(Ok(chunk)).await.is_err() {
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "ElevenLabs body error");
                                let _ = tx.send(Err(VoiceError::Network(e.to_string()).into())).await;
                                return;
                            }
                            None => break,
                        }
                    }
                }
            }

            let _ = tx
                .send(Ok(AudioChunk {
                    data: Bytes::new(),
                    index,
                    is_final: true,
                }))
                .await;
        });

        Ok(TtsStream {
            sample_rate: ELEVENLABS_SAMPLE_RATE,
            chunks: rx,
            cancel,
        })
    }
}
