//! OpenAI TTS
//!
//! Streams raw PCM from `/v1/audio/speech` so playback can begin on the
//! first chunk rather than after the full response body.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lyra_core::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::http_client;
use crate::types::*;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// PCM sample rate returned by the speech endpoint
const OPENAI_TTS_SAMPLE_RATE: u32 = 24_000;

/// OpenAI TTS request
#[derive(Debug, Serialize)]
struct OpenAiTtsRequest {
    model: String,
    input: String,
    voice: String,
    response_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
}

/// OpenAI TTS engine
pub struct OpenAiTts {
    /// API key (falls back to OPENAI_API_KEY)
    api_key: Option<String>,
    /// Model (tts-1 for latency, tts-1-hd for quality)
    model: String,
    /// Voice id (alloy, echo, fable, onyx, nova, shimmer)
    voice: String,
    /// Speaking speed (1.0 = normal)
    speed: f32,
}

impl OpenAiTts {
    /// Create a new OpenAI TTS engine
    pub fn new(api_key: Option<String>, model: Option<String>, voice: Option<String>) -> Self {
        Self {
            api_key,
            model: model.unwrap_or_else(|| "tts-1".to_string()),
            voice: voice.unwrap_or_else(|| "shimmer".to_string()),
            speed: 1.0,
        }
    }

    /// Set the speaking speed (0.25 to 4.0)
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    /// Available OpenAI voices
    pub fn available_voices() -> Vec<&'static str> {
        vec!["alloy", "echo", "fable", "onyx", "nova", "shimmer"]
    }

    fn get_api_key(&self) -> Result<String> {
        lyra_core::config::resolve_api_key(self.api_key.as_deref(), lyra_core::config::OPENAI_API_KEY)
            .ok_or_else(|| {
                VoiceError::Authentication(format!(
                    "OpenAI API key not found. Set {} or provide a key.",
                    lyra_core::config::OPENAI_API_KEY
                ))
                .into()
            })
    }
}

#[async_trait]
impl TtsEngine for OpenAiTts {
    fn name(&self) -> &str {
        "openai"
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

        let request = OpenAiTtsRequest {
            model: self.model.clone(),
            input: text.to_string(),
            voice: self.voice.clone(),
            response_format: "pcm".to_string(),
            speed: if (self.speed - 1.0).abs() > 0.01 {
                Some(self.speed)
            } else {
                None
            },
        };

        debug!(model = %self.model, voice = %self.voice, text_len = %text.len(), "OpenAI TTS request");

        let response = http_client()
            .post(format!("{}/audio/speech", OPENAI_API_BASE))
            .header("Authorization", format!("Bearer {}", api_key))
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
            return Err(VoiceError::Other(format!("OpenAI TTS error ({}): {}", status, body)).into());
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
                        debug!("OpenAI TTS stream cancelled");
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
                                warn!(error = %e, "OpenAI TTS body error");
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
            sample_rate: OPENAI_TTS_SAMPLE_RATE,
            chunks: rx,
            cancel,
        })
    }
}
