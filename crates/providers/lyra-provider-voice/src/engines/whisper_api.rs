//! OpenAI Whisper batch STT
//!
//! Uploads a complete utterance as a 16 kHz mono WAV and returns the
//! single final transcript. Used as the pipeline fallback behind the
//! streaming providers.

use async_trait::async_trait;
use lyra_core::Result;
use reqwest::multipart;
use std::time::Instant;
use tracing::debug;

use crate::http_client;
use crate::types::*;

/// OpenAI API base URL
const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Wrap raw PCM16 samples in a minimal WAV header
pub fn wrap_pcm_in_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let data_len = pcm.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

/// Whisper transcription response
#[derive(Debug, serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Whisper API batch STT engine
pub struct WhisperApiStt {
    /// API key (falls back to OPENAI_API_KEY)
    api_key: Option<String>,
    /// Model name
    model: String,
}

impl WhisperApiStt {
    /// Create a new Whisper API engine
    pub fn new(api_key: Option<String>, model: Option<String>) -> Self {
        Self {
            api_key,
            model: model.unwrap_or_else(|| "whisper-1".to_string()),
        }
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
impl SttEngine for WhisperApiStt {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn transcribe(&self, audio: &AudioData) -> Result<TranscriptionResult> {
        let api_key = self.get_api_key()?;
        let start = Instant::now();

        let wav = wrap_pcm_in_wav(&audio.data, audio.sample_rate, audio.channels, 16);

        let part = multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Audio(e.to_string()))?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "json");

        let response = http_client()
            .post(format!("{}/audio/transcriptions", OPENAI_API_BASE))
            .header("Authorization", format!("Bearer {}", api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 401 {
                return Err(VoiceError::Authentication(body).into());
            }
            return Err(VoiceError::Transcription(format!(
                "Whisper API error ({}): {}",
                status, body
            ))
            .into());
        }

        let parsed: WhisperResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;

        let elapsed = start.elapsed().as_millis() as u64;
        debug!(latency_ms = %elapsed, text_len = %parsed.text.len(), "Whisper transcription complete");

        Ok(TranscriptionResult {
            text: parsed.text,
            language: None,
            duration_ms: Some(audio.duration_ms()),
            processing_time_ms: Some(elapsed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header() {
        let pcm = vec![0u8; 320];
        let wav = wrap_pcm_in_wav(&pcm, 16000, 1, 16);

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 320);
        // data chunk length
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 320);
        // sample rate
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16000);
    }

    #[test]
    fn test_batch_only() {
        let stt = WhisperApiStt::new(None, None);
        assert!(!stt.supports_streaming());
        assert_eq!(stt.name(), "whisper");
    }
}
