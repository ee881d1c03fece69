//! Deepgram STT
//!
//! Live transcription over WebSocket (linear16 PCM, interim results,
//! server-side endpointing) plus a prerecorded batch path used when the
//! socket cannot be established.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use lyra_core::Result;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engines::whisper_api::wrap_pcm_in_wav;
use crate::http_client;
use crate::types::*;

const DEEPGRAM_WS_BASE: &str = "wss://api.deepgram.com/v1/listen";
const DEEPGRAM_HTTP_BASE: &str = "https://api.deepgram.com/v1/listen";

/// Keep-alive interval for live sockets
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Deepgram STT engine configuration
#[derive(Debug, Clone)]
pub struct DeepgramConfig {
    /// API key (falls back to DEEPGRAM_API_KEY)
    pub api_key: Option<String>,
    /// Model name
    pub model: String,
    /// Server-side endpointing window in milliseconds
    pub endpointing_ms: u64,
    /// Optional keyword boosts
    pub keywords: Vec<String>,
}

impl Default for DeepgramConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "nova-2".to_string(),
            endpointing_ms: 300,
            keywords: Vec::new(),
        }
    }
}

/// Deepgram live/prerecorded STT engine
pub struct DeepgramStt {
    config: DeepgramConfig,
}

/// Live transcript message (subset we consume)
#[derive(Debug, Deserialize)]
struct LiveResponse {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    is_final: bool,
    channel: Option<LiveChannel>,
}

#[derive(Debug, Deserialize)]
struct LiveChannel {
    alternatives: Vec<LiveAlternative>,
}

#[derive(Debug, Deserialize)]
struct LiveAlternative {
    transcript: String,
}

/// Prerecorded response (subset we consume)
#[derive(Debug, Deserialize)]
struct PrerecordedResponse {
    results: PrerecordedResults,
}

#[derive(Debug, Deserialize)]
struct PrerecordedResults {
    channels: Vec<LiveChannel>,
}

impl DeepgramStt {
    /// Create a new Deepgram engine
    pub fn new(config: DeepgramConfig) -> Self {
        Self { config }
    }

    fn get_api_key(&self) -> Result<String> {
        lyra_core::config::resolve_api_key(
            self.config.api_key.as_deref(),
            lyra_core::config::DEEPGRAM_API_KEY,
        )
        .ok_or_else(|| {
            VoiceError::Authentication(format!(
                "Deepgram API key not found. Set {} or provide a key.",
                lyra_core::config::DEEPGRAM_API_KEY
            ))
            .into()
        })
    }

    fn live_url(&self, sample_rate: u32) -> String {
        let mut url = format!(
            "{}?encoding=linear16&sample_rate={}&channels=1&model={}&interim_results=true&endpointing={}&vad_events=true",
            DEEPGRAM_WS_BASE, sample_rate, self.config.model, self.config.endpointing_ms
        );
        for keyword in &self.config.keywords {
            url.push_str("&keywords=");
            url.push_str(keyword);
        }
        url
    }
}

#[async_trait]
impl SttEngine for DeepgramStt {
    fn name(&self) -> &str {
        "deepgram"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn open_stream(&self, sample_rate: u32) -> Result<SttStream> {
        let api_key = self.get_api_key()?;
        let url = self.live_url(sample_rate);

        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|e| VoiceError::WebSocket(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {}", api_key)
                .parse()
                .map_err(|_| VoiceError::Authentication("Invalid API key bytes".to_string()))?,
        );

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| VoiceError::WebSocket(format!("Deepgram connect failed: {}", e)))?;
        debug!(sample_rate = %sample_rate, "Deepgram live socket open");

        let (mut sink, mut source) = ws.split();
        let (event_tx, event_rx) = mpsc::channel::<Result<TranscriptEvent>>(64);
        let (input_tx, mut input_rx) = mpsc::channel::<SttInput>(64);
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    _ = keepalive.tick() => {
                        if sink.send(Message::Text(r#"{"type":"KeepAlive"}"#.to_string())).await.is_err() {
                            break;
                        }
                    }
                    input = input_rx.recv() => {
                        match input {
                            Some(SttInput::Audio(pcm)) => {
                                if sink.send(Message::Binary(pcm.to_vec())).await.is_err() {
                                    let _ = event_tx.send(Err(VoiceError::WebSocket("Deepgram send failed".to_string()).into())).await;
                                    break;
                                }
                            }
                            Some(SttInput::Finish) => {
                                // Flushes everything buffered server-side into a final.
                                let _ = sink.send(Message::Text(r#"{"type":"CloseStream"}"#.to_string())).await;
                            }
                            None => {
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    msg = source.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<LiveResponse>(&text) {
                                    Ok(resp) => {
                                        if resp.kind.as_deref() != Some("Results") {
                                            continue;
                                        }
                                        let transcript = resp
                                            .channel
                                            .and_then(|c| c.alternatives.into_iter().next())
                                            .map(|a| a.transcript)
                                            .unwrap_or_default();
                                        if transcript.is_empty() && !resp.is_final {
                                            continue;
                                        }
                                        let event = TranscriptEvent {
                                            text: transcript,
                                            is_final: resp.is_final,
                                        };
                                        if event_tx.send(Ok(event)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => debug!(error = %e, "Unparsed Deepgram message"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                warn!(error = %e, "Deepgram socket error");
                                let _ = event_tx.send(Err(VoiceError::WebSocket(e.to_string()).into())).await;
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                }
            }
        });

        Ok(SttStream {
            events: event_rx,
            input: input_tx,
            cancel,
        })
    }

    async fn transcribe(&self, audio: &AudioData) -> Result<TranscriptionResult> {
        let api_key = self.get_api_key()?;
        let wav = wrap_pcm_in_wav(&audio.data, audio.sample_rate, audio.channels, 16);

        let response = http_client()
            .post(format!(
                "{}?model={}&smart_format=true",
                DEEPGRAM_HTTP_BASE, self.config.model
            ))
            .header("Authorization", format!("Token {}", api_key))
            .header("Content-Type", "audio/wav")
            .body(wav)
            .send()
            .await
            .map_err(|e| VoiceError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Transcription(format!(
                "Deepgram error ({}): {}",
                status, body
            ))
            .into());
        }

        let parsed: PrerecordedResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;

        let text = parsed
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript)
            .unwrap_or_default();

        Ok(TranscriptionResult {
            text,
            language: None,
            duration_ms: Some(audio.duration_ms()),
            processing_time_ms: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_url_parameters() {
        let stt = DeepgramStt::new(DeepgramConfig {
            endpointing_ms: 450,
            keywords: vec!["lyra".to_string()],
            ..Default::default()
        });
        let url = stt.live_url(16000);

        assert!(url.contains("encoding=linear16"));
        assert!(url.contains("sample_rate=16000"));
        assert!(url.contains("interim_results=true"));
        assert!(url.contains("endpointing=450"));
        assert!(url.contains("vad_events=true"));
        assert!(url.contains("keywords=lyra"));
    }

    #[test]
    fn test_live_response_parsing() {
        let json = r#"{"type":"Results","is_final":true,"channel":{"alternatives":[{"transcript":"what time is it"}]}}"#;
        let resp: LiveResponse = serde_json::from_str(json).unwrap();
        assert!(resp.is_final);
        assert_eq!(
            resp.channel.unwrap().alternatives[0].transcript,
            "what time is it"
        );
    }

    #[test]
    fn test_supports_streaming() {
        let stt = DeepgramStt::new(DeepgramConfig::default());
        assert!(stt.supports_streaming());
    }
}
