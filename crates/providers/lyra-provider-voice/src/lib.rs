//! Lyra Voice Providers
//!
//! Clients for the remote speech services the voice plane consumes:
//!
//! - **STT**: Deepgram (live WebSocket + prerecorded batch), OpenAI Whisper
//!   (batch)
//! - **TTS**: OpenAI, ElevenLabs (both streamed PCM)
//! - **Speech-to-speech**: OpenAI Realtime, Gemini Live (with transparent
//!   session rotation)
//!
//! Each family is specified by a small trait so the engine layer can swap
//! providers without knowing wire formats.

#![warn(missing_docs)]
#![warn(clippy::all)]

use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

pub mod engines;
pub mod realtime;
pub mod types;

pub use engines::{
    wrap_pcm_in_wav, DeepgramConfig, DeepgramStt, ElevenLabsTts, OpenAiTts, WhisperApiStt,
};
pub use realtime::{
    GeminiLiveConfig, GeminiLiveSession, HistoryFn, OpenAiRealtimeConfig, OpenAiRealtimeSession,
    S2sEvent, S2sSession,
};
pub use types::*;

/// Split WebSocket sink shared by the socket clients
pub(crate) type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tokio_tungstenite::tungstenite::Message,
>;

/// Split WebSocket source shared by the socket clients
pub(crate) type WsSource = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Process-wide HTTP client for connection pooling
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .expect("Failed to create HTTP client")
});

/// Shared pooled HTTP client
pub fn http_client() -> &'static Client {
    &HTTP_CLIENT
}
