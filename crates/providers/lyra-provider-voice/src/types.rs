//! Core types for the voice providers

use async_trait::async_trait;
use bytes::Bytes;
use lyra_core::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A buffer of PCM16 audio with its format carried alongside
#[derive(Debug, Clone)]
pub struct AudioData {
    /// Raw little-endian 16-bit samples
    pub data: Bytes,
    /// Sample rate (Hz)
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
}

impl AudioData {
    /// Create new audio data
    pub fn new(data: Bytes, sample_rate: u32, channels: u16) -> Self {
        Self {
            data,
            sample_rate,
            channels,
        }
    }

    /// Duration of the buffer in milliseconds
    pub fn duration_ms(&self) -> u64 {
        let samples = self.data.len() as u64 / 2 / self.channels as u64;
        samples * 1000 / self.sample_rate as u64
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A chunk of synthesized audio
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Chunk data (PCM16 little-endian)
    pub data: Bytes,
    /// Chunk index within its stream
    pub index: usize,
    /// Whether this is the final chunk
    pub is_final: bool,
}

/// Audio stream receiver type
pub type AudioStream = mpsc::Receiver<Result<AudioChunk>>;

/// Audio stream sender type
pub type AudioStreamSender = mpsc::Sender<Result<AudioChunk>>;

/// Create an audio stream channel
pub fn create_audio_stream(buffer_size: usize) -> (AudioStreamSender, AudioStream) {
    mpsc::channel(buffer_size)
}

/// An in-flight TTS synthesis stream
///
/// Dropping the stream does not abort the request; call [`TtsStream::cancel`]
/// to stop synthesis (used on barge-in and queue clear).
#[derive(Debug)]
pub struct TtsStream {
    /// Sample rate of the produced PCM
    pub sample_rate: u32,
    /// Chunks as they arrive from the provider
    pub chunks: AudioStream,
    /// Cancels the underlying request
    pub cancel: CancellationToken,
}

impl TtsStream {
    /// Abort the underlying synthesis request
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Result of a batch transcription
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    /// Full transcribed text
    pub text: String,
    /// Detected language code, when reported
    pub language: Option<String>,
    /// Audio duration in milliseconds, when known
    pub duration_ms: Option<u64>,
    /// Provider-side processing time in milliseconds
    pub processing_time_ms: Option<u64>,
}

impl TranscriptionResult {
    /// Create a result with just text
    pub fn new(text: String) -> Self {
        Self {
            text,
            language: None,
            duration_ms: None,
            processing_time_ms: None,
        }
    }

    /// Check if the transcription is empty
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// A partial or final transcript from a streaming STT session
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    /// Transcript text
    pub text: String,
    /// Whether this transcript is final for the current utterance
    pub is_final: bool,
}

/// Input messages for a streaming STT session
#[derive(Debug)]
pub enum SttInput {
    /// Raw PCM16 audio bytes
    Audio(Bytes),
    /// No more audio for this utterance
    Finish,
}

/// Handle to a live streaming STT session
pub struct SttStream {
    /// Partial/final transcript events
    pub events: mpsc::Receiver<Result<TranscriptEvent>>,
    /// Input channel into the socket task
    pub input: mpsc::Sender<SttInput>,
    /// Cancels the socket task
    pub cancel: CancellationToken,
}

impl SttStream {
    /// Forward a frame of PCM16 audio
    pub async fn send_audio(&self, pcm: Bytes) -> Result<()> {
        self.input
            .send(SttInput::Audio(pcm))
            .await
            .map_err(|_| VoiceError::NotReady("STT stream closed".to_string()).into())
    }

    /// Signal end of the current utterance
    pub async fn finish(&self) -> Result<()> {
        self.input
            .send(SttInput::Finish)
            .await
            .map_err(|_| VoiceError::NotReady("STT stream closed".to_string()).into())
    }

    /// Tear down the stream
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Speech-to-text engine
///
/// Streaming and batch methods are both optional; callers check
/// [`SttEngine::supports_streaming`] before choosing a path.
#[async_trait]
pub trait SttEngine: Send + Sync {
    /// Engine name
    fn name(&self) -> &str;

    /// Whether [`SttEngine::open_stream`] is available
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Transcribe a complete utterance (batch)
    async fn transcribe(&self, _audio: &AudioData) -> Result<TranscriptionResult> {
        Err(VoiceError::Unsupported(format!("{} does not support batch transcription", self.name())).into())
    }

    /// Open a streaming transcription session
    async fn open_stream(&self, _sample_rate: u32) -> Result<SttStream> {
        Err(VoiceError::Unsupported(format!("{} does not support streaming transcription", self.name())).into())
    }
}

/// Text-to-speech engine
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Engine name
    fn name(&self) -> &str;

    /// Whether chunks stream as they are synthesized
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Maximum accepted input length in characters
    fn max_text_chars(&self) -> usize {
        4000
    }

    /// Synthesize text, streaming PCM16 chunks as they arrive
    async fn synthesize_stream(&self, text: &str) -> Result<TtsStream>;
}

/// Voice provider error types
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// API authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Audio processing error
    #[error("Audio processing error: {0}")]
    Audio(String),

    /// Transcription failed
    #[error("Transcription failed: {0}")]
    Transcription(String),

    /// Text exceeds maximum length
    #[error("Text exceeds maximum length: {length} > {max}")]
    TextTooLong {
        /// Actual text length
        length: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Engine not ready or connection gone
    #[error("Engine not ready: {0}")]
    NotReady(String),

    /// Operation not supported by this engine
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Generic error
    #[error("Voice error: {0}")]
    Other(String),
}

impl From<VoiceError> for lyra_core::LyraError {
    fn from(err: VoiceError) -> Self {
        lyra_core::LyraError::provider(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_data_duration() {
        // 1 second of 16 kHz mono PCM16
        let data = Bytes::from(vec![0u8; 32000]);
        let audio = AudioData::new(data, 16000, 1);
        assert_eq!(audio.duration_ms(), 1000);
    }

    #[test]
    fn test_voice_error_conversion() {
        let err: lyra_core::LyraError = VoiceError::WebSocket("closed".to_string()).into();
        assert!(err.to_string().contains("WebSocket error: closed"));
    }
}
