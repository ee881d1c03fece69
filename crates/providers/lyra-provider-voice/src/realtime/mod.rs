//! Speech-to-speech provider sessions
//!
//! A speech-to-speech provider accepts user audio and produces assistant
//! audio directly, internalizing STT, reasoning and TTS. Sessions expose
//! the same narrow surface regardless of provider; the engine layer never
//! sees wire frames.

use async_trait::async_trait;
use bytes::Bytes;
use lyra_core::{Result, ToolCall};

pub mod gemini;
pub mod openai;

pub use gemini::{GeminiLiveConfig, GeminiLiveSession};
pub use openai::{OpenAiRealtimeConfig, OpenAiRealtimeSession};

/// Events demultiplexed from a provider socket
#[derive(Debug, Clone)]
pub enum S2sEvent {
    /// Assistant audio at the provider's output rate
    AudioDelta {
        /// PCM16 little-endian payload
        pcm: Bytes,
        /// Sample rate of the payload
        sample_rate: u32,
    },
    /// Partial assistant transcript
    AssistantTranscriptDelta {
        /// Transcript fragment
        text: String,
    },
    /// Completed transcription of the user's input audio
    InputTranscript {
        /// Full utterance text
        text: String,
    },
    /// The provider requested a tool invocation
    ToolCall(ToolCall),
    /// The provider detected user barge-in
    Interrupted,
    /// The assistant finished its turn
    TurnComplete,
    /// The socket closed
    Closed {
        /// True when the close is part of a planned session rotation
        rotating: bool,
    },
    /// Provider-reported error
    Error {
        /// Error description
        message: String,
    },
}

/// A live speech-to-speech provider session
#[async_trait]
pub trait S2sSession: Send + Sync {
    /// Provider name
    fn provider(&self) -> &str;

    /// Sample rate the provider expects for input audio
    fn input_sample_rate(&self) -> u32;

    /// Sample rate of provider output audio
    fn output_sample_rate(&self) -> u32;

    /// Forward a frame of user PCM16 audio at [`S2sSession::input_sample_rate`]
    async fn send_audio(&self, pcm: &[i16]) -> Result<()>;

    /// Signal end of the user's utterance
    async fn end_of_speech(&self) -> Result<()>;

    /// Inject a user text turn (spoken-reply path for `voice.speak`)
    async fn inject_text(&self, text: &str) -> Result<()>;

    /// Return a tool result for a provider-issued call id
    async fn send_tool_result(&self, call_id: &str, payload: serde_json::Value) -> Result<()>;

    /// Cancel the in-flight assistant response, if any
    async fn cancel_response(&self) -> Result<()>;

    /// Close the session
    async fn close(&self) -> Result<()>;
}

/// Convert PCM16 samples to little-endian bytes
pub(crate) fn pcm_to_bytes(pcm: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(pcm.len() * 2);
    for sample in pcm {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Render tool definitions plus recent conversation turns into a system
/// instruction, used when a replacement session must inherit context.
pub(crate) fn instruction_with_history(
    system_prompt: &str,
    turns: &[lyra_core::ConversationTurn],
) -> String {
    if turns.is_empty() {
        return system_prompt.to_string();
    }

    let mut rendered = String::from(system_prompt);
    rendered.push_str("\n\nRecent conversation:\n");
    for turn in turns {
        match turn.role {
            lyra_core::TurnRole::User => {
                rendered.push_str(turn.display_name.as_deref().unwrap_or("User"));
            }
            lyra_core::TurnRole::Assistant => rendered.push_str("Assistant"),
        }
        rendered.push_str(": ");
        rendered.push_str(&turn.content);
        rendered.push('\n');
    }
    rendered
}

/// Callback used by rotating sessions to fetch recent conversation turns
pub type HistoryFn = std::sync::Arc<dyn Fn() -> Vec<lyra_core::ConversationTurn> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_to_bytes() {
        let bytes = pcm_to_bytes(&[1i16, -2]);
        assert_eq!(bytes, vec![1, 0, 0xFE, 0xFF]);
    }

    #[test]
    fn test_instruction_with_history() {
        let mut log = lyra_core::ConversationLog::new(10);
        log.push_user(1, Some("Ada".to_string()), "hello");
        log.push_assistant("hi");

        let rendered = instruction_with_history("Be brief.", &log.snapshot());
        assert!(rendered.starts_with("Be brief."));
        assert!(rendered.contains("Ada: hello"));
        assert!(rendered.contains("Assistant: hi"));
    }

    #[test]
    fn test_instruction_without_history() {
        assert_eq!(instruction_with_history("Be brief.", &[]), "Be brief.");
    }
}
