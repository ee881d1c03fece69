//! Conversational engines
//!
//! Two interchangeable families behind one contract: the pipeline engine
//! (STT -> agent -> sentence-split -> TTS) and the speech-to-speech
//! engine (a native provider session). The session orchestrates either
//! through [`ConversationEngine`] without knowing which is running.

use async_trait::async_trait;
use lyra_core::{ConversationTurn, Result};
use tokio::sync::mpsc;

pub mod factory;
pub mod pipeline;
pub mod s2s;
pub mod sentence;

pub use factory::{create_engine, resolve_mode};
pub use pipeline::PipelineEngine;
pub use s2s::S2sEngine;
pub use sentence::SentenceSplitter;

/// Which engine family a session is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// STT -> agent -> TTS
    Pipeline,
    /// Native speech-to-speech provider
    SpeechToSpeech,
}

impl EngineMode {
    /// Mode as a wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pipeline => "pipeline",
            Self::SpeechToSpeech => "speech-to-speech",
        }
    }
}

/// Events an engine surfaces to the session
#[derive(Debug)]
pub enum EngineEvent {
    /// A user utterance was transcribed
    TranscriptIn {
        /// Speaking user
        user_id: u64,
        /// Final transcript
        text: String,
    },
    /// Assistant reply text (full reply for pipeline, deltas for S2S)
    AssistantText {
        /// Reply text
        text: String,
    },
    /// The provider detected user barge-in (S2S only)
    Interrupted,
    /// The assistant turn finished and playback drained
    TurnEnd,
    /// Engine-level failure
    Error {
        /// Failure description
        message: String,
        /// Fatal errors tear the session down
        fatal: bool,
    },
}

/// Common engine contract
#[async_trait]
pub trait ConversationEngine: Send + Sync {
    /// Engine family
    fn mode(&self) -> EngineMode;

    /// Start the engine (connect provider sessions)
    async fn start(&mut self) -> Result<()>;

    /// Feed a frame of 16 kHz mono user PCM
    async fn feed_audio(&self, user_id: u64, pcm: &[i16]) -> Result<()>;

    /// The user's utterance ended (VAD speech-end)
    async fn end_of_speech(&self, user_id: u64) -> Result<()>;

    /// Inject a text turn to be spoken (management `voice.speak`)
    async fn inject_text(&self, text: &str) -> Result<()>;

    /// Barge-in: suppress pending emissions; idempotent and synchronous
    fn interrupt(&self);

    /// Stop the engine; no events are delivered afterwards
    async fn stop(&mut self) -> Result<()>;

    /// Snapshot of the conversation so far
    fn history(&self) -> Vec<ConversationTurn>;

    /// Take the event receiver; available exactly once
    fn take_events(&mut self) -> Option<mpsc::Receiver<EngineEvent>>;
}
