//! Lyra Discord Voice Adaptor
//!
//! The per-guild real-time voice session: decoded microphone audio from
//! multiple users flows through echo suppression and per-user VAD into
//! one of two interchangeable conversational engines (a streaming
//! STT -> agent -> TTS pipeline with sentence-level overlap, or a native
//! speech-to-speech provider session), and synthesized audio plays back
//! through a FIFO queue with barge-in.
//!
//! The Discord transport itself (serenity/songbird) sits behind the
//! `discord` feature; everything else runs and tests without a gateway.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod audio;
pub mod echo;
pub mod engine;
pub mod manager;
pub mod playback;
pub mod rpc;
pub mod sender;
pub mod session;
pub mod settings;
pub mod transport;
pub mod vad;

pub use agent::{AgentBridge, AgentDispatcher, DispatchContext};
pub use echo::{EchoSuppressor, ECHO_COOLDOWN_MS};
pub use engine::{
    create_engine, resolve_mode, ConversationEngine, EngineEvent, EngineMode, PipelineEngine,
    S2sEngine, SentenceSplitter,
};
pub use manager::{JoinOutcome, SessionManager, VoiceStatus};
pub use playback::{PlaybackEvent, PlaybackQueue};
pub use rpc::{register_voice_tool, voice_tool_definition, VoiceRpc};
pub use sender::{AudioSender, AudioSink, NullSink};
pub use session::{SessionContext, SessionEvent, SessionState, VoiceSession};
pub use settings::{VoiceMode, VoiceSettings};
pub use transport::VoiceTransport;
pub use vad::{VadEvent, VoiceDetector};
