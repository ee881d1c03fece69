//! Resolved voice configuration
//!
//! Everything the voice plane consumes, deserializable from the host's
//! character/plugin settings JSON. Every API key falls back to its named
//! environment variable at use time, so a missing key here is not an
//! error until a provider actually needs it.

use serde::{Deserialize, Serialize};

/// Engine selection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoiceMode {
    /// Pick speech-to-speech when credentials allow, pipeline otherwise
    Auto,
    /// Always STT -> agent -> TTS
    Pipeline,
    /// Always a native speech-to-speech provider
    SpeechToSpeech,
}

impl Default for VoiceMode {
    fn default() -> Self {
        Self::Auto
    }
}

impl VoiceMode {
    /// Mode as a wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Pipeline => "pipeline",
            Self::SpeechToSpeech => "speech-to-speech",
        }
    }
}

/// Top-level voice settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Engine selection
    pub mode: VoiceMode,
    /// Speech-to-text providers
    pub stt: SttSettings,
    /// Text-to-speech providers
    pub tts: TtsSettings,
    /// Speech-to-speech providers
    pub s2s: S2sSettings,
    /// Voice activity detection
    pub vad: VadSettings,
    /// Session behavior
    pub behavior: BehaviorSettings,
}

/// STT provider selection and parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttSettings {
    /// Primary provider (deepgram, whisper)
    pub provider: String,
    /// Fallback provider tried when the primary fails
    pub fallback: Option<String>,
    /// Deepgram parameters
    pub deepgram: DeepgramParams,
    /// Whisper parameters
    pub whisper: WhisperParams,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            provider: "deepgram".to_string(),
            fallback: Some("whisper".to_string()),
            deepgram: DeepgramParams::default(),
            whisper: WhisperParams::default(),
        }
    }
}

/// Deepgram-specific parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepgramParams {
    /// API key (falls back to DEEPGRAM_API_KEY)
    pub api_key: Option<String>,
    /// Model name
    pub model: String,
    /// Server-side endpointing window in milliseconds
    pub endpointing_ms: u64,
    /// Keyword boosts
    pub keywords: Vec<String>,
}

impl Default for DeepgramParams {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "nova-2".to_string(),
            endpointing_ms: 300,
            keywords: Vec::new(),
        }
    }
}

/// Whisper-specific parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperParams {
    /// API key (falls back to OPENAI_API_KEY)
    pub api_key: Option<String>,
    /// Model name
    pub model: String,
}

impl Default for WhisperParams {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "whisper-1".to_string(),
        }
    }
}

/// TTS provider selection and parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    /// Primary provider (openai, elevenlabs)
    pub provider: String,
    /// Fallback provider tried when the primary fails
    pub fallback: Option<String>,
    /// OpenAI parameters
    pub openai: OpenAiTtsParams,
    /// ElevenLabs parameters
    pub elevenlabs: ElevenLabsParams,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            fallback: Some("elevenlabs".to_string()),
            openai: OpenAiTtsParams::default(),
            elevenlabs: ElevenLabsParams::default(),
        }
    }
}

/// OpenAI TTS parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiTtsParams {
    /// API key (falls back to OPENAI_API_KEY)
    pub api_key: Option<String>,
    /// Model (tts-1, tts-1-hd)
    pub model: String,
    /// Voice id
    pub voice: String,
    /// Speaking speed
    pub speed: f32,
}

impl Default for OpenAiTtsParams {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "tts-1".to_string(),
            voice: "shimmer".to_string(),
            speed: 1.0,
        }
    }
}

/// ElevenLabs parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevenLabsParams {
    /// API key (falls back to ELEVENLABS_API_KEY)
    pub api_key: Option<String>,
    /// Voice id
    pub voice_id: Option<String>,
    /// Stability (0.0 to 1.0)
    pub stability: f32,
    /// Similarity boost (0.0 to 1.0)
    pub similarity_boost: f32,
}

impl Default for ElevenLabsParams {
    fn default() -> Self {
        Self {
            api_key: None,
            voice_id: None,
            stability: 0.5,
            similarity_boost: 0.75,
        }
    }
}

/// Speech-to-speech provider selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct S2sSettings {
    /// Preferred provider (openai-realtime, gemini-live); when unset, the
    /// first provider with resolvable credentials wins
    pub provider: Option<String>,
    /// OpenAI Realtime parameters
    pub openai_realtime: OpenAiRealtimeParams,
    /// Gemini Live parameters
    pub gemini_live: GeminiLiveParams,
}

/// OpenAI Realtime parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiRealtimeParams {
    /// API key (falls back to OPENAI_API_KEY)
    pub api_key: Option<String>,
    /// Realtime model
    pub model: String,
    /// Assistant voice
    pub voice: String,
}

impl Default for OpenAiRealtimeParams {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "alloy".to_string(),
        }
    }
}

/// Gemini Live parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiLiveParams {
    /// API key (falls back to GEMINI_API_KEY)
    pub api_key: Option<String>,
    /// Live model
    pub model: String,
    /// Prebuilt voice name
    pub voice: String,
    /// Provider session limit
    pub session_duration_ms: u64,
    /// Rotation lead time before the limit
    pub rotation_buffer_ms: u64,
}

impl Default for GeminiLiveParams {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "models/gemini-2.0-flash-live-001".to_string(),
            voice: "Puck".to_string(),
            session_duration_ms: 600_000,
            rotation_buffer_ms: 60_000,
        }
    }
}

/// Voice activity detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    /// Detector engine (neural, rms)
    pub engine: String,
    /// Speech probability / energy threshold, 0.0 to 1.0
    pub threshold: f32,
    /// Silence needed to end an utterance
    pub silence_duration_ms: u64,
    /// Speech runs shorter than this are ignored
    pub min_speech_duration_ms: u64,
    /// Path to the Silero ONNX model (falls back to LYRA_VAD_MODEL)
    pub model_path: Option<String>,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            engine: "neural".to_string(),
            threshold: 0.5,
            silence_duration_ms: 1500,
            min_speech_duration_ms: 250,
            model_path: None,
        }
    }
}

/// Session behavior settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorSettings {
    /// Allow users to interrupt bot playback
    pub barge_in: bool,
    /// Drop inbound frames that look like the bot's own audio
    pub echo_suppression: bool,
    /// Hard cap on a single utterance
    pub max_recording_ms: u64,
    /// Conversation window size
    pub max_conversation_turns: usize,
    /// System prompt forwarded to the engine
    pub system_prompt: Option<String>,
    /// When non-empty, only these users are heard
    pub allowed_users: Vec<u64>,
}

impl Default for BehaviorSettings {
    fn default() -> Self {
        Self {
            barge_in: true,
            echo_suppression: true,
            max_recording_ms: 60_000,
            max_conversation_turns: lyra_core::DEFAULT_MAX_TURNS,
            system_prompt: None,
            allowed_users: Vec::new(),
        }
    }
}

impl VoiceSettings {
    /// Parse settings from host character/plugin JSON; missing sections
    /// take defaults
    pub fn from_json(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Invalid voice settings, using defaults");
            Self::default()
        })
    }
}
