//! STT and TTS provider engines

pub mod deepgram;
pub mod elevenlabs;
pub mod openai_tts;
pub mod whisper_api;

pub use deepgram::{DeepgramConfig, DeepgramStt};
pub use elevenlabs::ElevenLabsTts;
pub use openai_tts::OpenAiTts;
pub use whisper_api::{wrap_pcm_in_wav, WhisperApiStt};
