//! Engine selection and construction
//!
//! Resolves the configured mode against available credentials and builds
//! the matching engine with its provider chain.

use crate::agent::AgentBridge;
use crate::engine::pipeline::PipelineEngine;
use crate::engine::s2s::S2sEngine;
use crate::engine::{ConversationEngine, EngineMode};
use crate::playback::PlaybackQueue;
use crate::settings::{VoiceMode, VoiceSettings};
use lyra_core::{ConversationLog, LyraError, Result};
use lyra_provider_voice::{
    DeepgramConfig, DeepgramStt, ElevenLabsTts, GeminiLiveConfig, GeminiLiveSession, HistoryFn,
    OpenAiRealtimeConfig, OpenAiRealtimeSession, OpenAiTts, SttEngine, TtsEngine, WhisperApiStt,
};
use std::sync::Arc;
use tracing::{info, warn};

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// The S2S provider with resolvable credentials, honoring an explicit
/// preference
fn s2s_provider_with_credentials(
    settings: &VoiceSettings,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Option<&'static str> {
    let openai_ok = settings.s2s.openai_realtime.api_key.is_some()
        || lookup(lyra_core::config::OPENAI_API_KEY).is_some();
    let gemini_ok = settings.s2s.gemini_live.api_key.is_some()
        || lookup(lyra_core::config::GEMINI_API_KEY).is_some();

    match settings.s2s.provider.as_deref() {
        Some("openai-realtime") => openai_ok.then_some("openai-realtime"),
        Some("gemini-live") => gemini_ok.then_some("gemini-live"),
        Some(other) => {
            warn!(provider = %other, "Unknown speech-to-speech provider");
            None
        }
        None => {
            if openai_ok {
                Some("openai-realtime")
            } else if gemini_ok {
                Some("gemini-live")
            } else {
                None
            }
        }
    }
}

fn resolve_mode_with(
    settings: &VoiceSettings,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> EngineMode {
    match settings.mode {
        VoiceMode::Pipeline => EngineMode::Pipeline,
        VoiceMode::SpeechToSpeech => {
            if s2s_provider_with_credentials(settings, lookup).is_some() {
                EngineMode::SpeechToSpeech
            } else {
                warn!("speech-to-speech requested but no provider credentials found, using pipeline");
                EngineMode::Pipeline
            }
        }
        VoiceMode::Auto => {
            if s2s_provider_with_credentials(settings, lookup).is_some() {
                EngineMode::SpeechToSpeech
            } else {
                EngineMode::Pipeline
            }
        }
    }
}

/// Resolve the effective engine mode from config and credentials
pub fn resolve_mode(settings: &VoiceSettings) -> EngineMode {
    resolve_mode_with(settings, &env_lookup)
}

fn build_stt(settings: &VoiceSettings, provider: &str) -> Result<Arc<dyn SttEngine>> {
    match provider {
        "deepgram" => Ok(Arc::new(DeepgramStt::new(DeepgramConfig {
            api_key: settings.stt.deepgram.api_key.clone(),
            model: settings.stt.deepgram.model.clone(),
            endpointing_ms: settings.stt.deepgram.endpointing_ms,
            keywords: settings.stt.deepgram.keywords.clone(),
        }))),
        "whisper" => Ok(Arc::new(WhisperApiStt::new(
            settings.stt.whisper.api_key.clone(),
            Some(settings.stt.whisper.model.clone()),
        ))),
        other => Err(LyraError::config(format!("Unknown STT provider: {}", other))),
    }
}

fn build_tts(settings: &VoiceSettings, provider: &str) -> Result<Arc<dyn TtsEngine>> {
    match provider {
        "openai" => Ok(Arc::new(
            OpenAiTts::new(
                settings.tts.openai.api_key.clone(),
                Some(settings.tts.openai.model.clone()),
                Some(settings.tts.openai.voice.clone()),
            )
            .with_speed(settings.tts.openai.speed),
        )),
        "elevenlabs" => Ok(Arc::new(
            ElevenLabsTts::new(
                settings.tts.elevenlabs.api_key.clone(),
                settings.tts.elevenlabs.voice_id.clone(),
            )
            .with_voice_settings(
                settings.tts.elevenlabs.stability,
                settings.tts.elevenlabs.similarity_boost,
            ),
        )),
        other => Err(LyraError::config(format!("Unknown TTS provider: {}", other))),
    }
}

fn build_pipeline(
    settings: &VoiceSettings,
    bridge: Arc<AgentBridge>,
    queue: Arc<PlaybackQueue>,
) -> Result<Box<dyn ConversationEngine>> {
    let stt = build_stt(settings, &settings.stt.provider)?;
    let stt_fallback = settings
        .stt
        .fallback
        .as_deref()
        .filter(|f| *f != settings.stt.provider)
        .map(|f| build_stt(settings, f))
        .transpose()?;

    let tts = build_tts(settings, &settings.tts.provider)?;
    let tts_fallback = settings
        .tts
        .fallback
        .as_deref()
        .filter(|f| *f != settings.tts.provider)
        .map(|f| build_tts(settings, f))
        .transpose()?;

    Ok(Box::new(PipelineEngine::new(
        stt,
        stt_fallback,
        tts,
        tts_fallback,
        bridge,
        queue,
        settings.behavior.max_conversation_turns,
        settings.behavior.max_recording_ms,
    )))
}

async fn build_s2s(
    settings: &VoiceSettings,
    bridge: Arc<AgentBridge>,
    queue: Arc<PlaybackQueue>,
) -> Result<Box<dyn ConversationEngine>> {
    let provider = s2s_provider_with_credentials(settings, &env_lookup)
        .ok_or_else(|| LyraError::config("No speech-to-speech provider credentials"))?;
    let system_prompt = settings.behavior.system_prompt.clone().unwrap_or_default();
    let tools = bridge.tool_definitions().await;
    let conversation = Arc::new(parking_lot::Mutex::new(ConversationLog::new(
        settings.behavior.max_conversation_turns,
    )));

    info!(provider = %provider, "Connecting speech-to-speech provider");
    match provider {
        "openai-realtime" => {
            let (session, events) = OpenAiRealtimeSession::connect(OpenAiRealtimeConfig {
                api_key: settings.s2s.openai_realtime.api_key.clone(),
                model: settings.s2s.openai_realtime.model.clone(),
                voice: settings.s2s.openai_realtime.voice.clone(),
                instructions: system_prompt,
                tools,
            })
            .await?;
            Ok(Box::new(S2sEngine::new(
                Arc::new(session),
                events,
                bridge,
                queue,
                conversation,
            )))
        }
        "gemini-live" => {
            let history_log = conversation.clone();
            let history: HistoryFn = Arc::new(move || history_log.lock().snapshot());
            let (session, events) = GeminiLiveSession::connect(
                GeminiLiveConfig {
                    api_key: settings.s2s.gemini_live.api_key.clone(),
                    model: settings.s2s.gemini_live.model.clone(),
                    voice: settings.s2s.gemini_live.voice.clone(),
                    system_prompt,
                    tools,
                    session_duration_ms: settings.s2s.gemini_live.session_duration_ms,
                    rotation_buffer_ms: settings.s2s.gemini_live.rotation_buffer_ms,
                    endpoint: None,
                },
                history,
            )
            .await?;
            Ok(Box::new(S2sEngine::new(
                Arc::new(session),
                events,
                bridge,
                queue,
                conversation,
            )))
        }
        other => Err(LyraError::config(format!(
            "Unknown speech-to-speech provider: {}",
            other
        ))),
    }
}

/// Build the engine for the resolved mode
pub async fn create_engine(
    settings: &VoiceSettings,
    bridge: Arc<AgentBridge>,
    queue: Arc<PlaybackQueue>,
) -> Result<Box<dyn ConversationEngine>> {
    match resolve_mode(settings) {
        EngineMode::Pipeline => build_pipeline(settings, bridge, queue),
        EngineMode::SpeechToSpeech => build_s2s(settings, bridge, queue).await,
    }
}
