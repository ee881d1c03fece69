//! Environment wiring for provider credentials
//!
//! Every remote provider takes an optional key in settings and falls
//! back to a named environment variable at use time, so a missing key
//! is only an error once that provider is actually selected. The same
//! resolution drives `auto` engine selection: a speech-to-speech
//! provider is eligible exactly when its credential resolves.

use crate::{LyraError, Result};
use std::env;

/// OpenAI credential (Whisper STT, TTS, Realtime)
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";

/// ElevenLabs credential
pub const ELEVENLABS_API_KEY: &str = "ELEVENLABS_API_KEY";

/// Deepgram credential
pub const DEEPGRAM_API_KEY: &str = "DEEPGRAM_API_KEY";

/// Gemini credential
pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";

/// Silero VAD model path
pub const VAD_MODEL_PATH: &str = "LYRA_VAD_MODEL";

/// Load a `.env` file when one exists
///
/// Absence is fine; deployments commonly inject variables directly.
pub fn load_env() -> Result<()> {
    match dotenvy::dotenv() {
        Ok(path) => {
            tracing::debug!(path = %path.display(), "Environment file loaded");
            Ok(())
        }
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(LyraError::config(format!("Unreadable .env file: {}", e))),
    }
}

/// Resolve a provider credential
///
/// An explicit settings value wins over the named environment variable;
/// blank values count as absent either way.
pub fn resolve_api_key(explicit: Option<&str>, env_key: &str) -> Option<String> {
    if let Some(value) = explicit {
        if !value.trim().is_empty() {
            return Some(value.to_string());
        }
    }
    env::var(env_key).ok().filter(|value| !value.trim().is_empty())
}

/// Whether a provider credential is resolvable
pub fn has_api_key(explicit: Option<&str>, env_key: &str) -> bool {
    resolve_api_key(explicit, env_key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_key_wins() {
        env::set_var("LYRA_TEST_CRED_A", "from-env");
        assert_eq!(
            resolve_api_key(Some("from-settings"), "LYRA_TEST_CRED_A").as_deref(),
            Some("from-settings")
        );
        env::remove_var("LYRA_TEST_CRED_A");
    }

    #[test]
    fn test_env_fallback() {
        env::set_var("LYRA_TEST_CRED_B", "from-env");
        assert_eq!(
            resolve_api_key(None, "LYRA_TEST_CRED_B").as_deref(),
            Some("from-env")
        );
        assert!(has_api_key(None, "LYRA_TEST_CRED_B"));
        env::remove_var("LYRA_TEST_CRED_B");
    }

    #[test]
    fn test_blank_values_count_as_absent() {
        env::set_var("LYRA_TEST_CRED_C", "   ");
        assert_eq!(resolve_api_key(Some(""), "LYRA_TEST_CRED_C"), None);
        assert!(!has_api_key(Some("  "), "LYRA_TEST_CRED_C"));
        env::remove_var("LYRA_TEST_CRED_C");

        assert_eq!(resolve_api_key(None, "LYRA_TEST_CRED_MISSING"), None);
    }
}
