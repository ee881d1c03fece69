//! Error types for the Lyra runtime

use thiserror::Error;

/// Main error type for Lyra operations
#[derive(Debug, Error)]
pub enum LyraError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote provider error (STT/TTS/S2S)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Voice transport error (join, disconnect, playback)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Conversational engine error
    #[error("Engine error: {0}")]
    Engine(String),

    /// Voice session error
    #[error("Session error: {0}")]
    Session(String),

    /// Tool execution error
    #[error("Tool error: {0}")]
    Tool(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network/HTTP error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Not found error (generic)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Convenient Result type using LyraError
pub type Result<T> = std::result::Result<T, LyraError>;

impl LyraError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        LyraError::Config(msg.into())
    }

    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        LyraError::Provider(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        LyraError::Transport(msg.into())
    }

    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        LyraError::Engine(msg.into())
    }

    /// Create a session error
    pub fn session(msg: impl Into<String>) -> Self {
        LyraError::Session(msg.into())
    }

    /// Create a tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        LyraError::Tool(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        LyraError::Timeout(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        LyraError::NotFound(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        LyraError::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = LyraError::provider("deepgram socket closed");
        assert_eq!(err.to_string(), "Provider error: deepgram socket closed");

        let err = LyraError::session("already stopped");
        assert_eq!(err.to_string(), "Session error: already stopped");
    }

    #[test]
    fn test_result_type() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }

        assert_eq!(returns_result().unwrap(), 42);
    }
}
