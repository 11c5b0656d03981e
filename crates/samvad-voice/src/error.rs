//! Error types for the voice conversation engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the conversation engine.
///
/// "No speech detected" is deliberately not represented here: an empty clip
/// or empty transcript is a normal outcome of a turn (the loop quietly
/// re-arms), not an error surfaced to the user.
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone access was refused or no input device exists.
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Audio capture error: {0}")]
    Capture(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    /// The speech service returned an error payload or failed at the
    /// transport level. `stage` names the pipeline step (transcribe,
    /// generate, synthesize); `message` is what the user sees.
    #[error("{stage} failed: {message}")]
    Upstream { stage: String, message: String },

    /// The conversation was ended while work was in flight.
    #[error("Conversation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Create an upstream error for a named pipeline stage.
    pub fn upstream(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// The message shown to the user. Upstream failures surface the service
    /// message alone, matching what a toast would display.
    pub fn user_message(&self) -> String {
        match self {
            Self::Upstream { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_user_message_is_bare() {
        let err = VoiceError::upstream("generate", "rate limited");
        assert_eq!(err.user_message(), "rate limited");
        assert_eq!(err.to_string(), "generate failed: rate limited");
    }

    #[test]
    fn permission_denied_keeps_prefix() {
        let err = VoiceError::PermissionDenied("no input device".to_string());
        assert!(err.user_message().contains("Microphone access denied"));
    }
}
