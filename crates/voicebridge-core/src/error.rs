//! Error types for the voicebridge engine.

use thiserror::Error;

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur in the streaming engine and its collaborators.
///
/// None of these terminate a session on their own; only transport-initiated
/// closure ends a session. Collaborator failures are logged at the call site
/// and the affected segment or turn is dropped.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("Function call error: {0}")]
    Function(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
