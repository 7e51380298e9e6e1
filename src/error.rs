//! Error types for the interview voice core.

/// Top-level error type for the conversation and voice layer.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Microphone access was denied by the user or platform.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No usable capture device is available.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Speech recognition error (traditional channel).
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Text-to-speech synthesis or playback error.
    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),

    /// The realtime streaming transport could not be established.
    ///
    /// This is an expected, recoverable failure: the coordinator
    /// falls back to the traditional channel.
    #[error("realtime connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// Realtime channel error after a session was established.
    #[error("realtime error: {0}")]
    Realtime(String),

    /// LLM chat completion failure (auth, rate limit, or network).
    #[error("response failed: {0}")]
    ResponseFailed(String),

    /// Configuration error (missing/invalid API key, bad config file).
    ///
    /// Raised before any network call so the UI can prompt for
    /// configuration rather than showing a network error.
    #[error("config error: {0}")]
    Config(String),

    /// A response is already in flight for this session.
    #[error("a response is already in flight")]
    Busy,

    /// Interview session error (invalid state, torn down).
    #[error("session error: {0}")]
    Session(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
