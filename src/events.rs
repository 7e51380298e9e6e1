//! Unified events emitted by the voice channels and the session.
//!
//! Every channel publishes into one `tokio::sync::broadcast` stream so
//! downstream consumers (UI, logging) stay channel-agnostic. This is
//! intentionally lightweight (no heavy payloads) so channels can emit
//! without blocking audio paths.

use crate::coordinator::VoiceMode;

/// Events describing what the voice layer is doing "right now".
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    /// The active channel started capturing user speech.
    ListeningStarted,
    /// The active channel stopped capturing user speech.
    ListeningStopped,
    /// Interim transcript of the in-progress utterance.
    TranscriptPartial { text: String },
    /// Finalized transcript of a complete utterance.
    TranscriptFinal { text: String },
    /// Finalized transcript of an assistant spoken response.
    AssistantTranscript { text: String },
    /// User speech activity detected (local heuristic, UI feedback).
    SpeechActivity { active: bool },
    /// Assistant audio playback started.
    SpeakingStarted,
    /// Assistant audio playback finished or was interrupted.
    SpeakingStopped,
    /// Whether the assistant is currently generating a response.
    Thinking { active: bool },
    /// Realtime channel established its streaming session.
    Connected,
    /// Realtime channel lost or closed its streaming session.
    Disconnected,
    /// The coordinator switched voice modes (including fallback).
    ModeChanged { mode: VoiceMode },
    /// A channel-level error, delivered without unwinding callers.
    Error { message: String },
}

/// Default capacity for the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
