//! Wire protocol for the realtime streaming voice channel.
//!
//! Typed client/server events matching the OpenAI realtime WebSocket
//! shapes. Audio travels as base64-encoded little-endian PCM16 frames.

use crate::error::{Result, VoiceError};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};

/// Server-side turn detection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_owned(),
        }
    }
}

/// Session settings sent on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub modalities: Vec<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub turn_detection: TurnDetection,
}

impl SessionSettings {
    /// Settings for a voice-first session with server-side VAD.
    #[must_use]
    pub fn voice_session(model: &str, voice: &str, instructions: &str) -> Self {
        Self {
            model: model.to_owned(),
            voice: voice.to_owned(),
            instructions: instructions.to_owned(),
            modalities: vec!["audio".to_owned(), "text".to_owned()],
            input_audio_format: "pcm16".to_owned(),
            output_audio_format: "pcm16".to_owned(),
            turn_detection: TurnDetection::default(),
        }
    }
}

/// One content part of an injected conversation item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// A conversation item injected by the client (typed user input).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ItemContent>,
}

impl ConversationItem {
    /// A typed user message.
    #[must_use]
    pub fn user_text(text: &str) -> Self {
        Self {
            kind: "message".to_owned(),
            role: "user".to_owned(),
            content: vec![ItemContent {
                kind: "input_text".to_owned(),
                text: text.to_owned(),
            }],
        }
    }
}

/// Options for a client-requested response cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseOptions {
    pub modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl ResponseOptions {
    /// Audio + text response with optional override instructions.
    #[must_use]
    pub fn spoken(instructions: Option<String>) -> Self {
        Self {
            modalities: vec!["audio".to_owned(), "text".to_owned()],
            instructions,
        }
    }
}

/// Events the client sends to the realtime endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Configure the session (model, voice, instructions, VAD).
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },
    /// Append one microphone frame (base64 PCM16).
    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: String },
    /// Inject a typed conversation item.
    #[serde(rename = "conversation.item.create")]
    CreateItem { item: ConversationItem },
    /// Request a response cycle.
    #[serde(rename = "response.create")]
    CreateResponse { response: ResponseOptions },
    /// Cancel the in-flight response (barge-in).
    #[serde(rename = "response.cancel")]
    CancelResponse,
}

/// Error payload on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
}

/// Events the realtime endpoint sends to the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Session established and configured.
    #[serde(rename = "session.created")]
    SessionCreated,
    /// Server VAD detected the user starting to speak.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    /// Server VAD detected the user finishing their turn.
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    /// Final transcript of the user's spoken turn.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscript {
        #[serde(default)]
        transcript: String,
    },
    /// A response cycle began.
    #[serde(rename = "response.created")]
    ResponseCreated,
    /// One chunk of assistant audio (base64 PCM16).
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        delta: String,
    },
    /// Final transcript of the assistant's spoken response.
    #[serde(rename = "response.audio_transcript.done")]
    ResponseTranscript {
        #[serde(default)]
        transcript: String,
    },
    /// The response cycle finished (including after a cancel).
    #[serde(rename = "response.done")]
    ResponseDone,
    /// Server-reported error.
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
    /// Any event type this client does not act on.
    #[serde(other)]
    Ignored,
}

/// Encode PCM16 samples for the wire.
#[must_use]
pub fn encode_pcm16(samples: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    B64.encode(bytes)
}

/// Decode a base64 PCM16 frame into raw playable bytes.
///
/// # Errors
///
/// Returns an error on invalid base64 or an odd byte count.
pub fn decode_audio(b64: &str) -> Result<bytes::Bytes> {
    let bytes = B64
        .decode(b64)
        .map_err(|e| VoiceError::Realtime(format!("invalid audio frame base64: {e}")))?;
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Realtime(
            "audio frame has odd byte count".to_owned(),
        ));
    }
    Ok(bytes::Bytes::from(bytes))
}

/// Decode a base64 PCM16 frame into samples.
///
/// # Errors
///
/// Returns an error on invalid base64 or an odd byte count.
pub fn decode_pcm16(b64: &str) -> Result<Vec<i16>> {
    let bytes = decode_audio(b64)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}
