//! Configuration types for the interview voice core.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for an interview session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterviewConfig {
    /// Language model settings.
    pub llm: LlmConfig,
    /// Conversation history windowing and summary settings.
    pub history: HistoryConfig,
    /// Traditional speech recognition settings.
    pub recognition: RecognitionConfig,
    /// Traditional speech synthesis settings.
    pub synthesis: SynthesisConfig,
    /// Realtime streaming voice channel settings.
    pub realtime: RealtimeConfig,
    /// Local voice activity detection settings.
    pub vad: VadConfig,
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the chat completions provider.
    pub api_url: String,
    /// Model name to request.
    pub model: String,
    /// API key for the provider.
    ///
    /// An empty key short-circuits to a config error before any
    /// network call is made.
    pub api_key: String,
    /// Sampling temperature (0.0 = greedy, higher = more random).
    pub temperature: f64,
    /// Maximum tokens to generate per response.
    ///
    /// Kept small: replies are spoken aloud, long answers kill the
    /// interview pacing.
    pub max_tokens: usize,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com".to_owned(),
            model: "gpt-4o".to_owned(),
            api_key: String::new(),
            temperature: 0.7,
            max_tokens: 150,
            request_timeout_secs: 60,
        }
    }
}

/// Direction of rolling-summary truncation when the cap is exceeded.
///
/// The summary is truncated by slicing, not by evicting whole
/// sentences. Which end survives is configurable because the intended
/// behavior of the original system was ambiguous.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryTruncation {
    /// Keep the most recent characters (oldest content drops first).
    #[default]
    KeepNewest,
    /// Keep the earliest characters (newest content drops first).
    KeepOldest,
}

/// Conversation history configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Number of most-recent turns sent verbatim to the LLM.
    ///
    /// Clamped to 2–20 at use time.
    pub window: usize,
    /// Rolling summary length cap in characters.
    ///
    /// Clamped to 200–4000 at use time. Content beyond the cap is
    /// silently dropped per `summary_truncation`.
    pub summary_max_chars: usize,
    /// Which end of the summary survives truncation.
    pub summary_truncation: SummaryTruncation,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            window: 8,
            summary_max_chars: 600,
            summary_truncation: SummaryTruncation::default(),
        }
    }
}

impl HistoryConfig {
    /// Window size clamped to the supported range.
    #[must_use]
    pub fn effective_window(&self) -> usize {
        self.window.clamp(2, 20)
    }

    /// Summary cap clamped to the supported range.
    #[must_use]
    pub fn effective_summary_max_chars(&self) -> usize {
        self.summary_max_chars.clamp(200, 4000)
    }
}

/// Traditional speech recognition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// BCP-47 language tag passed to the recognition source.
    pub language: String,
    /// Silence duration in ms after the last partial result before the
    /// buffered utterance is finalized.
    pub silence_delay_ms: u64,
    /// Whether to keep listening after an utterance finalizes.
    pub continuous: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            language: "en-US".to_owned(),
            silence_delay_ms: 2000,
            continuous: true,
        }
    }
}

/// Traditional speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Base URL of the speech provider.
    pub api_url: String,
    /// Voice identifier.
    pub voice: String,
    /// Playback speed multiplier.
    pub speed: f32,
    /// Playback volume, 0.0–1.0.
    pub volume: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com".to_owned(),
            voice: "alloy".to_owned(),
            speed: 1.0,
            volume: 1.0,
        }
    }
}

/// Realtime streaming voice configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// WebSocket endpoint of the realtime provider.
    pub endpoint: String,
    /// Realtime model name.
    pub model: String,
    /// Voice identifier for server-side synthesis.
    pub voice: String,
    /// API key for the provider.
    pub api_key: String,
    /// Microphone capture sample rate in Hz.
    pub input_sample_rate: u32,
    /// Expected server playback sample rate in Hz.
    pub output_sample_rate: u32,
    /// Session instructions sent on connect.
    pub instructions: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.openai.com/v1/realtime".to_owned(),
            model: "gpt-4o-realtime-preview".to_owned(),
            voice: "alloy".to_owned(),
            api_key: String::new(),
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            instructions: String::new(),
        }
    }
}

/// Local voice activity detection configuration.
///
/// Local VAD drives UI feedback and barge-in triggering only; on the
/// realtime channel the server's own detector is authoritative for
/// turn boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech detection.
    ///
    /// Audio frames with RMS above this value are classified as
    /// speech. Typical values for f32 samples in \[-1, 1\]:
    ///   - 0.005: very sensitive (picks up quiet speech and some noise)
    ///   - 0.01:  normal sensitivity (default)
    ///   - 0.02:  reduced sensitivity (noisy environments)
    pub threshold: f32,
    /// Consecutive speech frames required before reporting
    /// speech-start. Guards barge-in against one-frame noise spikes.
    pub min_speech_frames: u32,
    /// Consecutive silent frames required before reporting speech-end.
    pub hangover_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            min_speech_frames: 3,
            hangover_frames: 15,
        }
    }
}

impl InterviewConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            crate::error::VoiceError::Config(format!(
                "failed to read config {}: {e}",
                path.display()
            ))
        })?;
        toml::from_str(&raw).map_err(|e| {
            crate::error::VoiceError::Config(format!(
                "invalid config {}: {e}",
                path.display()
            ))
        })
    }

    /// Save configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn save_to_file(&self, path: &Path) -> crate::error::Result<()> {
        let toml_str = toml::to_string_pretty(self).map_err(|e| {
            crate::error::VoiceError::Config(format!("failed to serialize config: {e}"))
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}
