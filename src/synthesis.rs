//! Traditional (request/response) speech synthesis channel.
//!
//! One utterance in flight at a time, latest request wins: a new AI
//! turn supersedes whatever is still playing. Synthesis failures are
//! reported but never crash the conversation; the session degrades to
//! text-only.

use crate::config::SynthesisConfig;
use crate::error::{Result, VoiceError};
use crate::events::VoiceEvent;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Text-to-speech provider interface.
#[async_trait]
pub trait SynthesisApi: Send + Sync {
    /// Render text to playable audio bytes.
    ///
    /// # Errors
    ///
    /// `VoiceError::SynthesisFailed` on transport or provider error.
    async fn synthesize(&self, text: &str, settings: &SynthesisConfig) -> Result<Bytes>;
}

/// Audio playback collaborator. The speaker is a singleton resource:
/// starting a new clip must stop any currently playing one.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play a clip to completion at the given volume (0.0–1.0).
    ///
    /// # Errors
    ///
    /// `VoiceError::SynthesisFailed` when playback cannot start.
    async fn play(&self, audio: Bytes, volume: f32) -> Result<()>;

    /// Abort whatever is playing. Idempotent.
    async fn stop(&self);
}

/// Discrete text-to-speech channel over a provider API and a sink.
pub struct SpeechSynthesisChannel {
    api: Arc<dyn SynthesisApi>,
    sink: Arc<dyn AudioSink>,
    config: SynthesisConfig,
    events: broadcast::Sender<VoiceEvent>,
    speaking: Arc<AtomicBool>,
    cancel: Mutex<CancellationToken>,
}

impl SpeechSynthesisChannel {
    /// Create a channel over the given provider and sink.
    pub fn new(
        api: Arc<dyn SynthesisApi>,
        sink: Arc<dyn AudioSink>,
        config: SynthesisConfig,
        events: broadcast::Sender<VoiceEvent>,
    ) -> Self {
        Self {
            api,
            sink,
            config,
            events,
            speaking: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Whether an utterance is currently playing.
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// Synthesize and play `text`, resolving when playback completes.
    /// Any utterance already in flight is stopped first; there is no
    /// queue.
    ///
    /// # Errors
    ///
    /// `VoiceError::SynthesisFailed` on synthesis or playback error.
    /// Being superseded by a later `speak` or a `stop` is not an
    /// error.
    pub async fn speak(&self, text: &str) -> Result<()> {
        // Latest request wins.
        self.stop().await;

        let cancel = CancellationToken::new();
        if let Ok(mut guard) = self.cancel.lock() {
            *guard = cancel.clone();
        }

        self.speaking.store(true, Ordering::SeqCst);
        let _ = self.events.send(VoiceEvent::SpeakingStarted);
        info!("speaking {} chars", text.len());

        let outcome = tokio::select! {
            result = async {
                let audio = self.api.synthesize(text, &self.config).await?;
                self.sink.play(audio, self.config.volume).await
            } => Some(result),
            () = cancel.cancelled() => None,
        };

        match outcome {
            // Superseded: the preempting stop() already flipped state
            // and emitted SpeakingStopped.
            None => Ok(()),
            Some(result) => {
                if self.speaking.swap(false, Ordering::SeqCst) {
                    let _ = self.events.send(VoiceEvent::SpeakingStopped);
                }
                if let Err(e) = &result {
                    warn!("synthesis failed: {e}");
                    let _ = self.events.send(VoiceEvent::Error {
                        message: e.to_string(),
                    });
                }
                result
            }
        }
    }

    /// Stop the current utterance, if any. Idempotent.
    pub async fn stop(&self) {
        if let Ok(guard) = self.cancel.lock() {
            guard.cancel();
        }
        self.sink.stop().await;
        if self.speaking.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(VoiceEvent::SpeakingStopped);
        }
    }
}

/// Text-to-speech client for OpenAI-compatible `/v1/audio/speech`
/// servers.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    api_key: String,
}

impl HttpSynthesizer {
    /// Create a client using the given provider API key.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl SynthesisApi for HttpSynthesizer {
    async fn synthesize(&self, text: &str, settings: &SynthesisConfig) -> Result<Bytes> {
        if self.api_key.trim().is_empty() {
            return Err(VoiceError::Config(
                "speech API key is not configured".to_owned(),
            ));
        }

        let base = settings.api_url.trim_end_matches('/');
        let url = format!("{base}/v1/audio/speech");
        let body = serde_json::json!({
            "model": "tts-1",
            "input": text,
            "voice": settings.voice,
            "speed": settings.speed,
        });

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::SynthesisFailed(format!("network error: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VoiceError::SynthesisFailed(format!(
                "provider returned status {status}"
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| VoiceError::SynthesisFailed(format!("body read failed: {e}")))
    }
}
