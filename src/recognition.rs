//! Traditional (discrete) speech recognition channel.
//!
//! Recognition engines emit many short partial and final fragments per
//! spoken utterance. Forwarding each fragment as its own user turn
//! would shred the conversation, so this channel buffers fragments and
//! finalizes once an uninterrupted silence gap elapses, producing one
//! coherent utterance. A manual stop finalizes immediately so captured
//! speech is never silently lost.

use crate::config::RecognitionConfig;
use crate::error::Result;
use crate::events::VoiceEvent;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Events a recognition source pushes while capturing.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// Interim transcript of the in-progress utterance. Replaces the
    /// previous partial (engines re-emit the full utterance so far).
    Partial(String),
    /// A committed fragment the engine will not revise.
    Segment(String),
    /// Source-level error (capture continues unless the source closes
    /// its event stream).
    Error(String),
}

/// Microphone capture + transcription collaborator.
///
/// Implementations may capture locally or fall back to a remote batch
/// transcription path; either way they push [`SourceEvent`]s while
/// running.
#[async_trait]
pub trait RecognitionSource: Send + Sync {
    /// Begin capture, pushing events into `events`.
    ///
    /// # Errors
    ///
    /// `VoiceError::PermissionDenied` or `VoiceError::DeviceUnavailable`
    /// when capture cannot start; the channel stays idle.
    async fn start(
        &self,
        config: &RecognitionConfig,
        events: mpsc::Sender<SourceEvent>,
    ) -> Result<()>;

    /// Stop capture. Idempotent.
    async fn stop(&self);
}

/// Text accumulated for the current utterance.
#[derive(Debug, Default)]
struct UtteranceBuffer {
    /// Fragments the engine committed, joined in arrival order.
    committed: String,
    /// Latest interim transcript (revisable).
    pending: String,
}

impl UtteranceBuffer {
    fn push_segment(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.committed.is_empty() {
            self.committed.push(' ');
        }
        self.committed.push_str(text);
        self.pending.clear();
    }

    fn current_text(&self) -> String {
        match (self.committed.is_empty(), self.pending.is_empty()) {
            (true, _) => self.pending.clone(),
            (false, true) => self.committed.clone(),
            (false, false) => format!("{} {}", self.committed, self.pending),
        }
    }

    fn take(&mut self) -> String {
        let text = self.current_text();
        self.committed.clear();
        self.pending.clear();
        text
    }
}

const SOURCE_CHANNEL_SIZE: usize = 32;

/// Discrete request/response speech recognition channel.
///
/// State machine: Idle → Listening → (Finalizing) → Idle.
pub struct SpeechRecognitionChannel {
    source: Arc<dyn RecognitionSource>,
    config: RecognitionConfig,
    events: broadcast::Sender<VoiceEvent>,
    listening: Arc<AtomicBool>,
    /// Bumped on every start/stop; events from older generations are
    /// stale and ignored.
    generation: Arc<AtomicU64>,
    buffer: Arc<Mutex<UtteranceBuffer>>,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SpeechRecognitionChannel {
    /// Create a channel over the given source, publishing into the
    /// shared event stream.
    pub fn new(
        source: Arc<dyn RecognitionSource>,
        config: RecognitionConfig,
        events: broadcast::Sender<VoiceEvent>,
    ) -> Self {
        Self {
            source,
            config,
            events,
            listening: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            buffer: Arc::new(Mutex::new(UtteranceBuffer::default())),
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    /// Whether the channel is currently capturing.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Snapshot of the in-progress utterance text.
    #[must_use]
    pub fn current_transcript(&self) -> String {
        match self.buffer.lock() {
            Ok(buffer) => buffer.current_text(),
            Err(_) => String::new(),
        }
    }

    /// Transition Idle → Listening. No-op when already listening.
    ///
    /// # Errors
    ///
    /// Propagates the source's `PermissionDenied` / `DeviceUnavailable`;
    /// the channel stays idle on failure.
    pub async fn start(&self) -> Result<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        if let Ok(mut guard) = self.cancel.lock() {
            *guard = cancel.clone();
        }

        let (source_tx, source_rx) = mpsc::channel(SOURCE_CHANNEL_SIZE);
        if let Err(e) = self.source.start(&self.config, source_tx).await {
            self.listening.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!("recognition started (generation {generation})");
        let _ = self.events.send(VoiceEvent::ListeningStarted);

        let handle = tokio::spawn(run_listen_loop(ListenLoop {
            generation,
            current_generation: Arc::clone(&self.generation),
            source: Arc::clone(&self.source),
            source_rx,
            buffer: Arc::clone(&self.buffer),
            events: self.events.clone(),
            listening: Arc::clone(&self.listening),
            silence: Duration::from_millis(self.config.silence_delay_ms),
            continuous: self.config.continuous,
            cancel,
        }));
        if let Ok(mut guard) = self.task.lock() {
            *guard = Some(handle);
        }
        Ok(())
    }

    /// Transition Listening → Idle, finalizing any buffered speech
    /// immediately even if the silence timer has not fired.
    ///
    /// The state flip is synchronous from the caller's perspective;
    /// source teardown completes asynchronously and late events from
    /// the stopped generation are ignored.
    pub async fn stop(&self) {
        if !self.listening.swap(false, Ordering::SeqCst) {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(guard) = self.cancel.lock() {
            guard.cancel();
        }

        finalize_utterance(&self.buffer, &self.events);
        let _ = self.events.send(VoiceEvent::ListeningStopped);
        self.source.stop().await;
        info!("recognition stopped");
    }
}

struct ListenLoop {
    generation: u64,
    current_generation: Arc<AtomicU64>,
    source: Arc<dyn RecognitionSource>,
    source_rx: mpsc::Receiver<SourceEvent>,
    buffer: Arc<Mutex<UtteranceBuffer>>,
    events: broadcast::Sender<VoiceEvent>,
    listening: Arc<AtomicBool>,
    silence: Duration,
    continuous: bool,
    cancel: CancellationToken,
}

/// Drive one listening generation: buffer source events and finalize
/// on silence. The timer is cancel-and-reset: every partial pushes the
/// deadline out, so a finalize only happens after a genuinely
/// uninterrupted gap.
async fn run_listen_loop(mut ctx: ListenLoop) {
    let sleep = tokio::time::sleep(ctx.silence);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            () = &mut sleep => {
                if ctx.current_generation.load(Ordering::SeqCst) != ctx.generation {
                    break;
                }
                let finalized = finalize_utterance(&ctx.buffer, &ctx.events);
                if finalized && !ctx.continuous {
                    // Single-shot mode: one utterance, then idle.
                    ctx.listening.store(false, Ordering::SeqCst);
                    let _ = ctx.events.send(VoiceEvent::ListeningStopped);
                    ctx.source.stop().await;
                    break;
                }
                sleep.as_mut().reset(tokio::time::Instant::now() + ctx.silence);
            }
            maybe_event = ctx.source_rx.recv() => {
                let Some(event) = maybe_event else {
                    // Source closed its stream: flush and go idle.
                    if ctx.current_generation.load(Ordering::SeqCst) == ctx.generation {
                        finalize_utterance(&ctx.buffer, &ctx.events);
                        ctx.listening.store(false, Ordering::SeqCst);
                        let _ = ctx.events.send(VoiceEvent::ListeningStopped);
                    }
                    break;
                };
                if ctx.current_generation.load(Ordering::SeqCst) != ctx.generation {
                    // Stale event from before a stop; drop it.
                    continue;
                }
                match event {
                    SourceEvent::Partial(text) => {
                        let snapshot = {
                            let Ok(mut buffer) = ctx.buffer.lock() else { continue };
                            buffer.pending = text;
                            buffer.current_text()
                        };
                        let _ = ctx.events.send(VoiceEvent::TranscriptPartial { text: snapshot });
                        sleep.as_mut().reset(tokio::time::Instant::now() + ctx.silence);
                    }
                    SourceEvent::Segment(text) => {
                        let snapshot = {
                            let Ok(mut buffer) = ctx.buffer.lock() else { continue };
                            buffer.push_segment(&text);
                            buffer.current_text()
                        };
                        let _ = ctx.events.send(VoiceEvent::TranscriptPartial { text: snapshot });
                        sleep.as_mut().reset(tokio::time::Instant::now() + ctx.silence);
                    }
                    SourceEvent::Error(message) => {
                        warn!("recognition source error: {message}");
                        let _ = ctx.events.send(VoiceEvent::Error { message });
                    }
                }
            }
            () = ctx.cancel.cancelled() => {
                // stop() already finalized and flipped state.
                break;
            }
        }
    }
}

/// Take the buffered utterance and emit it as a final transcript.
/// Returns whether anything was emitted. Take-based, so a racing timer
/// and manual stop can never double-emit.
fn finalize_utterance(
    buffer: &Arc<Mutex<UtteranceBuffer>>,
    events: &broadcast::Sender<VoiceEvent>,
) -> bool {
    let text = match buffer.lock() {
        Ok(mut buffer) => buffer.take(),
        Err(_) => return false,
    };
    if text.trim().is_empty() {
        return false;
    }
    info!("utterance finalized: \"{text}\"");
    let _ = events.send(VoiceEvent::TranscriptFinal { text });
    true
}
