//! The interview session: conversation layer over history, usage,
//! the LLM, and the voice coordinator.
//!
//! One session is one interview. User turns arrive either as typed
//! text or as finalized voice transcripts; each triggers at most one
//! LLM call, the reply is appended to the history and dispatched to
//! the active voice channel for playback. In realtime mode the remote
//! endpoint generates the spoken reply itself, so the session only
//! mirrors both transcripts into the history.

use crate::coordinator::{VoiceMode, VoiceModeCoordinator};
use crate::error::{Result, VoiceError};
use crate::events::VoiceEvent;
use crate::history::{ConversationHistory, ConversationTurn, Role};
use crate::llm::ChatApi;
use crate::problem::ProblemProvider;
use crate::usage::{UsageAccountant, UsageTotals};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// System prompt establishing the interviewer persona.
pub const INTERVIEWER_PROMPT: &str = "You are an experienced, friendly technical interviewer \
conducting a mock coding interview. Keep replies short and conversational, as they will be \
spoken aloud. Ask one question at a time, probe the candidate's reasoning, give hints rather \
than answers, and note complexity trade-offs when the candidate proposes an approach.";

/// Assistant note appended when the LLM call fails, so the transcript
/// never ends on an unanswered user turn.
const FALLBACK_NOTE: &str =
    "Sorry, I had trouble responding just now. Please go on, I'm still listening.";

/// Clears the in-flight gate on every exit path.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A running mock interview.
pub struct InterviewSession {
    chat: Arc<dyn ChatApi>,
    problems: Arc<dyn ProblemProvider>,
    coordinator: Arc<VoiceModeCoordinator>,
    events: broadcast::Sender<VoiceEvent>,
    history: Mutex<ConversationHistory>,
    usage: Mutex<UsageAccountant>,
    model: String,
    in_flight: AtomicBool,
}

impl InterviewSession {
    /// Create a session. `events` must be the same stream the
    /// coordinator publishes into.
    pub fn new(
        config: &crate::config::InterviewConfig,
        chat: Arc<dyn ChatApi>,
        problems: Arc<dyn ProblemProvider>,
        coordinator: Arc<VoiceModeCoordinator>,
        events: broadcast::Sender<VoiceEvent>,
    ) -> Self {
        Self {
            chat,
            problems,
            coordinator,
            events,
            history: Mutex::new(ConversationHistory::new(config.history.clone())),
            usage: Mutex::new(UsageAccountant::default()),
            model: config.llm.model.clone(),
            in_flight: AtomicBool::new(false),
        }
    }

    /// The voice layer this session drives.
    #[must_use]
    pub fn coordinator(&self) -> &VoiceModeCoordinator {
        &self.coordinator
    }

    /// Whether an LLM call is currently outstanding.
    #[must_use]
    pub fn is_responding(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Full transcript so far, oldest first.
    #[must_use]
    pub fn transcript(&self) -> Vec<ConversationTurn> {
        match self.history.lock() {
            Ok(history) => history.transcript().to_vec(),
            Err(_) => Vec::new(),
        }
    }

    /// Cumulative token usage and cost.
    #[must_use]
    pub fn usage(&self) -> UsageTotals {
        match self.usage.lock() {
            Ok(usage) => usage.snapshot(),
            Err(_) => UsageTotals::default(),
        }
    }

    /// Send one user turn to the interviewer and return the reply.
    ///
    /// At most one call may be outstanding; playback of the reply is
    /// dispatched best-effort and does not delay the return.
    ///
    /// # Errors
    ///
    /// `VoiceError::Busy` while a previous call is outstanding,
    /// `VoiceError::Session` for an empty message. LLM failures
    /// propagate after a fallback note is appended to the transcript,
    /// so the conversation stays coherent for the user.
    pub async fn send_user_message(&self, text: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::Session("empty user message".to_owned()));
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(VoiceError::Busy);
        }
        let _guard = FlightGuard(&self.in_flight);

        let problem = self.problems.current_problem();
        let messages = {
            let mut history = self
                .history
                .lock()
                .map_err(|_| VoiceError::Session("history lock poisoned".to_owned()))?;
            history.append(Role::User, text);
            history.build_context(INTERVIEWER_PROMPT, problem.as_ref())
        };

        let _ = self.events.send(VoiceEvent::Thinking { active: true });
        let outcome = self.chat.complete(&messages).await;
        let _ = self.events.send(VoiceEvent::Thinking { active: false });

        match outcome {
            Ok(completion) => {
                if let Some(usage) = completion.usage {
                    if let Ok(mut accountant) = self.usage.lock() {
                        let cost = accountant.record(
                            usage.prompt_tokens,
                            usage.completion_tokens,
                            &self.model,
                        );
                        debug!(cost_usd = cost, "recorded llm usage");
                    }
                }
                if let Ok(mut history) = self.history.lock() {
                    history.append(Role::Assistant, &completion.content);
                }
                debug!(chars = completion.content.len(), "interviewer reply ready");
                self.dispatch_speech(completion.content.clone());
                Ok(completion.content)
            }
            Err(e) => {
                warn!("llm call failed: {e}");
                let _ = self.events.send(VoiceEvent::Error {
                    message: e.to_string(),
                });
                if let Ok(mut history) = self.history.lock() {
                    history.append(Role::Assistant, FALLBACK_NOTE);
                }
                self.dispatch_speech(FALLBACK_NOTE.to_owned());
                Err(e)
            }
        }
    }

    /// Drive the voice loop until cancelled: finalized transcripts
    /// become user turns, and in realtime mode assistant transcripts
    /// are mirrored into the history.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut events = self.events.subscribe();
        info!("interview session running");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => self.handle_voice_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("session event loop lagging, {missed} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("interview session loop ended");
    }

    /// End the interview: tear the voice layer down and hand back the
    /// transcript.
    pub async fn end(&self) -> Vec<ConversationTurn> {
        self.coordinator.shutdown().await;
        let transcript = self.transcript();
        info!(turns = transcript.len(), "interview ended");
        transcript
    }

    async fn handle_voice_event(&self, event: VoiceEvent) {
        match event {
            VoiceEvent::TranscriptFinal { text } => match self.coordinator.mode() {
                VoiceMode::Traditional => {
                    if let Err(e) = self.send_user_message(&text).await {
                        // Busy or LLM failure; the voice loop keeps going.
                        warn!("voice turn not answered: {e}");
                    }
                }
                VoiceMode::Realtime => {
                    if let Ok(mut history) = self.history.lock() {
                        history.append(Role::User, &text);
                    }
                }
            },
            VoiceEvent::AssistantTranscript { text } => {
                if let Ok(mut history) = self.history.lock() {
                    history.append(Role::Assistant, &text);
                }
            }
            _ => {}
        }
    }

    /// Speak the reply without blocking the send path. Playback errors
    /// surface on the event stream, not to the caller.
    fn dispatch_speech(&self, text: String) {
        let coordinator = Arc::clone(&self.coordinator);
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.speak(&text).await {
                warn!("assistant playback failed: {e}");
                let _ = events.send(VoiceEvent::Error {
                    message: e.to_string(),
                });
            }
        });
    }
}
