//! Conversation history with a bounded context window and rolling
//! summary.
//!
//! The full transcript is retained for the life of the session; only
//! the last `window` turns are sent verbatim to the LLM. Older turns
//! are folded into a single summary string capped at
//! `summary_max_chars`. The cap is enforced by slicing, so summarized
//! content beyond the cap is silently dropped — a deliberate, lossy
//! compression, not a completeness guarantee.

use crate::config::{HistoryConfig, SummaryTruncation};
use crate::llm::{ChatMessage, ChatRole};
use crate::problem::Problem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

/// A single conversation turn. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Unique identifier (generated on append, monotonic per history).
    pub id: String,
    /// Who spoke.
    pub role: Role,
    /// What was said.
    pub content: String,
    /// When the turn was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Ordered conversation history with window + rolling summary.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    /// Full transcript in insertion order.
    turns: Vec<ConversationTurn>,
    /// Number of leading turns already folded into the summary.
    folded: usize,
    /// Rolling summary of folded turns, capped at `summary_max_chars`.
    summary: String,
    config: HistoryConfig,
    /// Counter for generating turn IDs.
    next_id: u64,
}

impl ConversationHistory {
    /// Create an empty history with the given settings.
    #[must_use]
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            turns: Vec::new(),
            folded: 0,
            summary: String::new(),
            config,
            next_id: 1,
        }
    }

    /// Append a turn and lazily fold anything that fell out of the
    /// window. Returns the generated turn ID.
    pub fn append(&mut self, role: Role, content: impl Into<String>) -> String {
        let id = format!("turn_{}", self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.turns.push(ConversationTurn {
            id: id.clone(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
        self.fold_older_turns();
        id
    }

    /// Fold turns older than the window into the rolling summary.
    ///
    /// Idempotent: a watermark tracks how far folding has progressed,
    /// so a turn's text enters the summary exactly once.
    pub fn fold_older_turns(&mut self) {
        let window = self.config.effective_window();
        let fold_until = self.turns.len().saturating_sub(window);
        if fold_until <= self.folded {
            return;
        }

        for turn in &self.turns[self.folded..fold_until] {
            if !self.summary.is_empty() {
                self.summary.push('\n');
            }
            self.summary.push_str(turn.role.label());
            self.summary.push_str(": ");
            self.summary.push_str(&turn.content);
        }
        self.folded = fold_until;

        let cap = self.config.effective_summary_max_chars();
        self.summary = truncate_chars(&self.summary, cap, self.config.summary_truncation);
    }

    /// Build the message list for an LLM call: system persona, problem
    /// context, the rolling summary (when non-empty), then the last
    /// `window` turns verbatim.
    #[must_use]
    pub fn build_context(
        &self,
        system_prompt: &str,
        problem: Option<&Problem>,
    ) -> Vec<ChatMessage> {
        let window = self.config.effective_window();
        let verbatim_start = self.turns.len().saturating_sub(window);

        let mut messages = Vec::with_capacity(window + 3);
        messages.push(ChatMessage::system(system_prompt));
        if let Some(problem) = problem {
            messages.push(ChatMessage::system(problem_context(problem)));
        }
        if !self.summary.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Earlier conversation (summarized): {}",
                self.summary
            )));
        }
        for turn in &self.turns[verbatim_start..] {
            let role = match turn.role {
                Role::User => ChatRole::User,
                Role::Assistant => ChatRole::Assistant,
            };
            messages.push(ChatMessage {
                role,
                content: turn.content.clone(),
            });
        }
        messages
    }

    /// The full transcript, oldest first.
    #[must_use]
    pub fn transcript(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// Current rolling summary (may be empty).
    #[must_use]
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Total number of turns recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether no turns have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Render the minimal problem context message.
fn problem_context(problem: &Problem) -> String {
    let mut ctx = format!(
        "Interview problem: \"{}\" ({}).",
        problem.title, problem.difficulty
    );
    if let Some(desc) = &problem.description {
        ctx.push(' ');
        ctx.push_str(desc);
    }
    ctx
}

/// Truncate `text` to at most `cap` characters, keeping the configured
/// end. Operates on char boundaries.
fn truncate_chars(text: &str, cap: usize, direction: SummaryTruncation) -> String {
    let count = text.chars().count();
    if count <= cap {
        return text.to_owned();
    }
    match direction {
        SummaryTruncation::KeepNewest => text.chars().skip(count - cap).collect(),
        SummaryTruncation::KeepOldest => text.chars().take(cap).collect(),
    }
}
