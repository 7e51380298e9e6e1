//! LeetMentor voice core: conversational state and voice coordination
//! for AI mock coding interviews.
//!
//! The crate manages one interview conversation and the two
//! mutually-exclusive speech paths that carry it:
//! - **Traditional**: discrete speech recognition (silence-triggered
//!   utterance finalize) and request/response text-to-speech.
//! - **Realtime**: one persistent streaming session carrying
//!   microphone audio up and assistant audio down, with barge-in.
//!
//! # Architecture
//!
//! Independent channels publish into a shared `tokio::sync::broadcast`
//! event stream and are arbitrated by a coordinator:
//! - **History**: bounded context window with a rolling summary of
//!   older turns
//! - **Usage**: per-model token pricing and cumulative cost
//! - **Recognition / Synthesis**: the traditional voice pair
//! - **Realtime**: WebSocket streaming voice with a gapless playback
//!   queue
//! - **Coordinator**: mode switching with transparent fallback
//! - **Session**: ties history, usage, the LLM, and voice together

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod history;
pub mod llm;
pub mod problem;
pub mod realtime;
pub mod recognition;
pub mod session;
pub mod synthesis;
pub mod usage;
pub mod vad;

pub use config::InterviewConfig;
pub use coordinator::{VoiceMode, VoiceModeCoordinator, VoiceState};
pub use error::{Result, VoiceError};
pub use events::VoiceEvent;
pub use history::{ConversationHistory, ConversationTurn, Role};
pub use problem::{Difficulty, Problem, ProblemProvider};
pub use session::InterviewSession;
pub use usage::{UsageAccountant, UsageTotals};
