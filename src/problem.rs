//! Coding problem metadata supplied by an external provider.
//!
//! Problem detection (DOM scraping on the host page) lives outside this
//! core; the session only consumes the result through
//! [`ProblemProvider`].

use serde::{Deserialize, Serialize};

/// Difficulty rating of a coding problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Easy => write!(f, "Easy"),
            Self::Medium => write!(f, "Medium"),
            Self::Hard => write!(f, "Hard"),
        }
    }
}

/// A coding problem the interview is about. Read-only to this core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    /// Stable problem identifier (slug or numeric id).
    pub id: String,
    /// Problem title.
    pub title: String,
    /// Difficulty rating.
    pub difficulty: Difficulty,
    /// Problem statement, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Canonical URL, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Supplies the problem currently on screen.
pub trait ProblemProvider: Send + Sync {
    /// Returns the current problem, or `None` when no problem page is
    /// detected.
    fn current_problem(&self) -> Option<Problem>;
}

/// A fixed problem, useful for tests and non-browser hosts.
#[derive(Debug, Clone)]
pub struct StaticProblemProvider {
    problem: Option<Problem>,
}

impl StaticProblemProvider {
    /// Provider that always returns the given problem.
    #[must_use]
    pub fn new(problem: Problem) -> Self {
        Self {
            problem: Some(problem),
        }
    }

    /// Provider that never detects a problem.
    #[must_use]
    pub fn empty() -> Self {
        Self { problem: None }
    }
}

impl ProblemProvider for StaticProblemProvider {
    fn current_problem(&self) -> Option<Problem> {
        self.problem.clone()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn difficulty_serializes_lowercase() {
        let json = serde_json::to_string(&Difficulty::Medium).unwrap();
        assert_eq!(json, r#""medium""#);
    }

    #[test]
    fn static_provider_returns_problem() {
        let provider = StaticProblemProvider::new(Problem {
            id: "two-sum".to_owned(),
            title: "Two Sum".to_owned(),
            difficulty: Difficulty::Easy,
            description: None,
            url: None,
        });
        assert_eq!(provider.current_problem().unwrap().id, "two-sum");
        assert!(StaticProblemProvider::empty().current_problem().is_none());
    }
}
