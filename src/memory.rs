//! Session state shared across conversational turns.
//!
//! The memory owns the loaded datasets, the cached data passport and the
//! turn history. Turns are recorded whole, after a question has fully
//! resolved, never incrementally: a crash or cancellation mid-turn leaves
//! the history exactly as it was.

use crate::config::PassportOptions;
use crate::frame::Frame;
use crate::outcome::ExecutionOutcome;
use crate::passport::{self, DataPassport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// One generate-execute try inside a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// The exact code that was executed
    pub code: String,
    pub outcome: ExecutionOutcome,
}

/// A fully resolved question: every attempt that was made plus the answer
/// shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub question: String,
    pub attempts: Vec<Attempt>,
    /// Natural-language answer, including the apology text when the turn
    /// exhausted its retries
    pub answer: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(
        question: impl Into<String>,
        attempts: Vec<Attempt>,
        answer: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.into(),
            attempts,
            answer: answer.into(),
            created_at: Utc::now(),
        }
    }

    /// Whether the turn ended on a successful execution.
    pub fn succeeded(&self) -> bool {
        self.attempts
            .last()
            .map(|a| a.outcome.is_success())
            .unwrap_or(false)
    }

    /// The code behind the final answer, for users who ask to see it.
    pub fn final_code(&self) -> Option<&str> {
        self.attempts.last().map(|a| a.code.as_str())
    }

    /// The successful execution at the end of the turn, if any.
    pub fn success(&self) -> Option<&crate::outcome::ExecutionSuccess> {
        self.attempts.last().and_then(|a| a.outcome.as_success())
    }
}

/// In-memory session state. One instance per conversation.
#[derive(Debug, Default)]
pub struct SessionMemory {
    datasets: BTreeMap<String, Frame>,
    turns: Vec<Turn>,
    passport_options: PassportOptions,
    passport_cache: Option<DataPassport>,
}

impl SessionMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_passport_options(options: PassportOptions) -> Self {
        Self {
            passport_options: options,
            ..Self::default()
        }
    }

    // ========================================================================
    // DATASETS
    // ========================================================================

    /// Register a dataset. A frame with an already-loaded name replaces the
    /// previous one.
    pub fn add_dataset(&mut self, frame: Frame) {
        debug!(
            "Loaded dataset '{}' ({} rows x {} columns)",
            frame.name(),
            frame.row_count(),
            frame.columns().len()
        );
        self.datasets.insert(frame.name().to_string(), frame);
        self.passport_cache = None;
    }

    pub fn add_datasets(&mut self, frames: impl IntoIterator<Item = Frame>) {
        for frame in frames {
            self.add_dataset(frame);
        }
    }

    pub fn datasets(&self) -> &BTreeMap<String, Frame> {
        &self.datasets
    }

    pub fn dataset_names(&self) -> Vec<&str> {
        self.datasets.keys().map(String::as_str).collect()
    }

    pub fn has_datasets(&self) -> bool {
        !self.datasets.is_empty()
    }

    /// The passport for the current datasets, built lazily and cached until
    /// the datasets change.
    pub fn current_passport(&mut self) -> &DataPassport {
        let datasets = &self.datasets;
        let options = &self.passport_options;
        self.passport_cache
            .get_or_insert_with(|| passport::build(datasets.values(), options))
    }

    // ========================================================================
    // TURN HISTORY
    // ========================================================================

    /// Append a resolved turn. This is the only way history grows.
    pub fn record_turn(&mut self, turn: Turn) {
        debug!(
            "Recorded turn {} ({} attempt{}, succeeded: {})",
            turn.id,
            turn.attempts.len(),
            if turn.attempts.len() == 1 { "" } else { "s" },
            turn.succeeded()
        );
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Numbered digest of past turns, the grounding for synthesis answers.
    pub fn history_summary(&self) -> String {
        if self.turns.is_empty() {
            return "No prior turns in this session.".to_string();
        }
        let mut lines = Vec::with_capacity(self.turns.len());
        for (i, turn) in self.turns.iter().enumerate() {
            let mut flags = String::new();
            if let Some(success) = turn.success() {
                if success.table.is_some() {
                    flags.push_str(" [table]");
                }
                if success.plot.is_some() {
                    flags.push_str(" [chart]");
                }
            } else if !turn.attempts.is_empty() {
                // Exhausted turns. Synthesis turns have no attempts and no flag.
                flags.push_str(" [unanswered]");
            }
            lines.push(format!(
                "{}. Q: {}\n   A: {}{}",
                i + 1,
                truncate(&turn.question, 200),
                truncate(first_line(&turn.answer), 200),
                flags
            ));
        }
        lines.join("\n")
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

/// Truncate on a char boundary, appending an ellipsis when shortened.
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars).collect();
        format!("{}...", kept)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Column;
    use crate::outcome::{ExecutionSuccess, FailureKind};

    fn sales(rows: usize) -> Frame {
        let ids: Vec<Option<i64>> = (0..rows as i64).map(Some).collect();
        Frame::new("sales", vec![Column::ints("id", ids)]).unwrap()
    }

    fn success_turn(question: &str, answer: &str) -> Turn {
        Turn::new(
            question,
            vec![Attempt {
                code: "show(1)".to_string(),
                outcome: ExecutionOutcome::Success(ExecutionSuccess {
                    text: Some("1\n".to_string()),
                    table: None,
                    plot: None,
                }),
            }],
            answer,
        )
    }

    #[test]
    fn replacing_a_dataset_invalidates_the_passport() {
        let mut memory = SessionMemory::new();
        memory.add_dataset(sales(4));
        assert!(memory.current_passport().render().contains("4 rows"));

        memory.add_dataset(sales(2));
        assert!(memory.current_passport().render().contains("2 rows"));
        assert_eq!(memory.dataset_names(), vec!["sales"]);
    }

    #[test]
    fn turns_append_in_order() {
        let mut memory = SessionMemory::new();
        memory.record_turn(success_turn("first?", "one"));
        memory.record_turn(success_turn("second?", "two"));
        assert_eq!(memory.turns().len(), 2);
        assert_eq!(memory.turns()[0].question, "first?");
        assert_eq!(memory.last_turn().unwrap().answer, "two");
    }

    #[test]
    fn history_summary_numbers_turns_and_flags_artifacts() {
        let mut memory = SessionMemory::new();
        memory.record_turn(success_turn("What is the mean?", "The mean is 20."));

        let mut with_chart = success_turn("Plot it", "Rendered the chart.");
        if let Some(attempt) = with_chart.attempts.last_mut() {
            attempt.outcome = ExecutionOutcome::Success(ExecutionSuccess {
                text: None,
                table: None,
                plot: Some(crate::outcome::PlotArtifact {
                    kind: crate::outcome::ChartKind::Bar,
                    title: "t".to_string(),
                    x: vec![],
                    series: vec![],
                }),
            });
        }
        memory.record_turn(with_chart);

        memory.record_turn(Turn::new(
            "Broken?",
            vec![Attempt {
                code: "oops(".to_string(),
                outcome: ExecutionOutcome::failure(FailureKind::RuntimeFault, "syntax", "oops("),
            }],
            "I could not answer this.",
        ));

        let summary = memory.history_summary();
        assert!(summary.starts_with("1. Q: What is the mean?"));
        assert!(summary.contains("2. Q: Plot it"));
        assert!(summary.contains("[chart]"));
        assert!(summary.contains("3. Q: Broken?"));
        assert!(summary.contains("[unanswered]"));
    }

    #[test]
    fn empty_history_has_a_fixed_summary() {
        let memory = SessionMemory::new();
        assert_eq!(memory.history_summary(), "No prior turns in this session.");
    }

    #[test]
    fn turns_round_trip_through_json() {
        let turn = success_turn("What is the mean?", "The mean is 20.");
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["id"].as_str(), Some(turn.id.to_string().as_str()));
        assert_eq!(json["question"], "What is the mean?");

        let back: Turn = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, turn.id);
        assert_eq!(back.created_at, turn.created_at);
        assert_eq!(back.attempts, turn.attempts);
    }

    #[test]
    fn turn_success_tracks_the_last_attempt() {
        let failed = Attempt {
            code: "bad".to_string(),
            outcome: ExecutionOutcome::failure(FailureKind::RuntimeFault, "boom", "bad"),
        };
        let fixed = Attempt {
            code: "good".to_string(),
            outcome: ExecutionOutcome::Success(ExecutionSuccess::default()),
        };
        let turn = Turn::new("q", vec![failed.clone(), fixed], "done");
        assert!(turn.succeeded());
        assert_eq!(turn.final_code(), Some("good"));

        let turn = Turn::new("q", vec![failed], "sorry");
        assert!(!turn.succeeded());
    }
}
