//! Execution outcomes and the artifacts a successful attempt can produce.
//!
//! The executor never returns an `Err`; every way a candidate can go wrong
//! is classified here so the correction loop can decide what to do with it.

use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rows kept when a frame is materialized into a table artifact.
pub const MAX_ARTIFACT_ROWS: usize = 100;

/// Classification of a failed attempt. All three kinds feed the correction
/// loop; none of them terminates the turn by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The candidate tried to reach a capability outside the allow-list
    ForbiddenCapability,
    /// The candidate exceeded its execution budget
    Timeout,
    /// The candidate raised a runtime fault (bad column, type error, ...)
    RuntimeFault,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::ForbiddenCapability => "ForbiddenCapability",
            FailureKind::Timeout => "Timeout",
            FailureKind::RuntimeFault => "RuntimeFault",
        };
        f.write_str(s)
    }
}

/// A materialized table, capped so artifacts stay small.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableArtifact {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub truncated: bool,
}

impl TableArtifact {
    pub fn from_frame(frame: &Frame, max_rows: usize) -> Self {
        let kept = frame.row_count().min(max_rows);
        let rows = (0..kept)
            .map(|i| {
                frame
                    .columns()
                    .iter()
                    .map(|col| col.cell(i).to_json())
                    .collect()
            })
            .collect();
        Self {
            name: frame.name().to_string(),
            columns: frame
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            rows,
            truncated: frame.row_count() > kept,
        }
    }
}

/// Kind of rendered chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Bar,
    Line,
    Histogram,
}

/// A rendered chart as a structured description the UI layer can draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotArtifact {
    pub kind: ChartKind,
    pub title: String,
    /// Category labels (bar), x values (line) or bin labels (histogram)
    pub x: Vec<String>,
    /// One y value per entry in `x`
    pub series: Vec<f64>,
}

/// Payload of a successful attempt. At most one artifact of each kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionSuccess {
    pub text: Option<String>,
    pub table: Option<TableArtifact>,
    pub plot: Option<PlotArtifact>,
}

impl ExecutionSuccess {
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.table.is_none() && self.plot.is_none()
    }
}

/// A classified failure plus the code that produced it, exactly what the
/// corrector needs to write the next candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
    pub offending_code: String,
}

impl ExecutionFailure {
    /// `Kind: message` line fed back into the correction prompt.
    pub fn detail(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }
}

/// Result of executing one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success(ExecutionSuccess),
    Failure(ExecutionFailure),
}

impl ExecutionOutcome {
    pub fn failure(
        kind: FailureKind,
        message: impl Into<String>,
        offending_code: impl Into<String>,
    ) -> Self {
        ExecutionOutcome::Failure(ExecutionFailure {
            kind,
            message: message.into(),
            offending_code: offending_code.into(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success(_))
    }

    pub fn as_success(&self) -> Option<&ExecutionSuccess> {
        match self {
            ExecutionOutcome::Success(s) => Some(s),
            ExecutionOutcome::Failure(_) => None,
        }
    }

    pub fn as_failure(&self) -> Option<&ExecutionFailure> {
        match self {
            ExecutionOutcome::Success(_) => None,
            ExecutionOutcome::Failure(f) => Some(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Column;

    #[test]
    fn failure_detail_reads_like_an_exception_line() {
        let outcome =
            ExecutionOutcome::failure(FailureKind::RuntimeFault, "unknown column 'x'", "code");
        let failure = outcome.as_failure().unwrap();
        assert_eq!(failure.detail(), "RuntimeFault: unknown column 'x'");
    }

    #[test]
    fn outcome_serializes_with_a_status_tag() {
        let outcome = ExecutionOutcome::Success(ExecutionSuccess {
            text: Some("42".into()),
            table: None,
            plot: None,
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["text"], "42");

        let outcome = ExecutionOutcome::failure(FailureKind::Timeout, "budget exceeded", "loop");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["kind"], "timeout");
    }

    #[test]
    fn table_artifact_caps_rows() {
        let frame = Frame::new(
            "big",
            vec![Column::ints("n", (0..250).map(Some).collect())],
        )
        .unwrap();
        let artifact = TableArtifact::from_frame(&frame, MAX_ARTIFACT_ROWS);
        assert_eq!(artifact.rows.len(), MAX_ARTIFACT_ROWS);
        assert!(artifact.truncated);
        assert_eq!(artifact.rows[0][0], serde_json::json!(0));

        let small = TableArtifact::from_frame(&frame.head(3), MAX_ARTIFACT_ROWS);
        assert_eq!(small.rows.len(), 3);
        assert!(!small.truncated);
    }
}
