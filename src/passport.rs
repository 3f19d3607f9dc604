//! Data passport: the structural summary of loaded datasets that grounds
//! code generation.
//!
//! The passport is derived, read-only and deterministic: datasets are
//! described in name order, sample values are truncated and the column list
//! is capped, so the rendered block stays small no matter how large the
//! frames are. Structural problems cannot reach this module; they are
//! rejected when a [`Frame`] is constructed.

use crate::config::PassportOptions;
use crate::frame::{Dtype, Frame};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Summary of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub name: String,
    pub dtype: Dtype,
    pub null_count: usize,
    /// Rendered sample values from the first rows, truncated
    pub samples: Vec<String>,
}

/// Summary of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub name: String,
    pub row_count: usize,
    pub column_count: usize,
    /// Described columns, capped at `PassportOptions::max_columns`
    pub columns: Vec<ColumnSummary>,
    /// Columns beyond the cap, mentioned but not described
    pub elided_columns: usize,
    pub numeric_columns: Vec<String>,
    pub categorical_columns: Vec<String>,
}

/// Grounding snapshot of every loaded dataset, in name order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataPassport {
    pub datasets: Vec<DatasetSummary>,
}

impl DataPassport {
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetSummary> {
        self.datasets.iter().find(|d| d.name == name)
    }

    /// The text block handed to the code generator.
    pub fn render(&self) -> String {
        if self.datasets.is_empty() {
            return "No datasets loaded.".to_string();
        }
        let mut out = String::new();
        for ds in &self.datasets {
            let _ = writeln!(
                out,
                "Table '{}': {} rows x {} columns",
                ds.name, ds.row_count, ds.column_count
            );
            for col in &ds.columns {
                let _ = write!(
                    out,
                    "  - {} ({}, {} null{})",
                    col.name,
                    col.dtype,
                    col.null_count,
                    if col.null_count == 1 { "" } else { "s" }
                );
                if col.samples.is_empty() {
                    out.push('\n');
                } else {
                    let _ = writeln!(out, " e.g. {}", col.samples.join(", "));
                }
            }
            if ds.elided_columns > 0 {
                let _ = writeln!(out, "  ... and {} more columns", ds.elided_columns);
            }
            if !ds.numeric_columns.is_empty() {
                let _ = writeln!(out, "  numeric: {}", ds.numeric_columns.join(", "));
            }
            if !ds.categorical_columns.is_empty() {
                let _ = writeln!(out, "  categorical: {}", ds.categorical_columns.join(", "));
            }
        }
        out
    }
}

/// Build the passport for a set of frames. Pure and deterministic: the
/// result depends only on frame contents, never on iteration order.
pub fn build<'a>(
    datasets: impl IntoIterator<Item = &'a Frame>,
    options: &PassportOptions,
) -> DataPassport {
    let mut frames: Vec<&Frame> = datasets.into_iter().collect();
    frames.sort_by(|a, b| a.name().cmp(b.name()));

    let datasets = frames
        .into_iter()
        .map(|frame| summarize(frame, options))
        .collect();
    DataPassport { datasets }
}

fn summarize(frame: &Frame, options: &PassportOptions) -> DatasetSummary {
    let described = frame.columns().len().min(options.max_columns);
    let columns = frame.columns()[..described]
        .iter()
        .map(|col| {
            let sample_count = options.sample_rows.min(col.len());
            let samples = (0..sample_count)
                .map(|i| truncate(&col.cell(i).to_string(), options.max_value_chars))
                .collect();
            ColumnSummary {
                name: col.name().to_string(),
                dtype: col.dtype(),
                null_count: col.null_count(),
                samples,
            }
        })
        .collect();

    let numeric_columns = frame
        .columns()
        .iter()
        .filter(|c| c.dtype().is_numeric())
        .map(|c| c.name().to_string())
        .collect();
    let categorical_columns = frame
        .columns()
        .iter()
        .filter(|c| !c.dtype().is_numeric())
        .map(|c| c.name().to_string())
        .collect();

    DatasetSummary {
        name: frame.name().to_string(),
        row_count: frame.row_count(),
        column_count: frame.columns().len(),
        columns,
        elided_columns: frame.columns().len() - described,
        numeric_columns,
        categorical_columns,
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        let kept: String = value.chars().take(max_chars).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Column;

    fn frame(name: &str) -> Frame {
        Frame::new(
            name,
            vec![
                Column::ints("id", vec![Some(1), Some(2), Some(3), Some(4)]),
                Column::floats("amount", vec![Some(10.5), None, Some(30.0), Some(2.0)]),
                Column::strs("label", vec![Some("alpha"), Some("beta"), None, None]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn build_is_order_independent() {
        let a = frame("a");
        let b = frame("b");
        let options = PassportOptions::default();
        let fwd = build([&a, &b], &options);
        let rev = build([&b, &a], &options);
        assert_eq!(fwd, rev);
        assert_eq!(fwd.datasets[0].name, "a");
        assert_eq!(fwd.datasets[1].name, "b");
    }

    #[test]
    fn summaries_carry_nulls_and_type_split() {
        let f = frame("sales");
        let passport = build([&f], &PassportOptions::default());
        let ds = passport.dataset("sales").unwrap();
        assert_eq!(ds.row_count, 4);
        assert_eq!(ds.column_count, 3);
        assert_eq!(ds.columns[1].null_count, 1);
        assert_eq!(ds.numeric_columns, vec!["id", "amount"]);
        assert_eq!(ds.categorical_columns, vec!["label"]);
    }

    #[test]
    fn samples_are_truncated() {
        let f = Frame::new(
            "t",
            vec![Column::strs(
                "text",
                vec![Some("this value is far longer than the cap")],
            )],
        )
        .unwrap();
        let options = PassportOptions {
            sample_rows: 1,
            max_value_chars: 10,
            max_columns: 40,
        };
        let passport = build([&f], &options);
        assert_eq!(passport.datasets[0].columns[0].samples[0], "this value...");
    }

    #[test]
    fn column_list_is_capped() {
        let columns: Vec<Column> = (0..6)
            .map(|i| Column::ints(format!("c{}", i), vec![Some(i as i64)]))
            .collect();
        let f = Frame::new("wide", columns).unwrap();
        let options = PassportOptions {
            sample_rows: 1,
            max_value_chars: 24,
            max_columns: 4,
        };
        let passport = build([&f], &options);
        let ds = &passport.datasets[0];
        assert_eq!(ds.columns.len(), 4);
        assert_eq!(ds.elided_columns, 2);
        assert!(passport.render().contains("2 more columns"));
    }

    #[test]
    fn render_mentions_rows_columns_and_samples() {
        let f = frame("sales");
        let text = build([&f], &PassportOptions::default()).render();
        assert!(text.contains("Table 'sales': 4 rows x 3 columns"));
        assert!(text.contains("- amount (float, 1 null)"));
        assert!(text.contains("e.g. 10.5, null, 30"));
        assert!(text.contains("numeric: id, amount"));
    }

    #[test]
    fn empty_passport_renders_placeholder() {
        let none: [&Frame; 0] = [];
        let passport = build(none, &PassportOptions::default());
        assert!(passport.is_empty());
        assert_eq!(passport.render(), "No datasets loaded.");
    }
}
