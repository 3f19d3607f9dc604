//! In-memory columnar frames.
//!
//! A [`Frame`] is a named tabular relation with typed, nullable columns.
//! Session memory owns the authoritative frames; the executor hands each
//! attempt a working clone, so nothing the interpreter does can reach the
//! originals. Relational operations return new frames and report problems as
//! plain messages, which the interpreter classifies as runtime faults.

use crate::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Column type of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    Int,
    Float,
    Bool,
    Str,
}

impl Dtype {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Dtype::Int | Dtype::Float)
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Dtype::Int => "int",
            Dtype::Float => "float",
            Dtype::Bool => "bool",
            Dtype::Str => "str",
        };
        f.write_str(s)
    }
}

/// One materialized cell. `Null` stands for a missing value of any dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Numeric view of the cell, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Null => serde_json::Value::Null,
            Cell::Int(v) => serde_json::Value::from(*v),
            Cell::Float(v) => serde_json::Value::from(*v),
            Cell::Bool(v) => serde_json::Value::from(*v),
            Cell::Str(v) => serde_json::Value::from(v.clone()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => f.write_str("null"),
            Cell::Int(v) => write!(f, "{}", v),
            Cell::Float(v) => write!(f, "{}", v),
            Cell::Bool(v) => write!(f, "{}", v),
            Cell::Str(v) => f.write_str(v),
        }
    }
}

/// Hashable identity of a cell, used for grouping and deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CellKey {
    Null,
    Int(i64),
    Float(u64),
    Bool(bool),
    Str(String),
}

impl CellKey {
    fn of(cell: &Cell) -> Self {
        match cell {
            Cell::Null => CellKey::Null,
            Cell::Int(v) => CellKey::Int(*v),
            Cell::Float(v) => CellKey::Float(v.to_bits()),
            Cell::Bool(v) => CellKey::Bool(*v),
            Cell::Str(v) => CellKey::Str(v.clone()),
        }
    }
}

/// Typed, nullable column storage.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Bool(Vec<Option<bool>>),
    Str(Vec<Option<String>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
            ColumnData::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            ColumnData::Int(_) => Dtype::Int,
            ColumnData::Float(_) => Dtype::Float,
            ColumnData::Bool(_) => Dtype::Bool,
            ColumnData::Str(_) => Dtype::Str,
        }
    }

    fn cell(&self, row: usize) -> Cell {
        match self {
            ColumnData::Int(v) => v[row].map(Cell::Int).unwrap_or(Cell::Null),
            ColumnData::Float(v) => v[row].map(Cell::Float).unwrap_or(Cell::Null),
            ColumnData::Bool(v) => v[row].map(Cell::Bool).unwrap_or(Cell::Null),
            ColumnData::Str(v) => v[row]
                .as_ref()
                .map(|s| Cell::Str(s.clone()))
                .unwrap_or(Cell::Null),
        }
    }
}

/// A named column of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn ints(name: impl Into<String>, values: Vec<Option<i64>>) -> Self {
        Self::new(name, ColumnData::Int(values))
    }

    pub fn floats(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self::new(name, ColumnData::Float(values))
    }

    pub fn bools(name: impl Into<String>, values: Vec<Option<bool>>) -> Self {
        Self::new(name, ColumnData::Bool(values))
    }

    pub fn strs(name: impl Into<String>, values: Vec<Option<&str>>) -> Self {
        Self::new(
            name,
            ColumnData::Str(values.into_iter().map(|v| v.map(str::to_string)).collect()),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> Dtype {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn cell(&self, row: usize) -> Cell {
        self.data.cell(row)
    }

    pub fn cells(&self) -> Vec<Cell> {
        (0..self.len()).map(|i| self.cell(i)).collect()
    }

    pub fn null_count(&self) -> usize {
        (0..self.len()).filter(|i| self.cell(*i).is_null()).count()
    }

    fn take_rows(&self, rows: &[usize]) -> Column {
        let data = match &self.data {
            ColumnData::Int(v) => ColumnData::Int(rows.iter().map(|&i| v[i]).collect()),
            ColumnData::Float(v) => ColumnData::Float(rows.iter().map(|&i| v[i]).collect()),
            ColumnData::Bool(v) => ColumnData::Bool(rows.iter().map(|&i| v[i]).collect()),
            ColumnData::Str(v) => ColumnData::Str(rows.iter().map(|&i| v[i].clone()).collect()),
        };
        Column {
            name: self.name.clone(),
            data,
        }
    }
}

/// Comparison operator accepted by `filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

impl CmpOp {
    pub fn parse(s: &str) -> Option<CmpOp> {
        match s {
            "==" => Some(CmpOp::Eq),
            "!=" => Some(CmpOp::Ne),
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::Le),
            ">" => Some(CmpOp::Gt),
            ">=" => Some(CmpOp::Ge),
            "contains" => Some(CmpOp::Contains),
            _ => None,
        }
    }
}

/// Aggregation accepted by `group_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Mean,
    Count,
    Min,
    Max,
}

impl Aggregate {
    pub fn parse(s: &str) -> Option<Aggregate> {
        match s {
            "sum" => Some(Aggregate::Sum),
            "mean" => Some(Aggregate::Mean),
            "count" => Some(Aggregate::Count),
            "min" => Some(Aggregate::Min),
            "max" => Some(Aggregate::Max),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Aggregate::Sum => "sum",
            Aggregate::Mean => "mean",
            Aggregate::Count => "count",
            Aggregate::Min => "min",
            Aggregate::Max => "max",
        }
    }
}

/// A named tabular relation with typed, nullable columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    name: String,
    columns: Vec<Column>,
}

impl Frame {
    /// Construct a frame, validating its shape. Ragged columns, duplicate or
    /// empty column names and column-less frames are malformed.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AgentError::malformed(name, "dataset name is empty"));
        }
        if columns.is_empty() {
            return Err(AgentError::malformed(name, "dataset has no columns"));
        }
        let mut seen = HashSet::new();
        for col in &columns {
            if col.name().trim().is_empty() {
                return Err(AgentError::malformed(name, "column name is empty"));
            }
            if !seen.insert(col.name().to_string()) {
                return Err(AgentError::malformed(
                    name,
                    format!("duplicate column '{}'", col.name()),
                ));
            }
        }
        let rows = columns[0].len();
        if let Some(bad) = columns.iter().find(|c| c.len() != rows) {
            return Err(AgentError::malformed(
                name,
                format!(
                    "column '{}' has {} rows, expected {}",
                    bad.name(),
                    bad.len(),
                    rows
                ),
            ));
        }
        Ok(Self { name, columns })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn row_count(&self) -> usize {
        self.columns[0].len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    fn column_or_err(&self, name: &str) -> std::result::Result<&Column, String> {
        self.column(name).ok_or_else(|| {
            format!(
                "unknown column '{}' in table '{}' (available: {})",
                name,
                self.name,
                self.column_names().join(", ")
            )
        })
    }

    fn with_rows(&self, rows: &[usize]) -> Frame {
        Frame {
            name: self.name.clone(),
            columns: self.columns.iter().map(|c| c.take_rows(rows)).collect(),
        }
    }

    /// Clone of one column.
    pub fn select(&self, column: &str) -> std::result::Result<Column, String> {
        self.column_or_err(column).cloned()
    }

    /// Rows where `column <op> value` holds. Null cells never match.
    pub fn filter(
        &self,
        column: &str,
        op: CmpOp,
        value: &Cell,
    ) -> std::result::Result<Frame, String> {
        let col = self.column_or_err(column)?;
        let mut rows = Vec::new();
        for i in 0..col.len() {
            let cell = col.cell(i);
            if cell.is_null() {
                continue;
            }
            if compare(&cell, op, value)? {
                rows.push(i);
            }
        }
        Ok(self.with_rows(&rows))
    }

    /// Stable sort by one column; null cells sort last in either direction.
    pub fn sort_by(&self, column: &str, descending: bool) -> std::result::Result<Frame, String> {
        let col = self.column_or_err(column)?;
        let mut rows: Vec<usize> = (0..col.len()).collect();
        rows.sort_by(|&a, &b| {
            let ca = col.cell(a);
            let cb = col.cell(b);
            match (ca.is_null(), cb.is_null()) {
                (true, true) => std::cmp::Ordering::Equal,
                (true, false) => std::cmp::Ordering::Greater,
                (false, true) => std::cmp::Ordering::Less,
                (false, false) => {
                    let ord = order_cells(&ca, &cb);
                    if descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
            }
        });
        Ok(self.with_rows(&rows))
    }

    /// First `n` rows.
    pub fn head(&self, n: usize) -> Frame {
        let n = n.min(self.row_count());
        let rows: Vec<usize> = (0..n).collect();
        self.with_rows(&rows)
    }

    /// Group by `key` and aggregate `target`; groups keep first-appearance
    /// order so results are deterministic.
    pub fn group_by(
        &self,
        key: &str,
        agg: Aggregate,
        target: &str,
    ) -> std::result::Result<Frame, String> {
        let key_col = self.column_or_err(key)?;
        let target_col = self.column_or_err(target)?;
        if agg != Aggregate::Count && !target_col.dtype().is_numeric() {
            return Err(format!(
                "aggregate '{}' needs a numeric column, '{}' is {}",
                agg.label(),
                target,
                target_col.dtype()
            ));
        }

        let mut order: Vec<Cell> = Vec::new();
        let mut buckets: std::collections::HashMap<CellKey, Vec<usize>> =
            std::collections::HashMap::new();
        for i in 0..key_col.len() {
            let cell = key_col.cell(i);
            let k = CellKey::of(&cell);
            let entry = buckets.entry(k).or_insert_with(|| {
                order.push(cell.clone());
                Vec::new()
            });
            entry.push(i);
        }

        let mut keys = Vec::with_capacity(order.len());
        let mut values: Vec<Option<f64>> = Vec::with_capacity(order.len());
        for cell in &order {
            let rows = &buckets[&CellKey::of(cell)];
            let nums: Vec<f64> = rows
                .iter()
                .filter_map(|&i| target_col.cell(i).as_f64())
                .collect();
            let value = match agg {
                Aggregate::Count => Some(
                    rows.iter()
                        .filter(|&&i| !target_col.cell(i).is_null())
                        .count() as f64,
                ),
                Aggregate::Sum => Some(nums.iter().sum()),
                Aggregate::Mean => {
                    if nums.is_empty() {
                        None
                    } else {
                        Some(nums.iter().sum::<f64>() / nums.len() as f64)
                    }
                }
                Aggregate::Min => nums.iter().copied().fold(None, |acc: Option<f64>, v| {
                    Some(acc.map_or(v, |a| a.min(v)))
                }),
                Aggregate::Max => nums.iter().copied().fold(None, |acc: Option<f64>, v| {
                    Some(acc.map_or(v, |a| a.max(v)))
                }),
            };
            keys.push(cell.clone());
            values.push(value);
        }

        let key_data = cells_to_column_data(&keys, key_col.dtype());
        let agg_name = format!("{}_{}", agg.label(), target);
        Frame::new(
            format!("{}_by_{}", self.name, key),
            vec![
                Column::new(key, key_data),
                Column::new(agg_name, ColumnData::Float(values)),
            ],
        )
        .map_err(|e| e.to_string())
    }
}

/// Deduplicate cells preserving first-appearance order.
pub fn unique_cells(cells: &[Cell]) -> Vec<Cell> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for cell in cells {
        if seen.insert(CellKey::of(cell)) {
            out.push(cell.clone());
        }
    }
    out
}

/// Numeric values of a run of cells, skipping nulls. Non-numeric cells are
/// an error naming the offending value.
pub fn numeric_cells(cells: &[Cell]) -> std::result::Result<Vec<f64>, String> {
    let mut out = Vec::with_capacity(cells.len());
    for cell in cells {
        match cell {
            Cell::Null => {}
            other => match other.as_f64() {
                Some(v) => out.push(v),
                None => return Err(format!("value '{}' is not numeric", other)),
            },
        }
    }
    Ok(out)
}

fn cells_to_column_data(cells: &[Cell], dtype: Dtype) -> ColumnData {
    match dtype {
        Dtype::Int => ColumnData::Int(
            cells
                .iter()
                .map(|c| match c {
                    Cell::Int(v) => Some(*v),
                    _ => None,
                })
                .collect(),
        ),
        Dtype::Float => ColumnData::Float(
            cells
                .iter()
                .map(|c| match c {
                    Cell::Float(v) => Some(*v),
                    Cell::Int(v) => Some(*v as f64),
                    _ => None,
                })
                .collect(),
        ),
        Dtype::Bool => ColumnData::Bool(
            cells
                .iter()
                .map(|c| match c {
                    Cell::Bool(v) => Some(*v),
                    _ => None,
                })
                .collect(),
        ),
        Dtype::Str => ColumnData::Str(
            cells
                .iter()
                .map(|c| match c {
                    Cell::Str(v) => Some(v.clone()),
                    _ => None,
                })
                .collect(),
        ),
    }
}

fn order_cells(a: &Cell, b: &Cell) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Cell::Str(x), Cell::Str(y)) => x.cmp(y),
        (Cell::Bool(x), Cell::Bool(y)) => x.cmp(y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

fn compare(cell: &Cell, op: CmpOp, value: &Cell) -> std::result::Result<bool, String> {
    use std::cmp::Ordering;
    if op == CmpOp::Contains {
        return match (cell, value) {
            (Cell::Str(haystack), Cell::Str(needle)) => Ok(haystack.contains(needle.as_str())),
            _ => Err("'contains' compares strings only".to_string()),
        };
    }

    let ord = match (cell, value) {
        (Cell::Str(a), Cell::Str(b)) => Some(a.as_str().cmp(b.as_str())),
        (Cell::Bool(a), Cell::Bool(b)) => Some(a.cmp(b)),
        _ => match (cell.as_f64(), value.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    let ord = match ord {
        Some(o) => o,
        None => {
            return match op {
                CmpOp::Eq => Ok(false),
                CmpOp::Ne => Ok(true),
                _ => Err(format!(
                    "cannot compare '{}' with '{}' using an ordering operator",
                    cell, value
                )),
            }
        }
    };
    Ok(match op {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Ne => ord != Ordering::Equal,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
        CmpOp::Contains => unreachable!(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sales() -> Frame {
        Frame::new(
            "sales",
            vec![
                Column::ints("id", vec![Some(1), Some(2), Some(3), Some(4)]),
                Column::floats("amount", vec![Some(10.0), Some(20.0), None, Some(30.0)]),
                Column::strs(
                    "region",
                    vec![Some("north"), Some("south"), Some("north"), Some("south")],
                ),
            ],
        )
        .unwrap()
    }

    #[test]
    fn construction_rejects_ragged_columns() {
        let err = Frame::new(
            "bad",
            vec![
                Column::ints("a", vec![Some(1), Some(2)]),
                Column::ints("b", vec![Some(1)]),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn construction_rejects_duplicate_and_empty_names() {
        let err = Frame::new(
            "bad",
            vec![
                Column::ints("a", vec![Some(1)]),
                Column::ints("a", vec![Some(2)]),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate column 'a'"));

        let err = Frame::new("bad", vec![Column::ints("", vec![Some(1)])]).unwrap_err();
        assert!(err.to_string().contains("column name is empty"));

        let err = Frame::new("bad", vec![]).unwrap_err();
        assert!(err.to_string().contains("no columns"));
    }

    #[test]
    fn select_unknown_column_names_available_ones() {
        let err = sales().select("amnt").unwrap_err();
        assert!(err.contains("unknown column 'amnt'"));
        assert!(err.contains("amount"));
    }

    #[test]
    fn filter_skips_null_cells() {
        let frame = sales();
        let hits = frame
            .filter("amount", CmpOp::Gt, &Cell::Float(5.0))
            .unwrap();
        // Row with the null amount is excluded even though null > 5 is not
        // meaningful either way.
        assert_eq!(hits.row_count(), 3);
    }

    #[test]
    fn filter_compares_ints_against_floats() {
        let frame = sales();
        let hits = frame.filter("id", CmpOp::Ge, &Cell::Float(3.0)).unwrap();
        assert_eq!(hits.row_count(), 2);
    }

    #[test]
    fn sort_by_puts_nulls_last() {
        let frame = sales();
        let sorted = frame.sort_by("amount", true).unwrap();
        let amounts = sorted.select("amount").unwrap().cells();
        assert_eq!(amounts[0], Cell::Float(30.0));
        assert_eq!(amounts[3], Cell::Null);

        let sorted = frame.sort_by("amount", false).unwrap();
        let amounts = sorted.select("amount").unwrap().cells();
        assert_eq!(amounts[0], Cell::Float(10.0));
        assert_eq!(amounts[3], Cell::Null);
    }

    #[test]
    fn head_clamps_to_row_count() {
        assert_eq!(sales().head(2).row_count(), 2);
        assert_eq!(sales().head(99).row_count(), 4);
    }

    #[test]
    fn group_by_keeps_first_appearance_order() {
        let frame = sales();
        let grouped = frame.group_by("region", Aggregate::Sum, "amount").unwrap();
        assert_eq!(grouped.name(), "sales_by_region");
        let keys = grouped.select("region").unwrap().cells();
        assert_eq!(keys[0], Cell::Str("north".into()));
        assert_eq!(keys[1], Cell::Str("south".into()));
        let sums = grouped.select("sum_amount").unwrap().cells();
        assert_eq!(sums[0], Cell::Float(10.0));
        assert_eq!(sums[1], Cell::Float(50.0));
    }

    #[test]
    fn group_by_mean_of_all_null_bucket_is_null() {
        let frame = Frame::new(
            "t",
            vec![
                Column::strs("k", vec![Some("a"), Some("b")]),
                Column::floats("v", vec![None, Some(2.0)]),
            ],
        )
        .unwrap();
        let grouped = frame.group_by("k", Aggregate::Mean, "v").unwrap();
        let means = grouped.select("mean_v").unwrap().cells();
        assert_eq!(means[0], Cell::Null);
        assert_eq!(means[1], Cell::Float(2.0));
    }

    #[test]
    fn group_by_rejects_non_numeric_targets() {
        let err = sales()
            .group_by("region", Aggregate::Sum, "region")
            .unwrap_err();
        assert!(err.contains("needs a numeric column"));
    }

    #[test]
    fn unique_preserves_order() {
        let cells = vec![
            Cell::Str("b".into()),
            Cell::Str("a".into()),
            Cell::Str("b".into()),
            Cell::Null,
            Cell::Null,
        ];
        let uniq = unique_cells(&cells);
        assert_eq!(
            uniq,
            vec![Cell::Str("b".into()), Cell::Str("a".into()), Cell::Null]
        );
    }

    #[test]
    fn numeric_cells_skips_nulls_and_rejects_strings() {
        let ok = numeric_cells(&[Cell::Int(1), Cell::Null, Cell::Float(2.5)]).unwrap();
        assert_eq!(ok, vec![1.0, 2.5]);
        let err = numeric_cells(&[Cell::Str("x".into())]).unwrap_err();
        assert!(err.contains("not numeric"));
    }

    #[test]
    fn contains_filter_works_on_strings_only() {
        let frame = sales();
        let hits = frame
            .filter("region", CmpOp::Contains, &Cell::Str("orth".into()))
            .unwrap();
        assert_eq!(hits.row_count(), 2);
        let err = frame
            .filter("amount", CmpOp::Contains, &Cell::Str("1".into()))
            .unwrap_err();
        assert!(err.contains("strings only"));
    }
}
