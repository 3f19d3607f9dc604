//! Tree-walking interpreter for candidate scripts.
//!
//! The interpreter owns the second capability gate: even if a denied call
//! slips past the static scan, dispatch refuses it here before anything
//! runs. Filesystem, network and process builtins have no implementation in
//! this module at all, so there is no code path that could produce their
//! side effects.
//!
//! Execution is metered four ways: a step counter incremented on every
//! evaluated statement, expression and loop iteration; a wall-clock deadline
//! checked every few thousand steps (blocking threads cannot be aborted, so
//! the interpreter has to exit on its own); a byte cap on accumulated `show`
//! output; and an allocation budget charged by the operations that can grow
//! a value beyond its inputs.

use crate::frame::{self, Aggregate, Cell, CmpOp, Frame};
use crate::lang::ast::{BinOp, Expr, ExprKind, Program, Stmt, StmtKind, UnaryOp};
use crate::lang::lexer::{line_of, Span};
use crate::outcome::{ChartKind, PlotArtifact, TableArtifact, MAX_ARTIFACT_ROWS};
use crate::policy::{CapabilityGroup, CapabilityPolicy};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Maximum elements `range` will materialize.
const MAX_RANGE_LEN: i64 = 1_000_000;

/// Maximum bins `histogram` will materialize.
const MAX_HISTOGRAM_BINS: i64 = 10_000;

/// How often the wall-clock deadline is polled, in steps.
const DEADLINE_CHECK_INTERVAL: u64 = 4096;

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Array(Vec<Value>),
    Table(Frame),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
            Value::Array(_) => "array",
            Value::Table(_) => "table",
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Value::Unit => "()".to_string(),
            Value::Null => "null".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Str(v) => v.clone(),
            Value::Array(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.render()).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Table(frame) => format!(
                "Table '{}' ({} rows x {} columns)",
                frame.name(),
                frame.row_count(),
                frame.columns().len()
            ),
        }
    }
}

/// How an interpretation can stop early.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpError {
    /// A capability outside the allow-list was reached
    Forbidden(String),
    /// Step fuel ran out
    StepLimit,
    /// The wall-clock deadline passed
    DeadlineExceeded,
    /// Any other runtime fault of the candidate
    Fault(String),
}

/// Budget the executor hands to one run.
#[derive(Debug, Clone)]
pub struct RunLimits {
    pub max_steps: u64,
    pub max_output_bytes: usize,
    pub max_alloc_bytes: usize,
    pub deadline: Option<Instant>,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_steps: 500_000,
            max_output_bytes: 64 * 1024,
            max_alloc_bytes: 64 * 1024 * 1024,
            deadline: None,
        }
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunArtifacts {
    /// Accumulated `show` output
    pub output: String,
    pub table: Option<TableArtifact>,
    pub plot: Option<PlotArtifact>,
}

enum Flow {
    Normal,
    Break,
    Continue,
}

pub struct Interpreter<'a> {
    source: &'a str,
    frames: &'a BTreeMap<String, Frame>,
    policy: &'a CapabilityPolicy,
    limits: RunLimits,
    scopes: Vec<HashMap<String, Value>>,
    steps: u64,
    alloc_bytes: usize,
    artifacts: RunArtifacts,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        source: &'a str,
        frames: &'a BTreeMap<String, Frame>,
        policy: &'a CapabilityPolicy,
        limits: RunLimits,
    ) -> Self {
        Self {
            source,
            frames,
            policy,
            limits,
            scopes: vec![HashMap::new()],
            steps: 0,
            alloc_bytes: 0,
            artifacts: RunArtifacts::default(),
        }
    }

    pub fn run(mut self, program: &Program) -> Result<RunArtifacts, InterpError> {
        for stmt in &program.stmts {
            match self.eval_stmt(stmt)? {
                Flow::Normal => {}
                Flow::Break | Flow::Continue => {
                    return Err(self.fault(stmt.span, "'break' or 'continue' outside a loop"))
                }
            }
        }
        Ok(self.artifacts)
    }

    // ------------------------------------------------------------------
    // Metering
    // ------------------------------------------------------------------

    fn tick(&mut self) -> Result<(), InterpError> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(InterpError::StepLimit);
        }
        if self.steps % DEADLINE_CHECK_INTERVAL == 0 {
            if let Some(deadline) = self.limits.deadline {
                if Instant::now() >= deadline {
                    return Err(InterpError::DeadlineExceeded);
                }
            }
        }
        Ok(())
    }

    /// Count bytes a growth operation is about to allocate. The counter is
    /// monotonic: drops are never credited back.
    fn charge(&mut self, bytes: usize, span: Span) -> Result<(), InterpError> {
        self.alloc_bytes = self.alloc_bytes.saturating_add(bytes);
        if self.alloc_bytes > self.limits.max_alloc_bytes {
            return Err(self.fault(
                span,
                format!(
                    "allocations exceed the {} byte limit",
                    self.limits.max_alloc_bytes
                ),
            ));
        }
        Ok(())
    }

    fn fault(&self, span: Span, msg: impl Into<String>) -> InterpError {
        InterpError::Fault(format!(
            "line {}: {}",
            line_of(self.source, span.start),
            msg.into()
        ))
    }

    fn forbidden(&self, span: Span, msg: impl Into<String>) -> InterpError {
        InterpError::Forbidden(format!(
            "line {}: {}",
            line_of(self.source, span.start),
            msg.into()
        ))
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn eval_stmt(&mut self, stmt: &Stmt) -> Result<Flow, InterpError> {
        self.tick()?;
        match &stmt.kind {
            StmtKind::Import { module } => {
                match CapabilityGroup::from_module(module) {
                    None => {
                        return Err(self.forbidden(
                            stmt.span,
                            format!("import of '{}' is not permitted", module),
                        ))
                    }
                    Some(group) if !self.policy.is_allowed(group) => {
                        return Err(self.forbidden(
                            stmt.span,
                            format!(
                                "import of '{}' requires the '{}' capability, which is not enabled",
                                module,
                                group.module_name()
                            ),
                        ))
                    }
                    Some(_) => {}
                }
                Ok(Flow::Normal)
            }
            StmtKind::Let { name, value } => {
                let value = self.eval_expr(value)?;
                self.scopes
                    .last_mut()
                    .map(|scope| scope.insert(name.clone(), value));
                Ok(Flow::Normal)
            }
            StmtKind::Assign { name, value } => {
                let value = self.eval_expr(value)?;
                for scope in self.scopes.iter_mut().rev() {
                    if let Some(slot) = scope.get_mut(name) {
                        *slot = value;
                        return Ok(Flow::Normal);
                    }
                }
                Err(self.fault(
                    stmt.span,
                    format!("assignment to undefined variable '{}'; declare it with let", name),
                ))
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let test = self.eval_expr(cond)?;
                let test = self.expect_bool(test, cond.span)?;
                if test {
                    self.eval_block(then_body)
                } else if let Some(else_body) = else_body {
                    self.eval_block(else_body)
                } else {
                    Ok(Flow::Normal)
                }
            }
            StmtKind::For {
                var,
                iterable,
                body,
            } => {
                let items = match self.eval_expr(iterable)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(self.fault(
                            iterable.span,
                            format!("for loop needs an array, got {}", other.type_name()),
                        ))
                    }
                };
                for item in items {
                    self.tick()?;
                    self.scopes.push(HashMap::new());
                    self.scopes
                        .last_mut()
                        .map(|scope| scope.insert(var.clone(), item));
                    let flow = self.eval_stmts(body);
                    self.scopes.pop();
                    match flow? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Expr(expr) => {
                self.eval_expr(expr)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn eval_block(&mut self, stmts: &[Stmt]) -> Result<Flow, InterpError> {
        self.scopes.push(HashMap::new());
        let result = self.eval_stmts(stmts);
        self.scopes.pop();
        result
    }

    fn eval_stmts(&mut self, stmts: &[Stmt]) -> Result<Flow, InterpError> {
        for stmt in stmts {
            let flow = self.eval_stmt(stmt)?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn eval_expr(&mut self, expr: &Expr) -> Result<Value, InterpError> {
        self.tick()?;
        match &expr.kind {
            ExprKind::Int(v) => Ok(Value::Int(*v)),
            ExprKind::Float(v) => Ok(Value::Float(*v)),
            ExprKind::Bool(v) => Ok(Value::Bool(*v)),
            ExprKind::Str(v) => Ok(Value::Str(v.clone())),
            ExprKind::Ident(name) => {
                for scope in self.scopes.iter().rev() {
                    if let Some(value) = scope.get(name) {
                        return Ok(value.clone());
                    }
                }
                Err(self.fault(expr.span, format!("unknown variable '{}'", name)))
            }
            ExprKind::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expr(item)?);
                }
                Ok(Value::Array(values))
            }
            ExprKind::Unary { op, operand } => {
                let value = self.eval_expr(operand)?;
                match op {
                    UnaryOp::Neg => match value {
                        Value::Int(v) => v
                            .checked_neg()
                            .map(Value::Int)
                            .ok_or_else(|| self.fault(operand.span, "integer overflow")),
                        Value::Float(v) => Ok(Value::Float(-v)),
                        other => Err(self.fault(
                            operand.span,
                            format!("cannot negate {}", other.type_name()),
                        )),
                    },
                    UnaryOp::Not => {
                        let b = self.expect_bool(value, operand.span)?;
                        Ok(Value::Bool(!b))
                    }
                }
            }
            ExprKind::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs, expr.span),
            ExprKind::Call { callee, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(arg)?);
                }
                self.call_function(callee, values, expr.span)
            }
            ExprKind::Method {
                receiver,
                name,
                args,
            } => {
                let mut values = Vec::with_capacity(args.len() + 1);
                values.push(self.eval_expr(receiver)?);
                for arg in args {
                    values.push(self.eval_expr(arg)?);
                }
                self.call_function(name, values, expr.span)
            }
            ExprKind::Index { target, index } => {
                let target_value = self.eval_expr(target)?;
                let index_value = self.eval_expr(index)?;
                let items = match target_value {
                    Value::Array(items) => items,
                    other => {
                        return Err(self.fault(
                            target.span,
                            format!("cannot index {}", other.type_name()),
                        ))
                    }
                };
                let idx = match index_value {
                    Value::Int(v) if v >= 0 => v as usize,
                    Value::Int(v) => {
                        return Err(
                            self.fault(index.span, format!("negative index {} not allowed", v))
                        )
                    }
                    other => {
                        return Err(self.fault(
                            index.span,
                            format!("array index must be an int, got {}", other.type_name()),
                        ))
                    }
                };
                items.get(idx).cloned().ok_or_else(|| {
                    self.fault(
                        index.span,
                        format!("index {} out of bounds for array of length {}", idx, items.len()),
                    )
                })
            }
        }
    }

    fn eval_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> Result<Value, InterpError> {
        // && and || short-circuit, so the right side is not evaluated yet.
        if matches!(op, BinOp::And | BinOp::Or) {
            let left = self.eval_expr(lhs)?;
            let left = self.expect_bool(left, lhs.span)?;
            return match (op, left) {
                (BinOp::And, false) => Ok(Value::Bool(false)),
                (BinOp::Or, true) => Ok(Value::Bool(true)),
                _ => {
                    let right = self.eval_expr(rhs)?;
                    let right = self.expect_bool(right, rhs.span)?;
                    Ok(Value::Bool(right))
                }
            };
        }

        let left = self.eval_expr(lhs)?;
        let right = self.eval_expr(rhs)?;

        match op {
            BinOp::Add => match (&left, &right) {
                (Value::Str(a), Value::Str(b)) => {
                    self.charge(a.len() + b.len(), span)?;
                    Ok(Value::Str(format!("{}{}", a, b)))
                }
                _ => self.arith(op, &left, &right, span),
            },
            BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                self.arith(op, &left, &right, span)
            }
            BinOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
            BinOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let ord = match (&left, &right) {
                    (Value::Str(a), Value::Str(b)) => a.cmp(b),
                    _ => match (left.as_f64(), right.as_f64()) {
                        (Some(a), Some(b)) => {
                            a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
                        }
                        _ => {
                            return Err(self.fault(
                                span,
                                format!(
                                    "cannot compare {} and {} with '{}'",
                                    left.type_name(),
                                    right.type_name(),
                                    op.symbol()
                                ),
                            ))
                        }
                    },
                };
                let result = match op {
                    BinOp::Lt => ord == std::cmp::Ordering::Less,
                    BinOp::Le => ord != std::cmp::Ordering::Greater,
                    BinOp::Gt => ord == std::cmp::Ordering::Greater,
                    BinOp::Ge => ord != std::cmp::Ordering::Less,
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
            BinOp::And | BinOp::Or => unreachable!(),
        }
    }

    fn arith(
        &self,
        op: BinOp,
        left: &Value,
        right: &Value,
        span: Span,
    ) -> Result<Value, InterpError> {
        let type_err = || {
            self.fault(
                span,
                format!(
                    "operator '{}' cannot combine {} and {}",
                    op.symbol(),
                    left.type_name(),
                    right.type_name()
                ),
            )
        };

        if op == BinOp::Mod {
            return match (left, right) {
                (Value::Int(_), Value::Int(0)) => Err(self.fault(span, "division by zero")),
                (Value::Int(a), Value::Int(b)) => a
                    .checked_rem(*b)
                    .map(Value::Int)
                    .ok_or_else(|| self.fault(span, "integer overflow")),
                _ => Err(type_err()),
            };
        }

        let (a, b) = match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(type_err()),
        };

        if op == BinOp::Div {
            if b == 0.0 {
                return Err(self.fault(span, "division by zero"));
            }
            return Ok(Value::Float(a / b));
        }

        // Integer pairs stay integers for +, - and *.
        if let (Value::Int(ia), Value::Int(ib)) = (left, right) {
            let out = match op {
                BinOp::Add => ia.checked_add(*ib),
                BinOp::Sub => ia.checked_sub(*ib),
                BinOp::Mul => ia.checked_mul(*ib),
                _ => unreachable!(),
            };
            return match out {
                Some(v) => Ok(Value::Int(v)),
                None => Err(self.fault(span, "integer overflow")),
            };
        }

        let out = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            _ => unreachable!(),
        };
        Ok(Value::Float(out))
    }

    fn expect_bool(&self, value: Value, span: Span) -> Result<bool, InterpError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(self.fault(
                span,
                format!("condition must be true or false, got {}", other.type_name()),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Builtin dispatch
    // ------------------------------------------------------------------

    fn call_function(
        &mut self,
        name: &str,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, InterpError> {
        if let Err(group) = self.policy.check_function(name) {
            return Err(self.forbidden(
                span,
                format!(
                    "'{}' requires the '{}' capability, which is not enabled",
                    name,
                    group.module_name()
                ),
            ));
        }

        match name {
            // Core
            "show" => self.builtin_show(args, span),
            "len" => self.builtin_len(args, span),
            "str" => {
                let value = self.exactly_one(name, args, span)?;
                let rendered = value.render();
                self.charge(rendered.len(), span)?;
                Ok(Value::Str(rendered))
            }
            "num" => self.builtin_num(args, span),
            "range" => self.builtin_range(args, span),
            "push" => self.builtin_push(args, span),
            "concat" => self.builtin_concat(args, span),

            // Tabular
            "table" => self.builtin_table(args, span),
            "columns" => {
                let frame = self.one_table(name, args, span)?;
                Ok(Value::Array(
                    frame
                        .column_names()
                        .into_iter()
                        .map(|n| Value::Str(n.to_string()))
                        .collect(),
                ))
            }
            "row_count" => {
                let frame = self.one_table(name, args, span)?;
                Ok(Value::Int(frame.row_count() as i64))
            }
            "select" => self.builtin_select(args, span),
            "filter" => self.builtin_filter(args, span),
            "sort_by" => self.builtin_sort_by(args, span),
            "head" => self.builtin_head(args, span),
            "group_by" => self.builtin_group_by(args, span),
            "unique" => self.builtin_unique(args, span),
            "emit_table" => self.builtin_emit_table(args, span),

            // Numeric
            "mean" | "sum" | "min" | "max" | "median" | "std" => {
                self.builtin_aggregate(name, args, span)
            }
            "count" => self.builtin_count(args, span),
            "abs" => self.builtin_abs(args, span),
            "sqrt" => self.builtin_sqrt(args, span),
            "round" => self.builtin_round(args, span),

            // Plotting
            "bar_chart" => self.builtin_chart(ChartKind::Bar, args, span),
            "line_chart" => self.builtin_chart(ChartKind::Line, args, span),
            "histogram" => self.builtin_histogram(args, span),

            other => {
                if CapabilityGroup::of_function(other).is_some() {
                    // An allowed-by-configuration group that the sandbox
                    // still does not implement (fs, net, process).
                    Err(self.forbidden(
                        span,
                        format!("'{}' is not available in this sandbox", other),
                    ))
                } else {
                    Err(self.fault(span, format!("unknown function '{}'", other)))
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Argument helpers
    // ------------------------------------------------------------------

    fn arity(
        &self,
        name: &str,
        args: &[Value],
        expected: usize,
        span: Span,
    ) -> Result<(), InterpError> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(self.fault(
                span,
                format!(
                    "{}() takes {} argument{}, got {}",
                    name,
                    expected,
                    if expected == 1 { "" } else { "s" },
                    args.len()
                ),
            ))
        }
    }

    fn exactly_one(&self, name: &str, mut args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        self.arity(name, &args, 1, span)?;
        Ok(args.remove(0))
    }

    fn one_table(&self, name: &str, mut args: Vec<Value>, span: Span) -> Result<Frame, InterpError> {
        self.arity(name, &args, 1, span)?;
        match args.remove(0) {
            Value::Table(frame) => Ok(frame),
            other => Err(self.fault(
                span,
                format!("{}() needs a table, got {}", name, other.type_name()),
            )),
        }
    }

    fn take_table(&self, name: &str, arg: Value, span: Span) -> Result<Frame, InterpError> {
        match arg {
            Value::Table(frame) => Ok(frame),
            other => Err(self.fault(
                span,
                format!("{}() needs a table, got {}", name, other.type_name()),
            )),
        }
    }

    fn take_str(&self, name: &str, arg: Value, span: Span) -> Result<String, InterpError> {
        match arg {
            Value::Str(s) => Ok(s),
            other => Err(self.fault(
                span,
                format!("{}() needs a string here, got {}", name, other.type_name()),
            )),
        }
    }

    fn take_int(&self, name: &str, arg: Value, span: Span) -> Result<i64, InterpError> {
        match arg {
            Value::Int(v) => Ok(v),
            other => Err(self.fault(
                span,
                format!("{}() needs an int here, got {}", name, other.type_name()),
            )),
        }
    }

    fn take_cells(&self, name: &str, arg: Value, span: Span) -> Result<Vec<Cell>, InterpError> {
        let items = match arg {
            Value::Array(items) => items,
            other => {
                return Err(self.fault(
                    span,
                    format!("{}() needs an array, got {}", name, other.type_name()),
                ))
            }
        };
        items
            .iter()
            .map(value_to_cell)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|msg| self.fault(span, format!("{}(): {}", name, msg)))
    }

    fn numeric_args(&self, name: &str, arg: Value, span: Span) -> Result<Vec<f64>, InterpError> {
        let cells = self.take_cells(name, arg, span)?;
        frame::numeric_cells(&cells).map_err(|msg| self.fault(span, format!("{}(): {}", name, msg)))
    }

    // ------------------------------------------------------------------
    // Core builtins
    // ------------------------------------------------------------------

    fn builtin_show(&mut self, args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        let value = self.exactly_one("show", args, span)?;
        let rendered = value.render();
        if self.artifacts.output.len() + rendered.len() + 1 > self.limits.max_output_bytes {
            return Err(self.fault(
                span,
                format!(
                    "output exceeds the {} byte limit",
                    self.limits.max_output_bytes
                ),
            ));
        }
        self.artifacts.output.push_str(&rendered);
        self.artifacts.output.push('\n');
        Ok(Value::Unit)
    }

    fn builtin_len(&self, args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        let value = self.exactly_one("len", args, span)?;
        let len = match &value {
            Value::Array(items) => items.len(),
            Value::Str(s) => s.chars().count(),
            Value::Table(frame) => frame.row_count(),
            other => {
                return Err(self.fault(
                    span,
                    format!("len() needs an array, string or table, got {}", other.type_name()),
                ))
            }
        };
        Ok(Value::Int(len as i64))
    }

    fn builtin_num(&self, args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        let value = self.exactly_one("num", args, span)?;
        match value {
            Value::Int(_) | Value::Float(_) => Ok(value),
            Value::Str(s) => {
                let trimmed = s.trim();
                if let Ok(v) = trimmed.parse::<i64>() {
                    Ok(Value::Int(v))
                } else if let Ok(v) = trimmed.parse::<f64>() {
                    Ok(Value::Float(v))
                } else {
                    Err(self.fault(span, format!("cannot convert '{}' to a number", s)))
                }
            }
            other => Err(self.fault(
                span,
                format!("cannot convert {} to a number", other.type_name()),
            )),
        }
    }

    fn builtin_range(&self, args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        let (start, end) = match args.len() {
            1 => (0, self.take_int("range", args.into_iter().next().unwrap_or(Value::Unit), span)?),
            2 => {
                let mut it = args.into_iter();
                let a = self.take_int("range", it.next().unwrap_or(Value::Unit), span)?;
                let b = self.take_int("range", it.next().unwrap_or(Value::Unit), span)?;
                (a, b)
            }
            n => {
                return Err(self.fault(
                    span,
                    format!("range() takes 1 or 2 arguments, got {}", n),
                ))
            }
        };
        let count = end
            .checked_sub(start)
            .ok_or_else(|| self.fault(span, "integer overflow"))?
            .max(0);
        if count > MAX_RANGE_LEN {
            return Err(self.fault(
                span,
                format!("range of {} elements exceeds the {} element limit", count, MAX_RANGE_LEN),
            ));
        }
        Ok(Value::Array((start..end).map(Value::Int).collect()))
    }

    fn builtin_push(&mut self, mut args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        self.arity("push", &args, 2, span)?;
        let item = args.remove(1);
        match args.remove(0) {
            Value::Array(mut items) => {
                self.charge(value_size(&item), span)?;
                items.push(item);
                Ok(Value::Array(items))
            }
            other => Err(self.fault(
                span,
                format!("push() needs an array, got {}", other.type_name()),
            )),
        }
    }

    fn builtin_concat(&mut self, mut args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        self.arity("concat", &args, 2, span)?;
        let b = args.remove(1);
        let a = args.remove(0);
        match (a, b) {
            (Value::Array(mut x), Value::Array(y)) => {
                let bytes: usize = x.iter().chain(y.iter()).map(value_size).sum();
                self.charge(bytes, span)?;
                x.extend(y);
                Ok(Value::Array(x))
            }
            (Value::Str(x), Value::Str(y)) => {
                self.charge(x.len() + y.len(), span)?;
                Ok(Value::Str(format!("{}{}", x, y)))
            }
            (a, b) => Err(self.fault(
                span,
                format!(
                    "concat() needs two arrays or two strings, got {} and {}",
                    a.type_name(),
                    b.type_name()
                ),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Tabular builtins
    // ------------------------------------------------------------------

    fn builtin_table(&self, args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        let name = self.exactly_one("table", args, span)?;
        let name = self.take_str("table", name, span)?;
        match self.frames.get(&name) {
            Some(frame) => Ok(Value::Table(frame.clone())),
            None => {
                let available: Vec<&str> = self.frames.keys().map(String::as_str).collect();
                Err(self.fault(
                    span,
                    format!(
                        "unknown table '{}' (loaded: {})",
                        name,
                        if available.is_empty() {
                            "none".to_string()
                        } else {
                            available.join(", ")
                        }
                    ),
                ))
            }
        }
    }

    fn builtin_select(&self, mut args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        self.arity("select", &args, 2, span)?;
        let column = self.take_str("select", args.remove(1), span)?;
        let frame = self.take_table("select", args.remove(0), span)?;
        let cells = frame
            .select(&column)
            .map_err(|msg| self.fault(span, msg))?
            .cells();
        Ok(Value::Array(cells.into_iter().map(cell_to_value).collect()))
    }

    fn builtin_filter(&self, mut args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        self.arity("filter", &args, 4, span)?;
        let value = args.remove(3);
        let op = self.take_str("filter", args.remove(2), span)?;
        let column = self.take_str("filter", args.remove(1), span)?;
        let frame = self.take_table("filter", args.remove(0), span)?;
        let op = CmpOp::parse(&op).ok_or_else(|| {
            self.fault(
                span,
                format!(
                    "unknown operator '{}' (use ==, !=, <, <=, >, >= or contains)",
                    op
                ),
            )
        })?;
        let cell = value_to_cell(&value).map_err(|msg| self.fault(span, format!("filter(): {}", msg)))?;
        let filtered = frame
            .filter(&column, op, &cell)
            .map_err(|msg| self.fault(span, msg))?;
        Ok(Value::Table(filtered))
    }

    fn builtin_sort_by(&self, mut args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        let descending = match args.len() {
            2 => false,
            3 => match args.remove(2) {
                Value::Bool(b) => b,
                other => {
                    return Err(self.fault(
                        span,
                        format!(
                            "sort_by() third argument must be true or false, got {}",
                            other.type_name()
                        ),
                    ))
                }
            },
            n => {
                return Err(self.fault(
                    span,
                    format!("sort_by() takes 2 or 3 arguments, got {}", n),
                ))
            }
        };
        let column = self.take_str("sort_by", args.remove(1), span)?;
        let frame = self.take_table("sort_by", args.remove(0), span)?;
        let sorted = frame
            .sort_by(&column, descending)
            .map_err(|msg| self.fault(span, msg))?;
        Ok(Value::Table(sorted))
    }

    fn builtin_head(&self, mut args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        self.arity("head", &args, 2, span)?;
        let n = self.take_int("head", args.remove(1), span)?;
        let frame = self.take_table("head", args.remove(0), span)?;
        if n < 0 {
            return Err(self.fault(span, "head() needs a non-negative count"));
        }
        Ok(Value::Table(frame.head(n as usize)))
    }

    fn builtin_group_by(&self, mut args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        self.arity("group_by", &args, 4, span)?;
        let target = self.take_str("group_by", args.remove(3), span)?;
        let agg = self.take_str("group_by", args.remove(2), span)?;
        let key = self.take_str("group_by", args.remove(1), span)?;
        let frame = self.take_table("group_by", args.remove(0), span)?;
        let agg = Aggregate::parse(&agg).ok_or_else(|| {
            self.fault(
                span,
                format!(
                    "unknown aggregate '{}' (use sum, mean, count, min or max)",
                    agg
                ),
            )
        })?;
        let grouped = frame
            .group_by(&key, agg, &target)
            .map_err(|msg| self.fault(span, msg))?;
        Ok(Value::Table(grouped))
    }

    fn builtin_unique(&self, args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        let arg = self.exactly_one("unique", args, span)?;
        let cells = self.take_cells("unique", arg, span)?;
        let uniq = frame::unique_cells(&cells);
        Ok(Value::Array(uniq.into_iter().map(cell_to_value).collect()))
    }

    fn builtin_emit_table(&mut self, args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        let frame = self.one_table("emit_table", args, span)?;
        if self.artifacts.table.is_some() {
            return Err(self.fault(
                span,
                "a table was already emitted; emit_table() can be used once per run",
            ));
        }
        self.artifacts.table = Some(TableArtifact::from_frame(&frame, MAX_ARTIFACT_ROWS));
        Ok(Value::Table(frame))
    }

    // ------------------------------------------------------------------
    // Numeric builtins
    // ------------------------------------------------------------------

    fn builtin_aggregate(
        &self,
        name: &str,
        args: Vec<Value>,
        span: Span,
    ) -> Result<Value, InterpError> {
        let arg = self.exactly_one(name, args, span)?;
        let values = self.numeric_args(name, arg, span)?;
        if values.is_empty() {
            return Err(self.fault(span, format!("{}() of an empty column", name)));
        }
        let result = match name {
            "mean" => values.iter().sum::<f64>() / values.len() as f64,
            "sum" => values.iter().sum(),
            "min" => values.iter().copied().fold(f64::INFINITY, f64::min),
            "max" => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            "median" => {
                let mut sorted = values.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
            "std" => {
                if values.len() < 2 {
                    return Err(self.fault(span, "std() needs at least two values"));
                }
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                    / (values.len() - 1) as f64;
                var.sqrt()
            }
            _ => unreachable!(),
        };
        Ok(Value::Float(result))
    }

    fn builtin_count(&self, args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        let arg = self.exactly_one("count", args, span)?;
        let cells = self.take_cells("count", arg, span)?;
        let count = cells.iter().filter(|c| !c.is_null()).count();
        Ok(Value::Int(count as i64))
    }

    fn builtin_abs(&self, args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        let value = self.exactly_one("abs", args, span)?;
        match value {
            Value::Int(v) => Ok(Value::Int(v.abs())),
            Value::Float(v) => Ok(Value::Float(v.abs())),
            other => Err(self.fault(
                span,
                format!("abs() needs a number, got {}", other.type_name()),
            )),
        }
    }

    fn builtin_sqrt(&self, args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        let value = self.exactly_one("sqrt", args, span)?;
        match value.as_f64() {
            Some(v) if v < 0.0 => Err(self.fault(span, "sqrt() of a negative number")),
            Some(v) => Ok(Value::Float(v.sqrt())),
            None => Err(self.fault(
                span,
                format!("sqrt() needs a number, got {}", value.type_name()),
            )),
        }
    }

    fn builtin_round(&self, mut args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        let digits = match args.len() {
            1 => 0,
            2 => self.take_int("round", args.remove(1), span)?,
            n => {
                return Err(self.fault(
                    span,
                    format!("round() takes 1 or 2 arguments, got {}", n),
                ))
            }
        };
        if !(0..=12).contains(&digits) {
            return Err(self.fault(span, "round() digits must be between 0 and 12"));
        }
        let value = args.remove(0);
        match value {
            Value::Int(_) => Ok(value),
            Value::Float(v) => {
                let factor = 10f64.powi(digits as i32);
                Ok(Value::Float((v * factor).round() / factor))
            }
            other => Err(self.fault(
                span,
                format!("round() needs a number, got {}", other.type_name()),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Plotting builtins
    // ------------------------------------------------------------------

    fn check_no_plot(&self, span: Span) -> Result<(), InterpError> {
        if self.artifacts.plot.is_some() {
            Err(self.fault(
                span,
                "a chart was already rendered; only one chart per run",
            ))
        } else {
            Ok(())
        }
    }

    fn builtin_chart(
        &mut self,
        kind: ChartKind,
        mut args: Vec<Value>,
        span: Span,
    ) -> Result<Value, InterpError> {
        let name = match kind {
            ChartKind::Bar => "bar_chart",
            ChartKind::Line => "line_chart",
            ChartKind::Histogram => "histogram",
        };
        self.arity(name, &args, 3, span)?;
        self.check_no_plot(span)?;
        let title = self.take_str(name, args.remove(2), span)?;
        let series = self.numeric_args(name, args.remove(1), span)?;
        let labels = self.take_cells(name, args.remove(0), span)?;
        if labels.len() != series.len() {
            return Err(self.fault(
                span,
                format!(
                    "{}() labels and values have different lengths ({} vs {})",
                    name,
                    labels.len(),
                    series.len()
                ),
            ));
        }
        self.artifacts.plot = Some(PlotArtifact {
            kind,
            title,
            x: labels.iter().map(|c| c.to_string()).collect(),
            series,
        });
        Ok(Value::Unit)
    }

    fn builtin_histogram(&mut self, mut args: Vec<Value>, span: Span) -> Result<Value, InterpError> {
        self.arity("histogram", &args, 3, span)?;
        self.check_no_plot(span)?;
        let title = self.take_str("histogram", args.remove(2), span)?;
        let bins = self.take_int("histogram", args.remove(1), span)?;
        let values = self.numeric_args("histogram", args.remove(0), span)?;
        if bins < 1 {
            return Err(self.fault(span, "histogram() needs at least one bin"));
        }
        if bins > MAX_HISTOGRAM_BINS {
            return Err(self.fault(
                span,
                format!(
                    "histogram of {} bins exceeds the {} bin limit",
                    bins, MAX_HISTOGRAM_BINS
                ),
            ));
        }
        if values.is_empty() {
            return Err(self.fault(span, "histogram() of an empty column"));
        }
        let bins = bins as usize;
        let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let width = if hi > lo { (hi - lo) / bins as f64 } else { 1.0 };
        let mut counts = vec![0usize; bins];
        for v in &values {
            let mut idx = ((v - lo) / width) as usize;
            if idx >= bins {
                idx = bins - 1;
            }
            counts[idx] += 1;
        }
        let x = (0..bins)
            .map(|i| {
                format!(
                    "{}..{}",
                    fmt_short(lo + width * i as f64),
                    fmt_short(lo + width * (i + 1) as f64)
                )
            })
            .collect();
        self.artifacts.plot = Some(PlotArtifact {
            kind: ChartKind::Histogram,
            title,
            x,
            series: counts.into_iter().map(|c| c as f64).collect(),
        });
        Ok(Value::Unit)
    }
}

fn value_size(value: &Value) -> usize {
    let base = std::mem::size_of::<Value>();
    match value {
        Value::Str(s) => base + s.len(),
        Value::Array(items) => base + items.iter().map(value_size).sum::<usize>(),
        Value::Table(frame) => base + frame.row_count() * frame.columns().len() * 16,
        _ => base,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn value_to_cell(value: &Value) -> Result<Cell, String> {
    match value {
        Value::Null => Ok(Cell::Null),
        Value::Int(v) => Ok(Cell::Int(*v)),
        Value::Float(v) => Ok(Cell::Float(*v)),
        Value::Bool(v) => Ok(Cell::Bool(*v)),
        Value::Str(v) => Ok(Cell::Str(v.clone())),
        other => Err(format!("cannot use a {} here", other.type_name())),
    }
}

fn cell_to_value(cell: Cell) -> Value {
    match cell {
        Cell::Null => Value::Null,
        Cell::Int(v) => Value::Int(v),
        Cell::Float(v) => Value::Float(v),
        Cell::Bool(v) => Value::Bool(v),
        Cell::Str(v) => Value::Str(v),
    }
}

fn fmt_short(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e12 {
        format!("{}", v as i64)
    } else {
        let s = format!("{:.4}", v);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
