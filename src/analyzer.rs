//! Static capability scan of parsed candidate code.
//!
//! Runs after parsing and before interpretation. Walking the AST up front
//! means a denied import or call is refused without executing any part of
//! the candidate, so a script that mixes `fetch(...)` with table work cannot
//! get the table work in before the refusal.
//!
//! The scan is conservative about names: every call to an identifier owned
//! by a denied capability group is flagged, even where a runtime value could
//! shadow it. Candidates have no reason to shadow builtin names, and a false
//! refusal feeds the correction loop like any other failure.

use crate::lang::ast::{Expr, ExprKind, Program, Stmt, StmtKind};
use crate::lang::lexer::line_of;
use crate::policy::{CapabilityGroup, CapabilityPolicy};

/// One reason the scan refuses a program.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    /// 1-based source line
    pub line: usize,
    pub message: String,
}

/// Walk `program` and report every capability violation in source order.
pub fn scan(source: &str, program: &Program, policy: &CapabilityPolicy) -> Vec<Violation> {
    let mut scanner = Scanner {
        source,
        policy,
        violations: Vec::new(),
    };
    for stmt in &program.stmts {
        scanner.stmt(stmt);
    }
    scanner.violations
}

struct Scanner<'a> {
    source: &'a str,
    policy: &'a CapabilityPolicy,
    violations: Vec<Violation>,
}

impl Scanner<'_> {
    fn push(&mut self, offset: usize, message: String) {
        self.violations.push(Violation {
            line: line_of(self.source, offset),
            message,
        });
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Import { module } => match CapabilityGroup::from_module(module) {
                None => self.push(
                    stmt.span.start,
                    format!("import of '{}' is not permitted", module),
                ),
                Some(group) if !self.policy.is_allowed(group) => self.push(
                    stmt.span.start,
                    format!(
                        "import of '{}' requires the '{}' capability, which is not enabled",
                        module,
                        group.module_name()
                    ),
                ),
                Some(_) => {}
            },
            StmtKind::Let { value, .. } | StmtKind::Assign { value, .. } => self.expr(value),
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                self.expr(cond);
                self.stmts(then_body);
                if let Some(else_body) = else_body {
                    self.stmts(else_body);
                }
            }
            StmtKind::For { iterable, body, .. } => {
                self.expr(iterable);
                self.stmts(body);
            }
            StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Expr(expr) => self.expr(expr),
        }
    }

    fn stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Call { callee, args } => {
                self.callee(callee, expr);
                for arg in args {
                    self.expr(arg);
                }
            }
            ExprKind::Method {
                receiver,
                name,
                args,
            } => {
                self.callee(name, expr);
                self.expr(receiver);
                for arg in args {
                    self.expr(arg);
                }
            }
            ExprKind::Array(items) => {
                for item in items {
                    self.expr(item);
                }
            }
            ExprKind::Unary { operand, .. } => self.expr(operand),
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            ExprKind::Index { target, index } => {
                self.expr(target);
                self.expr(index);
            }
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Bool(_)
            | ExprKind::Str(_)
            | ExprKind::Ident(_) => {}
        }
    }

    fn callee(&mut self, name: &str, expr: &Expr) {
        if let Some(group) = CapabilityGroup::of_function(name) {
            if !self.policy.is_allowed(group) {
                self.push(
                    expr.span.start,
                    format!(
                        "call to '{}' requires the '{}' capability, which is not enabled",
                        name,
                        group.module_name()
                    ),
                );
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parse;

    fn scan_source(source: &str, policy: &CapabilityPolicy) -> Vec<Violation> {
        let program = parse(source).unwrap();
        scan(source, &program, policy)
    }

    #[test]
    fn clean_analysis_code_passes() {
        let policy = CapabilityPolicy::analysis_default();
        let source = "import tabular\nlet t = table(\"sales\")\nshow(mean(select(t, \"amount\")))";
        assert!(scan_source(source, &policy).is_empty());
    }

    #[test]
    fn denied_import_is_flagged_with_its_line() {
        let policy = CapabilityPolicy::analysis_default();
        let violations = scan_source("let x = 1\nimport net", &policy);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 2);
        assert!(violations[0].message.contains("'net' capability"));
    }

    #[test]
    fn unknown_import_is_flagged() {
        let policy = CapabilityPolicy::analysis_default();
        let violations = scan_source("import pandas", &policy);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("import of 'pandas' is not permitted"));
    }

    #[test]
    fn filesystem_call_is_flagged_before_execution() {
        let policy = CapabilityPolicy::analysis_default();
        let violations = scan_source("let data = read_file(\"/etc/passwd\")", &policy);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("'read_file'"));
        assert!(violations[0].message.contains("'fs' capability"));
    }

    #[test]
    fn denied_calls_inside_nested_expressions_are_found() {
        let policy = CapabilityPolicy::analysis_default();
        let source = "if len(fetch(\"http://example.com\")) > 0 {\n  show(1)\n}";
        let violations = scan_source(source, &policy);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("'fetch'"));
    }

    #[test]
    fn method_sugar_is_scanned_like_a_call() {
        let policy = CapabilityPolicy::analysis_default();
        let violations = scan_source("table(\"sales\").shell(\"rm -rf /\")", &policy);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("'shell'"));
        assert!(violations[0].message.contains("'process' capability"));
    }

    #[test]
    fn violations_come_back_in_source_order() {
        let policy = CapabilityPolicy::analysis_default();
        let source = "import fs\nlet x = http_get(\"u\")\nexec(\"ls\")";
        let violations = scan_source(source, &policy);
        let lines: Vec<usize> = violations.iter().map(|v| v.line).collect();
        assert_eq!(lines, vec![1, 2, 3]);
    }

    #[test]
    fn tightened_policy_flags_plotting() {
        let policy = CapabilityPolicy::no_plotting();
        let violations = scan_source("bar_chart([\"a\"], [1], \"t\")", &policy);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("'charts' capability"));
    }

    #[test]
    fn core_builtins_are_never_flagged() {
        let policy = CapabilityPolicy::locked_down();
        let source = "let a = range(3)\nshow(len(a))\nshow(str(2))";
        assert!(scan_source(source, &policy).is_empty());
    }
}
