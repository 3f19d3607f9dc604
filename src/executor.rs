//! Sandboxed execution of candidate scripts.
//!
//! The executor never returns an `Err`: every way a candidate can go wrong
//! is folded into `ExecutionOutcome::Failure` so the correction loop can
//! treat generation bugs, capability violations and timeouts uniformly.
//!
//! A run goes through four stages:
//!   1. Parse. Syntax errors become `RuntimeFault` without running anything.
//!   2. Static capability scan over the AST. A denied import or call refuses
//!      the candidate before a single statement executes.
//!   3. Interpretation on a blocking thread against cloned working copies of
//!      the session datasets, metered by step fuel, a wall-clock deadline,
//!      an output byte cap and an allocation budget.
//!   4. Classification of the result into the outcome type.

use crate::analyzer;
use crate::config::ExecutionBudget;
use crate::frame::Frame;
use crate::lang::interp::{InterpError, Interpreter, RunLimits};
use crate::lang::parse;
use crate::outcome::{ExecutionOutcome, ExecutionSuccess, FailureKind};
use crate::policy::CapabilityPolicy;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Extra wall-clock slack the host-side timeout grants the interpreter, so
/// the cooperative deadline inside the run normally fires first and the
/// blocking thread exits cleanly.
const HOST_TIMEOUT_GRACE: Duration = Duration::from_millis(250);

/// Runs candidate code under a capability policy and an execution budget.
///
/// The executor is stateless between runs; datasets are passed per call and
/// cloned before interpretation, so a run can never mutate session state no
/// matter how it ends.
#[derive(Debug, Clone)]
pub struct SandboxedExecutor {
    policy: CapabilityPolicy,
    budget: ExecutionBudget,
}

impl SandboxedExecutor {
    pub fn new(policy: CapabilityPolicy, budget: ExecutionBudget) -> Self {
        Self { policy, budget }
    }

    pub fn policy(&self) -> &CapabilityPolicy {
        &self.policy
    }

    pub fn budget(&self) -> &ExecutionBudget {
        &self.budget
    }

    /// Execute one candidate against working copies of `datasets`.
    pub async fn execute(
        &self,
        code: &str,
        datasets: &BTreeMap<String, Frame>,
    ) -> ExecutionOutcome {
        debug!(
            "[SANDBOX] Executing candidate ({} bytes, capabilities: {})",
            code.len(),
            self.policy.describe_allowed()
        );

        let program = match parse(code) {
            Ok(program) => program,
            Err(message) => {
                warn!("[SANDBOX] Candidate rejected by parser: {}", message);
                return ExecutionOutcome::failure(
                    FailureKind::RuntimeFault,
                    format!("syntax error: {}", message),
                    code,
                );
            }
        };

        let violations = analyzer::scan(code, &program, &self.policy);
        if let Some(first) = violations.first() {
            warn!(
                "[SANDBOX] Capability scan refused candidate ({} violation{}): line {}: {}",
                violations.len(),
                if violations.len() == 1 { "" } else { "s" },
                first.line,
                first.message
            );
            return ExecutionOutcome::failure(
                FailureKind::ForbiddenCapability,
                format!("line {}: {}", first.line, first.message),
                code,
            );
        }

        let limits = RunLimits {
            max_steps: self.budget.max_steps,
            max_output_bytes: self.budget.max_output_bytes,
            max_alloc_bytes: self.budget.max_alloc_bytes,
            deadline: Some(Instant::now() + self.budget.timeout()),
        };
        let policy = self.policy.clone();
        let source = code.to_string();
        let frames = datasets.clone();

        let task = tokio::task::spawn_blocking(move || {
            let interp = Interpreter::new(&source, &frames, &policy, limits);
            interp.run(&program)
        });

        let result = match tokio::time::timeout(self.budget.timeout() + HOST_TIMEOUT_GRACE, task)
            .await
        {
            Ok(joined) => joined,
            Err(_) => {
                // The cooperative deadline did not fire in time. The blocking
                // thread is left to notice it at its next poll; nothing it
                // does can reach session state.
                warn!(
                    "[SANDBOX] Candidate exceeded the {}s time budget",
                    self.budget.timeout_secs
                );
                return ExecutionOutcome::failure(
                    FailureKind::Timeout,
                    format!(
                        "execution exceeded the {}s time budget",
                        self.budget.timeout_secs
                    ),
                    code,
                );
            }
        };

        let run = match result {
            Ok(run) => run,
            Err(join_err) => {
                error!("[SANDBOX] Execution thread failed: {}", join_err);
                return ExecutionOutcome::failure(
                    FailureKind::RuntimeFault,
                    format!("internal execution error: {}", join_err),
                    code,
                );
            }
        };

        match run {
            Ok(artifacts) => {
                debug!(
                    "[SANDBOX] Candidate succeeded (output: {} bytes, table: {}, plot: {})",
                    artifacts.output.len(),
                    artifacts.table.is_some(),
                    artifacts.plot.is_some()
                );
                let text = if artifacts.output.is_empty() {
                    None
                } else {
                    Some(artifacts.output)
                };
                ExecutionOutcome::Success(ExecutionSuccess {
                    text,
                    table: artifacts.table,
                    plot: artifacts.plot,
                })
            }
            Err(InterpError::Forbidden(message)) => {
                warn!("[SANDBOX] Candidate refused at runtime: {}", message);
                ExecutionOutcome::failure(FailureKind::ForbiddenCapability, message, code)
            }
            Err(InterpError::StepLimit) => {
                warn!(
                    "[SANDBOX] Candidate exceeded the {} step budget",
                    self.budget.max_steps
                );
                ExecutionOutcome::failure(
                    FailureKind::Timeout,
                    format!("execution exceeded the {} step budget", self.budget.max_steps),
                    code,
                )
            }
            Err(InterpError::DeadlineExceeded) => {
                warn!(
                    "[SANDBOX] Candidate exceeded the {}s time budget",
                    self.budget.timeout_secs
                );
                ExecutionOutcome::failure(
                    FailureKind::Timeout,
                    format!(
                        "execution exceeded the {}s time budget",
                        self.budget.timeout_secs
                    ),
                    code,
                )
            }
            Err(InterpError::Fault(message)) => {
                debug!("[SANDBOX] Candidate faulted: {}", message);
                ExecutionOutcome::failure(FailureKind::RuntimeFault, message, code)
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
    use crate::frame::Column;

    fn sales_frames() -> BTreeMap<String, Frame> {
        let frame = Frame::new(
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
        .unwrap();
        let mut frames = BTreeMap::new();
        frames.insert(frame.name().to_string(), frame);
        frames
    }

    fn executor() -> SandboxedExecutor {
        SandboxedExecutor::new(
            CapabilityPolicy::analysis_default(),
            ExecutionBudget::default(),
        )
    }

    #[tokio::test]
    async fn successful_run_yields_text() {
        let outcome = executor()
            .execute(
                "show(mean(select(table(\"sales\"), \"amount\")))",
                &sales_frames(),
            )
            .await;
        let success = outcome.as_success().expect("should succeed");
        assert_eq!(success.text.as_deref(), Some("20\n"));
        assert!(success.table.is_none());
        assert!(success.plot.is_none());
    }

    #[tokio::test]
    async fn syntax_error_is_a_runtime_fault() {
        let outcome = executor().execute("let = 3", &sales_frames()).await;
        let failure = outcome.as_failure().expect("should fail");
        assert_eq!(failure.kind, FailureKind::RuntimeFault);
        assert!(failure.message.starts_with("syntax error:"));
        assert_eq!(failure.offending_code, "let = 3");
    }

    #[tokio::test]
    async fn deeply_nested_candidate_is_rejected_by_the_parser() {
        let code = format!("show({}1{})", "(".repeat(50_000), ")".repeat(50_000));
        let outcome = executor().execute(&code, &sales_frames()).await;
        let failure = outcome.as_failure().expect("should fail");
        assert_eq!(failure.kind, FailureKind::RuntimeFault);
        assert!(failure.message.contains("nested deeper"));
    }

    #[tokio::test]
    async fn forbidden_call_is_refused_before_execution() {
        // The show on line 1 must not run: a refusal carries no artifacts.
        let code = "show(1)\nfetch(\"http://example.com\")";
        let outcome = executor().execute(code, &sales_frames()).await;
        let failure = outcome.as_failure().expect("should be refused");
        assert_eq!(failure.kind, FailureKind::ForbiddenCapability);
        assert!(failure.message.contains("line 2"));
        assert!(failure.message.contains("'fetch'"));
        assert_eq!(failure.offending_code, code);
    }

    #[tokio::test]
    async fn step_budget_exhaustion_is_a_timeout() {
        let budget = ExecutionBudget {
            max_steps: 100,
            ..ExecutionBudget::default()
        };
        let executor = SandboxedExecutor::new(CapabilityPolicy::analysis_default(), budget);
        let outcome = executor
            .execute("for i in range(100000) { let x = i }", &sales_frames())
            .await;
        let failure = outcome.as_failure().expect("should time out");
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.message.contains("step budget"));
    }

    #[tokio::test]
    async fn wall_clock_exhaustion_is_a_timeout() {
        let budget = ExecutionBudget {
            timeout_secs: 0,
            ..ExecutionBudget::default()
        };
        let executor = SandboxedExecutor::new(CapabilityPolicy::analysis_default(), budget);
        let outcome = executor
            .execute("for i in range(100000) { let x = i }", &sales_frames())
            .await;
        let failure = outcome.as_failure().expect("should time out");
        assert_eq!(failure.kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn runtime_fault_carries_the_offending_code() {
        let code = "show(mean(select(table(\"sales\"), \"amnt\")))";
        let outcome = executor().execute(code, &sales_frames()).await;
        let failure = outcome.as_failure().expect("should fault");
        assert_eq!(failure.kind, FailureKind::RuntimeFault);
        assert!(failure.message.contains("unknown column 'amnt'"));
        assert_eq!(failure.offending_code, code);
    }

    #[tokio::test]
    async fn reruns_are_idempotent_and_leave_datasets_alone() {
        let frames = sales_frames();
        let code = "emit_table(sort_by(table(\"sales\"), \"amount\", true))";
        let executor = executor();
        let first = executor.execute(code, &frames).await;
        let second = executor.execute(code, &frames).await;
        assert_eq!(first, second);
        // Source data still has its original row order.
        assert_eq!(
            frames["sales"].column("amount").unwrap().cell(0),
            crate::frame::Cell::Float(10.0)
        );
    }

    #[tokio::test]
    async fn empty_program_succeeds_with_no_artifacts() {
        let outcome = executor().execute("", &sales_frames()).await;
        let success = outcome.as_success().expect("should succeed");
        assert!(success.is_empty());
    }
}
