//! The self-correction loop.
//!
//! One orchestrator owns one session: its memory, its generation agents and
//! its executor. A question either routes to synthesis (answered from
//! history, no code) or enters the correction loop: generate a candidate,
//! execute it, and on failure hand the exact failing code and error back to
//! the generator, up to `max_retries + 1` attempts in total.
//!
//! Session memory is only touched once per question, with the fully
//! resolved turn. An error path (generation failure, cancellation) records
//! nothing at all.

use crate::config::AgentConfig;
use crate::errors::{AgentError, Result};
use crate::executor::SandboxedExecutor;
use crate::frame::Frame;
use crate::generate::{CodeGenerationAgent, SynthesisAgent};
use crate::llm::CompletionModel;
use crate::memory::{Attempt, SessionMemory, Turn};
use crate::outcome::{ExecutionOutcome, ExecutionSuccess};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Where a turn currently is, published on a watch channel for progress
/// display. `Idle` means no turn is in flight; `Succeeded` and
/// `ExhaustedFailed` are terminal for the turn that just finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Generating { attempt: u32 },
    Executing { attempt: u32 },
    Correcting { attempt: u32 },
    Succeeded,
    ExhaustedFailed,
}

impl TurnPhase {
    pub fn name(&self) -> &'static str {
        match self {
            TurnPhase::Idle => "idle",
            TurnPhase::Generating { .. } => "generating",
            TurnPhase::Executing { .. } => "executing",
            TurnPhase::Correcting { .. } => "correcting",
            TurnPhase::Succeeded => "succeeded",
            TurnPhase::ExhaustedFailed => "exhausted_failed",
        }
    }
}

/// Cooperative cancellation flag, checked before every generating
/// transition. Cancelling mid-turn aborts with nothing recorded. The flag
/// stays set until `reset`, so a cancelled session refuses further turns
/// until the caller clears it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives one analysis session end to end.
pub struct Orchestrator {
    config: AgentConfig,
    memory: SessionMemory,
    generator: CodeGenerationAgent,
    synthesizer: SynthesisAgent,
    executor: SandboxedExecutor,
    phase_tx: watch::Sender<TurnPhase>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn CompletionModel>, config: AgentConfig) -> Self {
        let executor =
            SandboxedExecutor::new(config.capabilities.clone(), config.budget.clone());
        let generator = CodeGenerationAgent::new(model.clone(), config.capabilities.clone());
        let synthesizer = SynthesisAgent::new(model);
        let memory = SessionMemory::with_passport_options(config.passport.clone());
        let (phase_tx, _) = watch::channel(TurnPhase::Idle);
        Self {
            config,
            memory,
            generator,
            synthesizer,
            executor,
            phase_tx,
            cancel: CancelToken::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn memory(&self) -> &SessionMemory {
        &self.memory
    }

    /// Register a dataset for this session. Ingestion and validation happen
    /// upstream; frames arriving here are already well formed.
    pub fn load_dataset(&mut self, frame: Frame) {
        self.memory.add_dataset(frame);
    }

    /// Subscribe to turn phase updates.
    pub fn phase_stream(&self) -> watch::Receiver<TurnPhase> {
        self.phase_tx.subscribe()
    }

    /// Handle for cancelling the in-flight turn from another task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Resolve one user question. On `Ok` the returned turn has already been
    /// recorded in session memory; on `Err` nothing was recorded.
    pub async fn handle_question(&mut self, question: &str) -> Result<Turn> {
        if self.is_synthesis_question(question) {
            return self.synthesize_turn(question).await;
        }
        let result = self.correction_loop(question).await;
        if result.is_err() {
            self.set_phase(TurnPhase::Idle);
        }
        result
    }

    // ========================================================================
    // ROUTING
    // ========================================================================

    fn is_synthesis_question(&self, question: &str) -> bool {
        let lowered = question.to_lowercase();
        self.config
            .synthesis_keywords
            .iter()
            .any(|keyword| lowered.contains(&keyword.to_lowercase()))
    }

    /// Answer a recap question from history alone. The phase stream never
    /// leaves `Idle` here: no code is generated or executed.
    async fn synthesize_turn(&mut self, question: &str) -> Result<Turn> {
        self.check_cancelled()?;
        info!("Routing {:?} to synthesis", question);
        let answer = if self.memory.turns().is_empty() {
            "No analysis has been performed yet to draw a conclusion from.".to_string()
        } else {
            self.synthesizer
                .synthesize(question, &self.memory.history_summary())
                .await?
        };
        let turn = Turn::new(question, Vec::new(), answer);
        self.memory.record_turn(turn.clone());
        Ok(turn)
    }

    // ========================================================================
    // CORRECTION LOOP
    // ========================================================================

    async fn correction_loop(&mut self, question: &str) -> Result<Turn> {
        let max_attempts = self.config.max_attempts();
        let passport = self.memory.current_passport().clone();
        let history = self.memory.history_summary();
        let mut attempts: Vec<Attempt> = Vec::new();

        self.check_cancelled()?;
        self.set_phase(TurnPhase::Generating { attempt: 1 });
        let mut code = self
            .generator
            .generate(question, &passport, &history, None)
            .await?;

        let mut attempt = 1u32;
        loop {
            self.set_phase(TurnPhase::Executing { attempt });
            info!(
                "Executing attempt {}/{} for {:?}",
                attempt, max_attempts, question
            );
            let outcome = self
                .executor
                .execute(code.as_str(), self.memory.datasets())
                .await;

            match outcome {
                ExecutionOutcome::Success(success) => {
                    attempts.push(Attempt {
                        code: code.as_str().to_string(),
                        outcome: ExecutionOutcome::Success(success.clone()),
                    });
                    info!("Attempt {}/{} succeeded", attempt, max_attempts);
                    self.set_phase(TurnPhase::Succeeded);
                    let turn = Turn::new(question, attempts, render_answer(&success));
                    self.memory.record_turn(turn.clone());
                    return Ok(turn);
                }
                ExecutionOutcome::Failure(failure) => {
                    warn!(
                        "Attempt {}/{} failed: {}",
                        attempt,
                        max_attempts,
                        failure.detail()
                    );
                    attempts.push(Attempt {
                        code: code.as_str().to_string(),
                        outcome: ExecutionOutcome::Failure(failure.clone()),
                    });

                    if attempt >= max_attempts {
                        self.set_phase(TurnPhase::ExhaustedFailed);
                        let answer = format!(
                            "The agent could not fix its own code after {} attempts. Final error: {}",
                            max_attempts,
                            failure.detail()
                        );
                        let turn = Turn::new(question, attempts, answer);
                        self.memory.record_turn(turn.clone());
                        return Ok(turn);
                    }

                    self.set_phase(TurnPhase::Correcting { attempt });
                    self.check_cancelled()?;
                    attempt += 1;
                    self.set_phase(TurnPhase::Generating { attempt });
                    code = self
                        .generator
                        .generate(question, &passport, &history, Some(&failure))
                        .await?;
                }
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!("Turn cancelled, nothing recorded");
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    fn set_phase(&self, phase: TurnPhase) {
        self.phase_tx.send_replace(phase);
    }
}

/// User-visible answer for a successful execution.
fn render_answer(success: &ExecutionSuccess) -> String {
    if let Some(text) = &success.text {
        return text.trim_end().to_string();
    }
    let mut parts = Vec::new();
    if let Some(table) = &success.table {
        parts.push(format!(
            "Returned table '{}' ({} rows).",
            table.name,
            table.rows.len()
        ));
    }
    if let Some(plot) = &success.plot {
        parts.push(format!("Rendered chart '{}'.", plot.title));
    }
    if parts.is_empty() {
        "The analysis ran but produced no output.".to_string()
    } else {
        parts.join(" ")
    }
}

// ============================================================================
// Tests
// ============================================================================
