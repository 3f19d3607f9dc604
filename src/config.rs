use crate::policy::CapabilityPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource budget applied to a single execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionBudget {
    /// Wall-clock timeout in seconds
    pub timeout_secs: u64,
    /// Interpreter step fuel; one unit per evaluated statement or expression
    pub max_steps: u64,
    /// Cap on accumulated textual output in bytes
    pub max_output_bytes: usize,
    /// Cap on bytes allocated by value-growing operations
    pub max_alloc_bytes: usize,
}

impl Default for ExecutionBudget {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_steps: 500_000,
            max_output_bytes: 64 * 1024,
            max_alloc_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ExecutionBudget {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Sampling and truncation knobs for the data passport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassportOptions {
    /// Sample values listed per column
    pub sample_rows: usize,
    /// Truncation length for a single sample value
    pub max_value_chars: usize,
    /// Columns described per dataset before the rest are elided
    pub max_columns: usize,
}

impl Default for PassportOptions {
    fn default() -> Self {
        Self {
            sample_rows: 3,
            max_value_chars: 24,
            max_columns: 40,
        }
    }
}

/// Configuration for the self-correction agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Correction attempts allowed after the first try. A turn therefore
    /// executes at most `max_retries + 1` candidates.
    pub max_retries: u32,
    /// Per-attempt execution budget
    pub budget: ExecutionBudget,
    /// Capability allow-list enforced by the sandbox
    pub capabilities: CapabilityPolicy,
    /// Questions containing any of these (case-insensitive) are answered
    /// from conversation history instead of generated code
    pub synthesis_keywords: Vec<String>,
    /// Passport sampling options
    pub passport: PassportOptions,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            budget: ExecutionBudget::default(),
            capabilities: CapabilityPolicy::default(),
            synthesis_keywords: [
                "summarize",
                "summary",
                "conclusion",
                "conclusions",
                "recap",
                "key findings",
                "what did we learn",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            passport: PassportOptions::default(),
        }
    }
}

impl AgentConfig {
    /// Total candidate executions a turn may perform.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.budget.timeout_secs = secs;
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityPolicy) -> Self {
        self.capabilities = capabilities;
        self
    }
}
