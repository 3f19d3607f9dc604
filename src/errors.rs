use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that terminate the current operation instead of feeding the
/// correction loop. Failures of candidate code are not errors; they are
/// classified in [`crate::outcome::ExecutionOutcome`].
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Dataset '{name}' is malformed: {reason}")]
    MalformedDataset { name: String, reason: String },

    #[error("Code generation failed: {0}")]
    Generation(String),

    #[error("Turn cancelled before completion")]
    Cancelled,
}

impl AgentError {
    pub fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        AgentError::MalformedDataset {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
