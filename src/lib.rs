//! Conversational tabular data analysis driven by LLM-generated code.
//!
//! The crate's core is a sandboxed execution and self-correction loop: a
//! model writes a small analysis script grounded in a "data passport" of
//! the loaded datasets, a capability-restricted interpreter runs it, and
//! failures are classified and fed back to the model for a bounded number
//! of correction attempts. Session memory keeps datasets and resolved
//! turns consistent across questions.
//!
//! ```no_run
//! use datachat::{AgentConfig, Column, Frame, HttpCompletionModel, Orchestrator};
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let model = Arc::new(HttpCompletionModel::new(
//!     "https://api.openai.com",
//!     std::env::var("OPENAI_API_KEY").ok(),
//!     "gpt-4o-mini",
//! )?);
//! let mut agent = Orchestrator::new(model, AgentConfig::default());
//! agent.load_dataset(Frame::new(
//!     "sales",
//!     vec![Column::floats("amount", vec![Some(10.0), Some(20.0)])],
//! )?);
//!
//! let turn = agent.handle_question("What is the mean amount?").await?;
//! println!("{}", turn.answer);
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod config;
pub mod errors;
pub mod executor;
pub mod frame;
pub mod generate;
pub mod lang;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod outcome;
pub mod passport;
pub mod policy;

pub use config::{AgentConfig, ExecutionBudget, PassportOptions};
pub use errors::{AgentError, Result};
pub use executor::SandboxedExecutor;
pub use frame::{Cell, Column, Dtype, Frame};
pub use generate::{CandidateCode, CodeGenerationAgent, SynthesisAgent};
pub use llm::{CompletionModel, HttpCompletionModel};
pub use memory::{Attempt, SessionMemory, Turn};
pub use orchestrator::{CancelToken, Orchestrator, TurnPhase};
pub use outcome::{
    ChartKind, ExecutionFailure, ExecutionOutcome, ExecutionSuccess, FailureKind, PlotArtifact,
    TableArtifact,
};
pub use passport::DataPassport;
pub use policy::{CapabilityGroup, CapabilityPolicy};
