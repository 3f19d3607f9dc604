//! Prompt construction and candidate generation.
//!
//! Two agents live here. `CodeGenerationAgent` turns a question into a
//! script for the sandbox, or a failed script plus its error into a
//! corrected one. `SynthesisAgent` answers recap questions from the session
//! history without generating any code.
//!
//! Prompts follow the capability policy: a builtin group the sandbox would
//! refuse is never advertised to the model.

use crate::errors::{AgentError, Result};
use crate::llm::CompletionModel;
use crate::outcome::ExecutionFailure;
use crate::passport::DataPassport;
use crate::policy::CapabilityPolicy;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// One attempt's generated script. Opaque text, never edited after creation;
/// a correction produces a new candidate instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateCode(String);

impl CandidateCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CandidateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates candidate scripts through a `CompletionModel`.
pub struct CodeGenerationAgent {
    model: Arc<dyn CompletionModel>,
    policy: CapabilityPolicy,
}

impl CodeGenerationAgent {
    pub fn new(model: Arc<dyn CompletionModel>, policy: CapabilityPolicy) -> Self {
        Self { model, policy }
    }

    /// Produce a candidate for `question`. With a `prior_failure` the prompt
    /// carries the exact failing code and error detail, so the correction is
    /// informed rather than a blind re-guess.
    pub async fn generate(
        &self,
        question: &str,
        passport: &DataPassport,
        history: &str,
        prior_failure: Option<&ExecutionFailure>,
    ) -> Result<CandidateCode> {
        let (system, user) = match prior_failure {
            None => (
                self.initial_prompt(passport, history),
                format!("User question: \"{}\"", question),
            ),
            Some(failure) => (
                self.correction_prompt(failure),
                "Fix the code.".to_string(),
            ),
        };

        debug!(
            "Requesting candidate (correction: {}, question: {:?})",
            prior_failure.is_some(),
            question
        );
        let raw = self
            .model
            .complete(&system, &user)
            .await
            .map_err(|e| AgentError::Generation(e.to_string()))?;

        let code = strip_code_fence(&raw);
        if code.is_empty() {
            return Err(AgentError::Generation(
                "model returned an empty candidate".to_string(),
            ));
        }
        Ok(CandidateCode::new(code))
    }

    fn initial_prompt(&self, passport: &DataPassport, history: &str) -> String {
        format!(
            "You are a data analysis agent. Answer the user's question by writing a \
             short script in the analysis language below. Respond with code only, no \
             explanations and no markdown fences.\n\
             \n\
             Language rules:\n\
             - One statement per line. `let x = ...` declares, `x = ...` reassigns.\n\
             - `if cond {{ ... }} else {{ ... }}`, `for x in array {{ ... }}`, `break`, `continue`.\n\
             - Strings use double quotes. `#` starts a comment.\n\
             - `show(value)` prints one result line; call it for every answer you produce.\n\
             - Method form `t.select(\"col\")` is the same as `select(t, \"col\")`.\n\
             \n\
             {}\n\
             Any other function or import fails. Use `emit_table(t)` to return a table \
             and one of the chart functions to render a chart; at most one table and one \
             chart per script.\n\
             \n\
             Loaded data:\n\
             {}\n\
             \n\
             Session history:\n\
             {}\n",
            self.describe_builtins(),
            passport.render(),
            history
        )
    }

    fn correction_prompt(&self, failure: &ExecutionFailure) -> String {
        format!(
            "You are debugging a script you wrote in a small analysis language. The \
             previous attempt failed. Analyze the error, fix the root cause and respond \
             with the complete corrected script only, no explanations and no markdown \
             fences. Keep to the same language rules as before; only these function \
             groups are available: {}.\n\
             \n\
             Failing code:\n\
             ```\n\
             {}\n\
             ```\n\
             \n\
             Error:\n\
             ```\n\
             {}\n\
             ```\n",
            self.available_groups(),
            failure.offending_code,
            failure.detail()
        )
    }

    /// One line per allowed builtin group, plus the always-available core.
    fn describe_builtins(&self) -> String {
        let mut lines = vec![
            "Available functions:".to_string(),
            "- core: show, len, str, num, range, push, concat".to_string(),
        ];
        for group in self.policy.allowed_groups() {
            lines.push(format!(
                "- {} ({}): {}",
                group.module_name(),
                group.description(),
                group.builtins().join(", ")
            ));
        }
        lines.join("\n")
    }

    fn available_groups(&self) -> String {
        let mut groups = vec!["core".to_string()];
        groups.extend(self.policy.allowed_groups().map(|g| g.module_name().to_string()));
        groups.join(", ")
    }
}

/// Answers recap questions from the conversation history alone.
pub struct SynthesisAgent {
    model: Arc<dyn CompletionModel>,
}

impl SynthesisAgent {
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self { model }
    }

    pub async fn synthesize(&self, question: &str, history: &str) -> Result<String> {
        let system = format!(
            "You are a data scientist. Based on the analysis history of this session, \
             answer the user's request with a concise conclusion in plain prose.\n\
             \n\
             Analysis history:\n\
             {}\n",
            history
        );
        let answer = self
            .model
            .complete(&system, question)
            .await
            .map_err(|e| AgentError::Generation(e.to_string()))?;
        let answer = answer.trim().to_string();
        if answer.is_empty() {
            return Err(AgentError::Generation(
                "model returned an empty conclusion".to_string(),
            ));
        }
        Ok(answer)
    }
}

/// Remove a surrounding markdown fence, tolerating a language tag after the
/// opening backticks. Models add these no matter how firmly told not to.
fn strip_code_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim().to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PassportOptions;
    use crate::frame::{Column, Frame};
    use crate::outcome::FailureKind;
    use crate::passport;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Model that replies with a fixed string and records every prompt.
    struct FixedModel {
        reply: String,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl FixedModel {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn prompts(&self) -> Vec<(String, String)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionModel for FixedModel {
        async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String> {
            self.seen
                .lock()
                .unwrap()
                .push((system.to_string(), user.to_string()));
            Ok(self.reply.clone())
        }
    }

    fn sales_passport() -> DataPassport {
        let frame = Frame::new(
            "sales",
            vec![Column::floats("amount", vec![Some(1.0), Some(2.0)])],
        )
        .unwrap();
        passport::build([&frame], &PassportOptions::default())
    }

    #[test]
    fn fence_stripping_handles_the_usual_shapes() {
        assert_eq!(strip_code_fence("show(1)"), "show(1)");
        assert_eq!(strip_code_fence("```\nshow(1)\n```"), "show(1)");
        assert_eq!(strip_code_fence("```datachat\nshow(1)\n```"), "show(1)");
        assert_eq!(strip_code_fence("  ```\nshow(1)\n```  "), "show(1)");
        assert_eq!(strip_code_fence("```python\nshow(1)"), "show(1)");
    }

    #[tokio::test]
    async fn initial_prompt_grounds_on_passport_and_question() {
        let model = Arc::new(FixedModel::new("```\nshow(1)\n```"));
        let agent = CodeGenerationAgent::new(model.clone(), CapabilityPolicy::analysis_default());
        let code = agent
            .generate("What is the mean?", &sales_passport(), "No prior turns in this session.", None)
            .await
            .unwrap();
        assert_eq!(code.as_str(), "show(1)");

        let prompts = model.prompts();
        assert_eq!(prompts.len(), 1);
        let (system, user) = &prompts[0];
        assert!(system.contains("Table 'sales'"));
        assert!(system.contains("No prior turns"));
        assert!(system.contains("group_by"));
        assert_eq!(user, "User question: \"What is the mean?\"");
    }

    #[tokio::test]
    async fn denied_groups_are_not_advertised() {
        let model = Arc::new(FixedModel::new("show(1)"));
        let agent = CodeGenerationAgent::new(model.clone(), CapabilityPolicy::no_plotting());
        agent
            .generate("q", &sales_passport(), "", None)
            .await
            .unwrap();
        let (system, _) = &model.prompts()[0];
        assert!(!system.contains("bar_chart"));
        assert!(system.contains("select"));
    }

    #[tokio::test]
    async fn correction_prompt_carries_code_and_error() {
        let model = Arc::new(FixedModel::new("show(2)"));
        let agent = CodeGenerationAgent::new(model.clone(), CapabilityPolicy::analysis_default());
        let failure = ExecutionFailure {
            kind: FailureKind::RuntimeFault,
            message: "line 1: unknown column 'amnt'".to_string(),
            offending_code: "show(select(table(\"sales\"), \"amnt\"))".to_string(),
        };
        agent
            .generate("q", &sales_passport(), "", Some(&failure))
            .await
            .unwrap();

        let (system, user) = &model.prompts()[0];
        assert!(system.contains("show(select(table(\"sales\"), \"amnt\"))"));
        assert!(system.contains("RuntimeFault: line 1: unknown column 'amnt'"));
        assert_eq!(user, "Fix the code.");
    }

    #[tokio::test]
    async fn empty_completion_is_a_generation_error() {
        let model = Arc::new(FixedModel::new("```\n\n```"));
        let agent = CodeGenerationAgent::new(model, CapabilityPolicy::analysis_default());
        let err = agent
            .generate("q", &sales_passport(), "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Generation(_)));
    }

    #[tokio::test]
    async fn synthesis_grounds_on_history() {
        let model = Arc::new(FixedModel::new("The amounts grew steadily."));
        let agent = SynthesisAgent::new(model.clone());
        let answer = agent
            .synthesize("Summarize the session", "1. Q: mean?\n   A: 20")
            .await
            .unwrap();
        assert_eq!(answer, "The amounts grew steadily.");

        let (system, user) = &model.prompts()[0];
        assert!(system.contains("1. Q: mean?"));
        assert_eq!(user, "Summarize the session");
    }
}
