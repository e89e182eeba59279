//! End-to-end analysis of one question against one workbook.
//!
//! The loop mirrors how an analyst would work: look at the file, ask the
//! model for a script, clean the response, run it in the restricted
//! environment, and on failure hand the error back to the model for another
//! try. Attempts are bounded; the final failure keeps the offending script
//! verbatim so the user can see exactly what ran.

use crate::config::AgentConfig;
use crate::error::{AnalysisError, Result};
use crate::llm::{CodeGenerator, LlmClient};
use crate::marshal;
use crate::metadata;
use crate::prompts;
use crate::sandbox::Sandbox;
use crate::sanitizer;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// User-facing result of one analysis request.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    /// Formatted text shown to the user.
    pub answer: String,
    /// The last script that was executed or attempted, if any.
    pub code: Option<String>,
    pub success: bool,
    /// Generation attempts consumed. Zero when the file was rejected before
    /// any code was requested.
    pub attempts: u32,
}

pub struct Analyzer {
    config: AgentConfig,
    generator: Arc<dyn CodeGenerator>,
    sandbox: Sandbox,
}

impl Analyzer {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let generator = Arc::new(LlmClient::new(&config)?);
        Ok(Self::with_generator(config, generator))
    }

    /// Build an analyzer around a specific generator. Tests use this to
    /// script model responses.
    pub fn with_generator(config: AgentConfig, generator: Arc<dyn CodeGenerator>) -> Self {
        let sandbox = Sandbox::new(&config);
        Self {
            config,
            generator,
            sandbox,
        }
    }

    pub async fn analyze(&self, file_path: &Path, query: &str) -> AnalysisOutcome {
        let request_id = Uuid::new_v4();
        info!(%request_id, file = %file_path.display(), query, "starting analysis");

        let metadata = match metadata::extract(file_path) {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!(%request_id, %error, "file rejected before generation");
                return failure_outcome(&error, None, 0);
            }
        };
        info!(
            %request_id,
            sheets = metadata.sheet_names.len(),
            rows = metadata.total_rows,
            "extracted metadata"
        );

        let base_prompt = prompts::build_codegen_prompt(file_path, &metadata, query);
        let retries = self.config.generation_retries.max(1);
        let mut last_failure: Option<(AnalysisError, Option<String>)> = None;

        for attempt in 1..=retries {
            let user_prompt = match &last_failure {
                None => base_prompt.clone(),
                Some((error, code)) => {
                    prompts::build_retry_prompt(&base_prompt, &error.to_string(), code.as_deref())
                }
            };

            let raw = match self
                .generator
                .generate(prompts::SYSTEM_PROMPT, &user_prompt)
                .await
            {
                Ok(raw) => raw,
                Err(error) => {
                    warn!(%request_id, attempt, %error, "generation failed");
                    last_failure = Some((error, None));
                    continue;
                }
            };

            let code = sanitizer::sanitize(&raw);
            if code.trim().is_empty() {
                warn!(%request_id, attempt, "response sanitized down to nothing");
                last_failure = Some((
                    AnalysisError::Generation("response contained no script".to_string()),
                    None,
                ));
                continue;
            }

            match self.sandbox.execute(&code, file_path) {
                Ok(output) => {
                    info!(%request_id, attempt, "analysis succeeded");
                    return success_outcome(&code, marshal::marshal(&output), attempt);
                }
                Err(error) => {
                    warn!(%request_id, attempt, %error, "script failed");
                    last_failure = Some((error, Some(code)));
                }
            }
        }

        let (error, code) = last_failure.unwrap_or_else(|| {
            (
                AnalysisError::Generation("no attempts were made".to_string()),
                None,
            )
        });
        info!(%request_id, attempts = retries, "analysis failed");
        failure_outcome(&error, code.as_deref(), retries)
    }
}

fn success_outcome(code: &str, rendered: Option<String>, attempts: u32) -> AnalysisOutcome {
    let result_text = rendered
        .unwrap_or_else(|| "The script completed but did not produce a result.".to_string());
    let answer = format!(
        "Analysis result:\n\nExecuted code:\n```lua\n{}\n```\n\nResult:\n{}",
        code, result_text
    );
    AnalysisOutcome {
        answer,
        code: Some(code.to_string()),
        success: true,
        attempts,
    }
}

fn failure_outcome(error: &AnalysisError, code: Option<&str>, attempts: u32) -> AnalysisOutcome {
    let mut answer = format!("Analysis failed: {}\n", error);
    if let Some(code) = code {
        answer.push_str("\nGenerated code:\n```lua\n");
        answer.push_str(code);
        answer.push_str("\n```\n");
    }
    answer.push_str(
        "\nSuggestions:\n\
         - Check that the column names in the question exist in the file\n\
         - Check that values are compared with the right type (text vs number)\n\
         - Rephrase the question using only filtering, sorting, grouping and aggregation",
    );
    AnalysisOutcome {
        answer,
        code: code.map(str::to_string),
        success: false,
        attempts,
    }
}
