//! Runtime configuration.
//!
//! Built once at process start from environment variables (a `.env` file is
//! honored when present) and passed into the analyzer. Read-only afterward.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model identifier sent to the chat-completions endpoint.
    pub model: String,
    /// API key for the language-model service.
    pub api_key: String,
    /// Base URL of the OpenAI-compatible API.
    pub base_url: String,
    /// Bounded retry count for the code-generation call.
    pub generation_retries: u32,
    /// Per-request HTTP timeout in seconds.
    pub request_timeout_secs: u64,
    /// Sampling temperature for code generation.
    pub temperature: f64,
    /// Completion token cap for code generation.
    pub max_tokens: u32,
    /// Directory where uploaded workbooks are stored.
    pub upload_dir: PathBuf,
    /// VM instruction budget for one script execution.
    pub instruction_budget: u32,
    /// VM memory ceiling in bytes for one script execution.
    pub memory_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            generation_retries: 3,
            request_timeout_secs: 60,
            temperature: 0.1,
            max_tokens: 2000,
            upload_dir: PathBuf::from("uploads"),
            instruction_budget: 5_000_000,
            memory_limit_bytes: 64 * 1024 * 1024,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            model: std::env::var("SHEETQUERY_MODEL").unwrap_or(defaults.model),
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or(defaults.api_key),
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            generation_retries: parse_env("SHEETQUERY_RETRIES", defaults.generation_retries),
            request_timeout_secs: parse_env(
                "SHEETQUERY_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            ),
            temperature: parse_env("SHEETQUERY_TEMPERATURE", defaults.temperature),
            max_tokens: parse_env("SHEETQUERY_MAX_TOKENS", defaults.max_tokens),
            upload_dir: std::env::var("SHEETQUERY_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            instruction_budget: parse_env(
                "SHEETQUERY_INSTRUCTION_BUDGET",
                defaults.instruction_budget,
            ),
            memory_limit_bytes: parse_env(
                "SHEETQUERY_MEMORY_LIMIT_BYTES",
                defaults.memory_limit_bytes,
            ),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
