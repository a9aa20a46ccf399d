//! Natural-language query gateway.
//!
//! A question moves through `Received -> Generated -> Sanitized -> Validated ->
//! Executed -> Answered`, or stops early in `Rejected` / `Failed`. Every path
//! ends in an answer string; nothing here is escalated as a fault.
//!
//! The safety gate is a lexical denylist applied to the raw model output,
//! before fence stripping. It matches substrings case-insensitively and so also
//! blocks harmless identifiers such as `updated_at`.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::storage::{QueryRows, ViolationStore};

pub const UNSAFE_SQL_ANSWER: &str = "Unsafe SQL detected, query blocked.";
pub const SQL_ERROR_PREFIX: &str = "SQL Error: ";
pub const LLM_ERROR_PREFIX: &str = "LLM Error: ";

/// Tokens that block a generated statement wherever they appear.
pub const FORBIDDEN_TOKENS: [&str; 4] = ["drop", "delete", "update", "alter"];

const SCHEMA_DESCRIPTION: &str = "\
- Table 1: metadata(id, image_name, overall_status)
- Table 2: violations(id, metadata_id, ppe_type, confidence, x1, y1, x2, y2)";

/// Text-generation capability of a language model service.
pub trait LanguageModel: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Clone, Debug)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "llama3.2:1b".to_string(),
            temperature: 0.0,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Client for an Ollama server's non-streaming `/api/generate` endpoint.
pub struct OllamaClient {
    agent: ureq::Agent,
    endpoint: url::Url,
    config: OllamaConfig,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let base = url::Url::parse(&config.base_url)
            .with_context(|| format!("parse llm url '{}'", config.base_url))?;
        let endpoint = base
            .join("api/generate")
            .context("build llm generate endpoint")?;
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Ok(Self {
            agent,
            endpoint,
            config,
        })
    }
}

impl LanguageModel for OllamaClient {
    fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::to_string(&GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
            },
        })?;
        let response = self
            .agent
            .post(self.endpoint.as_str())
            .set("Content-Type", "application/json")
            .send_string(&body)
            .with_context(|| format!("llm request to {} failed", self.endpoint))?;
        let text = response.into_string().context("read llm response")?;
        let parsed: GenerateResponse =
            serde_json::from_str(&text).context("llm returned malformed json")?;
        Ok(parsed.response)
    }
}

/// Terminal state of one question.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Answered,
    Rejected,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryOutcome {
    pub state: QueryState,
    /// Sanitized SQL, when generation succeeded.
    pub sql: Option<String>,
    pub answer: String,
}

/// Turns questions into gated read queries against the violation store.
pub struct QueryGateway<'a> {
    llm: &'a dyn LanguageModel,
    store: &'a dyn ViolationStore,
}

impl<'a> QueryGateway<'a> {
    pub fn new(llm: &'a dyn LanguageModel, store: &'a dyn ViolationStore) -> Self {
        Self { llm, store }
    }

    pub fn ask(&self, question: &str) -> QueryOutcome {
        let prompt = build_prompt(question);
        let generated = match self.llm.generate(&prompt) {
            Ok(text) => text,
            Err(err) => {
                log::warn!("llm generation failed: {:#}", err);
                return QueryOutcome {
                    state: QueryState::Failed,
                    sql: None,
                    answer: format!("{}{:#}", LLM_ERROR_PREFIX, err),
                };
            }
        };

        let sql = strip_code_fence(&generated);
        log::debug!("generated sql: {}", sql);

        if is_unsafe_sql(&generated) {
            log::warn!("blocked unsafe generated sql");
            return QueryOutcome {
                state: QueryState::Rejected,
                sql: Some(sql),
                answer: UNSAFE_SQL_ANSWER.to_string(),
            };
        }

        match self.store.query_raw(&sql) {
            Ok(rows) => QueryOutcome {
                state: QueryState::Answered,
                sql: Some(sql),
                answer: format_rows(&rows),
            },
            Err(err) => {
                log::warn!("generated sql failed: {:#}", err);
                QueryOutcome {
                    state: QueryState::Failed,
                    sql: Some(sql),
                    answer: format!("{}{:#}", SQL_ERROR_PREFIX, err),
                }
            }
        }
    }
}

/// Prompt sent to the language model for one question.
pub fn build_prompt(question: &str) -> String {
    format!(
        r#"You are an expert SQL assistant.
Convert the following user question into a SQL query for SQLite.

{SCHEMA_DESCRIPTION}

Rules:
- ONLY return SQL. No explanation. No backticks. No comments.
- Output must be executable directly.
- Use LIKE for text filtering.
- Never guess table names.

User question:
"{question}"
"#
    )
}

fn fence_pattern() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:(?i:sql)\b|[A-Za-z0-9_+-]*[ \t]*\r?\n)?\s*(.*?)\s*```")
            .expect("static fence regex")
    })
}

/// Extract the body of the first fenced block, or trim when there is none.
pub fn strip_code_fence(text: &str) -> String {
    match fence_pattern().captures(text).and_then(|caps| caps.get(1)) {
        Some(body) => body.as_str().trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// Case-insensitive substring check against [`FORBIDDEN_TOKENS`].
pub fn is_unsafe_sql(text: &str) -> bool {
    let lowered = text.to_lowercase();
    FORBIDDEN_TOKENS
        .iter()
        .any(|token| lowered.contains(token))
}

/// One line per row, cells joined by commas.
pub fn format_rows(rows: &QueryRows) -> String {
    rows.rows
        .iter()
        .map(|row| row.join(","))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fixed-response model, useful when no language model service is reachable.
pub struct StaticLanguageModel {
    response: Result<String, String>,
}

impl StaticLanguageModel {
    pub fn answering(response: impl Into<String>) -> Self {
        Self {
            response: Ok(response.into()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            response: Err(message.into()),
        }
    }
}

impl LanguageModel for StaticLanguageModel {
    fn generate(&self, _prompt: &str) -> Result<String> {
        self.response.clone().map_err(|msg| anyhow!("{}", msg))
    }
}
