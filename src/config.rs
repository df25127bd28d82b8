//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default system prompt used to generate chat titles.
pub const DEFAULT_TITLE_PROMPT: &str = "Generate a concise title (max 8 words) for the user's first message. Return plain text only, with no surrounding quotes.";

/// Default Anthropic model when `CHATD_MODEL` is unset.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// How often the poll loop tries to claim a pending chat.
    pub poll_interval: Duration,
    /// Claims older than this are reset to pending at startup.
    pub stale_threshold: Duration,
    /// Step ceiling for a single run of the agent loop.
    pub max_chat_steps: usize,
    /// Default timeout for the `execute` tool.
    pub execute_timeout: Duration,
    /// Default timeout for `subagent_await`.
    pub subagent_await_timeout: Duration,
    /// Store poll interval used while awaiting a subagent report.
    pub subagent_poll_interval: Duration,
    /// System prompt for title generation.
    pub title_prompt: String,
    /// Upper bound on a title generation call.
    pub title_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            stale_threshold: Duration::from_secs(300), // 5 minutes
            max_chat_steps: 1200,
            execute_timeout: Duration::from_secs(60),
            subagent_await_timeout: Duration::from_secs(300),
            subagent_poll_interval: Duration::from_millis(200),
            title_prompt: DEFAULT_TITLE_PROMPT.to_string(),
            title_timeout: Duration::from_secs(10),
        }
    }
}

/// Process-level configuration read from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    pub model: String,
    pub anthropic_api_key: SecretString,
    pub log_dir: Option<PathBuf>,
    pub processor: ProcessorConfig,
}

impl AppConfig {
    /// Build the configuration from `CHATD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("ANTHROPIC_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;

        let mut processor = ProcessorConfig::default();
        if let Some(ms) = parse_var::<u64>(&lookup, "CHATD_POLL_INTERVAL_MS")? {
            processor.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CHATD_STALE_THRESHOLD_SECS")? {
            processor.stale_threshold = Duration::from_secs(secs);
        }
        if let Some(steps) = parse_var::<usize>(&lookup, "CHATD_MAX_CHAT_STEPS")? {
            processor.max_chat_steps = steps;
        }
        if let Some(prompt) = lookup("CHATD_TITLE_PROMPT").filter(|p| !p.trim().is_empty()) {
            processor.title_prompt = prompt;
        }

        Ok(Self {
            db_path: lookup("CHATD_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/chatd.db")),
            http_port: parse_var(&lookup, "CHATD_HTTP_PORT")?.unwrap_or(8080),
            model: lookup("CHATD_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            anthropic_api_key: SecretString::from(api_key),
            log_dir: lookup("CHATD_LOG_DIR").map(PathBuf::from),
            processor,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}
