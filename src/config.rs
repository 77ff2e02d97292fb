//! TOML configuration with environment-sourced secrets.
//!
//! Non-secret settings live in `harvest.toml`; tokens and keys come from
//! the environment (optionally loaded from `.env` by the binary). A
//! missing config file is not an error: every section has defaults.
//!
//! ```toml
//! [slack]
//! channel_id = "C07K8KFCVFH"
//! page_limit = 100
//!
//! [fetch]
//! lookback_hours = 24
//! thread_concurrency = 4
//!
//! [retry]
//! max_attempts = 3
//!
//! [storage]
//! bucket = "kb-team4u"
//! region = "eu-west-1"
//!
//! [knowledge_base]
//! knowledge_base_id = "IFGNAI9DOT"
//! model_arn = "anthropic.claude-3-5-sonnet-20240620-v1:0"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub knowledge_base: KnowledgeBaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Falls back to `SLACK_CHANNEL_ID` when unset.
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            channel_id: None,
            page_limit: default_page_limit(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_base() -> String {
    "https://slack.com/api".to_string()
}
fn default_page_limit() -> u32 {
    100
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u64,
    #[serde(default = "default_thread_concurrency")]
    pub thread_concurrency: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Keep the replies endpoint's copy of the root message, marked `Original`.
    #[serde(default = "default_true")]
    pub include_root_echo: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            lookback_hours: default_lookback_hours(),
            thread_concurrency: default_thread_concurrency(),
            output_dir: default_output_dir(),
            include_root_echo: true,
        }
    }
}

/// Upper bound on `fetch.lookback_hours` (about a century).
pub const MAX_LOOKBACK_HOURS: u64 = 24 * 366 * 100;

fn default_lookback_hours() -> u64 {
    24
}
fn default_thread_concurrency() -> usize {
    1
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// One backoff unit; attempt `n` waits `2^n` units.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Status codes retried with backoff besides 429 and 5xx.
    #[serde(default)]
    pub retry_on: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            retry_on: Vec::new(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
            .with_extra_statuses(self.retry_on.clone())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Per-request timeout for S3 calls.
    #[serde(default = "default_aws_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            region: default_region(),
            prefix: String::new(),
            endpoint_url: None,
            timeout_secs: default_aws_timeout_secs(),
        }
    }
}

fn default_region() -> String {
    "eu-west-1".to_string()
}
fn default_aws_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeBaseConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub knowledge_base_id: Option<String>,
    #[serde(default)]
    pub model_arn: Option<String>,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Bucket of question/answer CSVs used by `ask --from-bucket`.
    #[serde(default)]
    pub source_bucket: Option<String>,
    /// Overrides the Bedrock endpoints (tests, VPC endpoints).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Per-request timeout for Bedrock calls.
    #[serde(default = "default_aws_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            knowledge_base_id: None,
            model_arn: None,
            model_id: default_model_id(),
            system_prompt: default_system_prompt(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            source_bucket: None,
            endpoint_url: None,
            timeout_secs: default_aws_timeout_secs(),
        }
    }
}

fn default_model_id() -> String {
    "eu.anthropic.claude-3-5-sonnet-20240620-v1:0".to_string()
}
fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}
fn default_max_tokens() -> u32 {
    150
}
fn default_temperature() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}
fn default_dedup_capacity() -> usize {
    1024
}

/// Credentials read from the environment.
#[derive(Clone)]
pub struct Secrets {
    pub slack_bot_token: Option<String>,
    pub slack_signing_secret: Option<String>,
    pub slack_channel_id: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self {
            slack_bot_token: non_empty_env("SLACK_BOT_TOKEN"),
            slack_signing_secret: non_empty_env("SLACK_SIGNING_SECRET"),
            slack_channel_id: non_empty_env("SLACK_CHANNEL_ID"),
        }
    }

    pub fn bot_token(&self) -> Result<&str> {
        self.slack_bot_token
            .as_deref()
            .context("SLACK_BOT_TOKEN environment variable not set")
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("slack_bot_token", &self.slack_bot_token.as_ref().map(|_| "***"))
            .field(
                "slack_signing_secret",
                &self.slack_signing_secret.as_ref().map(|_| "***"),
            )
            .field("slack_channel_id", &self.slack_channel_id)
            .finish()
    }
}

pub(crate) fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Resolve the channel to fetch: CLI flag, then config, then environment.
    pub fn channel_id(&self, cli: Option<&str>, secrets: &Secrets) -> Result<String> {
        cli.map(str::to_string)
            .or_else(|| self.slack.channel_id.clone())
            .or_else(|| secrets.slack_channel_id.clone())
            .context("no channel: pass --channel, set slack.channel_id, or SLACK_CHANNEL_ID")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if !(1..=1000).contains(&config.slack.page_limit) {
        bail!("slack.page_limit must be in [1, 1000]");
    }
    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be >= 1");
    }
    if config.fetch.lookback_hours > MAX_LOOKBACK_HOURS {
        bail!("fetch.lookback_hours must be <= {}", MAX_LOOKBACK_HOURS);
    }
    if config.fetch.thread_concurrency == 0 {
        bail!("fetch.thread_concurrency must be >= 1");
    }
    if config.server.dedup_capacity == 0 {
        bail!("server.dedup_capacity must be >= 1");
    }
    if config.storage.timeout_secs == 0 || config.knowledge_base.timeout_secs == 0 {
        bail!("storage.timeout_secs and knowledge_base.timeout_secs must be >= 1");
    }
    if let Some(bucket) = &config.storage.bucket {
        if bucket.trim().is_empty() {
            bail!("storage.bucket must not be empty when set");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.slack.api_base, "https://slack.com/api");
        assert_eq!(config.slack.page_limit, 100);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.fetch.lookback_hours, 24);
        assert!(config.fetch.include_root_echo);
        assert_eq!(config.server.bind, "127.0.0.1:3000");
    }

    #[test]
    fn rejects_page_limit_above_slack_max() {
        let err = parse("[slack]\npage_limit = 5000\n").unwrap_err();
        assert!(err.to_string().contains("page_limit"));
    }

    #[test]
    fn rejects_zero_attempts() {
        assert!(parse("[retry]\nmax_attempts = 0\n").is_err());
    }

    #[test]
    fn rejects_absurd_lookback() {
        let err = parse("[fetch]\nlookback_hours = 10000000000\n").unwrap_err();
        assert!(err.to_string().contains("lookback_hours"));
        assert!(parse("[fetch]\nlookback_hours = 8760\n").is_ok());
    }

    #[test]
    fn rejects_zero_thread_concurrency() {
        assert!(parse("[fetch]\nthread_concurrency = 0\n").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/harvest.toml")).unwrap();
        assert_eq!(config.storage.region, "eu-west-1");
        assert_eq!(config.storage.timeout_secs, 60);
        assert_eq!(config.knowledge_base.timeout_secs, 60);
    }

    #[test]
    fn rejects_zero_aws_timeout() {
        assert!(parse("[storage]
timeout_secs = 0
").is_err());
        assert!(parse("[knowledge_base]
timeout_secs = 0
").is_err());
        assert!(parse("[knowledge_base]
timeout_secs = 5
").is_ok());
    }

    #[test]
    fn channel_resolution_order() {
        let mut config = parse("[slack]\nchannel_id = \"CFILE\"\n").unwrap();
        let secrets = Secrets {
            slack_bot_token: None,
            slack_signing_secret: None,
            slack_channel_id: Some("CENV".into()),
        };
        assert_eq!(config.channel_id(Some("CCLI"), &secrets).unwrap(), "CCLI");
        assert_eq!(config.channel_id(None, &secrets).unwrap(), "CFILE");
        config.slack.channel_id = None;
        assert_eq!(config.channel_id(None, &secrets).unwrap(), "CENV");
    }

    #[test]
    fn retry_section_builds_policy() {
        let config = parse("[retry]\nmax_attempts = 5\nbase_delay_ms = 10\nretry_on = [408]\n")
            .unwrap();
        let policy = config.retry.policy();
        assert_eq!(policy.max_attempts(), 5);
        assert!(policy.is_retryable_status(408));
        assert!(policy.is_retryable_status(503));
        assert!(!policy.is_retryable_status(404));
    }
}
