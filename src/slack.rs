//! Slack Web API client.
//!
//! Thin wrapper over the handful of methods this tool needs:
//!
//! | Method | Use |
//! |--------|-----|
//! | `auth.test` | credential precondition |
//! | `conversations.history` | channel pages (cursor-paginated, time-bounded) |
//! | `conversations.replies` | thread pages |
//! | `conversations.info` | channel name for output naming |
//! | `chat.postMessage` | bot answers |
//!
//! Every call carries the bearer token, goes through the shared
//! [`RetryPolicy`], and unwraps Slack's `{ "ok": bool, "error": ... }`
//! envelope. An `ok: false` reply becomes [`HarvestError::ApiLogic`]
//! (or [`HarvestError::Auth`] for `auth.test`).

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::config::{Config, Secrets};
use crate::error::{HarvestError, Result};
use crate::models::{AuthIdentity, Page, RawMessage};
use crate::retry::RetryPolicy;

const FALLBACK_CHANNEL_NAME: &str = "channel";

pub struct SlackClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    policy: RetryPolicy,
    page_limit: u32,
}

#[derive(Debug, Deserialize)]
struct PageBody {
    #[serde(default)]
    messages: Vec<RawMessage>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

impl From<PageBody> for Page {
    fn from(body: PageBody) -> Self {
        let continuation_cursor = body
            .response_metadata
            .and_then(|m| m.next_cursor)
            .filter(|c| !c.is_empty());
        Page {
            messages: body.messages,
            continuation_cursor,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelInfoBody {
    channel: ChannelInfo,
}

/// Format a time as a Slack timestamp bound (`seconds.micros`).
pub fn slack_ts(time: DateTime<Utc>) -> String {
    format!("{}.{:06}", time.timestamp(), time.timestamp_subsec_micros())
}

impl SlackClient {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HarvestError::api("http client", e.to_string()))?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            policy,
            page_limit: 100,
        })
    }

    /// Build a client from the `[slack]` and `[retry]` sections.
    pub fn from_config(config: &Config, secrets: &Secrets) -> anyhow::Result<Self> {
        let client = Self::new(
            config.slack.api_base.clone(),
            secrets.bot_token()?,
            config.retry.policy(),
            Duration::from_secs(config.slack.timeout_secs),
        )
        .context("Failed to build Slack client")?;
        Ok(client.with_page_limit(config.slack.page_limit))
    }

    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit.clamp(1, 1000);
        self
    }

    pub fn page_limit(&self) -> u32 {
        self.page_limit
    }

    async fn get<T: DeserializeOwned>(&self, method: &str, params: &[(&str, String)]) -> Result<T> {
        let url = format!("{}/{}", self.api_base, method);
        let resp = self
            .policy
            .send(method, || {
                self.http
                    .get(&url)
                    .bearer_auth(&self.token)
                    .query(params)
            })
            .await?;
        decode_envelope(method, resp).await
    }

    /// Credential precondition: succeeds only for a token Slack accepts.
    pub async fn auth_test(&self) -> Result<AuthIdentity> {
        match self.get::<AuthIdentity>("auth.test", &[]).await {
            Ok(identity) => Ok(identity),
            Err(HarvestError::ApiLogic { detail, .. }) => Err(HarvestError::Auth(detail)),
            Err(other) => Err(other),
        }
    }

    pub async fn history_page(
        &self,
        channel: &str,
        oldest: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page> {
        let mut params = vec![
            ("channel", channel.to_string()),
            ("limit", self.page_limit.to_string()),
        ];
        if let Some(oldest) = oldest {
            params.push(("oldest", slack_ts(oldest)));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let body: PageBody = self.get("conversations.history", &params).await?;
        Ok(body.into())
    }

    pub async fn replies_page(
        &self,
        channel: &str,
        thread_ts: &str,
        oldest: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<Page> {
        let mut params = vec![
            ("channel", channel.to_string()),
            ("ts", thread_ts.to_string()),
            ("limit", self.page_limit.to_string()),
        ];
        if let Some(oldest) = oldest {
            params.push(("oldest", slack_ts(oldest)));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let body: PageBody = self.get("conversations.replies", &params).await?;
        Ok(body.into())
    }

    pub async fn channel_info(&self, channel: &str) -> Result<ChannelInfo> {
        let body: ChannelInfoBody = self
            .get("conversations.info", &[("channel", channel.to_string())])
            .await?;
        Ok(body.channel)
    }

    /// Channel name for output naming; falls back to `"channel"`.
    pub async fn channel_name(&self, channel: &str) -> String {
        match self.channel_info(channel).await {
            Ok(ChannelInfo {
                name: Some(name), ..
            }) if !name.is_empty() => name,
            Ok(_) => FALLBACK_CHANNEL_NAME.to_string(),
            Err(e) => {
                tracing::warn!(channel, error = %e, "could not fetch channel info");
                FALLBACK_CHANNEL_NAME.to_string()
            }
        }
    }

    pub async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/chat.postMessage", self.api_base);
        let mut body = serde_json::json!({ "channel": channel, "text": text });
        if let Some(ts) = thread_ts {
            body["thread_ts"] = serde_json::Value::String(ts.to_string());
        }
        let resp = self
            .policy
            .send("chat.postMessage", || {
                self.http.post(&url).bearer_auth(&self.token).json(&body)
            })
            .await?;
        decode_envelope::<serde_json::Value>("chat.postMessage", resp).await?;
        Ok(())
    }
}

async fn decode_envelope<T: DeserializeOwned>(method: &str, resp: reqwest::Response) -> Result<T> {
    let json: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| HarvestError::api(method, format!("invalid JSON: {}", e)))?;

    if !json.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
        let error = json
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown_error");
        return Err(HarvestError::api(method, error));
    }

    serde_json::from_value(json)
        .map_err(|e| HarvestError::api(method, format!("unexpected response shape: {}", e)))
}

/// `harvest check`: run the credential precondition and print the identity.
pub async fn run_check(config: &Config, secrets: &Secrets) -> anyhow::Result<()> {
    let client = SlackClient::from_config(config, secrets)?;
    let identity = client.auth_test().await?;
    println!("token ok");
    println!("  team: {}", identity.team.as_deref().unwrap_or("-"));
    println!("  user: {}", identity.user.as_deref().unwrap_or("-"));
    if let Some(bot) = identity.bot_id {
        println!("  bot:  {}", bot);
    }
    Ok(())
}
