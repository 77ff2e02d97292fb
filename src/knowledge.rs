//! Knowledge-base question answering on AWS Bedrock.
//!
//! Two ways to answer a question:
//!
//! - **Managed knowledge base**: Bedrock Agent Runtime `retrieveAndGenerate`
//!   with `knowledge_base_id` and `model_arn`.
//! - **Bucket as knowledge base**: read every question/answer CSV from
//!   `source_bucket`, inline them into a prompt, and call Bedrock Runtime
//!   `invoke_model` with the Anthropic messages format.
//!
//! Requests are SigV4-signed for the `bedrock` service and go through the
//! shared [`RetryPolicy`].

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::{Config, KnowledgeBaseConfig};
use crate::error::{HarvestError, Result};
use crate::retry::RetryPolicy;
use crate::sigv4::{self, AwsCredentials, SigningRequest};
use crate::storage::ObjectStore;

const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const NOT_AVAILABLE: &str = "N/A";

/// Anything that can answer a free-text question.
#[async_trait]
pub trait Answerer: Send + Sync {
    async fn answer(&self, question: &str) -> Result<String>;
}

/// One question/answer pair from a knowledge CSV.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QaEntry {
    #[serde(default = "not_available")]
    pub question: String,
    #[serde(default = "not_available")]
    pub answer: String,
}

fn not_available() -> String {
    NOT_AVAILABLE.to_string()
}

pub struct KnowledgeBase {
    config: KnowledgeBaseConfig,
    http: reqwest::Client,
    policy: RetryPolicy,
    credentials: Option<AwsCredentials>,
}

impl KnowledgeBase {
    pub fn new(config: KnowledgeBaseConfig, policy: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| HarvestError::api("http client", e.to_string()))?;
        Ok(Self {
            config,
            http,
            policy,
            credentials: None,
        })
    }

    pub fn with_credentials(mut self, credentials: AwsCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn credentials(&self) -> Result<AwsCredentials> {
        match &self.credentials {
            Some(c) => Ok(c.clone()),
            None => AwsCredentials::from_env(),
        }
    }

    /// `(base url, host)` for a Bedrock endpoint family.
    fn endpoint(&self, family: &str) -> (String, String) {
        match &self.config.endpoint_url {
            Some(url) => {
                let base = url.trim_end_matches('/').to_string();
                let host = base
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                (base, host)
            }
            None => {
                let host = format!("{}.{}.amazonaws.com", family, self.config.region);
                (format!("https://{}", host), host)
            }
        }
    }

    async fn post_json(&self, family: &str, path_segments: &[&str], body: &Value) -> Result<Value> {
        let creds = self.credentials()?;
        let (base, host) = self.endpoint(family);
        let request_path: String = path_segments
            .iter()
            .map(|s| format!("/{}", sigv4::uri_encode(s)))
            .collect();
        // Non-S3 services sign the path encoded a second time.
        let canonical_uri = sigv4::encode_path(&request_path);
        let url = format!("{}{}", base, request_path);
        let payload = serde_json::to_vec(body)
            .map_err(|e| HarvestError::api(family, format!("encoding request: {}", e)))?;
        let extra = [("content-type".to_string(), "application/json".to_string())];

        let resp = self
            .policy
            .send(family, || {
                let signed = sigv4::sign(
                    &creds,
                    &SigningRequest {
                        method: "POST",
                        host: &host,
                        canonical_uri: &canonical_uri,
                        query: &[],
                        payload: &payload,
                        region: &self.config.region,
                        service: "bedrock",
                        extra_headers: &extra,
                    },
                    Utc::now(),
                );
                signed.apply(
                    self.http
                        .post(&url)
                        .header("content-type", "application/json")
                        .body(payload.clone()),
                )
            })
            .await?;

        resp.json()
            .await
            .map_err(|e| HarvestError::api(family, format!("invalid JSON: {}", e)))
    }

    /// Ask the managed knowledge base.
    pub async fn retrieve_and_generate(&self, question: &str) -> Result<String> {
        let kb_id = self.config.knowledge_base_id.as_deref().ok_or_else(|| {
            HarvestError::api("retrieveAndGenerate", "knowledge_base.knowledge_base_id not set")
        })?;
        let model_arn = self.config.model_arn.as_deref().ok_or_else(|| {
            HarvestError::api("retrieveAndGenerate", "knowledge_base.model_arn not set")
        })?;

        let body = json!({
            "input": { "text": question },
            "retrieveAndGenerateConfiguration": {
                "type": "KNOWLEDGE_BASE",
                "knowledgeBaseConfiguration": {
                    "knowledgeBaseId": kb_id,
                    "modelArn": model_arn,
                }
            }
        });

        let json = self
            .post_json("bedrock-agent-runtime", &["retrieveAndGenerate"], &body)
            .await?;
        json.pointer("/output/text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| HarvestError::api("retrieveAndGenerate", "response missing output.text"))
    }

    /// Send one user message to the configured model.
    pub async fn invoke_model(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "anthropic_version": ANTHROPIC_VERSION,
            "max_tokens": self.config.max_tokens,
            "messages": [ { "role": "user", "content": prompt } ],
            "temperature": self.config.temperature,
        });
        let json = self
            .post_json(
                "bedrock-runtime",
                &["model", &self.config.model_id, "invoke"],
                &body,
            )
            .await?;
        extract_model_text(&json)
            .ok_or_else(|| HarvestError::api("invoke_model", "response has no text content"))
    }

    /// Answer from the question/answer CSVs in `source_bucket`.
    pub async fn ask_from_bucket(&self, store: &ObjectStore, question: &str) -> Result<String> {
        let entries = load_bucket_entries(store).await?;
        if entries.is_empty() {
            return Err(HarvestError::storage("no knowledge entries found in the bucket"));
        }
        let prompt = build_prompt(&self.config.system_prompt, &entries, question);
        self.invoke_model(&prompt).await
    }
}

#[async_trait]
impl Answerer for KnowledgeBase {
    async fn answer(&self, question: &str) -> Result<String> {
        self.retrieve_and_generate(question).await
    }
}

/// Concatenated text blocks of an Anthropic messages response.
fn extract_model_text(json: &Value) -> Option<String> {
    let text: String = json
        .get("content")?
        .as_array()?
        .iter()
        .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Decode UTF-8, falling back to Latin-1 for legacy exports.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Parse question/answer rows; missing columns become `N/A`.
pub fn parse_entries(text: &str) -> Result<Vec<QaEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    reader
        .deserialize()
        .collect::<std::result::Result<Vec<QaEntry>, _>>()
        .map_err(|e| HarvestError::storage(format!("parsing knowledge CSV: {}", e)))
}

/// Read every object in the bucket; unparsable files are skipped with a warning.
pub async fn load_bucket_entries(store: &ObjectStore) -> Result<Vec<QaEntry>> {
    let objects = store.list_objects("").await?;
    let mut entries = Vec::new();
    for object in objects {
        let bytes = match store.get_object(&object.key).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(key = %object.key, error = %e, "skipping unreadable object");
                continue;
            }
        };
        match parse_entries(&decode_text(&bytes)) {
            Ok(found) => {
                tracing::debug!(key = %object.key, entries = found.len(), "read knowledge file");
                entries.extend(found);
            }
            Err(e) => tracing::warn!(key = %object.key, error = %e, "skipping malformed file"),
        }
    }
    Ok(entries)
}

pub fn build_prompt(system_prompt: &str, entries: &[QaEntry], question: &str) -> String {
    let knowledge = entries
        .iter()
        .map(|e| format!("Question: {}\nAnswer: {}", e.question, e.answer))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{}\nKnowledge Base:\n{}\n\nQuestion: {}",
        system_prompt, knowledge, question
    )
}

/// `harvest ask`: answer one question and print it.
pub async fn run_ask(config: &Config, question: &str, from_bucket: bool) -> anyhow::Result<()> {
    let kb = KnowledgeBase::new(config.knowledge_base.clone(), config.retry.policy())?;
    let answer = if from_bucket {
        let bucket = config
            .knowledge_base
            .source_bucket
            .clone()
            .or_else(|| config.storage.bucket.clone())
            .context("knowledge_base.source_bucket (or storage.bucket) must be set")?;
        let store = ObjectStore::from_config(&config.storage, config.retry.policy())?.with_bucket(bucket);
        kb.ask_from_bucket(&store, question).await?
    } else {
        kb.retrieve_and_generate(question).await?
    };
    println!("{}", answer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_inlines_every_entry() {
        let entries = vec![
            QaEntry {
                question: "What is GI?".into(),
                answer: "Glycemic index".into(),
            },
            QaEntry {
                question: "Sugar?".into(),
                answer: NOT_AVAILABLE.into(),
            },
        ];
        let prompt = build_prompt("You are a helpful assistant.", &entries, "How do I eat?");
        assert_eq!(
            prompt,
            "You are a helpful assistant.\nKnowledge Base:\nQuestion: What is GI?\nAnswer: Glycemic index\nQuestion: Sugar?\nAnswer: N/A\n\nQuestion: How do I eat?"
        );
    }

    #[test]
    fn missing_columns_default_to_na() {
        let entries = parse_entries("question,topic\nWhy?,health\n").unwrap();
        assert_eq!(
            entries,
            vec![QaEntry {
                question: "Why?".into(),
                answer: "N/A".into()
            }]
        );
    }

    #[test]
    fn latin1_fallback() {
        assert_eq!(decode_text(b"caf\xe9"), "café");
        assert_eq!(decode_text("שלום".as_bytes()), "שלום");
    }

    #[test]
    fn model_text_joins_blocks() {
        let json = json!({ "content": [ { "type": "text", "text": "Hello" }, { "type": "text", "text": " there" } ] });
        assert_eq!(extract_model_text(&json).as_deref(), Some("Hello there"));
        assert_eq!(extract_model_text(&json!({ "content": [] })), None);
    }

    #[test]
    fn model_path_is_double_encoded_for_signing() {
        let request_path = format!("/model/{}/invoke", sigv4::uri_encode("eu.anthropic.claude-3-5-sonnet-20240620-v1:0"));
        assert_eq!(request_path, "/model/eu.anthropic.claude-3-5-sonnet-20240620-v1%3A0/invoke");
        assert_eq!(
            sigv4::encode_path(&request_path),
            "/model/eu.anthropic.claude-3-5-sonnet-20240620-v1%253A0/invoke"
        );
    }
}
