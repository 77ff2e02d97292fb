//! Amazon S3 object storage client.
//!
//! Puts, lists, and downloads objects with the S3 REST API and AWS
//! Signature V4 ([`crate::sigv4`]). Every request goes through the shared
//! [`RetryPolicy`] and is re-signed per attempt.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! bucket = "kb-team4u"
//! region = "eu-west-1"
//! prefix = "slack/"
//! # endpoint_url = "http://localhost:9000"   # MinIO, path-style
//! ```
//!
//! Credentials are read from the environment when a request is made
//! (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, optional
//! `AWS_SESSION_TOKEN`). Missing credentials or bucket surface as
//! [`HarvestError::Storage`] from the call, never at construction.
//!
//! # Pagination
//!
//! Listings follow `NextContinuationToken` with `max-keys=1000` per page.

use anyhow::Context;
use chrono::Utc;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::path::Path;
use std::time::Duration;

use crate::config::{Config, StorageConfig};
use crate::error::{HarvestError, Result};
use crate::retry::RetryPolicy;
use crate::sigv4::{self, AwsCredentials, SigningRequest};

pub struct ObjectStore {
    bucket: Option<String>,
    region: String,
    endpoint_url: Option<String>,
    http: reqwest::Client,
    policy: RetryPolicy,
    credentials: Option<AwsCredentials>,
}

/// Metadata for one object from a `ListObjectsV2` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Object {
    pub key: String,
    /// Entity tag, stripped of surrounding quotes.
    pub etag: String,
    pub size: i64,
}

struct ListPage {
    objects: Vec<S3Object>,
    next_token: Option<String>,
}

/// Scheme + authority, host header, and path prefix for a bucket.
struct Target {
    base: String,
    host: String,
    path_prefix: String,
}

impl ObjectStore {
    pub fn from_config(config: &StorageConfig, policy: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| HarvestError::storage(format!("http client: {}", e)))?;
        Ok(Self {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            http,
            policy,
            credentials: None,
        })
    }

    /// Use explicit credentials instead of the environment.
    pub fn with_credentials(mut self, credentials: AwsCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    fn credentials(&self) -> Result<AwsCredentials> {
        match &self.credentials {
            Some(c) => Ok(c.clone()),
            None => AwsCredentials::from_env(),
        }
    }

    fn require_bucket(&self) -> Result<&str> {
        self.bucket
            .as_deref()
            .ok_or_else(|| HarvestError::storage("no bucket configured (storage.bucket)"))
    }

    fn target(&self, bucket: &str) -> Target {
        match &self.endpoint_url {
            Some(endpoint) => {
                let base = endpoint.trim_end_matches('/').to_string();
                let host = base
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                Target {
                    base,
                    host,
                    path_prefix: format!("/{}", sigv4::uri_encode(bucket)),
                }
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", bucket, self.region);
                Target {
                    base: format!("https://{}", host),
                    host,
                    path_prefix: String::new(),
                }
            }
        }
    }

    /// Upload `body` under `key`. Returns the `s3://` location.
    pub async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<String> {
        let bucket = self.require_bucket()?;
        let creds = self.credentials()?;
        let target = self.target(bucket);
        let canonical_uri = format!("{}/{}", target.path_prefix, sigv4::encode_path(key));
        let url = format!("{}{}", target.base, canonical_uri);
        let extra = [("content-type".to_string(), content_type.to_string())];

        self.policy
            .send("s3 PutObject", || {
                let signed = sigv4::sign(
                    &creds,
                    &SigningRequest {
                        method: "PUT",
                        host: &target.host,
                        canonical_uri: &canonical_uri,
                        query: &[],
                        payload: &body,
                        region: &self.region,
                        service: "s3",
                        extra_headers: &extra,
                    },
                    Utc::now(),
                );
                signed.apply(
                    self.http
                        .put(&url)
                        .header("content-type", content_type)
                        .body(body.clone()),
                )
            })
            .await
            .map_err(|e| HarvestError::storage(format!("upload to s3://{}/{} failed: {}", bucket, key, e)))?;

        let location = format!("s3://{}/{}", bucket, key);
        tracing::info!(%location, "uploaded object");
        Ok(location)
    }

    /// List every object under `prefix`, following continuation tokens.
    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<S3Object>> {
        let bucket = self.require_bucket()?;
        let creds = self.credentials()?;
        let target = self.target(bucket);
        let canonical_uri = if target.path_prefix.is_empty() {
            "/".to_string()
        } else {
            target.path_prefix.clone()
        };

        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }
            let url = format!(
                "{}{}?{}",
                target.base,
                canonical_uri,
                sigv4::canonical_query(&query)
            );

            let resp = self
                .policy
                .send("s3 ListObjectsV2", || {
                    let signed = sigv4::sign(
                        &creds,
                        &SigningRequest {
                            method: "GET",
                            host: &target.host,
                            canonical_uri: &canonical_uri,
                            query: &query,
                            payload: b"",
                            region: &self.region,
                            service: "s3",
                            extra_headers: &[],
                        },
                        Utc::now(),
                    );
                    signed.apply(self.http.get(&url))
                })
                .await
                .map_err(|e| HarvestError::storage(format!("listing s3://{}/{} failed: {}", bucket, prefix, e)))?;

            let xml = resp
                .text()
                .await
                .map_err(|e| HarvestError::storage(format!("reading listing: {}", e)))?;
            let page = parse_list_objects_response(&xml)?;
            objects.extend(page.objects);

            match page.next_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(objects)
    }

    pub async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let bucket = self.require_bucket()?;
        let creds = self.credentials()?;
        let target = self.target(bucket);
        let canonical_uri = format!("{}/{}", target.path_prefix, sigv4::encode_path(key));
        let url = format!("{}{}", target.base, canonical_uri);

        let resp = self
            .policy
            .send("s3 GetObject", || {
                let signed = sigv4::sign(
                    &creds,
                    &SigningRequest {
                        method: "GET",
                        host: &target.host,
                        canonical_uri: &canonical_uri,
                        query: &[],
                        payload: b"",
                        region: &self.region,
                        service: "s3",
                        extra_headers: &[],
                    },
                    Utc::now(),
                );
                signed.apply(self.http.get(&url))
            })
            .await
            .map_err(|e| HarvestError::storage(format!("get s3://{}/{} failed: {}", bucket, key, e)))?;

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| HarvestError::storage(format!("reading s3://{}/{}: {}", bucket, key, e)))?;
        Ok(bytes.to_vec())
    }
}

/// Parse a `ListObjectsV2` XML body. Folder placeholders (keys ending in
/// `/`) are skipped.
fn parse_list_objects_response(xml: &str) -> Result<ListPage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut objects = Vec::new();
    let mut is_truncated = false;
    let mut next_token = None;

    let mut path: Vec<String> = Vec::new();
    let mut current: Option<S3Object> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == "Contents" {
                    current = Some(S3Object {
                        key: String::new(),
                        etag: String::new(),
                        size: 0,
                    });
                }
                path.push(name);
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| HarvestError::storage(format!("invalid listing XML: {}", e)))?
                    .to_string();
                match (path.last().map(String::as_str), current.as_mut()) {
                    (Some("Key"), Some(obj)) => obj.key = text,
                    (Some("ETag"), Some(obj)) => obj.etag = text.trim_matches('"').to_string(),
                    (Some("Size"), Some(obj)) => obj.size = text.parse().unwrap_or(0),
                    (Some("IsTruncated"), None) => is_truncated = text == "true",
                    (Some("NextContinuationToken"), None) => next_token = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"Contents" {
                    if let Some(obj) = current.take() {
                        if !obj.key.is_empty() && !obj.key.ends_with('/') {
                            objects.push(obj);
                        }
                    }
                }
                path.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(HarvestError::storage(format!("invalid listing XML: {}", e))),
            _ => {}
        }
    }

    Ok(ListPage {
        objects,
        next_token: if is_truncated { next_token } else { None },
    })
}

/// Guess a content type from the file extension.
pub fn content_type_for(key: &str) -> &'static str {
    match key.rsplit('.').next() {
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("md") => "text/markdown",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// `harvest upload`: put an existing local file into the bucket.
pub async fn run_upload(config: &Config, file: &Path, key: Option<String>) -> anyhow::Result<()> {
    let body = std::fs::read(file)
        .with_context(|| format!("The file {} was not found", file.display()))?;
    let key = key.unwrap_or_else(|| {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file.display().to_string());
        format!("{}{}", config.storage.prefix, name)
    });

    let store = ObjectStore::from_config(&config.storage, config.retry.policy())?;
    let location = store.put_object(&key, body, content_type_for(&key)).await?;
    println!("uploaded {} to {}", file.display(), location);
    Ok(())
}
