//! Slack events webhook.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/slack/events` | Slack Events API callback |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `url_verification` requests are answered with their challenge. Event
//! callbacks are deduplicated on `event_id`; a repeat is acknowledged with
//! `{"status": "ignored"}`. An `app_mention` is acknowledged right away and
//! answered on a spawned task: the mention prefix is stripped, the question
//! goes to the knowledge base, and the answer is posted back to the channel.
//!
//! When `SLACK_SIGNING_SECRET` is set, every request must carry a valid
//! `X-Slack-Signature` over `v0:{timestamp}:{body}` with a timestamp within
//! five minutes.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_signature", "message": "signature mismatch" } }
//! ```

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::{Arc, Mutex};
use tower_http::trace::TraceLayer;

use crate::config::{Config, Secrets};
use crate::dedup::EventDeduper;
use crate::knowledge::{Answerer, KnowledgeBase};
use crate::slack::SlackClient;

const FALLBACK_REPLY: &str =
    "An error occurred while processing your request. Please try again or contact support.";
const MAX_CLOCK_SKEW_SECS: i64 = 60 * 5;

/// Shared state for the webhook handlers.
#[derive(Clone)]
pub struct AppState {
    slack: Arc<SlackClient>,
    answerer: Arc<dyn Answerer>,
    dedup: Arc<Mutex<EventDeduper>>,
    signing_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(slack: SlackClient, answerer: Arc<dyn Answerer>, dedup_capacity: usize) -> Self {
        Self {
            slack: Arc::new(slack),
            answerer,
            dedup: Arc::new(Mutex::new(EventDeduper::new(dedup_capacity))),
            signing_secret: None,
        }
    }

    pub fn with_signing_secret(mut self, secret: impl Into<Arc<str>>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }

    /// True if the event id was already handled.
    fn is_duplicate(&self, event_id: &str) -> bool {
        match self.dedup.lock() {
            Ok(mut dedup) => dedup.check_and_insert(event_id),
            Err(poisoned) => poisoned.into_inner().check_and_insert(event_id),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/slack/events", post(handle_events))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `harvest serve`: run the webhook until the process is stopped.
pub async fn run_server(config: &Config, secrets: &Secrets) -> anyhow::Result<()> {
    let slack = SlackClient::from_config(config, secrets)?;
    let kb = KnowledgeBase::new(config.knowledge_base.clone(), config.retry.policy())?;
    let mut state = AppState::new(slack, Arc::new(kb), config.server.dedup_capacity);
    match &secrets.slack_signing_secret {
        Some(secret) => state = state.with_signing_secret(secret.as_str()),
        None => tracing::warn!("SLACK_SIGNING_SECRET not set, request signatures are not verified"),
    }

    let bind_addr = config.server.bind.clone();
    println!("events server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "invalid_signature",
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /slack/events ============

#[derive(Debug, Deserialize)]
struct Mention {
    channel: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: String,
}

async fn handle_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    if let Some(secret) = &state.signing_secret {
        check_request_signature(secret, &headers, &body, chrono::Utc::now().timestamp())?;
    }

    let payload: Value =
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid JSON: {}", e)))?;

    match payload.get("type").and_then(Value::as_str) {
        Some("url_verification") => {
            let challenge = payload
                .get("challenge")
                .and_then(Value::as_str)
                .ok_or_else(|| bad_request("url_verification without challenge"))?;
            Ok(Json(json!({ "challenge": challenge })))
        }
        Some("event_callback") => handle_callback(state, &payload),
        _ => Ok(Json(json!({ "status": "ignored" }))),
    }
}

fn handle_callback(state: AppState, payload: &Value) -> Result<Json<Value>, AppError> {
    if let Some(event_id) = payload.get("event_id").and_then(Value::as_str) {
        if state.is_duplicate(event_id) {
            tracing::info!(event_id, "duplicate event, ignoring");
            return Ok(Json(json!({ "status": "ignored" })));
        }
    }

    let event = payload
        .get("event")
        .ok_or_else(|| bad_request("event_callback without event"))?;
    if event.get("type").and_then(Value::as_str) != Some("app_mention") {
        return Ok(Json(json!({ "status": "ignored" })));
    }

    let mention: Mention = serde_json::from_value(event.clone())
        .map_err(|e| bad_request(format!("malformed app_mention: {}", e)))?;
    tokio::spawn(answer_mention(state, mention));
    Ok(Json(json!({ "status": "success" })))
}

async fn answer_mention(state: AppState, mention: Mention) {
    let question = clean_mention_text(&mention.text);
    tracing::info!(
        channel = %mention.channel,
        user = mention.user.as_deref().unwrap_or("-"),
        %question,
        "handling mention"
    );

    let reply = match state.answerer.answer(&question).await {
        Ok(answer) => answer,
        Err(e) => {
            tracing::error!(error = %e, "knowledge base query failed");
            FALLBACK_REPLY.to_string()
        }
    };

    if let Err(e) = state.slack.post_message(&mention.channel, &reply, None).await {
        tracing::error!(channel = %mention.channel, error = %e, "posting answer failed");
    }
}

/// Drop the leading `<@U…>` mention.
pub fn clean_mention_text(text: &str) -> String {
    match text.split_once('>') {
        Some((_, rest)) => rest.trim().to_string(),
        None => text.trim().to_string(),
    }
}

fn check_request_signature(
    secret: &str,
    headers: &HeaderMap,
    body: &[u8],
    now: i64,
) -> Result<(), AppError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized(format!("missing {} header", name)))
    };
    let timestamp = header("x-slack-request-timestamp")?;
    let signature = header("x-slack-signature")?;

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| unauthorized("malformed request timestamp"))?;
    if (now - ts).abs() > MAX_CLOCK_SKEW_SECS {
        return Err(unauthorized("request timestamp too old"));
    }
    if !verify_signature(secret, timestamp, body, signature) {
        return Err(unauthorized("signature mismatch"));
    }
    Ok(())
}

/// Check a `v0=<hex>` signature over `v0:{timestamp}:{body}`.
pub fn verify_signature(secret: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
    let Some(expected) = signature
        .strip_prefix("v0=")
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
    else {
        return false;
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
