//! # Slack Harvest
//!
//! Pulls a Slack channel's recent history, with every thread's replies
//! inlined after their root, and writes it as CSV to a local file and/or
//! an S3 bucket. The same exports can back a Bedrock knowledge base, which
//! a small webhook server uses to answer `@mentions` in Slack.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │  Slack API  │──▶│   Fetcher   │──▶│    Sinks     │
//! │ history/rep │   │ pages+thread│   │ CSV file/S3  │
//! └──────┬──────┘   └─────────────┘   └──────┬───────┘
//!        │           (retry policy)          │
//!        │                                   ▼
//!   ┌────┴─────┐                      ┌──────────────┐
//!   │  Events  │◀─────────────────────│   Bedrock    │
//!   │  server  │     answers          │ knowledge KB │
//!   └──────────┘                      └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest check                          # validate SLACK_BOT_TOKEN
//! harvest fetch --channel C0123 --hours 24
//! harvest fetch --upload --no-local      # straight to S3
//! harvest ask "what is the glycemic index?"
//! harvest serve                          # Slack events webhook
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment secrets |
//! | [`error`] | Error taxonomy |
//! | [`retry`] | Shared retry/backoff policy |
//! | [`models`] | Messages, pages, fetch results |
//! | [`slack`] | Slack Web API client |
//! | [`fetch`] | Paginated history + thread fetcher |
//! | [`sink`] | CSV serialization and sinks |
//! | [`sigv4`] | AWS Signature V4 |
//! | [`storage`] | S3 object storage client |
//! | [`knowledge`] | Bedrock question answering |
//! | [`dedup`] | Event id dedup cache |
//! | [`server`] | Slack events webhook |

pub mod config;
pub mod dedup;
pub mod error;
pub mod fetch;
pub mod knowledge;
pub mod models;
pub mod retry;
pub mod server;
pub mod sigv4;
pub mod sink;
pub mod slack;
pub mod storage;
