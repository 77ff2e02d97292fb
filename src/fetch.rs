//! Paginated channel fetcher.
//!
//! [`Fetcher::fetch_all`] runs the whole fetch for one channel:
//!
//! 1. Credential precondition (`auth.test`). Failure returns
//!    [`HarvestError::Auth`] before any history request is made.
//! 2. Page through `conversations.history` until no cursor is returned.
//! 3. For each thread root, page through `conversations.replies` and inline
//!    the replies directly after the root.
//!
//! # Partial results
//!
//! Once the credential check passes, failures never discard data: the
//! returned [`FetchResult`] holds everything accumulated so far and the
//! error in `incomplete`. A history failure stops the run before any thread
//! is fetched. A thread failure keeps earlier threads and keeps the remaining
//! top-level messages without their replies. No new reply requests are
//! started after the failure is seen, but with `thread_concurrency = n` up to
//! `n - 1` later requests may already be in flight; they are dropped and
//! their results discarded. At concurrency 1 nothing follows the failure.
//!
//! # Thread concurrency
//!
//! Reply fetches can run `thread_concurrency` at a time. Results are
//! consumed in top-level order (ordered buffering), so the output is the
//! same as a sequential run.

use anyhow::{bail, Context};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use futures::stream::{self, StreamExt};
use std::path::PathBuf;

use crate::config::{Config, Secrets};
use crate::error::{HarvestError, Result};
use crate::models::{AuthIdentity, FetchResult, Message, ThreadRole};
use crate::sink::{self, Delivery, LocalFileSink, ObjectStoreSink, Sink};
use crate::slack::SlackClient;
use crate::storage::ObjectStore;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub thread_concurrency: usize,
    pub include_root_echo: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            thread_concurrency: 1,
            include_root_echo: true,
        }
    }
}

pub struct Fetcher<'a> {
    client: &'a SlackClient,
    options: FetchOptions,
}

/// Validate the token. The only fetch-side error that aborts outright.
pub async fn verify_credentials(client: &SlackClient) -> Result<AuthIdentity> {
    let identity = client.auth_test().await?;
    tracing::info!(
        team = identity.team.as_deref().unwrap_or("-"),
        user = identity.user.as_deref().unwrap_or("-"),
        "slack token valid"
    );
    Ok(identity)
}

impl<'a> Fetcher<'a> {
    pub fn new(client: &'a SlackClient, options: FetchOptions) -> Self {
        let options = FetchOptions {
            thread_concurrency: options.thread_concurrency.max(1),
            ..options
        };
        Self { client, options }
    }

    pub async fn fetch_all(
        &self,
        channel_id: &str,
        oldest: Option<DateTime<Utc>>,
    ) -> Result<FetchResult> {
        verify_credentials(self.client).await?;

        let (top_level, history_error) = self.fetch_history(channel_id, oldest).await;
        if let Some(err) = history_error {
            return Ok(FetchResult {
                messages: top_level,
                incomplete: Some(err),
            });
        }

        Ok(self.inline_threads(channel_id, oldest, top_level).await)
    }

    async fn fetch_history(
        &self,
        channel_id: &str,
        oldest: Option<DateTime<Utc>>,
    ) -> (Vec<Message>, Option<HarvestError>) {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = match self
                .client
                .history_page(channel_id, oldest, cursor.as_deref())
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!(
                        channel = channel_id,
                        pages,
                        kept = messages.len(),
                        error = %e,
                        "history fetch failed"
                    );
                    return (messages, Some(e));
                }
            };

            pages += 1;
            tracing::info!(
                channel = channel_id,
                page = pages,
                count = page.messages.len(),
                "fetched history page"
            );
            messages.extend(page.messages.into_iter().map(|m| m.into_top_level()));

            match page.continuation_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        (messages, None)
    }

    async fn inline_threads(
        &self,
        channel_id: &str,
        oldest: Option<DateTime<Utc>>,
        top_level: Vec<Message>,
    ) -> FetchResult {
        let mut replies = stream::iter(top_level.iter())
            .map(move |message| async move {
                if message.is_thread_root() {
                    Some(self.fetch_thread(channel_id, &message.id, oldest).await)
                } else {
                    None
                }
            })
            .buffered(self.options.thread_concurrency);

        let mut out = Vec::with_capacity(top_level.len());
        let mut incomplete = None;
        let mut consumed = 0usize;

        while let Some(thread) = replies.next().await {
            out.push(top_level[consumed].clone());
            consumed += 1;
            match thread {
                None => {}
                Some(Ok(thread_messages)) => out.extend(thread_messages),
                Some(Err(e)) => {
                    tracing::error!(
                        channel = channel_id,
                        thread = %top_level[consumed - 1].id,
                        error = %e,
                        "thread fetch failed, keeping remaining messages without replies"
                    );
                    incomplete = Some(e);
                    break;
                }
            }
        }
        drop(replies);

        out.extend(top_level[consumed..].iter().cloned());
        FetchResult {
            messages: out,
            incomplete,
        }
    }

    async fn fetch_thread(
        &self,
        channel_id: &str,
        root_id: &str,
        oldest: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let mut thread = Vec::new();
        let mut position = 0usize;
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .client
                .replies_page(channel_id, root_id, oldest, cursor.as_deref())
                .await?;

            for raw in page.messages {
                let message = raw.into_reply(root_id, position);
                position += 1;
                if message.role == ThreadRole::RootEcho && !self.options.include_root_echo {
                    continue;
                }
                thread.push(message);
            }

            match page.continuation_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        tracing::debug!(channel = channel_id, thread = root_id, count = thread.len(), "fetched thread");
        Ok(thread)
    }
}

/// Arguments of `harvest fetch`.
#[derive(Debug, Default)]
pub struct FetchArgs {
    pub channel: Option<String>,
    pub hours: Option<u64>,
    pub since: Option<String>,
    pub output: Option<PathBuf>,
    pub upload: bool,
    pub no_local: bool,
}

/// Lower time bound: `--since` date wins over `--hours`, which wins over config.
pub fn resolve_oldest(
    config: &Config,
    hours: Option<u64>,
    since: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<DateTime<Utc>> {
    if let Some(since) = since {
        let date = NaiveDate::parse_from_str(since, "%Y-%m-%d")?;
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    let hours = hours.unwrap_or(config.fetch.lookback_hours);
    let lookback = i64::try_from(hours)
        .ok()
        .and_then(ChronoDuration::try_hours)
        .with_context(|| format!("lookback of {} hours is out of range", hours))?;
    now.checked_sub_signed(lookback)
        .with_context(|| format!("lookback of {} hours is out of range", hours))
}

/// `harvest fetch`: fetch one channel and deliver it to the configured sinks.
pub async fn run_fetch(config: &Config, secrets: &Secrets, args: FetchArgs) -> anyhow::Result<()> {
    let channel_id = config.channel_id(args.channel.as_deref(), secrets)?;
    let client = SlackClient::from_config(config, secrets)?;
    let now = Utc::now();
    let oldest = resolve_oldest(config, args.hours, args.since.as_deref(), now)?;

    let fetcher = Fetcher::new(
        &client,
        FetchOptions {
            thread_concurrency: config.fetch.thread_concurrency,
            include_root_echo: config.fetch.include_root_echo,
        },
    );

    tracing::info!(channel = %channel_id, oldest = %oldest, "fetching messages");
    let result = match fetcher.fetch_all(&channel_id, Some(oldest)).await {
        Ok(result) => result,
        Err(e @ HarvestError::Auth(_)) => {
            bail!("Exiting due to invalid token: {}", e);
        }
        Err(e) => return Err(e.into()),
    };

    let channel_name = client.channel_name(&channel_id).await;
    let today = now.date_naive();

    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
    if !args.no_local {
        let path = args.output.clone().unwrap_or_else(|| {
            config
                .fetch
                .output_dir
                .join(sink::local_file_name(&channel_name, today))
        });
        sinks.push(Box::new(LocalFileSink::new(path)));
    }
    if args.upload {
        let key = sink::object_key(&config.storage.prefix, &channel_name, today);
        sinks.push(Box::new(ObjectStoreSink::new(
            ObjectStore::from_config(&config.storage, config.retry.policy())?,
            key,
        )));
    }

    println!("fetch {} ({})", channel_name, channel_id);
    println!("  messages: {}", result.messages.len());

    match sink::deliver(&result.messages, &sinks).await {
        Delivery::NoData => println!("  no messages found in the requested period"),
        Delivery::Written(reports) => {
            for report in reports {
                match report.outcome {
                    Ok(location) => println!("  wrote {}", location),
                    Err(e) => {
                        tracing::error!(sink = %report.sink, error = %e, "delivery failed");
                        println!("  failed {}: {}", report.sink, e);
                    }
                }
            }
        }
    }

    if let Some(err) = result.incomplete {
        bail!("fetch incomplete, partial results kept: {}", err);
    }
    println!("ok");
    Ok(())
}
