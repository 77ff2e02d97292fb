//! # Slack Harvest CLI (`harvest`)
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest check` | Validate the Slack token (`auth.test`) |
//! | `harvest fetch` | Fetch channel history + threads into CSV |
//! | `harvest upload <file>` | Upload a local file to the bucket |
//! | `harvest ask "<question>"` | Ask the Bedrock knowledge base |
//! | `harvest serve` | Run the Slack events webhook |
//!
//! Secrets come from the environment (or a `.env` file): `SLACK_BOT_TOKEN`,
//! `SLACK_CHANNEL_ID`, `SLACK_SIGNING_SECRET`, and the usual `AWS_*` keys.
//! Logs go to stderr; set `RUST_LOG` to change the level.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use slack_harvest::config::{self, Secrets};
use slack_harvest::fetch::{self, FetchArgs};
use slack_harvest::{knowledge, server, slack, storage};

/// Slack Harvest: channel history to CSV, S3, and a Bedrock knowledge base.
#[derive(Parser)]
#[command(name = "harvest", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/harvest.toml`. A missing file means defaults.
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the Slack bot token.
    Check,

    /// Fetch a channel's messages and thread replies.
    ///
    /// Writes `{channel}_{YYYY-MM-DD}.csv` locally and, with `--upload`,
    /// `{channel}-{YYYY-MM-DD}.csv` to the configured bucket.
    Fetch {
        /// Channel id. Overrides `slack.channel_id` and `SLACK_CHANNEL_ID`.
        #[arg(long)]
        channel: Option<String>,

        /// Look back this many hours instead of `fetch.lookback_hours`.
        #[arg(long)]
        hours: Option<u64>,

        /// Only fetch messages on or after this date (YYYY-MM-DD, UTC).
        #[arg(long, conflicts_with = "hours")]
        since: Option<String>,

        /// Local CSV path. Defaults to `fetch.output_dir/{channel}_{date}.csv`.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Also upload the CSV to `storage.bucket`.
        #[arg(long)]
        upload: bool,

        /// Skip the local file (requires `--upload`).
        #[arg(long, requires = "upload")]
        no_local: bool,
    },

    /// Upload an existing file to the bucket.
    Upload {
        file: PathBuf,

        /// Object key. Defaults to `storage.prefix` + file name.
        #[arg(long)]
        key: Option<String>,
    },

    /// Ask the knowledge base a question.
    Ask {
        question: String,

        /// Answer from the Q&A CSVs in `knowledge_base.source_bucket`
        /// instead of the managed knowledge base.
        #[arg(long)]
        from_bucket: bool,
    },

    /// Run the Slack events webhook server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let secrets = Secrets::from_env();

    match cli.command {
        Commands::Check => {
            slack::run_check(&cfg, &secrets).await?;
        }
        Commands::Fetch {
            channel,
            hours,
            since,
            output,
            upload,
            no_local,
        } => {
            fetch::run_fetch(
                &cfg,
                &secrets,
                FetchArgs {
                    channel,
                    hours,
                    since,
                    output,
                    upload,
                    no_local,
                },
            )
            .await?;
        }
        Commands::Upload { file, key } => {
            storage::run_upload(&cfg, &file, key).await?;
        }
        Commands::Ask {
            question,
            from_bucket,
        } => {
            knowledge::run_ask(&cfg, &question, from_bucket).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg, &secrets).await?;
        }
    }

    Ok(())
}
