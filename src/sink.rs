//! CSV sinks: local file and object storage.
//!
//! Both sinks serialize the same fixed layout:
//!
//! ```text
//! timestamp,user,text,is_thread,thread_ts
//! 1725955200.000100,U024BE7LH,Deploy is done,No,
//! 1725955260.000200,U0G9QF9C6,Nice!,Yes,1725955200.000100
//! ```
//!
//! `is_thread` is `No` for channel messages, `Original` for the replies
//! endpoint's copy of a thread root, and `Yes` for replies. `thread_ts` is
//! the thread root id as Slack reported it, so a root carries its own ts and
//! a plain message leaves it empty. A missing author is written as `unknown`.
//!
//! [`deliver`] writes to every sink independently: one sink failing does not
//! stop the others, and an empty message set writes nothing.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{HarvestError, Result};
use crate::models::{Message, ThreadRole};
use crate::storage::ObjectStore;

pub const CSV_HEADER: [&str; 5] = ["timestamp", "user", "text", "is_thread", "thread_ts"];
const UNKNOWN_USER: &str = "unknown";

/// One CSV row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvRecord {
    pub timestamp: String,
    pub user: String,
    pub text: String,
    pub is_thread: String,
    pub thread_ts: String,
}

impl From<&Message> for CsvRecord {
    fn from(message: &Message) -> Self {
        CsvRecord {
            timestamp: message.id.clone(),
            user: message
                .author
                .clone()
                .unwrap_or_else(|| UNKNOWN_USER.to_string()),
            text: message.body.clone(),
            is_thread: message.role.as_column().to_string(),
            thread_ts: message.thread_root_id.clone().unwrap_or_default(),
        }
    }
}

impl CsvRecord {
    /// Thread role from the `is_thread` column.
    pub fn role(&self) -> Option<ThreadRole> {
        ThreadRole::from_column(&self.is_thread)
    }
}

/// Serialize `messages` as CSV (header + one row each) into `writer`.
pub fn write_csv<W: Write>(messages: &[Message], writer: W) -> Result<()> {
    let mut csv_writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    csv_writer
        .write_record(CSV_HEADER)
        .map_err(|e| HarvestError::storage(format!("writing CSV header: {}", e)))?;
    for message in messages {
        let record = CsvRecord::from(message);
        csv_writer
            .serialize(&record)
            .map_err(|e| HarvestError::storage(format!("writing CSV row {}: {}", record.timestamp, e)))?;
    }
    csv_writer
        .flush()
        .map_err(|e| HarvestError::storage(format!("flushing CSV: {}", e)))?;
    Ok(())
}

/// Serialize into an in-memory buffer.
pub fn render_csv(messages: &[Message]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_csv(messages, &mut buf)?;
    Ok(buf)
}

/// Parse a file written by [`write_csv`].
pub fn read_csv(path: &Path) -> Result<Vec<CsvRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| HarvestError::storage(format!("opening {}: {}", path.display(), e)))?;
    reader
        .deserialize()
        .collect::<std::result::Result<Vec<CsvRecord>, _>>()
        .map_err(|e| HarvestError::storage(format!("parsing {}: {}", path.display(), e)))
}

/// `{channel}-{YYYY-MM-DD}.csv`, behind an optional key prefix.
pub fn object_key(prefix: &str, channel_name: &str, date: NaiveDate) -> String {
    format!("{}{}-{}.csv", prefix, channel_name, date.format("%Y-%m-%d"))
}

/// `{channel}_{YYYY-MM-DD}.csv` for local output.
pub fn local_file_name(channel_name: &str, date: NaiveDate) -> String {
    format!("{}_{}.csv", channel_name, date.format("%Y-%m-%d"))
}

/// A destination for a finished fetch.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Human-readable destination, used in reports.
    fn describe(&self) -> String;

    /// Write all messages. Returns the final location.
    async fn write(&self, messages: &[Message]) -> Result<String>;
}

/// Truncating write to a local CSV file.
pub struct LocalFileSink {
    path: PathBuf,
}

impl LocalFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Sink for LocalFileSink {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn write(&self, messages: &[Message]) -> Result<String> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| HarvestError::storage(format!("creating {}: {}", parent.display(), e)))?;
        }
        let file = std::fs::File::create(&self.path)
            .map_err(|e| HarvestError::storage(format!("creating {}: {}", self.path.display(), e)))?;
        write_csv(messages, std::io::BufWriter::new(file))?;
        tracing::info!(path = %self.path.display(), rows = messages.len(), "wrote CSV");
        Ok(self.path.display().to_string())
    }
}

/// Serialize in memory and upload as a single object.
pub struct ObjectStoreSink {
    store: ObjectStore,
    key: String,
}

impl ObjectStoreSink {
    pub fn new(store: ObjectStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }
}

#[async_trait]
impl Sink for ObjectStoreSink {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.store.bucket().unwrap_or("?"), self.key)
    }

    async fn write(&self, messages: &[Message]) -> Result<String> {
        let body = render_csv(messages)?;
        self.store.put_object(&self.key, body, "text/csv").await
    }
}

/// Result of writing to one sink.
#[derive(Debug)]
pub struct SinkReport {
    pub sink: String,
    pub outcome: Result<String>,
}

#[derive(Debug)]
pub enum Delivery {
    /// Nothing to write; no sink was touched.
    NoData,
    Written(Vec<SinkReport>),
}

impl Delivery {
    pub fn failures(&self) -> usize {
        match self {
            Delivery::NoData => 0,
            Delivery::Written(reports) => reports.iter().filter(|r| r.outcome.is_err()).count(),
        }
    }
}

/// Write `messages` to every sink, isolating failures per sink.
pub async fn deliver(messages: &[Message], sinks: &[Box<dyn Sink>]) -> Delivery {
    if messages.is_empty() {
        tracing::info!("no messages to write");
        return Delivery::NoData;
    }

    let mut reports = Vec::with_capacity(sinks.len());
    for sink in sinks {
        let outcome = sink.write(messages).await;
        if let Err(ref e) = outcome {
            tracing::warn!(sink = %sink.describe(), error = %e, "sink failed");
        }
        reports.push(SinkReport {
            sink: sink.describe(),
            outcome,
        });
    }
    Delivery::Written(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, author: Option<&str>, body: &str, role: ThreadRole, root: Option<&str>) -> Message {
        Message {
            id: id.into(),
            author: author.map(str::to_string),
            body: body.into(),
            thread_root_id: root.map(str::to_string),
            role,
            sequence_position: 0,
            reply_count: 0,
        }
    }

    #[test]
    fn header_and_rows_match_input() {
        let messages = vec![
            message("1.000100", Some("U1"), "root, with comma", ThreadRole::TopLevel, Some("1.000100")),
            message("1.000200", Some("U2"), "first \"quoted\"", ThreadRole::Reply, Some("1.000100")),
            message("1.000300", None, "", ThreadRole::Reply, Some("1.000100")),
        ];
        let csv = String::from_utf8(render_csv(&messages).unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "timestamp,user,text,is_thread,thread_ts");
        assert_eq!(lines[1], "1.000100,U1,\"root, with comma\",No,1.000100");
        assert_eq!(lines[2], "1.000200,U2,\"first \"\"quoted\"\"\",Yes,1.000100");
        assert_eq!(lines[3], "1.000300,unknown,,Yes,1.000100");
    }

    #[test]
    fn root_echo_is_marked_original() {
        let echo = message("1.0", Some("U1"), "root", ThreadRole::RootEcho, Some("1.0"));
        let record = CsvRecord::from(&echo);
        assert_eq!(record.is_thread, "Original");
        assert_eq!(record.thread_ts, "1.0");
    }

    #[test]
    fn key_and_file_names() {
        let date = NaiveDate::from_ymd_opt(2024, 9, 10).unwrap();
        assert_eq!(object_key("", "general", date), "general-2024-09-10.csv");
        assert_eq!(object_key("slack/", "general", date), "slack/general-2024-09-10.csv");
        assert_eq!(local_file_name("general", date), "general_2024-09-10.csv");
    }
}
