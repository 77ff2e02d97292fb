//! Core data types flowing from the fetcher to the sinks.

use serde::Deserialize;

use crate::error::HarvestError;

/// How a message relates to its thread, as written to the `is_thread` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    /// A channel-level message.
    TopLevel,
    /// The replies endpoint's copy of the thread root.
    RootEcho,
    /// A reply inside a thread.
    Reply,
}

impl ThreadRole {
    pub fn as_column(&self) -> &'static str {
        match self {
            ThreadRole::TopLevel => "No",
            ThreadRole::RootEcho => "Original",
            ThreadRole::Reply => "Yes",
        }
    }

    pub fn from_column(value: &str) -> Option<Self> {
        match value {
            "No" => Some(ThreadRole::TopLevel),
            "Original" => Some(ThreadRole::RootEcho),
            "Yes" => Some(ThreadRole::Reply),
            _ => None,
        }
    }
}

/// One channel message or thread reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Slack `ts`, unique within the channel.
    pub id: String,
    pub author: Option<String>,
    pub body: String,
    pub thread_root_id: Option<String>,
    pub role: ThreadRole,
    /// Position within the thread's reply collection; 0 for top-level messages.
    pub sequence_position: usize,
    /// Replies announced by Slack on a root message.
    pub reply_count: u32,
}

impl Message {
    pub fn is_reply(&self) -> bool {
        self.role != ThreadRole::TopLevel
    }

    /// A top-level message that opens a thread.
    pub fn is_thread_root(&self) -> bool {
        self.role == ThreadRole::TopLevel
            && (self.thread_root_id.as_deref() == Some(self.id.as_str()) || self.reply_count > 0)
    }
}

/// Message object as returned by `conversations.history` / `conversations.replies`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub ts: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub reply_count: Option<u32>,
}

impl RawMessage {
    pub fn into_top_level(self) -> Message {
        Message {
            id: self.ts,
            author: self.user,
            body: self.text.unwrap_or_default(),
            thread_root_id: self.thread_ts,
            role: ThreadRole::TopLevel,
            sequence_position: 0,
            reply_count: self.reply_count.unwrap_or(0),
        }
    }

    pub fn into_reply(self, root_id: &str, position: usize) -> Message {
        let role = if position == 0 && self.ts == root_id {
            ThreadRole::RootEcho
        } else {
            ThreadRole::Reply
        };
        Message {
            id: self.ts,
            author: self.user,
            body: self.text.unwrap_or_default(),
            thread_root_id: Some(root_id.to_string()),
            role,
            sequence_position: position,
            reply_count: 0,
        }
    }
}

/// A bounded batch of messages plus the cursor for the next one.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub messages: Vec<RawMessage>,
    pub continuation_cursor: Option<String>,
}

/// Ordered output of one fetch run.
///
/// When `incomplete` is set, `messages` holds what was accumulated before
/// the failure.
#[derive(Debug, Default)]
pub struct FetchResult {
    pub messages: Vec<Message>,
    pub incomplete: Option<HarvestError>,
}

impl FetchResult {
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_none()
    }
}

/// Identity returned by `auth.test`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthIdentity {
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(ts: &str, thread_ts: Option<&str>, reply_count: Option<u32>) -> RawMessage {
        RawMessage {
            ts: ts.into(),
            user: Some("U1".into()),
            text: Some("hi".into()),
            thread_ts: thread_ts.map(str::to_string),
            reply_count,
        }
    }

    #[test]
    fn thread_root_detection() {
        assert!(raw("1.0", Some("1.0"), None).into_top_level().is_thread_root());
        assert!(raw("1.0", None, Some(2)).into_top_level().is_thread_root());
        assert!(!raw("1.0", None, None).into_top_level().is_thread_root());
        // broadcast reply: belongs to another thread
        assert!(!raw("2.0", Some("1.0"), None).into_top_level().is_thread_root());
    }

    #[test]
    fn first_reply_matching_root_is_echo() {
        assert_eq!(raw("1.0", Some("1.0"), None).into_reply("1.0", 0).role, ThreadRole::RootEcho);
        assert_eq!(raw("1.1", Some("1.0"), None).into_reply("1.0", 0).role, ThreadRole::Reply);
        assert_eq!(raw("1.0", Some("1.0"), None).into_reply("1.0", 3).role, ThreadRole::Reply);
    }

    #[test]
    fn role_columns_roundtrip() {
        for role in [ThreadRole::TopLevel, ThreadRole::RootEcho, ThreadRole::Reply] {
            assert_eq!(ThreadRole::from_column(role.as_column()), Some(role));
        }
        assert_eq!(ThreadRole::from_column("maybe"), None);
    }

    #[test]
    fn missing_text_becomes_empty_body() {
        let mut m = raw("1.0", None, None);
        m.text = None;
        assert_eq!(m.into_top_level().body, "");
    }
}
