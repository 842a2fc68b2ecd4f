//! Webhook notifier, message chunking and announcement formatting.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone};
use jobwatch_core::Record;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "jobwatch-notify";

/// Maximum message length accepted by the webhook endpoint, in characters.
pub const MESSAGE_LIMIT: usize = 2000;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook rejected message: {status}, {body}")]
    Rejected { status: u16, body: String },
}

/// Outbound channel for plain-text messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post(&self, content: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload<'a> {
    pub content: &'a str,
}

#[derive(Debug, Clone)]
pub struct WebhookOptions {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    options: WebhookOptions,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, options: WebhookOptions) -> Self {
        Self { client, options }
    }
}

/// The endpoint acknowledges an accepted message with 204 and nothing else.
pub fn check_accepted(status: StatusCode, body: String) -> Result<(), NotifyError> {
    if status == StatusCode::NO_CONTENT {
        Ok(())
    } else {
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn post(&self, content: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.options.url)
            .json(&WebhookPayload { content })
            .send()
            .await?;

        let status = response.status();
        let body = if status == StatusCode::NO_CONTENT {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };
        check_accepted(status, body)?;
        debug!(chars = content.chars().count(), "webhook accepted message");
        Ok(())
    }
}

/// Split a message into chunks of at most `limit` characters without breaking lines.
///
/// Lines are packed greedily. A single line longer than `limit` is emitted as
/// its own oversized chunk. Joining the chunks with `'\n'` gives back `message`.
pub fn split_message(message: &str, limit: usize) -> Vec<String> {
    if message.is_empty() {
        return Vec::new();
    }

    let mut parts = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;

    for line in message.split('\n') {
        let line_len = line.chars().count();
        if !current.is_empty() && current_len + 1 + line_len > limit {
            parts.push(current.join("\n"));
            current.clear();
            current_len = 0;
        }
        if !current.is_empty() {
            current_len += 1;
        }
        current_len += line_len;
        current.push(line);
    }

    if !current.is_empty() {
        parts.push(current.join("\n"));
    }
    parts
}

/// Mention token for a role on the messaging platform.
pub fn role_mention(role_id: &str) -> String {
    format!("<@&{role_id}>")
}

/// Announcement body: dated header with a role mention, a blank line, then one
/// three-line block per listing.
pub fn announcement(date: NaiveDate, role_id: &str, records: &[Record]) -> String {
    let mut lines = vec![
        format!(
            "**Job Listings for {}** {}",
            date.format("%Y-%m-%d"),
            role_mention(role_id)
        ),
        String::new(),
    ];
    lines.extend(records.iter().map(Record::formatted));
    lines.join("\n")
}

pub fn health_message<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("bot is running at {}", now.format("%Y-%m-%d %H:%M:%S"))
}

pub fn run_summary(new_listings: usize, existing_listings: usize) -> String {
    format!("Found {new_listings} new listings and {existing_listings} existing listings.")
}
