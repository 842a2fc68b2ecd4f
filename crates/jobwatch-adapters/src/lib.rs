//! Source adapter contracts + markdown job-table parsing.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{GroupedListings, Record, NO_LINK};
use jobwatch_storage::{DocumentSource, FetchError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "jobwatch-adapters";

pub const PRIMARY_SOURCE_ID: &str = "primary";
pub const SECONDARY_SOURCE_ID: &str = "secondary";

/// Company cell marker meaning "same company as the row above".
pub const CONTINUATION_GLYPH: char = '↳';

/// Visa-sponsorship marker that upstream appends to job titles.
pub const NO_SPONSORSHIP_GLYPH: char = '🛂';

const APPLY_CELL: &str =
    r#"(<a href="[^"]+"><img src="[^"]+" width="\d+" alt="Apply"></a>.*?)"#;

static PRIMARY_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^\| ([^|]+) \| ([^|]+) \| [^|]+ \| {APPLY_CELL} \| (\w+ \d{{2}}) \|"
    ))
    .expect("primary row pattern is valid")
});

static CONTINUATION_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^\| ↳ \| ([^|]+) \| [^|]+ \| {APPLY_CELL} \| (\w+ \d{{2}}) \|"
    ))
    .expect("continuation row pattern is valid")
});

static BOLD_COMPANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*\[([^\]]+)\]").expect("bold company pattern is valid"));

static HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="([^"]+)""#).expect("href pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedDocument {
    pub source_id: String,
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_listing(
        &self,
        source: &dyn DocumentSource,
        target: &ListingTarget,
    ) -> Result<FetchedDocument, AdapterError>;

    fn parse_listing(&self, document: &FetchedDocument) -> Result<Vec<Record>, AdapterError>;

    fn parse_grouped(&self, document: &FetchedDocument) -> Result<GroupedListings, AdapterError> {
        Ok(self.parse_listing(document)?.into_iter().collect())
    }
}

/// Adapter for README-style job tables (`| Company | Role | Location | Link | Date |`).
#[derive(Debug, Clone, Copy)]
pub struct MarkdownTableAdapter {
    source_id: &'static str,
}

#[async_trait]
impl SourceAdapter for MarkdownTableAdapter {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    async fn fetch_listing(
        &self,
        source: &dyn DocumentSource,
        target: &ListingTarget,
    ) -> Result<FetchedDocument, AdapterError> {
        let body = source.fetch_text(&target.url).await?;
        Ok(FetchedDocument {
            source_id: self.source_id.to_string(),
            url: target.url.clone(),
            body,
            fetched_at: Utc::now(),
        })
    }

    fn parse_listing(&self, document: &FetchedDocument) -> Result<Vec<Record>, AdapterError> {
        if document.source_id != self.source_id {
            return Err(AdapterError::Message(format!(
                "document source_id={} does not match adapter source_id={}",
                document.source_id, self.source_id
            )));
        }
        Ok(parse_markdown_table(&document.body))
    }
}

pub fn primary_adapter() -> impl SourceAdapter {
    MarkdownTableAdapter {
        source_id: PRIMARY_SOURCE_ID,
    }
}

pub fn secondary_adapter() -> impl SourceAdapter {
    MarkdownTableAdapter {
        source_id: SECONDARY_SOURCE_ID,
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        PRIMARY_SOURCE_ID => Some(Box::new(MarkdownTableAdapter {
            source_id: PRIMARY_SOURCE_ID,
        })),
        SECONDARY_SOURCE_ID => Some(Box::new(MarkdownTableAdapter {
            source_id: SECONDARY_SOURCE_ID,
        })),
        _ => None,
    }
}

/// Wrap a local markdown file as if it had been fetched for `source_id`.
pub fn load_document(path: impl AsRef<Path>, source_id: &str) -> Result<FetchedDocument> {
    let path = path.as_ref();
    let body = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(FetchedDocument {
        source_id: source_id.to_string(),
        url: path.display().to_string(),
        body,
        fetched_at: Utc::now(),
    })
}

struct RawRow<'a> {
    /// `None` for rows matched by the continuation pattern.
    company_cell: Option<&'a str>,
    title_cell: &'a str,
    link_cell: &'a str,
    date_posted: &'a str,
}

fn match_row(line: &str) -> Option<RawRow<'_>> {
    if let Some(caps) = CONTINUATION_ROW.captures(line) {
        return Some(RawRow {
            company_cell: None,
            title_cell: caps.get(1)?.as_str(),
            link_cell: caps.get(2)?.as_str(),
            date_posted: caps.get(3)?.as_str(),
        });
    }
    let caps = PRIMARY_ROW.captures(line)?;
    Some(RawRow {
        company_cell: Some(caps.get(1)?.as_str()),
        title_cell: caps.get(2)?.as_str(),
        link_cell: caps.get(3)?.as_str(),
        date_posted: caps.get(4)?.as_str(),
    })
}

/// Company name from a cell, unwrapping `**[Name](...)**` decoration.
fn company_name(cell: &str) -> &str {
    BOLD_COMPANY
        .captures(cell)
        .and_then(|caps| caps.get(1))
        .map_or(cell, |m| m.as_str())
}

// Both cleaners also trim, so `Firmware Intern 🛂` is keyed as `Firmware Intern`
// rather than keeping the space left behind by the glyph.
pub fn clean_company(raw: &str) -> String {
    raw.replace(',', "").trim().to_string()
}

pub fn clean_job_title(raw: &str) -> String {
    raw.replace([',', NO_SPONSORSHIP_GLYPH], "").trim().to_string()
}

/// First `href` target in a link cell, or [`NO_LINK`].
pub fn extract_link(link_cell: &str) -> String {
    HREF.captures(link_cell)
        .and_then(|caps| caps.get(1))
        .map_or_else(|| NO_LINK.to_string(), |m| m.as_str().to_string())
}

/// Parse every listing row of a markdown job table, in source order.
///
/// Lines that match neither row shape (headers, separators, closed postings,
/// prose) are skipped. A continuation row takes the company of the nearest
/// preceding non-continuation row, or `""` if there is none.
pub fn parse_markdown_table(text: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut last_company = String::new();
    let mut skipped_rows = 0usize;

    for line in text.split('\n') {
        let Some(row) = match_row(line) else {
            if line.starts_with('|') {
                skipped_rows += 1;
            }
            continue;
        };

        let company = match row.company_cell {
            Some(cell) if !cell.contains(CONTINUATION_GLYPH) => {
                let company = clean_company(company_name(cell));
                last_company = company.clone();
                company
            }
            _ => last_company.clone(),
        };

        records.push(Record {
            company,
            job_title: clean_job_title(row.title_cell),
            link: extract_link(row.link_cell),
            date_posted: row.date_posted.to_string(),
        });
    }

    debug!(
        parsed = records.len(),
        skipped_rows, "parsed markdown job table"
    );
    records
}
