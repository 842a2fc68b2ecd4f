//! Core listing model and link normalization for jobwatch.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobwatch-core";

/// Placeholder stored in `Record::link` when a row carries no anchor target.
pub const NO_LINK: &str = "No link found";

/// Tracking suffixes appended by the upstream job boards. Ordered longest-first
/// so the combined suffix goes before its `&utm_source=Simplify` prefix.
pub const TRACKING_SUFFIXES: [&str; 4] = [
    "&utm_source=Simplify&ref=Simplify",
    "?utm_source=Simplify&ref=Simplify",
    "&utm_source=Simplify",
    "&utm_source=GH_List",
];

/// One job posting extracted from a source document.
///
/// `link` is kept without angle brackets; [`Record::display_link`] produces the
/// bracketed form used in outbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    pub company: String,
    pub job_title: String,
    pub link: String,
    pub date_posted: String,
}

impl Record {
    pub fn new(
        company: impl Into<String>,
        job_title: impl Into<String>,
        link: impl Into<String>,
        date_posted: impl Into<String>,
    ) -> Self {
        Self {
            company: company.into(),
            job_title: job_title.into(),
            link: link.into(),
            date_posted: date_posted.into(),
        }
    }

    pub fn has_link(&self) -> bool {
        self.link != NO_LINK
    }

    pub fn display_link(&self) -> String {
        if self.has_link() {
            format!("<{}>", self.link)
        } else {
            self.link.clone()
        }
    }

    /// Three-line rendering used in announcements.
    pub fn formatted(&self) -> String {
        format!(
            "**{}** - {}\nApply: {}\nDate Posted: {}",
            self.company,
            self.job_title,
            self.display_link(),
            self.date_posted
        )
    }

    pub fn key(&self) -> ListingKey {
        ListingKey {
            company: self.company.clone(),
            job_title: self.job_title.clone(),
            link: self.link.clone(),
            date_posted: self.date_posted.clone(),
        }
    }

    pub fn normalized_link(&self) -> String {
        normalize_link(&self.link)
    }

    /// True when either normalized link contains the other.
    pub fn links_overlap(&self, other: &Record) -> bool {
        let mine = self.normalized_link();
        let theirs = other.normalized_link();
        mine.contains(&theirs) || theirs.contains(&mine)
    }
}

/// Identity of a listing in the persisted history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListingKey {
    pub company: String,
    pub job_title: String,
    pub link: String,
    pub date_posted: String,
}

impl ListingKey {
    pub fn fields(&self) -> [&str; 4] {
        [
            self.company.as_str(),
            self.job_title.as_str(),
            self.link.as_str(),
            self.date_posted.as_str(),
        ]
    }
}

/// Strip the known tracking parameters from an application link.
///
/// This is literal substring removal, not query-string parsing.
pub fn normalize_link(link: &str) -> String {
    TRACKING_SUFFIXES
        .iter()
        .fold(link.to_string(), |acc, suffix| acc.replace(suffix, ""))
}

/// Listings of one source grouped company -> job title -> record.
///
/// Insertion order is preserved. Re-inserting an existing (company, title)
/// pair replaces the record in place, so the later row wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupedListings {
    companies: IndexMap<String, IndexMap<String, Record>>,
}

impl GroupedListings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: Record) {
        self.companies
            .entry(record.company.clone())
            .or_default()
            .insert(record.job_title.clone(), record);
    }

    pub fn company(&self, company: &str) -> Option<&IndexMap<String, Record>> {
        self.companies.get(company)
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.companies.values().flat_map(|jobs| jobs.values())
    }

    pub fn len(&self) -> usize {
        self.companies.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<Record> for GroupedListings {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let mut grouped = Self::new();
        for record in iter {
            grouped.insert(record);
        }
        grouped
    }
}
