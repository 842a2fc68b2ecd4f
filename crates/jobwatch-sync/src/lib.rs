//! Sync pipeline: fetch both listing sources, reconcile against history,
//! announce new listings, then persist them.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use jobwatch_adapters::{
    adapter_for_source, ListingTarget, PRIMARY_SOURCE_ID, SECONDARY_SOURCE_ID,
};
use jobwatch_core::{GroupedListings, ListingKey, Record};
use jobwatch_notify::{
    announcement, health_message, run_summary, split_message, Notifier, WebhookNotifier,
    WebhookOptions, MESSAGE_LIMIT,
};
use jobwatch_storage::{
    DocumentSource, HistoryStore, HttpClientConfig, HttpFetcher, ListingStore,
    RepoHistoryOptions, RepoHistoryStore, GITHUB_API_BASE,
};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-sync";

pub const DEFAULT_HISTORY_PATH: &str = "./listings.csv";

pub const DEFAULT_REPO_HISTORY_PATH: &str = "listings.csv";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub source_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub primary: SourceConfig,
    pub secondary: SourceConfig,
    pub listings_webhook_url: String,
    pub logs_webhook_url: String,
    pub role_id: String,
    pub history_path: PathBuf,
    /// Keep history in a repository instead of `history_path`.
    pub repo_history: Option<RepoHistoryOptions>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub health_ping: bool,
    pub message_limit: usize,
}

impl SyncConfig {
    /// Read configuration from the process environment, loading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| {
            optional(key)
                .with_context(|| format!("Required environment variable '{key}' is not set"))
        };

        let repo_history = match (optional("REPO_NAME"), optional("TOKEN_GITHUB")) {
            (Some(repo), Some(token)) => Some(RepoHistoryOptions {
                api_base: optional("JOBWATCH_GITHUB_API")
                    .unwrap_or_else(|| GITHUB_API_BASE.to_string()),
                repo,
                path: optional("JOBWATCH_REPO_HISTORY_PATH")
                    .unwrap_or_else(|| DEFAULT_REPO_HISTORY_PATH.to_string()),
                token,
            }),
            (None, None) => None,
            _ => anyhow::bail!("REPO_NAME and TOKEN_GITHUB must be set together"),
        };

        Ok(Self {
            primary: SourceConfig {
                source_id: PRIMARY_SOURCE_ID.to_string(),
                url: require("JOB_REPO_URL")?,
            },
            secondary: SourceConfig {
                source_id: SECONDARY_SOURCE_ID.to_string(),
                url: require("SECONDARY_REPO_URL")?,
            },
            listings_webhook_url: require("LISTINGS_WEBHOOK_URL")?,
            logs_webhook_url: require("LOGS_WEBHOOK_URL")?,
            role_id: require("LISTINGS_ROLE_ID")?,
            history_path: optional("JOBWATCH_HISTORY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HISTORY_PATH)),
            repo_history,
            user_agent: lookup("JOBWATCH_USER_AGENT")
                .unwrap_or_else(|| "jobwatch-bot/0.1".to_string()),
            http_timeout_secs: match lookup("JOBWATCH_HTTP_TIMEOUT_SECS") {
                Some(v) => v
                    .parse()
                    .context("JOBWATCH_HTTP_TIMEOUT_SECS must be a whole number of seconds")?,
                None => 20,
            },
            health_ping: match lookup("JOBWATCH_HEALTH_PING") {
                Some(v) => parse_flag(&v).with_context(|| {
                    format!("JOBWATCH_HEALTH_PING must be true or false, got '{v}'")
                })?,
                None => true,
            },
            message_limit: MESSAGE_LIMIT,
        })
    }

    /// Where listing history lives, for log and CLI output.
    pub fn history_location(&self) -> String {
        match &self.repo_history {
            Some(repo) => format!("{}:{}", repo.repo, repo.path),
            None => self.history_path.display().to_string(),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub secondary_total: usize,
    pub primary_total: usize,
    pub secondary_new: usize,
    pub primary_new: usize,
    pub cross_source_duplicates: usize,
    pub already_known: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    /// New secondary listings in source order, then new primary listings.
    pub new_listings: Vec<Record>,
    pub counts: ReconcileCounts,
}

impl ReconcileOutcome {
    pub fn keys(&self) -> Vec<ListingKey> {
        self.new_listings.iter().map(Record::key).collect()
    }

    pub fn summary(&self) -> String {
        let c = &self.counts;
        format!(
            "secondary: {} listed, {} new; primary: {} listed, {} new, {} duplicated in secondary; {} already known",
            c.secondary_total,
            c.secondary_new,
            c.primary_total,
            c.primary_new,
            c.cross_source_duplicates,
            c.already_known
        )
    }
}

/// Whether a primary listing re-lists something the secondary source already has.
///
/// Only jobs under the same company are compared: an identical title is a
/// duplicate, and so is a link that overlaps once tracking parameters are gone.
pub fn is_cross_source_duplicate(record: &Record, secondary: &GroupedListings) -> bool {
    let Some(jobs) = secondary.company(&record.company) else {
        return false;
    };
    jobs.contains_key(&record.job_title) || jobs.values().any(|job| job.links_overlap(record))
}

/// Reconcile both sources against `history`, which gains the key of every accepted listing.
///
/// The secondary source is trusted and goes first; primary listings that
/// duplicate a secondary one are dropped.
pub fn reconcile(
    history: &mut HashSet<ListingKey>,
    primary: &GroupedListings,
    secondary: &GroupedListings,
) -> ReconcileOutcome {
    let mut new_listings = Vec::new();
    let mut counts = ReconcileCounts {
        secondary_total: secondary.len(),
        primary_total: primary.len(),
        ..Default::default()
    };

    for record in secondary.records() {
        if history.insert(record.key()) {
            new_listings.push(record.clone());
            counts.secondary_new += 1;
        } else {
            counts.already_known += 1;
        }
    }

    for record in primary.records() {
        if is_cross_source_duplicate(record, secondary) {
            counts.cross_source_duplicates += 1;
            continue;
        }
        if history.insert(record.key()) {
            new_listings.push(record.clone());
            counts.primary_new += 1;
        } else {
            counts.already_known += 1;
        }
    }

    ReconcileOutcome {
        new_listings,
        counts,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub known_before: usize,
    pub new_listings: usize,
    pub messages_sent: usize,
    pub counts: ReconcileCounts,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn DocumentSource>,
    store: Box<dyn ListingStore>,
    listings: Box<dyn Notifier>,
    logs: Box<dyn Notifier>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let listings = WebhookNotifier::new(
            http.client().clone(),
            WebhookOptions {
                url: config.listings_webhook_url.clone(),
            },
        );
        let logs = WebhookNotifier::new(
            http.client().clone(),
            WebhookOptions {
                url: config.logs_webhook_url.clone(),
            },
        );
        let store: Box<dyn ListingStore> = match &config.repo_history {
            Some(options) => Box::new(RepoHistoryStore::new(
                http.client().clone(),
                options.clone(),
            )),
            None => Box::new(HistoryStore::new(config.history_path.clone())),
        };
        info!(history = %config.history_location(), "using listing history");

        Ok(Self::with_capabilities(
            config,
            Box::new(http),
            store,
            Box::new(listings),
            Box::new(logs),
        ))
    }

    pub fn with_capabilities(
        config: SyncConfig,
        source: Box<dyn DocumentSource>,
        store: Box<dyn ListingStore>,
        listings: Box<dyn Notifier>,
        logs: Box<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            listings,
            logs,
        }
    }

    /// One full pass: load history, fetch + parse, reconcile, announce, persist.
    ///
    /// History is written only after every message went out. A failure
    /// between the last send and the append leaves listings announced but
    /// unrecorded, so the next run announces them again.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "starting sync run");

        if self.config.health_ping {
            self.logs
                .post(&health_message(&Local::now()))
                .await
                .context("posting health message")?;
        }

        let mut history = self.store.load().await.context("loading listing history")?;
        let known_before = history.len();

        let primary = self.fetch_grouped(&self.config.primary).await?;
        let secondary = self.fetch_grouped(&self.config.secondary).await?;

        let outcome = reconcile(&mut history, &primary, &secondary);
        info!(%run_id, "{}", outcome.summary());

        let mut messages_sent = 0usize;
        if !outcome.new_listings.is_empty() {
            let message = announcement(
                Local::now().date_naive(),
                &self.config.role_id,
                &outcome.new_listings,
            );
            for part in split_message(&message, self.config.message_limit) {
                self.listings
                    .post(&part)
                    .await
                    .with_context(|| format!("posting listings chunk {}", messages_sent + 1))?;
                messages_sent += 1;
            }
        }

        self.logs
            .post(&run_summary(outcome.new_listings.len(), known_before))
            .await
            .context("posting run summary")?;

        self.store
            .append(&outcome.keys())
            .await
            .context("persisting new listings")?;

        let finished_at = Utc::now();
        info!(
            %run_id,
            new_listings = outcome.new_listings.len(),
            messages_sent,
            "sync run complete"
        );

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            known_before,
            new_listings: outcome.new_listings.len(),
            messages_sent,
            counts: outcome.counts,
        })
    }

    /// Send an ad-hoc message to the logs channel.
    pub async fn ping(&self, message: &str) -> Result<()> {
        self.logs.post(message).await.context("posting ping message")
    }

    pub async fn clear_history(&self) -> Result<()> {
        self.store.reset().await.context("resetting listing history")
    }

    async fn fetch_grouped(&self, source: &SourceConfig) -> Result<GroupedListings> {
        let adapter = adapter_for_source(&source.source_id)
            .with_context(|| format!("no adapter registered for {}", source.source_id))?;
        let document = adapter
            .fetch_listing(
                self.source.as_ref(),
                &ListingTarget {
                    url: source.url.clone(),
                },
            )
            .await
            .with_context(|| format!("fetching {} listings from {}", source.source_id, source.url))?;
        let grouped = adapter
            .parse_grouped(&document)
            .with_context(|| format!("parsing {} listings", source.source_id))?;
        debug!(
            source_id = %source.source_id,
            listings = grouped.len(),
            bytes = document.body.len(),
            "parsed source"
        );
        Ok(grouped)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    SyncPipeline::new(config)?.run_once().await
}
