//! Listing history persistence, local or in a repository, plus HTTP document fetching.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jobwatch_core::ListingKey;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-storage";

pub const HISTORY_HEADER: &str = "company,job_title,link,date_posted";

pub const GITHUB_API_BASE: &str = "https://api.github.com";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("listing field contains the field separator: {0:?}")]
    SeparatorInField(String),
    #[error("history repository returned {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("history content could not be decoded: {0}")]
    Decode(String),
    #[error("history request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Persisted set of previously announced listings.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn load(&self) -> Result<HashSet<ListingKey>, HistoryError>;

    async fn append(&self, keys: &[ListingKey]) -> Result<(), HistoryError>;

    async fn reset(&self) -> Result<(), HistoryError>;
}

/// Flat comma-separated history file.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn render_row(key: &ListingKey) -> Result<String, HistoryError> {
        if let Some(field) = key.fields().into_iter().find(|f| f.contains(',')) {
            return Err(HistoryError::SeparatorInField(field.to_string()));
        }
        Ok(key.fields().join(","))
    }

    /// Parse history content. `None` means the header is missing.
    pub fn parse_rows(content: &str) -> Option<HashSet<ListingKey>> {
        let mut lines = content.lines();
        if lines.next().map(str::trim_end) != Some(HISTORY_HEADER) {
            return None;
        }

        let mut keys = HashSet::new();
        for (idx, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            let [company, job_title, link, date_posted] = fields.as_slice() else {
                warn!(row = idx + 2, fields = fields.len(), "skipping malformed history row");
                continue;
            };
            keys.insert(ListingKey {
                company: company.to_string(),
                job_title: job_title.to_string(),
                link: link.to_string(),
                date_posted: date_posted.to_string(),
            });
        }
        Some(keys)
    }

    async fn recreate(&self) -> Result<(), HistoryError> {
        self.replace_contents(&format!("{HISTORY_HEADER}\n")).await
    }

    /// Replace the file contents via a temp file in the same directory and a rename.
    async fn replace_contents(&self, contents: &str) -> Result<(), HistoryError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating history directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), contents.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp history file {}", temp_path.display()))?;
        file.write_all(contents.as_bytes())
            .await
            .with_context(|| format!("writing temp history file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp history file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(HistoryError::Io(anyhow::Error::new(err).context(format!(
                "atomically renaming temp history {} -> {}",
                temp_path.display(),
                self.path.display()
            ))));
        }
        Ok(())
    }
}

/// History text with `keys` appended as rows.
///
/// `current` is kept when it starts with the header; otherwise the result
/// starts from a fresh header.
pub fn extend_history(current: Option<&str>, keys: &[ListingKey]) -> Result<String, HistoryError> {
    let rows = keys
        .iter()
        .map(HistoryStore::render_row)
        .collect::<Result<Vec<_>, _>>()?;

    let mut next = match current {
        Some(content) if HistoryStore::parse_rows(content).is_some() => {
            content.trim_end().to_string()
        }
        _ => HISTORY_HEADER.to_string(),
    };
    next.push('\n');
    for row in &rows {
        next.push_str(row);
        next.push('\n');
    }
    Ok(next)
}

#[async_trait]
impl ListingStore for HistoryStore {
    async fn load(&self) -> Result<HashSet<ListingKey>, HistoryError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no history yet; creating empty store");
                self.recreate().await?;
                return Ok(HashSet::new());
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "history unreadable; treating as empty");
                return Ok(HashSet::new());
            }
        };

        match Self::parse_rows(&content) {
            Some(keys) => {
                debug!(path = %self.path.display(), rows = keys.len(), "loaded listing history");
                Ok(keys)
            }
            None => {
                warn!(path = %self.path.display(), "history header missing; recreating store");
                self.recreate().await?;
                Ok(HashSet::new())
            }
        }
    }

    async fn append(&self, keys: &[ListingKey]) -> Result<(), HistoryError> {
        if keys.is_empty() {
            return Ok(());
        }

        let current = match fs::read_to_string(&self.path).await {
            Ok(content) => Some(content),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                return Err(HistoryError::Io(
                    anyhow::Error::new(err)
                        .context(format!("reading history {}", self.path.display())),
                ))
            }
        };

        let next = extend_history(current.as_deref(), keys)?;
        self.replace_contents(&next).await?;
        info!(path = %self.path.display(), appended = keys.len(), "appended listings to history");
        Ok(())
    }

    async fn reset(&self) -> Result<(), HistoryError> {
        self.recreate().await
    }
}

/// Anything that can turn a URL into document text.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

pub fn check_status(status: StatusCode, url: &str) -> Result<(), FetchError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl DocumentSource for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let final_url = resp.url().to_string();
            check_status(resp.status(), &final_url)?;
            let body = resp.text().await?;
            debug!(bytes = body.len(), "fetched document");
            Ok::<_, FetchError>(body)
        }
        .instrument(span)
        .await
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RepoHistoryOptions {
    pub api_base: String,
    /// `owner/name`
    pub repo: String,
    /// File path inside the repository.
    pub path: String,
    pub token: String,
}

impl std::fmt::Debug for RepoHistoryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoHistoryOptions")
            .field("api_base", &self.api_base)
            .field("repo", &self.repo)
            .field("path", &self.path)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// File body as returned by `GET /repos/{repo}/contents/{path}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentsFile {
    pub sha: String,
    #[serde(default)]
    pub content: String,
}

/// Body of `PUT /repos/{repo}/contents/{path}`. `sha` is required to update an existing file.
#[derive(Debug, Clone, Serialize)]
pub struct PutContents<'a> {
    pub message: &'a str,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha: Option<&'a str>,
}

impl<'a> PutContents<'a> {
    pub fn new(message: &'a str, text: &str, sha: Option<&'a str>) -> Self {
        Self {
            message,
            content: STANDARD.encode(text),
            sha,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHistory {
    pub sha: String,
    pub text: String,
}

impl ContentsFile {
    pub fn decode(self) -> Result<RemoteHistory, HistoryError> {
        // base64 arrives wrapped across lines
        let packed: String = self.content.split_whitespace().collect();
        let bytes = STANDARD
            .decode(packed)
            .map_err(|err| HistoryError::Decode(err.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|err| HistoryError::Decode(err.to_string()))?;
        Ok(RemoteHistory {
            sha: self.sha,
            text,
        })
    }
}

pub fn check_remote_status(status: StatusCode, body: String) -> Result<(), HistoryError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(HistoryError::Remote {
            status: status.as_u16(),
            body,
        })
    }
}

/// History file kept in a git repository through the hosting service's contents API,
/// so it outlives the machine a run happens on.
#[derive(Debug, Clone)]
pub struct RepoHistoryStore {
    client: reqwest::Client,
    options: RepoHistoryOptions,
}

impl RepoHistoryStore {
    pub fn new(client: reqwest::Client, options: RepoHistoryOptions) -> Self {
        Self { client, options }
    }

    pub fn contents_url(&self) -> String {
        format!(
            "{}/repos/{}/contents/{}",
            self.options.api_base.trim_end_matches('/'),
            self.options.repo,
            self.options.path.trim_start_matches("./")
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("Authorization", format!("Bearer {}", self.options.token))
            .header(ACCEPT, "application/vnd.github+json")
    }

    pub fn get_request(&self) -> reqwest::RequestBuilder {
        self.authorized(self.client.get(self.contents_url()))
    }

    pub fn put_request(&self, body: &PutContents<'_>) -> reqwest::RequestBuilder {
        self.authorized(self.client.put(self.contents_url())).json(body)
    }

    /// Current file, or `None` when the repository has no such path.
    pub async fn fetch(&self) -> Result<Option<RemoteHistory>, HistoryError> {
        let response = self.get_request().send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HistoryError::Remote {
                status: status.as_u16(),
                body,
            });
        }
        let file: ContentsFile = response.json().await?;
        file.decode().map(Some)
    }

    async fn write(&self, message: &str, text: &str, sha: Option<&str>) -> Result<(), HistoryError> {
        let response = self
            .put_request(&PutContents::new(message, text, sha))
            .send()
            .await?;
        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };
        check_remote_status(status, body)?;
        debug!(
            repo = %self.options.repo,
            path = %self.options.path,
            commit = message,
            "wrote history file"
        );
        Ok(())
    }
}

#[async_trait]
impl ListingStore for RepoHistoryStore {
    async fn load(&self) -> Result<HashSet<ListingKey>, HistoryError> {
        let remote = match self.fetch().await {
            Ok(remote) => remote,
            Err(err @ HistoryError::Decode(_)) => {
                warn!(repo = %self.options.repo, error = %err, "history unreadable; treating as empty");
                return Ok(HashSet::new());
            }
            Err(err) => return Err(err),
        };

        let Some(remote) = remote else {
            info!(repo = %self.options.repo, path = %self.options.path, "no history yet; creating file");
            self.write("Create job listings file", &format!("{HISTORY_HEADER}\n"), None)
                .await?;
            return Ok(HashSet::new());
        };

        match HistoryStore::parse_rows(&remote.text) {
            Some(keys) => {
                debug!(repo = %self.options.repo, rows = keys.len(), "loaded listing history");
                Ok(keys)
            }
            None => {
                warn!(repo = %self.options.repo, "history header missing; recreating file");
                self.write(
                    "Recreate job listings file",
                    &format!("{HISTORY_HEADER}\n"),
                    Some(remote.sha.as_str()),
                )
                .await?;
                Ok(HashSet::new())
            }
        }
    }

    async fn append(&self, keys: &[ListingKey]) -> Result<(), HistoryError> {
        if keys.is_empty() {
            return Ok(());
        }

        let remote = self.fetch().await?;
        let next = extend_history(remote.as_ref().map(|r| r.text.as_str()), keys)?;
        match &remote {
            Some(remote) => {
                self.write("Append new job listings", &next, Some(remote.sha.as_str()))
                    .await?
            }
            None => self.write("Create job listings file", &next, None).await?,
        }
        info!(repo = %self.options.repo, appended = keys.len(), "appended listings to history");
        Ok(())
    }

    async fn reset(&self) -> Result<(), HistoryError> {
        let remote = self.fetch().await?;
        self.write(
            "Reset job listings file",
            &format!("{HISTORY_HEADER}\n"),
            remote.as_ref().map(|r| r.sha.as_str()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(company: &str, title: &str, link: &str, date: &str) -> ListingKey {
        ListingKey {
            company: company.to_string(),
            job_title: title.to_string(),
            link: link.to_string(),
            date_posted: date.to_string(),
        }
    }

    #[tokio::test]
    async fn missing_store_is_created_with_header() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("listings.csv"));

        let keys = store.load().await.expect("load");

        assert!(keys.is_empty());
        let written = std::fs::read_to_string(store.path()).expect("read");
        assert_eq!(written, "company,job_title,link,date_posted\n");
    }

    #[tokio::test]
    async fn appended_rows_load_back() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("listings.csv"));
        store.load().await.expect("load");

        let first = key("Acme", "Intern", "https://acme.test/1", "Jan 01");
        let second = key("Globex", "SWE Intern", "https://globex.test/9", "Feb 12");
        store.append(&[first.clone()]).await.expect("append first");
        store.append(&[second.clone()]).await.expect("append second");

        let written = std::fs::read_to_string(store.path()).expect("read");
        assert_eq!(
            written,
            "company,job_title,link,date_posted\n\
             Acme,Intern,https://acme.test/1,Jan 01\n\
             Globex,SWE Intern,https://globex.test/9,Feb 12\n"
        );

        let loaded = store.load().await.expect("reload");
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&first));
        assert!(loaded.contains(&second));
    }

    #[tokio::test]
    async fn empty_append_does_not_touch_store() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("listings.csv"));

        store.append(&[]).await.expect("append");

        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn headerless_store_is_recreated_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("listings.csv");
        std::fs::write(&path, "garbage without header\nmore,garbage\n").expect("seed");
        let store = HistoryStore::new(&path);

        let keys = store.load().await.expect("load");

        assert!(keys.is_empty());
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "company,job_title,link,date_posted\n"
        );
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let keys = HistoryStore::parse_rows(
            "company,job_title,link,date_posted\nAcme,Intern,https://a.test,Jan 01\nshort,row\n\n",
        )
        .expect("header present");
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn rows_with_separator_are_rejected() {
        let err = HistoryStore::render_row(&key("Acme, Inc", "Intern", "x", "Jan 01"))
            .expect_err("comma must be rejected");
        assert!(matches!(err, HistoryError::SeparatorInField(f) if f == "Acme, Inc"));
    }

    #[tokio::test]
    async fn reset_truncates_to_header() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("listings.csv"));
        store
            .append(&[key("Acme", "Intern", "https://acme.test/1", "Jan 01")])
            .await
            .expect("append");

        store.reset().await.expect("reset");

        assert!(store.load().await.expect("load").is_empty());
    }

    #[test]
    fn non_success_status_is_a_fetch_error() {
        let err = check_status(StatusCode::NOT_FOUND, "https://raw.test/README.md")
            .expect_err("404 must fail");
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert!(check_status(StatusCode::OK, "https://raw.test/README.md").is_ok());
    }

    #[tokio::test]
    async fn unreadable_store_is_left_in_place() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("listings.csv");
        let bytes = b"company,job_title,link,date_posted\nAcme,Intern \xff,x,Jan 01\n".to_vec();
        std::fs::write(&path, &bytes).expect("seed");
        let store = HistoryStore::new(&path);

        assert!(store.load().await.expect("load").is_empty());
        assert_eq!(std::fs::read(&path).expect("read"), bytes);

        store
            .append(&[key("Globex", "Intern", "https://globex.test/1", "Jan 02")])
            .await
            .expect_err("append must not clobber an unreadable store");
        assert_eq!(std::fs::read(&path).expect("read"), bytes);
    }

    #[test]
    fn extend_history_starts_fresh_without_valid_header() {
        let rows = [key("Acme", "Intern", "https://acme.test/1", "Jan 01")];

        let fresh = extend_history(None, &rows).expect("fresh");
        let headerless = extend_history(Some("junk\n"), &rows).expect("headerless");
        let kept = extend_history(
            Some("company,job_title,link,date_posted\nBeta,Dev,https://b.test,Feb 01\n\n"),
            &rows,
        )
        .expect("kept");

        assert_eq!(
            fresh,
            "company,job_title,link,date_posted\nAcme,Intern,https://acme.test/1,Jan 01\n"
        );
        assert_eq!(headerless, fresh);
        assert_eq!(
            kept,
            "company,job_title,link,date_posted\nBeta,Dev,https://b.test,Feb 01\nAcme,Intern,https://acme.test/1,Jan 01\n"
        );
    }

    fn repo_store() -> RepoHistoryStore {
        RepoHistoryStore::new(
            reqwest::Client::new(),
            RepoHistoryOptions {
                api_base: "https://api.github.test/".into(),
                repo: "someone/job-history".into(),
                path: "./listings.csv".into(),
                token: "ghp_secret".into(),
            },
        )
    }

    #[test]
    fn repo_requests_target_contents_endpoint_with_token() {
        let request = repo_store().get_request().build().expect("request");

        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(
            request.url().as_str(),
            "https://api.github.test/repos/someone/job-history/contents/listings.csv"
        );
        assert_eq!(request.headers()["Authorization"], "Bearer ghp_secret");
        assert_eq!(request.headers()[ACCEPT], "application/vnd.github+json");
    }

    #[test]
    fn repo_put_carries_encoded_content_and_sha() {
        let store = repo_store();
        let update = PutContents::new(
            "Append new job listings",
            "company,job_title,link,date_posted\n",
            Some("abc123"),
        );
        let request = store.put_request(&update).build().expect("request");

        assert_eq!(request.method(), reqwest::Method::PUT);
        let body: serde_json::Value =
            serde_json::from_slice(request.body().and_then(|b| b.as_bytes()).expect("body"))
                .expect("json");
        assert_eq!(
            body,
            serde_json::json!({
                "message": "Append new job listings",
                "content": "Y29tcGFueSxqb2JfdGl0bGUsbGluayxkYXRlX3Bvc3RlZAo=",
                "sha": "abc123",
            })
        );

        let create = serde_json::to_value(PutContents::new("Create job listings file", "", None))
            .expect("json");
        assert!(create.get("sha").is_none());
    }

    #[test]
    fn contents_response_decodes_wrapped_base64() {
        let file: ContentsFile = serde_json::from_value(serde_json::json!({
            "name": "listings.csv",
            "sha": "3d21ec53",
            "encoding": "base64",
            "content": "Y29tcGFueSxqb2JfdGl0bGUsbGluayxkYXRlX3Bvc3RlZApBY21lLEludGVy\nbixodHRwczovL2FjbWUudGVzdC8xLEphbiAwMQo=\n",
        }))
        .expect("contents json");

        let remote = file.decode().expect("decode");

        assert_eq!(remote.sha, "3d21ec53");
        assert_eq!(
            HistoryStore::parse_rows(&remote.text),
            Some(HashSet::from([key("Acme", "Intern", "https://acme.test/1", "Jan 01")]))
        );
    }

    #[test]
    fn undecodable_contents_is_a_decode_error() {
        let file = ContentsFile {
            sha: "x".into(),
            content: "not base64!".into(),
        };
        assert!(matches!(file.decode(), Err(HistoryError::Decode(_))));
    }

    #[test]
    fn rejected_write_keeps_status_and_body() {
        let err = check_remote_status(StatusCode::CONFLICT, "sha mismatch".into())
            .expect_err("409 must fail");
        assert_eq!(err.to_string(), "history repository returned 409: sha mismatch");
        assert!(check_remote_status(StatusCode::CREATED, String::new()).is_ok());
    }

    #[test]
    fn repo_options_debug_hides_token() {
        let rendered = format!("{:?}", repo_store().options);
        assert!(!rendered.contains("ghp_secret"));
        assert!(rendered.contains("someone/job-history"));
    }
}
