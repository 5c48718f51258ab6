//! Persisted monitor state + HTTP fetch utilities for TCM.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tcm_core::ComplianceAlert;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tcm-storage";

/// JSON array of alert id strings, one whole document.
pub const PROCESSED_IDS_FILE: &str = "processed-alerts.json";
/// JSON array of alert records, one whole document, append-only in spirit.
pub const ALERT_LOG_FILE: &str = "alerts-log.json";

/// Persistence seam for the run orchestrator. Read failures are absorbed by
/// implementations (missing or corrupt state means "empty", never an error);
/// write failures propagate so the caller can fail the run.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_processed_ids(&self) -> anyhow::Result<Vec<String>>;
    async fn save_processed_ids(&self, ids: &[String]) -> anyhow::Result<()>;
    async fn append_alert(&self, alert: &ComplianceAlert) -> anyhow::Result<()>;
    async fn list_alerts(&self) -> anyhow::Result<Vec<ComplianceAlert>>;
}

/// Whole-document JSON state under a data directory:
/// `processed-alerts.json` + `alerts-log.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    data_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn processed_ids_path(&self) -> PathBuf {
        self.data_dir.join(PROCESSED_IDS_FILE)
    }

    fn alert_log_path(&self) -> PathBuf {
        self.data_dir.join(ALERT_LOG_FILE)
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load_processed_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(read_json_array(&self.processed_ids_path()).await)
    }

    async fn save_processed_ids(&self, ids: &[String]) -> anyhow::Result<()> {
        write_json_doc(&self.processed_ids_path(), &ids).await
    }

    async fn append_alert(&self, alert: &ComplianceAlert) -> anyhow::Result<()> {
        let path = self.alert_log_path();
        let mut alerts: Vec<ComplianceAlert> = read_json_array(&path).await;
        alerts.push(alert.clone());
        write_json_doc(&path, &alerts).await
    }

    async fn list_alerts(&self) -> anyhow::Result<Vec<ComplianceAlert>> {
        Ok(read_json_array(&self.alert_log_path()).await)
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    processed_ids: RwLock<Vec<String>>,
    alerts: RwLock<Vec<ComplianceAlert>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_processed_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.processed_ids.read().await.clone())
    }

    async fn save_processed_ids(&self, ids: &[String]) -> anyhow::Result<()> {
        *self.processed_ids.write().await = ids.to_vec();
        Ok(())
    }

    async fn append_alert(&self, alert: &ComplianceAlert) -> anyhow::Result<()> {
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }

    async fn list_alerts(&self) -> anyhow::Result<Vec<ComplianceAlert>> {
        Ok(self.alerts.read().await.clone())
    }
}

async fn read_json_array<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no state file yet, starting empty");
            return Vec::new();
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "state file unreadable, starting empty");
            return Vec::new();
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(values) => values,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "state file corrupt, starting empty");
            Vec::new()
        }
    }
}

/// Replace the whole document via temp file + rename so a crashed write
/// never leaves a half-serialized state file behind.
async fn write_json_doc<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .context("state path has no parent directory")?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating state directory {}", parent.display()))?;

    let body = serde_json::to_vec_pretty(value).context("serializing state document")?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
    file.write_all(&body)
        .await
        .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming temp state {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Shared HTTP client: retried GETs for upstream providers, single-attempt
/// POST for downstream forwarding. One timeout governs both directions.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET with retries. Query pairs go through reqwest's encoder so
    /// free-text queries survive intact.
    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url);
            if !query.is_empty() {
                request = request.query(query);
            }
            for (name, value) in headers {
                request = request.header(*name, *value);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    /// One attempt, no retries: delivery failures are the caller's to record,
    /// and a blind retry could double-deliver a batch.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", url);
        let _guard = span.enter();

        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tcm_core::RestrictionType;
    use tempfile::tempdir;

    fn mk_alert(id: &str, title: &str) -> ComplianceAlert {
        ComplianceAlert {
            alert_id: id.to_string(),
            summary: "New tariff affecting exports of steel".to_string(),
            product: "steel".to_string(),
            restriction_type: RestrictionType::Tariff,
            from_countries: vec!["China".to_string()],
            to_countries: vec![],
            tariff_rate: Some("25%".to_string()),
            effective_date: None,
            date_published: Utc.with_ymd_and_hms(2025, 3, 8, 9, 30, 0).unwrap(),
            source: "Trade Wire".to_string(),
            title: title.to_string(),
            link: "https://example.com/a".to_string(),
            confidence: 85,
            processed_at: None,
        }
    }

    #[tokio::test]
    async fn file_store_roundtrips_processed_ids() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());
        let ids = vec!["CA-1-001".to_string(), "CA-2-002".to_string()];

        store.save_processed_ids(&ids).await.expect("save");
        let loaded = store.load_processed_ids().await.expect("load");
        assert_eq!(loaded, ids);
    }

    #[tokio::test]
    async fn missing_state_files_read_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path().join("nested/never-created"));

        assert!(store.load_processed_ids().await.expect("load").is_empty());
        assert!(store.list_alerts().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn corrupt_state_files_read_as_empty() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join(PROCESSED_IDS_FILE), b"{not json!").expect("write garbage");
        std::fs::write(dir.path().join(ALERT_LOG_FILE), b"[{\"alertId\":").expect("write garbage");
        let store = JsonFileStore::new(dir.path());

        assert!(store.load_processed_ids().await.expect("load").is_empty());
        assert!(store.list_alerts().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn append_preserves_arrival_order_and_wire_keys() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());

        store
            .append_alert(&mk_alert("CA-1-001", "first"))
            .await
            .expect("append");
        store
            .append_alert(&mk_alert("CA-2-002", "second"))
            .await
            .expect("append");

        let alerts = store.list_alerts().await.expect("list");
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].alert_id, "CA-1-001");
        assert_eq!(alerts[1].alert_id, "CA-2-002");

        let raw = std::fs::read_to_string(dir.path().join(ALERT_LOG_FILE)).expect("read log");
        assert!(raw.contains("\"alertId\""));
        assert!(raw.contains("\"fromCountries\""));
        assert!(raw.contains("\"tariffRate\""));
        assert!(!raw.contains("\"alert_id\""));
    }

    #[tokio::test]
    async fn save_replaces_whole_document() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path());

        store
            .save_processed_ids(&["CA-1-001".to_string()])
            .await
            .expect("save");
        store
            .save_processed_ids(&["CA-1-001".to_string(), "CA-2-002".to_string()])
            .await
            .expect("save again");

        let loaded = store.load_processed_ids().await.expect("load");
        assert_eq!(loaded.len(), 2);
        // no stray temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn memory_store_behaves_like_file_store() {
        let store = MemoryStore::new();
        store
            .save_processed_ids(&["CA-1-001".to_string()])
            .await
            .expect("save");
        store
            .append_alert(&mk_alert("CA-1-001", "first"))
            .await
            .expect("append");

        assert_eq!(store.load_processed_ids().await.expect("load").len(), 1);
        assert_eq!(store.list_alerts().await.expect("list").len(), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(700),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(700));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(700));
    }
}
