//! Run orchestration: source registry, polling cycle, two-tier dedup,
//! downstream forwarding, and scheduler wiring.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tcm_adapters::{build_adapter, SimulatedSource, SourceAdapter, SourceShape};
use tcm_core::{ComplianceAlert, DataProvenance, RawArticle, SourceReliability};
use tcm_extract::synthesize;
use tcm_storage::{HttpClientConfig, HttpFetcher, StateStore};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tcm-monitor";

/// Header carrying the shared secret on the forwarding POST.
pub const FORWARD_SECRET_HEADER: &str = "x-webhook-secret";

const TITLE_PREFIX_LEN: usize = 50;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub data_dir: PathBuf,
    pub sources_path: PathBuf,
    pub query: String,
    pub poll_cron: String,
    pub scheduler_enabled: bool,
    pub http_timeout_secs: u64,
    pub forward_url: Option<String>,
    pub forward_secret: Option<String>,
    pub user_agent: String,
    pub web_port: u16,
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("TCM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            sources_path: std::env::var("TCM_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            query: std::env::var("TCM_QUERY").unwrap_or_else(|_| {
                "tariffs OR sanctions OR \"export controls\" OR \"trade restrictions\"".to_string()
            }),
            poll_cron: std::env::var("TCM_POLL_CRON")
                .unwrap_or_else(|_| "0 */20 * * * *".to_string()),
            scheduler_enabled: std::env::var("TCM_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            http_timeout_secs: std::env::var("TCM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            forward_url: std::env::var("TCM_FORWARD_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            forward_secret: std::env::var("TCM_FORWARD_SECRET")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            user_agent: std::env::var("TCM_USER_AGENT")
                .unwrap_or_else(|_| "tcm-bot/0.1".to_string()),
            web_port: std::env::var("TCM_WEB_PORT")
                .ok()
                .or_else(|| std::env::var("PORT").ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
        }
    }

    pub fn forwarding_target(&self) -> Option<ForwardingTarget> {
        self.forward_url.as_ref().map(|url| ForwardingTarget {
            url: url.clone(),
            secret: self.forward_secret.clone(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub shape: SourceShape,
    pub reliability: SourceReliability,
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
}

impl SourceRegistry {
    /// Missing registry file is not an error: the monitor then runs on the
    /// simulated dataset alone. A present-but-unparsable file is.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "no source registry file, starting with no live sources");
                return Ok(Self {
                    sources: Vec::new(),
                });
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

pub struct RegisteredSource {
    pub config: SourceConfig,
    pub adapter: Box<dyn SourceAdapter>,
}

fn registered_sources(registry: SourceRegistry) -> Vec<RegisteredSource> {
    registry
        .sources
        .into_iter()
        .filter(|source| source.enabled)
        .map(|config| {
            let api_key = config
                .api_key_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok());
            if config.api_key_env.is_some() && api_key.is_none() {
                warn!(source_id = %config.source_id, "api key env var unset, upstream will likely reject this source");
            }
            let adapter = build_adapter(
                config.shape,
                &config.source_id,
                &config.endpoint,
                api_key,
                config.reliability,
            );
            RegisteredSource { config, adapter }
        })
        .collect()
}

/// Lowercased 50-char title prefix; one syndicated story yields the same
/// fingerprint across outlets.
pub fn title_fingerprint(title: &str) -> String {
    title.to_lowercase().chars().take(TITLE_PREFIX_LEN).collect()
}

/// Collapses same-story alerts within one batch, first arrival kept.
pub fn suppress_near_duplicates(alerts: Vec<ComplianceAlert>) -> (Vec<ComplianceAlert>, usize) {
    let before = alerts.len();
    let mut seen = HashSet::new();
    let kept: Vec<ComplianceAlert> = alerts
        .into_iter()
        .filter(|alert| seen.insert(title_fingerprint(&alert.title)))
        .collect();
    let suppressed = before - kept.len();
    (kept, suppressed)
}

/// Splits a batch into unseen alerts and those already in the processed set.
pub fn partition_by_processed(
    alerts: Vec<ComplianceAlert>,
    processed: &HashSet<String>,
) -> (Vec<ComplianceAlert>, Vec<ComplianceAlert>) {
    alerts
        .into_iter()
        .partition(|alert| !processed.contains(&alert.alert_id))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingTarget {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
}

/// Downstream wire contract: one POST per batch of new alerts.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardPayload<'a> {
    pub last_checked: DateTime<Utc>,
    pub alert_count: usize,
    pub compliance_alerts: &'a [ComplianceAlert],
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardReport {
    /// `delivered`, `skipped`, `not-configured`, or `failed`.
    pub status: String,
    pub delivered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertOutcome {
    pub alert_id: String,
    pub product: String,
    /// `success` or `error`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub provenance: DataProvenance,
    pub sources_polled: usize,
    pub source_failures: usize,
    pub articles_fetched: usize,
    pub alerts_synthesized: usize,
    pub near_duplicates_suppressed: usize,
    pub already_seen: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<AlertOutcome>,
    pub forwarding: ForwardReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub status: String,
    pub running: bool,
    pub uptime_secs: i64,
    pub timestamp: DateTime<Utc>,
    pub scheduler_enabled: bool,
    pub poll_cron: String,
    pub forwarding_configured: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub next_poll: Option<DateTime<Utc>>,
    pub last_run: Option<RunSummary>,
}

#[derive(Debug, Default)]
struct StatusInner {
    last_checked: Option<DateTime<Utc>>,
    next_poll: Option<DateTime<Utc>>,
    last_run: Option<RunSummary>,
}

struct FetchOutcome {
    articles: Vec<RawArticle>,
    source_failures: usize,
    provenance: DataProvenance,
}

/// Raises the shared `running` flag and lowers it on drop, including when
/// the owning future is cancelled mid-run.
struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Monitor {
    config: MonitorConfig,
    store: Arc<dyn StateStore>,
    http: HttpFetcher,
    sources: Vec<RegisteredSource>,
    forwarding: RwLock<Option<ForwardingTarget>>,
    run_guard: Mutex<()>,
    running: AtomicBool,
    status: RwLock<StatusInner>,
    started_at: DateTime<Utc>,
}

impl Monitor {
    pub async fn new(config: MonitorConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let registry = SourceRegistry::load(&config.sources_path).await?;
        let sources = registered_sources(registry);
        let forwarding = RwLock::new(config.forwarding_target());
        Ok(Self {
            config,
            store,
            http,
            sources,
            forwarding,
            run_guard: Mutex::new(()),
            running: AtomicBool::new(false),
            status: RwLock::new(StatusInner::default()),
            started_at: Utc::now(),
        })
    }

    /// Replaces the registry-built sources, mainly for tests and demos.
    pub fn with_sources(mut self, sources: Vec<RegisteredSource>) -> Self {
        self.sources = sources;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> MonitorStatus {
        let forwarding_configured = self.forwarding.read().await.is_some();
        let inner = self.status.read().await;
        MonitorStatus {
            status: "healthy".to_string(),
            running: self.is_running(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            timestamp: Utc::now(),
            scheduler_enabled: self.config.scheduler_enabled,
            poll_cron: self.config.poll_cron.clone(),
            forwarding_configured,
            last_checked: inner.last_checked,
            next_poll: inner.next_poll,
            last_run: inner.last_run.clone(),
        }
    }

    pub async fn set_forwarding(&self, target: Option<ForwardingTarget>) {
        match &target {
            Some(target) => info!(url = %target.url, "forwarding target updated"),
            None => info!("forwarding target cleared"),
        }
        *self.forwarding.write().await = target;
    }

    pub async fn alerts(&self) -> Result<Vec<ComplianceAlert>> {
        self.store.list_alerts().await
    }

    pub async fn processed_ids(&self) -> Result<Vec<String>> {
        self.store.load_processed_ids().await
    }

    /// Runs one cycle unless another is already in flight; `Ok(None)` means
    /// the trigger was rejected as busy.
    pub async fn try_run(&self) -> Result<Option<RunSummary>> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            debug!("run already in flight, rejecting trigger");
            return Ok(None);
        };
        let _flag = RunningFlag::raise(&self.running);
        self.run_cycle().await.map(Some)
    }

    /// Resolves once any in-flight run has released the run guard.
    pub async fn wait_idle(&self) {
        drop(self.run_guard.lock().await);
    }

    /// Re-sends logged alerts by id (all of them when `ids` is empty),
    /// bypassing the dedup bookkeeping. Backs the manual forward workflow.
    pub async fn forward_alerts(&self, ids: &[String]) -> Result<ForwardReport> {
        let alerts = self.store.list_alerts().await?;
        let selected: Vec<ComplianceAlert> = if ids.is_empty() {
            alerts
        } else {
            alerts
                .into_iter()
                .filter(|alert| ids.contains(&alert.alert_id))
                .collect()
        };
        if selected.is_empty() {
            return Ok(ForwardReport {
                status: "skipped".to_string(),
                delivered: 0,
                error: None,
            });
        }
        Ok(self.forward_batch(&selected).await)
    }

    async fn run_cycle(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, sources = self.sources.len(), "compliance check starting");

        let fetched = self.fetch_articles().await;
        let articles_fetched = fetched.articles.len();

        let captured_at = Utc::now();
        let synthesized: Vec<ComplianceAlert> = fetched
            .articles
            .iter()
            .filter_map(|article| synthesize(article, captured_at))
            .collect();
        let alerts_synthesized = synthesized.len();

        let (batch, near_duplicates_suppressed) = suppress_near_duplicates(synthesized);
        let known_ids = self.store.load_processed_ids().await?;
        let known: HashSet<String> = known_ids.iter().cloned().collect();
        let (fresh, already) = partition_by_processed(batch, &known);
        info!(
            new = fresh.len(),
            already_seen = already.len(),
            suppressed = near_duplicates_suppressed,
            "dedup applied"
        );

        let mut results = Vec::with_capacity(fresh.len());
        let mut accepted = Vec::with_capacity(fresh.len());
        for mut alert in fresh {
            alert.processed_at = Some(Utc::now());
            let outcome = match self.store.append_alert(&alert).await {
                Ok(()) => AlertOutcome {
                    alert_id: alert.alert_id.clone(),
                    product: alert.product.clone(),
                    status: "success".to_string(),
                    error: None,
                },
                Err(err) => {
                    warn!(alert_id = %alert.alert_id, error = %err, "failed to log alert");
                    AlertOutcome {
                        alert_id: alert.alert_id.clone(),
                        product: alert.product.clone(),
                        status: "error".to_string(),
                        error: Some(err.to_string()),
                    }
                }
            };
            results.push(outcome);
            accepted.push(alert);
        }

        // Ids grow even for alerts whose log write failed, so one bad write
        // cannot replay the same alert on every later cycle.
        if !accepted.is_empty() {
            let mut ids = known_ids;
            ids.extend(accepted.iter().map(|alert| alert.alert_id.clone()));
            self.store
                .save_processed_ids(&ids)
                .await
                .context("persisting processed id set")?;
        }

        let forwarding = if accepted.is_empty() {
            ForwardReport {
                status: "skipped".to_string(),
                delivered: 0,
                error: None,
            }
        } else {
            self.forward_batch(&accepted).await
        };

        let succeeded = results
            .iter()
            .filter(|outcome| outcome.status == "success")
            .count();
        let failed = results.len() - succeeded;
        let finished_at = Utc::now();
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            provenance: fetched.provenance,
            sources_polled: self.sources.len(),
            source_failures: fetched.source_failures,
            articles_fetched,
            alerts_synthesized,
            near_duplicates_suppressed,
            already_seen: already.len(),
            processed: accepted.len(),
            succeeded,
            failed,
            results,
            forwarding,
        };

        {
            let mut status = self.status.write().await;
            status.last_checked = Some(finished_at);
            status.last_run = Some(summary.clone());
        }
        info!(
            %run_id,
            processed = summary.processed,
            forwarding = %summary.forwarding.status,
            "compliance check finished"
        );
        Ok(summary)
    }

    async fn fetch_articles(&self) -> FetchOutcome {
        let mut pool = Vec::new();
        let mut source_failures = 0usize;
        for source in &self.sources {
            let query = source
                .config
                .query
                .as_deref()
                .unwrap_or(&self.config.query);
            match source.adapter.fetch_articles(&self.http, query).await {
                Ok(articles) => {
                    info!(source_id = %source.config.source_id, count = articles.len(), "source fetched");
                    pool.extend(articles);
                }
                Err(err) => {
                    warn!(source_id = %source.config.source_id, error = %err, "source failed, continuing without it");
                    source_failures += 1;
                }
            }
        }

        if pool.is_empty() {
            let articles = SimulatedSource::new()
                .fetch_articles(&self.http, &self.config.query)
                .await
                .unwrap_or_default();
            info!(count = articles.len(), "live pool empty, serving simulated dataset");
            return FetchOutcome {
                articles,
                source_failures,
                provenance: DataProvenance::Simulated,
            };
        }

        FetchOutcome {
            articles: pool,
            source_failures,
            provenance: DataProvenance::Live,
        }
    }

    async fn forward_batch(&self, alerts: &[ComplianceAlert]) -> ForwardReport {
        let target = self.forwarding.read().await.clone();
        let Some(target) = target else {
            return ForwardReport {
                status: "not-configured".to_string(),
                delivered: 0,
                error: None,
            };
        };

        let payload = ForwardPayload {
            last_checked: Utc::now(),
            alert_count: alerts.len(),
            compliance_alerts: alerts,
        };
        let mut headers: Vec<(&str, &str)> = Vec::new();
        if let Some(secret) = &target.secret {
            headers.push((FORWARD_SECRET_HEADER, secret));
        }

        match self.http.post_json(&target.url, &headers, &payload).await {
            Ok(_) => {
                info!(count = alerts.len(), url = %target.url, "alert batch forwarded");
                ForwardReport {
                    status: "delivered".to_string(),
                    delivered: alerts.len(),
                    error: None,
                }
            }
            Err(err) => {
                warn!(error = %err, "forwarding failed, batch stays logged");
                ForwardReport {
                    status: "failed".to_string(),
                    delivered: 0,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Builds (but does not start) the cron scheduler when enabled. A tick
    /// that lands while a run is in flight is skipped, never queued.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let mut sched = JobScheduler::new().await.context("creating scheduler")?;
        let monitor = Arc::clone(self);
        let job = Job::new_async(self.config.poll_cron.as_str(), move |uuid, mut lock| {
            let monitor = Arc::clone(&monitor);
            Box::pin(async move {
                match monitor.try_run().await {
                    Ok(Some(summary)) => {
                        info!(processed = summary.processed, "scheduled check finished");
                    }
                    Ok(None) => warn!("previous check still in flight, skipping this tick"),
                    Err(err) => error!(error = %err, "scheduled check failed"),
                }
                let next = lock.next_tick_for_job(uuid).await.ok().flatten();
                monitor.status.write().await.next_poll = next;
            })
        })
        .with_context(|| format!("creating poll job for cron {}", self.config.poll_cron))?;
        let job_id = sched.add(job).await.context("adding poll job")?;
        if let Ok(next) = sched.next_tick_for_job(job_id).await {
            self.status.write().await.next_poll = next;
        }
        Ok(Some(sched))
    }
}
