//! Crawl orchestration: paced page fetching, archive pagination, normalization and
//! snapshot persistence for each listing kind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ccal_adapters::{
    extract_listing, normalize_batch, ExtractError, ExtractedRows, NormalizedBatch, RowIssue,
    SectionLocator,
};
use ccal_core::{ContestKind, RawContestRecord, DEFAULT_ARCHIVE_URL, DEFAULT_UPCOMING_URL};
use ccal_storage::{
    ArtifactStore, ContestSink, FetchError, FetchedPage, HttpClientConfig, HttpFetcher,
    PageFetcher, Snapshot, SnapshotStore, StoreError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ccal-sync";

const PAGE_QUERY_PARAM: &str = "page";

/// Archive page cap applied when a target does not set `max_pages`.
pub const DEFAULT_ARCHIVE_MAX_PAGES: usize = 50;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Minimum gap between two consecutive outbound fetches of one crawl.
    pub fetch_delay: Duration,
    /// Persist crawls whose pagination stopped early.
    pub persist_partial: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            data_dir: PathBuf::from("./data"),
            artifacts_dir: None,
            user_agent: "ccal-bot/0.1".to_string(),
            http_timeout_secs: 20,
            fetch_delay: Duration::from_millis(1000),
            persist_partial: false,
            scheduler_enabled: false,
            sync_cron: "0 */30 * * * *".to_string(),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: std::env::var("CCAL_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            data_dir: std::env::var("CCAL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            artifacts_dir: std::env::var("CCAL_ARTIFACTS_DIR").ok().map(PathBuf::from),
            user_agent: std::env::var("CCAL_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("CCAL_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            fetch_delay: std::env::var("CCAL_FETCH_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.fetch_delay),
            persist_partial: env_flag("CCAL_PERSIST_PARTIAL").unwrap_or(defaults.persist_partial),
            scheduler_enabled: env_flag("CCAL_SCHEDULER_ENABLED")
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("CCAL_SYNC_CRON").unwrap_or(defaults.sync_cron),
        }
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }
}

/// One listing to crawl, as declared in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTarget {
    pub kind: ContestKind,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Overrides the kind's default section locator (e.g. for a Japanese-language page).
    #[serde(default)]
    pub locator: Option<SectionLocator>,
    /// Upper bound on archive pages, regardless of what the pagination advertises.
    /// Unset means [`DEFAULT_ARCHIVE_MAX_PAGES`].
    #[serde(default)]
    pub max_pages: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

impl CrawlTarget {
    pub fn default_for(kind: ContestKind) -> Self {
        let url = match kind {
            ContestKind::Upcoming => DEFAULT_UPCOMING_URL,
            ContestKind::Archive => DEFAULT_ARCHIVE_URL,
        };
        let max_pages = match kind {
            ContestKind::Upcoming => None,
            ContestKind::Archive => Some(DEFAULT_ARCHIVE_MAX_PAGES),
        };
        Self {
            kind,
            url: url.to_string(),
            enabled: true,
            locator: None,
            max_pages,
        }
    }

    fn page_cap(&self) -> usize {
        self.max_pages.unwrap_or(DEFAULT_ARCHIVE_MAX_PAGES).max(1)
    }

    pub fn locator(&self) -> SectionLocator {
        self.locator
            .clone()
            .unwrap_or_else(|| SectionLocator::for_kind(self.kind))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceRegistry {
    pub targets: Vec<CrawlTarget>,
}

impl SourceRegistry {
    pub fn builtin() -> Self {
        Self {
            targets: ContestKind::ALL
                .into_iter()
                .map(CrawlTarget::default_for)
                .collect(),
        }
    }

    /// Reads `sources.yaml` under `root`, falling back to the built-in targets when absent.
    pub async fn load(root: &Path) -> Result<Self> {
        let path = root.join("sources.yaml");
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            debug!(path = %path.display(), "no source registry, using built-in targets");
            return Ok(Self::builtin());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn target(&self, kind: ContestKind) -> Option<&CrawlTarget> {
        self.targets.iter().find(|t| t.kind == kind && t.enabled)
    }

    pub fn enabled_kinds(&self) -> Vec<ContestKind> {
        ContestKind::ALL
            .into_iter()
            .filter(|kind| self.target(*kind).is_some())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Clock + pacing
// ---------------------------------------------------------------------------

/// Time source for fetch pacing, swappable so tests never really sleep.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Issues fetches no closer together than `min_gap`, checking for cancellation at each one.
struct PacedFetcher<'a> {
    fetcher: &'a dyn PageFetcher,
    clock: &'a dyn Clock,
    min_gap: Duration,
    cancel: &'a CancellationToken,
    last_fetch: Option<Instant>,
    fetches: usize,
}

impl<'a> PacedFetcher<'a> {
    fn new(
        fetcher: &'a dyn PageFetcher,
        clock: &'a dyn Clock,
        min_gap: Duration,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            clock,
            min_gap,
            cancel,
            last_fetch: None,
            fetches: 0,
        }
    }

    async fn fetch(&mut self, url: &str) -> Result<FetchedPage, FetchError> {
        let cancelled = || FetchError::Cancelled {
            url: url.to_string(),
        };

        if let Some(last) = self.last_fetch {
            let elapsed = self.clock.now().saturating_duration_since(last);
            if elapsed < self.min_gap {
                let wait = self.min_gap - elapsed;
                debug!(wait_ms = wait.as_millis() as u64, "pacing next fetch");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(cancelled()),
                    _ = self.clock.sleep(wait) => {}
                }
            }
        }
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }

        self.last_fetch = Some(self.clock.now());
        self.fetches += 1;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(cancelled()),
            result = self.fetcher.fetch_page(url) => result,
        }
    }
}

/// `base` with its `page` query parameter set to `page`.
pub fn page_url(base: &str, page: usize) -> Result<String, url::ParseError> {
    let mut url = Url::parse(base)?;
    let retained = url
        .query_pairs()
        .filter(|(key, _)| key != PAGE_QUERY_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair(PAGE_QUERY_PARAM, &page.to_string());
    Ok(url.to_string())
}

// ---------------------------------------------------------------------------
// Crawling
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("no enabled crawl target for {0} contests")]
    NoTarget(ContestKind),
    #[error("invalid listing url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("fetching first {kind} page: {source}")]
    FirstPage {
        kind: ContestKind,
        #[source]
        source: FetchError,
    },
    #[error("page {page} of the {kind} listing: {source}")]
    Structure {
        kind: ContestKind,
        page: usize,
        #[source]
        source: ExtractError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    /// Pagination stopped at `failed_page`; earlier pages are included.
    Partial { failed_page: usize, reason: String },
}

impl Completeness {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completeness::Complete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRowIssue {
    pub page: usize,
    pub issue: RowIssue,
}

/// Raw rows gathered by one crawl, in page order.
#[derive(Debug, Clone)]
pub struct CrawlOutput {
    pub kind: ContestKind,
    pub pages_planned: usize,
    pub pages: Vec<FetchedPage>,
    pub records: Vec<RawContestRecord>,
    pub row_issues: Vec<PageRowIssue>,
    pub completeness: Completeness,
}

impl CrawlOutput {
    fn absorb(&mut self, page_no: usize, page: FetchedPage, rows: ExtractedRows) {
        self.records.extend(rows.records);
        self.row_issues
            .extend(rows.issues.into_iter().map(|issue| PageRowIssue { page: page_no, issue }));
        self.pages.push(page);
    }
}

pub struct Crawler {
    fetcher: Arc<dyn PageFetcher>,
    clock: Arc<dyn Clock>,
    min_gap: Duration,
}

impl Crawler {
    pub fn new(fetcher: Arc<dyn PageFetcher>, clock: Arc<dyn Clock>, min_gap: Duration) -> Self {
        Self {
            fetcher,
            clock,
            min_gap,
        }
    }

    /// Crawls one target. Archive targets are paginated; the first page's body is reused to
    /// discover the page count.
    pub async fn crawl(
        &self,
        target: &CrawlTarget,
        cancel: &CancellationToken,
    ) -> Result<CrawlOutput, CrawlError> {
        let kind = target.kind;
        let locator = target.locator();
        let mut pacer = PacedFetcher::new(
            self.fetcher.as_ref(),
            self.clock.as_ref(),
            self.min_gap,
            cancel,
        );

        let first = pacer
            .fetch(&target.url)
            .await
            .map_err(|source| CrawlError::FirstPage { kind, source })?;
        let listing = extract_listing(&first.body, &locator, &first.final_url)
            .map_err(|source| CrawlError::Structure { kind, page: 1, source })?;

        let pages_planned = match kind {
            ContestKind::Upcoming => 1,
            ContestKind::Archive => {
                let advertised = listing.page_count.max(1);
                advertised.min(target.page_cap())
            }
        };
        debug!(%kind, pages_planned, "discovered listing pages");

        let mut output = CrawlOutput {
            kind,
            pages_planned,
            pages: Vec::new(),
            records: Vec::new(),
            row_issues: Vec::new(),
            completeness: Completeness::Complete,
        };
        output.absorb(1, first, listing.rows);

        for page_no in 2..=pages_planned {
            let url = page_url(&target.url, page_no).map_err(|source| CrawlError::InvalidUrl {
                url: target.url.clone(),
                source,
            })?;
            let page = match pacer.fetch(&url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(%kind, page = page_no, error = %err, "stopping pagination early");
                    output.completeness = Completeness::Partial {
                        failed_page: page_no,
                        reason: err.to_string(),
                    };
                    break;
                }
            };
            let listing = extract_listing(&page.body, &locator, &page.final_url).map_err(
                |source| CrawlError::Structure {
                    kind,
                    page: page_no,
                    source,
                },
            )?;
            output.absorb(page_no, page, listing.rows);
        }

        info!(
            %kind,
            fetches = pacer.fetches,
            rows = output.records.len(),
            skipped_rows = output.row_issues.len(),
            complete = output.completeness.is_complete(),
            "crawl finished"
        );
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A crawl plus its normalized, sorted batch, before persistence.
#[derive(Debug, Clone)]
pub struct CollectedContests {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub crawl: CrawlOutput,
    pub batch: NormalizedBatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub kind: ContestKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_planned: usize,
    pub pages_fetched: usize,
    pub completeness: Completeness,
    pub contests: usize,
    pub skipped_rows: usize,
    pub failed_records: usize,
    pub duplicates: Vec<String>,
    pub persisted: bool,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    crawler: Crawler,
    sink: Arc<dyn ContestSink>,
    artifacts: Option<ArtifactStore>,
    upcoming_run: tokio::sync::Mutex<()>,
    archive_run: tokio::sync::Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: SourceRegistry,
        fetcher: Arc<dyn PageFetcher>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ContestSink>,
    ) -> Self {
        let crawler = Crawler::new(fetcher, clock, config.fetch_delay);
        let artifacts = config.artifacts_dir.clone().map(ArtifactStore::new);
        Self {
            config,
            registry,
            crawler,
            sink,
            artifacts,
            upcoming_run: tokio::sync::Mutex::new(()),
            archive_run: tokio::sync::Mutex::new(()),
        }
    }

    /// Held for a whole run so saves of one kind land in crawl order.
    fn run_lock(&self, kind: ContestKind) -> &tokio::sync::Mutex<()> {
        match kind {
            ContestKind::Upcoming => &self.upcoming_run,
            ContestKind::Archive => &self.archive_run,
        }
    }

    /// Wires the HTTP fetcher, system clock and file snapshot store from `config`.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.workspace_root).await?;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let sink = SnapshotStore::new(config.snapshot_dir());
        Ok(Self::new(
            config,
            registry,
            Arc::new(fetcher),
            Arc::new(SystemClock),
            Arc::new(sink),
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn sink(&self) -> Arc<dyn ContestSink> {
        Arc::clone(&self.sink)
    }

    pub fn enabled_kinds(&self) -> Vec<ContestKind> {
        self.registry.enabled_kinds()
    }

    /// Crawls and normalizes without persisting. Partial crawls are returned as such.
    pub async fn collect(
        &self,
        kind: ContestKind,
        cancel: &CancellationToken,
    ) -> Result<CollectedContests, CrawlError> {
        let target = self.registry.target(kind).ok_or(CrawlError::NoTarget(kind))?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let crawl = self.crawler.crawl(target, cancel).await?;
        self.store_raw_pages(kind, &crawl.pages).await;
        let batch = normalize_batch(&crawl.records);

        Ok(CollectedContests {
            run_id,
            started_at,
            crawl,
            batch,
        })
    }

    pub async fn run_once(&self, kind: ContestKind) -> Result<SyncRunSummary, CrawlError> {
        self.run_once_with_cancel(kind, &CancellationToken::new()).await
    }

    pub async fn run_once_with_cancel(
        &self,
        kind: ContestKind,
        cancel: &CancellationToken,
    ) -> Result<SyncRunSummary, CrawlError> {
        async {
            let _running = self.run_lock(kind).lock().await;
            let collected = self.collect(kind, cancel).await?;
            let CollectedContests {
                run_id,
                started_at,
                crawl,
                batch,
            } = collected;

            let persisted = crawl.completeness.is_complete() || self.config.persist_partial;
            let contests = batch.contests.len();
            if persisted {
                self.sink
                    .save(Snapshot::new(kind, run_id, batch.contests))
                    .await?;
            } else {
                warn!(%kind, %run_id, "partial crawl not persisted; previous snapshot kept");
            }

            let summary = SyncRunSummary {
                run_id,
                kind,
                started_at,
                finished_at: Utc::now(),
                pages_planned: crawl.pages_planned,
                pages_fetched: crawl.pages.len(),
                completeness: crawl.completeness,
                contests,
                skipped_rows: crawl.row_issues.len(),
                failed_records: batch.failures.len(),
                duplicates: batch.duplicates.into_iter().map(|d| d.identifier).collect(),
                persisted,
            };
            info!(
                %run_id,
                contests = summary.contests,
                failed_records = summary.failed_records,
                persisted,
                "sync run finished"
            );
            Ok(summary)
        }
        .instrument(info_span!("sync_run", %kind))
        .await
    }

    async fn store_raw_pages(&self, kind: ContestKind, pages: &[FetchedPage]) {
        let Some(store) = &self.artifacts else {
            return;
        };
        let fetched_at = Utc::now();
        for page in pages {
            if let Err(err) = store
                .store_bytes(fetched_at, kind, "html", page.body.as_bytes())
                .await
            {
                warn!(url = %page.url, error = %err, "failed to store raw page");
            }
        }
    }
}

/// Cron-driven syncs of every enabled kind, when the scheduler is enabled.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_pipeline = Arc::clone(&pipeline);
    let job = Job::new_async(&pipeline.config.sync_cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&job_pipeline);
        Box::pin(async move {
            for kind in pipeline.enabled_kinds() {
                match pipeline.run_once(kind).await {
                    Ok(summary) => info!(%kind, contests = summary.contests, "scheduled sync done"),
                    Err(err) => warn!(%kind, error = %err, "scheduled sync failed"),
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", pipeline.config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
