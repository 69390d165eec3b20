//! Page comparison engine and progress-streaming check driver.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sitecheck_adapters::{
    fetch_metadata, HttpSitemapSource, SitemapSource, DEFAULT_EXCLUDED_SITEMAP_MARKERS,
};
use sitecheck_core::{
    decide_outcome, join_origin, relative_path, splice_record, strip_origin, CandidatePage,
    CheckEvent, ComparisonRecord, Outcome, ProgressEvent, ResultSet, SpliceOutcome,
    TargetPlacement, TitleComparison, ERROR_PATH, MISSING_PATH, NEW_PATH,
};
use sitecheck_storage::{HttpClientConfig, HttpFetcher, ResultCache, ResultCaches};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;

pub const CRATE_NAME: &str = "sitecheck-sync";

pub const DEFAULT_CONFIG_FILE: &str = "sitecheck.yaml";

/// Selects between the two historical engine behaviors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckProfile {
    /// Long timeout; title mismatches on a same-location page are reported.
    #[default]
    Current,
    /// Short timeout; same-location pages are `Present` whatever their titles.
    Legacy,
}

impl CheckProfile {
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            CheckProfile::Current => 120,
            CheckProfile::Legacy => 30,
        }
    }

    pub fn distinguishes_content(&self) -> bool {
        matches!(self, CheckProfile::Current)
    }
}

impl std::str::FromStr for CheckProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "current" => Ok(CheckProfile::Current),
            "legacy" => Ok(CheckProfile::Legacy),
            other => Err(ConfigError::InvalidValue {
                field: "profile",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{field} must be an absolute http(s) URL, got {value:?}")]
    InvalidOrigin { field: &'static str, value: String },
    #[error("invalid value for {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },
}

/// Optional YAML overlay; every field falls back to env or defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub source_origin: Option<String>,
    pub target_origin: Option<String>,
    pub source_sitemap_index: Option<String>,
    pub target_sitemap_index: Option<String>,
    pub excluded_sitemap_markers: Option<Vec<String>>,
    pub profile: Option<CheckProfile>,
    pub http_timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub web_port: Option<u16>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SiteCheckConfig {
    pub source_origin: Url,
    pub target_origin: Url,
    pub source_sitemap_index: String,
    pub target_sitemap_index: String,
    pub excluded_sitemap_markers: Vec<String>,
    pub profile: CheckProfile,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub cache_dir: PathBuf,
    pub web_port: u16,
}

impl SiteCheckConfig {
    /// Defaults for a pair of origins.
    pub fn new(source_origin: &str, target_origin: &str) -> Result<Self, ConfigError> {
        Self::resolve(
            ConfigFile {
                source_origin: Some(source_origin.to_string()),
                target_origin: Some(target_origin.to_string()),
                ..Default::default()
            },
            |_| None,
        )
    }

    /// `SITECHECK_CONFIG` (or `./sitecheck.yaml` when present) overlaid with `SITECHECK_*` env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match std::env::var("SITECHECK_CONFIG") {
            Ok(path) => ConfigFile::load(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                ConfigFile::load(Path::new(DEFAULT_CONFIG_FILE))?
            }
            Err(_) => ConfigFile::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Env values win over file values, which win over defaults.
    pub fn resolve(
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let source_origin = parse_origin(
            "source_origin",
            env("SITECHECK_SOURCE_ORIGIN")
                .or(file.source_origin)
                .unwrap_or_else(|| "https://www.example.com".to_string()),
        )?;
        let target_origin = parse_origin(
            "target_origin",
            env("SITECHECK_TARGET_ORIGIN")
                .or(file.target_origin)
                .unwrap_or_else(|| "https://new.example.com".to_string()),
        )?;
        let profile = match env("SITECHECK_PROFILE") {
            Some(v) => v.parse()?,
            None => file.profile.unwrap_or_default(),
        };
        let http_timeout_secs = match env("SITECHECK_HTTP_TIMEOUT_SECS") {
            Some(v) => v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "http_timeout_secs",
                value: v,
            })?,
            None => file
                .http_timeout_secs
                .unwrap_or_else(|| profile.default_timeout_secs()),
        };
        let web_port = match env("SITECHECK_WEB_PORT") {
            Some(v) => v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "web_port",
                value: v,
            })?,
            None => file.web_port.unwrap_or(8000),
        };
        let excluded_sitemap_markers = match env("SITECHECK_EXCLUDED_SITEMAPS") {
            Some(v) => v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => file.excluded_sitemap_markers.unwrap_or_else(|| {
                DEFAULT_EXCLUDED_SITEMAP_MARKERS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            }),
        };

        Ok(Self {
            source_sitemap_index: env("SITECHECK_SOURCE_SITEMAP")
                .or(file.source_sitemap_index)
                .unwrap_or_else(|| join_origin(&source_origin, "/sitemap_index.xml")),
            target_sitemap_index: env("SITECHECK_TARGET_SITEMAP")
                .or(file.target_sitemap_index)
                .unwrap_or_else(|| join_origin(&target_origin, "/sitemap.xml")),
            source_origin,
            target_origin,
            excluded_sitemap_markers,
            profile,
            http_timeout_secs,
            user_agent: env("SITECHECK_USER_AGENT")
                .or(file.user_agent)
                .unwrap_or_else(|| "sitecheck-bot/0.1".to_string()),
            cache_dir: env("SITECHECK_CACHE_DIR")
                .map(PathBuf::from)
                .or(file.cache_dir)
                .unwrap_or_else(|| PathBuf::from("./cache")),
            web_port,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn parse_origin(field: &'static str, value: String) -> Result<Url, ConfigError> {
    match Url::parse(value.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(url),
        _ => Err(ConfigError::InvalidOrigin { field, value }),
    }
}

/// Which site's sitemap drives a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckDirection {
    /// Source pages looked up on the target.
    Forward,
    /// Target pages looked up on the source, to find pages that are new.
    Reverse,
}

/// Resolves one candidate page into a [`ComparisonRecord`]. Never fails.
#[derive(Debug, Clone)]
pub struct PageComparator {
    http: HttpFetcher,
    source_origin: Url,
    target_origin: Url,
    profile: CheckProfile,
}

impl PageComparator {
    pub fn new(http: HttpFetcher, source_origin: Url, target_origin: Url, profile: CheckProfile) -> Self {
        Self {
            http,
            source_origin,
            target_origin,
            profile,
        }
    }

    pub fn source_origin(&self) -> &Url {
        &self.source_origin
    }

    pub fn target_origin(&self) -> &Url {
        &self.target_origin
    }

    pub async fn compare_in(&self, direction: CheckDirection, page: &CandidatePage) -> ComparisonRecord {
        match direction {
            CheckDirection::Forward => self.compare(page).await,
            CheckDirection::Reverse => self.compare_reverse(page).await,
        }
    }

    pub async fn compare(&self, page: &CandidatePage) -> ComparisonRecord {
        let span = info_span!("compare", url = %page.url);
        async {
            let relative = relative_path(&self.source_origin, &page.url);
            let source_meta = fetch_metadata(&self.http, &page.url).await;

            let target_url = join_origin(&self.target_origin, &relative);
            let resolution = self.http.resolve_redirects(&target_url).await;
            let placement = TargetPlacement::from_status(resolution.status, resolution.hops);

            let (target_relative_path, target_url) = match placement {
                TargetPlacement::Missing => (MISSING_PATH.to_string(), String::new()),
                TargetPlacement::Error => (ERROR_PATH.to_string(), String::new()),
                TargetPlacement::SameLocation => (relative.clone(), target_url),
                TargetPlacement::RedirectedOnce | TargetPlacement::RedirectedChain => (
                    strip_origin(&self.target_origin, &resolution.final_url),
                    resolution.final_url.clone(),
                ),
            };

            let (target_meta, title_comparison, og_title_comparison) = if placement.is_reachable() {
                let meta = fetch_metadata(&self.http, &resolution.final_url).await;
                let title = TitleComparison::of(&source_meta.title, &meta.title);
                let og_title = TitleComparison::of(&source_meta.og_title, &meta.og_title);
                (meta, Some(title), Some(og_title))
            } else {
                Default::default()
            };

            let outcome = decide_outcome(
                resolution.status,
                resolution.hops,
                title_comparison,
                og_title_comparison,
                self.profile.distinguishes_content(),
            );
            debug!(%outcome, status = resolution.status, hops = resolution.hops, "compared");

            ComparisonRecord {
                source_relative_path: relative,
                source_url: page.url.clone(),
                target_relative_path,
                target_url,
                outcome,
                source_title: source_meta.title,
                target_title: target_meta.title,
                source_og_title: source_meta.og_title,
                target_og_title: target_meta.og_title,
                title_comparison,
                og_title_comparison,
                last_modified: page.last_modified,
                checked_at: Utc::now(),
            }
        }
        .instrument(span)
        .await
    }

    /// `page` comes from the target sitemap; the source site is probed for a counterpart.
    pub async fn compare_reverse(&self, page: &CandidatePage) -> ComparisonRecord {
        let span = info_span!("compare_reverse", url = %page.url);
        async {
            let relative = relative_path(&self.target_origin, &page.url);
            let target_meta = fetch_metadata(&self.http, &page.url).await;

            let source_url = join_origin(&self.source_origin, &relative);
            let resolution = self.http.resolve_redirects(&source_url).await;

            let mut record = ComparisonRecord {
                source_relative_path: relative.clone(),
                source_url,
                target_relative_path: relative,
                target_url: page.url.clone(),
                outcome: Outcome::Present,
                source_title: String::new(),
                target_title: target_meta.title,
                source_og_title: String::new(),
                target_og_title: target_meta.og_title,
                title_comparison: None,
                og_title_comparison: None,
                last_modified: page.last_modified,
                checked_at: Utc::now(),
            };

            if resolution.status == 200 {
                let source_meta = fetch_metadata(&self.http, &resolution.final_url).await;
                record.title_comparison =
                    Some(TitleComparison::of(&source_meta.title, &record.target_title));
                record.og_title_comparison =
                    Some(TitleComparison::of(&source_meta.og_title, &record.target_og_title));
                record.source_title = source_meta.title;
                record.source_og_title = source_meta.og_title;
            } else {
                record.outcome = Outcome::Missing;
                record.source_relative_path = NEW_PATH.to_string();
                record.source_url = String::new();
            }
            debug!(outcome = %record.outcome, status = resolution.status, "compared");
            record
        }
        .instrument(span)
        .await
    }
}

/// Lazy, order-preserving, one-at-a-time comparison of `pages`.
///
/// Nothing is fetched until the stream is polled; dropping it early leaves the
/// remaining pages uncompared.
pub fn resolve_all<'a>(
    comparator: &'a PageComparator,
    direction: CheckDirection,
    pages: Vec<CandidatePage>,
) -> impl Stream<Item = ComparisonRecord> + Send + 'a {
    stream::iter(pages).then(move |page| async move { comparator.compare_in(direction, &page).await })
}

#[derive(Debug, Clone, Copy, Error)]
#[error("progress consumer went away")]
pub struct SinkClosed;

/// One-way, order-preserving destination for progress events.
#[async_trait]
pub trait ProgressSink: Send {
    async fn push(&mut self, event: CheckEvent) -> Result<(), SinkClosed>;
}

#[async_trait]
impl ProgressSink for mpsc::Sender<CheckEvent> {
    async fn push(&mut self, event: CheckEvent) -> Result<(), SinkClosed> {
        self.send(event).await.map_err(|_| SinkClosed)
    }
}

#[async_trait]
impl ProgressSink for Vec<CheckEvent> {
    async fn push(&mut self, event: CheckEvent) -> Result<(), SinkClosed> {
        Vec::push(self, event);
        Ok(())
    }
}

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Closed(#[from] SinkClosed),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed { processed: usize },
    /// The consumer stopped listening; no further pages were compared.
    ConsumerGone,
    /// A terminal error event was emitted.
    Failed { error: String },
}

/// Drives sitemap enumeration, comparison, persistence and progress reporting.
pub struct SiteChecker {
    comparator: PageComparator,
    source_sitemaps: Arc<dyn SitemapSource>,
    target_sitemaps: Arc<dyn SitemapSource>,
    caches: ResultCaches,
}

impl SiteChecker {
    pub fn new(
        comparator: PageComparator,
        source_sitemaps: Arc<dyn SitemapSource>,
        target_sitemaps: Arc<dyn SitemapSource>,
        caches: ResultCaches,
    ) -> Self {
        Self {
            comparator,
            source_sitemaps,
            target_sitemaps,
            caches,
        }
    }

    pub fn from_config(config: &SiteCheckConfig, caches: ResultCaches) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let source_sitemaps = HttpSitemapSource::new(http.clone(), config.source_sitemap_index.clone())
            .with_excluded_markers(config.excluded_sitemap_markers.clone());
        let target_sitemaps = HttpSitemapSource::new(http.clone(), config.target_sitemap_index.clone())
            .with_excluded_markers(config.excluded_sitemap_markers.clone())
            .with_single_sitemap_fallback(true);
        let comparator = PageComparator::new(
            http,
            config.source_origin.clone(),
            config.target_origin.clone(),
            config.profile,
        );
        Ok(Self::new(
            comparator,
            Arc::new(source_sitemaps),
            Arc::new(target_sitemaps),
            caches,
        ))
    }

    pub fn caches(&self) -> &ResultCaches {
        &self.caches
    }

    pub fn comparator(&self) -> &PageComparator {
        &self.comparator
    }

    /// Full check. With `use_cache`, an existing main result set is replayed instead.
    pub async fn run_check<S: ProgressSink>(&self, use_cache: bool, sink: &mut S) -> RunStatus {
        let result = self
            .check_inner(use_cache, sink)
            .instrument(info_span!("run_check", use_cache))
            .await;
        finish("check", result, sink).await
    }

    /// Compare only sitemap pages missing from the main result set.
    pub async fn run_incremental_check<S: ProgressSink>(&self, sink: &mut S) -> RunStatus {
        let result = self
            .incremental_inner(sink)
            .instrument(info_span!("run_incremental_check"))
            .await;
        finish("check-new", result, sink).await
    }

    /// Look for target pages without a source counterpart; persisted under the new-pages key.
    pub async fn run_reverse_check<S: ProgressSink>(&self, use_cache: bool, sink: &mut S) -> RunStatus {
        let result = self
            .reverse_inner(use_cache, sink)
            .instrument(info_span!("run_reverse_check", use_cache))
            .await;
        finish("check-reverse", result, sink).await
    }

    /// Compare one page and splice its record into the main result set by `source_url`.
    ///
    /// Without a `last_modified` on `page`, a replaced entry keeps its cached one.
    pub async fn recheck(&self, page: CandidatePage) -> (ComparisonRecord, SpliceOutcome) {
        let mut record = self.comparator.compare(&page).await;
        let splice = self
            .caches
            .main
            .modify(|results| {
                if record.last_modified.is_none() {
                    record.last_modified = results
                        .iter()
                        .find(|r| r.source_url == record.source_url)
                        .and_then(|r| r.last_modified);
                }
                splice_record(results, record.clone())
            })
            .await;
        info!(url = %page.url, outcome = %record.outcome, ?splice, "rechecked page");
        (record, splice)
    }

    async fn check_inner<S: ProgressSink>(&self, use_cache: bool, sink: &mut S) -> Result<usize, RunError> {
        if use_cache {
            if let Some(cached) = self.caches.main.load().await {
                return replay(cached, sink).await;
            }
        }

        sink.push(CheckEvent::Progress(ProgressEvent::started())).await?;

        let mut results = Vec::new();
        let root = CandidatePage::new(join_origin(self.comparator.source_origin(), "/"));
        self.stream_into(CheckDirection::Forward, &self.caches.main, &mut results, vec![root], -1, sink)
            .await?;

        let pages = enumerate_pages(self.source_sitemaps.as_ref()).await?;
        let pending = pending_pages(pages, &done_urls(&results));
        let total = (results.len() + pending.len()) as i64;
        sink.push(CheckEvent::Progress(ProgressEvent::counts(total, results.len() as i64)))
            .await?;

        self.stream_into(CheckDirection::Forward, &self.caches.main, &mut results, pending, total, sink)
            .await?;
        self.caches.main.save(&results).await;

        sink.push(CheckEvent::Progress(ProgressEvent::complete(total, results.len() as i64)))
            .await?;
        Ok(results.len())
    }

    async fn incremental_inner<S: ProgressSink>(&self, sink: &mut S) -> Result<usize, RunError> {
        let mut results = self
            .caches
            .main
            .load()
            .await
            .map(|set| set.results)
            .unwrap_or_default();

        let pages = enumerate_pages(self.source_sitemaps.as_ref()).await?;
        sink.push(CheckEvent::Progress(ProgressEvent::started())).await?;

        let pending = pending_pages(pages, &done_urls(&results));
        let total = (results.len() + pending.len()) as i64;
        info!(existing = results.len(), pending = pending.len(), "incremental check");
        sink.push(CheckEvent::Progress(ProgressEvent::counts(total, results.len() as i64)))
            .await?;

        self.stream_into(CheckDirection::Forward, &self.caches.main, &mut results, pending, total, sink)
            .await?;

        sink.push(CheckEvent::Progress(ProgressEvent::complete(total, results.len() as i64)))
            .await?;
        Ok(results.len())
    }

    async fn reverse_inner<S: ProgressSink>(&self, use_cache: bool, sink: &mut S) -> Result<usize, RunError> {
        if use_cache {
            if let Some(cached) = self.caches.new_pages.load().await {
                return replay(cached, sink).await;
            }
        }

        sink.push(CheckEvent::Progress(ProgressEvent::started())).await?;

        let pages = enumerate_pages(self.target_sitemaps.as_ref()).await?;
        let pending = pending_pages(pages, &HashSet::new());
        let total = pending.len() as i64;
        sink.push(CheckEvent::Progress(ProgressEvent::counts(total, 0))).await?;

        let mut results = Vec::new();
        self.stream_into(
            CheckDirection::Reverse,
            &self.caches.new_pages,
            &mut results,
            pending,
            total,
            sink,
        )
        .await?;
        self.caches.new_pages.save(&results).await;

        sink.push(CheckEvent::Progress(ProgressEvent::complete(total, results.len() as i64)))
            .await?;
        Ok(results.len())
    }

    /// Each record is appended, the whole list persisted, then the event pushed.
    async fn stream_into<S: ProgressSink>(
        &self,
        direction: CheckDirection,
        cache: &ResultCache,
        results: &mut Vec<ComparisonRecord>,
        pages: Vec<CandidatePage>,
        total: i64,
        sink: &mut S,
    ) -> Result<(), SinkClosed> {
        let mut records = std::pin::pin!(resolve_all(&self.comparator, direction, pages));
        while let Some(record) = records.next().await {
            results.push(record.clone());
            cache.save(results).await;
            sink.push(CheckEvent::Progress(ProgressEvent::with_result(
                total,
                results.len() as i64,
                record,
            )))
            .await?;
        }
        Ok(())
    }
}

async fn finish<S: ProgressSink>(name: &str, result: Result<usize, RunError>, sink: &mut S) -> RunStatus {
    match result {
        Ok(processed) => {
            info!(run = name, processed, "run complete");
            RunStatus::Completed { processed }
        }
        Err(RunError::Closed(_)) => {
            info!(run = name, "progress consumer disconnected; stopping");
            RunStatus::ConsumerGone
        }
        Err(RunError::Failed(err)) => {
            let error = format!("{err:#}");
            error!(run = name, %error, "run failed");
            let _ = sink.push(CheckEvent::Failed { error: error.clone() }).await;
            RunStatus::Failed { error }
        }
    }
}

async fn replay<S: ProgressSink>(cached: ResultSet, sink: &mut S) -> Result<usize, RunError> {
    let total = cached.results.len() as i64;
    info!(total, cached_at = %cached.cached_at, "replaying cached results");
    sink.push(CheckEvent::Progress(ProgressEvent::counts(total, 0))).await?;
    let mut processed = 0i64;
    for record in cached.results {
        processed += 1;
        sink.push(CheckEvent::Progress(ProgressEvent::with_result(total, processed, record)))
            .await?;
    }
    sink.push(CheckEvent::Progress(ProgressEvent::complete(total, processed)))
        .await?;
    Ok(processed as usize)
}

/// All pages of all sitemap files. An unreachable index is fatal, a bad sitemap file is skipped.
pub async fn enumerate_pages(source: &dyn SitemapSource) -> anyhow::Result<Vec<CandidatePage>> {
    let files = source
        .list_sitemap_files()
        .await
        .context("listing sitemap files")?;
    let mut pages = Vec::new();
    for file in files {
        match source.list_pages(&file).await {
            Ok(found) => {
                debug!(sitemap = %file, pages = found.len(), "listed sitemap pages");
                pages.extend(found);
            }
            Err(err) => warn!(sitemap = %file, error = %err, "skipping unreadable sitemap"),
        }
    }
    Ok(pages)
}

fn done_urls(results: &[ComparisonRecord]) -> HashSet<String> {
    results.iter().map(|r| r.source_url.clone()).collect()
}

/// Pages not yet in `done`, first occurrence of each URL only, order kept.
pub fn pending_pages(pages: Vec<CandidatePage>, done: &HashSet<String>) -> Vec<CandidatePage> {
    let mut seen = HashSet::new();
    pages
        .into_iter()
        .filter(|p| !done.contains(&p.url) && seen.insert(p.url.clone()))
        .collect()
}
