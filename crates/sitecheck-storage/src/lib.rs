//! HTTP probing, redirect resolution and result-set persistence.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{header, redirect, StatusCode};
use sitecheck_core::{ComparisonRecord, Resolution, ResultSet, MAX_REDIRECT_HOPS};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sitecheck-storage";

/// Logical key of the main (source → target) result set.
pub const MAIN_RESULTS_KEY: &str = "sitemap-results.json";
/// Logical key of the reverse (target → source) result set.
pub const NEW_PAGES_RESULTS_KEY: &str = "new-pages-results.json";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

/// Header-only probe result for a single hop.
#[derive(Debug, Clone)]
pub struct Probe {
    pub status: StatusCode,
    pub location: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Two reqwest clients sharing one configuration: `client` follows redirects for
/// body fetches, `probe_client` never does so hops can be counted.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    probe_client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = Self::builder(&config)
            .redirect(redirect::Policy::limited(MAX_REDIRECT_HOPS as usize))
            .build()
            .context("building reqwest client")?;
        let probe_client = Self::builder(&config)
            .redirect(redirect::Policy::none())
            .build()
            .context("building reqwest probe client")?;
        Ok(Self {
            client,
            probe_client,
        })
    }

    fn builder(config: &HttpClientConfig) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder
    }

    /// GET `url` following redirects. Non-2xx answers are errors.
    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await?;
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    /// HEAD `url` without following redirects.
    pub async fn probe(&self, url: &str) -> Result<Probe, reqwest::Error> {
        let resp = self.probe_client.head(url).send().await?;
        let location = resp
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(Probe {
            status: resp.status(),
            location,
        })
    }

    /// Follow redirects from `url` up to [`MAX_REDIRECT_HOPS`].
    ///
    /// Any transport failure at any hop yields [`Resolution::unreachable`] for the
    /// original URL. A redirect without a usable `Location` stops the walk and its
    /// own status is returned as the terminal answer.
    pub async fn resolve_redirects(&self, url: &str) -> Resolution {
        let span = info_span!("resolve_redirects", url);
        async {
            match self.follow_redirects(url).await {
                Ok(resolution) => {
                    debug!(
                        status = resolution.status,
                        hops = resolution.hops,
                        final_url = %resolution.final_url,
                        "resolved"
                    );
                    resolution
                }
                Err(err) => {
                    debug!(error = %err, "unreachable");
                    Resolution::unreachable(url)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn follow_redirects(&self, url: &str) -> Result<Resolution, reqwest::Error> {
        let mut current = url.to_string();
        let mut probe = self.probe(&current).await?;
        let mut hops = 0u32;

        while probe.status.is_redirection() && hops < MAX_REDIRECT_HOPS {
            hops += 1;
            let Some(next) = probe
                .location
                .as_deref()
                .and_then(|location| next_location(&current, location))
            else {
                break;
            };
            current = next;
            probe = self.probe(&current).await?;
        }

        Ok(Resolution {
            status: probe.status.as_u16(),
            final_url: current,
            hops,
        })
    }
}

/// Resolve a `Location` header (absolute or relative) against the URL that returned it.
pub fn next_location(current: &str, location: &str) -> Option<String> {
    let base = Url::parse(current).ok()?;
    base.join(location).ok().map(|u| u.to_string())
}

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("invalid blob key {0:?}")]
    InvalidKey(String),
    #[error("blob {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Flat key → bytes medium behind the result cache.
#[async_trait]
pub trait BlobStore: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError>;
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError>;
    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;
    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError>;
}

/// One file per key under `root`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobStoreError> {
        let valid = !key.is_empty()
            && key != "."
            && key != ".."
            && !key.contains(['/', '\\'])
            && !key.starts_with('.');
        if !valid {
            return Err(BlobStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

fn io_err(key: &str) -> impl FnOnce(std::io::Error) -> BlobStoreError + '_ {
    move |source| BlobStoreError::Io {
        key: key.to_string(),
        source,
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(key)(err)),
        }
    }

    /// Writes a temp file next to the target and renames it into place.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.root).await.map_err(io_err(key))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(key))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(key)(err));
        }

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(key)(err));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(key)(err)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        let path = self.path_for(key)?;
        fs::try_exists(&path).await.map_err(io_err(key))
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError> {
        self.blobs
            .write()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        Ok(self.blobs.read().await.contains_key(key))
    }
}

#[derive(Debug, Error)]
enum CacheError {
    #[error(transparent)]
    Store(#[from] BlobStoreError),
    #[error("decoding cached result set: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Best-effort persisted [`ResultSet`] under one key.
///
/// Every operation, reads included, holds the lock for its whole duration.
#[derive(Debug, Clone)]
pub struct ResultCache {
    store: Arc<dyn BlobStore>,
    key: &'static str,
    lock: Arc<Mutex<()>>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn BlobStore>, key: &'static str) -> Self {
        Self::with_lock(store, key, Arc::new(Mutex::new(())))
    }

    fn with_lock(store: Arc<dyn BlobStore>, key: &'static str, lock: Arc<Mutex<()>>) -> Self {
        Self { store, key, lock }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    /// `None` when nothing was saved or the read failed.
    pub async fn load(&self) -> Option<ResultSet> {
        let _guard = self.lock.lock().await;
        match self.read_locked().await {
            Ok(set) => set,
            Err(err) => {
                warn!(key = self.key, error = %err, "reading result cache failed; treating as empty");
                None
            }
        }
    }

    /// Replace the persisted set with `results`, stamped now. Failures are logged and dropped.
    pub async fn save(&self, results: &[ComparisonRecord]) {
        let _guard = self.lock.lock().await;
        self.write_locked(results).await;
    }

    pub async fn clear(&self) {
        let _guard = self.lock.lock().await;
        self.delete_locked().await;
    }

    /// Read-modify-write of the whole set under a single lock acquisition.
    /// A missing or unreadable set starts out empty.
    pub async fn modify<R>(&self, f: impl FnOnce(&mut Vec<ComparisonRecord>) -> R) -> R {
        let _guard = self.lock.lock().await;
        let mut results = match self.read_locked().await {
            Ok(Some(set)) => set.results,
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(key = self.key, error = %err, "reading result cache failed; rebuilding");
                Vec::new()
            }
        };
        let out = f(&mut results);
        self.write_locked(&results).await;
        out
    }

    async fn read_locked(&self) -> Result<Option<ResultSet>, CacheError> {
        let Some(bytes) = self.store.get(self.key).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn delete_locked(&self) {
        if let Err(err) = self.store.delete(self.key).await {
            warn!(key = self.key, error = %err, "clearing result cache failed");
        }
    }

    async fn write_locked(&self, results: &[ComparisonRecord]) {
        let set = ResultSet::stamped_now(results.to_vec());
        let bytes = match serde_json::to_vec_pretty(&set) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key = self.key, error = %err, "serializing result set failed");
                return;
            }
        };
        if let Err(err) = self.store.put(self.key, &bytes).await {
            warn!(key = self.key, error = %err, "saving result cache failed");
        }
    }
}

/// Main and new-pages caches over one medium, sharing one lock.
#[derive(Debug, Clone)]
pub struct ResultCaches {
    pub main: ResultCache,
    pub new_pages: ResultCache,
}

impl ResultCaches {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        let lock = Arc::new(Mutex::new(()));
        Self {
            main: ResultCache::with_lock(store.clone(), MAIN_RESULTS_KEY, lock.clone()),
            new_pages: ResultCache::with_lock(store, NEW_PAGES_RESULTS_KEY, lock),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBlobStore::new()))
    }

    pub fn on_disk(root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FsBlobStore::new(root)))
    }

    /// Deletes both sets inside one acquisition of the shared lock.
    pub async fn clear_all(&self) {
        let _guard = self.main.lock.lock().await;
        self.main.delete_locked().await;
        self.new_pages.delete_locked().await;
    }
}
