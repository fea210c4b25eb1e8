//! Page fetching, raw artifact capture and contest snapshot persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ccal_core::{ContestKind, ContestRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ccal-storage";

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write through a sibling temp file and rename it into place, replacing any previous file.
async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Raw artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed copies of fetched listing pages.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        kind: ContestKind,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(kind.as_str())
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        kind: ContestKind,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(fetched_at, kind, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let exists = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;
        if !exists {
            write_atomically(&absolute_path, bytes)
                .await
                .with_context(|| format!("writing artifact {}", absolute_path.display()))?;
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: exists,
        })
    }
}

// ---------------------------------------------------------------------------
// Page fetching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch of {url} cancelled")]
    Cancelled { url: String },
}

/// Retrieves one listing page. The core never talks to sockets directly.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError>;
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
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let request_error = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };

        async {
            let resp = self.client.get(url).send().await.map_err(request_error)?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.text().await.map_err(request_error)?;
            debug!(status = status.as_u16(), bytes = body.len(), "fetched page");
            Ok(FetchedPage {
                url: url.to_string(),
                final_url,
                body,
            })
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }
}

// ---------------------------------------------------------------------------
// Contest snapshots
// ---------------------------------------------------------------------------

/// One crawl's finished collection, handed over whole to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub kind: ContestKind,
    pub run_id: Uuid,
    pub saved_at: DateTime<Utc>,
    pub contests: Vec<ContestRecord>,
}

impl Snapshot {
    pub fn new(kind: ContestKind, run_id: Uuid, contests: Vec<ContestRecord>) -> Self {
        Self {
            kind,
            run_id,
            saved_at: Utc::now(),
            contests,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    schema_version: u32,
    kind: ContestKind,
    run_id: Uuid,
    saved_at: DateTime<Utc>,
    /// Hex SHA-256 of the serialized `contests` array.
    sha256: String,
    contests: Vec<ContestRecord>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot encoding for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot decoding for {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot {path} has schema version {found}, expected {expected}")]
    UnsupportedSchema {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("snapshot {path} failed its checksum (recorded {recorded}, computed {computed})")]
    ChecksumMismatch {
        path: PathBuf,
        recorded: String,
        computed: String,
    },
}

/// Persistence boundary for finished crawls. `save` overwrites the previous snapshot of the
/// same kind; `load` returns the most recent save, or `None` if there has been none.
#[async_trait]
pub trait ContestSink: Send + Sync {
    async fn save(&self, snapshot: Snapshot) -> Result<(), StoreError>;
    async fn load(&self, kind: ContestKind) -> Result<Option<Snapshot>, StoreError>;
}

/// File-backed sink keeping one JSON envelope per contest kind.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self, kind: ContestKind) -> PathBuf {
        self.root.join(format!("{kind}.json"))
    }
}

fn contests_digest(path: &Path, contests: &[ContestRecord]) -> Result<String, StoreError> {
    let payload = serde_json::to_vec(contests).map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(sha256_hex(&payload))
}

#[async_trait]
impl ContestSink for SnapshotStore {
    async fn save(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let path = self.snapshot_path(snapshot.kind);
        let envelope = SnapshotEnvelope {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            kind: snapshot.kind,
            run_id: snapshot.run_id,
            saved_at: snapshot.saved_at,
            sha256: contests_digest(&path, &snapshot.contests)?,
            contests: snapshot.contests,
        };
        let bytes = serde_json::to_vec_pretty(&envelope).map_err(|source| StoreError::Encode {
            path: path.clone(),
            source,
        })?;

        write_atomically(&path, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(
            kind = %envelope.kind,
            contests = envelope.contests.len(),
            path = %path.display(),
            "saved snapshot"
        );
        Ok(())
    }

    async fn load(&self, kind: ContestKind) -> Result<Option<Snapshot>, StoreError> {
        let path = self.snapshot_path(kind);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let envelope: SnapshotEnvelope =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
                path: path.clone(),
                source,
            })?;
        if envelope.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                path,
                found: envelope.schema_version,
                expected: SNAPSHOT_SCHEMA_VERSION,
            });
        }

        let computed = contests_digest(&path, &envelope.contests)?;
        if computed != envelope.sha256 {
            return Err(StoreError::ChecksumMismatch {
                path,
                recorded: envelope.sha256,
                computed,
            });
        }

        Ok(Some(Snapshot {
            kind: envelope.kind,
            run_id: envelope.run_id,
            saved_at: envelope.saved_at,
            contests: envelope.contests,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn contest(id: &str, start_time: i64) -> ContestRecord {
        ContestRecord {
            id: id.to_string(),
            title: id.to_uppercase(),
            start_time,
            duration: 6000,
            rated_range: "All".to_string(),
        }
    }

    #[test]
    fn artifact_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn artifact_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(fetched_at, ContestKind::Archive, "html", b"<html>same</html>")
            .await
            .expect("first store");
        let second = store
            .store_bytes(fetched_at, ContestKind::Archive, "html", b"<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20260224_120000/archive"));
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn load_before_any_save_is_none() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        assert!(store.load(ContestKind::Upcoming).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_and_load_returns_latest() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("snapshots"));

        let first = Snapshot::new(ContestKind::Upcoming, Uuid::new_v4(), vec![contest("abc100", 10)]);
        store.save(first).await.unwrap();

        let second = Snapshot::new(
            ContestKind::Upcoming,
            Uuid::new_v4(),
            vec![contest("abc101", 20), contest("arc100", 30)],
        );
        store.save(second.clone()).await.unwrap();

        let loaded = store.load(ContestKind::Upcoming).await.unwrap().unwrap();
        assert_eq!(loaded.run_id, second.run_id);
        assert_eq!(loaded.contests, second.contests);
        assert!(store.load(ContestKind::Archive).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tampered_snapshot_fails_checksum() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        store
            .save(Snapshot::new(ContestKind::Archive, Uuid::new_v4(), vec![contest("abc100", 10)]))
            .await
            .unwrap();

        let path = store.snapshot_path(ContestKind::Archive);
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("\"ABC100\"", "\"ABC999\"")).unwrap();

        let err = store.load(ContestKind::Archive).await.unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }), "{err}");
    }

    #[tokio::test]
    async fn unreadable_snapshot_is_a_decode_error() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let path = store.snapshot_path(ContestKind::Upcoming);
        std::fs::write(&path, "{ \"schema_version\": 1, ").unwrap();

        let err = store.load(ContestKind::Upcoming).await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }), "{err}");
    }

    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/contests/archive?page=1")
    }

    #[tokio::test]
    async fn http_fetcher_returns_body_on_success() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: 15\r\nconnection: close\r\n\r\n<table></table>",
        )
        .await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let page = fetcher.fetch_page(&url).await.unwrap();
        assert_eq!(page.url, url);
        assert_eq!(page.body, "<table></table>");
    }

    #[tokio::test]
    async fn http_fetcher_maps_non_success_status() {
        let url = serve_once("HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher.fetch_page(&url).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }), "{err}");
    }
}
