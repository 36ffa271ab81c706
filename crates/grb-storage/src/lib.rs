//! Artifact storage, info-hash verification and HTTP fetch utilities for GRB.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use grb_core::HashCheck;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_bencode::value::Value;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "grb-storage";

/// First byte of every bencoded torrent (a dictionary).
pub const TORRENT_MARKER: u8 = b'd';

const MAX_FILE_NAME_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("downloaded content is an HTML page, not an artifact")]
    HtmlPage,
    #[error("downloaded content does not start with the expected marker (got {0:#04x})")]
    BadMarker(u8),
    #[error("downloaded content exceeds the {limit} byte cap")]
    TooLarge { limit: u64 },
    #[error("downloaded content is empty")]
    Empty,
    #[error("artifact is not a valid container: {0}")]
    Decode(#[from] serde_bencode::Error),
    #[error("artifact has no info dictionary")]
    MissingInfo,
    #[error("info dictionary could not be re-encoded: {0}")]
    Reencode(#[source] serde_bencode::Error),
    #[error("artifact io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl ArtifactError {
    /// Content problems, as opposed to transport or filesystem failures.
    pub fn is_invalid_content(&self) -> bool {
        matches!(
            self,
            Self::HtmlPage
                | Self::BadMarker(_)
                | Self::TooLarge { .. }
                | Self::Empty
                | Self::Decode(_)
                | Self::MissingInfo
                | Self::Reencode(_)
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ArtifactLimits {
    pub max_bytes: u64,
    pub marker: u8,
}

impl Default for ArtifactLimits {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024,
            marker: TORRENT_MARKER,
        }
    }
}

impl ArtifactLimits {
    pub fn with_max_megabytes(max_mb: u64) -> Self {
        Self {
            max_bytes: max_mb.max(1) * 1024 * 1024,
            ..Self::default()
        }
    }
}

/// Incremental content check applied to every chunk before it reaches disk.
#[derive(Debug)]
pub struct ArtifactGuard {
    limits: ArtifactLimits,
    written: u64,
}

impl ArtifactGuard {
    pub fn new(limits: ArtifactLimits) -> Self {
        Self { limits, written: 0 }
    }

    pub fn check(&mut self, chunk: &[u8]) -> Result<(), ArtifactError> {
        if chunk.is_empty() {
            return Ok(());
        }
        if self.written == 0 {
            match chunk[0] {
                b if b == self.limits.marker => {}
                b'<' => return Err(ArtifactError::HtmlPage),
                other => return Err(ArtifactError::BadMarker(other)),
            }
        }
        self.written += chunk.len() as u64;
        if self.written > self.limits.max_bytes {
            return Err(ArtifactError::TooLarge {
                limit: self.limits.max_bytes,
            });
        }
        Ok(())
    }

    pub fn finish(&self) -> Result<u64, ArtifactError> {
        if self.written == 0 {
            return Err(ArtifactError::Empty);
        }
        Ok(self.written)
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    /// Name relative to the store root; this is what the canonical store records.
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub byte_size: u64,
    pub reused: bool,
}

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

    /// Filesystem-safe name: path separators become `_`, reserved characters
    /// are dropped, the result is trimmed and capped at 200 characters.
    pub fn safe_filename(name: &str) -> String {
        let cleaned: String = name
            .chars()
            .filter_map(|c| match c {
                '/' | '\\' => Some('_'),
                ':' | '?' | '*' | '"' | '<' | '>' | '|' => None,
                other => Some(other),
            })
            .collect();
        cleaned.trim().chars().take(MAX_FILE_NAME_CHARS).collect()
    }

    pub fn torrent_file_name(title: &str) -> String {
        Self::safe_filename(&format!("{title}.torrent"))
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub async fn existing(&self, file_name: &str) -> anyhow::Result<Option<StoredArtifact>> {
        let absolute_path = self.path_for(file_name);
        match fs::metadata(&absolute_path).await {
            Ok(meta) if meta.is_file() => Ok(Some(StoredArtifact {
                file_name: file_name.to_string(),
                absolute_path,
                byte_size: meta.len(),
                reused: true,
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("checking artifact path {}", absolute_path.display())),
        }
    }

    /// Open a guarded writer that lands at `file_name` only on `commit`.
    pub async fn begin(
        &self,
        file_name: &str,
        limits: ArtifactLimits,
    ) -> Result<ArtifactWriter, ArtifactError> {
        fs::create_dir_all(&self.root).await?;
        let absolute_path = self.path_for(file_name);
        let temp_path = self
            .root
            .join(format!(".{}.partial", Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        Ok(ArtifactWriter {
            file: Some(file),
            guard: ArtifactGuard::new(limits),
            temp_path,
            absolute_path,
            file_name: file_name.to_string(),
        })
    }

    /// Store an in-memory artifact through the same guard as streamed downloads.
    pub async fn store_bytes(
        &self,
        file_name: &str,
        bytes: &[u8],
        limits: ArtifactLimits,
    ) -> Result<StoredArtifact, ArtifactError> {
        let mut writer = self.begin(file_name, limits).await?;
        if let Err(err) = writer.write_chunk(bytes).await {
            writer.abort().await;
            return Err(err);
        }
        writer.commit().await
    }

    /// Returns whether a file was removed.
    pub async fn remove(&self, file_name: &str) -> anyhow::Result<bool> {
        let path = self.path_for(file_name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing artifact {}", path.display())),
        }
    }
}

#[derive(Debug)]
pub struct ArtifactWriter {
    file: Option<fs::File>,
    guard: ArtifactGuard,
    temp_path: PathBuf,
    absolute_path: PathBuf,
    file_name: String,
}

impl ArtifactWriter {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ArtifactError> {
        self.guard.check(chunk)?;
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
        }
        Ok(())
    }

    /// Atomically rename the temp file into place.
    pub async fn commit(mut self) -> Result<StoredArtifact, ArtifactError> {
        let byte_size = match self.guard.finish() {
            Ok(size) => size,
            Err(err) => {
                self.abort().await;
                return Err(err);
            }
        };
        if let Some(mut file) = self.file.take() {
            if let Err(err) = file.flush().await {
                let _ = fs::remove_file(&self.temp_path).await;
                return Err(err.into());
            }
        }
        if let Err(err) = fs::rename(&self.temp_path, &self.absolute_path).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err.into());
        }
        Ok(StoredArtifact {
            file_name: self.file_name.clone(),
            absolute_path: self.absolute_path.clone(),
            byte_size,
            reused: false,
        })
    }

    /// Discard everything written so far.
    pub async fn abort(&mut self) {
        self.file.take();
        if let Err(err) = fs::remove_file(&self.temp_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.temp_path.display(), error = %err, "could not discard partial artifact");
            }
        }
    }
}

/// Uppercase hex SHA-1 over the canonical re-encoding of the `info` dictionary.
pub fn info_hash(bytes: &[u8]) -> Result<String, ArtifactError> {
    if bytes.is_empty() {
        return Err(ArtifactError::Empty);
    }
    if bytes[0] != TORRENT_MARKER {
        return Err(if bytes[0] == b'<' {
            ArtifactError::HtmlPage
        } else {
            ArtifactError::BadMarker(bytes[0])
        });
    }
    let Value::Dict(container) = serde_bencode::from_bytes::<Value>(bytes)? else {
        return Err(ArtifactError::MissingInfo);
    };
    let info = container
        .get(b"info".as_slice())
        .ok_or(ArtifactError::MissingInfo)?;
    // Dictionary keys come back out sorted, so this is the canonical form.
    let canonical = serde_bencode::to_bytes(info).map_err(ArtifactError::Reencode)?;
    let mut hasher = Sha1::new();
    hasher.update(&canonical);
    Ok(hex::encode_upper(hasher.finalize()))
}

/// Hash the stored artifact and compare with the expected download id. An
/// unreadable or undecodable artifact yields `computed = None, match = false`.
pub async fn verify_artifact(path: &Path, expected: &str) -> HashCheck {
    let computed = match fs::read(path).await {
        Ok(bytes) => match info_hash(&bytes) {
            Ok(hash) => Some(hash),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "artifact could not be hashed");
                None
            }
        },
        Err(err) => {
            warn!(path = %path.display(), error = %err, "artifact could not be read");
            None
        }
    };
    HashCheck::new(expected, computed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
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
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// `attempts` counts the first try, so three attempts means two retries.
    pub fn from_attempts(attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_retries: attempts.max(1) - 1,
            base_delay,
            ..Self::default()
        }
    }

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
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("http client is shutting down")]
    Closed,
}

impl FetchError {
    /// Whether the failure was of a retryable class (and so ran out of retries).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            Self::Decode { .. } | Self::Closed => false,
        }
    }
}

/// GET request description; rebuilt for every retry attempt.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Send with retry on retryable statuses and connection errors; returns the
    /// first successful response. Non-retryable failures return immediately.
    pub async fn send(
        &self,
        source_id: &str,
        request: &HttpRequest,
    ) -> Result<reqwest::Response, FetchError> {
        let span = info_span!("http_fetch", source_id, url = %request.url);
        async {
            let Ok(_global) = self.global_limit.acquire().await else {
                return Err(FetchError::Closed);
            };
            let per_source = self.per_source_semaphore(source_id).await;
            let Ok(_source) = per_source.acquire().await else {
                return Err(FetchError::Closed);
            };

            let mut attempt = 0;
            loop {
                let mut builder = self.client.get(&request.url);
                for (name, value) in &request.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                if !request.query.is_empty() {
                    builder = builder.query(&request.query);
                }
                let can_retry = attempt < self.backoff.max_retries;

                match builder.send().await {
                    Ok(resp) if resp.status().is_success() => return Ok(resp),
                    Ok(resp) => {
                        let status = resp.status();
                        if !(can_retry && classify_status(status) == RetryDisposition::Retryable) {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: resp.url().to_string(),
                            });
                        }
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt = attempt + 1, ?delay, "retryable http status");
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => {
                        if !(can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable) {
                            return Err(FetchError::Request(err));
                        }
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt = attempt + 1, ?delay, "request failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        request: &HttpRequest,
    ) -> Result<Vec<u8>, FetchError> {
        let resp = self.send(source_id, request).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        source_id: &str,
        request: &HttpRequest,
    ) -> Result<T, FetchError> {
        let bytes = self.fetch_bytes(source_id, request).await?;
        serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode {
            url: request.url.clone(),
            message: err.to_string(),
        })
    }

    /// Stream a download into the artifact store, enforcing the byte cap and
    /// the container marker. A rejected or failed download leaves nothing behind.
    pub async fn download_artifact(
        &self,
        source_id: &str,
        request: &HttpRequest,
        store: &ArtifactStore,
        file_name: &str,
        limits: ArtifactLimits,
    ) -> Result<StoredArtifact, ArtifactError> {
        let mut resp = self.send(source_id, request).await?;
        if let Some(len) = resp.content_length() {
            if len > limits.max_bytes {
                return Err(ArtifactError::TooLarge {
                    limit: limits.max_bytes,
                });
            }
        }

        let mut writer = store.begin(file_name, limits).await?;
        loop {
            let chunk = match resp.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    writer.abort().await;
                    return Err(FetchError::Request(err).into());
                }
            };
            if let Err(err) = writer.write_chunk(&chunk).await {
                writer.abort().await;
                return Err(err);
            }
        }
        writer.commit().await
    }
}
