//! Archive fetching, caching, extraction and fingerprinting for MAUDE files.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use maude_core::EngineError;
use maude_sources::RemoteProbe;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, Instrument};

mod cache;

pub use cache::{ArchiveCache, Clock, EnsuredFile, FixedClock, SystemClock};

pub const CRATE_NAME: &str = "maude-storage";

/// Block size used when hashing source files.
pub const FINGERPRINT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Browser-like agent; the upstream rejects obvious bots.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a file's full contents, read in fixed blocks so memory stays
/// flat for multi-gigabyte inputs.
pub async fn fingerprint_file(path: impl AsRef<Path>) -> Result<String, EngineError> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || fingerprint_file_blocking(&path))
        .await
        .map_err(|err| EngineError::Io(io::Error::other(err)))?
}

fn fingerprint_file_blocking(path: &Path) -> Result<String, EngineError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; FINGERPRINT_BLOCK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Extract every entry of `archive` into `dest` and return the text file that
/// best matches `stem` (case-insensitive), or the first text file found.
///
/// Entry names that would escape `dest` are skipped.
pub fn extract_archive(archive: &Path, dest: &Path, stem: &str) -> Result<PathBuf, EngineError> {
    let corrupt = |reason: String| EngineError::ArchiveCorrupt {
        path: archive.to_path_buf(),
        reason,
    };

    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|err| corrupt(err.to_string()))?;
    let wanted = stem.to_ascii_lowercase();
    let mut first_text = None;
    let mut matched = None;

    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx).map_err(|err| corrupt(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let Some(relative) = entry.enclosed_name() else {
            debug!(name = entry.name(), "skipping archive entry with unsafe path");
            continue;
        };

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out).map_err(|err| corrupt(err.to_string()))?;

        let is_text = relative
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("txt"))
            .unwrap_or(false);
        if !is_text {
            continue;
        }
        let entry_stem = relative
            .file_stem()
            .map(|s| s.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if matched.is_none() && entry_stem == wanted {
            matched = Some(target.clone());
        }
        if first_text.is_none() {
            first_text = Some(target);
        }
    }

    matched
        .or(first_text)
        .ok_or_else(|| corrupt("archive contains no .txt entry".into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    /// The archive is not published under this name; try the next candidate.
    Missing,
    NonRetryable,
}

/// The download host answers 403 rather than 404 for names it does not
/// publish, so both mean "missing" rather than a hard failure.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::GONE => RetryDisposition::Missing,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => RetryDisposition::Retryable,
        s if s.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored.
pub fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
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
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Doubling delay per attempt, or the server's `Retry-After` when it sent
    /// one. Either way never longer than `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize, server_hint: Option<Duration>) -> Duration {
        let delay = server_hint.unwrap_or_else(|| {
            let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        });
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub probe_timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: maude_sources::FDA_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("writing download: {0}")]
    Io(#[from] io::Error),
}

/// Where archives come from. The cache only knows archive names.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Download `archive_name` into `dest`, returning the number of bytes written.
    async fn fetch_archive(&self, archive_name: &str, dest: &Path) -> Result<u64, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
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
            base_url: config.base_url.trim_end_matches('/').to_string(),
            probe_timeout: config.probe_timeout,
            backoff: config.backoff,
        })
    }

    pub fn url_for(&self, archive_name: &str) -> String {
        format!("{}/{archive_name}", self.base_url)
    }

    async fn download_once(&self, url: &str, dest: &Path) -> Result<u64, AttemptError> {
        let mut resp = self.client.get(url).send().await.map_err(AttemptError::Request)?;
        let status = resp.status();
        if !status.is_success() {
            if classify_status(status) == RetryDisposition::Missing {
                debug!(%url, %status, "archive not published");
                return Err(AttemptError::Fatal(FetchError::NotFound {
                    url: url.to_string(),
                }));
            }
            return Err(AttemptError::Status(status, retry_after(resp.headers())));
        }

        let mut file = fs::File::create(dest)
            .await
            .map_err(|err| AttemptError::Fatal(err.into()))?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(AttemptError::Request)? {
            file.write_all(&chunk)
                .await
                .map_err(|err| AttemptError::Fatal(err.into()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|err| AttemptError::Fatal(err.into()))?;
        Ok(written)
    }
}

enum AttemptError {
    Request(reqwest::Error),
    Status(StatusCode, Option<Duration>),
    Fatal(FetchError),
}

#[async_trait]
impl ArchiveSource for HttpFetcher {
    async fn fetch_archive(&self, archive_name: &str, dest: &Path) -> Result<u64, FetchError> {
        let url = self.url_for(archive_name);
        let span = tracing::info_span!("http_fetch", archive = archive_name, url = %url);

        async {
            for attempt in 0..=self.backoff.max_retries {
                let (retry, hint) = match self.download_once(&url, dest).await {
                    Ok(bytes) => {
                        info!(bytes, "downloaded archive");
                        return Ok(bytes);
                    }
                    Err(AttemptError::Fatal(err)) => return Err(err),
                    Err(AttemptError::Status(status, hint)) => {
                        if classify_status(status) != RetryDisposition::Retryable
                            || attempt == self.backoff.max_retries
                        {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: url.clone(),
                            });
                        }
                        (status.to_string(), hint)
                    }
                    Err(AttemptError::Request(err)) => {
                        if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                            || attempt == self.backoff.max_retries
                        {
                            return Err(FetchError::Request(err));
                        }
                        (err.to_string(), None)
                    }
                };
                let delay = self.backoff.delay_for_attempt(attempt, hint);
                debug!(attempt, ?delay, reason = %retry, "retrying download");
                tokio::time::sleep(delay).await;
            }
            unreachable!("retry loop returns on its final attempt")
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl RemoteProbe for HttpFetcher {
    async fn exists(&self, archive_name: &str) -> bool {
        let url = self.url_for(archive_name);
        match self
            .client
            .head(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            // Some mirrors refuse HEAD; ask for the first byte instead.
            Ok(resp)
                if matches!(
                    resp.status(),
                    StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
                ) =>
            {
                self.client
                    .get(&url)
                    .header(reqwest::header::RANGE, "bytes=0-0")
                    .timeout(self.probe_timeout)
                    .send()
                    .await
                    .map(|resp| resp.status().is_success())
                    .unwrap_or(false)
            }
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!(%url, error = %err, "existence probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    pub(crate) fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn file_fingerprint_matches_in_memory_hash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device2020.txt");
        let body = "MDR_REPORT_KEY|BRAND_NAME\n".repeat(50_000);
        std::fs::write(&path, &body).unwrap();

        assert_eq!(fingerprint_file(&path).await.unwrap(), sha256_hex(body.as_bytes()));
    }

    #[test]
    fn extraction_prefers_matching_stem() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("mdrfoithru2025.zip");
        write_zip(
            &archive,
            &[("readme.txt", "notes"), ("mdrfoiThru2025.txt", "A|B\n1|2\n")],
        );

        let out = extract_archive(&archive, dir.path(), "mdrfoithru2025").unwrap();
        assert_eq!(out, dir.path().join("mdrfoiThru2025.txt"));
        assert!(dir.path().join("readme.txt").exists());
    }

    #[test]
    fn extraction_skips_escaping_entries() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("device2020.zip");
        write_zip(&archive, &[("../evil.txt", "x"), ("device2020.txt", "A\n")]);

        let dest = dir.path().join("data");
        std::fs::create_dir_all(&dest).unwrap();
        let out = extract_archive(&archive, &dest, "device2020").unwrap();
        assert_eq!(out, dest.join("device2020.txt"));
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn garbage_archive_is_reported_corrupt() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("device2020.zip");
        std::fs::write(&archive, b"<html>not a zip</html>").unwrap();

        match extract_archive(&archive, dir.path(), "device2020") {
            Err(EngineError::ArchiveCorrupt { path, .. }) => assert_eq!(path, archive),
            other => panic!("expected ArchiveCorrupt, got {other:?}"),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2, None), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5, None), Duration::from_millis(350));
        assert_eq!(
            policy.delay_for_attempt(0, Some(Duration::from_millis(250))),
            Duration::from_millis(250)
        );
        assert_eq!(
            policy.delay_for_attempt(0, Some(Duration::from_secs(120))),
            Duration::from_millis(350)
        );
    }

    #[test]
    fn retry_after_reads_delta_seconds_only() {
        use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn retry_classification_targets_transient_statuses() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::Missing);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::Missing);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }

    #[test]
    fn urls_join_base_and_archive_name() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            base_url: "https://example.test/maude/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            fetcher.url_for("device2023.zip"),
            "https://example.test/maude/device2023.zip"
        );
    }
}
