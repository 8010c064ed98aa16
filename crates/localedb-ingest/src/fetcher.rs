//! Idempotent resource fetcher
//!
//! Resources land in `{cache_dir}/{domain}/{filename}`. Downloads stream into
//! a `.part` sibling that is renamed into place only on success, so a present,
//! non-empty cache file always belongs to a completed fetch.

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use localedb_common::types::Domain;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::FetchConfig;
use crate::error::{IngestError, Result};

/// A resource available in the local cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResource {
    pub path: PathBuf,
    /// Attempts used; zero on a cache hit
    pub attempts: u32,
    pub from_cache: bool,
}

/// Why one attempt failed
#[derive(Debug)]
struct AttemptError {
    transient: bool,
    message: String,
}

impl AttemptError {
    fn transient(message: impl ToString) -> Self {
        Self {
            transient: true,
            message: message.to_string(),
        }
    }

    fn fatal(message: impl ToString) -> Self {
        Self {
            transient: false,
            message: message.to_string(),
        }
    }
}

impl From<reqwest::Error> for AttemptError {
    fn from(err: reqwest::Error) -> Self {
        let transient = err.is_connect()
            || err.is_timeout()
            || err.is_body()
            || err.is_decode()
            || err.is_request();
        Self {
            transient,
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for AttemptError {
    fn from(err: std::io::Error) -> Self {
        AttemptError::fatal(err)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Downloads remote resources into the cache with bounded retries
pub struct Fetcher {
    client: Client,
    cache_dir: PathBuf,
    max_attempts: u32,
    retry_delay: Duration,
    show_progress: bool,
}

impl Fetcher {
    pub fn new(cache_dir: impl Into<PathBuf>, config: &FetchConfig) -> Result<Self> {
        if config.max_attempts == 0 {
            return Err(IngestError::config("fetch max_attempts must be at least 1"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| IngestError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            cache_dir: cache_dir.into(),
            max_attempts: config.max_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            show_progress: true,
        })
    }

    /// Draw download progress bars (on by default)
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Cache location of `locator` within `domain`
    pub fn cache_path(&self, domain: Domain, locator: &str) -> Result<PathBuf> {
        let url = parse_locator(locator)?;
        let filename = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| IngestError::config(format!("locator has no file name: {}", locator)))?;
        Ok(self.cache_dir.join(domain.as_str()).join(filename))
    }

    /// Make `locator` available locally.
    ///
    /// A non-empty cached file is returned without any network request.
    /// Transient failures are retried with a linear backoff; the partial
    /// file is discarded before every attempt.
    pub async fn fetch(&self, domain: Domain, locator: &str) -> Result<FetchedResource> {
        let path = self.cache_path(domain, locator)?;

        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if meta.is_file() && meta.len() > 0 {
                debug!(path = %path.display(), bytes = meta.len(), "Cache hit");
                return Ok(FetchedResource {
                    path,
                    attempts: 0,
                    from_cache: true,
                });
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = partial_path(&path);
        let url = parse_locator(locator)?;

        for attempt in 1..=self.max_attempts {
            discard(&part).await;
            debug!(locator, attempt, max_attempts = self.max_attempts, "Fetching");

            let outcome = if url.scheme() == "file" {
                self.copy_local(&url, &part).await
            } else {
                self.download(&url, &part).await
            };

            match outcome {
                Ok(bytes) => {
                    tokio::fs::rename(&part, &path).await?;
                    info!(locator, path = %path.display(), bytes, attempt, "Fetched");
                    return Ok(FetchedResource {
                        path,
                        attempts: attempt,
                        from_cache: false,
                    });
                },
                Err(err) => {
                    discard(&part).await;
                    if !err.transient || attempt == self.max_attempts {
                        return Err(IngestError::Fetch {
                            locator: locator.to_string(),
                            attempts: attempt,
                            message: err.message,
                        });
                    }
                    let delay = self.retry_delay * attempt;
                    warn!(
                        locator,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.message,
                        "Fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }

        Err(IngestError::Internal(format!(
            "fetch loop for {} ended without a result",
            locator
        )))
    }

    async fn download(&self, url: &Url, part: &Path) -> std::result::Result<u64, AttemptError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = format!("HTTP {}", status);
            return Err(if is_transient_status(status) {
                AttemptError::transient(message)
            } else {
                AttemptError::fatal(message)
            });
        }

        let pb = self.progress_bar(response.content_length(), part);
        let mut file = tokio::fs::File::create(part).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            pb.set_position(written);
        }
        file.flush().await?;
        pb.finish_and_clear();

        if written == 0 {
            return Err(AttemptError::fatal("empty response body"));
        }
        Ok(written)
    }

    async fn copy_local(&self, url: &Url, part: &Path) -> std::result::Result<u64, AttemptError> {
        let source = url
            .to_file_path()
            .map_err(|_| AttemptError::fatal(format!("not a local path: {}", url)))?;
        let bytes = tokio::fs::copy(&source, part)
            .await
            .map_err(|e| AttemptError::fatal(format!("{}: {}", source.display(), e)))?;
        if bytes == 0 {
            return Err(AttemptError::fatal(format!("{} is empty", source.display())));
        }
        Ok(bytes)
    }

    fn progress_bar(&self, total: Option<u64>, part: &Path) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total.unwrap_or(0));
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }
        let name = part
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        pb.set_message(format!("Downloading {}", name));
        pb
    }
}

fn parse_locator(locator: &str) -> Result<Url> {
    Url::parse(locator).map_err(|e| IngestError::config(format!("bad locator {}: {}", locator, e)))
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

async fn discard(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => debug!(path = %part.display(), "Discarded partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(path = %part.display(), error = %e, "Failed to discard partial download"),
    }
}
