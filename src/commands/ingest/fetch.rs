use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::{info, warn};

use super::error::{CancelFlag, PipelineError, StageResultExt};
use crate::util::sha256_bytes;

const USER_AGENT: &str = concat!("geoconsole/", env!("CARGO_PKG_VERSION"));
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CANCEL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Url(String),
    File(PathBuf),
}

impl SourceLocation {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Self::Url(trimmed.to_string());
        }
        let path = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        Self::File(PathBuf::from(path))
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl FetchConfig {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedSource {
    pub bytes: Vec<u8>,
    pub sha256: String,
}

pub struct Fetcher {
    client: Client,
    config: FetchConfig,
}

enum AttemptError {
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build http client")?;

        Ok(Self { client, config })
    }

    pub fn fetch(
        &self,
        location: &SourceLocation,
        cancel: &CancelFlag,
    ) -> Result<FetchedSource, PipelineError> {
        cancel.check()?;
        let bytes = match location {
            SourceLocation::File(path) => fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))
                .or_source_unavailable()?,
            SourceLocation::Url(url) => self.fetch_url(url, cancel)?,
        };

        let sha256 = sha256_bytes(&bytes);
        info!(source = %location, bytes = bytes.len(), sha256 = %sha256, "fetched source");

        Ok(FetchedSource { bytes, sha256 })
    }

    fn fetch_url(&self, url: &str, cancel: &CancelFlag) -> Result<Vec<u8>, PipelineError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = anyhow!("no fetch attempt made for {url}");

        for attempt in 1..=max_attempts {
            cancel.check()?;
            match self.attempt(url) {
                Ok(bytes) => return Ok(bytes),
                Err(AttemptError::Fatal(err)) => return Err(PipelineError::SourceUnavailable(err)),
                Err(AttemptError::Retryable(err)) => {
                    if attempt < max_attempts {
                        let delay = self.config.delay_for_attempt(attempt);
                        warn!(
                            url,
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "fetch attempt failed, retrying"
                        );
                        sleep_unless_cancelled(delay, cancel)?;
                    }
                    last_error = err;
                }
            }
        }

        Err(PipelineError::SourceUnavailable(last_error.context(format!(
            "giving up on {url} after {max_attempts} attempts"
        ))))
    }

    fn attempt(&self, url: &str) -> Result<Vec<u8>, AttemptError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| AttemptError::Retryable(anyhow!(err).context(format!("GET {url}"))))?;

        let status = response.status();
        if !status.is_success() {
            let err = anyhow!("GET {url} returned {status}");
            return Err(if is_retryable_status(status) {
                AttemptError::Retryable(err)
            } else {
                AttemptError::Fatal(err)
            });
        }

        let body = response.bytes().map_err(|err| {
            AttemptError::Retryable(anyhow!(err).context(format!("failed to read body of {url}")))
        })?;
        Ok(body.to_vec())
    }
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancelFlag) -> Result<(), PipelineError> {
    let mut remaining = delay;
    while !remaining.is_zero() {
        cancel.check()?;
        let step = remaining.min(CANCEL_POLL);
        thread::sleep(step);
        remaining -= step;
    }
    cancel.check()
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}
