//! Manifest and rule-feed downloads.
//!
//! The fetcher is a trait so tests can stub the network. The HTTP
//! implementation applies the configured extra headers and maps transport
//! failures into the crate's retryability taxonomy; `fetch_with_retry`
//! drives exponential backoff with jitter around any fetcher.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::Preferences;
use crate::error::{DnshieldError, Result};

/// Backoff ceiling regardless of attempt count.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[async_trait]
pub trait ManifestFetch: Send + Sync {
    /// Fetch a document, returning its raw bytes.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Retry schedule for fetches: exponential doubling from
/// `initial_backoff`, ±25% jitter, capped at five minutes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
        }
    }
}

impl From<&Preferences> for RetryPolicy {
    fn from(prefs: &Preferences) -> Self {
        Self {
            max_attempts: prefs.max_retries.max(1),
            initial_backoff: prefs.initial_backoff,
        }
    }
}

impl RetryPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_BACKOFF);
        // ±25% jitter so a fleet of clients does not retry in lockstep
        let jitter = rand::rng().random_range(0.75..1.25);
        base.mul_f64(jitter).min(MAX_BACKOFF)
    }
}

/// Fetch with retries. Non-retryable failures (auth, not-found, parse)
/// propagate immediately; retryable ones back off and try again up to the
/// policy's attempt budget.
pub async fn fetch_with_retry(
    fetcher: &dyn ManifestFetch,
    url: &str,
    policy: &RetryPolicy,
) -> Result<Vec<u8>> {
    let mut last_err = DnshieldError::NetworkUnavailable;
    for attempt in 0..policy.max_attempts {
        match fetcher.fetch(url).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let backoff = policy.backoff_for(attempt);
                debug!(
                    "Fetch of {} failed ({}), retrying in {:?} (attempt {}/{})",
                    url,
                    e,
                    backoff,
                    attempt + 1,
                    policy.max_attempts
                );
                tokio::time::sleep(backoff).await;
                last_err = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

pub struct HttpManifestFetcher {
    client: reqwest::Client,
    headers: Vec<(String, String)>,
}

impl HttpManifestFetcher {
    pub fn new(prefs: &Preferences) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("DNShield")
            .build()
            .map_err(|e| DnshieldError::ConfigurationInvalid(e.to_string()))?;

        let mut headers = Vec::new();
        for raw in &prefs.additional_http_headers {
            match raw.split_once(':') {
                Some((name, value)) => {
                    headers.push((name.trim().to_string(), value.trim().to_string()));
                }
                None => warn!("Ignoring malformed header preference '{}'", raw),
            }
        }

        Ok(Self { client, headers })
    }
}

#[async_trait]
impl ManifestFetch for HttpManifestFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut request = self.client.get(url);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DnshieldError::Http {
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(classify_reqwest_error)?;
        Ok(bytes.to_vec())
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> DnshieldError {
    if err.is_timeout() {
        DnshieldError::Timeout
    } else if err.is_connect() {
        DnshieldError::NetworkUnavailable
    } else {
        let text = err.to_string();
        if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
            DnshieldError::Tls(text)
        } else {
            DnshieldError::NetworkUnavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyFetcher {
        calls: AtomicU32,
        fail_first: u32,
        error: fn() -> DnshieldError,
    }

    #[async_trait]
    impl ManifestFetch for FlakyFetcher {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err((self.error)())
            } else {
                Ok(b"ok".to_vec())
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let fetcher = FlakyFetcher {
            calls: AtomicU32::new(0),
            fail_first: 2,
            error: || DnshieldError::Http { status: 503 },
        };
        let bytes = fetch_with_retry(&fetcher, "https://x/", &policy()).await.unwrap();
        assert_eq!(bytes, b"ok");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let fetcher = FlakyFetcher {
            calls: AtomicU32::new(0),
            fail_first: 10,
            error: || DnshieldError::Http { status: 404 },
        };
        let err = fetch_with_retry(&fetcher, "https://x/", &policy()).await.unwrap_err();
        assert!(matches!(err, DnshieldError::Http { status: 404 }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let fetcher = FlakyFetcher {
            calls: AtomicU32::new(0),
            fail_first: 10,
            error: || DnshieldError::Timeout,
        };
        let err = fetch_with_retry(&fetcher, "https://x/", &policy()).await.unwrap_err();
        assert!(matches!(err, DnshieldError::Timeout));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_doubles_with_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(250),
        };
        // Jitter is ±25%, so bound-check rather than equality-check
        let b0 = policy.backoff_for(0);
        let b2 = policy.backoff_for(2);
        assert!(b0 >= Duration::from_millis(187) && b0 <= Duration::from_millis(313));
        assert!(b2 >= Duration::from_millis(750) && b2 <= Duration::from_millis(1250));
        assert!(policy.backoff_for(30) <= MAX_BACKOFF);
    }
}
