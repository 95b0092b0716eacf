//! Raw document retrieval with per-source throttling and bounded retries.
//!
//! Every request from one [`Fetcher`] waits on the same `governor` limiter
//! first, retries included, so a source never sees two requests closer
//! together than its configured interval.
//!
//! | Response | Handling |
//! |----------|----------|
//! | 2xx | Archived as a [`RawDocument`] and returned |
//! | 408, 429, 500, 502, 503, 504, timeout, network error | Retried with backoff; `Retry-After` honored |
//! | 403, 451 | `Blocked`, surfaced immediately |
//! | other | `HttpError`, surfaced immediately |
//!
//! The HTTP layer is the [`HttpTransport`] trait so tests can script
//! responses without a network.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header::RETRY_AFTER;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use rumah_harness_core::error::FetchError;
use rumah_harness_core::models::{now_millis, RawDocument};
use rumah_harness_core::store::ListingStore;

use crate::config::FetchConfig;
use crate::retry::{retry_with_backoff, RetryDecision, RetryFailure, RetryPolicy};

/// A response as seen by the fetcher.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    /// Parsed `Retry-After` header, in seconds form.
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Network(String),
}

/// Minimal HTTP GET abstraction.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;
}

/// Production transport backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = resp.text().await.map_err(transport_error)?;
        Ok(HttpResponse {
            status,
            body,
            retry_after,
        })
    }
}

/// Statuses worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Statuses a source uses to refuse scrapers.
pub fn is_blocked_status(status: u16) -> bool {
    matches!(status, 403 | 451)
}

struct AttemptError {
    error: FetchError,
    retry_after: Option<Duration>,
}

fn classify(attempt: &AttemptError) -> RetryDecision {
    match &attempt.error {
        FetchError::Timeout { .. } | FetchError::Network { .. } => RetryDecision::Retry,
        FetchError::HttpError { status, .. } if is_retryable_status(*status) => attempt
            .retry_after
            .map(RetryDecision::RetryAfter)
            .unwrap_or(RetryDecision::Retry),
        _ => RetryDecision::GiveUp,
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Throttled, retrying fetcher for one source.
pub struct Fetcher {
    source_id: String,
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn ListingStore>,
    policy: RetryPolicy,
    limiter: DirectLimiter,
}

impl Fetcher {
    pub fn new(
        source_id: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn ListingStore>,
        policy: RetryPolicy,
        min_interval: Duration,
    ) -> Self {
        let quota = Quota::with_period(min_interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX));
        Self {
            source_id: source_id.into(),
            transport,
            store,
            policy,
            limiter: RateLimiter::direct(quota),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Retrieve `url`, archive the payload, and return it.
    pub async fn fetch(&self, url: &str) -> Result<RawDocument, FetchError> {
        let result = retry_with_backoff(
            &self.policy,
            |attempt| self.attempt(url, attempt),
            classify,
        )
        .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(RetryFailure::Permanent(a)) => {
                warn!(source = %self.source_id, url, error = %a.error, "fetch failed");
                return Err(a.error);
            }
            Err(RetryFailure::Exhausted { attempts, last }) => {
                warn!(source = %self.source_id, url, attempts, error = %last.error, "fetch retries exhausted");
                return Err(FetchError::Exhausted {
                    attempts,
                    last: Box::new(last.error),
                });
            }
        };

        let doc = RawDocument {
            id: Uuid::new_v4().to_string(),
            source_id: self.source_id.clone(),
            fetched_at: now_millis(),
            url_or_query: url.to_string(),
            content: resp.body,
            http_status: resp.status,
        };
        self.store.put_raw_document(&doc).await?;
        debug!(source = %self.source_id, url, raw_document = %doc.id, "raw document archived");
        Ok(doc)
    }

    async fn attempt(&self, url: &str, attempt: u32) -> Result<HttpResponse, AttemptError> {
        self.limiter.until_ready().await;
        debug!(source = %self.source_id, url, attempt, "GET");

        match self.transport.get(url).await {
            Ok(resp) if (200..300).contains(&resp.status) => Ok(resp),
            Ok(resp) => {
                let error = if is_blocked_status(resp.status) {
                    FetchError::Blocked {
                        url: url.to_string(),
                        status: resp.status,
                    }
                } else {
                    FetchError::HttpError {
                        url: url.to_string(),
                        status: resp.status,
                    }
                };
                Err(AttemptError {
                    error,
                    retry_after: resp.retry_after,
                })
            }
            Err(TransportError::Timeout) => Err(AttemptError {
                error: FetchError::Timeout {
                    url: url.to_string(),
                },
                retry_after: None,
            }),
            Err(TransportError::Network(message)) => Err(AttemptError {
                error: FetchError::Network {
                    url: url.to_string(),
                    message,
                },
                retry_after: None,
            }),
        }
    }
}
