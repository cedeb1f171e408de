//! Content fetcher
//!
//! This module turns a leased instance and a target into normalized
//! posts. Two strategies run in order:
//! - Strategy A: the instance's RSS endpoint, parsed by [`feed`]
//! - Strategy B: the rendered timeline page, scraped by [`fallback`]
//!
//! HTTP 403/429 means the instance is rate limiting us and short-circuits
//! to a `RateLimited` outcome with no fallback attempt. Any other
//! failure of strategy A (transport, server error, unparseable body)
//! falls through to strategy B. The fetcher never retries; retry policy
//! belongs to the pool and the scheduler.

mod fallback;
mod feed;

pub use fallback::parse_timeline_html;
pub use feed::parse_feed;

use crate::config::FetcherConfig;
use crate::pool::{FetchOutcome, InstanceLease};
use crate::storage::{NewPost, TargetKind, TargetRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{redirect::Policy, Client, StatusCode};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

/// Fetches and normalizes timeline content from mirror instances
#[derive(Clone)]
pub struct ContentFetcher {
    client: Client,
}

enum GetResult {
    Body(String),
    RateLimited(u16),
    Failed(String),
}

impl ContentFetcher {
    /// Builds the fetcher and its HTTP client
    ///
    /// Redirects are disabled: instances that bounce to a consent or
    /// auth page must be treated as failing, not followed.
    pub fn new(config: &FetcherConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .redirect(Policy::none())
            .gzip(true)
            .brotli(true)
            .build()?;
        Ok(Self { client })
    }

    /// Runs one fetch attempt for a target against a leased instance
    ///
    /// Always returns the posts extracted (possibly empty) together
    /// with the outcome to report back to the pool.
    pub async fn fetch(
        &self,
        target: &TargetRecord,
        lease: &InstanceLease,
    ) -> (Vec<NewPost>, FetchOutcome) {
        let started = Instant::now();

        let feed_url = feed_url(&lease.base_url, target);
        let feed_failure = match self.get_text(&feed_url).await {
            GetResult::RateLimited(status) => {
                return (Vec::new(), FetchOutcome::RateLimited { status });
            }
            GetResult::Body(body) => match parse_feed(&body, target, &lease.base_url) {
                Ok(posts) => {
                    return (posts, FetchOutcome::Success { rtt: started.elapsed() });
                }
                Err(message) => {
                    tracing::debug!(
                        target_label = %target.label(),
                        instance = %lease.base_url,
                        error = %message,
                        "Feed unparseable, trying timeline page"
                    );
                    message
                }
            },
            GetResult::Failed(message) => {
                tracing::debug!(
                    target_label = %target.label(),
                    instance = %lease.base_url,
                    error = %message,
                    "Feed fetch failed, trying timeline page"
                );
                message
            }
        };

        let page_url = page_url(&lease.base_url, target);
        match self.get_text(&page_url).await {
            GetResult::RateLimited(status) => (Vec::new(), FetchOutcome::RateLimited { status }),
            GetResult::Body(body) => match parse_timeline_html(&body, target, &lease.base_url) {
                Ok(posts) => (posts, FetchOutcome::Success { rtt: started.elapsed() }),
                Err(message) => (
                    Vec::new(),
                    FetchOutcome::Error {
                        message: format!("feed: {feed_failure}; page: {message}"),
                    },
                ),
            },
            GetResult::Failed(message) => (
                Vec::new(),
                FetchOutcome::Error {
                    message: format!("feed: {feed_failure}; page: {message}"),
                },
            ),
        }
    }

    async fn get_text(&self, url: &str) -> GetResult {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                let message = if e.is_timeout() {
                    "request timeout".to_string()
                } else if e.is_connect() {
                    "connection failed".to_string()
                } else {
                    e.to_string()
                };
                return GetResult::Failed(message);
            }
        };

        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            return GetResult::RateLimited(status.as_u16());
        }
        if !status.is_success() {
            return GetResult::Failed(format!("HTTP {}", status.as_u16()));
        }

        match response.text().await {
            Ok(body) => GetResult::Body(body),
            Err(e) => GetResult::Failed(format!("body read failed: {e}")),
        }
    }
}

/// Builds the RSS endpoint URL for a target on an instance
pub fn feed_url(base_url: &str, target: &TargetRecord) -> String {
    let base = base_url.trim_end_matches('/');
    match target.kind {
        TargetKind::User => format!("{base}/{}/rss", target.value),
        TargetKind::Hashtag => format!("{base}/search/rss?f=tweets&q=%23{}", target.value),
    }
}

/// Builds the rendered timeline page URL for a target on an instance
pub fn page_url(base_url: &str, target: &TargetRecord) -> String {
    let base = base_url.trim_end_matches('/');
    match target.kind {
        TargetKind::User => format!("{base}/{}", target.value),
        TargetKind::Hashtag => format!("{base}/search?f=tweets&q=%23{}", target.value),
    }
}

/// Extracts the numeric status id from a `/status/<id>` permalink
pub(crate) fn status_id_from_link(link: &str) -> Option<String> {
    let (_, rest) = link.split_once("/status/")?;
    let id: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Deterministic dedup key for posts with no recoverable native id
pub(crate) fn synthetic_dedup_key(
    target_id: i64,
    content: &str,
    created_at: Option<&DateTime<Utc>>,
) -> String {
    let timestamp = created_at
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(target_id.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(content.as_bytes());
    hasher.update(b"\n");
    hasher.update(timestamp.as_bytes());
    hex::encode(hasher.finalize())
}
