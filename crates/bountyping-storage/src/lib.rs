//! Persistence contract + throttled HTTP fetch utilities for BountyPing.

mod postgres;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bountyping_core::{Program, ProgramKey, ScrapeLog};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use postgres::PgProgramStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Result of one atomic upsert: how the row was classified and what is stored now.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertResult {
    pub outcome: UpsertOutcome,
    pub stored: Program,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write failed for {key}: {message}")]
    Row { key: ProgramKey, message: String },
    #[error("invalid stored row: {0}")]
    Decode(String),
    #[error("scrape log write failed: {0}")]
    Log(String),
}

impl StoreError {
    /// Whether the failure concerns the store as a whole rather than one record.
    pub fn is_batch_level(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable keyed store for programs and the append-only scrape log.
///
/// `upsert` must classify and write as one atomic step per identity so that
/// concurrent writers never observe or produce a torn row.
#[async_trait]
pub trait ProgramStore: Send + Sync {
    async fn get(&self, key: &ProgramKey) -> Result<Option<Program>, StoreError>;

    async fn upsert(&self, program: Program) -> Result<UpsertResult, StoreError>;

    /// Persist one scrape log row and return it with its assigned id.
    async fn append_log(&self, log: ScrapeLog) -> Result<ScrapeLog, StoreError>;

    /// Most recent logs first.
    async fn recent_logs(&self, limit: usize) -> Result<Vec<ScrapeLog>, StoreError>;
}

/// Decide what an upsert of `incoming` does against the currently stored row.
pub fn resolve_upsert(existing: Option<&Program>, incoming: Program) -> UpsertResult {
    match existing {
        None => UpsertResult {
            outcome: UpsertOutcome::Created,
            stored: incoming,
        },
        Some(current) if current.fingerprint == incoming.fingerprint => UpsertResult {
            outcome: UpsertOutcome::Unchanged,
            stored: current.clone(),
        },
        Some(current) => UpsertResult {
            outcome: UpsertOutcome::Updated,
            stored: incoming.superseding(current),
        },
    }
}

/// Process-local store. Each upsert runs under one lock, which makes it atomic
/// per identity.
#[derive(Debug, Default)]
pub struct MemoryProgramStore {
    programs: Mutex<BTreeMap<ProgramKey, Program>>,
    logs: Mutex<Vec<ScrapeLog>>,
}

impl MemoryProgramStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn programs(&self) -> Vec<Program> {
        self.programs.lock().await.values().cloned().collect()
    }

    pub async fn logs(&self) -> Vec<ScrapeLog> {
        self.logs.lock().await.clone()
    }
}

#[async_trait]
impl ProgramStore for MemoryProgramStore {
    async fn get(&self, key: &ProgramKey) -> Result<Option<Program>, StoreError> {
        Ok(self.programs.lock().await.get(key).cloned())
    }

    async fn upsert(&self, program: Program) -> Result<UpsertResult, StoreError> {
        let mut programs = self.programs.lock().await;
        let key = program.key();
        let result = resolve_upsert(programs.get(&key), program);
        if result.outcome != UpsertOutcome::Unchanged {
            programs.insert(key, result.stored.clone());
        }
        Ok(result)
    }

    async fn append_log(&self, mut log: ScrapeLog) -> Result<ScrapeLog, StoreError> {
        let mut logs = self.logs.lock().await;
        log.id = Some(logs.len() as i64 + 1);
        logs.push(log.clone());
        Ok(log)
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<ScrapeLog>, StoreError> {
        let logs = self.logs.lock().await;
        Ok(logs.iter().rev().take(limit).cloned().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
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
    /// Minimum spacing between two requests to the same source.
    pub request_delay: Duration,
    pub source_delays: HashMap<String, Duration>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            request_delay: Duration::from_secs(1),
            source_delays: HashMap::new(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Per-source minimum spacing between outbound requests.
#[derive(Debug)]
pub struct RequestThrottle {
    default_delay: Duration,
    overrides: HashMap<String, Duration>,
    slots: Mutex<HashMap<String, Arc<Mutex<Option<Instant>>>>>,
}

impl RequestThrottle {
    pub fn new(default_delay: Duration, overrides: HashMap<String, Duration>) -> Self {
        Self {
            default_delay,
            overrides,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn delay_for(&self, source_id: &str) -> Duration {
        self.overrides
            .get(source_id)
            .copied()
            .unwrap_or(self.default_delay)
    }

    async fn slot(&self, source_id: &str) -> Arc<Mutex<Option<Instant>>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Wait until `source_id` may be contacted again, then claim the slot.
    /// Callers for the same source queue behind each other.
    pub async fn wait(&self, source_id: &str) {
        let delay = self.delay_for(source_id);
        let slot = self.slot(source_id).await;
        let mut last = slot.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + delay;
            if ready_at > Instant::now() {
                debug!(source_id, delay_ms = delay.as_millis() as u64, "throttling request");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    throttle: RequestThrottle,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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
            throttle: RequestThrottle::new(config.request_delay, config.source_delays),
            backoff: config.backoff,
        })
    }

    pub fn throttle(&self) -> &RequestThrottle {
        &self.throttle
    }

    pub async fn get_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", %run_id, source_id, url, method = "GET");
        self.send_with_retry(source_id, |client| client.get(url))
            .instrument(span)
            .await
    }

    pub async fn post_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        body: &JsonValue,
    ) -> Result<FetchedResponse, HttpError> {
        let span = info_span!("http_fetch", %run_id, source_id, url, method = "POST");
        self.send_with_retry(source_id, |client| client.post(url).json(body))
            .instrument(span)
            .await
    }

    async fn send_with_retry<F>(&self, source_id: &str, build: F) -> Result<FetchedResponse, HttpError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            self.throttle.wait(source_id).await;
            let can_retry = attempt < self.backoff.max_retries;

            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(attempt, status = status.as_u16(), "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(attempt, error = %err, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }
    }
}
