//! Client for the uplink schema delivery service, the primary supergraph
//! source.

use crate::metrics_defs::{UPLINK_FETCH_DURATION, UPLINK_FETCH_FAILURE};
use crate::types::SchemaDocument;
use async_trait::async_trait;
use fallback_store::GraphRef;
use fallback_store::protocol::{RouterConfig, UplinkRequest, UplinkResponse};
use fallback_store::secrets::{SecretCache, SecretError};
use reqwest::StatusCode;
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use url::Url;

pub const DEFAULT_ENDPOINTS: &[&str] = &[
    "https://uplink.api.apollographql.com/",
    "https://aws.uplink.api.apollographql.com/",
];

const CLIENT_NAME_HEADER: &str = "apollographql-client-name";
const CLIENT_VERSION_HEADER: &str = "apollographql-client-version";

#[derive(Debug, PartialEq)]
pub enum FetchOutcome {
    Updated {
        document: SchemaDocument,
        min_delay: Option<Duration>,
    },
    Unchanged {
        id: String,
        min_delay: Option<Duration>,
    },
}

impl FetchOutcome {
    /// How long uplink asked us to wait before the next fetch.
    pub fn min_delay(&self) -> Option<Duration> {
        match self {
            FetchOutcome::Updated { min_delay, .. } | FetchOutcome::Unchanged { min_delay, .. } => {
                *min_delay
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: StatusCode },

    #[error("uplink returned {code}: {message}")]
    Uplink { code: String, message: String },

    #[error("invalid uplink response: {0}")]
    InvalidResponse(String),

    #[error("could not load API key: {0}")]
    Secret(#[from] SecretError),

    #[error("uplink unavailable after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },

    #[error("uplink fetch did not complete within {0:?}")]
    BudgetExceeded(Duration),

    #[error("no uplink endpoints configured")]
    NoEndpoints,
}

impl FetchError {
    /// Whether another attempt (possibly against another endpoint) may
    /// succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            FetchError::Transport { .. } | FetchError::Uplink { .. } => true,
            FetchError::InvalidResponse(_) => true,
            FetchError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            FetchError::Secret(_)
            | FetchError::RetriesExhausted { .. }
            | FetchError::BudgetExceeded(_)
            | FetchError::NoEndpoints => false,
        }
    }
}

/// Primary supergraph source.
#[async_trait]
pub trait SupergraphSource: Send + Sync {
    /// Runs one fetch cycle. `if_after_id` is the id of the last document
    /// obtained from this source.
    async fn fetch(&self, if_after_id: Option<&str>) -> Result<FetchOutcome, FetchError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per cycle are `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single request.
    pub request_timeout: Duration,
    /// Upper bound on the elapsed time of one cycle.
    pub fetch_budget: Option<Duration>,
}

impl RetryPolicy {
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_FETCH_BUDGET: Duration = Duration::from_secs(30);

    /// Three attempts per endpoint.
    pub fn for_endpoints(count: usize) -> Self {
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        RetryPolicy {
            max_retries: count.saturating_mul(3).saturating_sub(1),
            base_delay: Self::DEFAULT_BASE_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            fetch_budget: Some(Self::DEFAULT_FETCH_BUDGET),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff before retry number `retry` (zero based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// State of one fetch cycle. Attempt `n` goes to endpoint `n mod N`.
#[derive(Debug)]
pub struct FetchAttempt {
    pub retries: u32,
    pub endpoint_index: usize,
    pub started: Instant,
}

impl FetchAttempt {
    pub fn new() -> Self {
        FetchAttempt {
            retries: 0,
            endpoint_index: 0,
            started: Instant::now(),
        }
    }

    pub fn advance(&mut self, endpoint_count: usize) {
        self.retries += 1;
        self.endpoint_index = self.retries as usize % endpoint_count.max(1);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for FetchAttempt {
    fn default() -> Self {
        Self::new()
    }
}

pub struct UplinkClient {
    client: reqwest::Client,
    graph_ref: GraphRef,
    api_key: Arc<SecretCache>,
    endpoints: Vec<Url>,
    retry: RetryPolicy,
}

impl UplinkClient {
    pub fn new(
        graph_ref: GraphRef,
        api_key: Arc<SecretCache>,
        endpoints: Vec<Url>,
        retry: RetryPolicy,
    ) -> Result<Self, FetchError> {
        if endpoints.is_empty() {
            return Err(FetchError::NoEndpoints);
        }
        Ok(UplinkClient {
            client: reqwest::Client::new(),
            graph_ref,
            api_key,
            endpoints,
            retry,
        })
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    async fn fetch_once(
        &self,
        endpoint: &Url,
        api_key: &str,
        if_after_id: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        let transport = |source| FetchError::Transport {
            endpoint: endpoint.to_string(),
            source,
        };

        let request = UplinkRequest::new(api_key, &self.graph_ref, if_after_id);
        let response = self
            .client
            .post(endpoint.clone())
            .header(CLIENT_NAME_HEADER, env!("CARGO_PKG_NAME"))
            .header(CLIENT_VERSION_HEADER, env!("CARGO_PKG_VERSION"))
            .timeout(self.retry.request_timeout)
            .json(&request)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                endpoint: endpoint.to_string(),
                status,
            });
        }

        let body = response.bytes().await.map_err(transport)?;
        let response: UplinkResponse = serde_json::from_slice(&body)
            .map_err(|err| FetchError::InvalidResponse(err.to_string()))?;

        let Some(data) = response.data else {
            let messages: Vec<_> = response.errors.into_iter().map(|e| e.message).collect();
            return Err(FetchError::InvalidResponse(messages.join("; ")));
        };

        match data.router_config {
            RouterConfig::RouterConfigResult {
                id,
                supergraph_sdl,
                min_delay_seconds,
            } => Ok(FetchOutcome::Updated {
                document: SchemaDocument::new(id, supergraph_sdl),
                min_delay: min_delay(min_delay_seconds),
            }),
            RouterConfig::Unchanged {
                id,
                min_delay_seconds,
            } => Ok(FetchOutcome::Unchanged {
                id,
                min_delay: min_delay(min_delay_seconds),
            }),
            RouterConfig::FetchError { code, message } => Err(FetchError::Uplink { code, message }),
        }
    }

    async fn fetch_with_retries(
        &self,
        api_key: &str,
        if_after_id: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        let mut attempt = FetchAttempt::new();

        loop {
            let endpoint = &self.endpoints[attempt.endpoint_index];

            let request = self.fetch_once(endpoint, api_key, if_after_id);
            let result = match self.retry.fetch_budget {
                Some(budget) => {
                    let remaining = budget.saturating_sub(attempt.elapsed());
                    timeout(remaining, request)
                        .await
                        .unwrap_or(Err(FetchError::BudgetExceeded(budget)))
                }
                None => request.await,
            };

            let err = match result {
                Ok(outcome) => return Ok(outcome),
                Err(err @ FetchError::BudgetExceeded(_)) => return Err(err),
                Err(err) => err,
            };

            counter!(UPLINK_FETCH_FAILURE, "endpoint" => endpoint.to_string()).increment(1);
            tracing::warn!(
                %endpoint,
                attempt = attempt.retries + 1,
                max_attempts = self.retry.max_attempts(),
                error = %err,
                "uplink fetch failed"
            );

            if !err.is_retriable() {
                return Err(err);
            }
            if attempt.retries >= self.retry.max_retries {
                return Err(FetchError::RetriesExhausted {
                    attempts: attempt.retries + 1,
                    last: Box::new(err),
                });
            }

            let delay = self.retry.delay(attempt.retries);
            if let Some(budget) = self.retry.fetch_budget
                && attempt.elapsed() + delay >= budget
            {
                return Err(FetchError::BudgetExceeded(budget));
            }
            sleep(delay).await;
            attempt.advance(self.endpoints.len());
        }
    }
}

fn min_delay(seconds: Option<f64>) -> Option<Duration> {
    seconds
        .filter(|seconds| *seconds > 0.0)
        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
}

#[async_trait]
impl SupergraphSource for UplinkClient {
    #[tracing::instrument(skip_all, fields(graph_ref = %self.graph_ref))]
    async fn fetch(&self, if_after_id: Option<&str>) -> Result<FetchOutcome, FetchError> {
        let started = Instant::now();
        let api_key = self.api_key.get().await?;

        let result = self.fetch_with_retries(api_key, if_after_id).await;

        histogram!(UPLINK_FETCH_DURATION).record(started.elapsed().as_secs_f64());
        result
    }
}
