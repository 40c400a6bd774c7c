//! Metrics backends answering instant queries.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::BackendError;

/// One element of an instant vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Label set of the series.
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    /// Sample value.
    pub value: f64,
}

impl Sample {
    /// Creates a sample with a single label.
    #[must_use]
    pub fn labelled(label: &str, value: &str, sample: f64) -> Self {
        let mut metric = BTreeMap::new();
        metric.insert(label.to_string(), value.to_string());
        Self { metric, value: sample }
    }

    /// Returns a label value.
    #[must_use]
    pub fn label(&self, name: &str) -> Option<&str> {
        self.metric.get(name).map(String::as_str)
    }
}

/// Evaluates a query at a point in time.
///
/// An empty vector means the condition matches nothing.
#[async_trait]
pub trait MetricsBackend: Send + Sync + 'static {
    /// Runs an instant query at `at`.
    async fn query_instant(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Sample>, BackendError>;
}

/// Prometheus HTTP API client.
#[derive(Debug, Clone)]
pub struct PrometheusBackend {
    client: Client,
    base: Url,
}

#[derive(Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ApiData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<ApiSample>,
}

#[derive(Deserialize)]
struct ApiSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

impl PrometheusBackend {
    /// Creates a client for the server at `base`.
    pub fn new(base: &str, timeout: Duration) -> Result<Self, BackendError> {
        let base = Url::parse(base).map_err(|e| BackendError::InvalidQuery(format!("invalid backend URL '{base}': {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        Ok(Self { client, base })
    }

    fn query_url(&self) -> Result<Url, BackendError> {
        self.base
            .join("api/v1/query")
            .map_err(|e| BackendError::InvalidQuery(e.to_string()))
    }
}

#[async_trait]
impl MetricsBackend for PrometheusBackend {
    async fn query_instant(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Sample>, BackendError> {
        let time = format!("{:.3}", at.timestamp_millis() as f64 / 1000.0);
        let response = self
            .client
            .get(self.query_url()?)
            .query(&[("query", query), ("time", time.as_str())])
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        decode(body)
    }
}

fn decode(body: ApiResponse) -> Result<Vec<Sample>, BackendError> {
    if body.status != "success" {
        return Err(BackendError::InvalidQuery(format!(
            "{}: {}",
            body.error_type.unwrap_or_else(|| "error".to_string()),
            body.error.unwrap_or_default()
        )));
    }
    let data = body
        .data
        .ok_or_else(|| BackendError::Decode("missing data".to_string()))?;
    if data.result_type != "vector" {
        return Err(BackendError::Decode(format!(
            "expected vector result, got {}",
            data.result_type
        )));
    }
    let samples = data
        .result
        .into_iter()
        .map(|s| {
            let value = s
                .value
                .1
                .parse::<f64>()
                .map_err(|e| BackendError::Decode(format!("bad sample value '{}': {e}", s.value.1)))?;
            Ok(Sample {
                metric: s.metric,
                value,
            })
        })
        .collect::<Result<Vec<_>, BackendError>>()?;
    debug!(samples = samples.len(), "query answered");
    Ok(samples)
}

/// Scripted backend.
///
/// Answers from a queue of pushed results, then repeats the default answer.
#[derive(Debug)]
pub struct StaticBackend {
    script: Mutex<VecDeque<Result<Vec<Sample>, BackendError>>>,
    default: Mutex<Result<Vec<Sample>, BackendError>>,
    queries: AtomicUsize,
}

impl Default for StaticBackend {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(Ok(Vec::new())),
            queries: AtomicUsize::new(0),
        }
    }
}

impl StaticBackend {
    /// Creates a backend answering with an empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one answer.
    pub fn push(&self, answer: Result<Vec<Sample>, BackendError>) {
        self.script.lock().push_back(answer);
    }

    /// Sets the answer used once the queue is empty.
    pub fn set_default(&self, answer: Result<Vec<Sample>, BackendError>) {
        *self.default.lock() = answer;
    }

    /// Number of queries answered so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsBackend for StaticBackend {
    async fn query_instant(&self, _query: &str, _at: DateTime<Utc>) -> Result<Vec<Sample>, BackendError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.default.lock().clone())
    }
}
