//! Transports that carry out actions.
//!
//! [`HttpTransport`] talks to the outside world over HTTP. [`RecordingTransport`]
//! keeps every call in memory and can be scripted to fail, for tests and
//! dry runs.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::action::{ActionKind, FireContext, HttpAction, MailAction, WorkflowAction};
use crate::error::ActionError;

/// Executes a single attempt of each action kind.
#[async_trait]
pub trait ActionTransport: Send + Sync + 'static {
    /// Sends an HTTP request. Any response counts as success.
    async fn send_http(&self, action: &HttpAction, ctx: &FireContext) -> Result<(), ActionError>;

    /// Sends a mail.
    async fn send_mail(&self, action: &MailAction, ctx: &FireContext) -> Result<(), ActionError>;

    /// Starts a workflow execution.
    async fn trigger_workflow(&self, action: &WorkflowAction, ctx: &FireContext) -> Result<(), ActionError>;
}

/// Settings of the HTTP transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTransportConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Endpoint accepting mail as JSON.
    pub mail_relay: Option<String>,
    /// Base URL of the workflow service.
    pub workflow_endpoint: Option<String>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            mail_relay: None,
            workflow_endpoint: None,
        }
    }
}

/// reqwest-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    config: HttpTransportConfig,
}

#[derive(Serialize)]
struct MailPayload<'a> {
    to: &'a [String],
    subject: &'a str,
    body: &'a str,
    fire: &'a FireContext,
}

#[derive(Serialize)]
struct ExecutionPayload<'a> {
    input: &'a serde_json::Value,
    trigger: &'a FireContext,
}

impl HttpTransport {
    /// Builds the transport and its HTTP client.
    pub fn new(config: HttpTransportConfig) -> Result<Self, ActionError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ActionError::Permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Returns the transport configuration.
    #[must_use]
    pub const fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    async fn post_json<T: Serialize + Sync>(&self, url: Url, payload: &T) -> Result<(), ActionError> {
        let response = self
            .client
            .post(url.clone())
            .json(payload)
            .send()
            .await
            .map_err(classify)?;
        debug!(url = %url, status = response.status().as_u16(), "action delivered");
        Ok(())
    }
}

#[async_trait]
impl ActionTransport for HttpTransport {
    async fn send_http(&self, action: &HttpAction, ctx: &FireContext) -> Result<(), ActionError> {
        let method = Method::from_bytes(action.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| ActionError::Permanent(format!("invalid method '{}': {e}", action.method)))?;
        let url = parse_url(&action.url)?;
        let headers = header_map(&action.headers)?;

        let request = self.client.request(method, url.clone()).headers(headers);
        let request = match &action.body {
            Some(body) => request.body(body.clone()),
            None => request.json(ctx),
        };

        let response = request.send().await.map_err(classify)?;
        debug!(url = %url, status = response.status().as_u16(), fire_id = %ctx.fire_id, "http action delivered");
        Ok(())
    }

    async fn send_mail(&self, action: &MailAction, ctx: &FireContext) -> Result<(), ActionError> {
        let relay = self
            .config
            .mail_relay
            .as_deref()
            .ok_or_else(|| ActionError::Permanent("no mail relay configured".to_string()))?;
        let payload = MailPayload {
            to: &action.to,
            subject: &action.subject,
            body: &action.body,
            fire: ctx,
        };
        self.post_json(parse_url(relay)?, &payload).await
    }

    async fn trigger_workflow(&self, action: &WorkflowAction, ctx: &FireContext) -> Result<(), ActionError> {
        let endpoint = self
            .config
            .workflow_endpoint
            .as_deref()
            .ok_or_else(|| ActionError::Permanent("no workflow endpoint configured".to_string()))?;
        let url = parse_url(&format!(
            "{}/{}/executions",
            endpoint.trim_end_matches('/'),
            action.workflow_id
        ))?;
        let payload = ExecutionPayload {
            input: &action.input,
            trigger: ctx,
        };
        self.post_json(url, &payload).await
    }
}

fn parse_url(raw: &str) -> Result<Url, ActionError> {
    Url::parse(raw).map_err(|e| ActionError::Permanent(format!("invalid URL '{raw}': {e}")))
}

fn header_map(headers: &std::collections::BTreeMap<String, String>) -> Result<HeaderMap, ActionError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ActionError::Permanent(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ActionError::Permanent(format!("invalid header value: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Timeouts and connection failures are transient, everything else is not.
fn classify(err: reqwest::Error) -> ActionError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ActionError::Transient(err.to_string())
    } else {
        ActionError::Permanent(err.to_string())
    }
}

/// One call seen by a [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Kind of action.
    pub kind: ActionKind,
    /// URL, first recipient or workflow id.
    pub target: String,
    /// The firing context passed along.
    pub ctx: FireContext,
    /// Whether this attempt succeeded.
    pub ok: bool,
}

/// In-memory transport.
///
/// Failures are scripted per target and consumed one per attempt.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<RecordedCall>>,
    failures: Mutex<HashMap<String, VecDeque<ActionError>>>,
}

impl RecordingTransport {
    /// Creates an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next attempts against `target` fail with `errors`, in order.
    pub fn script_failures(&self, target: impl Into<String>, errors: impl IntoIterator<Item = ActionError>) {
        self.failures
            .lock()
            .entry(target.into())
            .or_default()
            .extend(errors);
    }

    /// Returns every recorded call.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Returns successful calls only.
    #[must_use]
    pub fn delivered(&self) -> Vec<RecordedCall> {
        self.calls.lock().iter().filter(|c| c.ok).cloned().collect()
    }

    /// Number of attempts made against `target`.
    #[must_use]
    pub fn attempts_for(&self, target: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.target == target).count()
    }

    fn record(&self, kind: ActionKind, target: &str, ctx: &FireContext) -> Result<(), ActionError> {
        let scripted = self
            .failures
            .lock()
            .get_mut(target)
            .and_then(VecDeque::pop_front);
        self.calls.lock().push(RecordedCall {
            kind,
            target: target.to_string(),
            ctx: ctx.clone(),
            ok: scripted.is_none(),
        });
        scripted.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for RecordingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingTransport")
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ActionTransport for RecordingTransport {
    async fn send_http(&self, action: &HttpAction, ctx: &FireContext) -> Result<(), ActionError> {
        self.record(ActionKind::Http, &action.url, ctx)
    }

    async fn send_mail(&self, action: &MailAction, ctx: &FireContext) -> Result<(), ActionError> {
        let target = action.to.first().map_or("", String::as_str);
        self.record(ActionKind::Mail, target, ctx)
    }

    async fn trigger_workflow(&self, action: &WorkflowAction, ctx: &FireContext) -> Result<(), ActionError> {
        self.record(ActionKind::WorkflowTrigger, &action.workflow_id, ctx)
    }
}
