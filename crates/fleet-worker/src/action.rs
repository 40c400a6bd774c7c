//! Action definitions and the context they fire with.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::domain::Domain;
use crate::error::{Result, WorkerError};
use crate::retry::RetryPolicy;

/// One configured side effect of a firing alert or schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// What to do.
    #[serde(flatten)]
    pub target: ActionTarget,
    /// How to retry transient failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// The kinds of action, tagged by `type` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionTarget {
    /// Send an HTTP request.
    Http(HttpAction),
    /// Send a mail through the configured relay.
    Mail(MailAction),
    /// Start a workflow execution.
    WorkflowTrigger(WorkflowAction),
}

/// An outbound HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpAction {
    /// HTTP method, e.g. `POST`.
    #[serde(default = "default_method")]
    pub method: String,
    /// Absolute request URL.
    pub url: String,
    /// Extra request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Request body. When absent the fire context is sent as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// A notification mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAction {
    /// Recipients.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    #[serde(default)]
    pub body: String,
}

/// A workflow execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAction {
    /// Workflow to execute.
    pub workflow_id: String,
    /// Input passed to the execution.
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Action discriminant, used for logging and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// [`ActionTarget::Http`].
    Http,
    /// [`ActionTarget::Mail`].
    Mail,
    /// [`ActionTarget::WorkflowTrigger`].
    WorkflowTrigger,
}

impl ActionKind {
    /// Returns the kind as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Mail => "mail",
            Self::WorkflowTrigger => "workflow_trigger",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Action {
    /// Creates an action with the default retry policy.
    #[must_use]
    pub fn new(target: ActionTarget) -> Self {
        Self {
            target,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the action's kind.
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        match &self.target {
            ActionTarget::Http(_) => ActionKind::Http,
            ActionTarget::Mail(_) => ActionKind::Mail,
            ActionTarget::WorkflowTrigger(_) => ActionKind::WorkflowTrigger,
        }
    }

    /// Short human-readable destination for logs.
    #[must_use]
    pub fn destination(&self) -> String {
        match &self.target {
            ActionTarget::Http(http) => format!("{} {}", http.method, http.url),
            ActionTarget::Mail(mail) => mail.to.join(","),
            ActionTarget::WorkflowTrigger(workflow) => workflow.workflow_id.clone(),
        }
    }

    /// Checks the action can be executed at all.
    pub fn validate(&self) -> Result<()> {
        match &self.target {
            ActionTarget::Http(http) => {
                if http.method.is_empty() || !http.method.bytes().all(|b| b.is_ascii_alphabetic()) {
                    return Err(invalid(format!("invalid HTTP method '{}'", http.method)));
                }
                Url::parse(&http.url)
                    .map_err(|e| invalid(format!("invalid URL '{}': {e}", http.url)))?;
            }
            ActionTarget::Mail(mail) => {
                if mail.to.is_empty() {
                    return Err(invalid("mail action needs at least one recipient"));
                }
            }
            ActionTarget::WorkflowTrigger(workflow) => {
                if workflow.workflow_id.is_empty() {
                    return Err(invalid("workflow_id cannot be empty"));
                }
            }
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> WorkerError {
    WorkerError::InvalidDefinition {
        reason: reason.into(),
    }
}

/// Direction of a scheduler window crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    /// The window opened.
    Enter,
    /// The window closed.
    Exit,
}

/// Describes one firing; sent along with every action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireContext {
    /// Unique id of this firing.
    pub fire_id: Uuid,
    /// Domain of the firing item.
    pub domain: Domain,
    /// Store key of the firing item.
    pub key: String,
    /// Item id from the definition.
    pub item_id: String,
    /// When the firing happened.
    pub fired_at: DateTime<Utc>,
    /// Number of samples matched by the query.
    #[serde(default)]
    pub samples: usize,
    /// Instances being healed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<String>,
    /// Scheduler window transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<Transition>,
}

impl FireContext {
    /// Creates a context with a fresh fire id.
    #[must_use]
    pub fn new(domain: Domain, key: impl Into<String>, item_id: impl Into<String>, fired_at: DateTime<Utc>) -> Self {
        Self {
            fire_id: Uuid::new_v4(),
            domain,
            key: key.into(),
            item_id: item_id.into(),
            fired_at,
            samples: 0,
            instances: Vec::new(),
            transition: None,
        }
    }
}
