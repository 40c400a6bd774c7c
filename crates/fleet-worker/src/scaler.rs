//! Metric-driven scaler items.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::{Action, FireContext};
use crate::alert::{Alert, AlertDecision};
use crate::domain::Domain;
use crate::error::{Result, WorkerError};
use crate::worker::{Task, TaskContext, TickOutcome};

/// Persisted definition shared by query-driven items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemDefinition {
    /// Item id.
    pub id: String,
    /// Backend query; a non-empty result means the condition holds.
    pub query: String,
    /// Evaluation period.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How long the condition must hold before firing.
    #[serde(default, with = "humantime_serde")]
    pub duration: Duration,
    /// Minimum time between two firings.
    #[serde(default, with = "humantime_serde")]
    pub cooldown: Duration,
    /// Actions run on firing.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Inactive items are never evaluated.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Alert state carried across hand-offs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted_alert: Option<Alert>,
}

pub(crate) const fn default_active() -> bool {
    true
}

impl WorkItemDefinition {
    /// Creates an active definition with no actions.
    #[must_use]
    pub fn new(id: impl Into<String>, query: impl Into<String>, interval: Duration) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            interval,
            duration: Duration::ZERO,
            cooldown: Duration::ZERO,
            actions: Vec::new(),
            active: true,
            persisted_alert: None,
        }
    }

    /// Sets duration and cooldown.
    #[must_use]
    pub const fn with_timing(mut self, duration: Duration, cooldown: Duration) -> Self {
        self.duration = duration;
        self.cooldown = cooldown;
        self
    }

    /// Adds an action.
    #[must_use]
    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Checks the definition before it reaches a worker.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(invalid("id cannot be empty"));
        }
        if self.query.trim().is_empty() {
            return Err(invalid("query cannot be empty"));
        }
        if self.interval.is_zero() {
            return Err(invalid("interval must be positive"));
        }
        for action in &self.actions {
            action.validate()?;
        }
        Ok(())
    }
}

pub(crate) fn invalid(reason: &str) -> WorkerError {
    WorkerError::InvalidDefinition {
        reason: reason.to_string(),
    }
}

/// Runtime scaler.
#[derive(Debug)]
pub struct Scaler {
    definition: WorkItemDefinition,
    alert: Alert,
}

impl Scaler {
    /// Returns the current alert.
    #[must_use]
    pub const fn alert(&self) -> &Alert {
        &self.alert
    }
}

#[async_trait]
impl Task for Scaler {
    type Definition = WorkItemDefinition;
    const DOMAIN: Domain = Domain::Scalers;

    fn from_definition(mut definition: WorkItemDefinition) -> Result<Self> {
        definition.validate()?;
        let alert = definition.persisted_alert.take().unwrap_or_default();
        Ok(Self { definition, alert })
    }

    fn id(&self) -> &str {
        &self.definition.id
    }

    fn interval(&self) -> Option<Duration> {
        Some(self.definition.interval)
    }

    fn is_active(&self) -> bool {
        self.definition.active
    }

    async fn tick(&mut self, now: DateTime<Utc>, ctx: &TaskContext) -> TickOutcome {
        let samples = match ctx.backend.query_instant(&self.definition.query, now).await {
            Ok(samples) => samples,
            Err(e) => {
                warn!(key = %ctx.key, error = %e, "scaler query failed");
                return TickOutcome::QueryFailed;
            }
        };

        if samples.is_empty() {
            if self.alert.active {
                debug!(key = %ctx.key, "scaler condition cleared");
            }
            self.alert.reset();
            return TickOutcome::Cleared;
        }

        match self
            .alert
            .observe(now, self.definition.duration, self.definition.cooldown)
        {
            AlertDecision::Pending => TickOutcome::Pending,
            AlertDecision::CoolingDown => TickOutcome::CoolingDown,
            AlertDecision::Fire => {
                let mut fire = FireContext::new(Self::DOMAIN, &ctx.key, &self.definition.id, now);
                fire.samples = samples.len();
                info!(
                    key = %ctx.key,
                    fire_id = %fire.fire_id,
                    samples = samples.len(),
                    actions = self.definition.actions.len(),
                    "scaler firing"
                );
                let report = ctx.dispatcher.dispatch(&self.definition.actions, &fire).await;
                self.alert.fire(now, self.definition.cooldown);
                TickOutcome::Fired(report)
            }
        }
    }

    fn snapshot(&self) -> WorkItemDefinition {
        WorkItemDefinition {
            persisted_alert: Some(self.alert),
            ..self.definition.clone()
        }
    }

    fn strip_state(definition: WorkItemDefinition) -> WorkItemDefinition {
        WorkItemDefinition {
            persisted_alert: None,
            ..definition
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionTarget, HttpAction};
    use crate::backend::{Sample, StaticBackend};
    use crate::dispatch::{DispatchReport, Dispatcher};
    use crate::error::BackendError;
    use crate::transport::RecordingTransport;
    use crate::worker::{Worker, WorkerEnv};
    use chrono::TimeZone;
    use std::sync::Arc;

    const KEY: &str = "/scalers/aws/web";

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn definition() -> WorkItemDefinition {
        WorkItemDefinition::new("web", "cpu > 0.9", Duration::from_secs(5))
            .with_timing(Duration::from_secs(30), Duration::from_secs(60))
            .with_action(Action::new(ActionTarget::Http(HttpAction {
                method: "POST".into(),
                url: "http://scaler.local/up".into(),
                headers: std::collections::BTreeMap::new(),
                body: None,
            })))
    }

    struct Harness {
        backend: Arc<StaticBackend>,
        transport: Arc<RecordingTransport>,
        worker: Worker<Scaler>,
    }

    fn harness(def: WorkItemDefinition) -> Harness {
        let backend = Arc::new(StaticBackend::new());
        let transport = Arc::new(RecordingTransport::new());
        let env = WorkerEnv::new(
            Arc::clone(&backend) as _,
            Dispatcher::new(Arc::clone(&transport) as _),
        );
        let worker = Worker::<Scaler>::new(KEY, def, &env).unwrap();
        Harness {
            backend,
            transport,
            worker,
        }
    }

    fn hot() -> Vec<Sample> {
        vec![Sample::labelled("instance", "10.0.0.1", 0.95)]
    }

    mod definition_tests {
        use super::*;

        #[test]
        fn test_decodes_human_durations() {
            let json = r#"{
                "id": "web",
                "query": "cpu > 0.9",
                "interval": "5s",
                "duration": "30s",
                "cooldown": "1m",
                "actions": [{"type": "http", "url": "http://scaler.local/up"}]
            }"#;
            let def: WorkItemDefinition = serde_json::from_str(json).unwrap();
            assert_eq!(def.interval, Duration::from_secs(5));
            assert_eq!(def.cooldown, Duration::from_secs(60));
            assert!(def.active);
            assert!(def.persisted_alert.is_none());
            assert!(def.validate().is_ok());
        }

        #[test]
        fn test_validate_rejects_bad_definitions() {
            let mut def = definition();
            def.query = "  ".into();
            assert!(def.validate().is_err());

            let mut def = definition();
            def.interval = Duration::ZERO;
            assert!(def.validate().is_err());

            let mut def = definition();
            def.id.clear();
            assert!(def.validate().is_err());
        }

        #[test]
        fn test_missing_persisted_alert_starts_fresh() {
            let scaler = Scaler::from_definition(definition()).unwrap();
            assert_eq!(*scaler.alert(), Alert::default());
        }

        #[test]
        fn test_strip_state_keeps_configuration() {
            let mut checkpoint = definition();
            checkpoint.persisted_alert = Some(Alert {
                active: true,
                started_at: Some(at(0)),
                fired_at: Some(at(30)),
            });

            assert_eq!(Scaler::strip_state(checkpoint.clone()), definition());
            checkpoint.cooldown = Duration::from_secs(1);
            assert_ne!(Scaler::strip_state(checkpoint), definition());
        }
    }

    mod alert_tests {
        use super::*;

        #[tokio::test]
        async fn test_fires_after_duration_and_respects_cooldown() {
            let h = harness(definition());
            h.backend.set_default(Ok(hot()));

            assert_eq!(h.worker.evaluate(at(0)).await, TickOutcome::Pending);
            for t in (5..30).step_by(5) {
                assert_eq!(h.worker.evaluate(at(t)).await, TickOutcome::Pending);
            }
            assert_eq!(
                h.worker.evaluate(at(30)).await,
                TickOutcome::Fired(DispatchReport { succeeded: 1, failed: 0 })
            );
            assert_eq!(h.worker.evaluate(at(40)).await, TickOutcome::CoolingDown);
            assert_eq!(h.worker.evaluate(at(90)).await, TickOutcome::CoolingDown);
            assert!(matches!(h.worker.evaluate(at(91)).await, TickOutcome::Fired(_)));

            assert_eq!(h.transport.delivered().len(), 2);
            let snapshot = h.worker.snapshot().await;
            let alert = snapshot.persisted_alert.unwrap();
            assert_eq!(alert.started_at, Some(at(0)));
            assert_eq!(alert.fired_at, Some(at(91)));
            assert_eq!(h.worker.stats().fires, 2);
        }

        #[tokio::test]
        async fn test_query_errors_leave_alert_untouched() {
            let h = harness(definition());
            h.backend.push(Ok(hot()));
            for _ in 0..3 {
                h.backend.push(Err(BackendError::Unreachable("down".into())));
            }
            h.backend.set_default(Ok(hot()));

            h.worker.evaluate(at(0)).await;
            let before = h.worker.snapshot().await.persisted_alert;

            for t in [5, 10, 15] {
                assert_eq!(h.worker.evaluate(at(t)).await, TickOutcome::QueryFailed);
                assert_eq!(h.worker.snapshot().await.persisted_alert, before);
            }

            assert_eq!(h.worker.evaluate(at(20)).await, TickOutcome::Pending);
            let after = h.worker.snapshot().await.persisted_alert.unwrap();
            assert_eq!(after.started_at, Some(at(0)));
            assert_eq!(h.worker.stats().query_failures, 3);
            assert!(h.transport.calls().is_empty());
        }

        #[tokio::test]
        async fn test_empty_result_resets_alert() {
            let h = harness(definition());
            h.backend.push(Ok(hot()));
            h.backend.push(Ok(vec![]));
            h.backend.set_default(Ok(hot()));

            h.worker.evaluate(at(0)).await;
            assert_eq!(h.worker.evaluate(at(5)).await, TickOutcome::Cleared);
            assert_eq!(h.worker.snapshot().await.persisted_alert, Some(Alert::default()));

            // streak restarts, so 30s from t=10 are needed again
            assert_eq!(h.worker.evaluate(at(10)).await, TickOutcome::Pending);
            assert_eq!(h.worker.evaluate(at(35)).await, TickOutcome::Pending);
            assert!(matches!(h.worker.evaluate(at(40)).await, TickOutcome::Fired(_)));
        }

        #[tokio::test]
        async fn test_snapshot_restores_identical_alert() {
            let h = harness(definition());
            h.backend.set_default(Ok(hot()));
            h.worker.evaluate(at(0)).await;
            h.worker.evaluate(at(30)).await;

            let snapshot = h.worker.snapshot().await;
            let json = serde_json::to_vec(&snapshot).unwrap();

            let restored = harness(Worker::<Scaler>::decode(&json).unwrap());
            assert_eq!(
                restored.worker.snapshot().await.persisted_alert,
                snapshot.persisted_alert
            );
            // still cooling down after the hand-off
            restored.backend.set_default(Ok(hot()));
            assert_eq!(restored.worker.evaluate(at(60)).await, TickOutcome::CoolingDown);
        }

        #[tokio::test]
        async fn test_inactive_scaler_never_queries() {
            let mut def = definition();
            def.active = false;
            let h = harness(def);
            assert_eq!(h.worker.evaluate(at(0)).await, TickOutcome::Inactive);
            assert_eq!(h.backend.queries(), 0);
        }

        #[tokio::test]
        async fn test_failed_actions_still_set_fired_at() {
            let h = harness(definition().with_timing(Duration::ZERO, Duration::from_secs(60)));
            h.backend.set_default(Ok(hot()));
            h.transport.script_failures(
                "http://scaler.local/up",
                [crate::error::ActionError::Permanent("rejected".into())],
            );

            assert_eq!(
                h.worker.evaluate(at(0)).await,
                TickOutcome::Fired(DispatchReport { succeeded: 0, failed: 1 })
            );
            let alert = h.worker.snapshot().await.persisted_alert.unwrap();
            assert_eq!(alert.fired_at, Some(at(0)));
        }
    }

    mod loop_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_running_worker_queries_on_interval() {
            let h = harness(definition());
            h.worker.start();
            tokio::time::sleep(Duration::from_millis(12_500)).await;
            h.worker.stop().await;
            // t = 0, 5, 10
            assert_eq!(h.backend.queries(), 3);
        }
    }
}
