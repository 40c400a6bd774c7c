//! Per-instance healer items.
//!
//! A healer fires for the instances named by its query result. Each instance
//! is handled once and then whitelisted until it disappears from the result.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::FireContext;
use crate::alert::{Alert, AlertDecision};
use crate::domain::Domain;
use crate::error::Result;
use crate::scaler::{WorkItemDefinition, invalid};
use crate::worker::{Task, TaskContext, TickOutcome};

/// Label naming the instance unless configured otherwise.
pub const DEFAULT_INSTANCE_LABEL: &str = "instance";

/// Persisted healer definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealerDefinition {
    /// Query, timing and actions.
    #[serde(flatten)]
    pub item: WorkItemDefinition,
    /// Sample label holding the instance name.
    #[serde(default = "default_instance_label")]
    pub instance_label: String,
    /// Instances already handled.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub persisted_whitelist: BTreeSet<String>,
}

fn default_instance_label() -> String {
    DEFAULT_INSTANCE_LABEL.to_string()
}

impl HealerDefinition {
    /// Wraps an item definition with the default instance label.
    #[must_use]
    pub fn new(item: WorkItemDefinition) -> Self {
        Self {
            item,
            instance_label: default_instance_label(),
            persisted_whitelist: BTreeSet::new(),
        }
    }

    /// Checks the definition before it reaches a worker.
    pub fn validate(&self) -> Result<()> {
        self.item.validate()?;
        if self.instance_label.is_empty() {
            return Err(invalid("instance_label cannot be empty"));
        }
        Ok(())
    }
}

/// Runtime healer.
#[derive(Debug)]
pub struct Healer {
    definition: HealerDefinition,
    alert: Alert,
    whitelist: BTreeSet<String>,
}

impl Healer {
    /// Returns the instances already handled.
    #[must_use]
    pub const fn whitelist(&self) -> &BTreeSet<String> {
        &self.whitelist
    }
}

#[async_trait]
impl Task for Healer {
    type Definition = HealerDefinition;
    const DOMAIN: Domain = Domain::Healers;

    fn from_definition(mut definition: HealerDefinition) -> Result<Self> {
        definition.validate()?;
        let alert = definition.item.persisted_alert.take().unwrap_or_default();
        let whitelist = std::mem::take(&mut definition.persisted_whitelist);
        Ok(Self {
            definition,
            alert,
            whitelist,
        })
    }

    fn id(&self) -> &str {
        &self.definition.item.id
    }

    fn interval(&self) -> Option<Duration> {
        Some(self.definition.item.interval)
    }

    fn is_active(&self) -> bool {
        self.definition.item.active
    }

    async fn tick(&mut self, now: DateTime<Utc>, ctx: &TaskContext) -> TickOutcome {
        let item = &self.definition.item;
        let samples = match ctx.backend.query_instant(&item.query, now).await {
            Ok(samples) => samples,
            Err(e) => {
                warn!(key = %ctx.key, error = %e, "healer query failed");
                return TickOutcome::QueryFailed;
            }
        };

        if samples.is_empty() {
            if self.alert.active || !self.whitelist.is_empty() {
                debug!(key = %ctx.key, "healer condition cleared");
            }
            self.alert.reset();
            self.whitelist.clear();
            return TickOutcome::Cleared;
        }

        let label = &self.definition.instance_label;
        let instances: BTreeSet<String> = samples
            .iter()
            .filter_map(|s| s.label(label).map(str::to_string))
            .collect();
        // instances that recovered become eligible again
        self.whitelist.retain(|i| instances.contains(i));

        match self.alert.observe(now, item.duration, item.cooldown) {
            AlertDecision::Pending => return TickOutcome::Pending,
            AlertDecision::CoolingDown => return TickOutcome::CoolingDown,
            AlertDecision::Fire => {}
        }

        let fresh: Vec<String> = instances.difference(&self.whitelist).cloned().collect();
        if fresh.is_empty() {
            if instances.is_empty() {
                warn!(key = %ctx.key, label = %label, "query result carries no instance label");
            }
            return TickOutcome::Suppressed;
        }

        let mut fire = FireContext::new(Self::DOMAIN, &ctx.key, &item.id, now);
        fire.samples = samples.len();
        fire.instances.clone_from(&fresh);
        info!(
            key = %ctx.key,
            fire_id = %fire.fire_id,
            instances = ?fresh,
            "healer firing"
        );
        let report = ctx.dispatcher.dispatch(&item.actions, &fire).await;
        self.whitelist.extend(fresh);
        self.alert.fire(now, item.cooldown);
        TickOutcome::Fired(report)
    }

    fn snapshot(&self) -> HealerDefinition {
        let mut definition = self.definition.clone();
        definition.item.persisted_alert = Some(self.alert);
        definition.persisted_whitelist.clone_from(&self.whitelist);
        definition
    }

    fn strip_state(mut definition: HealerDefinition) -> HealerDefinition {
        definition.item.persisted_alert = None;
        definition.persisted_whitelist.clear();
        definition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionTarget, WorkflowAction};
    use crate::backend::{Sample, StaticBackend};
    use crate::dispatch::Dispatcher;
    use crate::transport::RecordingTransport;
    use crate::worker::{Worker, WorkerEnv};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn definition() -> HealerDefinition {
        HealerDefinition::new(
            WorkItemDefinition::new("restart", "up == 0", Duration::from_secs(5)).with_action(
                Action::new(ActionTarget::WorkflowTrigger(WorkflowAction {
                    workflow_id: "restart-node".into(),
                    input: serde_json::json!({}),
                })),
            ),
        )
    }

    fn down(instances: &[&str]) -> Vec<Sample> {
        instances
            .iter()
            .map(|i| Sample::labelled(DEFAULT_INSTANCE_LABEL, i, 0.0))
            .collect()
    }

    fn harness(def: HealerDefinition) -> (Arc<StaticBackend>, Arc<RecordingTransport>, Worker<Healer>) {
        let backend = Arc::new(StaticBackend::new());
        let transport = Arc::new(RecordingTransport::new());
        let env = WorkerEnv::new(
            Arc::clone(&backend) as _,
            Dispatcher::new(Arc::clone(&transport) as _),
        );
        let worker = Worker::<Healer>::new("/healers/aws", def, &env).unwrap();
        (backend, transport, worker)
    }

    mod definition_tests {
        use super::*;

        #[test]
        fn test_decodes_flattened_definition() {
            let json = r#"{
                "id": "restart",
                "query": "up == 0",
                "interval": "10s",
                "instance_label": "node",
                "persisted_whitelist": ["a"]
            }"#;
            let def: HealerDefinition = serde_json::from_str(json).unwrap();
            assert_eq!(def.item.interval, Duration::from_secs(10));
            assert_eq!(def.instance_label, "node");
            assert!(def.persisted_whitelist.contains("a"));

            let minimal: HealerDefinition =
                serde_json::from_str(r#"{"id":"r","query":"up == 0","interval":"5s"}"#).unwrap();
            assert_eq!(minimal.instance_label, DEFAULT_INSTANCE_LABEL);
        }

        #[test]
        fn test_strip_state_drops_alert_and_whitelist() {
            let mut checkpoint = definition();
            checkpoint.item.persisted_alert = Some(Alert::default());
            checkpoint.persisted_whitelist.insert("10.0.0.1".into());

            assert_eq!(Healer::strip_state(checkpoint), definition());
        }
    }

    mod firing_tests {
        use super::*;

        #[tokio::test]
        async fn test_fires_once_per_instance() {
            let (backend, transport, worker) = harness(definition());
            backend.push(Ok(down(&["a"])));
            backend.push(Ok(down(&["a"])));
            backend.push(Ok(down(&["a", "b"])));

            assert!(matches!(worker.evaluate(at(0)).await, TickOutcome::Fired(_)));
            assert_eq!(worker.evaluate(at(5)).await, TickOutcome::Suppressed);
            assert!(matches!(worker.evaluate(at(10)).await, TickOutcome::Fired(_)));

            let calls = transport.delivered();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[0].ctx.instances, vec!["a".to_string()]);
            assert_eq!(calls[1].ctx.instances, vec!["b".to_string()]);
        }

        #[tokio::test]
        async fn test_recovered_instance_becomes_eligible_again() {
            let (backend, transport, worker) = harness(definition());
            backend.push(Ok(down(&["a", "b"])));
            backend.push(Ok(down(&["b"])));
            backend.push(Ok(down(&["a", "b"])));

            worker.evaluate(at(0)).await;
            assert_eq!(worker.evaluate(at(5)).await, TickOutcome::Suppressed);
            assert!(matches!(worker.evaluate(at(10)).await, TickOutcome::Fired(_)));
            assert_eq!(transport.delivered()[1].ctx.instances, vec!["a".to_string()]);
        }

        #[tokio::test]
        async fn test_empty_result_clears_whitelist() {
            let (backend, _transport, worker) = harness(definition());
            backend.push(Ok(down(&["a"])));
            backend.push(Ok(vec![]));

            worker.evaluate(at(0)).await;
            assert!(worker.snapshot().await.persisted_whitelist.contains("a"));
            assert_eq!(worker.evaluate(at(5)).await, TickOutcome::Cleared);
            let snapshot = worker.snapshot().await;
            assert!(snapshot.persisted_whitelist.is_empty());
            assert_eq!(snapshot.item.persisted_alert, Some(Alert::default()));
        }

        #[tokio::test]
        async fn test_whitelist_survives_hand_off() {
            let (backend, _transport, worker) = harness(definition());
            backend.push(Ok(down(&["a"])));
            worker.evaluate(at(0)).await;

            let json = serde_json::to_vec(&worker.snapshot().await).unwrap();
            let (backend, transport, restored) = harness(Worker::<Healer>::decode(&json).unwrap());
            backend.push(Ok(down(&["a"])));
            assert_eq!(restored.evaluate(at(5)).await, TickOutcome::Suppressed);
            assert!(transport.calls().is_empty());
        }

        #[tokio::test]
        async fn test_unlabelled_samples_never_fire() {
            let (backend, transport, worker) = harness(definition());
            backend.push(Ok(vec![Sample::labelled("job", "node", 0.0)]));
            assert_eq!(worker.evaluate(at(0)).await, TickOutcome::Suppressed);
            assert!(transport.calls().is_empty());
        }
    }
}
