//! Cron-window scheduler items.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::action::{Action, FireContext, Transition};
use crate::cron::CronSchedule;
use crate::domain::Domain;
use crate::error::Result;
use crate::scaler::{default_active, invalid};
use crate::worker::{Task, TaskContext, TickOutcome};

/// Last observed window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    /// Whether the window was open.
    pub in_window: bool,
    /// When that was observed.
    pub observed_at: DateTime<Utc>,
}

/// Persisted scheduler definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerDefinition {
    /// Item id.
    pub id: String,
    /// Cron expression opening the window.
    pub from_cron: String,
    /// Cron expression closing the window.
    pub to_cron: String,
    /// Actions run on every crossing.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Inactive items are never evaluated.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Window state carried across hand-offs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted_window: Option<WindowState>,
}

impl SchedulerDefinition {
    /// Creates an active definition with no actions.
    #[must_use]
    pub fn new(id: impl Into<String>, from_cron: impl Into<String>, to_cron: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from_cron: from_cron.into(),
            to_cron: to_cron.into(),
            actions: Vec::new(),
            active: true,
            persisted_window: None,
        }
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
        CronSchedule::parse(&self.from_cron)?;
        CronSchedule::parse(&self.to_cron)?;
        for action in &self.actions {
            action.validate()?;
        }
        Ok(())
    }
}

/// Runtime scheduler.
#[derive(Debug)]
pub struct Scheduler {
    definition: SchedulerDefinition,
    from: CronSchedule,
    to: CronSchedule,
    window: Option<WindowState>,
}

impl Scheduler {
    /// Returns true if the window is open at `now`.
    ///
    /// The window is open when the latest `from` occurrence is later than the
    /// latest `to` occurrence.
    #[must_use]
    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        match (
            self.from.latest_at_or_before(now),
            self.to.latest_at_or_before(now),
        ) {
            (Some(from), Some(to)) => from > to,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[async_trait]
impl Task for Scheduler {
    type Definition = SchedulerDefinition;
    const DOMAIN: Domain = Domain::Schedulers;

    fn from_definition(mut definition: SchedulerDefinition) -> Result<Self> {
        definition.validate()?;
        let from = CronSchedule::parse(&definition.from_cron)?;
        let to = CronSchedule::parse(&definition.to_cron)?;
        let window = definition.persisted_window.take();
        Ok(Self {
            definition,
            from,
            to,
            window,
        })
    }

    fn id(&self) -> &str {
        &self.definition.id
    }

    fn interval(&self) -> Option<Duration> {
        None
    }

    fn is_active(&self) -> bool {
        self.definition.active
    }

    async fn tick(&mut self, now: DateTime<Utc>, ctx: &TaskContext) -> TickOutcome {
        let in_window = self.in_window(now);
        let previous = self.window.replace(WindowState {
            in_window,
            observed_at: now,
        });

        let Some(previous) = previous else {
            debug!(key = %ctx.key, in_window, "scheduler window recorded");
            return TickOutcome::Recorded;
        };
        if previous.in_window == in_window {
            return TickOutcome::Unchanged;
        }

        let transition = if in_window {
            Transition::Enter
        } else {
            Transition::Exit
        };
        let mut fire = FireContext::new(Self::DOMAIN, &ctx.key, &self.definition.id, now);
        fire.transition = Some(transition);
        info!(
            key = %ctx.key,
            fire_id = %fire.fire_id,
            transition = ?transition,
            "scheduler window crossed"
        );
        let report = ctx.dispatcher.dispatch(&self.definition.actions, &fire).await;
        TickOutcome::Fired(report)
    }

    fn snapshot(&self) -> SchedulerDefinition {
        SchedulerDefinition {
            persisted_window: self.window,
            ..self.definition.clone()
        }
    }

    fn strip_state(definition: SchedulerDefinition) -> SchedulerDefinition {
        SchedulerDefinition {
            persisted_window: None,
            ..definition
        }
    }
}
