use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::approvals::RequiredActors;
use crate::domain::instance::{Decision, InstanceId, InstanceStatus};

/// Outbound hooks for whatever delivers notifications. Called after the
/// instance lock is released, in transition order.
pub trait NotificationDispatcher: Send + Sync {
    fn on_decision_needed(&self, instance_id: &InstanceId, step_order: u32, actors: &RequiredActors);
    fn on_decided(&self, instance_id: &InstanceId, decision: &Decision);
    fn on_terminal(&self, instance_id: &InstanceId, status: InstanceStatus);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "notification", rename_all = "snake_case")]
pub enum Notification {
    DecisionNeeded { instance_id: InstanceId, step_order: u32, actors: RequiredActors },
    Decided { instance_id: InstanceId, decision: Decision },
    Terminal { instance_id: InstanceId, status: InstanceStatus },
}

impl Notification {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::DecisionNeeded { instance_id, .. }
            | Self::Decided { instance_id, .. }
            | Self::Terminal { instance_id, .. } => instance_id,
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationDispatcher {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl InMemoryNotificationDispatcher {
    pub fn notifications(&self) -> Vec<Notification> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn for_instance(&self, instance_id: &InstanceId) -> Vec<Notification> {
        self.notifications()
            .into_iter()
            .filter(|notification| notification.instance_id() == instance_id)
            .collect()
    }

    fn record(&self, notification: Notification) {
        match self.sent.lock() {
            Ok(mut sent) => sent.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
    }
}

impl NotificationDispatcher for InMemoryNotificationDispatcher {
    fn on_decision_needed(&self, instance_id: &InstanceId, step_order: u32, actors: &RequiredActors) {
        self.record(Notification::DecisionNeeded {
            instance_id: instance_id.clone(),
            step_order,
            actors: actors.clone(),
        });
    }

    fn on_decided(&self, instance_id: &InstanceId, decision: &Decision) {
        self.record(Notification::Decided {
            instance_id: instance_id.clone(),
            decision: decision.clone(),
        });
    }

    fn on_terminal(&self, instance_id: &InstanceId, status: InstanceStatus) {
        self.record(Notification::Terminal { instance_id: instance_id.clone(), status });
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotificationDispatcher;

impl NotificationDispatcher for TracingNotificationDispatcher {
    fn on_decision_needed(&self, instance_id: &InstanceId, step_order: u32, actors: &RequiredActors) {
        let actors: Vec<String> =
            actors.employee_ids().into_iter().map(|employee_id| employee_id.0).collect();
        tracing::info!(
            event_name = "notify.decision_needed",
            instance_id = %instance_id,
            step_order,
            actors = ?actors,
            "decision needed"
        );
    }

    fn on_decided(&self, instance_id: &InstanceId, decision: &Decision) {
        tracing::info!(
            event_name = "notify.decided",
            instance_id = %instance_id,
            step_order = decision.step_order,
            actor_id = %decision.actor_id,
            acting_as = ?decision.acting_as,
            outcome = ?decision.outcome,
            "decision recorded"
        );
    }

    fn on_terminal(&self, instance_id: &InstanceId, status: InstanceStatus) {
        tracing::info!(
            event_name = "notify.terminal",
            instance_id = %instance_id,
            status = status.as_str(),
            "instance finished"
        );
    }
}
