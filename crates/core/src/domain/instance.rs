use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::org::EmployeeId;
use crate::domain::setup::{ResolvedStep, SetupSnapshot, SnapshotId};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Approved,
    Rejected,
    AutoRejected,
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::AutoRejected => "auto_rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Provenance of the authority a decision was recorded under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActingAs {
    Primary,
    Delegate,
    CoApprover,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approve,
    Reject,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub step_order: u32,
    pub actor_id: EmployeeId,
    pub acting_as: ActingAs,
    pub outcome: DecisionOutcome,
    /// Display only. Authority comes from log position.
    pub decided_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstanceEvent {
    StepEntered { step_order: u32, co_approver_id: Option<EmployeeId>, at: DateTime<Utc> },
    Decided { decision: Decision },
    Mooted { step_order: u32, actor_id: EmployeeId, at: DateTime<Utc> },
    TimerExpired { step_order: u32, at: DateTime<Utc> },
    Cancelled { by: EmployeeId, at: DateTime<Utc> },
}

/// One run of a setup snapshot against a submitted request. State changes
/// only through `flows::WorkflowEngine`, which appends to `events`.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowInstance {
    pub(crate) id: InstanceId,
    pub(crate) snapshot: Arc<SetupSnapshot>,
    pub(crate) submitter_id: EmployeeId,
    pub(crate) payload: serde_json::Value,
    pub(crate) submitted_at: DateTime<Utc>,
    pub(crate) status: InstanceStatus,
    pub(crate) current_step_order: u32,
    pub(crate) step_entered_at: Option<DateTime<Utc>>,
    pub(crate) pinned_co_approvers: BTreeMap<u32, Option<EmployeeId>>,
    pub(crate) events: Vec<InstanceEvent>,
}

impl WorkflowInstance {
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn snapshot(&self) -> &SetupSnapshot {
        &self.snapshot
    }

    pub fn snapshot_id(&self) -> &SnapshotId {
        &self.snapshot.id
    }

    pub fn submitter_id(&self) -> &EmployeeId {
        &self.submitter_id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn current_step_order(&self) -> u32 {
        self.current_step_order
    }

    pub fn step_entered_at(&self) -> Option<DateTime<Utc>> {
        self.step_entered_at
    }

    pub fn events(&self) -> &[InstanceEvent] {
        &self.events
    }

    pub fn decisions(&self) -> impl Iterator<Item = &Decision> {
        self.events.iter().filter_map(|event| match event {
            InstanceEvent::Decided { decision } => Some(decision),
            _ => None,
        })
    }

    pub fn decisions_at(&self, step_order: u32) -> Vec<&Decision> {
        self.decisions().filter(|decision| decision.step_order == step_order).collect()
    }

    /// The step as it binds this instance: the snapshot's primary approver
    /// plus whatever co-approver was pinned when the step was entered.
    pub fn effective_step(&self, step_order: u32) -> Option<ResolvedStep> {
        let mut step = self.snapshot.step(step_order)?.clone();
        if let Some(pinned) = self.pinned_co_approvers.get(&step_order) {
            step.require_both = pinned.is_some();
            step.co_approver_id = pinned.clone();
        }
        Some(step)
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            snapshot_id: self.snapshot.id.clone(),
            setup_name: self.snapshot.name.clone(),
            feature: self.snapshot.feature.clone(),
            submitter_id: self.submitter_id.clone(),
            status: self.status,
            current_step_order: self.current_step_order,
            decisions: self.decisions().cloned().collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub snapshot_id: SnapshotId,
    pub setup_name: String,
    pub feature: String,
    pub submitter_id: EmployeeId,
    pub status: InstanceStatus,
    pub current_step_order: u32,
    pub decisions: Vec<Decision>,
}
