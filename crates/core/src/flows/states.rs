use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::instance::{Decision, InstanceEvent, InstanceStatus};
use crate::domain::org::EmployeeId;

/// Side effects the caller must carry out after a transition, in order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// The instance moved to a step that has not been entered yet; the caller
    /// pins its co-approver and applies `InstanceEvent::StepEntered`.
    EnterStep { step_order: u32 },
    ArmTimer { step_order: u32, entered_at: DateTime<Utc> },
    CancelTimer { step_order: u32 },
    NotifyDecisionNeeded { step_order: u32 },
    NotifyDecided { decision: Decision },
    NotifyTerminal { status: InstanceStatus },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub status: InstanceStatus,
    pub step_order: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: InstanceState,
    pub to: InstanceState,
    pub event: InstanceEvent,
    pub actions: Vec<WorkflowAction>,
    pub moot: Vec<EmployeeId>,
}
