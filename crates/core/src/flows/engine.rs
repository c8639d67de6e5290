use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::approvals::{step_progress, StepProgress};
use crate::domain::instance::{
    Decision, InstanceEvent, InstanceId, InstanceStatus, WorkflowInstance,
};
use crate::domain::org::EmployeeId;
use crate::domain::setup::SetupSnapshot;
use crate::flows::states::{InstanceState, TransitionOutcome, WorkflowAction};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("instance `{instance_id}` is already {}", .status.as_str())]
    AlreadyTerminal { instance_id: InstanceId, status: InstanceStatus },
    #[error("instance `{instance_id}` is at step {current_step_order}, event targets step {step_order}")]
    StaleStep { instance_id: InstanceId, step_order: u32, current_step_order: u32 },
    #[error("step {step_order} of `{instance_id}` has not been entered")]
    StepNotEntered { instance_id: InstanceId, step_order: u32 },
    #[error("step {step_order} of `{instance_id}` was already entered")]
    StepAlreadyEntered { instance_id: InstanceId, step_order: u32 },
    #[error("snapshot of `{instance_id}` has no step {step_order}")]
    UnknownStep { instance_id: InstanceId, step_order: u32 },
    #[error("`{event}` events are derived and cannot be applied directly")]
    DerivedEvent { event: &'static str },
}

/// Pure state machine over `WorkflowInstance`. Validates an event against the
/// instance, appends it to the log and reports the follow-up actions. It does
/// not check who is allowed to decide; that happens before, in
/// `approvals::StepResolver`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkflowEngine;

impl WorkflowEngine {
    pub fn new() -> Self {
        Self
    }

    /// A fresh instance sitting at step 1. Step 1 is not entered until the
    /// caller applies `StepEntered`.
    pub fn start(
        &self,
        id: InstanceId,
        snapshot: Arc<SetupSnapshot>,
        submitter_id: EmployeeId,
        payload: serde_json::Value,
        submitted_at: DateTime<Utc>,
    ) -> WorkflowInstance {
        WorkflowInstance {
            id,
            snapshot,
            submitter_id,
            payload,
            submitted_at,
            status: InstanceStatus::Pending,
            current_step_order: 1,
            step_entered_at: None,
            pinned_co_approvers: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn apply(
        &self,
        instance: &mut WorkflowInstance,
        event: InstanceEvent,
    ) -> Result<TransitionOutcome, TransitionError> {
        let from = state_of(instance);
        let (actions, moot) = match &event {
            InstanceEvent::StepEntered { step_order, co_approver_id, at } => {
                (enter_step(instance, *step_order, co_approver_id.clone(), *at)?, Vec::new())
            }
            InstanceEvent::Decided { decision } => record_decision(instance, decision)?,
            InstanceEvent::TimerExpired { step_order, at } => {
                (expire(instance, *step_order, *at)?, Vec::new())
            }
            InstanceEvent::Cancelled { by, at } => (cancel(instance, by, *at)?, Vec::new()),
            InstanceEvent::Mooted { .. } => {
                return Err(TransitionError::DerivedEvent { event: "mooted" });
            }
        };

        Ok(TransitionOutcome { from, to: state_of(instance), event, actions, moot })
    }

    /// Rebuilds an instance from its snapshot and event log. `Mooted` entries
    /// are regenerated by the rejection that caused them, so they are skipped.
    pub fn replay(
        &self,
        id: InstanceId,
        snapshot: Arc<SetupSnapshot>,
        submitter_id: EmployeeId,
        payload: serde_json::Value,
        submitted_at: DateTime<Utc>,
        events: &[InstanceEvent],
    ) -> Result<WorkflowInstance, TransitionError> {
        let mut instance = self.start(id, snapshot, submitter_id, payload, submitted_at);
        for event in events {
            if matches!(event, InstanceEvent::Mooted { .. }) {
                continue;
            }
            self.apply(&mut instance, event.clone())?;
        }
        Ok(instance)
    }
}

fn state_of(instance: &WorkflowInstance) -> InstanceState {
    InstanceState { status: instance.status, step_order: instance.current_step_order }
}

fn ensure_pending_at(instance: &WorkflowInstance, step_order: u32) -> Result<(), TransitionError> {
    if instance.status.is_terminal() {
        return Err(TransitionError::AlreadyTerminal {
            instance_id: instance.id.clone(),
            status: instance.status,
        });
    }
    if instance.current_step_order != step_order {
        return Err(TransitionError::StaleStep {
            instance_id: instance.id.clone(),
            step_order,
            current_step_order: instance.current_step_order,
        });
    }
    Ok(())
}

fn ensure_entered(instance: &WorkflowInstance, step_order: u32) -> Result<(), TransitionError> {
    if instance.pinned_co_approvers.contains_key(&step_order) {
        Ok(())
    } else {
        Err(TransitionError::StepNotEntered { instance_id: instance.id.clone(), step_order })
    }
}

fn enter_step(
    instance: &mut WorkflowInstance,
    step_order: u32,
    co_approver_id: Option<EmployeeId>,
    at: DateTime<Utc>,
) -> Result<Vec<WorkflowAction>, TransitionError> {
    ensure_pending_at(instance, step_order)?;
    if instance.snapshot.step(step_order).is_none() {
        return Err(TransitionError::UnknownStep { instance_id: instance.id.clone(), step_order });
    }
    if instance.pinned_co_approvers.contains_key(&step_order) {
        return Err(TransitionError::StepAlreadyEntered {
            instance_id: instance.id.clone(),
            step_order,
        });
    }

    instance.pinned_co_approvers.insert(step_order, co_approver_id.clone());
    instance.step_entered_at = Some(at);
    instance.events.push(InstanceEvent::StepEntered { step_order, co_approver_id, at });

    Ok(vec![
        WorkflowAction::NotifyDecisionNeeded { step_order },
        WorkflowAction::ArmTimer { step_order, entered_at: at },
    ])
}

fn record_decision(
    instance: &mut WorkflowInstance,
    decision: &Decision,
) -> Result<(Vec<WorkflowAction>, Vec<EmployeeId>), TransitionError> {
    let step_order = decision.step_order;
    ensure_pending_at(instance, step_order)?;
    ensure_entered(instance, step_order)?;
    let step = instance.effective_step(step_order).ok_or_else(|| {
        TransitionError::UnknownStep { instance_id: instance.id.clone(), step_order }
    })?;

    instance.events.push(InstanceEvent::Decided { decision: decision.clone() });
    let progress = step_progress(&step, &instance.decisions_at(step_order));

    let mut actions = vec![WorkflowAction::NotifyDecided { decision: decision.clone() }];
    match progress {
        StepProgress::Awaiting { .. } => Ok((actions, Vec::new())),
        StepProgress::Satisfied => {
            actions.push(WorkflowAction::CancelTimer { step_order });
            if step_order >= instance.snapshot.last_order() {
                instance.status = InstanceStatus::Approved;
                actions.push(WorkflowAction::NotifyTerminal { status: InstanceStatus::Approved });
            } else {
                instance.current_step_order = step_order + 1;
                instance.step_entered_at = None;
                actions.push(WorkflowAction::EnterStep { step_order: step_order + 1 });
            }
            Ok((actions, Vec::new()))
        }
        StepProgress::Rejected { moot } => {
            for actor_id in &moot {
                instance.events.push(InstanceEvent::Mooted {
                    step_order,
                    actor_id: actor_id.clone(),
                    at: decision.decided_at,
                });
            }
            instance.status = InstanceStatus::Rejected;
            actions.push(WorkflowAction::CancelTimer { step_order });
            actions.push(WorkflowAction::NotifyTerminal { status: InstanceStatus::Rejected });
            Ok((actions, moot))
        }
    }
}

fn expire(
    instance: &mut WorkflowInstance,
    step_order: u32,
    at: DateTime<Utc>,
) -> Result<Vec<WorkflowAction>, TransitionError> {
    ensure_pending_at(instance, step_order)?;
    ensure_entered(instance, step_order)?;

    instance.status = InstanceStatus::AutoRejected;
    instance.events.push(InstanceEvent::TimerExpired { step_order, at });
    Ok(vec![WorkflowAction::NotifyTerminal { status: InstanceStatus::AutoRejected }])
}

fn cancel(
    instance: &mut WorkflowInstance,
    by: &EmployeeId,
    at: DateTime<Utc>,
) -> Result<Vec<WorkflowAction>, TransitionError> {
    let step_order = instance.current_step_order;
    ensure_pending_at(instance, step_order)?;

    instance.status = InstanceStatus::Cancelled;
    instance.events.push(InstanceEvent::Cancelled { by: by.clone(), at });
    Ok(vec![
        WorkflowAction::CancelTimer { step_order },
        WorkflowAction::NotifyTerminal { status: InstanceStatus::Cancelled },
    ])
}
