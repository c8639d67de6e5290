//! Step actor resolution and decision authorization.
//!
//! Who may act on a step is re-derived from the delegation ledger on every
//! call; nothing about actor identity is cached on the instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::delegation::DelegationLedger;
use crate::domain::instance::{
    ActingAs, Decision, DecisionOutcome, InstanceId, InstanceStatus, WorkflowInstance,
};
use crate::domain::org::EmployeeId;
use crate::domain::setup::ResolvedStep;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub employee_id: EmployeeId,
    pub acting_as: ActingAs,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RequiredActors {
    Single { actor: Actor },
    Both { actors: [Actor; 2] },
}

impl RequiredActors {
    pub fn actors(&self) -> &[Actor] {
        match self {
            Self::Single { actor } => std::slice::from_ref(actor),
            Self::Both { actors } => actors,
        }
    }

    pub fn employee_ids(&self) -> Vec<EmployeeId> {
        self.actors().iter().map(|actor| actor.employee_id.clone()).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecisionError {
    #[error("`{actor_id}` is not a required actor of step {step_order} on `{instance_id}`")]
    NotAuthorized { instance_id: InstanceId, step_order: u32, actor_id: EmployeeId },
    #[error("instance `{instance_id}` is at step {current_step_order}, not step {step_order}")]
    StaleStep { instance_id: InstanceId, step_order: u32, current_step_order: u32 },
    #[error("instance `{instance_id}` is already {}", .status.as_str())]
    AlreadyTerminal { instance_id: InstanceId, status: InstanceStatus },
    #[error("`{actor_id}` already decided step {step_order} on `{instance_id}`")]
    AlreadyDecided { instance_id: InstanceId, step_order: u32, actor_id: EmployeeId },
    #[error("instance `{instance_id}` snapshot has no step {step_order}")]
    UnknownStep { instance_id: InstanceId, step_order: u32 },
}

/// Where a step stands given the decisions recorded against it so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepProgress {
    Awaiting { primary_decided: bool, co_approver_decided: bool },
    Satisfied,
    /// Rejected by one actor; `moot` lists earlier approvals on the same step
    /// that no longer count.
    Rejected { moot: Vec<EmployeeId> },
}

/// Dual approval is AND for approval and OR for rejection. Decisions are
/// read in log order; the first rejection settles the step.
pub fn step_progress(step: &ResolvedStep, decisions: &[&Decision]) -> StepProgress {
    let mut primary_decided = false;
    let mut co_approver_decided = false;
    let mut approvers = Vec::new();

    for decision in decisions.iter().filter(|decision| decision.step_order == step.order) {
        if decision.outcome == DecisionOutcome::Reject {
            return StepProgress::Rejected { moot: approvers };
        }
        match decision.acting_as {
            ActingAs::Primary | ActingAs::Delegate => primary_decided = true,
            ActingAs::CoApprover => co_approver_decided = true,
        }
        approvers.push(decision.actor_id.clone());
    }

    if primary_decided && (!step.require_both || co_approver_decided) {
        StepProgress::Satisfied
    } else {
        StepProgress::Awaiting { primary_decided, co_approver_decided }
    }
}

pub struct StepResolver<'a> {
    ledger: &'a DelegationLedger,
}

impl<'a> StepResolver<'a> {
    pub fn new(ledger: &'a DelegationLedger) -> Self {
        Self { ledger }
    }

    pub fn resolve(
        &self,
        instance: &WorkflowInstance,
        step_order: u32,
        as_of: DateTime<Utc>,
    ) -> Result<RequiredActors, DecisionError> {
        let step = instance.effective_step(step_order).ok_or_else(|| {
            DecisionError::UnknownStep { instance_id: instance.id().clone(), step_order }
        })?;
        let (employee_id, acting_as) =
            self.ledger.effective_actor(&instance.snapshot().setup_id, &step, as_of);
        // A delegate cannot hold both seats of a dual step.
        let primary = if acting_as == ActingAs::Delegate
            && step.require_both
            && step.co_approver_id.as_ref() == Some(&employee_id)
        {
            Actor { employee_id: step.primary_approver_id.clone(), acting_as: ActingAs::Primary }
        } else {
            Actor { employee_id, acting_as }
        };

        Ok(match (&step.co_approver_id, step.require_both) {
            (Some(co_approver_id), true) => RequiredActors::Both {
                actors: [
                    primary,
                    Actor { employee_id: co_approver_id.clone(), acting_as: ActingAs::CoApprover },
                ],
            },
            _ => RequiredActors::Single { actor: primary },
        })
    }

    /// Checks a decision attempt against the actors required at `as_of`. Never
    /// mutates the instance.
    pub fn authorize(
        &self,
        instance: &WorkflowInstance,
        step_order: u32,
        actor_id: &EmployeeId,
        as_of: DateTime<Utc>,
    ) -> Result<Actor, DecisionError> {
        let instance_id = instance.id().clone();
        if instance.status().is_terminal() {
            return Err(DecisionError::AlreadyTerminal { instance_id, status: instance.status() });
        }
        if instance.current_step_order() != step_order {
            return Err(DecisionError::StaleStep {
                instance_id,
                step_order,
                current_step_order: instance.current_step_order(),
            });
        }

        let required = self.resolve(instance, step_order, as_of)?;
        let decided = instance.decisions_at(step_order);
        if decided.iter().any(|decision| &decision.actor_id == actor_id) {
            return Err(DecisionError::AlreadyDecided {
                instance_id,
                step_order,
                actor_id: actor_id.clone(),
            });
        }

        let mut matching =
            required.actors().iter().filter(|actor| &actor.employee_id == actor_id).peekable();
        if matching.peek().is_none() {
            return Err(DecisionError::NotAuthorized {
                instance_id,
                step_order,
                actor_id: actor_id.clone(),
            });
        }

        matching
            .find(|actor| !slot_filled(&decided, actor.acting_as))
            .cloned()
            .ok_or_else(|| DecisionError::AlreadyDecided {
                instance_id,
                step_order,
                actor_id: actor_id.clone(),
            })
    }
}

fn slot_filled(decided: &[&Decision], acting_as: ActingAs) -> bool {
    let co_approver_slot = acting_as == ActingAs::CoApprover;
    decided
        .iter()
        .any(|decision| (decision.acting_as == ActingAs::CoApprover) == co_approver_slot)
}
