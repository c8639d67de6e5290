use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::delegation::{Delegation, DelegationId, DelegationPhase, NewDelegation};
use crate::domain::instance::ActingAs;
use crate::domain::org::EmployeeId;
use crate::domain::setup::{ResolvedStep, SetupId};
use crate::registry::{RegistryError, SetupRegistry};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DelegationError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("delegation window {start_date}..={end_date} ends before it starts")]
    InvertedWindow { start_date: NaiveDate, end_date: NaiveDate },
    #[error("`{delegate_id}` cannot be delegated their own step")]
    SelfDelegation { delegate_id: EmployeeId },
    #[error("`{delegate_id}` is already the co-approver of this step")]
    DelegateIsCoApprover { delegate_id: EmployeeId },
    #[error(
        "delegation window overlaps `{existing}` on setup `{setup_id}` step {step_order}"
    )]
    OverlappingDelegation { setup_id: SetupId, step_order: u32, existing: DelegationId },
    #[error("unknown delegation `{0}`")]
    UnknownDelegation(DelegationId),
}

/// Time-windowed substitutions keyed by `(setup id, step order)`. Keyed on
/// the setup id rather than a version, so a delegation keeps applying to
/// instances bound to older versions of the same setup.
#[derive(Clone, Debug, Default)]
pub struct DelegationLedger {
    by_step: HashMap<(SetupId, u32), Vec<Delegation>>,
}

impl DelegationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_delegation(
        &mut self,
        request: NewDelegation,
        registry: &SetupRegistry,
        created_at: DateTime<Utc>,
    ) -> Result<Delegation, DelegationError> {
        let setup = registry
            .latest(&request.setup_id)
            .ok_or_else(|| RegistryError::UnknownSetup(request.setup_id.clone()))?;
        let step = setup.step(request.step_order).ok_or_else(|| RegistryError::UnknownStep {
            setup_id: request.setup_id.clone(),
            step_order: request.step_order,
        })?;

        if request.end_date < request.start_date {
            return Err(DelegationError::InvertedWindow {
                start_date: request.start_date,
                end_date: request.end_date,
            });
        }
        if step.primary.explicit_employee() == Some(&request.delegate_id) {
            return Err(DelegationError::SelfDelegation { delegate_id: request.delegate_id });
        }
        if step.co_approver_id.as_ref() == Some(&request.delegate_id) {
            return Err(DelegationError::DelegateIsCoApprover { delegate_id: request.delegate_id });
        }

        let key = (request.setup_id.clone(), request.step_order);
        let existing = self.by_step.entry(key).or_default();
        if let Some(conflict) = existing
            .iter()
            .find(|delegation| delegation.overlaps(request.start_date, request.end_date))
        {
            return Err(DelegationError::OverlappingDelegation {
                setup_id: request.setup_id,
                step_order: request.step_order,
                existing: conflict.id.clone(),
            });
        }

        let delegation = Delegation {
            id: DelegationId(Uuid::new_v4().to_string()),
            setup_id: request.setup_id,
            step_order: request.step_order,
            delegate_id: request.delegate_id,
            start_date: request.start_date,
            end_date: request.end_date,
            created_by: request.created_by,
            created_at,
        };
        existing.push(delegation.clone());
        existing.sort_by_key(|delegation| delegation.start_date);
        Ok(delegation)
    }

    /// Takes effect for every evaluation made after it returns, including
    /// evaluations of steps that are already pending.
    pub fn remove_delegation(
        &mut self,
        delegation_id: &DelegationId,
    ) -> Result<Delegation, DelegationError> {
        for delegations in self.by_step.values_mut() {
            if let Some(index) =
                delegations.iter().position(|delegation| &delegation.id == delegation_id)
            {
                return Ok(delegations.remove(index));
            }
        }
        Err(DelegationError::UnknownDelegation(delegation_id.clone()))
    }

    pub fn active_delegation(
        &self,
        setup_id: &SetupId,
        step_order: u32,
        as_of: DateTime<Utc>,
    ) -> Option<&Delegation> {
        let date = as_of.date_naive();
        self.by_step
            .get(&(setup_id.clone(), step_order))
            .and_then(|delegations| delegations.iter().find(|delegation| delegation.covers(date)))
    }

    /// Who holds the primary seat of `step` at `as_of`: the active delegate if
    /// one exists, otherwise the step's primary approver.
    pub fn effective_actor(
        &self,
        setup_id: &SetupId,
        step: &ResolvedStep,
        as_of: DateTime<Utc>,
    ) -> (EmployeeId, ActingAs) {
        match self.active_delegation(setup_id, step.order, as_of) {
            Some(delegation) => (delegation.delegate_id.clone(), ActingAs::Delegate),
            None => (step.primary_approver_id.clone(), ActingAs::Primary),
        }
    }

    pub fn delegations_for_step(
        &self,
        setup_id: &SetupId,
        step_order: u32,
        as_of: NaiveDate,
    ) -> Vec<(Delegation, DelegationPhase)> {
        self.by_step
            .get(&(setup_id.clone(), step_order))
            .map(|delegations| {
                delegations
                    .iter()
                    .map(|delegation| (delegation.clone(), delegation.phase(as_of)))
                    .collect()
            })
            .unwrap_or_default()
    }
}
