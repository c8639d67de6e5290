//! Organizational scope resolution.
//!
//! Binds a setup's stored steps to concrete employees using the current
//! org directory, and enforces that no two active setups claim the same
//! employee for the same feature on overlapping dates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::warn;

use crate::config::WorkflowConfig;
use crate::domain::org::{normalize_key, Employee, EmployeeId, UnitScope};
use crate::domain::setup::{
    ApprovalSetup, ApproverRef, ResolvedStep, SetupId, Step, StepKind, StepSource,
};

/// Read-only view of the organization. Implementations are expected to serve
/// from already-loaded data; the resolver never retries or blocks on them.
pub trait OrgDirectory: Send + Sync {
    fn employee(&self, employee_id: &EmployeeId) -> Option<Employee>;
    /// Every current holder of `role` in `unit`, in any order.
    fn unit_role_holders(&self, unit: &UnitScope, role: &str) -> Vec<EmployeeId>;
    fn unit_members(&self, unit: &UnitScope) -> Vec<EmployeeId>;
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("unit `{unit}` has no current holder of role `{role}`")]
    UnresolvedUnitRole { unit: UnitScope, role: String },
    #[error("step {step_order} approver `{employee_id}` is not an active employee")]
    UnresolvedApprover { step_order: u32, employee_id: EmployeeId },
    #[error("step {step_order} resolves `{employee_id}` as both primary and co-approver")]
    CoApproverIsPrimary { step_order: u32, employee_id: EmployeeId },
    #[error("step {step_order} references role `{role}` but the setup has no unit scope")]
    MissingScope { step_order: u32, role: String },
    #[error(
        "setup `{setup_id}` overlaps active setup `{conflicting_setup_id}` for feature `{feature}`"
    )]
    OverlappingSetup { setup_id: SetupId, conflicting_setup_id: SetupId, feature: String },
}

#[derive(Clone, Debug)]
pub struct ScopeResolver {
    chain_roles: Vec<String>,
}

impl ScopeResolver {
    pub fn new(chain_roles: Vec<String>) -> Self {
        Self { chain_roles }
    }

    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self::new(vec![config.lead_role.clone(), config.manager_role.clone()])
    }

    /// Leadership chain given to a unit-scoped setup published without steps.
    pub fn default_chain(&self) -> Vec<Step> {
        self.chain_roles
            .iter()
            .enumerate()
            .map(|(index, role)| {
                let order = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
                Step::new(order, StepKind::Approval, ApproverRef::unit_role(role.clone()))
            })
            .collect()
    }

    /// Resolves every stored step of `setup` against the directory as it is
    /// now. Called afresh for each submission; never cached.
    pub fn resolve_steps<O>(
        &self,
        setup: &ApprovalSetup,
        org: &O,
    ) -> Result<Vec<ResolvedStep>, ScopeError>
    where
        O: OrgDirectory + ?Sized,
    {
        setup.steps.iter().map(|step| self.resolve_step(setup, step, org)).collect()
    }

    fn resolve_step<O>(
        &self,
        setup: &ApprovalSetup,
        step: &Step,
        org: &O,
    ) -> Result<ResolvedStep, ScopeError>
    where
        O: OrgDirectory + ?Sized,
    {
        let (primary_approver_id, source) = match &step.primary {
            ApproverRef::Employee { employee_id } => {
                require_active(org, step.order, employee_id)?;
                (employee_id.clone(), StepSource::Explicit)
            }
            ApproverRef::UnitRole { role } => {
                let unit = setup.scope.as_ref().ok_or_else(|| ScopeError::MissingScope {
                    step_order: step.order,
                    role: role.clone(),
                })?;
                (role_holder(org, unit, role)?, StepSource::UnitDerived)
            }
        };

        if let Some(co_approver_id) = &step.co_approver_id {
            require_active(org, step.order, co_approver_id)?;
            if co_approver_id == &primary_approver_id {
                return Err(ScopeError::CoApproverIsPrimary {
                    step_order: step.order,
                    employee_id: primary_approver_id,
                });
            }
        }

        Ok(ResolvedStep {
            order: step.order,
            kind: step.kind,
            primary_approver_id,
            co_approver_id: step.co_approver_id.clone(),
            require_both: step.require_both,
            source,
        })
    }

    /// Whether `setup` governs requests submitted by `employee_id`.
    pub fn binds<O>(&self, setup: &ApprovalSetup, employee_id: &EmployeeId, org: &O) -> bool
    where
        O: OrgDirectory + ?Sized,
    {
        match &setup.scope {
            None => true,
            Some(scope) => {
                org.employee(employee_id).map(|employee| employee.belongs_to(scope)).unwrap_or(false)
            }
        }
    }

    /// Rejects `candidate` if it would claim an employee already claimed by
    /// another active setup for the same feature on an overlapping date.
    pub fn check_activation<O>(
        &self,
        candidate: &ApprovalSetup,
        active: &[Arc<ApprovalSetup>],
        org: &O,
    ) -> Result<(), ScopeError>
    where
        O: OrgDirectory + ?Sized,
    {
        let feature = normalize_key(&candidate.feature);
        let conflict = active
            .iter()
            .filter(|other| other.id != candidate.id)
            .filter(|other| normalize_key(&other.feature) == feature)
            .filter(|other| candidate.window_overlaps(other))
            .find(|other| coverage_overlaps(candidate, other, org));

        match conflict {
            Some(other) => Err(ScopeError::OverlappingSetup {
                setup_id: candidate.id.clone(),
                conflicting_setup_id: other.id.clone(),
                feature: candidate.feature.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn coverage_overlaps<O>(left: &ApprovalSetup, right: &ApprovalSetup, org: &O) -> bool
where
    O: OrgDirectory + ?Sized,
{
    let (Some(left_scope), Some(right_scope)) = (&left.scope, &right.scope) else {
        return true;
    };
    if left_scope.same_unit(right_scope) {
        return true;
    }

    let left_members: BTreeSet<EmployeeId> = org.unit_members(left_scope).into_iter().collect();
    org.unit_members(right_scope).iter().any(|member| left_members.contains(member))
}

pub(crate) fn require_active<O>(
    org: &O,
    step_order: u32,
    employee_id: &EmployeeId,
) -> Result<(), ScopeError>
where
    O: OrgDirectory + ?Sized,
{
    match org.employee(employee_id) {
        Some(employee) if employee.active => Ok(()),
        _ => Err(ScopeError::UnresolvedApprover { step_order, employee_id: employee_id.clone() }),
    }
}

fn role_holder<O>(org: &O, unit: &UnitScope, role: &str) -> Result<EmployeeId, ScopeError>
where
    O: OrgDirectory + ?Sized,
{
    let mut holders: Vec<EmployeeId> = org
        .unit_role_holders(unit, role)
        .into_iter()
        .filter(|holder| org.employee(holder).map(|employee| employee.active).unwrap_or(false))
        .collect();
    holders.sort();
    holders.dedup();

    let Some(selected) = holders.first().cloned() else {
        return Err(ScopeError::UnresolvedUnitRole { unit: unit.clone(), role: role.to_string() });
    };

    if holders.len() > 1 {
        warn!(
            event_name = "scope.role_tie_break",
            unit = %unit,
            role,
            selected = %selected,
            candidates = holders.len(),
            "multiple holders of a unit role; picking the smallest employee id"
        );
    }

    Ok(selected)
}

#[derive(Clone, Debug, Default)]
struct DirectoryState {
    employees: BTreeMap<EmployeeId, Employee>,
    roles: Vec<RoleAssignment>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct RoleAssignment {
    unit: UnitScope,
    role: String,
    employee_id: EmployeeId,
}

/// Directory backed by shared in-process state. Clones see the same data,
/// so a test or adapter can change role holders while a service holds it.
#[derive(Clone, Debug, Default)]
pub struct InMemoryOrgDirectory {
    state: Arc<RwLock<DirectoryState>>,
}

impl InMemoryOrgDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_employee(&self, employee: Employee) {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.employees.insert(employee.id.clone(), employee);
    }

    pub fn set_active(&self, employee_id: &EmployeeId, active: bool) {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(employee) = state.employees.get_mut(employee_id) {
            employee.active = active;
        }
    }

    pub fn assign_role(&self, unit: UnitScope, role: impl Into<String>, employee_id: EmployeeId) {
        let assignment = RoleAssignment { unit, role: role.into(), employee_id };
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.roles.contains(&assignment) {
            state.roles.push(assignment);
        }
    }

    pub fn revoke_role(&self, unit: &UnitScope, role: &str, employee_id: &EmployeeId) {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.roles.retain(|assignment| {
            !(assignment.unit.same_unit(unit)
                && normalize_key(&assignment.role) == normalize_key(role)
                && &assignment.employee_id == employee_id)
        });
    }

    fn read(&self) -> DirectoryState {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl OrgDirectory for InMemoryOrgDirectory {
    fn employee(&self, employee_id: &EmployeeId) -> Option<Employee> {
        self.read().employees.get(employee_id).cloned()
    }

    fn unit_role_holders(&self, unit: &UnitScope, role: &str) -> Vec<EmployeeId> {
        let role = normalize_key(role);
        self.read()
            .roles
            .into_iter()
            .filter(|assignment| {
                assignment.unit.same_unit(unit) && normalize_key(&assignment.role) == role
            })
            .map(|assignment| assignment.employee_id)
            .collect()
    }

    fn unit_members(&self, unit: &UnitScope) -> Vec<EmployeeId> {
        self.read()
            .employees
            .into_values()
            .filter(|employee| employee.belongs_to(unit))
            .map(|employee| employee.id)
            .collect()
    }
}
