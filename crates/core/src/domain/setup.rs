use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::org::{EmployeeId, UnitScope};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetupId(pub String);

impl fmt::Display for SetupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the frozen setup copy an instance was bound to at submission.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Approval,
    Verification,
}

/// Who holds the primary seat of a stored step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApproverRef {
    Employee { employee_id: EmployeeId },
    UnitRole { role: String },
}

impl ApproverRef {
    pub fn employee(id: impl Into<String>) -> Self {
        Self::Employee { employee_id: EmployeeId::new(id) }
    }

    pub fn unit_role(role: impl Into<String>) -> Self {
        Self::UnitRole { role: role.into() }
    }

    pub fn explicit_employee(&self) -> Option<&EmployeeId> {
        match self {
            Self::Employee { employee_id } => Some(employee_id),
            Self::UnitRole { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub order: u32,
    pub kind: StepKind,
    pub primary: ApproverRef,
    pub co_approver_id: Option<EmployeeId>,
    #[serde(default)]
    pub require_both: bool,
}

impl Step {
    pub fn new(order: u32, kind: StepKind, primary: ApproverRef) -> Self {
        Self { order, kind, primary, co_approver_id: None, require_both: false }
    }

    pub fn with_co_approver(mut self, co_approver_id: EmployeeId) -> Self {
        self.co_approver_id = Some(co_approver_id);
        self.require_both = true;
        self
    }

    pub fn without_co_approver(mut self) -> Self {
        self.co_approver_id = None;
        self.require_both = false;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SetupValidationError {
    #[error("setup name must not be empty")]
    EmptyName,
    #[error("setup feature must not be empty")]
    EmptyFeature,
    #[error("setup without a unit scope must declare explicit steps")]
    MissingSteps,
    #[error("step order must be contiguous from 1: expected {expected}, found {found}")]
    NonContiguousOrder { expected: u32, found: u32 },
    #[error("effective_to {effective_to} is before effective_from {effective_from}")]
    InvertedWindow { effective_from: NaiveDate, effective_to: NaiveDate },
    #[error("step {order} has require_both={require_both} but co-approver presence disagrees")]
    InconsistentDualApproval { order: u32, require_both: bool },
    #[error("step {order} references a unit role but the setup has no unit scope")]
    RoleStepWithoutScope { order: u32 },
    #[error("step {order} names the same employee as primary and co-approver")]
    CoApproverIsPrimary { order: u32 },
}

/// One published version of an approval setup. Never mutated once published;
/// edits produce a new version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSetup {
    pub id: SetupId,
    pub version: u32,
    pub name: String,
    pub feature: String,
    pub auto_reject_days: u32,
    pub scope: Option<UnitScope>,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
    pub steps: Vec<Step>,
    pub published_at: DateTime<Utc>,
}

impl ApprovalSetup {
    pub fn is_effective_on(&self, date: NaiveDate) -> bool {
        date >= self.effective_from && self.effective_to.map(|to| date <= to).unwrap_or(true)
    }

    pub fn window_overlaps(&self, other: &ApprovalSetup) -> bool {
        let starts_before_other_ends =
            other.effective_to.map(|to| self.effective_from <= to).unwrap_or(true);
        let other_starts_before_self_ends =
            self.effective_to.map(|to| other.effective_from <= to).unwrap_or(true);
        starts_before_other_ends && other_starts_before_self_ends
    }

    pub fn step(&self, order: u32) -> Option<&Step> {
        self.steps.iter().find(|step| step.order == order)
    }

    pub fn validate(&self) -> Result<(), SetupValidationError> {
        if self.name.trim().is_empty() {
            return Err(SetupValidationError::EmptyName);
        }
        if self.feature.trim().is_empty() {
            return Err(SetupValidationError::EmptyFeature);
        }
        if let Some(effective_to) = self.effective_to {
            if effective_to < self.effective_from {
                return Err(SetupValidationError::InvertedWindow {
                    effective_from: self.effective_from,
                    effective_to,
                });
            }
        }
        if self.steps.is_empty() {
            return Err(SetupValidationError::MissingSteps);
        }

        for (index, step) in self.steps.iter().enumerate() {
            let expected = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
            if step.order != expected {
                return Err(SetupValidationError::NonContiguousOrder {
                    expected,
                    found: step.order,
                });
            }
            if step.require_both != step.co_approver_id.is_some() {
                return Err(SetupValidationError::InconsistentDualApproval {
                    order: step.order,
                    require_both: step.require_both,
                });
            }
            if matches!(step.primary, ApproverRef::UnitRole { .. }) && self.scope.is_none() {
                return Err(SetupValidationError::RoleStepWithoutScope { order: step.order });
            }
            if step.co_approver_id.is_some()
                && step.co_approver_id.as_ref() == step.primary.explicit_employee()
            {
                return Err(SetupValidationError::CoApproverIsPrimary { order: step.order });
            }
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepSource {
    Explicit,
    UnitDerived,
}

/// A step whose primary approver has been bound to a concrete employee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedStep {
    pub order: u32,
    pub kind: StepKind,
    pub primary_approver_id: EmployeeId,
    pub co_approver_id: Option<EmployeeId>,
    pub require_both: bool,
    pub source: StepSource,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupSnapshot {
    pub id: SnapshotId,
    pub setup_id: SetupId,
    pub version: u32,
    pub name: String,
    pub feature: String,
    pub auto_reject_days: u32,
    pub steps: Vec<ResolvedStep>,
    pub resolved_at: DateTime<Utc>,
    pub fingerprint: String,
}

impl SetupSnapshot {
    pub fn new(
        setup: &ApprovalSetup,
        steps: Vec<ResolvedStep>,
        sequence: u64,
        resolved_at: DateTime<Utc>,
    ) -> Self {
        let fingerprint = fingerprint(setup, &steps);
        Self {
            id: SnapshotId(format!("{}@v{}#{}", setup.id, setup.version, sequence)),
            setup_id: setup.id.clone(),
            version: setup.version,
            name: setup.name.clone(),
            feature: setup.feature.clone(),
            auto_reject_days: setup.auto_reject_days,
            steps,
            resolved_at,
            fingerprint,
        }
    }

    pub fn step(&self, order: u32) -> Option<&ResolvedStep> {
        self.steps.iter().find(|step| step.order == order)
    }

    pub fn last_order(&self) -> u32 {
        self.steps.iter().map(|step| step.order).max().unwrap_or(0)
    }
}

#[derive(Serialize)]
struct FingerprintMaterial<'a> {
    setup_id: &'a SetupId,
    version: u32,
    feature: &'a str,
    auto_reject_days: u32,
    steps: &'a [ResolvedStep],
}

fn fingerprint(setup: &ApprovalSetup, steps: &[ResolvedStep]) -> String {
    let material = FingerprintMaterial {
        setup_id: &setup.id,
        version: setup.version,
        feature: &setup.feature,
        auto_reject_days: setup.auto_reject_days,
        steps,
    };
    let payload = match serde_json::to_vec(&material) {
        Ok(payload) => payload,
        Err(_) => format!("{}@{}", setup.id, setup.version).into_bytes(),
    };
    let mut hasher = Sha256::new();
    hasher.update(&payload);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::{
        ApprovalSetup, ApproverRef, ResolvedStep, SetupId, SetupSnapshot, SetupValidationError,
        Step, StepKind, StepSource,
    };
    use crate::domain::org::{EmployeeId, UnitScope, UnitType};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn setup(steps: Vec<Step>) -> ApprovalSetup {
        ApprovalSetup {
            id: SetupId("it-leave".to_string()),
            version: 1,
            name: "IT Leave Request".to_string(),
            feature: "leave".to_string(),
            auto_reject_days: 7,
            scope: None,
            effective_from: date(2026, 1, 1),
            effective_to: Some(date(2026, 12, 31)),
            steps,
            published_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn contiguous_steps_validate() {
        let setup = setup(vec![
            Step::new(1, StepKind::Approval, ApproverRef::employee("e-sarah")),
            Step::new(2, StepKind::Verification, ApproverRef::employee("e-alex")),
        ]);
        assert_eq!(setup.validate(), Ok(()));
    }

    #[test]
    fn gap_in_step_order_is_rejected() {
        let setup = setup(vec![
            Step::new(1, StepKind::Approval, ApproverRef::employee("e-sarah")),
            Step::new(3, StepKind::Approval, ApproverRef::employee("e-alex")),
        ]);
        assert_eq!(
            setup.validate(),
            Err(SetupValidationError::NonContiguousOrder { expected: 2, found: 3 })
        );
    }

    #[test]
    fn unscoped_setup_without_steps_is_rejected() {
        assert_eq!(setup(Vec::new()).validate(), Err(SetupValidationError::MissingSteps));
    }

    #[test]
    fn role_reference_needs_a_unit_scope() {
        let mut setup = setup(vec![Step::new(1, StepKind::Approval, ApproverRef::unit_role("Lead"))]);
        assert_eq!(setup.validate(), Err(SetupValidationError::RoleStepWithoutScope { order: 1 }));

        setup.scope = Some(UnitScope::new(UnitType::Team, "service-desk"));
        assert_eq!(setup.validate(), Ok(()));
    }

    #[test]
    fn dual_approval_flag_must_match_co_approver() {
        let mut step = Step::new(1, StepKind::Approval, ApproverRef::employee("e-sarah"))
            .with_co_approver(EmployeeId::new("e-kim"));
        step.require_both = false;
        assert_eq!(
            setup(vec![step]).validate(),
            Err(SetupValidationError::InconsistentDualApproval { order: 1, require_both: false })
        );
    }

    #[test]
    fn effectivity_windows_are_inclusive() {
        let first = setup(vec![Step::new(1, StepKind::Approval, ApproverRef::employee("a"))]);
        let mut second = first.clone();
        second.effective_from = date(2026, 12, 31);
        second.effective_to = None;

        assert!(first.is_effective_on(date(2026, 12, 31)));
        assert!(!first.is_effective_on(date(2027, 1, 1)));
        assert!(first.window_overlaps(&second));

        second.effective_from = date(2027, 1, 1);
        assert!(!first.window_overlaps(&second));
    }

    #[test]
    fn snapshot_fingerprint_tracks_resolved_content() {
        let setup = setup(vec![Step::new(1, StepKind::Approval, ApproverRef::employee("a"))]);
        let resolved = |approver: &str| {
            vec![ResolvedStep {
                order: 1,
                kind: StepKind::Approval,
                primary_approver_id: EmployeeId::new(approver),
                co_approver_id: None,
                require_both: false,
                source: StepSource::Explicit,
            }]
        };
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();

        let first = SetupSnapshot::new(&setup, resolved("a"), 1, at);
        let same = SetupSnapshot::new(&setup, resolved("a"), 2, at);
        let other = SetupSnapshot::new(&setup, resolved("b"), 3, at);

        assert_eq!(first.id.0, "it-leave@v1#1");
        assert_eq!(first.fingerprint, same.fingerprint);
        assert_ne!(first.fingerprint, other.fingerprint);
        assert_eq!(first.last_order(), 1);
    }
}
