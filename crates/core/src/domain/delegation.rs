use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::org::EmployeeId;
use crate::domain::setup::SetupId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DelegationId(pub String);

impl fmt::Display for DelegationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationPhase {
    Future,
    Active,
    Expired,
}

/// Time-windowed substitution of a step's primary approver. Both window ends
/// are inclusive calendar dates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub id: DelegationId,
    pub setup_id: SetupId,
    pub step_order: u32,
    pub delegate_id: EmployeeId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub created_by: EmployeeId,
    pub created_at: DateTime<Utc>,
}

impl Delegation {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }

    pub fn overlaps(&self, start_date: NaiveDate, end_date: NaiveDate) -> bool {
        self.start_date <= end_date && start_date <= self.end_date
    }

    pub fn phase(&self, date: NaiveDate) -> DelegationPhase {
        if date < self.start_date {
            DelegationPhase::Future
        } else if date > self.end_date {
            DelegationPhase::Expired
        } else {
            DelegationPhase::Active
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDelegation {
    pub setup_id: SetupId,
    pub step_order: u32,
    pub delegate_id: EmployeeId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub created_by: EmployeeId,
}
