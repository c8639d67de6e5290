use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmployeeId(pub String);

impl EmployeeId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmployeeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    Department,
    Team,
    Division,
}

impl UnitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Department => "department",
            Self::Team => "team",
            Self::Division => "division",
        }
    }
}

/// An organizational unit a setup can be scoped to, e.g. `team/it-support`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitScope {
    pub unit_type: UnitType,
    pub unit_target: String,
}

impl UnitScope {
    pub fn new(unit_type: UnitType, unit_target: impl Into<String>) -> Self {
        Self { unit_type, unit_target: unit_target.into() }
    }

    pub fn same_unit(&self, other: &UnitScope) -> bool {
        self.unit_type == other.unit_type
            && normalize_key(&self.unit_target) == normalize_key(&other.unit_target)
    }

    pub fn matches_target(&self, target: &str) -> bool {
        normalize_key(&self.unit_target) == normalize_key(target)
    }
}

impl fmt::Display for UnitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.unit_type.as_str(), self.unit_target)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: EmployeeId,
    pub name: String,
    pub active: bool,
    pub department: Option<String>,
    pub team: Option<String>,
    pub division: Option<String>,
    pub manager_id: Option<EmployeeId>,
}

impl Employee {
    pub fn unit(&self, unit_type: UnitType) -> Option<&str> {
        match unit_type {
            UnitType::Department => self.department.as_deref(),
            UnitType::Team => self.team.as_deref(),
            UnitType::Division => self.division.as_deref(),
        }
    }

    pub fn belongs_to(&self, scope: &UnitScope) -> bool {
        self.unit(scope.unit_type).map(|target| scope.matches_target(target)).unwrap_or(false)
    }
}

pub(crate) fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
