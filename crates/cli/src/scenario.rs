//! Scenario files: org fixtures, setups and a scripted list of operations
//! replayed against a `WorkflowService`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use signoff_core::config::AppConfig;
use signoff_core::domain::instance::InstanceSummary;
use signoff_core::notify::Notification;
use signoff_core::{
    ApproverRef, DecisionOutcome, DelegationId, Employee, EmployeeId, FiredTimer,
    InMemoryNotificationDispatcher, InMemoryOrgDirectory, InstanceId, InstanceStatus,
    NewDelegation, SetupDraft, SetupId, Step, StepKind, TimerOutcome, TracingAuditSink, UnitScope,
    UnitType, WorkflowError, WorkflowService,
};
use thiserror::Error;

pub type ScenarioService =
    WorkflowService<InMemoryOrgDirectory, InMemoryNotificationDispatcher, TracingAuditSink>;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("could not read scenario `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("could not parse scenario `{path}`: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("step {order} of setup `{setup_id}` needs exactly one of `approver` or `role`")]
    InvalidStep { setup_id: String, order: u32 },
    #[error("alias `{0}` is already bound to an instance")]
    DuplicateAlias(String),
    #[error("no instance was submitted under alias `{0}`")]
    UnknownAlias(String),
    #[error("no delegation was created under label `{0}`")]
    UnknownLabel(String),
    #[error("the wall clock cannot be advanced")]
    FixedClock,
    #[error("`{alias}` expected {expected}, found {actual}")]
    ExpectationFailed { alias: String, expected: String, actual: String },
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

impl ScenarioError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Read { .. } => "scenario_read",
            Self::Parse { .. } => "scenario_parse",
            Self::InvalidStep { .. } => "invalid_step",
            Self::DuplicateAlias(_) => "duplicate_alias",
            Self::UnknownAlias(_) => "unknown_alias",
            Self::UnknownLabel(_) => "unknown_label",
            Self::FixedClock => "fixed_clock",
            Self::ExpectationFailed { .. } => "expectation_failed",
            Self::Workflow(error) => error.code(),
        }
    }

    pub fn class(&self) -> &'static str {
        match self {
            Self::Workflow(error) => error.class().as_str(),
            _ => "scenario",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub employees: Vec<EmployeeFixture>,
    #[serde(default)]
    pub roles: Vec<RoleFixture>,
    #[serde(default)]
    pub setups: Vec<SetupFixture>,
    #[serde(default)]
    pub delegations: Vec<DelegationFixture>,
    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
}

impl Scenario {
    pub fn from_path(path: &Path) -> Result<Self, ScenarioError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| ScenarioError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&raw)
            .map_err(|source| ScenarioError::Parse { path: path.to_path_buf(), source })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct EmployeeFixture {
    pub id: EmployeeId,
    pub name: String,
    #[serde(default = "active_by_default")]
    pub active: bool,
    pub department: Option<String>,
    pub team: Option<String>,
    pub division: Option<String>,
    pub manager_id: Option<EmployeeId>,
}

fn active_by_default() -> bool {
    true
}

impl From<&EmployeeFixture> for Employee {
    fn from(fixture: &EmployeeFixture) -> Self {
        Employee {
            id: fixture.id.clone(),
            name: fixture.name.clone(),
            active: fixture.active,
            department: fixture.department.clone(),
            team: fixture.team.clone(),
            division: fixture.division.clone(),
            manager_id: fixture.manager_id.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoleFixture {
    pub unit_type: UnitType,
    pub unit_target: String,
    pub role: String,
    pub employee_id: EmployeeId,
}

impl RoleFixture {
    fn unit(&self) -> UnitScope {
        UnitScope::new(self.unit_type, self.unit_target.clone())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SetupFixture {
    pub id: SetupId,
    pub name: String,
    pub feature: String,
    #[serde(default)]
    pub auto_reject_days: u32,
    pub unit_type: Option<UnitType>,
    pub unit_target: Option<String>,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
    #[serde(default)]
    pub activate: bool,
    #[serde(default)]
    pub steps: Vec<StepFixture>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StepFixture {
    pub order: u32,
    #[serde(default = "approval_step")]
    pub kind: StepKind,
    pub approver: Option<EmployeeId>,
    pub role: Option<String>,
    pub co_approver_id: Option<EmployeeId>,
}

fn approval_step() -> StepKind {
    StepKind::Approval
}

impl SetupFixture {
    pub fn to_draft(&self) -> Result<SetupDraft, ScenarioError> {
        let scope = match (self.unit_type, &self.unit_target) {
            (Some(unit_type), Some(target)) => Some(UnitScope::new(unit_type, target.clone())),
            _ => None,
        };
        let steps = self
            .steps
            .iter()
            .map(|fixture| {
                let primary = match (&fixture.approver, &fixture.role) {
                    (Some(employee_id), None) => ApproverRef::Employee { employee_id: employee_id.clone() },
                    (None, Some(role)) => ApproverRef::unit_role(role.clone()),
                    _ => {
                        return Err(ScenarioError::InvalidStep {
                            setup_id: self.id.0.clone(),
                            order: fixture.order,
                        })
                    }
                };
                let step = Step::new(fixture.order, fixture.kind, primary);
                Ok(match &fixture.co_approver_id {
                    Some(co_approver_id) => step.with_co_approver(co_approver_id.clone()),
                    None => step,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SetupDraft {
            id: self.id.clone(),
            name: self.name.clone(),
            feature: self.feature.clone(),
            auto_reject_days: self.auto_reject_days,
            scope,
            effective_from: self.effective_from,
            effective_to: self.effective_to,
            steps,
        })
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DelegationFixture {
    pub label: String,
    pub setup_id: SetupId,
    pub step_order: u32,
    pub delegate_id: EmployeeId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default = "admin")]
    pub created_by: EmployeeId,
}

fn admin() -> EmployeeId {
    EmployeeId::new("admin")
}

impl DelegationFixture {
    fn to_request(&self) -> NewDelegation {
        NewDelegation {
            setup_id: self.setup_id.clone(),
            step_order: self.step_order,
            delegate_id: self.delegate_id.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            created_by: self.created_by.clone(),
        }
    }
}

/// One scripted operation. `expect` is `"ok"` or the error code the step
/// should fail with.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ScenarioStep {
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default)]
    pub expect: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    Submit {
        alias: String,
        feature: String,
        submitter_id: EmployeeId,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Decide {
        alias: String,
        actor_id: EmployeeId,
        outcome: DecisionOutcome,
        #[serde(default)]
        step_order: Option<u32>,
    },
    Cancel {
        alias: String,
        by: EmployeeId,
    },
    Delegate(DelegationFixture),
    Undelegate {
        label: String,
    },
    SetCoApprover {
        setup_id: SetupId,
        step_order: u32,
        employee_id: EmployeeId,
    },
    ClearCoApprover {
        setup_id: SetupId,
        step_order: u32,
    },
    Activate {
        setup_id: SetupId,
    },
    Deactivate {
        setup_id: SetupId,
    },
    AssignRole(RoleFixture),
    RevokeRole(RoleFixture),
    AdvanceClock {
        #[serde(default)]
        days: i64,
        #[serde(default)]
        hours: i64,
    },
    Sweep,
    Check {
        alias: String,
        #[serde(default)]
        status: Option<InstanceStatus>,
        #[serde(default)]
        step_order: Option<u32>,
    },
}

impl StepAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Submit { .. } => "submit",
            Self::Decide { .. } => "decide",
            Self::Cancel { .. } => "cancel",
            Self::Delegate(_) => "delegate",
            Self::Undelegate { .. } => "undelegate",
            Self::SetCoApprover { .. } => "set_co_approver",
            Self::ClearCoApprover { .. } => "clear_co_approver",
            Self::Activate { .. } => "activate",
            Self::Deactivate { .. } => "deactivate",
            Self::AssignRole(_) => "assign_role",
            Self::RevokeRole(_) => "revoke_role",
            Self::AdvanceClock { .. } => "advance_clock",
            Self::Sweep => "sweep",
            Self::Check { .. } => "check",
        }
    }

    fn alias(&self) -> Option<&str> {
        match self {
            Self::Submit { alias, .. }
            | Self::Decide { alias, .. }
            | Self::Cancel { alias, .. }
            | Self::Check { alias, .. } => Some(alias),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Clock {
    Virtual(DateTime<Utc>),
    Wall,
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::Virtual(now) => *now,
            Self::Wall => Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub action: &'static str,
    pub at: DateTime<Utc>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fired: Vec<FiredTimer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    pub expectation_met: bool,
}

impl StepReport {
    /// Report for input that never parsed into a step.
    pub fn invalid(index: usize, at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            index,
            action: "invalid",
            at,
            status: "error",
            alias: None,
            error_class: Some("scenario"),
            code: Some("invalid_command"),
            message: message.into(),
            instance: None,
            fired: Vec::new(),
            expected: None,
            expectation_met: false,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct InstanceReport {
    pub alias: String,
    pub summary: InstanceSummary,
    pub replay_matches: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct NotificationReport {
    pub alias: Option<String>,
    #[serde(flatten)]
    pub notification: Notification,
}

struct Applied {
    message: String,
    instance: Option<InstanceId>,
    fired: Vec<FiredTimer>,
}

impl Applied {
    fn message(message: impl Into<String>) -> Self {
        Self { message: message.into(), instance: None, fired: Vec::new() }
    }
}

/// A loaded scenario: the service with fixtures applied, plus the alias
/// tables that let scripted steps name instances and delegations.
pub struct Session {
    service: Arc<ScenarioService>,
    org: InMemoryOrgDirectory,
    notifier: InMemoryNotificationDispatcher,
    clock: Clock,
    instances: BTreeMap<String, InstanceId>,
    delegations: BTreeMap<String, DelegationId>,
}

impl Session {
    /// Loads fixtures at `scenario.start` and keeps a virtual clock.
    pub fn simulated(scenario: &Scenario, config: &AppConfig) -> Result<Self, ScenarioError> {
        Self::load(scenario, config, Clock::Virtual(scenario.start))
    }

    /// Loads fixtures at `scenario.start`, then follows the wall clock.
    pub fn live(scenario: &Scenario, config: &AppConfig) -> Result<Self, ScenarioError> {
        Self::load(scenario, config, Clock::Wall)
    }

    fn load(scenario: &Scenario, config: &AppConfig, clock: Clock) -> Result<Self, ScenarioError> {
        let org = InMemoryOrgDirectory::new();
        for employee in &scenario.employees {
            org.upsert_employee(Employee::from(employee));
        }
        for role in &scenario.roles {
            org.assign_role(role.unit(), role.role.clone(), role.employee_id.clone());
        }

        let notifier = InMemoryNotificationDispatcher::default();
        let service = Arc::new(WorkflowService::from_config(
            config,
            org.clone(),
            notifier.clone(),
            TracingAuditSink,
        ));

        for setup in &scenario.setups {
            service.publish_setup(setup.to_draft()?, scenario.start)?;
            if setup.activate {
                service.activate_setup(&setup.id, scenario.start)?;
            }
        }

        let mut delegations = BTreeMap::new();
        for fixture in &scenario.delegations {
            let created = service.create_delegation(fixture.to_request(), scenario.start)?;
            delegations.insert(fixture.label.clone(), created.id);
        }

        Ok(Self { service, org, notifier, clock, instances: BTreeMap::new(), delegations })
    }

    pub fn service(&self) -> Arc<ScenarioService> {
        Arc::clone(&self.service)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn instance_id(&self, alias: &str) -> Option<&InstanceId> {
        self.instances.get(alias)
    }

    pub fn apply(&mut self, index: usize, step: &ScenarioStep) -> StepReport {
        let at = self.now();
        let result = self.execute(&step.action);
        let at = match &step.action {
            StepAction::AdvanceClock { .. } => self.now(),
            _ => at,
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(error) => error.code(),
        };
        let expectation_met = step.expect.as_deref().map(|expected| expected == outcome).unwrap_or(true);
        let alias = step.action.alias().map(str::to_string);

        match result {
            Ok(applied) => StepReport {
                index,
                action: step.action.name(),
                at,
                status: "ok",
                alias,
                error_class: None,
                code: None,
                message: applied.message,
                instance: applied
                    .instance
                    .and_then(|instance_id| self.service.instance(&instance_id).ok())
                    .map(|instance| instance.summary()),
                fired: applied.fired,
                expected: step.expect.clone(),
                expectation_met,
            },
            Err(error) => StepReport {
                index,
                action: step.action.name(),
                at,
                status: "error",
                alias,
                error_class: Some(error.class()),
                code: Some(error.code()),
                message: error.to_string(),
                instance: None,
                fired: Vec::new(),
                expected: step.expect.clone(),
                expectation_met,
            },
        }
    }

    fn execute(&mut self, action: &StepAction) -> Result<Applied, ScenarioError> {
        let now = self.now();
        match action {
            StepAction::Submit { alias, feature, submitter_id, payload } => {
                if self.instances.contains_key(alias) {
                    return Err(ScenarioError::DuplicateAlias(alias.clone()));
                }
                let instance_id = self.service.submit(feature, submitter_id, payload.clone(), now)?;
                self.instances.insert(alias.clone(), instance_id.clone());
                let instance = self.service.instance(&instance_id)?;
                Ok(Applied {
                    message: format!("{alias} submitted against {}", instance.snapshot_id()),
                    instance: Some(instance_id),
                    fired: Vec::new(),
                })
            }
            StepAction::Decide { alias, actor_id, outcome, step_order } => {
                let instance_id = self.resolve(alias)?;
                let transition = match step_order {
                    Some(step_order) => {
                        self.service.decide_step(&instance_id, *step_order, actor_id, *outcome, now)?
                    }
                    None => self.service.decide(&instance_id, actor_id, *outcome, now)?,
                };
                let mut message = format!(
                    "{actor_id} {} step {}; {alias} is {} at step {}",
                    match outcome {
                        DecisionOutcome::Approve => "approved",
                        DecisionOutcome::Reject => "rejected",
                    },
                    transition.from.step_order,
                    transition.to.status.as_str(),
                    transition.to.step_order
                );
                if !transition.moot.is_empty() {
                    let moot: Vec<&str> = transition.moot.iter().map(EmployeeId::as_str).collect();
                    message.push_str(&format!(" (moot: {})", moot.join(", ")));
                }
                Ok(Applied { message, instance: Some(instance_id), fired: Vec::new() })
            }
            StepAction::Cancel { alias, by } => {
                let instance_id = self.resolve(alias)?;
                self.service.cancel(&instance_id, by, now)?;
                Ok(Applied {
                    message: format!("{alias} cancelled by {by}"),
                    instance: Some(instance_id),
                    fired: Vec::new(),
                })
            }
            StepAction::Delegate(fixture) => {
                let created = self.service.create_delegation(fixture.to_request(), now)?;
                self.delegations.insert(fixture.label.clone(), created.id.clone());
                Ok(Applied::message(format!(
                    "{} delegated step {} of {} to {} from {} to {}",
                    fixture.label,
                    created.step_order,
                    created.setup_id,
                    created.delegate_id,
                    created.start_date,
                    created.end_date
                )))
            }
            StepAction::Undelegate { label } => {
                let delegation_id = self
                    .delegations
                    .get(label)
                    .cloned()
                    .ok_or_else(|| ScenarioError::UnknownLabel(label.clone()))?;
                self.service.remove_delegation(&delegation_id, now)?;
                self.delegations.remove(label);
                Ok(Applied::message(format!("{label} removed")))
            }
            StepAction::SetCoApprover { setup_id, step_order, employee_id } => {
                let setup = self.service.set_co_approver(setup_id, *step_order, employee_id.clone(), now)?;
                Ok(Applied::message(format!(
                    "{employee_id} co-approves step {step_order} of {setup_id} from v{}",
                    setup.version
                )))
            }
            StepAction::ClearCoApprover { setup_id, step_order } => {
                let setup = self.service.clear_co_approver(setup_id, *step_order, now)?;
                Ok(Applied::message(format!(
                    "step {step_order} of {setup_id} is single-approver from v{}",
                    setup.version
                )))
            }
            StepAction::Activate { setup_id } => {
                self.service.activate_setup(setup_id, now)?;
                Ok(Applied::message(format!("{setup_id} activated")))
            }
            StepAction::Deactivate { setup_id } => {
                self.service.deactivate_setup(setup_id, now)?;
                Ok(Applied::message(format!("{setup_id} deactivated")))
            }
            StepAction::AssignRole(role) => {
                self.org.assign_role(role.unit(), role.role.clone(), role.employee_id.clone());
                Ok(Applied::message(format!("{} holds {} of {}", role.employee_id, role.role, role.unit())))
            }
            StepAction::RevokeRole(role) => {
                self.org.revoke_role(&role.unit(), &role.role, &role.employee_id);
                Ok(Applied::message(format!(
                    "{} no longer holds {} of {}",
                    role.employee_id,
                    role.role,
                    role.unit()
                )))
            }
            StepAction::AdvanceClock { days, hours } => {
                let Clock::Virtual(current) = self.clock else {
                    return Err(ScenarioError::FixedClock);
                };
                let next = current + Duration::days(*days) + Duration::hours(*hours);
                self.clock = Clock::Virtual(next);
                let fired = self.service.fire_due_timers(next);
                Ok(Applied { message: self.sweep_message(&fired, next), instance: None, fired })
            }
            StepAction::Sweep => {
                let fired = self.service.fire_due_timers(now);
                Ok(Applied { message: self.sweep_message(&fired, now), instance: None, fired })
            }
            StepAction::Check { alias, status, step_order } => {
                let instance_id = self.resolve(alias)?;
                let instance = self.service.instance(&instance_id)?;
                if let Some(expected) = status {
                    if instance.status() != *expected {
                        return Err(ScenarioError::ExpectationFailed {
                            alias: alias.clone(),
                            expected: expected.as_str().to_string(),
                            actual: instance.status().as_str().to_string(),
                        });
                    }
                }
                if let Some(expected) = step_order {
                    if instance.current_step_order() != *expected {
                        return Err(ScenarioError::ExpectationFailed {
                            alias: alias.clone(),
                            expected: format!("step {expected}"),
                            actual: format!("step {}", instance.current_step_order()),
                        });
                    }
                }
                Ok(Applied {
                    message: format!(
                        "{alias} is {} at step {}",
                        instance.status().as_str(),
                        instance.current_step_order()
                    ),
                    instance: Some(instance_id),
                    fired: Vec::new(),
                })
            }
        }
    }

    fn sweep_message(&self, fired: &[FiredTimer], now: DateTime<Utc>) -> String {
        let rejected: Vec<String> = fired
            .iter()
            .filter(|timer| timer.outcome == TimerOutcome::AutoRejected)
            .map(|timer| self.alias_of(&timer.instance_id).unwrap_or_else(|| timer.instance_id.0.clone()))
            .collect();
        if rejected.is_empty() {
            format!("clock at {now}; no step overdue")
        } else {
            format!("clock at {now}; auto-rejected {}", rejected.join(", "))
        }
    }

    fn resolve(&self, alias: &str) -> Result<InstanceId, ScenarioError> {
        self.instances.get(alias).cloned().ok_or_else(|| ScenarioError::UnknownAlias(alias.to_string()))
    }

    fn alias_of(&self, instance_id: &InstanceId) -> Option<String> {
        self.instances
            .iter()
            .find(|(_, candidate)| *candidate == instance_id)
            .map(|(alias, _)| alias.clone())
    }

    pub fn instance_reports(&self) -> Vec<InstanceReport> {
        self.instances
            .iter()
            .filter_map(|(alias, instance_id)| {
                let instance = self.service.instance(instance_id).ok()?;
                let replay_matches =
                    self.service.replay(instance_id).map(|rebuilt| rebuilt == instance).unwrap_or(false);
                Some(InstanceReport { alias: alias.clone(), summary: instance.summary(), replay_matches })
            })
            .collect()
    }

    pub fn notification_reports(&self) -> Vec<NotificationReport> {
        self.notifier
            .notifications()
            .into_iter()
            .map(|notification| NotificationReport {
                alias: self.alias_of(notification.instance_id()),
                notification,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use signoff_core::config::AppConfig;
    use signoff_core::InstanceStatus;

    use super::{Scenario, ScenarioStep, Session, StepAction};

    const SCENARIO: &str = r#"
name = "desk leave"
start = "2026-03-02T09:00:00Z"

[[employees]]
id = "e-sarah"
name = "Sarah"
team = "service-desk"

[[employees]]
id = "e-alex"
name = "Alex"
team = "service-desk"

[[employees]]
id = "e-jo"
name = "Jo"
team = "service-desk"

[[roles]]
unit_type = "team"
unit_target = "service-desk"
role = "Lead"
employee_id = "e-sarah"

[[roles]]
unit_type = "team"
unit_target = "service-desk"
role = "Manager"
employee_id = "e-alex"

[[setups]]
id = "desk-leave"
name = "Desk Leave"
feature = "leave"
auto_reject_days = 2
unit_type = "team"
unit_target = "service-desk"
effective_from = "2026-01-01"
activate = true

[[steps]]
action = "submit"
alias = "I1"
feature = "leave"
submitter_id = "e-jo"
expect = "ok"

[[steps]]
action = "decide"
alias = "I1"
actor_id = "e-alex"
outcome = "approve"
expect = "not_authorized"

[[steps]]
action = "advance_clock"
days = 3

[[steps]]
action = "check"
alias = "I1"
status = "auto_rejected"
"#;

    fn scenario() -> Scenario {
        toml::from_str(SCENARIO).expect("scenario parses")
    }

    #[test]
    fn scripted_steps_run_against_a_virtual_clock() {
        let scenario = scenario();
        let mut session = Session::simulated(&scenario, &AppConfig::default()).expect("fixtures load");

        let reports: Vec<_> = scenario
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| session.apply(index + 1, step))
            .collect();

        assert!(reports.iter().all(|report| report.expectation_met), "{reports:#?}");
        assert_eq!(reports[1].code, Some("not_authorized"));
        assert_eq!(reports[2].fired.len(), 1);

        let instances = session.instance_reports();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].summary.status, InstanceStatus::AutoRejected);
        assert!(instances[0].replay_matches);
    }

    #[test]
    fn unknown_alias_is_reported_not_panicked() {
        let mut session = Session::simulated(&scenario(), &AppConfig::default()).expect("fixtures load");
        let step: ScenarioStep = serde_json::from_str(
            r#"{"action":"cancel","alias":"missing","by":"e-jo","expect":"unknown_alias"}"#,
        )
        .expect("step parses");
        assert!(matches!(step.action, StepAction::Cancel { .. }));

        let report = session.apply(1, &step);
        assert_eq!(report.status, "error");
        assert!(report.expectation_met);
    }

    #[test]
    fn wall_clock_sessions_refuse_to_advance() {
        let mut session = Session::live(&scenario(), &AppConfig::default()).expect("fixtures load");
        let step: ScenarioStep =
            serde_json::from_str(r#"{"action":"advance_clock","days":1}"#).expect("step parses");
        assert_eq!(session.apply(1, &step).code, Some("fixed_clock"));
    }
}
