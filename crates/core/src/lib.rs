pub mod approvals;
pub mod audit;
pub mod config;
pub mod delegation;
pub mod domain;
pub mod errors;
pub mod escalation;
pub mod flows;
pub mod notify;
pub mod registry;
pub mod scope;
pub mod workflow;

pub use approvals::{Actor, DecisionError, RequiredActors, StepResolver};
pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use config::{AppConfig, ConfigError, LoadOptions};
pub use delegation::{DelegationError, DelegationLedger};
pub use domain::delegation::{Delegation, DelegationId, NewDelegation};
pub use domain::instance::{
    ActingAs, Decision, DecisionOutcome, InstanceId, InstanceStatus, WorkflowInstance,
};
pub use domain::org::{Employee, EmployeeId, UnitScope, UnitType};
pub use domain::setup::{ApprovalSetup, ApproverRef, SetupId, SetupSnapshot, Step, StepKind};
pub use errors::{ErrorClass, InterfaceError, WorkflowError};
pub use escalation::EscalationScheduler;
pub use flows::{TransitionError, TransitionOutcome, WorkflowEngine};
pub use notify::{InMemoryNotificationDispatcher, NotificationDispatcher, TracingNotificationDispatcher};
pub use registry::{RegistryError, SetupDraft, SetupRegistry};
pub use scope::{InMemoryOrgDirectory, OrgDirectory, ScopeError, ScopeResolver};
pub use workflow::{FiredTimer, TimerOutcome, WorkflowService};
