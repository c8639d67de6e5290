use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::DecisionError;
use crate::delegation::DelegationError;
use crate::domain::instance::InstanceId;
use crate::domain::org::EmployeeId;
use crate::flows::TransitionError;
use crate::registry::RegistryError;
use crate::scope::ScopeError;

/// Coarse grouping callers use to decide how to report a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rejected at write time; nothing was stored.
    Configuration,
    /// Submission aborted before an instance existed.
    Resolution,
    /// Decision refused; instance untouched.
    Authorization,
    /// Lost a race or acted on a finished instance.
    Conflict,
    NotFound,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Resolution => "resolution",
            Self::Authorization => "authorization",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    Delegation(#[from] DelegationError),
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("no active setup governs `{feature}` for `{submitter_id}`")]
    NoActiveSetup { feature: String, submitter_id: EmployeeId },
    #[error("unknown instance `{0}`")]
    UnknownInstance(InstanceId),
}

impl WorkflowError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Registry(error) => registry_class(error),
            Self::Scope(ScopeError::OverlappingSetup { .. }) => ErrorClass::Configuration,
            Self::Scope(_) => ErrorClass::Resolution,
            Self::Delegation(DelegationError::Registry(error)) => registry_class(error),
            Self::Delegation(DelegationError::UnknownDelegation(_)) => ErrorClass::NotFound,
            Self::Delegation(_) => ErrorClass::Configuration,
            Self::Decision(DecisionError::AlreadyTerminal { .. }) => ErrorClass::Conflict,
            Self::Decision(DecisionError::UnknownStep { .. }) => ErrorClass::NotFound,
            Self::Decision(_) => ErrorClass::Authorization,
            Self::Transition(TransitionError::StaleStep { .. }) => ErrorClass::Authorization,
            Self::Transition(_) => ErrorClass::Conflict,
            Self::NoActiveSetup { .. } => ErrorClass::Resolution,
            Self::UnknownInstance(_) => ErrorClass::NotFound,
        }
    }

    /// Stable machine-readable name of the failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Registry(error) => registry_code(error),
            Self::Scope(ScopeError::UnresolvedUnitRole { .. }) => "unresolved_unit_role",
            Self::Scope(ScopeError::UnresolvedApprover { .. }) => "unresolved_approver",
            Self::Scope(ScopeError::CoApproverIsPrimary { .. }) => "co_approver_is_primary",
            Self::Scope(ScopeError::MissingScope { .. }) => "missing_scope",
            Self::Scope(ScopeError::OverlappingSetup { .. }) => "overlapping_setup",
            Self::Delegation(DelegationError::Registry(error)) => registry_code(error),
            Self::Delegation(DelegationError::InvertedWindow { .. }) => "inverted_window",
            Self::Delegation(DelegationError::SelfDelegation { .. }) => "self_delegation",
            Self::Delegation(DelegationError::DelegateIsCoApprover { .. }) => {
                "delegate_is_co_approver"
            }
            Self::Delegation(DelegationError::OverlappingDelegation { .. }) => {
                "overlapping_delegation"
            }
            Self::Delegation(DelegationError::UnknownDelegation(_)) => "unknown_delegation",
            Self::Decision(DecisionError::NotAuthorized { .. }) => "not_authorized",
            Self::Decision(DecisionError::StaleStep { .. })
            | Self::Transition(TransitionError::StaleStep { .. }) => "stale_step",
            Self::Decision(DecisionError::AlreadyTerminal { .. })
            | Self::Transition(TransitionError::AlreadyTerminal { .. }) => "already_terminal",
            Self::Decision(DecisionError::AlreadyDecided { .. }) => "already_decided",
            Self::Decision(DecisionError::UnknownStep { .. })
            | Self::Transition(TransitionError::UnknownStep { .. }) => "unknown_step",
            Self::Transition(TransitionError::StepNotEntered { .. }) => "step_not_entered",
            Self::Transition(TransitionError::StepAlreadyEntered { .. }) => "step_already_entered",
            Self::Transition(TransitionError::DerivedEvent { .. }) => "derived_event",
            Self::NoActiveSetup { .. } => "no_active_setup",
            Self::UnknownInstance(_) => "unknown_instance",
        }
    }

    pub fn is_already_terminal(&self) -> bool {
        self.code() == "already_terminal"
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let message = self.to_string();
        let code = self.code();
        match self.class() {
            ErrorClass::Configuration => InterfaceError::BadRequest { code, message, correlation_id },
            ErrorClass::Resolution => {
                InterfaceError::Unprocessable { code, message, correlation_id }
            }
            ErrorClass::Authorization => InterfaceError::Forbidden { code, message, correlation_id },
            ErrorClass::Conflict => InterfaceError::Conflict { code, message, correlation_id },
            ErrorClass::NotFound => InterfaceError::NotFound { code, message, correlation_id },
        }
    }
}

fn registry_class(error: &RegistryError) -> ErrorClass {
    match error {
        RegistryError::Invalid { .. } | RegistryError::FeatureChanged { .. } => {
            ErrorClass::Configuration
        }
        RegistryError::UnknownSetup(_) | RegistryError::UnknownStep { .. } => ErrorClass::NotFound,
        RegistryError::NotActive(_) => ErrorClass::Conflict,
    }
}

fn registry_code(error: &RegistryError) -> &'static str {
    match error {
        RegistryError::Invalid { .. } => "invalid_setup",
        RegistryError::FeatureChanged { .. } => "feature_changed",
        RegistryError::UnknownSetup(_) => "unknown_setup",
        RegistryError::UnknownStep { .. } => "unknown_step",
        RegistryError::NotActive(_) => "setup_not_active",
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { code: &'static str, message: String, correlation_id: String },
    #[error("unprocessable: {message}")]
    Unprocessable { code: &'static str, message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { code: &'static str, message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { code: &'static str, message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { code: &'static str, message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The configuration change was rejected. Check inputs and try again."
            }
            Self::Unprocessable { .. } => {
                "No approval route could be resolved for this request. Contact an administrator."
            }
            Self::Forbidden { .. } => "You are not the approver for this step right now.",
            Self::Conflict { .. } => "This request has already moved on. Refresh and try again.",
            Self::NotFound { .. } => "The requested item does not exist.",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest { code, .. }
            | Self::Unprocessable { code, .. }
            | Self::Forbidden { code, .. }
            | Self::Conflict { code, .. }
            | Self::NotFound { code, .. } => code,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Unprocessable { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::NotFound { correlation_id, .. } => correlation_id,
        }
    }
}
