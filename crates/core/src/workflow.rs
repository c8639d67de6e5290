//! Inbound operations of the approval engine.
//!
//! Lock order is instance, then registry, then ledger, then scheduler. The
//! instance map lock is never held while any other lock is taken.
//! Notifications are dispatched after the instance lock is released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approvals::{DecisionError, RequiredActors, StepResolver};
use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::config::AppConfig;
use crate::delegation::{DelegationError, DelegationLedger};
use crate::domain::delegation::{Delegation, DelegationId, DelegationPhase, NewDelegation};
use crate::domain::instance::{
    Decision, DecisionOutcome, InstanceEvent, InstanceId, InstanceSummary, WorkflowInstance,
};
use crate::domain::org::EmployeeId;
use crate::domain::setup::{ApprovalSetup, SetupId, SetupSnapshot};
use crate::errors::WorkflowError;
use crate::escalation::{deadline_for, ArmedTimer, EscalationScheduler};
use crate::flows::{TransitionError, TransitionOutcome, WorkflowAction, WorkflowEngine};
use crate::notify::{Notification, NotificationDispatcher};
use crate::registry::{SetupDraft, SetupRegistry};
use crate::scope::{require_active, OrgDirectory, ScopeResolver};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerOutcome {
    AutoRejected,
    /// The step was decided, cancelled or already finished when the timer
    /// fired.
    NoOp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiredTimer {
    pub instance_id: InstanceId,
    pub step_order: u32,
    pub deadline: DateTime<Utc>,
    pub outcome: TimerOutcome,
}

pub struct WorkflowService<O, N, S>
where
    O: OrgDirectory,
    N: NotificationDispatcher,
    S: AuditSink,
{
    registry: RwLock<SetupRegistry>,
    ledger: RwLock<DelegationLedger>,
    instances: RwLock<HashMap<InstanceId, Arc<Mutex<WorkflowInstance>>>>,
    scheduler: Mutex<EscalationScheduler>,
    resolver: ScopeResolver,
    engine: WorkflowEngine,
    org: O,
    notifier: N,
    audit: S,
    snapshot_sequence: AtomicU64,
}

impl<O, N, S> WorkflowService<O, N, S>
where
    O: OrgDirectory,
    N: NotificationDispatcher,
    S: AuditSink,
{
    pub fn new(org: O, resolver: ScopeResolver, notifier: N, audit: S) -> Self {
        Self {
            registry: RwLock::new(SetupRegistry::new()),
            ledger: RwLock::new(DelegationLedger::new()),
            instances: RwLock::new(HashMap::new()),
            scheduler: Mutex::new(EscalationScheduler::new()),
            resolver,
            engine: WorkflowEngine::new(),
            org,
            notifier,
            audit,
            snapshot_sequence: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &AppConfig, org: O, notifier: N, audit: S) -> Self {
        Self::new(org, ScopeResolver::from_config(&config.workflow), notifier, audit)
    }

    pub fn org(&self) -> &O {
        &self.org
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn audit_sink(&self) -> &S {
        &self.audit
    }

    // -- administration -------------------------------------------------

    /// Publishes a new version of a setup. A unit-scoped draft without steps
    /// gets the default leadership chain. Editing an active setup re-runs the
    /// overlap check before anything is stored.
    pub fn publish_setup(
        &self,
        mut draft: SetupDraft,
        at: DateTime<Utc>,
    ) -> Result<Arc<ApprovalSetup>, WorkflowError> {
        let context = self.context(None, Some(draft.id.clone()), "admin");
        if draft.scope.is_some() && draft.steps.is_empty() {
            draft.steps = self.resolver.default_chain();
        }

        let result = (|| -> Result<Arc<ApprovalSetup>, WorkflowError> {
            let mut registry = write(&self.registry);
            let candidate = registry.prepare(draft.clone(), at)?;
            if registry.is_active(&candidate.id) {
                let active = registry.active_for_feature(&candidate.feature);
                self.resolver.check_activation(&candidate, &active, &self.org)?;
            }
            Ok(registry.publish(draft, at)?)
        })();

        if let Ok(setup) = &result {
            info!(
                event_name = "registry.setup_published",
                setup_id = %setup.id,
                version = setup.version,
                feature = %setup.feature,
                steps = setup.steps.len(),
                "setup version published"
            );
        }
        let metadata = match &result {
            Ok(setup) => vec![("version", setup.version.to_string())],
            Err(_) => Vec::new(),
        };
        self.record(&context, "registry.setup_published", AuditCategory::Administration, &result, metadata);
        result
    }

    pub fn activate_setup(&self, setup_id: &SetupId, at: DateTime<Utc>) -> Result<(), WorkflowError> {
        let context = self.context(None, Some(setup_id.clone()), "admin");
        let result = (|| -> Result<(), WorkflowError> {
            let mut registry = write(&self.registry);
            let setup = registry
                .latest(setup_id)
                .ok_or_else(|| crate::registry::RegistryError::UnknownSetup(setup_id.clone()))?;
            let active = registry.active_for_feature(&setup.feature);
            self.resolver.check_activation(&setup, &active, &self.org)?;
            registry.mark_active(setup_id)?;
            Ok(())
        })();

        if result.is_ok() {
            info!(event_name = "registry.setup_activated", setup_id = %setup_id, at = %at, "setup activated");
        }
        self.record(&context, "registry.setup_activated", AuditCategory::Administration, &result, Vec::new());
        result
    }

    pub fn deactivate_setup(&self, setup_id: &SetupId, at: DateTime<Utc>) -> Result<(), WorkflowError> {
        let context = self.context(None, Some(setup_id.clone()), "admin");
        let result = write(&self.registry).deactivate(setup_id).map_err(WorkflowError::from);

        if result.is_ok() {
            info!(event_name = "registry.setup_deactivated", setup_id = %setup_id, at = %at, "setup deactivated");
        }
        self.record(&context, "registry.setup_deactivated", AuditCategory::Administration, &result, Vec::new());
        result
    }

    /// Publishes a new setup version with a co-approver on `step_order`.
    /// Pending instances pick it up only when they enter that step.
    pub fn set_co_approver(
        &self,
        setup_id: &SetupId,
        step_order: u32,
        co_approver_id: EmployeeId,
        at: DateTime<Utc>,
    ) -> Result<Arc<ApprovalSetup>, WorkflowError> {
        let context = self.context(None, Some(setup_id.clone()), "admin");
        let result = (|| -> Result<Arc<ApprovalSetup>, WorkflowError> {
            require_active(&self.org, step_order, &co_approver_id)?;
            let mut registry = write(&self.registry);
            {
                let ledger = read(&self.ledger);
                let clash = ledger
                    .delegations_for_step(setup_id, step_order, at.date_naive())
                    .into_iter()
                    .any(|(delegation, phase)| {
                        phase != DelegationPhase::Expired && delegation.delegate_id == co_approver_id
                    });
                if clash {
                    return Err(WorkflowError::from(DelegationError::DelegateIsCoApprover {
                        delegate_id: co_approver_id.clone(),
                    }));
                }
            }
            Ok(registry.set_co_approver(setup_id, step_order, co_approver_id.clone(), at)?)
        })();

        if let Ok(setup) = &result {
            info!(
                event_name = "registry.co_approver_set",
                setup_id = %setup_id,
                step_order,
                co_approver_id = %co_approver_id,
                version = setup.version,
                "co-approver assigned"
            );
        }
        self.record(
            &context,
            "registry.co_approver_set",
            AuditCategory::Administration,
            &result,
            vec![("step_order", step_order.to_string()), ("co_approver_id", co_approver_id.0.clone())],
        );
        result
    }

    pub fn clear_co_approver(
        &self,
        setup_id: &SetupId,
        step_order: u32,
        at: DateTime<Utc>,
    ) -> Result<Arc<ApprovalSetup>, WorkflowError> {
        let context = self.context(None, Some(setup_id.clone()), "admin");
        let result = write(&self.registry)
            .clear_co_approver(setup_id, step_order, at)
            .map_err(WorkflowError::from);

        if let Ok(setup) = &result {
            info!(
                event_name = "registry.co_approver_cleared",
                setup_id = %setup_id,
                step_order,
                version = setup.version,
                "co-approver removed"
            );
        }
        self.record(
            &context,
            "registry.co_approver_cleared",
            AuditCategory::Administration,
            &result,
            vec![("step_order", step_order.to_string())],
        );
        result
    }

    pub fn create_delegation(
        &self,
        request: NewDelegation,
        at: DateTime<Utc>,
    ) -> Result<Delegation, WorkflowError> {
        let context =
            self.context(None, Some(request.setup_id.clone()), request.created_by.0.clone());
        let step_order = request.step_order;
        let result = {
            let registry = read(&self.registry);
            let mut ledger = write(&self.ledger);
            ledger.create_delegation(request, &registry, at).map_err(WorkflowError::from)
        };

        if let Ok(delegation) = &result {
            info!(
                event_name = "delegation.created",
                delegation_id = %delegation.id,
                setup_id = %delegation.setup_id,
                step_order = delegation.step_order,
                delegate_id = %delegation.delegate_id,
                start_date = %delegation.start_date,
                end_date = %delegation.end_date,
                "delegation created"
            );
        }
        let mut metadata = vec![("step_order", step_order.to_string())];
        if let Ok(delegation) = &result {
            metadata.push(("delegation_id", delegation.id.0.clone()));
            metadata.push(("delegate_id", delegation.delegate_id.0.clone()));
        }
        self.record(&context, "delegation.created", AuditCategory::Delegation, &result, metadata);
        result
    }

    /// Effective for every evaluation after it returns, including steps that
    /// are already pending.
    pub fn remove_delegation(
        &self,
        delegation_id: &DelegationId,
        at: DateTime<Utc>,
    ) -> Result<Delegation, WorkflowError> {
        let context = self.context(None, None, "admin");
        let result = write(&self.ledger).remove_delegation(delegation_id).map_err(WorkflowError::from);

        if let Ok(delegation) = &result {
            info!(
                event_name = "delegation.removed",
                delegation_id = %delegation_id,
                setup_id = %delegation.setup_id,
                step_order = delegation.step_order,
                at = %at,
                "delegation removed"
            );
        }
        self.record(
            &context,
            "delegation.removed",
            AuditCategory::Delegation,
            &result,
            vec![("delegation_id", delegation_id.0.clone())],
        );
        result
    }

    // -- requests ---------------------------------------------------------

    /// Creates an instance bound to a freshly resolved snapshot of the setup
    /// that governs `feature` for `submitter_id` on the submission date.
    /// Nothing is created when resolution fails.
    pub fn submit(
        &self,
        feature: &str,
        submitter_id: &EmployeeId,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<InstanceId, WorkflowError> {
        let mut context = self.context(None, None, submitter_id.0.clone());
        let mut pending = Vec::new();

        let result = (|| -> Result<InstanceId, WorkflowError> {
            let snapshot = self.resolve_snapshot(feature, submitter_id, at)?;
            context.setup_id = Some(snapshot.setup_id.clone());

            let instance_id = InstanceId(Uuid::new_v4().to_string());
            let handle = Arc::new(Mutex::new(self.engine.start(
                instance_id.clone(),
                Arc::clone(&snapshot),
                submitter_id.clone(),
                payload,
                at,
            )));
            // Registered before step 1 arms its timer, so a sweep that picks the
            // timer up waits on the instance lock instead of missing the instance.
            let mut instance = lock(&handle);
            write(&self.instances).insert(instance_id.clone(), Arc::clone(&handle));
            let entered = self.run_actions(
                &mut instance,
                vec![WorkflowAction::EnterStep { step_order: 1 }],
                at,
                &mut pending,
            );
            if let Err(error) = entered {
                drop(instance);
                write(&self.instances).remove(&instance_id);
                lock(&self.scheduler).cancel(&instance_id, 1);
                pending.clear();
                return Err(error);
            }
            drop(instance);

            info!(
                event_name = "workflow.submitted",
                instance_id = %instance_id,
                setup_id = %snapshot.setup_id,
                snapshot_id = %snapshot.id,
                fingerprint = %snapshot.fingerprint,
                submitter_id = %submitter_id,
                "request submitted"
            );
            Ok(instance_id)
        })();

        if let Ok(instance_id) = &result {
            context.instance_id = Some(instance_id.clone());
        }
        self.dispatch(pending);
        self.record(
            &context,
            "workflow.submitted",
            AuditCategory::Submission,
            &result,
            vec![("feature", feature.to_string())],
        );
        result
    }

    /// Records a decision on the instance's current step.
    pub fn decide(
        &self,
        instance_id: &InstanceId,
        actor_id: &EmployeeId,
        outcome: DecisionOutcome,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.record_decision(instance_id, None, actor_id, outcome, at)
    }

    /// Records a decision on a specific step; fails with a stale-step error if
    /// the instance has moved on.
    pub fn decide_step(
        &self,
        instance_id: &InstanceId,
        step_order: u32,
        actor_id: &EmployeeId,
        outcome: DecisionOutcome,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.record_decision(instance_id, Some(step_order), actor_id, outcome, at)
    }

    pub fn cancel(
        &self,
        instance_id: &InstanceId,
        by: &EmployeeId,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let mut context = self.context(Some(instance_id.clone()), None, by.0.clone());
        let mut pending = Vec::new();

        let result = (|| -> Result<TransitionOutcome, WorkflowError> {
            let handle = self.handle(instance_id)?;
            let mut instance = lock(&handle);
            context.setup_id = Some(instance.snapshot().setup_id.clone());
            let transition = self
                .engine
                .apply(&mut instance, InstanceEvent::Cancelled { by: by.clone(), at })?;
            self.run_actions(&mut instance, transition.actions.clone(), at, &mut pending)?;
            Ok(transition)
        })();

        if result.is_ok() {
            info!(event_name = "workflow.cancelled", instance_id = %instance_id, by = %by, "instance cancelled");
        }
        self.dispatch(pending);
        self.record(&context, "workflow.cancelled", AuditCategory::Submission, &result, Vec::new());
        result
    }

    // -- escalation -------------------------------------------------------

    /// Arms (or re-arms) a timer directly. Step entry arms timers on its own;
    /// this is for callers that restore timers or set custom deadlines.
    pub fn arm_timer(&self, instance_id: &InstanceId, step_order: u32, deadline: DateTime<Utc>) {
        lock(&self.scheduler).arm(instance_id.clone(), step_order, deadline);
    }

    pub fn armed_timers(&self) -> Vec<ArmedTimer> {
        lock(&self.scheduler).armed()
    }

    /// Fires the timer armed for `(instance, step)` if its deadline has
    /// passed at `at`. Returns `NoOp` when no such timer is armed, or when a
    /// decision or cancellation got there first.
    pub fn fire_timer(
        &self,
        instance_id: &InstanceId,
        step_order: u32,
        at: DateTime<Utc>,
    ) -> Result<TimerOutcome, WorkflowError> {
        self.expire_step(instance_id, step_order, at, None)
    }

    /// `taken` is the deadline of a timer the caller already removed from the
    /// scheduler. Without it the timer must still be armed and due.
    fn expire_step(
        &self,
        instance_id: &InstanceId,
        step_order: u32,
        at: DateTime<Utc>,
        taken: Option<DateTime<Utc>>,
    ) -> Result<TimerOutcome, WorkflowError> {
        let mut context = self.context(Some(instance_id.clone()), None, "escalation");
        let mut pending = Vec::new();

        let result = (|| -> Result<TimerOutcome, WorkflowError> {
            let handle = self.handle(instance_id)?;
            let mut instance = lock(&handle);
            context.setup_id = Some(instance.snapshot().setup_id.clone());

            let deadline = taken.or_else(|| {
                let mut scheduler = lock(&self.scheduler);
                let deadline = scheduler.deadline(instance_id, step_order)?;
                (deadline <= at && scheduler.cancel(instance_id, step_order)).then_some(deadline)
            });
            let Some(deadline) = deadline else {
                debug!(
                    event_name = "workflow.timer_not_due",
                    instance_id = %instance_id,
                    step_order,
                    "no due timer is armed for this step"
                );
                return Ok(TimerOutcome::NoOp);
            };

            match self.engine.apply(&mut instance, InstanceEvent::TimerExpired { step_order, at }) {
                Ok(transition) => {
                    self.run_actions(&mut instance, transition.actions, at, &mut pending)?;
                    warn!(
                        event_name = "workflow.auto_rejected",
                        instance_id = %instance_id,
                        step_order,
                        deadline = %deadline,
                        entered_at = ?instance.step_entered_at(),
                        "step was not decided in time"
                    );
                    Ok(TimerOutcome::AutoRejected)
                }
                Err(TransitionError::StaleStep { .. } | TransitionError::AlreadyTerminal { .. }) => {
                    debug!(
                        event_name = "workflow.timer_stale",
                        instance_id = %instance_id,
                        step_order,
                        status = instance.status().as_str(),
                        current_step_order = instance.current_step_order(),
                        "timer fired after the step was resolved"
                    );
                    Ok(TimerOutcome::NoOp)
                }
                Err(error) => Err(error.into()),
            }
        })();

        self.dispatch(pending);
        if matches!(result, Ok(TimerOutcome::AutoRejected) | Err(_)) {
            self.record(
                &context,
                "workflow.auto_rejected",
                AuditCategory::Escalation,
                &result,
                vec![("step_order", step_order.to_string())],
            );
        }
        result
    }

    /// Fires every armed timer with `deadline <= now`, earliest first, each
    /// under its own instance lock.
    pub fn fire_due_timers(&self, now: DateTime<Utc>) -> Vec<FiredTimer> {
        let due = lock(&self.scheduler).take_due(now);
        due.into_iter()
            .map(|timer| {
                let outcome = match self.expire_step(
                    &timer.instance_id,
                    timer.step_order,
                    now,
                    Some(timer.deadline),
                ) {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        warn!(
                            event_name = "escalation.fire_failed",
                            instance_id = %timer.instance_id,
                            step_order = timer.step_order,
                            error = %error,
                            "timer could not be applied"
                        );
                        TimerOutcome::NoOp
                    }
                };
                FiredTimer {
                    instance_id: timer.instance_id,
                    step_order: timer.step_order,
                    deadline: timer.deadline,
                    outcome,
                }
            })
            .collect()
    }

    // -- queries ----------------------------------------------------------

    pub fn instance(&self, instance_id: &InstanceId) -> Result<WorkflowInstance, WorkflowError> {
        let handle = self.handle(instance_id)?;
        let instance = lock(&handle).clone();
        Ok(instance)
    }

    pub fn instances(&self) -> Vec<InstanceSummary> {
        let handles: Vec<Arc<Mutex<WorkflowInstance>>> =
            read(&self.instances).values().cloned().collect();
        let mut summaries: Vec<(DateTime<Utc>, InstanceSummary)> = handles
            .iter()
            .map(|handle| {
                let instance = lock(handle);
                (instance.submitted_at(), instance.summary())
            })
            .collect();
        summaries.sort_by(|left, right| left.0.cmp(&right.0).then_with(|| left.1.id.cmp(&right.1.id)));
        summaries.into_iter().map(|(_, summary)| summary).collect()
    }

    /// Who may act on the instance's current step at `at`, derived live from
    /// the delegation ledger.
    pub fn required_actors(
        &self,
        instance_id: &InstanceId,
        at: DateTime<Utc>,
    ) -> Result<RequiredActors, WorkflowError> {
        let handle = self.handle(instance_id)?;
        let instance = lock(&handle);
        if instance.status().is_terminal() {
            return Err(DecisionError::AlreadyTerminal {
                instance_id: instance_id.clone(),
                status: instance.status(),
            }
            .into());
        }
        let ledger = read(&self.ledger);
        Ok(StepResolver::new(&ledger).resolve(&instance, instance.current_step_order(), at)?)
    }

    /// Rebuilds the instance from its snapshot and event log.
    pub fn replay(&self, instance_id: &InstanceId) -> Result<WorkflowInstance, WorkflowError> {
        let current = self.instance(instance_id)?;
        let rebuilt = self.engine.replay(
            current.id().clone(),
            Arc::clone(&current.snapshot),
            current.submitter_id().clone(),
            current.payload().clone(),
            current.submitted_at(),
            current.events(),
        )?;
        Ok(rebuilt)
    }

    pub fn setup(&self, setup_id: &SetupId) -> Option<Arc<ApprovalSetup>> {
        read(&self.registry).latest(setup_id)
    }

    pub fn setup_history(&self, setup_id: &SetupId) -> Vec<Arc<ApprovalSetup>> {
        read(&self.registry).history(setup_id).to_vec()
    }

    pub fn delegations_for_step(
        &self,
        setup_id: &SetupId,
        step_order: u32,
        as_of: NaiveDate,
    ) -> Vec<(Delegation, DelegationPhase)> {
        read(&self.ledger).delegations_for_step(setup_id, step_order, as_of)
    }

    // -- internals --------------------------------------------------------

    fn resolve_snapshot(
        &self,
        feature: &str,
        submitter_id: &EmployeeId,
        at: DateTime<Utc>,
    ) -> Result<Arc<SetupSnapshot>, WorkflowError> {
        let today = at.date_naive();
        let mut candidates: Vec<Arc<ApprovalSetup>> = read(&self.registry)
            .active_for_feature(feature)
            .into_iter()
            .filter(|setup| setup.is_effective_on(today))
            .filter(|setup| self.resolver.binds(setup, submitter_id, &self.org))
            .collect();

        // Membership can move after activation; prefer the newest window,
        // then the smallest id, so the choice stays reproducible.
        candidates.sort_by(|left, right| {
            right.effective_from.cmp(&left.effective_from).then_with(|| left.id.cmp(&right.id))
        });
        if candidates.len() > 1 {
            warn!(
                event_name = "workflow.setup_ambiguity",
                feature,
                submitter_id = %submitter_id,
                selected = %candidates[0].id,
                candidates = candidates.len(),
                "more than one active setup binds the submitter"
            );
        }
        let setup = candidates.into_iter().next().ok_or_else(|| WorkflowError::NoActiveSetup {
            feature: feature.to_string(),
            submitter_id: submitter_id.clone(),
        })?;

        let steps = self.resolver.resolve_steps(&setup, &self.org)?;
        let sequence = self.snapshot_sequence.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        Ok(Arc::new(SetupSnapshot::new(&setup, steps, sequence, at)))
    }

    fn record_decision(
        &self,
        instance_id: &InstanceId,
        step_order: Option<u32>,
        actor_id: &EmployeeId,
        outcome: DecisionOutcome,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let mut context = self.context(Some(instance_id.clone()), None, actor_id.0.clone());
        let mut pending = Vec::new();

        let result = (|| -> Result<TransitionOutcome, WorkflowError> {
            let handle = self.handle(instance_id)?;
            let mut instance = lock(&handle);
            context.setup_id = Some(instance.snapshot().setup_id.clone());
            let step_order = step_order.unwrap_or_else(|| instance.current_step_order());

            let actor = {
                let ledger = read(&self.ledger);
                StepResolver::new(&ledger).authorize(&instance, step_order, actor_id, at)?
            };
            let decision = Decision {
                step_order,
                actor_id: actor.employee_id,
                acting_as: actor.acting_as,
                outcome,
                decided_at: at,
            };
            let transition =
                self.engine.apply(&mut instance, InstanceEvent::Decided { decision })?;
            self.run_actions(&mut instance, transition.actions.clone(), at, &mut pending)?;
            Ok(transition)
        })();

        match &result {
            Ok(transition) => info!(
                event_name = "workflow.decision_recorded",
                instance_id = %instance_id,
                actor_id = %actor_id,
                outcome = ?outcome,
                from_step = transition.from.step_order,
                to_step = transition.to.step_order,
                status = transition.to.status.as_str(),
                moot = transition.moot.len(),
                "decision recorded"
            ),
            Err(error) => info!(
                event_name = "workflow.decision_rejected",
                instance_id = %instance_id,
                actor_id = %actor_id,
                code = error.code(),
                "decision refused"
            ),
        }
        self.dispatch(pending);
        let metadata = match &result {
            Ok(transition) => vec![
                ("outcome", format!("{outcome:?}").to_ascii_lowercase()),
                ("step_order", transition.from.step_order.to_string()),
                ("to_status", transition.to.status.as_str().to_string()),
            ],
            Err(_) => vec![("outcome", format!("{outcome:?}").to_ascii_lowercase())],
        };
        self.record(&context, "workflow.decision_recorded", AuditCategory::Decision, &result, metadata);
        result
    }

    /// Carries out engine actions while the instance lock is held. Entering a
    /// step pins its co-approver from the latest live setup version.
    fn run_actions(
        &self,
        instance: &mut WorkflowInstance,
        actions: Vec<WorkflowAction>,
        at: DateTime<Utc>,
        pending: &mut Vec<Notification>,
    ) -> Result<(), WorkflowError> {
        let mut queue: VecDeque<WorkflowAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                WorkflowAction::EnterStep { step_order } => {
                    let co_approver_id = self.live_co_approver(instance, step_order);
                    let entered = self.engine.apply(
                        instance,
                        InstanceEvent::StepEntered { step_order, co_approver_id, at },
                    )?;
                    queue.extend(entered.actions);
                }
                WorkflowAction::ArmTimer { step_order, entered_at } => {
                    if let Some(deadline) =
                        deadline_for(entered_at, instance.snapshot().auto_reject_days)
                    {
                        lock(&self.scheduler).arm(instance.id().clone(), step_order, deadline);
                    }
                }
                WorkflowAction::CancelTimer { step_order } => {
                    lock(&self.scheduler).cancel(instance.id(), step_order);
                }
                WorkflowAction::NotifyDecisionNeeded { step_order } => {
                    let actors = {
                        let ledger = read(&self.ledger);
                        StepResolver::new(&ledger).resolve(instance, step_order, at)?
                    };
                    pending.push(Notification::DecisionNeeded {
                        instance_id: instance.id().clone(),
                        step_order,
                        actors,
                    });
                }
                WorkflowAction::NotifyDecided { decision } => {
                    pending.push(Notification::Decided { instance_id: instance.id().clone(), decision });
                }
                WorkflowAction::NotifyTerminal { status } => {
                    pending.push(Notification::Terminal { instance_id: instance.id().clone(), status });
                }
            }
        }
        Ok(())
    }

    fn live_co_approver(&self, instance: &WorkflowInstance, step_order: u32) -> Option<EmployeeId> {
        let frozen = instance.snapshot().step(step_order);
        let fallback = frozen.and_then(|step| step.co_approver_id.clone());

        let registry = read(&self.registry);
        let Some(live) = registry.latest(&instance.snapshot().setup_id) else {
            return fallback;
        };
        let Some(live_step) = live.step(step_order) else {
            return fallback;
        };
        match &live_step.co_approver_id {
            Some(co_approver_id)
                if frozen.map(|step| &step.primary_approver_id) == Some(co_approver_id) =>
            {
                fallback
            }
            Some(co_approver_id)
                if require_active(&self.org, step_order, co_approver_id).is_err() =>
            {
                warn!(
                    event_name = "workflow.co_approver_inactive",
                    instance_id = %instance.id(),
                    step_order,
                    co_approver_id = %co_approver_id,
                    "live co-approver is not an active employee; keeping the snapshot value"
                );
                fallback
            }
            other => other.clone(),
        }
    }

    fn dispatch(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            match notification {
                Notification::DecisionNeeded { instance_id, step_order, actors } => {
                    self.notifier.on_decision_needed(&instance_id, step_order, &actors)
                }
                Notification::Decided { instance_id, decision } => {
                    self.notifier.on_decided(&instance_id, &decision)
                }
                Notification::Terminal { instance_id, status } => {
                    self.notifier.on_terminal(&instance_id, status)
                }
            }
        }
    }

    fn handle(&self, instance_id: &InstanceId) -> Result<Arc<Mutex<WorkflowInstance>>, WorkflowError> {
        read(&self.instances)
            .get(instance_id)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownInstance(instance_id.clone()))
    }

    fn context(
        &self,
        instance_id: Option<InstanceId>,
        setup_id: Option<SetupId>,
        actor: impl Into<String>,
    ) -> AuditContext {
        AuditContext::new(instance_id, setup_id, Uuid::new_v4().to_string(), actor)
    }

    fn record<T>(
        &self,
        context: &AuditContext,
        event_type: &str,
        category: AuditCategory,
        result: &Result<T, WorkflowError>,
        metadata: Vec<(&str, String)>,
    ) {
        let mut event = match result {
            Ok(_) => AuditEvent::new(context, event_type, category, AuditOutcome::Success),
            Err(error) => {
                let outcome = match error.class() {
                    crate::errors::ErrorClass::NotFound => AuditOutcome::Failed,
                    _ => AuditOutcome::Rejected,
                };
                AuditEvent::new(context, event_type, category, outcome)
                    .with_metadata("error_code", error.code())
                    .with_metadata("error_class", error.class().as_str())
                    .with_metadata("error", error.to_string())
            }
        };
        for (key, value) in metadata {
            event = event.with_metadata(key, value);
        }
        self.audit.emit(event);
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

    use super::{TimerOutcome, WorkflowService};
    use crate::approvals::{Actor, DecisionError, RequiredActors};
    use crate::audit::{AuditCategory, AuditOutcome, InMemoryAuditSink};
    use crate::domain::delegation::NewDelegation;
    use crate::domain::instance::{ActingAs, DecisionOutcome, InstanceId, InstanceStatus};
    use crate::domain::org::{Employee, EmployeeId, UnitScope, UnitType};
    use crate::domain::setup::{ApproverRef, SetupId, Step, StepKind};
    use crate::errors::WorkflowError;
    use crate::notify::{InMemoryNotificationDispatcher, Notification};
    use crate::registry::SetupDraft;
    use crate::scope::{InMemoryOrgDirectory, ScopeError, ScopeResolver};

    type TestService =
        WorkflowService<InMemoryOrgDirectory, InMemoryNotificationDispatcher, InMemoryAuditSink>;

    struct Fixture {
        service: TestService,
        org: InMemoryOrgDirectory,
        notifier: InMemoryNotificationDispatcher,
        audit: InMemoryAuditSink,
    }

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + Duration::days(n)
    }

    fn date(n: i64) -> NaiveDate {
        day(n).date_naive()
    }

    fn emp(id: &str) -> EmployeeId {
        EmployeeId::new(id)
    }

    fn desk() -> UnitScope {
        UnitScope::new(UnitType::Team, "service-desk")
    }

    fn fixture() -> Fixture {
        let org = InMemoryOrgDirectory::new();
        for (id, team) in [
            ("e-sarah", "service-desk"),
            ("e-minato", "service-desk"),
            ("e-kim", "service-desk"),
            ("e-jo", "service-desk"),
            ("e-ivy", "service-desk"),
            ("e-alex", "people"),
            ("e-lee", "people"),
        ] {
            org.upsert_employee(Employee {
                id: emp(id),
                name: id.trim_start_matches("e-").to_string(),
                active: true,
                department: Some("it".to_string()),
                team: Some(team.to_string()),
                division: None,
                manager_id: None,
            });
        }
        org.assign_role(desk(), "Lead", emp("e-sarah"));
        org.assign_role(desk(), "Manager", emp("e-alex"));

        let notifier = InMemoryNotificationDispatcher::default();
        let audit = InMemoryAuditSink::default();
        let service = WorkflowService::new(
            org.clone(),
            ScopeResolver::new(vec!["Lead".to_string(), "Manager".to_string()]),
            notifier.clone(),
            audit.clone(),
        );
        Fixture { service, org, notifier, audit }
    }

    fn it_leave() -> SetupDraft {
        SetupDraft {
            id: SetupId("it-leave".to_string()),
            name: "IT Leave Request".to_string(),
            feature: "leave".to_string(),
            auto_reject_days: 7,
            scope: None,
            effective_from: NaiveDate::from_ymd_opt(2026, 1, 1).expect("date"),
            effective_to: None,
            steps: vec![
                Step::new(1, StepKind::Approval, ApproverRef::employee("e-sarah")),
                Step::new(2, StepKind::Approval, ApproverRef::employee("e-alex")),
            ],
        }
    }

    fn desk_leave() -> SetupDraft {
        SetupDraft {
            id: SetupId("desk-leave".to_string()),
            name: "Service Desk Leave".to_string(),
            feature: "leave".to_string(),
            auto_reject_days: 3,
            scope: Some(desk()),
            effective_from: NaiveDate::from_ymd_opt(2026, 1, 1).expect("date"),
            effective_to: None,
            steps: Vec::new(),
        }
    }

    impl Fixture {
        fn activate(&self, draft: SetupDraft) -> SetupId {
            let setup = self.service.publish_setup(draft, day(-30)).expect("published");
            self.service.activate_setup(&setup.id, day(-30)).expect("activated");
            setup.id.clone()
        }

        fn submit(&self, at: DateTime<Utc>) -> InstanceId {
            self.service
                .submit("leave", &emp("e-jo"), serde_json::json!({ "days": 2 }), at)
                .expect("submitted")
        }

        fn approve(&self, id: &InstanceId, actor: &str, at: DateTime<Utc>) -> InstanceStatus {
            self.service
                .decide(id, &emp(actor), DecisionOutcome::Approve, at)
                .expect("approved")
                .to
                .status
        }

        fn single(&self, id: &InstanceId, at: DateTime<Utc>) -> Actor {
            match self.service.required_actors(id, at).expect("actors") {
                RequiredActors::Single { actor } => actor,
                other => panic!("expected a single actor, got {other:?}"),
            }
        }
    }

    fn delegation(setup: &SetupId, step_order: u32, delegate: &str, from: i64, to: i64) -> NewDelegation {
        NewDelegation {
            setup_id: setup.clone(),
            step_order,
            delegate_id: emp(delegate),
            start_date: date(from),
            end_date: date(to),
            created_by: emp("e-admin"),
        }
    }

    fn is_not_authorized(result: Result<crate::flows::TransitionOutcome, WorkflowError>) -> bool {
        matches!(result, Err(WorkflowError::Decision(DecisionError::NotAuthorized { .. })))
    }

    #[test]
    fn it_leave_request_auto_rejects_after_a_week_of_silence() {
        let fx = fixture();
        fx.activate(it_leave());
        let i1 = fx.submit(day(0));

        assert_eq!(fx.single(&i1, day(0)).employee_id, emp("e-sarah"));
        assert_eq!(fx.approve(&i1, "e-sarah", day(0) + Duration::hours(1)), InstanceStatus::Pending);

        let instance = fx.service.instance(&i1).expect("instance");
        assert_eq!(instance.current_step_order(), 2);
        let timers = fx.service.armed_timers();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].step_order, 2);
        assert_eq!(timers[0].deadline, day(7) + Duration::hours(1));

        assert!(fx.service.fire_due_timers(day(7)).is_empty());
        let fired = fx.service.fire_due_timers(day(8));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].outcome, TimerOutcome::AutoRejected);
        assert_eq!(fx.service.instance(&i1).expect("instance").status(), InstanceStatus::AutoRejected);
        assert!(fx.service.armed_timers().is_empty());
    }

    #[test]
    fn it_leave_request_delegate_acts_inside_window() {
        let fx = fixture();
        let setup_id = fx.activate(it_leave());
        fx.service
            .create_delegation(delegation(&setup_id, 1, "e-minato", 0, 5), day(0))
            .expect("delegated");
        let i2 = fx.submit(day(0));

        assert!(is_not_authorized(fx.service.decide(
            &i2,
            &emp("e-sarah"),
            DecisionOutcome::Approve,
            day(2)
        )));
        let accepted = fx
            .service
            .decide(&i2, &emp("e-minato"), DecisionOutcome::Approve, day(2))
            .expect("delegate accepted");
        assert_eq!(accepted.to.step_order, 2);
        let recorded = fx.service.instance(&i2).expect("instance");
        let decision = recorded.decisions().next().expect("decision");
        assert_eq!(decision.acting_as, ActingAs::Delegate);
        assert_eq!(decision.actor_id, emp("e-minato"));
    }

    #[test]
    fn roles_invert_after_the_delegation_window() {
        let fx = fixture();
        let setup_id = fx.activate(it_leave());
        fx.service
            .create_delegation(delegation(&setup_id, 1, "e-minato", 0, 5), day(0))
            .expect("delegated");
        let id = fx.submit(day(0));

        assert!(is_not_authorized(fx.service.decide(
            &id,
            &emp("e-minato"),
            DecisionOutcome::Approve,
            day(6)
        )));
        assert_eq!(fx.approve(&id, "e-sarah", day(6)), InstanceStatus::Pending);
    }

    #[test]
    fn removing_a_delegation_reverts_a_pending_step_immediately() {
        let fx = fixture();
        let setup_id = fx.activate(it_leave());
        let created = fx
            .service
            .create_delegation(delegation(&setup_id, 1, "e-minato", 0, 5), day(0))
            .expect("delegated");
        let id = fx.submit(day(0));
        assert_eq!(fx.single(&id, day(1)).acting_as, ActingAs::Delegate);

        fx.service.remove_delegation(&created.id, day(1)).expect("removed");
        assert_eq!(
            fx.single(&id, day(1)),
            Actor { employee_id: emp("e-sarah"), acting_as: ActingAs::Primary }
        );
        assert!(is_not_authorized(fx.service.decide(
            &id,
            &emp("e-minato"),
            DecisionOutcome::Approve,
            day(1)
        )));
    }

    #[test]
    fn dual_approval_needs_both_and_either_rejection_ends_it() {
        let fx = fixture();
        let setup_id = fx.activate(it_leave());
        fx.service.set_co_approver(&setup_id, 1, emp("e-kim"), day(-1)).expect("co-approver");

        let both = fx.submit(day(0));
        assert_eq!(fx.approve(&both, "e-sarah", day(0)), InstanceStatus::Pending);
        assert_eq!(fx.service.instance(&both).expect("instance").current_step_order(), 1);
        assert_eq!(fx.approve(&both, "e-kim", day(0)), InstanceStatus::Pending);
        assert_eq!(fx.service.instance(&both).expect("instance").current_step_order(), 2);

        let rejected = fx.submit(day(0));
        fx.approve(&rejected, "e-kim", day(0));
        let outcome = fx
            .service
            .decide(&rejected, &emp("e-sarah"), DecisionOutcome::Reject, day(1))
            .expect("rejected");
        assert_eq!(outcome.to.status, InstanceStatus::Rejected);
        assert_eq!(outcome.moot, vec![emp("e-kim")]);

        let late = fx.service.decide(&rejected, &emp("e-kim"), DecisionOutcome::Approve, day(1));
        assert!(late.expect_err("terminal").is_already_terminal());
    }

    #[test]
    fn an_employee_cannot_decide_the_same_step_twice() {
        let fx = fixture();
        let setup_id = fx.activate(it_leave());
        fx.service.set_co_approver(&setup_id, 1, emp("e-kim"), day(-1)).expect("co-approver");
        let id = fx.submit(day(0));

        fx.approve(&id, "e-sarah", day(0));
        let again = fx.service.decide(&id, &emp("e-sarah"), DecisionOutcome::Reject, day(0));
        assert!(matches!(again, Err(WorkflowError::Decision(DecisionError::AlreadyDecided { .. }))));
        assert_eq!(fx.service.instance(&id).expect("instance").decisions().count(), 1);
    }

    #[test]
    fn co_approver_changes_apply_only_to_steps_not_yet_entered() {
        let fx = fixture();
        let setup_id = fx.activate(it_leave());
        let at_step_one = fx.submit(day(0));
        let at_step_two = fx.submit(day(0));
        fx.approve(&at_step_two, "e-sarah", day(0));

        fx.service.set_co_approver(&setup_id, 2, emp("e-lee"), day(1)).expect("co-approver");

        assert!(matches!(
            fx.service.required_actors(&at_step_two, day(1)).expect("actors"),
            RequiredActors::Single { .. }
        ));
        assert_eq!(fx.approve(&at_step_two, "e-alex", day(1)), InstanceStatus::Approved);

        fx.approve(&at_step_one, "e-sarah", day(1));
        let required = fx.service.required_actors(&at_step_one, day(1)).expect("actors");
        assert_eq!(required.employee_ids(), vec![emp("e-alex"), emp("e-lee")]);

        fx.service.clear_co_approver(&setup_id, 2, day(2)).expect("cleared");
        assert_eq!(fx.approve(&at_step_one, "e-alex", day(2)), InstanceStatus::Pending);
        assert_eq!(fx.approve(&at_step_one, "e-lee", day(2)), InstanceStatus::Approved);
    }

    #[test]
    fn editing_a_live_setup_leaves_running_instances_alone() {
        let fx = fixture();
        fx.activate(it_leave());
        let running = fx.submit(day(0));

        let mut edited = it_leave();
        edited.steps[1] = Step::new(2, StepKind::Approval, ApproverRef::employee("e-lee"));
        let v2 = fx.service.publish_setup(edited, day(1)).expect("v2");
        assert_eq!(v2.version, 2);

        fx.approve(&running, "e-sarah", day(1));
        assert_eq!(fx.single(&running, day(1)).employee_id, emp("e-alex"));

        let fresh = fx.submit(day(2));
        fx.approve(&fresh, "e-sarah", day(2));
        assert_eq!(fx.single(&fresh, day(2)).employee_id, emp("e-lee"));
        assert_ne!(
            fx.service.instance(&running).expect("instance").snapshot_id(),
            fx.service.instance(&fresh).expect("instance").snapshot_id()
        );
    }

    #[test]
    fn role_holder_change_does_not_reassign_a_pending_step() {
        let fx = fixture();
        fx.activate(desk_leave());
        let pending = fx.submit(day(0));
        assert_eq!(fx.single(&pending, day(0)).employee_id, emp("e-sarah"));

        fx.org.revoke_role(&desk(), "Lead", &emp("e-sarah"));
        fx.org.assign_role(desk(), "Lead", emp("e-ivy"));

        assert_eq!(fx.single(&pending, day(1)).employee_id, emp("e-sarah"));
        assert_eq!(fx.approve(&pending, "e-sarah", day(1)), InstanceStatus::Pending);

        let fresh = fx.submit(day(1));
        assert_eq!(fx.single(&fresh, day(1)).employee_id, emp("e-ivy"));
    }

    #[test]
    fn vacant_unit_role_fails_submission_closed() {
        let fx = fixture();
        fx.activate(desk_leave());
        fx.org.revoke_role(&desk(), "Manager", &emp("e-alex"));

        let error = fx
            .service
            .submit("leave", &emp("e-jo"), serde_json::Value::Null, day(0))
            .expect_err("manager is vacant");
        assert!(matches!(error, WorkflowError::Scope(ScopeError::UnresolvedUnitRole { .. })));
        assert!(fx.service.instances().is_empty());
        assert!(fx.service.armed_timers().is_empty());

        let submissions: Vec<_> = fx
            .audit
            .events()
            .into_iter()
            .filter(|event| event.category == AuditCategory::Submission)
            .collect();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].outcome, AuditOutcome::Rejected);
        assert_eq!(
            submissions[0].metadata.get("error_code").map(String::as_str),
            Some("unresolved_unit_role")
        );
    }

    #[test]
    fn submission_without_a_governing_setup_is_rejected() {
        let fx = fixture();
        let setup_id = fx.activate(it_leave());
        assert!(matches!(
            fx.service.submit("overtime", &emp("e-jo"), serde_json::Value::Null, day(0)),
            Err(WorkflowError::NoActiveSetup { .. })
        ));

        fx.service.deactivate_setup(&setup_id, day(0)).expect("deactivated");
        assert!(matches!(
            fx.service.submit("leave", &emp("e-jo"), serde_json::Value::Null, day(0)),
            Err(WorkflowError::NoActiveSetup { .. })
        ));
    }

    #[test]
    fn unit_scoped_setup_only_binds_its_members() {
        let fx = fixture();
        fx.activate(desk_leave());
        assert!(matches!(
            fx.service.submit("leave", &emp("e-lee"), serde_json::Value::Null, day(0)),
            Err(WorkflowError::NoActiveSetup { .. })
        ));
        let setup = fx.service.setup(&SetupId("desk-leave".to_string())).expect("setup");
        assert_eq!(setup.steps.len(), 2);
    }

    #[test]
    fn overlapping_activations_and_edits_are_rejected() {
        let fx = fixture();
        fx.activate(desk_leave());

        let everyone = fx.service.publish_setup(it_leave(), day(-1)).expect("published");
        let error = fx.service.activate_setup(&everyone.id, day(-1)).expect_err("overlap");
        assert!(matches!(error, WorkflowError::Scope(ScopeError::OverlappingSetup { .. })));

        let mut people = desk_leave();
        people.id = SetupId("people-leave".to_string());
        people.scope = Some(UnitScope::new(UnitType::Team, "people"));
        let people_id = fx.activate(people.clone());

        people.scope = Some(desk());
        let error = fx.service.publish_setup(people, day(0)).expect_err("edit overlaps");
        assert!(matches!(error, WorkflowError::Scope(ScopeError::OverlappingSetup { .. })));
        assert_eq!(fx.service.setup_history(&people_id).len(), 1);
    }

    #[test]
    fn cancel_is_only_valid_while_pending() {
        let fx = fixture();
        fx.activate(it_leave());
        let id = fx.submit(day(0));

        let cancelled = fx.service.cancel(&id, &emp("e-jo"), day(1)).expect("cancelled");
        assert_eq!(cancelled.to.status, InstanceStatus::Cancelled);
        assert!(fx.service.armed_timers().is_empty());

        let again = fx.service.cancel(&id, &emp("e-jo"), day(1)).expect_err("terminal");
        assert!(again.is_already_terminal());
        let decision = fx.service.decide(&id, &emp("e-sarah"), DecisionOutcome::Approve, day(1));
        assert!(decision.expect_err("terminal").is_already_terminal());
        assert!(fx.service.fire_due_timers(day(30)).is_empty());
    }

    #[test]
    fn stale_step_decisions_are_refused_without_side_effects() {
        let fx = fixture();
        fx.activate(it_leave());
        let id = fx.submit(day(0));
        fx.approve(&id, "e-sarah", day(0));
        let before = fx.service.instance(&id).expect("instance");

        let stale = fx.service.decide_step(&id, 1, &emp("e-sarah"), DecisionOutcome::Approve, day(0));
        assert!(matches!(stale, Err(WorkflowError::Decision(DecisionError::StaleStep { .. }))));
        assert_eq!(fx.service.instance(&id).expect("instance"), before);
    }

    #[test]
    fn timer_for_a_decided_step_is_a_no_op() {
        let fx = fixture();
        fx.activate(it_leave());
        let id = fx.submit(day(0));
        fx.approve(&id, "e-sarah", day(0));

        assert_eq!(fx.service.fire_timer(&id, 1, day(8)).expect("fired"), TimerOutcome::NoOp);
        assert_eq!(fx.service.instance(&id).expect("instance").status(), InstanceStatus::Pending);
    }

    #[test]
    fn disabled_sla_never_arms_a_timer() {
        let fx = fixture();
        let mut draft = it_leave();
        draft.auto_reject_days = 0;
        fx.activate(draft);
        let id = fx.submit(day(0));
        fx.approve(&id, "e-sarah", day(0));

        assert!(fx.service.armed_timers().is_empty());
        assert!(fx.service.fire_due_timers(day(365)).is_empty());
        assert_eq!(fx.service.fire_timer(&id, 2, day(365)).expect("fired"), TimerOutcome::NoOp);
        assert_eq!(fx.service.instance(&id).expect("instance").status(), InstanceStatus::Pending);
    }

    #[test]
    fn fire_timer_waits_for_the_armed_deadline() {
        let fx = fixture();
        fx.activate(it_leave());
        let id = fx.submit(day(0));

        assert_eq!(fx.service.fire_timer(&id, 1, day(6)).expect("fired"), TimerOutcome::NoOp);
        assert_eq!(fx.service.armed_timers().len(), 1);
        assert_eq!(fx.service.instance(&id).expect("instance").status(), InstanceStatus::Pending);

        assert_eq!(
            fx.service.fire_timer(&id, 1, day(7)).expect("fired"),
            TimerOutcome::AutoRejected
        );
        assert!(fx.service.armed_timers().is_empty());
        assert_eq!(
            fx.service.instance(&id).expect("instance").status(),
            InstanceStatus::AutoRejected
        );
    }

    #[test]
    fn sweep_during_submission_never_loses_the_first_timer() {
        for _ in 0..32 {
            let fx = fixture();
            fx.activate(it_leave());

            let (id, fired) = std::thread::scope(|scope| {
                let submit = scope.spawn(|| fx.submit(day(-10)));
                let sweep = scope.spawn(|| {
                    (0..8).flat_map(|_| fx.service.fire_due_timers(day(0))).collect::<Vec<_>>()
                });
                (submit.join().expect("submit thread"), sweep.join().expect("sweep thread"))
            });

            let status = fx.service.instance(&id).expect("instance").status();
            if fired.iter().any(|timer| timer.outcome == TimerOutcome::AutoRejected) {
                assert_eq!(status, InstanceStatus::AutoRejected);
            } else {
                assert_eq!(status, InstanceStatus::Pending);
                assert_eq!(fx.service.armed_timers().len(), 1);
                let fired = fx.service.fire_due_timers(day(0));
                assert_eq!(fired[0].outcome, TimerOutcome::AutoRejected);
            }
        }
    }

    #[test]
    fn decision_racing_a_due_timer_has_exactly_one_winner() {
        for _ in 0..32 {
            let fx = fixture();
            fx.activate(it_leave());
            let id = fx.submit(day(0));
            fx.service.arm_timer(&id, 1, day(0));

            let (decided, fired) = std::thread::scope(|scope| {
                let decide = scope.spawn(|| {
                    fx.service.decide(&id, &emp("e-sarah"), DecisionOutcome::Approve, day(0))
                });
                let fire = scope.spawn(|| fx.service.fire_due_timers(day(0)));
                (decide.join().expect("decide thread"), fire.join().expect("fire thread"))
            });

            let instance = fx.service.instance(&id).expect("instance");
            let auto_rejected =
                fired.iter().any(|timer| timer.outcome == TimerOutcome::AutoRejected);
            match instance.status() {
                InstanceStatus::AutoRejected => {
                    assert!(auto_rejected);
                    assert!(decided.expect_err("timer won").is_already_terminal());
                    assert_eq!(instance.current_step_order(), 1);
                }
                InstanceStatus::Pending => {
                    assert!(!auto_rejected);
                    assert!(decided.is_ok());
                    assert_eq!(instance.current_step_order(), 2);
                }
                other => panic!("unexpected status {other:?}"),
            }
        }
    }

    #[test]
    fn notifications_follow_the_transition_order() {
        let fx = fixture();
        fx.activate(it_leave());
        let id = fx.submit(day(0));
        fx.approve(&id, "e-sarah", day(0));
        fx.approve(&id, "e-alex", day(1));

        let kinds: Vec<String> = fx
            .notifier
            .for_instance(&id)
            .into_iter()
            .map(|notification| match notification {
                Notification::DecisionNeeded { step_order, .. } => format!("needed:{step_order}"),
                Notification::Decided { decision, .. } => format!("decided:{}", decision.actor_id),
                Notification::Terminal { status, .. } => format!("terminal:{}", status.as_str()),
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["needed:1", "decided:e-sarah", "needed:2", "decided:e-alex", "terminal:approved"]
        );
    }

    #[test]
    fn replay_matches_the_live_instance_and_log_stays_ordered() {
        let fx = fixture();
        let setup_id = fx.activate(it_leave());
        fx.service.set_co_approver(&setup_id, 2, emp("e-lee"), day(-1)).expect("co-approver");
        let id = fx.submit(day(0));
        fx.approve(&id, "e-sarah", day(0));
        fx.approve(&id, "e-lee", day(1));
        fx.service
            .decide(&id, &emp("e-alex"), DecisionOutcome::Reject, day(2))
            .expect("rejected");

        let live = fx.service.instance(&id).expect("instance");
        assert_eq!(fx.service.replay(&id).expect("replayed"), live);

        let orders: Vec<u32> = live.decisions().map(|decision| decision.step_order).collect();
        assert_eq!(orders, vec![1, 2, 2]);
        assert!(orders.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(live.status(), InstanceStatus::Rejected);
    }

    #[test]
    fn delegate_cannot_become_co_approver_of_the_same_step() {
        let fx = fixture();
        let setup_id = fx.activate(it_leave());
        fx.service
            .create_delegation(delegation(&setup_id, 1, "e-minato", 0, 5), day(0))
            .expect("delegated");

        let error = fx
            .service
            .set_co_approver(&setup_id, 1, emp("e-minato"), day(0))
            .expect_err("clash");
        assert_eq!(error.code(), "delegate_is_co_approver");
        assert!(fx.service.set_co_approver(&setup_id, 1, emp("e-minato"), day(6)).is_ok());
    }

    #[test]
    fn delegating_to_a_pinned_co_approver_keeps_the_step_completable() {
        let fx = fixture();
        let setup_id = fx.activate(it_leave());
        fx.service.set_co_approver(&setup_id, 1, emp("e-kim"), day(-1)).expect("co-approver");
        let id = fx.submit(day(0));
        fx.service.clear_co_approver(&setup_id, 1, day(0)).expect("cleared");
        fx.service
            .create_delegation(delegation(&setup_id, 1, "e-kim", 0, 5), day(0))
            .expect("delegated");

        match fx.service.required_actors(&id, day(1)).expect("actors") {
            RequiredActors::Both { actors } => {
                assert_eq!(
                    actors[0],
                    Actor { employee_id: emp("e-sarah"), acting_as: ActingAs::Primary }
                );
                assert_eq!(
                    actors[1],
                    Actor { employee_id: emp("e-kim"), acting_as: ActingAs::CoApprover }
                );
            }
            other => panic!("expected both actors, got {other:?}"),
        }

        assert_eq!(fx.approve(&id, "e-kim", day(1)), InstanceStatus::Pending);
        fx.approve(&id, "e-sarah", day(1));
        assert_eq!(fx.service.instance(&id).expect("instance").current_step_order(), 2);
    }

    #[test]
    fn co_approver_must_be_an_active_employee() {
        let fx = fixture();
        let setup_id = fx.activate(it_leave());

        let error = fx
            .service
            .set_co_approver(&setup_id, 2, emp("e-ghost"), day(0))
            .expect_err("unknown employee");
        assert_eq!(error.code(), "unresolved_approver");
        assert_eq!(fx.service.setup_history(&setup_id).len(), 1);

        let rejected = fx
            .audit
            .events()
            .into_iter()
            .rev()
            .find(|event| event.event_type == "registry.co_approver_set")
            .expect("audit event");
        assert_eq!(rejected.outcome, AuditOutcome::Rejected);
    }

    #[test]
    fn inactive_live_co_approver_is_not_pinned() {
        let fx = fixture();
        let setup_id = fx.activate(it_leave());
        let id = fx.submit(day(0));
        fx.service.set_co_approver(&setup_id, 2, emp("e-lee"), day(0)).expect("co-approver");
        fx.org.set_active(&emp("e-lee"), false);

        fx.approve(&id, "e-sarah", day(1));
        assert_eq!(fx.single(&id, day(1)).employee_id, emp("e-alex"));
        assert_eq!(fx.approve(&id, "e-alex", day(2)), InstanceStatus::Approved);
    }
}
