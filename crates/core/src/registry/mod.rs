//! Versioned store of approval setups.
//!
//! Every publish appends a new immutable version; nothing handed out by the
//! registry is ever mutated, so instances holding an older version are
//! unaffected by later edits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::org::{normalize_key, EmployeeId, UnitScope};
use crate::domain::setup::{ApprovalSetup, SetupId, SetupValidationError, Step};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupDraft {
    pub id: SetupId,
    pub name: String,
    pub feature: String,
    pub auto_reject_days: u32,
    pub scope: Option<UnitScope>,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("setup `{setup_id}` is invalid: {source}")]
    Invalid { setup_id: SetupId, source: SetupValidationError },
    #[error("unknown setup `{0}`")]
    UnknownSetup(SetupId),
    #[error("setup `{setup_id}` has no step {step_order}")]
    UnknownStep { setup_id: SetupId, step_order: u32 },
    #[error("setup `{0}` is not active")]
    NotActive(SetupId),
    #[error("setup `{setup_id}` cannot move from feature `{from}` to `{to}`")]
    FeatureChanged { setup_id: SetupId, from: String, to: String },
}

#[derive(Clone, Debug, Default)]
pub struct SetupRegistry {
    versions: HashMap<SetupId, Vec<Arc<ApprovalSetup>>>,
    active: HashSet<SetupId>,
}

impl SetupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and validates the next version of the draft's setup id without
    /// storing it.
    pub fn prepare(
        &self,
        draft: SetupDraft,
        published_at: DateTime<Utc>,
    ) -> Result<ApprovalSetup, RegistryError> {
        if let Some(previous) = self.latest(&draft.id) {
            if normalize_key(&previous.feature) != normalize_key(&draft.feature) {
                return Err(RegistryError::FeatureChanged {
                    setup_id: draft.id,
                    from: previous.feature.clone(),
                    to: draft.feature,
                });
            }
        }

        let setup = ApprovalSetup {
            version: self.next_version(&draft.id),
            id: draft.id,
            name: draft.name,
            feature: draft.feature,
            auto_reject_days: draft.auto_reject_days,
            scope: draft.scope,
            effective_from: draft.effective_from,
            effective_to: draft.effective_to,
            steps: draft.steps,
            published_at,
        };
        setup
            .validate()
            .map_err(|source| RegistryError::Invalid { setup_id: setup.id.clone(), source })?;
        Ok(setup)
    }

    /// Validates and appends a new version of the draft's setup id.
    pub fn publish(
        &mut self,
        draft: SetupDraft,
        published_at: DateTime<Utc>,
    ) -> Result<Arc<ApprovalSetup>, RegistryError> {
        let setup = self.prepare(draft, published_at)?;
        self.append(setup)
    }

    /// Publishes a copy of the latest version with `edit` applied to one step.
    pub fn edit_step(
        &mut self,
        setup_id: &SetupId,
        step_order: u32,
        published_at: DateTime<Utc>,
        edit: impl FnOnce(Step) -> Step,
    ) -> Result<Arc<ApprovalSetup>, RegistryError> {
        let latest =
            self.latest(setup_id).ok_or_else(|| RegistryError::UnknownSetup(setup_id.clone()))?;
        let mut next = ApprovalSetup::clone(&latest);
        let step = next.steps.iter_mut().find(|step| step.order == step_order).ok_or_else(|| {
            RegistryError::UnknownStep { setup_id: setup_id.clone(), step_order }
        })?;
        *step = edit(step.clone());
        next.version = self.next_version(setup_id);
        next.published_at = published_at;
        self.append(next)
    }

    pub fn set_co_approver(
        &mut self,
        setup_id: &SetupId,
        step_order: u32,
        co_approver_id: EmployeeId,
        published_at: DateTime<Utc>,
    ) -> Result<Arc<ApprovalSetup>, RegistryError> {
        self.edit_step(setup_id, step_order, published_at, |step| {
            step.with_co_approver(co_approver_id)
        })
    }

    pub fn clear_co_approver(
        &mut self,
        setup_id: &SetupId,
        step_order: u32,
        published_at: DateTime<Utc>,
    ) -> Result<Arc<ApprovalSetup>, RegistryError> {
        self.edit_step(setup_id, step_order, published_at, Step::without_co_approver)
    }

    pub fn latest(&self, setup_id: &SetupId) -> Option<Arc<ApprovalSetup>> {
        self.versions.get(setup_id).and_then(|history| history.last().cloned())
    }

    pub fn history(&self, setup_id: &SetupId) -> &[Arc<ApprovalSetup>] {
        self.versions.get(setup_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_active(&self, setup_id: &SetupId) -> bool {
        self.active.contains(setup_id)
    }

    /// Marks a setup active. Overlap with other active setups must already
    /// have been ruled out by the scope resolver.
    pub fn mark_active(&mut self, setup_id: &SetupId) -> Result<(), RegistryError> {
        if !self.versions.contains_key(setup_id) {
            return Err(RegistryError::UnknownSetup(setup_id.clone()));
        }
        self.active.insert(setup_id.clone());
        Ok(())
    }

    pub fn deactivate(&mut self, setup_id: &SetupId) -> Result<(), RegistryError> {
        if !self.versions.contains_key(setup_id) {
            return Err(RegistryError::UnknownSetup(setup_id.clone()));
        }
        if !self.active.remove(setup_id) {
            return Err(RegistryError::NotActive(setup_id.clone()));
        }
        Ok(())
    }

    /// Latest versions of active setups governing `feature`, ordered by id.
    pub fn active_for_feature(&self, feature: &str) -> Vec<Arc<ApprovalSetup>> {
        let feature = normalize_key(feature);
        let mut setups: Vec<Arc<ApprovalSetup>> = self
            .active
            .iter()
            .filter_map(|setup_id| self.latest(setup_id))
            .filter(|setup| normalize_key(&setup.feature) == feature)
            .collect();
        setups.sort_by(|left, right| left.id.cmp(&right.id));
        setups
    }

    fn next_version(&self, setup_id: &SetupId) -> u32 {
        self.latest(setup_id).map(|setup| setup.version.saturating_add(1)).unwrap_or(1)
    }

    fn append(&mut self, setup: ApprovalSetup) -> Result<Arc<ApprovalSetup>, RegistryError> {
        setup
            .validate()
            .map_err(|source| RegistryError::Invalid { setup_id: setup.id.clone(), source })?;
        let setup = Arc::new(setup);
        self.versions.entry(setup.id.clone()).or_default().push(Arc::clone(&setup));
        Ok(setup)
    }
}
