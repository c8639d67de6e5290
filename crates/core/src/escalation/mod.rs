//! Auto-reject timers.
//!
//! The scheduler only books deadlines. Firing is done by the workflow
//! service, which re-checks instance state under the instance lock before
//! committing an auto-rejection.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::instance::InstanceId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmedTimer {
    pub instance_id: InstanceId,
    pub step_order: u32,
    pub deadline: DateTime<Utc>,
}

/// `entered_at + auto_reject_days` calendar days, or `None` when the setup
/// disables auto-rejection.
pub fn deadline_for(entered_at: DateTime<Utc>, auto_reject_days: u32) -> Option<DateTime<Utc>> {
    if auto_reject_days == 0 {
        return None;
    }
    entered_at.checked_add_signed(Duration::days(i64::from(auto_reject_days)))
}

#[derive(Clone, Debug, Default)]
pub struct EscalationScheduler {
    timers: HashMap<(InstanceId, u32), DateTime<Utc>>,
}

impl EscalationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a timer, replacing any timer already armed for the same
    /// `(instance, step)` pair.
    pub fn arm(&mut self, instance_id: InstanceId, step_order: u32, deadline: DateTime<Utc>) {
        self.timers.insert((instance_id, step_order), deadline);
    }

    pub fn cancel(&mut self, instance_id: &InstanceId, step_order: u32) -> bool {
        self.timers.remove(&(instance_id.clone(), step_order)).is_some()
    }

    pub fn deadline(&self, instance_id: &InstanceId, step_order: u32) -> Option<DateTime<Utc>> {
        self.timers.get(&(instance_id.clone(), step_order)).copied()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Timers with `deadline <= now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<ArmedTimer> {
        let mut due: Vec<ArmedTimer> = self
            .timers
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|((instance_id, step_order), deadline)| ArmedTimer {
                instance_id: instance_id.clone(),
                step_order: *step_order,
                deadline: *deadline,
            })
            .collect();
        due.sort_by(|left, right| {
            left.deadline
                .cmp(&right.deadline)
                .then_with(|| left.instance_id.cmp(&right.instance_id))
                .then_with(|| left.step_order.cmp(&right.step_order))
        });
        due
    }

    pub fn armed(&self) -> Vec<ArmedTimer> {
        self.due(DateTime::<Utc>::MAX_UTC)
    }

    /// Like `due`, but disarms what it returns.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<ArmedTimer> {
        let due = self.due(now);
        for timer in &due {
            self.timers.remove(&(timer.instance_id.clone(), timer.step_order));
        }
        due
    }
}
