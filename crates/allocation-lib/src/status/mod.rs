//! Pod resize conditions
//!
//! Tracks the `PodResizePending` and `PodResizeInProgress` conditions of every
//! pod on the node and broadcasts each change so a status reporter can surface
//! them on the pod's observable status.

use crate::models::PodUid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the condition update broadcast channel
const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeConditionType {
    PodResizePending,
    PodResizeInProgress,
}

/// Why a resize is pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeReason {
    /// The node cannot fit the resize right now; it is retried automatically
    Deferred,
    /// The resize can never be applied as requested
    Infeasible,
}

impl fmt::Display for ResizeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResizeReason::Deferred => write!(f, "Deferred"),
            ResizeReason::Infeasible => write!(f, "Infeasible"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeCondition {
    #[serde(rename = "type")]
    pub condition_type: ResizeConditionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ResizeReason>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub observed_generation: i64,
    pub last_probe_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
}

impl ResizeCondition {
    /// Build the next version of a condition, keeping the transition time while
    /// the reason is unchanged
    fn updated(
        condition_type: ResizeConditionType,
        previous: Option<&ResizeCondition>,
        reason: Option<ResizeReason>,
        message: String,
        observed_generation: i64,
    ) -> Self {
        let now = Utc::now();
        let last_transition_time = match previous {
            Some(prev) if prev.reason == reason => prev.last_transition_time,
            _ => now,
        };
        Self {
            condition_type,
            reason,
            message,
            observed_generation,
            last_probe_time: now,
            last_transition_time,
        }
    }

    /// Equality ignoring probe time
    pub fn same_as(&self, other: &ResizeCondition) -> bool {
        self.condition_type == other.condition_type
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
            && self.last_transition_time == other.last_transition_time
    }
}

/// Summarized resize state of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeState {
    InProgress,
    Deferred,
    Infeasible,
    None,
}

impl fmt::Display for ResizeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResizeState::InProgress => write!(f, "InProgress"),
            ResizeState::Deferred => write!(f, "Deferred"),
            ResizeState::Infeasible => write!(f, "Infeasible"),
            ResizeState::None => write!(f, "None"),
        }
    }
}

/// A change to a pod's resize conditions
#[derive(Debug, Clone)]
pub struct ConditionUpdate {
    pub uid: PodUid,
    pub state: ResizeState,
    pub conditions: Vec<ResizeCondition>,
}

#[derive(Debug, Clone, Default)]
struct PodResizeConditions {
    pending: Option<ResizeCondition>,
    in_progress: Option<ResizeCondition>,
}

impl PodResizeConditions {
    fn to_vec(&self) -> Vec<ResizeCondition> {
        self.pending
            .iter()
            .chain(self.in_progress.iter())
            .cloned()
            .collect()
    }

    fn state(&self) -> ResizeState {
        match (&self.pending, &self.in_progress) {
            (Some(p), _) if p.reason == Some(ResizeReason::Infeasible) => ResizeState::Infeasible,
            (Some(_), _) => ResizeState::Deferred,
            (None, Some(_)) => ResizeState::InProgress,
            (None, None) => ResizeState::None,
        }
    }

    fn is_empty(&self) -> bool {
        self.pending.is_none() && self.in_progress.is_none()
    }
}

/// Cache of resize conditions for the pods on this node
pub struct ResizeStatusStore {
    conditions: RwLock<HashMap<PodUid, PodResizeConditions>>,
    updates: broadcast::Sender<ConditionUpdate>,
}

impl Default for ResizeStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResizeStatusStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            conditions: RwLock::new(HashMap::new()),
            updates,
        }
    }

    /// Subscribe to condition changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConditionUpdate> {
        self.updates.subscribe()
    }

    /// Set the pending condition. Returns true if the conditions changed.
    pub fn set_pending(
        &self,
        uid: &PodUid,
        reason: ResizeReason,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> bool {
        let message = message.into();
        self.modify(uid, |conditions| {
            conditions.pending = Some(ResizeCondition::updated(
                ResizeConditionType::PodResizePending,
                conditions.pending.as_ref(),
                Some(reason),
                message,
                observed_generation,
            ));
        })
    }

    /// Clear the pending condition. Returns true if one was present.
    pub fn clear_pending(&self, uid: &PodUid) -> bool {
        self.modify(uid, |conditions| conditions.pending = None)
    }

    /// Set the in-progress condition. Returns true if the conditions changed.
    pub fn set_in_progress(
        &self,
        uid: &PodUid,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> bool {
        let message = message.into();
        self.modify(uid, |conditions| {
            conditions.in_progress = Some(ResizeCondition::updated(
                ResizeConditionType::PodResizeInProgress,
                conditions.in_progress.as_ref(),
                None,
                message,
                observed_generation,
            ));
        })
    }

    /// Clear the in-progress condition. Returns true if one was present.
    pub fn clear_in_progress(&self, uid: &PodUid) -> bool {
        self.modify(uid, |conditions| conditions.in_progress = None)
    }

    /// Current conditions of a pod, pending first
    pub fn conditions(&self, uid: &PodUid) -> Vec<ResizeCondition> {
        self.read(uid, PodResizeConditions::to_vec).unwrap_or_default()
    }

    pub fn resize_state(&self, uid: &PodUid) -> ResizeState {
        self.read(uid, PodResizeConditions::state)
            .unwrap_or(ResizeState::None)
    }

    pub fn is_deferred(&self, uid: &PodUid) -> bool {
        self.resize_state(uid) == ResizeState::Deferred
    }

    pub fn is_infeasible(&self, uid: &PodUid) -> bool {
        self.resize_state(uid) == ResizeState::Infeasible
    }

    /// When the pod's pending condition last changed reason
    pub fn pending_since(&self, uid: &PodUid) -> Option<DateTime<Utc>> {
        self.read(uid, |c| c.pending.as_ref().map(|p| p.last_transition_time))
            .flatten()
    }

    /// Drop all conditions of a pod
    pub fn remove_pod(&self, uid: &PodUid) {
        let removed = self
            .conditions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid)
            .is_some();
        if removed {
            debug!(pod_uid = %uid, "Removed resize conditions");
            self.publish(uid, &PodResizeConditions::default());
        }
    }

    fn read<T>(&self, uid: &PodUid, f: impl FnOnce(&PodResizeConditions) -> T) -> Option<T> {
        self.conditions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .map(f)
    }

    fn modify(&self, uid: &PodUid, f: impl FnOnce(&mut PodResizeConditions)) -> bool {
        let (changed, snapshot) = {
            let mut all = self.conditions.write().unwrap_or_else(PoisonError::into_inner);
            let entry = all.entry(uid.clone()).or_default();
            let before = entry.clone();
            f(entry);

            let changed = !same_conditions(&before.pending, &entry.pending)
                || !same_conditions(&before.in_progress, &entry.in_progress);
            let snapshot = entry.clone();
            if entry.is_empty() {
                all.remove(uid);
            }
            (changed, snapshot)
        };

        if changed {
            self.publish(uid, &snapshot);
        }
        changed
    }

    fn publish(&self, uid: &PodUid, conditions: &PodResizeConditions) {
        // No subscribers is fine; updates are advisory
        let _ = self.updates.send(ConditionUpdate {
            uid: uid.clone(),
            state: conditions.state(),
            conditions: conditions.to_vec(),
        });
    }
}

fn same_conditions(a: &Option<ResizeCondition>, b: &Option<ResizeCondition>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.same_as(b),
        (None, None) => true,
        _ => false,
    }
}

/// Whether two condition sets are equal, ignoring probe times
pub fn conditions_equivalent(a: &[ResizeCondition], b: &[ResizeCondition]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.same_as(b))
}
