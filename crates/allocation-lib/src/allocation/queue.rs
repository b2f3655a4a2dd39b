//! Ordered queue of pods waiting for a resize decision

use crate::models::PodUid;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

/// Attributes that decide the order in which pending resizes are retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizePriorityKey {
    /// The resize asks for more cpu or memory than is allocated
    pub increasing: bool,
    pub priority: i32,
    pub guaranteed: bool,
    /// Transition time of the pod's pending condition
    pub pending_since: Option<DateTime<Utc>>,
}

/// Total order over pending resizes, most urgent first
///
/// Shrinking resizes go first since they can only free room, then higher
/// priority, then Guaranteed pods, then the resize deferred the longest.
/// Resizes that were never evaluated come last.
pub fn compare_resize_priority(a: &ResizePriorityKey, b: &ResizePriorityKey) -> Ordering {
    a.increasing
        .cmp(&b.increasing)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| b.guaranteed.cmp(&a.guaranteed))
        .then_with(|| match (a.pending_since, b.pending_since) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

/// Pods with a resize that has not been allocated yet
#[derive(Debug, Default)]
pub struct PendingResizeQueue {
    uids: Vec<PodUid>,
}

impl PendingResizeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pod; returns false if it was already queued
    pub fn push(&mut self, uid: PodUid) -> bool {
        if self.uids.contains(&uid) {
            return false;
        }
        self.uids.push(uid);
        true
    }

    pub fn remove(&mut self, uid: &PodUid) -> bool {
        let before = self.uids.len();
        self.uids.retain(|u| u != uid);
        self.uids.len() != before
    }

    pub fn contains(&self, uid: &PodUid) -> bool {
        self.uids.contains(uid)
    }

    /// Drain the queue in its current order
    pub fn take(&mut self) -> Vec<PodUid> {
        std::mem::take(&mut self.uids)
    }

    pub fn extend(&mut self, uids: impl IntoIterator<Item = PodUid>) {
        for uid in uids {
            self.push(uid);
        }
    }

    /// Keep only queued pods for which `keep` is true
    pub fn retain(&mut self, mut keep: impl FnMut(&PodUid) -> bool) {
        self.uids.retain(|uid| keep(uid));
    }

    /// Stable sort by priority key; pods without a key are dropped
    pub fn sort_by_key_fn(&mut self, mut key: impl FnMut(&PodUid) -> Option<ResizePriorityKey>) {
        let mut keyed: Vec<(PodUid, ResizePriorityKey)> = self
            .uids
            .drain(..)
            .filter_map(|uid| key(&uid).map(|k| (uid, k)))
            .collect();
        keyed.sort_by(|(_, a), (_, b)| compare_resize_priority(a, b));
        self.uids = keyed.into_iter().map(|(uid, _)| uid).collect();
    }

    pub fn uids(&self) -> &[PodUid] {
        &self.uids
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }
}
