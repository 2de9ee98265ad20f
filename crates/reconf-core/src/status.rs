//! Item statuses, transition history and the resource aggregate
//!
//! [`StatusBoard`] is the single place item statuses live. Workers write
//! their own entry; everything else reads snapshots. After every change the
//! resource phase is recomputed and published on a `watch` channel, so
//! subscribers always see an aggregate that matches the latest transition.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reconf_artifact::{ItemName, Revision};
use tokio::sync::watch;

use crate::phase::{LifecycleEvent, LifecyclePhase, Phase};
use crate::types::{ConfigurationItemStatus, ResourceStatus};

/// One recorded phase change
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransitionRecord {
    /// Position in the item's log, starting at 0
    pub seq: u64,
    /// Phase before
    pub from: Phase,
    /// Phase after
    pub to: Phase,
    /// Event name
    pub event: String,
    /// Revision the item was converging to
    pub revision: Option<Revision>,
    /// When it happened
    pub at: DateTime<Utc>,
    /// Hash of the previous record
    pub prev_hash: [u8; 32],
    /// Hash of this record
    pub hash: [u8; 32],
}

impl TransitionRecord {
    fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seq.to_le_bytes());
        hasher.update(self.from.to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.to.to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.event.as_bytes());
        hasher.update(&[0]);
        match &self.revision {
            Some(rev) => hasher.update(&[1]).update(rev.as_bytes()),
            None => hasher.update(&[0]),
        };
        hasher.update(&self.at.timestamp_micros().to_le_bytes());
        hasher.update(&self.prev_hash);
        *hasher.finalize().as_bytes()
    }
}

/// Transition log failed verification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transition log broken at entry {seq}")]
pub struct IntegrityError {
    /// First bad entry
    pub seq: u64,
}

/// Bounded, hash-chained log of one item's transitions
///
/// When the log is full the oldest record is dropped and its hash becomes
/// the anchor the remaining chain is verified against.
#[derive(Debug, Clone)]
pub struct TransitionLog {
    entries: VecDeque<TransitionRecord>,
    limit: usize,
    next_seq: u64,
    anchor: [u8; 32],
}

impl TransitionLog {
    /// Empty log keeping at most `limit` records
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
            next_seq: 0,
            anchor: [0; 32],
        }
    }

    /// Append a record and return its sequence number
    pub fn append(
        &mut self,
        from: Phase,
        to: Phase,
        event: &str,
        revision: Option<Revision>,
    ) -> u64 {
        let prev_hash = self.entries.back().map_or(self.anchor, |e| e.hash);
        let mut record = TransitionRecord {
            seq: self.next_seq,
            from,
            to,
            event: event.to_string(),
            revision,
            at: Utc::now(),
            prev_hash,
            hash: [0; 32],
        };
        record.hash = record.compute_hash();
        self.next_seq += 1;
        self.entries.push_back(record);
        while self.entries.len() > self.limit {
            if let Some(oldest) = self.entries.pop_front() {
                self.anchor = oldest.hash;
            }
        }
        self.next_seq - 1
    }

    /// Records, oldest first
    #[must_use]
    pub fn records(&self) -> Vec<TransitionRecord> {
        self.entries.iter().cloned().collect()
    }

    /// Number of retained records
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check the hash chain
    ///
    /// # Errors
    /// Returns [`IntegrityError`] naming the first record that does not
    /// link to its predecessor or does not match its own hash
    pub fn verify_integrity(&self) -> Result<(), IntegrityError> {
        let mut prev = self.anchor;
        for record in &self.entries {
            if record.prev_hash != prev || record.hash != record.compute_hash() {
                return Err(IntegrityError { seq: record.seq });
            }
            prev = record.hash;
        }
        Ok(())
    }
}

/// Statuses of every item of one component
#[derive(Debug)]
pub struct StatusBoard {
    component: String,
    items: DashMap<ItemName, ConfigurationItemStatus>,
    history: DashMap<ItemName, TransitionLog>,
    resource: watch::Sender<ResourceStatus>,
    history_limit: usize,
}

impl StatusBoard {
    /// Empty board
    #[must_use]
    pub fn new(component: impl Into<String>, history_limit: usize) -> Self {
        let component = component.into();
        let (resource, _) = watch::channel(ResourceStatus::empty(component.clone()));
        Self {
            component,
            items: DashMap::new(),
            history: DashMap::new(),
            resource,
            history_limit,
        }
    }

    /// Owning component
    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Track a new item in `Creating`
    pub fn init(&self, name: &ItemName) {
        self.items
            .insert(name.clone(), ConfigurationItemStatus::new(name.clone()));
        self.history
            .insert(name.clone(), TransitionLog::new(self.history_limit));
        self.publish();
    }

    /// Record `from → to` and let `mutate` adjust the rest of the status
    ///
    /// Returns `false` if the item is not tracked.
    pub fn record_transition(
        &self,
        name: &ItemName,
        from: LifecyclePhase,
        to: LifecyclePhase,
        event: LifecycleEvent,
        mutate: impl FnOnce(&mut ConfigurationItemStatus),
    ) -> bool {
        let revision = {
            let Some(mut status) = self.items.get_mut(name) else {
                return false;
            };
            mutate(&mut status);
            status.phase = to.phase();
            status.updated_at = Utc::now();
            status.update_revision
        };
        if let Some(mut log) = self.history.get_mut(name) {
            log.append(from.phase(), to.phase(), event.name(), revision);
        }
        tracing::debug!(item = %name, from = %from.phase(), to = %to.phase(), %event, "phase transition");
        self.publish();
        true
    }

    /// Change a status without a phase change
    pub fn update(&self, name: &ItemName, mutate: impl FnOnce(&mut ConfigurationItemStatus)) -> bool {
        let found = match self.items.get_mut(name) {
            Some(mut status) => {
                mutate(&mut status);
                status.updated_at = Utc::now();
                true
            }
            None => false,
        };
        if found {
            self.publish();
        }
        found
    }

    /// Store rollout progress if `token` still owns the item's counts
    ///
    /// Progress from a superseded rollout is discarded (returns `false`).
    pub fn apply_progress(&self, name: &ItemName, token: u64, succeeded: usize, expected: usize) -> bool {
        let Some(mut status) = self.items.get_mut(name) else {
            return false;
        };
        let detail = &mut status.reconcile_detail;
        if detail.rollout_token != token {
            tracing::trace!(item = %name, token, current = detail.rollout_token, "discarding stale progress");
            return false;
        }
        let expected = i64::try_from(expected).unwrap_or(i64::MAX);
        let succeeded = i64::try_from(succeeded).unwrap_or(i64::MAX).min(expected);
        detail.succeed_count = succeeded;
        detail.expected_count = expected;
        status.updated_at = Utc::now();
        true
    }

    /// Stop tracking an item
    pub fn remove(&self, name: &str) -> Option<ConfigurationItemStatus> {
        self.history.remove(name);
        let removed = self.items.remove(name).map(|(_, status)| status);
        self.publish();
        removed
    }

    /// Status snapshot
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ConfigurationItemStatus> {
        self.items.get(name).map(|s| s.clone())
    }

    /// All statuses, by name
    #[must_use]
    pub fn list(&self) -> Vec<ConfigurationItemStatus> {
        let mut statuses: Vec<_> = self.items.iter().map(|s| s.clone()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Transition history of one item, oldest first
    #[must_use]
    pub fn history(&self, name: &str) -> Vec<TransitionRecord> {
        self.history.get(name).map(|log| log.records()).unwrap_or_default()
    }

    /// Verify one item's transition chain
    ///
    /// # Errors
    /// Returns [`IntegrityError`] if the chain is broken
    pub fn verify_history(&self, name: &str) -> Result<(), IntegrityError> {
        self.history
            .get(name)
            .map_or(Ok(()), |log| log.verify_integrity())
    }

    /// Current aggregate
    #[must_use]
    pub fn resource(&self) -> ResourceStatus {
        self.resource.borrow().clone()
    }

    /// Stream of aggregates
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ResourceStatus> {
        self.resource.subscribe()
    }

    fn publish(&self) {
        // Computed under the channel lock so concurrent publishers cannot
        // leave a stale aggregate behind.
        self.resource.send_if_modified(|current| {
            let next = self.aggregate();
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn aggregate(&self) -> ResourceStatus {
        let worst = self
            .items
            .iter()
            .map(|s| (s.phase, s.name.clone()))
            .max_by(|(pa, na), (pb, nb)| {
                (pa.severity(), *pa)
                    .cmp(&(pb.severity(), *pb))
                    .then_with(|| nb.cmp(na))
            });
        ResourceStatus {
            component: self.component.clone(),
            phase: worst.as_ref().map_or(Phase::Running, |(phase, _)| *phase),
            items: self.items.len(),
            worst_item: worst.map(|(_, name)| name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{InitStep, ReconfigPhase};
    use pretty_assertions::assert_eq;

    fn name(s: &str) -> ItemName {
        ItemName::new(s).unwrap()
    }

    fn running(board: &StatusBoard, item: &ItemName, inner: ReconfigPhase) {
        board.record_transition(
            item,
            LifecyclePhase::Init(InitStep::GenerateSidecar),
            LifecyclePhase::Running(inner),
            LifecycleEvent::InitCompleted,
            |_| {},
        );
    }

    #[test]
    fn empty_board_reports_running() {
        let board = StatusBoard::new("db", 8);
        let resource = board.resource();
        assert_eq!(resource.phase, Phase::Running);
        assert_eq!(resource.items, 0);
        assert_eq!(resource.worst_item, None);
    }

    #[test]
    fn aggregate_picks_most_severe() {
        let board = StatusBoard::new("db", 8);
        for n in ["a", "b", "c"] {
            board.init(&name(n));
        }
        running(&board, &name("a"), ReconfigPhase::Idle);
        running(&board, &name("b"), ReconfigPhase::Upgrading);
        assert_eq!(board.resource().phase, Phase::Upgrading);

        running(&board, &name("c"), ReconfigPhase::FailedAndPause);
        let resource = board.resource();
        assert_eq!(resource.phase, Phase::FailedAndPause);
        assert_eq!(resource.worst_item, Some(name("c")));

        board.remove("c");
        assert_eq!(board.resource().phase, Phase::Upgrading);
        assert_eq!(board.resource().items, 2);
    }

    #[test]
    fn subscribers_see_changes() {
        let board = StatusBoard::new("db", 8);
        let mut rx = board.subscribe();
        board.init(&name("a"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().phase, Phase::Creating);
        running(&board, &name("a"), ReconfigPhase::MergeFailed);
        assert_eq!(rx.borrow_and_update().phase, Phase::MergeFailed);
    }

    #[test]
    fn stale_progress_is_discarded() {
        let board = StatusBoard::new("db", 8);
        let item = name("a");
        board.init(&item);
        board.update(&item, |s| s.reconcile_detail.start_rollout(2, Revision::compute(b"r")));

        assert!(!board.apply_progress(&item, 1, 3, 3));
        assert_eq!(board.get("a").unwrap().reconcile_detail.succeed_count, -1);
        assert!(board.apply_progress(&item, 2, 1, 3));
        let detail = board.get("a").unwrap().reconcile_detail;
        assert_eq!((detail.succeed_count, detail.expected_count), (1, 3));
    }

    #[test]
    fn history_is_bounded_and_chained() {
        let board = StatusBoard::new("db", 3);
        let item = name("a");
        board.init(&item);
        board.record_transition(
            &item,
            LifecyclePhase::Creating,
            LifecyclePhase::Init(InitStep::Prepare),
            LifecycleEvent::InitStarted,
            |_| {},
        );
        for _ in 0..4 {
            running(&board, &item, ReconfigPhase::Idle);
        }
        let history = board.history("a");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].seq, 2);
        assert!(board.verify_history("a").is_ok());
    }

    #[test]
    fn tampered_log_fails_verification() {
        let mut log = TransitionLog::new(4);
        log.append(Phase::Creating, Phase::Init, "init-started", None);
        log.append(Phase::Init, Phase::Running, "creating-complete", None);
        assert!(log.verify_integrity().is_ok());
        if let Some(first) = log.entries.front_mut() {
            first.event = "forged".into();
        }
        assert_eq!(log.verify_integrity(), Err(IntegrityError { seq: 0 }));
    }

    #[test]
    fn unknown_item_is_ignored() {
        let board = StatusBoard::new("db", 8);
        assert!(!board.update(&name("x"), |_| {}));
        assert!(!board.apply_progress(&name("x"), 0, 0, 0));
        assert!(board.get("x").is_none());
    }
}
