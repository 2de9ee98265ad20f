//! Per-item phase machines
//!
//! Two nested machines:
//!
//! - [`LifecyclePhase`]: `Creating → Init → Running → Deleting`, plus the
//!   pseudo-terminal `CreateFailed` and the teardown state `Finished`.
//! - [`ReconfigPhase`]: the reconfiguration cycle hosted by `Running`.
//!
//! Transitions are pure functions over `Copy` values: an illegal
//! (state, event) pair returns [`TransitionError`] and the caller keeps the
//! state it had. [`Phase`] flattens both machines for reporting only.

use std::fmt::{self, Display, Formatter};

use crate::config::FailurePolicy;

/// Steps of initial creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitStep {
    /// Resolve the template
    Prepare,
    /// Merge template and overrides
    Render,
    /// Resolve the reload executor for the template's policy
    GenerateSidecar,
}

impl InitStep {
    /// Following step, `None` after the last one
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Prepare => Some(Self::Render),
            Self::Render => Some(Self::GenerateSidecar),
            Self::GenerateSidecar => None,
        }
    }
}

/// Inner reconfiguration machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconfigPhase {
    /// Converged on the last applied revision
    Idle,
    /// Trigger accepted, merge not yet run
    Pending,
    /// Merge produced a new revision
    Merged,
    /// Merge failed; waits for a corrected trigger
    MergeFailed,
    /// Rollout in progress
    Upgrading,
    /// Retry budget exhausted; waiting for backoff
    FailedAndRetry,
    /// Stopped; waits for resume or a new trigger
    FailedAndPause,
}

/// Events of the inner machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconfigEvent {
    /// Content or marker changed (or a forced re-render)
    Trigger,
    /// Merge produced a new revision
    MergeSucceeded,
    /// Merge produced the revision already applied
    MergeUnchanged,
    /// Merge failed
    MergeFailed,
    /// Rollout handed to the dispatcher
    RolloutDispatched,
    /// Every instance applied the revision
    RolloutSucceeded,
    /// Some instances failed; retry budget remains
    RolloutRetry,
    /// Some instances failed; retry budget exhausted
    RolloutExhausted(FailurePolicy),
    /// Rollout cannot succeed without intervention
    RolloutFatal,
    /// Backoff after exhaustion elapsed
    BackoffElapsed,
    /// Explicit resume
    Resume,
}

impl ReconfigEvent {
    /// Stable event name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::MergeSucceeded => "merge-succeeded",
            Self::MergeUnchanged => "merge-unchanged",
            Self::MergeFailed => "merge-failed",
            Self::RolloutDispatched => "rollout-dispatched",
            Self::RolloutSucceeded => "rollout-succeeded",
            Self::RolloutRetry => "rollout-retry",
            Self::RolloutExhausted(FailurePolicy::Retry) => "rollout-exhausted-retry",
            Self::RolloutExhausted(FailurePolicy::Pause) => "rollout-exhausted-pause",
            Self::RolloutFatal => "rollout-fatal",
            Self::BackoffElapsed => "backoff-elapsed",
            Self::Resume => "resume",
        }
    }
}

impl ReconfigPhase {
    /// Apply `event`
    ///
    /// # Errors
    /// Returns [`TransitionError`] for any pair not in the transition table
    pub fn apply(self, event: ReconfigEvent) -> Result<Self, TransitionError> {
        use ReconfigEvent as E;
        use ReconfigPhase as P;

        let next = match (self, event) {
            (P::Idle | P::MergeFailed | P::Upgrading | P::FailedAndRetry | P::FailedAndPause, E::Trigger) => {
                P::Pending
            }
            (P::Pending, E::MergeSucceeded) => P::Merged,
            (P::Pending, E::MergeUnchanged) | (P::Upgrading, E::RolloutSucceeded) => P::Idle,
            (P::Pending, E::MergeFailed) => P::MergeFailed,
            (P::Merged, E::RolloutDispatched)
            | (P::Upgrading, E::RolloutRetry)
            | (P::FailedAndRetry, E::BackoffElapsed)
            | (P::FailedAndPause, E::Resume) => P::Upgrading,
            (P::Upgrading, E::RolloutExhausted(FailurePolicy::Retry)) => P::FailedAndRetry,
            (P::Upgrading, E::RolloutExhausted(FailurePolicy::Pause) | E::RolloutFatal) => {
                P::FailedAndPause
            }
            _ => {
                return Err(TransitionError {
                    from: Phase::from(self),
                    event: event.name(),
                })
            }
        };
        Ok(next)
    }
}

/// Outer lifecycle machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    /// Registered, not yet initialized
    Creating,
    /// Running initial creation
    Init(InitStep),
    /// Created; hosts the reconfiguration machine
    Running(ReconfigPhase),
    /// Initial creation failed
    CreateFailed,
    /// Item removed; status about to be dropped
    Deleting,
    /// Owning resource torn down
    Finished,
}

/// Events of the outer machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Begin initial creation
    InitStarted,
    /// Current init step done (not the last)
    StepCompleted,
    /// Last init step done ("creating complete")
    InitCompleted,
    /// Any init step failed
    InitFailed,
    /// Corrected trigger or resume after `CreateFailed`
    InitRetried,
    /// Inner machine event
    Reconfig(ReconfigEvent),
    /// Item removed from the resource
    Removed,
    /// Owning resource torn down
    TornDown,
}

impl LifecycleEvent {
    /// Stable event name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::InitStarted => "init-started",
            Self::StepCompleted => "step-completed",
            Self::InitCompleted => "creating-complete",
            Self::InitFailed => "init-failed",
            Self::InitRetried => "init-retried",
            Self::Reconfig(e) => e.name(),
            Self::Removed => "removed",
            Self::TornDown => "torn-down",
        }
    }
}

impl Display for LifecycleEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl LifecyclePhase {
    /// Apply `event`
    ///
    /// # Errors
    /// Returns [`TransitionError`] for any pair not in the transition table
    pub fn apply(self, event: LifecycleEvent) -> Result<Self, TransitionError> {
        use LifecycleEvent as E;
        use LifecyclePhase as L;

        let illegal = || TransitionError {
            from: Phase::from(self),
            event: event.name(),
        };
        let next = match (self, event) {
            (L::Finished, _) => return Err(illegal()),
            (_, E::TornDown) => L::Finished,
            (L::Deleting, _) => return Err(illegal()),
            (_, E::Removed) => L::Deleting,
            (L::Creating, E::InitStarted) | (L::CreateFailed, E::InitRetried) => {
                L::Init(InitStep::Prepare)
            }
            (L::Init(step), E::StepCompleted) => L::Init(step.next().ok_or_else(illegal)?),
            (L::Init(InitStep::GenerateSidecar), E::InitCompleted) => L::Running(ReconfigPhase::Idle),
            (L::Init(_), E::InitFailed) => L::CreateFailed,
            (L::Running(inner), E::Reconfig(e)) => L::Running(inner.apply(e)?),
            _ => return Err(illegal()),
        };
        Ok(next)
    }

    /// Flat reporting phase
    #[must_use]
    pub fn phase(self) -> Phase {
        match self {
            Self::Creating => Phase::Creating,
            Self::Init(_) => Phase::Init,
            Self::Running(inner) => Phase::from(inner),
            Self::CreateFailed => Phase::CreateFailed,
            Self::Deleting => Phase::Deleting,
            Self::Finished => Phase::Finished,
        }
    }
}

/// Flat phase, for status reporting and aggregation
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Phase {
    /// Registered, not yet initialized
    Creating,
    /// Initial creation in progress
    Init,
    /// Converged
    Running,
    /// Trigger accepted
    Pending,
    /// New revision merged
    Merged,
    /// Merge failed
    MergeFailed,
    /// Rollout in progress
    Upgrading,
    /// Waiting for backoff after exhausted retries
    FailedAndRetry,
    /// Stopped until intervention
    FailedAndPause,
    /// Initial creation failed
    CreateFailed,
    /// Being removed
    Deleting,
    /// Resource torn down
    Finished,
}

impl Phase {
    /// Aggregation severity; higher is worse
    ///
    /// `FailedAndPause` = `CreateFailed` > `MergeFailed` > `FailedAndRetry` >
    /// `Upgrading`/`Pending`/`Merged` > `Running`/`Finished` >
    /// `Creating`/`Init` > `Deleting`
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::FailedAndPause | Self::CreateFailed => 6,
            Self::MergeFailed => 5,
            Self::FailedAndRetry => 4,
            Self::Upgrading | Self::Pending | Self::Merged => 3,
            Self::Running | Self::Finished => 2,
            Self::Creating | Self::Init => 1,
            Self::Deleting => 0,
        }
    }

    /// Phases that wait for intervention
    #[must_use]
    pub const fn requires_intervention(self) -> bool {
        matches!(self, Self::FailedAndPause | Self::CreateFailed | Self::MergeFailed)
    }

    /// Most severe phase; `Running` when there are none
    pub fn aggregate<I>(phases: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        phases
            .into_iter()
            .max_by_key(|p| (p.severity(), *p))
            .unwrap_or(Self::Running)
    }
}

impl From<ReconfigPhase> for Phase {
    fn from(inner: ReconfigPhase) -> Self {
        match inner {
            ReconfigPhase::Idle => Self::Running,
            ReconfigPhase::Pending => Self::Pending,
            ReconfigPhase::Merged => Self::Merged,
            ReconfigPhase::MergeFailed => Self::MergeFailed,
            ReconfigPhase::Upgrading => Self::Upgrading,
            ReconfigPhase::FailedAndRetry => Self::FailedAndRetry,
            ReconfigPhase::FailedAndPause => Self::FailedAndPause,
        }
    }
}

impl From<LifecyclePhase> for Phase {
    fn from(outer: LifecyclePhase) -> Self {
        outer.phase()
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Rejected (state, event) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition: event '{event}' in phase {from}")]
pub struct TransitionError {
    /// Phase the event was applied to
    pub from: Phase,
    /// Event name
    pub event: &'static str,
}
