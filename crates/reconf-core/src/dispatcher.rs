//! Rollout dispatcher
//!
//! Applies one [`RenderedConfig`] to the live instance set through the
//! [`ReloadExecutor`] registered for the template's [`ReloadPolicy`].
//!
//! One call to [`RolloutDispatcher::dispatch`] is one attempt. Instances
//! recorded in the caller's done-set are not re-applied, so a retry only
//! touches the instances that failed (or joined) since the last attempt.
//! Dropping the returned future abandons every in-flight apply.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use reconf_artifact::RenderedConfig;
use reconf_merge::ReloadPolicy;

use crate::error::{ReconfError, ReloadError};
use crate::provider::InstanceProvider;
use crate::types::Instance;

/// Applies configuration to one instance
#[async_trait]
pub trait ReloadExecutor: Send + Sync + fmt::Debug {
    /// Push `config` to `instance` and make it take effect
    ///
    /// # Errors
    /// [`ReloadError::Failed`] if a retry may help, [`ReloadError::Fatal`]
    /// if the whole rollout must stop
    async fn apply(
        &self,
        instance: &Instance,
        config: &RenderedConfig,
        policy: ReloadPolicy,
    ) -> Result<(), ReloadError>;
}

/// Executors by reload policy
#[derive(Debug, Clone, Default)]
pub struct ReloadExecutors {
    executors: HashMap<ReloadPolicy, Arc<dyn ReloadExecutor>>,
}

impl ReloadExecutors {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any previous one for `policy`
    pub fn register(&mut self, policy: ReloadPolicy, executor: Arc<dyn ReloadExecutor>) {
        self.executors.insert(policy, executor);
    }

    /// Builder form of [`register`](Self::register)
    #[must_use]
    pub fn with(mut self, policy: ReloadPolicy, executor: Arc<dyn ReloadExecutor>) -> Self {
        self.register(policy, executor);
        self
    }

    /// Register `executor` for every policy
    #[must_use]
    pub fn all(executor: Arc<dyn ReloadExecutor>) -> Self {
        ReloadPolicy::ALL
            .into_iter()
            .fold(Self::new(), |set, policy| set.with(policy, Arc::clone(&executor)))
    }

    /// Executor for `policy`
    #[must_use]
    pub fn get(&self, policy: ReloadPolicy) -> Option<&Arc<dyn ReloadExecutor>> {
        self.executors.get(&policy)
    }

    /// Check if `policy` has an executor
    #[must_use]
    pub fn contains(&self, policy: ReloadPolicy) -> bool {
        self.executors.contains_key(&policy)
    }
}

/// Receives progress while a rollout runs
pub trait ProgressSink: Send + Sync {
    /// Absolute counts for the current attempt
    fn report(&self, succeeded: usize, expected: usize);
}

impl<F> ProgressSink for F
where
    F: Fn(usize, usize) + Send + Sync,
{
    fn report(&self, succeeded: usize, expected: usize) {
        self(succeeded, expected);
    }
}

/// One instance that did not apply the revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFailure {
    /// Instance id
    pub instance: String,
    /// What went wrong
    pub error: ReloadError,
}

/// How an attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutOutcome {
    /// Every instance applied the revision
    Success,
    /// Some instances failed; retrying may help
    Partial,
    /// Retrying will not help, including an unreachable instance set
    Fatal(String),
}

/// Result of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutReport {
    /// Instance set size at dispatch
    pub expected: usize,
    /// Instances holding the revision
    pub succeeded: usize,
    /// Failures of this attempt
    pub failures: Vec<InstanceFailure>,
    /// Overall result
    pub outcome: RolloutOutcome,
}

impl RolloutReport {
    fn fatal(reason: impl Into<String>) -> Self {
        Self {
            expected: 0,
            succeeded: 0,
            failures: Vec::new(),
            outcome: RolloutOutcome::Fatal(reason.into()),
        }
    }

    /// Check if every instance applied the revision
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == RolloutOutcome::Success
    }

    /// Check if the attempt may be repeated
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.outcome == RolloutOutcome::Partial
    }

    /// Error equivalent of a failed attempt
    #[must_use]
    pub fn error(&self) -> Option<ReconfError> {
        match &self.outcome {
            RolloutOutcome::Success => None,
            RolloutOutcome::Partial => Some(ReconfError::PartialRolloutFailure {
                succeeded: self.succeeded,
                expected: self.expected,
                message: self
                    .failures
                    .iter()
                    .map(|f| f.error.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            }),
            RolloutOutcome::Fatal(reason) => Some(ReconfError::FatalRolloutFailure(reason.clone())),
        }
    }
}

/// Fans a revision out to the instances of one component
#[derive(Debug, Clone)]
pub struct RolloutDispatcher {
    instances: Arc<dyn InstanceProvider>,
    executors: Arc<ReloadExecutors>,
    concurrency: usize,
}

impl RolloutDispatcher {
    /// Create a dispatcher applying to at most `concurrency` instances at once
    #[must_use]
    pub fn new(
        instances: Arc<dyn InstanceProvider>,
        executors: Arc<ReloadExecutors>,
        concurrency: usize,
    ) -> Self {
        Self {
            instances,
            executors,
            concurrency: concurrency.max(1),
        }
    }

    /// Registered executors
    #[must_use]
    pub fn executors(&self) -> &ReloadExecutors {
        &self.executors
    }

    /// Run one attempt
    ///
    /// `done` holds the ids that already applied this revision. It is
    /// pruned to the current instance set and extended with every instance
    /// that succeeds. `sink` sees absolute counts after every success.
    pub async fn dispatch(
        &self,
        component: &str,
        config: &RenderedConfig,
        policy: ReloadPolicy,
        done: &Mutex<HashSet<String>>,
        sink: &dyn ProgressSink,
    ) -> RolloutReport {
        let Some(executor) = self.executors.get(policy) else {
            return RolloutReport::fatal(ReloadError::NoExecutor(policy).to_string());
        };
        let instances = match self.instances.current_instances(component).await {
            Ok(instances) => instances,
            Err(err) => {
                tracing::warn!(component, error = %err, "cannot list instances");
                return RolloutReport::fatal(format!("instance set unreachable: {err}"));
            }
        };

        let expected = instances.len();
        let pending: Vec<Instance> = {
            let mut done = done.lock();
            let present: HashSet<&str> = instances.iter().map(|i| i.id.as_str()).collect();
            done.retain(|id| present.contains(id.as_str()));
            instances
                .iter()
                .filter(|i| !done.contains(&i.id))
                .cloned()
                .collect()
        };
        let mut succeeded = expected - pending.len();
        sink.report(succeeded, expected);

        tracing::debug!(
            component,
            revision = %config.revision().short(),
            %policy,
            expected,
            pending = pending.len(),
            "dispatching rollout attempt"
        );

        let executor = executor.as_ref();
        let mut results = stream::iter(pending)
            .map(|instance: Instance| async move {
                let result = executor.apply(&instance, config, policy).await;
                (instance, result)
            })
            .buffer_unordered(self.concurrency);

        let mut failures = Vec::new();
        let mut fatal = None;
        while let Some((instance, result)) = results.next().await {
            match result {
                Ok(()) => {
                    done.lock().insert(instance.id.clone());
                    succeeded += 1;
                    sink.report(succeeded, expected);
                }
                Err(error) => {
                    tracing::warn!(instance = %instance.id, error = %error, "instance reload failed");
                    let is_fatal = error.is_fatal();
                    if is_fatal {
                        fatal = Some(error.to_string());
                    }
                    failures.push(InstanceFailure {
                        instance: instance.id.clone(),
                        error,
                    });
                    if is_fatal {
                        break;
                    }
                }
            }
        }
        drop(results);

        let outcome = match fatal {
            Some(reason) => RolloutOutcome::Fatal(reason),
            None if failures.is_empty() => RolloutOutcome::Success,
            None => RolloutOutcome::Partial,
        };
        RolloutReport {
            expected,
            succeeded,
            failures,
            outcome,
        }
    }
}
