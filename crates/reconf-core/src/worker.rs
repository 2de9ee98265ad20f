//! Per-item worker
//!
//! Every item is owned by one tokio task that alone drives its phase
//! machine. Callers talk to it through a bounded command queue, so at most
//! one revision is ever in flight per item and a newer trigger either waits
//! in the queue or explicitly supersedes the running rollout.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reconf_artifact::{ItemName, RenderedConfig, Revision};
use reconf_merge::{
    ConfigTemplate, MergeError, MergeOutcome, MergePipeline, MergeRequest, ReloadPolicy,
    RenderContext,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::{EngineConfig, FailurePolicy};
use crate::dispatcher::{RolloutDispatcher, RolloutOutcome, RolloutReport};
use crate::error::{ReconfError, ReloadError};
use crate::phase::{LifecycleEvent, LifecyclePhase, ReconfigEvent, ReconfigPhase, TransitionError};
use crate::provider::TemplateStore;
use crate::status::StatusBoard;
use crate::types::{ConfigurationItem, ConfigurationItemStatus, ExecResult};

/// Requests handled by a worker
#[derive(Debug)]
pub(crate) enum Command {
    /// New item definition; `force` re-renders even if inputs are unchanged
    Trigger {
        item: ConfigurationItem,
        force: bool,
    },
    /// Leave `FailedAndPause` or re-run a failed init
    Resume {
        reply: oneshot::Sender<Result<(), ReconfError>>,
    },
    /// Item removed; drop the status and exit
    Remove,
    /// Resource torn down
    Teardown,
}

/// Services shared by every worker of one engine
#[derive(Debug)]
pub(crate) struct WorkerContext {
    pub(crate) component: String,
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn TemplateStore>,
    pub(crate) pipeline: MergePipeline,
    pub(crate) dispatcher: RolloutDispatcher,
    pub(crate) board: Arc<StatusBoard>,
}

/// Engine-side end of a worker
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub(crate) tx: mpsc::Sender<Command>,
    pub(crate) join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Start a worker for `item`
    pub(crate) fn spawn(ctx: Arc<WorkerContext>, item: ConfigurationItem) -> Self {
        let (tx, rx) = mpsc::channel(ctx.config.command_buffer.max(1));
        ctx.board.init(&item.name);
        let span = tracing::info_span!("item", name = %item.name);
        let worker = Worker::new(ctx, item, rx);
        let join = tokio::spawn(worker.run().instrument(span));
        Self { tx, join }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// One revision being pushed to the instance set
#[derive(Debug)]
struct Rollout {
    token: u64,
    config: Arc<RenderedConfig>,
    policy: ReloadPolicy,
    done: Arc<Mutex<HashSet<String>>>,
    retries_used: u32,
    round: u32,
    delay: Duration,
}

impl Rollout {
    fn revision(&self) -> Revision {
        self.config.revision()
    }
}

struct Worker {
    ctx: Arc<WorkerContext>,
    name: ItemName,
    item: ConfigurationItem,
    fingerprint: Option<Revision>,
    phase: LifecyclePhase,
    last_done: Option<Revision>,
    /// Files behind `last_done`, diffed to pick the reload policy
    applied: Option<Arc<RenderedConfig>>,
    rollout: Option<Rollout>,
    next_token: u64,
    rx: mpsc::Receiver<Command>,
}

impl Worker {
    fn new(ctx: Arc<WorkerContext>, item: ConfigurationItem, rx: mpsc::Receiver<Command>) -> Self {
        Self {
            ctx,
            name: item.name.clone(),
            fingerprint: item.fingerprint().ok(),
            item,
            phase: LifecyclePhase::Creating,
            last_done: None,
            applied: None,
            rollout: None,
            next_token: 0,
            rx,
        }
    }

    async fn run(mut self) {
        if self.step(LifecycleEvent::InitStarted, |_| {}) {
            self.init().await;
        }
        loop {
            let flow = match self.phase {
                LifecyclePhase::Running(ReconfigPhase::Pending) => {
                    self.reconcile().await;
                    Flow::Continue
                }
                LifecyclePhase::Running(ReconfigPhase::Upgrading) => self.upgrade().await,
                LifecyclePhase::Running(ReconfigPhase::FailedAndRetry) => self.backoff().await,
                LifecyclePhase::Deleting | LifecyclePhase::Finished => Flow::Exit,
                _ => match self.rx.recv().await {
                    Some(command) => self.handle(command).await,
                    None => self.teardown(),
                },
            };
            if flow == Flow::Exit {
                break;
            }
        }
        tracing::debug!(item = %self.name, "worker stopped");
    }

    /// Apply `event` and record it; illegal events are logged and dropped
    fn step(&mut self, event: LifecycleEvent, mutate: impl FnOnce(&mut ConfigurationItemStatus)) -> bool {
        match self.phase.apply(event) {
            Ok(next) => {
                let from = self.phase;
                self.phase = next;
                self.ctx.board.record_transition(&self.name, from, next, event, mutate);
                true
            }
            Err(err) => {
                tracing::warn!(item = %self.name, error = %err, "rejected transition");
                false
            }
        }
    }

    fn reconfig(&mut self, event: ReconfigEvent, mutate: impl FnOnce(&mut ConfigurationItemStatus)) -> bool {
        self.step(LifecycleEvent::Reconfig(event), mutate)
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.item.failure_policy.unwrap_or(self.ctx.config.failure_policy)
    }

    /// Store a new definition; returns whether it changes rendered content
    fn accept(&mut self, item: ConfigurationItem, force: bool) -> bool {
        let fingerprint = match item.fingerprint() {
            Ok(fp) => Some(fp),
            Err(err) => {
                tracing::warn!(item = %self.name, error = %err, "cannot fingerprint item, forcing render");
                None
            }
        };
        let changed = force || fingerprint.is_none() || fingerprint != self.fingerprint;
        self.item = item;
        if changed {
            self.fingerprint = fingerprint;
        } else {
            tracing::debug!(item = %self.name, "trigger unchanged, ignoring");
        }
        changed
    }

    async fn resolve(&self) -> Result<ConfigTemplate, ReconfError> {
        let template = self.item.effective_template();
        self.ctx
            .store
            .resolve_template(template)
            .await
            .map_err(ReconfError::from)
    }

    fn merge(&self, template: &ConfigTemplate) -> Result<MergeOutcome, MergeError> {
        let context = RenderContext::new(self.name.clone(), self.ctx.component.clone())
            .with_marker(self.item.trigger_marker.clone());
        self.ctx.pipeline.merge(&MergeRequest {
            template,
            overrides: &self.item.file_parameter_overrides,
            context: &context,
        })
    }

    /// Prepare, render, generate sidecar; expects `Init(Prepare)`
    async fn init(&mut self) {
        let template = match self.resolve().await {
            Ok(template) => template,
            Err(err) => return self.init_failed(&err),
        };
        self.step(LifecycleEvent::StepCompleted, |_| {});

        let outcome = match self.merge(&template) {
            Ok(outcome) => outcome,
            Err(err) => return self.init_failed(&ReconfError::from(err)),
        };
        self.step(LifecycleEvent::StepCompleted, |_| {});

        let policy = template.reload_policy;
        if !self.ctx.dispatcher.executors().contains(policy) {
            let err = ReconfError::FatalRolloutFailure(ReloadError::NoExecutor(policy).to_string());
            return self.init_failed(&err);
        }

        let revision = outcome.rendered.revision();
        self.last_done = Some(revision);
        self.applied = Some(Arc::new(outcome.rendered));
        self.rollout = None;
        self.step(LifecycleEvent::InitCompleted, |s| {
            s.last_done_revision = Some(revision);
            s.update_revision = Some(revision);
            s.message = None;
            s.reconcile_detail.policy = Some(policy);
            s.reconcile_detail.current_revision = Some(revision);
            s.reconcile_detail.err_message = None;
        });
        tracing::info!(item = %self.name, revision = %revision.short(), %policy, "item created");
    }

    fn init_failed(&mut self, err: &ReconfError) {
        let message = err.to_string();
        tracing::error!(item = %self.name, error = %message, "item creation failed");
        self.step(LifecycleEvent::InitFailed, |s| {
            s.message = Some(message.clone());
            s.reconcile_detail.err_message = Some(message);
        });
    }

    /// Merge in `Pending` and either settle or start a rollout
    async fn reconcile(&mut self) {
        let template = match self.resolve().await {
            Ok(template) => template,
            Err(err) => return self.merge_failed(&err),
        };
        let outcome = match self.merge(&template) {
            Ok(outcome) => outcome,
            Err(err) => return self.merge_failed(&ReconfError::from(err)),
        };
        let revision = outcome.rendered.revision();

        // An abandoned rollout of another revision may have reached some
        // instances, so matching `last_done` alone does not mean converged.
        let dirty = self
            .rollout
            .as_ref()
            .is_some_and(|r| Some(r.revision()) != self.last_done);
        if Some(revision) == self.last_done && !dirty {
            self.rollout = None;
            tracing::debug!(item = %self.name, revision = %revision.short(), "revision already applied");
            self.reconfig(ReconfigEvent::MergeUnchanged, |s| {
                s.update_revision = Some(revision);
                s.message = None;
                s.reconcile_detail.policy = Some(template.reload_policy);
                s.reconcile_detail.err_message = None;
            });
            return;
        }

        let policy = template.resolve_reload_policy(self.applied.as_deref(), &outcome.rendered);

        self.next_token += 1;
        let token = self.next_token;
        let done = match self.rollout.take() {
            Some(previous) if previous.revision() == revision => previous.done,
            _ => Arc::default(),
        };
        self.rollout = Some(Rollout {
            token,
            config: Arc::new(outcome.rendered),
            policy,
            done,
            retries_used: 0,
            round: 0,
            delay: Duration::ZERO,
        });

        self.reconfig(ReconfigEvent::MergeSucceeded, |s| {
            s.update_revision = Some(revision);
            s.message = None;
            s.reconcile_detail.policy = Some(policy);
        });
        tracing::info!(
            item = %self.name,
            revision = %revision.short(),
            %policy,
            dropped = outcome.dropped.len(),
            "merged new revision"
        );
        self.reconfig(ReconfigEvent::RolloutDispatched, |s| {
            s.reconcile_detail.start_rollout(token, revision);
        });
    }

    fn merge_failed(&mut self, err: &ReconfError) {
        let message = err.to_string();
        tracing::warn!(item = %self.name, error = %message, "merge failed");
        self.reconfig(ReconfigEvent::MergeFailed, |s| {
            s.message = Some(message.clone());
            s.reconcile_detail.err_message = Some(message);
        });
    }

    /// Drive `Upgrading` until the attempt ends or a command interrupts it
    async fn upgrade(&mut self) -> Flow {
        let Some(rollout) = self.rollout.as_ref() else {
            tracing::warn!(item = %self.name, "upgrading without a rollout, re-rendering");
            self.reconfig(ReconfigEvent::Trigger, |_| {});
            return Flow::Continue;
        };

        let attempt = {
            let dispatcher = self.ctx.dispatcher.clone();
            let board = Arc::clone(&self.ctx.board);
            let component = self.ctx.component.clone();
            let name = self.name.clone();
            let config = Arc::clone(&rollout.config);
            let done = Arc::clone(&rollout.done);
            let (token, policy, delay) = (rollout.token, rollout.policy, rollout.delay);
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let sink = move |succeeded: usize, expected: usize| {
                    board.apply_progress(&name, token, succeeded, expected);
                };
                dispatcher.dispatch(&component, &config, policy, &done, &sink).await
            }
        };
        tokio::pin!(attempt);

        let report = loop {
            tokio::select! {
                biased;
                command = self.rx.recv() => match command {
                    Some(command) => match self.during_rollout(command) {
                        Some(flow) => return flow,
                        None => continue,
                    },
                    None => return self.teardown(),
                },
                report = &mut attempt => break report,
            }
        };
        self.finish_attempt(report);
        Flow::Continue
    }

    /// Handle a command while an attempt runs; `None` keeps the attempt
    fn during_rollout(&mut self, command: Command) -> Option<Flow> {
        match command {
            Command::Trigger { item, force } => {
                if !self.accept(item, force) {
                    return None;
                }
                tracing::info!(item = %self.name, "superseding in-flight rollout");
                self.reconfig(ReconfigEvent::Trigger, |s| {
                    s.reconcile_detail.exec_result = ExecResult::Superseded;
                });
                Some(Flow::Continue)
            }
            Command::Resume { reply } => {
                let _ = reply.send(Err(self.illegal("resume").into()));
                None
            }
            Command::Remove => Some(self.remove()),
            Command::Teardown => Some(self.teardown()),
        }
    }

    fn finish_attempt(&mut self, report: RolloutReport) {
        let failure_policy = self.failure_policy();
        let retry = self.ctx.config.retry.clone();
        let Some(rollout) = self.rollout.as_mut() else {
            return;
        };
        let revision = rollout.revision();
        let message = report.error().map(|e| e.to_string());

        match report.outcome {
            RolloutOutcome::Success => {
                self.applied = self.rollout.take().map(|r| r.config);
                self.last_done = Some(revision);
                self.reconfig(ReconfigEvent::RolloutSucceeded, |s| {
                    s.last_done_revision = Some(revision);
                    s.message = None;
                    s.reconcile_detail.exec_result = ExecResult::Success;
                    s.reconcile_detail.err_message = None;
                });
                tracing::info!(
                    item = %self.name,
                    revision = %revision.short(),
                    instances = report.expected,
                    "rollout complete"
                );
            }
            RolloutOutcome::Fatal(_) => {
                tracing::error!(item = %self.name, error = ?message, "rollout failed fatally, pausing");
                self.reconfig(ReconfigEvent::RolloutFatal, |s| {
                    s.message.clone_from(&message);
                    s.reconcile_detail.exec_result = ExecResult::FatalFailure;
                    s.reconcile_detail.err_message = message;
                });
            }
            RolloutOutcome::Partial => {
                if retry.has_budget(rollout.retries_used) {
                    rollout.retries_used += 1;
                    rollout.delay = retry.retry_interval();
                    let attempt = rollout.retries_used;
                    tracing::warn!(
                        item = %self.name,
                        attempt,
                        succeeded = report.succeeded,
                        expected = report.expected,
                        "rollout incomplete, retrying"
                    );
                    self.reconfig(ReconfigEvent::RolloutRetry, |s| {
                        s.reconcile_detail.err_message = message;
                    });
                    return;
                }

                if failure_policy == FailurePolicy::Retry {
                    rollout.round += 1;
                    tracing::warn!(item = %self.name, round = rollout.round, "retry budget exhausted, backing off");
                } else {
                    tracing::error!(item = %self.name, "retry budget exhausted, pausing");
                }
                self.reconfig(ReconfigEvent::RolloutExhausted(failure_policy), |s| {
                    s.message.clone_from(&message);
                    s.reconcile_detail.exec_result = ExecResult::PartialFailure;
                    s.reconcile_detail.err_message = message;
                });
            }
        }
    }

    /// Wait out the backoff in `FailedAndRetry`, serving commands meanwhile
    async fn backoff(&mut self) -> Flow {
        let round = self.rollout.as_ref().map_or(1, |r| r.round);
        let delay = self.ctx.config.retry.backoff_delay(round);
        let deadline = Instant::now() + delay;
        tracing::debug!(item = %self.name, round, ?delay, "backoff started");

        loop {
            tokio::select! {
                biased;
                command = self.rx.recv() => {
                    let flow = match command {
                        Some(command) => self.handle(command).await,
                        None => self.teardown(),
                    };
                    if flow == Flow::Exit || self.phase != LifecyclePhase::Running(ReconfigPhase::FailedAndRetry) {
                        return flow;
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    if let Some(rollout) = self.rollout.as_mut() {
                        rollout.retries_used = 0;
                        rollout.delay = Duration::ZERO;
                    }
                    self.reconfig(ReconfigEvent::BackoffElapsed, |s| {
                        s.reconcile_detail.exec_result = ExecResult::InProgress;
                    });
                    return Flow::Continue;
                }
            }
        }
    }

    /// Commands outside a rollout
    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Trigger { item, force } => {
                if !self.accept(item, force) {
                    return Flow::Continue;
                }
                if self.phase == LifecyclePhase::CreateFailed {
                    if self.step(LifecycleEvent::InitRetried, |_| {}) {
                        self.init().await;
                    }
                } else {
                    self.reconfig(ReconfigEvent::Trigger, |_| {});
                }
                Flow::Continue
            }
            Command::Resume { reply } => {
                match self.phase {
                    LifecyclePhase::CreateFailed => {
                        self.step(LifecycleEvent::InitRetried, |_| {});
                        let _ = reply.send(Ok(()));
                        self.init().await;
                    }
                    LifecyclePhase::Running(ReconfigPhase::FailedAndPause) => {
                        if let Some(rollout) = self.rollout.as_mut() {
                            rollout.retries_used = 0;
                            rollout.delay = Duration::ZERO;
                        }
                        tracing::info!(item = %self.name, "resuming paused rollout");
                        self.reconfig(ReconfigEvent::Resume, |s| {
                            s.reconcile_detail.exec_result = ExecResult::InProgress;
                        });
                        let _ = reply.send(Ok(()));
                    }
                    _ => {
                        let _ = reply.send(Err(self.illegal("resume").into()));
                    }
                }
                Flow::Continue
            }
            Command::Remove => self.remove(),
            Command::Teardown => self.teardown(),
        }
    }

    fn illegal(&self, event: &'static str) -> TransitionError {
        TransitionError {
            from: self.phase.phase(),
            event,
        }
    }

    fn remove(&mut self) -> Flow {
        self.step(LifecycleEvent::Removed, |_| {});
        self.ctx.board.remove(self.name.as_str());
        tracing::info!(item = %self.name, "item removed");
        Flow::Exit
    }

    fn teardown(&mut self) -> Flow {
        self.step(LifecycleEvent::TornDown, |s| {
            s.message = Some("resource torn down".to_string());
        });
        Flow::Exit
    }
}
