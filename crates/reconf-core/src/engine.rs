//! Reconfiguration engine
//!
//! The public entry point. It owns the item registry and one worker per
//! item, and exposes statuses and the aggregated resource phase.
//!
//! # Example
//! ```ignore
//! let engine = ReconfigurationEngine::builder("mysql")
//!     .with_template_store(store)
//!     .with_instance_provider(instances)
//!     .with_executor(ReloadPolicy::Sql, executor)
//!     .build()?;
//!
//! engine.upsert(item).await?;
//! let mut resource = engine.subscribe();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reconf_artifact::ItemName;
use reconf_merge::{FormatRegistry, MergePipeline, ReloadPolicy, TemplateRef, TemplateRenderer};
use tokio::sync::{oneshot, watch};

use crate::config::{ConfigError, EngineConfig};
use crate::dispatcher::{ReloadExecutor, ReloadExecutors, RolloutDispatcher};
use crate::error::ReconfError;
use crate::phase::Phase;
use crate::provider::{InstanceProvider, TemplateStore};
use crate::registry::{ItemRegistry, UpsertOutcome};
use crate::status::{StatusBoard, TransitionRecord};
use crate::types::{ConfigurationItem, ConfigurationItemStatus, ResourceStatus};
use crate::worker::{Command, WorkerContext, WorkerHandle};

/// Builder for [`ReconfigurationEngine`]
#[derive(Debug)]
pub struct EngineBuilder {
    component: String,
    config: EngineConfig,
    store: Option<Arc<dyn TemplateStore>>,
    instances: Option<Arc<dyn InstanceProvider>>,
    executors: ReloadExecutors,
    renderer: Option<Arc<dyn TemplateRenderer>>,
    formats: Option<FormatRegistry>,
}

impl EngineBuilder {
    fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            config: EngineConfig::default(),
            store: None,
            instances: None,
            executors: ReloadExecutors::new(),
            renderer: None,
            formats: None,
        }
    }

    /// Set engine configuration
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the template store (required)
    #[must_use]
    pub fn with_template_store(mut self, store: Arc<dyn TemplateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the instance provider (required)
    #[must_use]
    pub fn with_instance_provider(mut self, instances: Arc<dyn InstanceProvider>) -> Self {
        self.instances = Some(instances);
        self
    }

    /// Register a reload executor
    #[must_use]
    pub fn with_executor(mut self, policy: ReloadPolicy, executor: Arc<dyn ReloadExecutor>) -> Self {
        self.executors.register(policy, executor);
        self
    }

    /// Replace all reload executors
    #[must_use]
    pub fn with_executors(mut self, executors: ReloadExecutors) -> Self {
        self.executors = executors;
        self
    }

    /// Set the template renderer (default: passthrough)
    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Set the file format registry
    #[must_use]
    pub fn with_formats(mut self, formats: FormatRegistry) -> Self {
        self.formats = Some(formats);
        self
    }

    /// Build the engine
    ///
    /// # Errors
    /// Returns [`ReconfError::Config`] if the configuration is invalid or a
    /// required collaborator is missing
    pub fn build(self) -> Result<ReconfigurationEngine, ReconfError> {
        self.config.validate()?;
        let missing = |field: &'static str| ConfigError::Invalid {
            field,
            reason: "required".to_string(),
        };
        let store = self.store.ok_or_else(|| missing("template_store"))?;
        let instances = self.instances.ok_or_else(|| missing("instance_provider"))?;

        let mut pipeline = self
            .renderer
            .map_or_else(MergePipeline::default, MergePipeline::new);
        if let Some(formats) = self.formats {
            pipeline = pipeline.with_formats(formats);
        }
        let dispatcher = RolloutDispatcher::new(
            instances,
            Arc::new(self.executors),
            self.config.dispatch_concurrency,
        );
        let board = Arc::new(StatusBoard::new(
            self.component.clone(),
            self.config.history_limit,
        ));

        tracing::info!(component = %self.component, renderer = pipeline.renderer().name(), "engine started");
        Ok(ReconfigurationEngine {
            ctx: Arc::new(WorkerContext {
                component: self.component,
                config: self.config,
                store,
                pipeline,
                dispatcher,
                board,
            }),
            registry: ItemRegistry::new(),
            workers: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Reconciles the configuration items of one component
#[derive(Debug)]
pub struct ReconfigurationEngine {
    ctx: Arc<WorkerContext>,
    registry: ItemRegistry,
    workers: DashMap<ItemName, WorkerHandle>,
    closed: AtomicBool,
}

impl ReconfigurationEngine {
    /// Start building an engine for `component`
    pub fn builder(component: impl Into<String>) -> EngineBuilder {
        EngineBuilder::new(component)
    }

    /// Owning component
    #[must_use]
    pub fn component(&self) -> &str {
        &self.ctx.component
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    fn ensure_open(&self) -> Result<(), ReconfError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ReconfError::EngineClosed)
        } else {
            Ok(())
        }
    }

    async fn send(&self, name: &str, command: Command) -> Result<(), ReconfError> {
        self.ensure_open()?;
        let tx = self
            .workers
            .get(name)
            .map(|handle| handle.tx.clone())
            .ok_or_else(|| ReconfError::NotFound(name.to_string()))?;
        tx.send(command).await.map_err(|_| ReconfError::EngineClosed)
    }

    /// Add an item or update its mutable fields
    ///
    /// A new item starts its own worker; a changed item is re-triggered.
    ///
    /// # Errors
    /// [`ReconfError::EngineClosed`] after [`shutdown`](Self::shutdown)
    pub async fn upsert(&self, item: ConfigurationItem) -> Result<UpsertOutcome, ReconfError> {
        self.ensure_open()?;
        let (outcome, stored, tx) = match self.workers.entry(item.name.clone()) {
            Entry::Vacant(vacant) => {
                let (_, stored) = self.registry.upsert(item);
                tracing::info!(item = %stored.name, template = %stored.template_ref, "item added");
                vacant.insert(WorkerHandle::spawn(Arc::clone(&self.ctx), stored.clone()));
                return Ok(UpsertOutcome::Inserted);
            }
            Entry::Occupied(occupied) => {
                let (outcome, stored) = self.registry.upsert(item);
                (outcome, stored, occupied.get().tx.clone())
            }
        };
        if outcome == UpsertOutcome::Updated {
            tx.send(Command::Trigger {
                item: stored,
                force: false,
            })
            .await
            .map_err(|_| ReconfError::EngineClosed)?;
        }
        Ok(outcome)
    }

    /// Update the item called `name`
    ///
    /// # Errors
    /// - [`ReconfError::ImmutableField`] if `item` has a different name
    /// - [`ReconfError::NotFound`] if there is no such item
    pub async fn update(&self, name: &str, item: ConfigurationItem) -> Result<UpsertOutcome, ReconfError> {
        self.ensure_open()?;
        let (outcome, stored) = self.registry.update(name, item)?;
        if outcome == UpsertOutcome::Updated {
            self.send(
                name,
                Command::Trigger {
                    item: stored,
                    force: false,
                },
            )
            .await?;
        }
        Ok(outcome)
    }

    /// Remove an item and its status
    ///
    /// Waits until the item's worker has stopped.
    ///
    /// # Errors
    /// Returns [`ReconfError::NotFound`] if there is no such item
    pub async fn remove(&self, name: &str) -> Result<ConfigurationItem, ReconfError> {
        self.ensure_open()?;
        let key = ItemName::new(name).map_err(|_| ReconfError::NotFound(name.to_string()))?;
        let (item, handle) = match self.workers.entry(key) {
            Entry::Occupied(occupied) => {
                let item = self.registry.remove(name)?;
                (item, occupied.remove())
            }
            Entry::Vacant(_) => return Err(ReconfError::NotFound(name.to_string())),
        };
        if handle.tx.send(Command::Remove).await.is_err() {
            self.ctx.board.remove(name);
        }
        if let Err(err) = handle.join.await {
            tracing::error!(item = %name, error = %err, "worker ended abnormally");
            self.ctx.board.remove(name);
        }
        Ok(item)
    }

    /// Item definition
    ///
    /// # Errors
    /// Returns [`ReconfError::NotFound`] if there is no such item
    pub fn get(&self, name: &str) -> Result<ConfigurationItem, ReconfError> {
        self.registry.get(name)
    }

    /// All items in insertion order
    #[must_use]
    pub fn list(&self) -> Vec<ConfigurationItem> {
        self.registry.list()
    }

    /// Leave `FailedAndPause` with a fresh retry budget, or re-run a failed
    /// creation
    ///
    /// # Errors
    /// - [`ReconfError::NotFound`] if there is no such item
    /// - [`ReconfError::IllegalTransition`] if the item is not paused or
    ///   create-failed
    pub async fn resume(&self, name: &str) -> Result<(), ReconfError> {
        let (reply, rx) = oneshot::channel();
        self.send(name, Command::Resume { reply }).await?;
        rx.await.map_err(|_| ReconfError::EngineClosed)?
    }

    /// Force a re-render of one item with unchanged inputs
    ///
    /// # Errors
    /// Returns [`ReconfError::NotFound`] if there is no such item
    pub async fn rerender(&self, name: &str) -> Result<(), ReconfError> {
        let item = self.registry.get(name)?;
        self.send(name, Command::Trigger { item, force: true }).await
    }

    /// Re-render every item whose effective template is `template`
    ///
    /// Returns the number of items triggered.
    pub async fn notify_template_changed(&self, template: &TemplateRef) -> usize {
        let mut triggered = 0;
        for name in self.registry.referencing(template) {
            match self.rerender(name.as_str()).await {
                Ok(()) => triggered += 1,
                Err(err) => {
                    tracing::warn!(item = %name, error = %err, "cannot trigger item after template change");
                }
            }
        }
        tracing::info!(template = %template, triggered, "template changed");
        triggered
    }

    /// Status of one item
    ///
    /// # Errors
    /// Returns [`ReconfError::NotFound`] if there is no such item
    pub fn status(&self, name: &str) -> Result<ConfigurationItemStatus, ReconfError> {
        self.ctx
            .board
            .get(name)
            .ok_or_else(|| ReconfError::NotFound(name.to_string()))
    }

    /// Statuses of every item, by name
    #[must_use]
    pub fn statuses(&self) -> Vec<ConfigurationItemStatus> {
        self.ctx.board.list()
    }

    /// Aggregated resource status
    #[must_use]
    pub fn resource_status(&self) -> ResourceStatus {
        self.ctx.board.resource()
    }

    /// Most severe item phase
    #[must_use]
    pub fn resource_phase(&self) -> Phase {
        self.ctx.board.resource().phase
    }

    /// Stream of aggregated resource statuses
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ResourceStatus> {
        self.ctx.board.subscribe()
    }

    /// Transition history of one item, oldest first
    #[must_use]
    pub fn history(&self, name: &str) -> Vec<TransitionRecord> {
        self.ctx.board.history(name)
    }

    /// Tear the resource down: every worker moves to `Finished` and stops
    ///
    /// Statuses stay readable. Later mutating calls fail with
    /// [`ReconfError::EngineClosed`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let names: Vec<ItemName> = self.workers.iter().map(|w| w.key().clone()).collect();
        for name in names {
            let Some((_, handle)) = self.workers.remove(&name) else {
                continue;
            };
            if handle.tx.send(Command::Teardown).await.is_err() {
                tracing::debug!(item = %name, "worker already stopped");
            }
            if let Err(err) = handle.join.await {
                tracing::error!(item = %name, error = %err, "worker ended abnormally");
            }
        }
        tracing::info!(component = %self.ctx.component, "engine shut down");
    }
}
