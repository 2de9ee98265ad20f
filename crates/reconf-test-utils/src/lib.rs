//! Testing utilities for the reconf workspace
//!
//! In-memory collaborators, fixtures and await helpers shared by the
//! engine's integration tests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use reconf_artifact::{
    ConstraintSet, FileFormat, ParamConstraint, ParamType, RenderedConfig, Revision,
};
use reconf_core::{
    ConfigurationItem, ConfigurationItemStatus, EngineConfig, Instance, InstanceProvider, Phase,
    ProviderError, ReconfigurationEngine, ReloadError, ReloadExecutor, RetryConfig, TemplateStore,
};
use reconf_merge::{ConfigTemplate, ReloadPolicy, TemplateFile, TemplateRef};
use tokio::sync::Notify;

/// Default `my.cnf` of the MySQL fixture template
pub const MY_CNF: &str = "\
# server defaults
max_connections=50
wait_timeout=28800
server_id=1
";

/// Name of the MySQL fixture template
pub const MYSQL_TEMPLATE: &str = "mysql-8.0";

/// Component used by [`Harness`]
pub const COMPONENT: &str = "mysql";

/// Template store backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryTemplateStore {
    templates: DashMap<TemplateRef, ConfigTemplate>,
    unavailable: AtomicBool,
}

impl InMemoryTemplateStore {
    /// Empty, available store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a template
    pub fn insert(&self, template: impl Into<TemplateRef>, config: ConfigTemplate) {
        self.templates.insert(template.into(), config);
    }

    /// Forget a template
    pub fn remove(&self, template: &str) {
        self.templates.remove(&TemplateRef::new(template));
    }

    /// Make every lookup fail with [`ProviderError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn resolve_template(&self, template: &TemplateRef) -> Result<ConfigTemplate, ProviderError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("template store offline".into()));
        }
        self.templates
            .get(template)
            .map(|t| t.clone())
            .ok_or_else(|| ProviderError::TemplateNotFound(template.clone()))
    }
}

/// Instance set that tests can change between rollout attempts
#[derive(Debug, Default)]
pub struct StaticInstanceProvider {
    instances: RwLock<Vec<Instance>>,
    unavailable: AtomicBool,
}

impl StaticInstanceProvider {
    /// Provider listing `ids`
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::default();
        provider.set(ids);
        provider
    }

    /// `count` instances named `i-0`, `i-1`, ...
    pub fn with_count(count: usize) -> Self {
        Self::new((0..count).map(|i| format!("i-{i}")))
    }

    /// Replace the whole instance set
    pub fn set<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.instances.write() = ids.into_iter().map(Instance::new).collect();
    }

    /// Add one instance
    pub fn add(&self, id: &str) {
        self.instances.write().push(Instance::new(id));
    }

    /// Drop one instance
    pub fn remove(&self, id: &str) {
        self.instances.write().retain(|i| i.id != id);
    }

    /// Make listing fail with [`ProviderError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl InstanceProvider for StaticInstanceProvider {
    async fn current_instances(&self, _component: &str) -> Result<Vec<Instance>, ProviderError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("instance api offline".into()));
        }
        Ok(self.instances.read().clone())
    }
}

/// One call seen by [`ScriptedExecutor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Instance id
    pub instance: String,
    /// Revision pushed
    pub revision: Revision,
    /// Trigger marker of the pushed config
    pub marker: Option<String>,
    /// Policy the call was made under
    pub policy: ReloadPolicy,
    /// Whether the apply succeeded
    pub succeeded: bool,
}

/// Reload executor with scripted per-instance behaviour
///
/// Rules are checked in order: held marker, fatal, counted failures,
/// permanent failures. Anything else succeeds.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    fail_remaining: Mutex<HashMap<String, u32>>,
    always_fail: Mutex<HashSet<String>>,
    fatal: Mutex<HashSet<String>>,
    held_marker: Mutex<Option<String>>,
    released: AtomicBool,
    release: Notify,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    /// Executor that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` applies on `instance`
    pub fn fail_times(&self, instance: &str, times: u32) {
        self.fail_remaining.lock().insert(instance.to_string(), times);
    }

    /// Fail every apply on `instance` until [`heal`](Self::heal)
    pub fn always_fail(&self, instance: &str) {
        self.always_fail.lock().insert(instance.to_string());
    }

    /// Clear every failure rule of `instance`
    pub fn heal(&self, instance: &str) {
        self.always_fail.lock().remove(instance);
        self.fail_remaining.lock().remove(instance);
        self.fatal.lock().remove(instance);
    }

    /// Fail applies on `instance` fatally
    pub fn fatal_on(&self, instance: &str) {
        self.fatal.lock().insert(instance.to_string());
    }

    /// Block applies of configs carrying `marker` until [`release`](Self::release)
    pub fn hold_marker(&self, marker: &str) {
        self.released.store(false, Ordering::SeqCst);
        *self.held_marker.lock() = Some(marker.to_string());
    }

    /// Let held applies continue
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    /// Every call so far
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Calls made for `revision`
    pub fn calls_for(&self, revision: Revision) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.revision == revision)
            .collect()
    }

    /// Instances that successfully applied `revision`
    pub fn applied(&self, revision: Revision) -> HashSet<String> {
        self.calls_for(revision)
            .into_iter()
            .filter(|c| c.succeeded)
            .map(|c| c.instance)
            .collect()
    }

    /// Forget recorded calls
    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    async fn wait_release(&self) {
        loop {
            let notified = self.release.notified();
            if self.released.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn outcome(&self, instance: &str) -> Result<(), ReloadError> {
        if self.fatal.lock().contains(instance) {
            return Err(ReloadError::fatal(instance, "permission denied"));
        }
        if let Some(left) = self.fail_remaining.lock().get_mut(instance) {
            if *left > 0 {
                *left -= 1;
                return Err(ReloadError::failed(instance, "reload timed out"));
            }
        }
        if self.always_fail.lock().contains(instance) {
            return Err(ReloadError::failed(instance, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl ReloadExecutor for ScriptedExecutor {
    async fn apply(
        &self,
        instance: &Instance,
        config: &RenderedConfig,
        policy: ReloadPolicy,
    ) -> Result<(), ReloadError> {
        let held = self.held_marker.lock().clone();
        if held.is_some() && held.as_deref() == config.marker() {
            self.wait_release().await;
        }
        let result = self.outcome(&instance.id);
        self.calls.lock().push(Call {
            instance: instance.id.clone(),
            revision: config.revision(),
            marker: config.marker().map(str::to_string),
            policy,
            succeeded: result.is_ok(),
        });
        tokio::task::yield_now().await;
        result
    }
}

/// MySQL-like template with one properties file
///
/// `wait_timeout` is static, `server_id` immutable.
pub fn mysql_template() -> ConfigTemplate {
    ConfigTemplate::new(ReloadPolicy::Sql)
        .with_file("my.cnf", TemplateFile::new(MY_CNF).with_format(FileFormat::Properties))
        .with_constraints(
            "my.cnf",
            ConstraintSet::new()
                .with(
                    "max_connections",
                    ParamConstraint::of(ParamType::Integer)
                        .range(Some(1.0), Some(100_000.0))
                        .required(),
                )
                .with("wait_timeout", ParamConstraint::of(ParamType::Integer).static_param())
                .with("server_id", ParamConstraint::of(ParamType::Integer).immutable()),
        )
}

/// Item bound to [`MYSQL_TEMPLATE`]
///
/// # Panics
/// Panics if `name` is not a valid item name
pub fn mysql_item(name: &str) -> ConfigurationItem {
    ConfigurationItem::new(name, MYSQL_TEMPLATE).expect("fixture item name")
}

/// Engine configuration with millisecond timings
pub fn fast_config() -> EngineConfig {
    EngineConfig::new().with_retry(
        RetryConfig::default()
            .with_max_attempts(2)
            .with_retry_interval(Duration::from_millis(5))
            .with_initial_backoff(Duration::from_millis(20))
            .with_max_backoff(Duration::from_millis(80)),
    )
}

/// Engine wired to in-memory collaborators
#[derive(Debug)]
pub struct Harness {
    /// Engine under test
    pub engine: ReconfigurationEngine,
    /// Template store the engine resolves from
    pub store: Arc<InMemoryTemplateStore>,
    /// Instance set the engine rolls out to
    pub instances: Arc<StaticInstanceProvider>,
    /// Executor registered for [`ReloadPolicy::Sql`] and [`ReloadPolicy::Restart`]
    pub executor: Arc<ScriptedExecutor>,
}

impl Harness {
    /// `instances` replicas, [`mysql_template`] registered, [`fast_config`]
    pub fn new(instances: usize) -> Self {
        Self::with_config(instances, fast_config())
    }

    /// Like [`new`](Self::new) with an explicit engine configuration
    ///
    /// # Panics
    /// Panics if `config` is invalid
    pub fn with_config(instances: usize, config: EngineConfig) -> Self {
        let store = Arc::new(InMemoryTemplateStore::new());
        store.insert(MYSQL_TEMPLATE, mysql_template());
        let instances = Arc::new(StaticInstanceProvider::with_count(instances));
        let executor = Arc::new(ScriptedExecutor::new());
        let engine = ReconfigurationEngine::builder(COMPONENT)
            .with_config(config)
            .with_template_store(store.clone())
            .with_instance_provider(instances.clone())
            .with_executor(ReloadPolicy::Sql, executor.clone())
            .with_executor(ReloadPolicy::Restart, executor.clone())
            .build()
            .expect("harness engine");
        Self {
            engine,
            store,
            instances,
            executor,
        }
    }

    /// Wait until `name` reports `phase`
    pub async fn wait_for_phase(&self, name: &str, phase: Phase) -> Option<ConfigurationItemStatus> {
        wait_for_phase(&self.engine, name, phase, DEFAULT_TIMEOUT).await
    }

    /// Upsert `item` and wait for its creation; returns the initial revision
    ///
    /// # Panics
    /// Panics if the item does not reach `Running`
    pub async fn create(&self, item: ConfigurationItem) -> Revision {
        let name = item.name.to_string();
        self.engine.upsert(item).await.expect("upsert");
        self.wait_for_phase(&name, Phase::Running)
            .await
            .and_then(|s| s.last_done_revision)
            .expect("item created")
    }

    /// Wait until `name` is `Running` on a revision other than `previous`
    pub async fn wait_for_rollout(
        &self,
        name: &str,
        previous: Revision,
    ) -> Option<ConfigurationItemStatus> {
        let reached = wait_until(DEFAULT_TIMEOUT, || {
            self.engine.status(name).is_ok_and(|s| {
                s.phase == Phase::Running
                    && s.last_done_revision.is_some_and(|rev| rev != previous)
            })
        })
        .await;
        if reached {
            self.engine.status(name).ok()
        } else {
            None
        }
    }

    /// Wait until the history of `name` contains `event`
    pub async fn wait_for_event(&self, name: &str, event: &str) -> bool {
        wait_until(DEFAULT_TIMEOUT, || {
            self.engine.history(name).iter().any(|r| r.event == event)
        })
        .await
    }
}

/// Timeout used by the harness helpers
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Wait until `name` reports `phase`; `None` on timeout
pub async fn wait_for_phase(
    engine: &ReconfigurationEngine,
    name: &str,
    phase: Phase,
    timeout: Duration,
) -> Option<ConfigurationItemStatus> {
    let reached = wait_until(timeout, || {
        engine.status(name).is_ok_and(|s| s.phase == phase)
    })
    .await;
    if reached {
        engine.status(name).ok()
    } else {
        None
    }
}

/// Run `fut`, panicking if it does not finish within [`DEFAULT_TIMEOUT`]
///
/// # Panics
/// Panics on timeout
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(DEFAULT_TIMEOUT, fut)
        .await
        .expect("operation timed out")
}
