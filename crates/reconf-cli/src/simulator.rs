//! Scenario simulator
//!
//! Runs a [`Scenario`] against a real engine wired to in-process
//! collaborators. Reloads fail at random with a seeded RNG so runs are
//! reproducible for a given seed and failure rate.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reconf_core::{
    ConfigTemplate, ConfigurationItemStatus, EngineConfig, Instance, InstanceProvider, ItemName,
    Phase, ProviderError, ReconfigurationEngine, ReloadError, ReloadExecutor, ReloadExecutors,
    ReloadPolicy, RenderedConfig, ResourceStatus, RetryConfig, TemplateRef, TemplateStore,
    UpsertOutcome,
};
use tokio::time::Instant;

use crate::scenario::{Scenario, Step};

const SETTLE_POLL: Duration = Duration::from_millis(25);

/// Simulation parameters
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Probability that one instance reload fails
    pub failure_rate: f64,
    /// How long to wait for items to settle after each step
    pub settle_timeout: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            failure_rate: 0.0,
            settle_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of one scripted step
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepOutcome {
    pub step: String,
    pub result: String,
    /// Items still moving when the settle timeout hit
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unsettled: Vec<ItemName>,
}

/// Final state of a simulation
#[derive(Debug, Clone, serde::Serialize)]
pub struct SimulationReport {
    pub seed: u64,
    pub failure_rate: f64,
    pub steps: Vec<StepOutcome>,
    /// Reloads attempted against instances
    pub applies: usize,
    /// Reloads failed by the simulator
    pub injected_failures: usize,
    pub items: Vec<ConfigurationItemStatus>,
    pub resource: ResourceStatus,
}

impl SimulationReport {
    /// Every item settled and the resource is running
    #[must_use]
    pub fn converged(&self) -> bool {
        self.resource.phase == Phase::Running && self.steps.iter().all(|s| s.unsettled.is_empty())
    }

    /// Generate text report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== Reconfiguration Simulation ===\n");
        let _ = writeln!(report, "Seed: {}", self.seed);
        let _ = writeln!(report, "Failure Rate: {}", self.failure_rate);
        let _ = writeln!(report, "Reloads Attempted: {}", self.applies);
        let _ = writeln!(report, "Reloads Failed: {}", self.injected_failures);

        let _ = writeln!(report, "\n=== Steps ===");
        for (i, step) in self.steps.iter().enumerate() {
            let _ = write!(report, "{}. {} -> {}", i + 1, step.step, step.result);
            if !step.unsettled.is_empty() {
                let names: Vec<&str> = step.unsettled.iter().map(ItemName::as_str).collect();
                let _ = write!(report, " (unsettled: {})", names.join(", "));
            }
            report.push('\n');
        }

        let _ = writeln!(report, "\n=== Items ===");
        for item in &self.items {
            let detail = &item.reconcile_detail;
            let _ = write!(
                report,
                "{}: {} ({}/{} instances",
                item.name, item.phase, detail.succeed_count, detail.expected_count
            );
            if let Some(revision) = item.last_done_revision {
                let _ = write!(report, ", revision {}", revision.short());
            }
            report.push(')');
            if let Some(message) = item.message.as_ref().or(detail.err_message.as_ref()) {
                let _ = write!(report, " - {message}");
            }
            report.push('\n');
        }

        let _ = writeln!(
            report,
            "\n=== Result: {} (resource {}) ===",
            if self.converged() { "CONVERGED" } else { "NOT CONVERGED" },
            self.resource.phase
        );
        report
    }
}

/// Template store holding the scenario's templates
#[derive(Debug, Default)]
pub struct ScenarioTemplates {
    templates: RwLock<HashMap<TemplateRef, ConfigTemplate>>,
}

impl ScenarioTemplates {
    pub fn insert(&self, template: TemplateRef, config: ConfigTemplate) {
        self.templates.write().insert(template, config);
    }
}

#[async_trait]
impl TemplateStore for ScenarioTemplates {
    async fn resolve_template(&self, template: &TemplateRef) -> Result<ConfigTemplate, ProviderError> {
        self.templates
            .read()
            .get(template)
            .cloned()
            .ok_or_else(|| ProviderError::TemplateNotFound(template.clone()))
    }
}

/// Instance set that steps may replace
#[derive(Debug, Default)]
pub struct ScenarioInstances {
    ids: RwLock<Vec<String>>,
}

impl ScenarioInstances {
    pub fn set(&self, ids: Vec<String>) {
        *self.ids.write() = ids;
    }
}

#[async_trait]
impl InstanceProvider for ScenarioInstances {
    async fn current_instances(&self, _component: &str) -> Result<Vec<Instance>, ProviderError> {
        Ok(self.ids.read().iter().map(Instance::new).collect())
    }
}

/// Reload executor failing at a fixed rate
#[derive(Debug)]
pub struct FlakyExecutor {
    rng: Mutex<StdRng>,
    failure_rate: f64,
    applies: AtomicUsize,
    failures: AtomicUsize,
}

impl FlakyExecutor {
    /// `failure_rate` is clamped to `0.0..=1.0`
    #[must_use]
    pub fn new(seed: u64, failure_rate: f64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            failure_rate: failure_rate.clamp(0.0, 1.0),
            applies: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReloadExecutor for FlakyExecutor {
    async fn apply(
        &self,
        instance: &Instance,
        config: &RenderedConfig,
        policy: ReloadPolicy,
    ) -> Result<(), ReloadError> {
        tokio::task::yield_now().await;
        self.applies.fetch_add(1, Ordering::Relaxed);
        let fail = self.rng.lock().random_bool(self.failure_rate);
        if fail {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(ReloadError::failed(
                instance.id.as_str(),
                format!("simulated {policy} reload failure"),
            ));
        }
        tracing::debug!(
            instance = %instance.id,
            revision = %config.revision().short(),
            %policy,
            "reload applied"
        );
        Ok(())
    }
}

/// Millisecond timings so scenarios finish quickly
#[must_use]
pub fn simulation_engine_config() -> EngineConfig {
    EngineConfig::new().with_retry(
        RetryConfig::default()
            .with_retry_interval(Duration::from_millis(20))
            .with_initial_backoff(Duration::from_millis(50))
            .with_max_backoff(Duration::from_millis(400)),
    )
}

/// Run `scenario` to completion
///
/// # Errors
/// Returns error if the engine cannot be built from the scenario
pub async fn run_simulation(
    scenario: &Scenario,
    config: &SimulatorConfig,
) -> anyhow::Result<SimulationReport> {
    let engine_config = match &scenario.config {
        Some(_) => scenario.engine_config()?,
        None => simulation_engine_config(),
    };

    let templates = Arc::new(ScenarioTemplates::default());
    for (name, template) in &scenario.templates {
        templates.insert(TemplateRef::new(name.as_str()), template.clone());
    }
    let instances = Arc::new(ScenarioInstances::default());
    instances.set(scenario.instances.clone());
    let executor = Arc::new(FlakyExecutor::new(config.seed, config.failure_rate));

    let engine = ReconfigurationEngine::builder(scenario.component.clone())
        .with_config(engine_config)
        .with_template_store(templates.clone())
        .with_instance_provider(instances.clone())
        .with_executors(ReloadExecutors::all(executor.clone()))
        .build()
        .context("cannot build engine for scenario")?;

    tracing::info!(
        component = %scenario.component,
        items = scenario.items.len(),
        steps = scenario.steps.len(),
        seed = config.seed,
        "simulation started"
    );

    let mut steps = Vec::with_capacity(scenario.steps.len() + 1);
    let mut created = 0usize;
    let mut create_errors = Vec::new();
    for item in &scenario.items {
        match engine.upsert(item.clone()).await {
            Ok(_) => created += 1,
            Err(err) => create_errors.push(format!("{}: {err}", item.name)),
        }
    }
    let result = if create_errors.is_empty() {
        format!("created {created} items")
    } else {
        format!("created {created} items, errors: {}", create_errors.join("; "))
    };
    steps.push(StepOutcome {
        step: "create".to_string(),
        result,
        unsettled: settle(&engine, config.settle_timeout).await,
    });

    for step in &scenario.steps {
        let result = apply_step(&engine, &templates, &instances, step).await;
        tracing::info!(step = %step.label(), %result, "step applied");
        steps.push(StepOutcome {
            step: step.label(),
            result,
            unsettled: settle(&engine, config.settle_timeout).await,
        });
    }

    let report = SimulationReport {
        seed: config.seed,
        failure_rate: config.failure_rate,
        steps,
        applies: executor.applies(),
        injected_failures: executor.failures(),
        items: engine.statuses(),
        resource: engine.resource_status(),
    };
    engine.shutdown().await;
    Ok(report)
}

async fn apply_step(
    engine: &ReconfigurationEngine,
    templates: &ScenarioTemplates,
    instances: &ScenarioInstances,
    step: &Step,
) -> String {
    let result = match step {
        Step::Upsert { item } => engine.upsert(item.clone()).await.map(|outcome| {
            match outcome {
                UpsertOutcome::Inserted => "inserted",
                UpsertOutcome::Updated => "updated",
                UpsertOutcome::Unchanged => "unchanged",
            }
            .to_string()
        }),
        Step::Remove { name } => engine.remove(name).await.map(|_| "removed".to_string()),
        Step::Resume { name } => engine.resume(name).await.map(|()| "resumed".to_string()),
        Step::Rerender { name } => engine.rerender(name).await.map(|()| "triggered".to_string()),
        Step::UpdateTemplate { template, config } => {
            let template = TemplateRef::new(template.as_str());
            templates.insert(template.clone(), config.clone());
            let triggered = engine.notify_template_changed(&template).await;
            Ok(format!("triggered {triggered} items"))
        }
        Step::ScaleTo { instances: ids } => {
            instances.set(ids.clone());
            Ok(format!("{} instances", ids.len()))
        }
    };
    result.unwrap_or_else(|err| format!("error: {err}"))
}

fn is_settled(phase: Phase) -> bool {
    matches!(
        phase,
        Phase::Running | Phase::FailedAndPause | Phase::MergeFailed | Phase::CreateFailed
    )
}

fn snapshot(engine: &ReconfigurationEngine) -> Vec<(ItemName, Phase, Option<u64>)> {
    engine
        .statuses()
        .into_iter()
        .map(|status| {
            let last = engine.history(status.name.as_str()).last().map(|r| r.seq);
            (status.name, status.phase, last)
        })
        .collect()
}

/// Wait until every item rests in a settled phase and nothing moved
/// between two polls. Returns the items still moving at the deadline.
async fn settle(engine: &ReconfigurationEngine, timeout: Duration) -> Vec<ItemName> {
    let deadline = Instant::now() + timeout;
    let mut previous = None;
    loop {
        let current = snapshot(engine);
        let all_settled = current.iter().all(|(_, phase, _)| is_settled(*phase));
        if all_settled && previous.as_ref() == Some(&current) {
            return Vec::new();
        }
        if Instant::now() >= deadline {
            return current
                .into_iter()
                .filter(|(_, phase, _)| !is_settled(*phase))
                .map(|(name, _, _)| name)
                .collect();
        }
        previous = Some(current);
        tokio::time::sleep(SETTLE_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SCENARIO: &str = r#"
component: mysql
instances: [mysql-0, mysql-1, mysql-2]
templates:
  mysql-8.0:
    reload_policy: sql
    files:
      my.cnf:
        content: "max_connections=50\n"
items:
  - name: mysql-config
    templateRef: mysql-8.0
steps:
  - action: upsert
    item:
      name: mysql-config
      templateRef: mysql-8.0
      fileParameterOverrides:
        my.cnf:
          parameters:
            max_connections: "100"
  - action: resume
    name: mysql-config
"#;

    fn options(failure_rate: f64) -> SimulatorConfig {
        SimulatorConfig {
            seed: 7,
            failure_rate,
            settle_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn healthy_run_converges() {
        let scenario = Scenario::from_yaml_str(SCENARIO).unwrap();
        let report = run_simulation(&scenario, &options(0.0)).await.unwrap();

        assert!(report.converged());
        assert_eq!(report.injected_failures, 0);
        assert_eq!(report.applies, 3);
        assert_eq!(report.steps[1].result, "updated");
        assert!(report.steps[2].result.starts_with("error:"));
        assert_eq!(report.items[0].reconcile_detail.succeed_count, 3);
        assert!(report.generate_text().contains("CONVERGED"));
    }

    #[tokio::test]
    async fn failing_reloads_pause_the_item() {
        let scenario = Scenario::from_yaml_str(SCENARIO).unwrap();
        let report = run_simulation(&scenario, &options(1.0)).await.unwrap();

        assert!(!report.converged());
        assert_eq!(report.resource.phase, Phase::FailedAndPause);
        assert_eq!(report.items[0].reconcile_detail.succeed_count, 0);
        assert!(report.injected_failures >= 9);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["resource"]["phase"], serde_json::json!("FailedAndPause"));
    }

    #[tokio::test]
    async fn flaky_executor_is_reproducible() {
        let a = FlakyExecutor::new(99, 0.5);
        let b = FlakyExecutor::new(99, 0.5);
        let config = RenderedConfig::seal(Default::default(), None);
        let instance = Instance::new("i-0");
        for _ in 0..32 {
            let left = a.apply(&instance, &config, ReloadPolicy::Signal).await.is_ok();
            let right = b.apply(&instance, &config, ReloadPolicy::Signal).await.is_ok();
            assert_eq!(left, right);
        }
        assert_eq!(a.failures(), b.failures());
        assert_eq!(a.applies(), 32);
    }
}
