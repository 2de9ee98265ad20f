use std::path::PathBuf;
use std::time::Duration;

use reconf_cli::{render_item, run_simulation, Scenario, SimulatorConfig};
use reconf_core::{EngineConfig, FailurePolicy, Phase};

fn demo(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../demos")
        .join(name)
}

#[test]
fn test_demo_engine_config_is_valid() {
    let config = EngineConfig::load(demo("engine.toml")).unwrap();
    assert_eq!(config.failure_policy, FailurePolicy::Pause);
    assert_eq!(config.retry.max_attempts, 3);
}

#[test]
fn test_demo_scenario_renders_sections() {
    let scenario = Scenario::load(demo("mysql-scenario.yaml")).unwrap();
    let report = render_item(&scenario, "mysql-config").unwrap();
    let content = report.rendered.content("my.cnf").unwrap();
    assert!(content.contains("[mysqld]"));
    assert!(content.contains("max_connections=100"));
}

#[tokio::test]
async fn test_demo_scenario_converges_without_failures() {
    let scenario = Scenario::load(demo("mysql-scenario.yaml")).unwrap();
    let config = SimulatorConfig {
        seed: 1,
        failure_rate: 0.0,
        settle_timeout: Duration::from_secs(5),
    };
    let report = run_simulation(&scenario, &config).await.unwrap();

    assert!(report.converged(), "{}", report.generate_text());
    assert_eq!(report.resource.phase, Phase::Running);
    assert_eq!(report.items.len(), 2);
    assert!(report.steps.iter().any(|s| s.result == "updated"));
    // the closing resume hits a running item
    assert!(report.steps.last().unwrap().result.starts_with("error:"));
}
