use pretty_assertions::assert_eq;
use proptest::prelude::*;
use reconf_core::{
    ConfigParams, EngineConfig, ExecResult, FailurePolicy, Phase, ReconfError, ReloadPolicy,
    RenderedConfig, RetryConfig, TemplateFile, TemplateRef, UpsertOutcome,
};
use reconf_merge::{MergePipeline, MergeRequest, RenderContext};
use reconf_test_utils::{
    fast_config, mysql_item, mysql_template, wait_until, Harness, COMPONENT, DEFAULT_TIMEOUT,
    MYSQL_TEMPLATE,
};
use std::time::Duration;

const ITEM: &str = "mysql-config";

fn max_connections(value: &str) -> ConfigParams {
    ConfigParams::new().set("max_connections", value)
}

/// Render `item` the way the engine does
fn render(item: &reconf_core::ConfigurationItem) -> RenderedConfig {
    let context =
        RenderContext::new(item.name.clone(), COMPONENT).with_marker(item.trigger_marker.clone());
    MergePipeline::default()
        .merge(&MergeRequest {
            template: &mysql_template(),
            overrides: &item.file_parameter_overrides,
            context: &context,
        })
        .unwrap()
        .rendered
}

#[tokio::test]
async fn test_parameter_override_reaches_all_instances() {
    let h = Harness::new(3);
    let r0 = h.create(mysql_item(ITEM)).await;

    let edited = mysql_item(ITEM).with_params("my.cnf", max_connections("100"));
    let expected = render(&edited);
    assert!(expected.content("my.cnf").unwrap().contains("max_connections=100"));
    assert!(!expected.content("my.cnf").unwrap().contains("max_connections=50"));

    assert_eq!(h.engine.upsert(edited).await.unwrap(), UpsertOutcome::Updated);
    let status = h.wait_for_rollout(ITEM, r0).await.expect("rollout finished");

    let r1 = expected.revision();
    assert_ne!(r1, r0);
    assert_eq!(status.last_done_revision, Some(r1));
    assert_eq!(status.update_revision, Some(r1));
    assert_eq!(status.reconcile_detail.exec_result, ExecResult::Success);
    assert_eq!(status.reconcile_detail.succeed_count, 3);
    assert_eq!(status.reconcile_detail.expected_count, 3);
    assert_eq!(status.reconcile_detail.current_revision, Some(r1));
    assert_eq!(h.executor.applied(r1).len(), 3);
    assert_eq!(h.engine.resource_phase(), Phase::Running);
}

#[tokio::test]
async fn test_failed_instance_is_retried_until_success() {
    let h = Harness::new(3);
    let r0 = h.create(mysql_item(ITEM)).await;
    h.executor.fail_times("i-1", 2);

    h.engine
        .upsert(mysql_item(ITEM).with_params("my.cnf", max_connections("100")))
        .await
        .unwrap();
    let status = h.wait_for_rollout(ITEM, r0).await.expect("rollout finished");
    let r1 = status.last_done_revision.unwrap();

    let calls = h.executor.calls_for(r1);
    let count = |id: &str| calls.iter().filter(|c| c.instance == id).count();
    assert_eq!(count("i-0"), 1);
    assert_eq!(count("i-1"), 3);
    assert_eq!(count("i-2"), 1);
    assert_eq!(status.reconcile_detail.succeed_count, 3);
    assert_eq!(status.reconcile_detail.err_message, None);

    let retries = h
        .engine
        .history(ITEM)
        .iter()
        .filter(|r| r.event == "rollout-retry")
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_exhausted_budget_pauses_then_resumes() {
    let h = Harness::new(3);
    let r0 = h.create(mysql_item(ITEM)).await;
    h.executor.always_fail("i-1");

    h.engine
        .upsert(mysql_item(ITEM).with_params("my.cnf", max_connections("100")))
        .await
        .unwrap();
    let status = h
        .wait_for_phase(ITEM, Phase::FailedAndPause)
        .await
        .expect("paused");
    let r1 = status.update_revision.unwrap();

    assert_eq!(status.last_done_revision, Some(r0));
    assert_eq!(status.reconcile_detail.exec_result, ExecResult::PartialFailure);
    assert_eq!(status.reconcile_detail.succeed_count, 2);
    assert_eq!(status.reconcile_detail.expected_count, 3);
    assert!(status.reconcile_detail.err_message.unwrap().contains("i-1"));
    assert_eq!(h.engine.resource_phase(), Phase::FailedAndPause);
    assert_eq!(
        h.executor.calls_for(r1).iter().filter(|c| c.instance == "i-1").count(),
        3
    );

    h.executor.heal("i-1");
    h.engine.resume(ITEM).await.unwrap();
    let status = h.wait_for_rollout(ITEM, r0).await.expect("resumed rollout finished");
    assert_eq!(status.last_done_revision, Some(r1));
    assert_eq!(status.reconcile_detail.succeed_count, 3);
}

#[tokio::test]
async fn test_exhausted_budget_backs_off_under_retry_policy() {
    let h = Harness::with_config(3, fast_config().with_failure_policy(FailurePolicy::Retry));
    let r0 = h.create(mysql_item(ITEM)).await;
    h.executor.always_fail("i-2");

    h.engine
        .upsert(mysql_item(ITEM).with_params("my.cnf", max_connections("100")))
        .await
        .unwrap();
    assert!(h.wait_for_event(ITEM, "backoff-elapsed").await);

    let status = h.engine.status(ITEM).unwrap();
    assert!(matches!(
        status.phase,
        Phase::Pending | Phase::Merged | Phase::Upgrading | Phase::FailedAndRetry
    ));
    assert!(status.reconcile_detail.err_message.is_some());
    let history = h.engine.history(ITEM);
    assert!(history.iter().any(|r| r.to == Phase::FailedAndRetry));

    h.executor.heal("i-2");
    let status = h.wait_for_rollout(ITEM, r0).await.expect("recovered after backoff");
    assert_eq!(status.reconcile_detail.succeed_count, 3);
}

#[tokio::test]
async fn test_item_failure_policy_overrides_engine_default() {
    let h = Harness::new(2);
    let r0 = h.create(mysql_item(ITEM)).await;
    h.executor.always_fail("i-0");

    h.engine
        .upsert(
            mysql_item(ITEM)
                .with_failure_policy(FailurePolicy::Retry)
                .with_marker("v2"),
        )
        .await
        .unwrap();
    assert!(h.wait_for_event(ITEM, "rollout-exhausted-retry").await);
    assert_eq!(h.engine.status(ITEM).unwrap().last_done_revision, Some(r0));
}

#[tokio::test]
async fn test_fatal_failure_pauses_immediately() {
    let h = Harness::new(3);
    h.create(mysql_item(ITEM)).await;
    h.executor.fatal_on("i-0");

    h.engine
        .upsert(mysql_item(ITEM).with_marker("v2"))
        .await
        .unwrap();
    let status = h
        .wait_for_phase(ITEM, Phase::FailedAndPause)
        .await
        .expect("paused");
    assert_eq!(status.reconcile_detail.exec_result, ExecResult::FatalFailure);
    assert!(status.message.unwrap().contains("permission denied"));
    assert!(!h.engine.history(ITEM).iter().any(|r| r.event == "rollout-retry"));
}

#[tokio::test]
async fn test_unreachable_instance_set_pauses_without_retry() {
    let h = Harness::with_config(3, fast_config().with_failure_policy(FailurePolicy::Retry));
    let r0 = h.create(mysql_item(ITEM)).await;
    h.instances.set_unavailable(true);

    h.engine
        .upsert(mysql_item(ITEM).with_marker("v2"))
        .await
        .unwrap();
    let status = h
        .wait_for_phase(ITEM, Phase::FailedAndPause)
        .await
        .expect("paused");
    assert_eq!(status.reconcile_detail.exec_result, ExecResult::FatalFailure);
    assert_eq!(status.last_done_revision, Some(r0));
    let err = status.reconcile_detail.err_message.unwrap();
    assert!(err.contains("unreachable"), "{err}");
    assert!(h.executor.calls().is_empty());

    let history = h.engine.history(ITEM);
    assert!(history.iter().any(|r| r.event == "rollout-fatal"));
    assert!(!history.iter().any(|r| r.event == "rollout-retry"));
    assert!(!history.iter().any(|r| r.to == Phase::FailedAndRetry));

    h.instances.set_unavailable(false);
    h.engine.resume(ITEM).await.unwrap();
    let status = h.wait_for_rollout(ITEM, r0).await.expect("resumed rollout finished");
    assert_eq!(status.reconcile_detail.succeed_count, 3);
}

#[tokio::test]
async fn test_static_parameter_change_restarts_instances() {
    let h = Harness::new(2);
    let r0 = h.create(mysql_item(ITEM)).await;
    let wait_timeout = ConfigParams::new().set("wait_timeout", "60");

    h.engine
        .upsert(mysql_item(ITEM).with_params("my.cnf", wait_timeout.clone()))
        .await
        .unwrap();
    let status = h.wait_for_rollout(ITEM, r0).await.expect("static rollout finished");
    let r1 = status.last_done_revision.unwrap();
    assert_eq!(status.reconcile_detail.policy, Some(ReloadPolicy::Restart));
    let calls = h.executor.calls_for(r1);
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.policy == ReloadPolicy::Restart));

    h.engine
        .upsert(mysql_item(ITEM).with_params("my.cnf", wait_timeout.set("max_connections", "100")))
        .await
        .unwrap();
    let status = h.wait_for_rollout(ITEM, r1).await.expect("dynamic rollout finished");
    let r2 = status.last_done_revision.unwrap();
    assert_eq!(status.reconcile_detail.policy, Some(ReloadPolicy::Sql));
    assert!(h.executor.calls_for(r2).iter().all(|c| c.policy == ReloadPolicy::Sql));
}

#[tokio::test]
async fn test_newer_trigger_supersedes_in_flight_rollout() {
    let h = Harness::new(3);
    let r0 = h.create(mysql_item(ITEM)).await;
    h.executor.hold_marker("v1");

    let first = mysql_item(ITEM)
        .with_params("my.cnf", max_connections("100"))
        .with_marker("v1");
    h.engine.upsert(first).await.unwrap();
    let upgrading = h
        .wait_for_phase(ITEM, Phase::Upgrading)
        .await
        .expect("first rollout started");
    let r1 = upgrading.update_revision.unwrap();

    let second = mysql_item(ITEM)
        .with_params("my.cnf", max_connections("200"))
        .with_marker("v2");
    h.engine.upsert(second).await.unwrap();
    let status = h.wait_for_rollout(ITEM, r0).await.expect("second rollout finished");
    h.executor.release();

    let r2 = status.last_done_revision.unwrap();
    assert_ne!(r2, r1);
    assert_eq!(status.update_revision, Some(r2));
    assert!(h.executor.applied(r1).is_empty());
    assert_eq!(h.executor.applied(r2).len(), 3);
    let history = h.engine.history(ITEM);
    assert!(!history
        .iter()
        .any(|r| r.event == "rollout-succeeded" && r.revision == Some(r1)));
    assert!(history
        .iter()
        .any(|r| r.event == "trigger" && r.from == Phase::Upgrading));
}

#[tokio::test]
async fn test_unchanged_trigger_is_idempotent() {
    let h = Harness::new(3);
    let item = mysql_item(ITEM).with_params("my.cnf", max_connections("100"));
    let r0 = h.create(item.clone()).await;
    let before = h.engine.status(ITEM).unwrap();

    assert_eq!(h.engine.upsert(item).await.unwrap(), UpsertOutcome::Unchanged);
    h.engine.rerender(ITEM).await.unwrap();
    assert!(h.wait_for_event(ITEM, "merge-unchanged").await);

    let after = h.engine.status(ITEM).unwrap();
    assert_eq!(after.phase, Phase::Running);
    assert_eq!(after.update_revision, before.update_revision);
    assert_eq!(after.last_done_revision, Some(r0));
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn test_removing_absent_key_is_no_op_merge() {
    let h = Harness::new(3);
    let r0 = h.create(mysql_item(ITEM)).await;

    h.engine
        .upsert(mysql_item(ITEM).with_params("my.cnf", ConfigParams::new().unset("query_cache_size")))
        .await
        .unwrap();
    assert!(h.wait_for_event(ITEM, "merge-unchanged").await);
    let status = h.engine.status(ITEM).unwrap();
    assert_eq!(status.last_done_revision, Some(r0));
    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn test_immutable_override_is_dropped() {
    let h = Harness::new(3);
    let r0 = h.create(mysql_item(ITEM)).await;

    h.engine
        .upsert(mysql_item(ITEM).with_params("my.cnf", ConfigParams::new().set("server_id", "7")))
        .await
        .unwrap();
    assert!(h.wait_for_event(ITEM, "merge-unchanged").await);
    assert_eq!(h.engine.status(ITEM).unwrap().last_done_revision, Some(r0));
}

#[tokio::test]
async fn test_constraint_violation_routes_to_merge_failed() {
    let h = Harness::new(3);
    let r0 = h.create(mysql_item(ITEM)).await;

    h.engine
        .upsert(mysql_item(ITEM).with_params("my.cnf", max_connections("0")))
        .await
        .unwrap();
    let status = h
        .wait_for_phase(ITEM, Phase::MergeFailed)
        .await
        .expect("merge failed");
    assert!(status.reconcile_detail.err_message.unwrap().contains("max_connections"));
    assert_eq!(status.last_done_revision, Some(r0));
    assert_eq!(h.engine.resource_phase(), Phase::MergeFailed);
    assert!(matches!(
        h.engine.resume(ITEM).await,
        Err(ReconfError::IllegalTransition(_))
    ));

    h.engine
        .upsert(mysql_item(ITEM).with_params("my.cnf", max_connections("500")))
        .await
        .unwrap();
    let status = h.wait_for_rollout(ITEM, r0).await.expect("corrected");
    assert_eq!(status.reconcile_detail.succeed_count, 3);
}

#[tokio::test]
async fn test_zero_instances_complete_immediately() {
    let h = Harness::new(0);
    let r0 = h.create(mysql_item(ITEM)).await;

    h.engine
        .upsert(mysql_item(ITEM).with_marker("v2"))
        .await
        .unwrap();
    let status = h.wait_for_rollout(ITEM, r0).await.expect("empty rollout");
    assert_eq!(status.reconcile_detail.succeed_count, 0);
    assert_eq!(status.reconcile_detail.expected_count, 0);
    assert_eq!(status.reconcile_detail.exec_result, ExecResult::Success);
}

#[tokio::test]
async fn test_instance_set_changes_between_attempts() {
    let slow_retry = RetryConfig::default()
        .with_max_attempts(5)
        .with_retry_interval(Duration::from_millis(100));
    let h = Harness::with_config(2, EngineConfig::new().with_retry(slow_retry));
    let r0 = h.create(mysql_item(ITEM)).await;
    h.executor.always_fail("i-1");

    h.engine
        .upsert(mysql_item(ITEM).with_marker("v2"))
        .await
        .unwrap();
    assert!(h.wait_for_event(ITEM, "rollout-retry").await);
    h.instances.remove("i-1");
    h.instances.add("i-9");

    let status = h.wait_for_rollout(ITEM, r0).await.expect("converged on new set");
    let r1 = status.last_done_revision.unwrap();
    assert_eq!(status.reconcile_detail.expected_count, 2);
    assert_eq!(status.reconcile_detail.succeed_count, 2);
    assert!(h.executor.applied(r1).contains("i-9"));
}

#[tokio::test]
async fn test_template_change_triggers_referencing_items() {
    let h = Harness::new(2);
    let r0 = h.create(mysql_item(ITEM)).await;
    let other = reconf_core::ConfigurationItem::new("other", "unrelated").unwrap();
    h.store.insert("unrelated", mysql_template());
    h.create(other).await;

    let mut template = mysql_template();
    if let Some(file) = template.files.get_mut("my.cnf") {
        file.content = "max_connections=60\nserver_id=1\n".to_string();
    }
    h.store.insert(MYSQL_TEMPLATE, template);

    let triggered = h
        .engine
        .notify_template_changed(&TemplateRef::new(MYSQL_TEMPLATE))
        .await;
    assert_eq!(triggered, 1);
    let status = h.wait_for_rollout(ITEM, r0).await.expect("re-rendered");
    assert_eq!(status.reconcile_detail.succeed_count, 2);
}

#[tokio::test]
async fn test_override_template_takes_precedence() {
    let h = Harness::new(1);
    let custom = mysql_template().with_file("extra.cnf", TemplateFile::new("a=1\n"));
    h.store.insert("mysql-custom", custom);
    let r0 = h.create(mysql_item(ITEM)).await;

    h.engine
        .upsert(mysql_item(ITEM).with_override_template("mysql-custom"))
        .await
        .unwrap();
    let status = h.wait_for_rollout(ITEM, r0).await.expect("override applied");
    let r1 = status.last_done_revision.unwrap();
    assert_eq!(h.executor.applied(r1).len(), 1);
}

#[tokio::test]
async fn test_progress_counts_never_exceed_expected() {
    let h = Harness::new(5);
    let r0 = h.create(mysql_item(ITEM)).await;
    h.executor.fail_times("i-3", 1);
    h.executor.fail_times("i-4", 2);

    h.engine
        .upsert(mysql_item(ITEM).with_marker("v2"))
        .await
        .unwrap();
    let consistent = wait_until(DEFAULT_TIMEOUT, || {
        let detail = h.engine.status(ITEM).unwrap().reconcile_detail;
        assert!(detail.succeed_count <= detail.expected_count);
        h.engine
            .status(ITEM)
            .is_ok_and(|s| s.phase == Phase::Running && s.last_done_revision != Some(r0))
    })
    .await;
    assert!(consistent);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_rollout_counts_are_bounded(
        instances in 0usize..5,
        failures in proptest::collection::vec(0u32..4, 5),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let h = Harness::new(instances);
            let r0 = h.create(mysql_item(ITEM)).await;
            for (i, times) in failures.iter().enumerate() {
                h.executor.fail_times(&format!("i-{i}"), *times);
            }
            h.engine
                .upsert(mysql_item(ITEM).with_marker("v2"))
                .await
                .unwrap();

            let settled = wait_until(DEFAULT_TIMEOUT, || {
                let status = h.engine.status(ITEM).unwrap();
                let detail = &status.reconcile_detail;
                assert!(detail.succeed_count <= detail.expected_count);
                matches!(status.phase, Phase::Running | Phase::FailedAndPause)
                    && status.update_revision != Some(r0)
            })
            .await;
            assert!(settled);

            let status = h.engine.status(ITEM).unwrap();
            let needs_more = failures.iter().take(instances).any(|t| *t > 2);
            if needs_more {
                assert_eq!(status.phase, Phase::FailedAndPause);
            } else {
                assert_eq!(status.phase, Phase::Running);
                assert_eq!(status.reconcile_detail.succeed_count as usize, instances);
            }
        });
    }
}
