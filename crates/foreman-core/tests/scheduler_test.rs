//! Tests for the parallel scheduler's dispatch loop: parallelism,
//! dependency ordering, failure propagation, timeouts, and aborts.

use std::sync::Arc;
use std::time::Duration;

use foreman_core::detect::ErrorKind;
use foreman_core::recovery::{RecoveryEngine, RecoveryStrategy, RetryPolicy};
use foreman_core::scheduler::{
    Executor,
    ExecutionOutcome, ParallelScheduler, SchedulerConfig, SchedulerError,
};
use foreman_core::monitor::StatusMonitor;
use foreman_models::Subtask;
use foreman_test_utils::{ScriptedExecutor, Script, graph_of, init_tracing, roster_of};

fn no_retry_engine() -> RecoveryEngine {
    RecoveryEngine::new(
        RecoveryStrategy::Retry,
        RetryPolicy {
            max_attempts: 0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pure_parallel_runs_all_at_once() {
    init_tracing();

    let graph = graph_of(&[("a", &[]), ("b", &[]), ("c", &[])]);
    let roster = roster_of(3, &["general"]);
    let executor = Arc::new(
        ScriptedExecutor::new().default_script(Script::Succeed {
            delay: Duration::from_millis(100),
        }),
    );

    let mut scheduler = ParallelScheduler::new(
        graph,
        roster,
        SchedulerConfig {
            max_concurrent: Some(3),
            ..SchedulerConfig::default()
        },
    )
    .expect("frozen graph");

    let report = scheduler.run(executor.clone() as Arc<dyn Executor>).await.expect("run");

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(report.completed, vec!["a", "b", "c"]);
    assert!(report.failed.is_empty());
    assert_eq!(executor.peak_concurrency(), 3, "all three dispatched together");
    assert_eq!(report.metrics.max_concurrent_observed, 3);
    assert!(
        report.metrics.total_wall_seconds < 0.2,
        "parallel execution should take one round, took {}s",
        report.metrics.total_wall_seconds
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn linear_chain_runs_in_order() {
    init_tracing();

    let graph = graph_of(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
    let roster = roster_of(3, &["general"]);
    let executor = Arc::new(ScriptedExecutor::new().default_script(Script::Succeed {
        delay: Duration::from_millis(10),
    }));

    let mut scheduler = ParallelScheduler::new(
        graph,
        roster,
        SchedulerConfig {
            max_concurrent: Some(3),
            ..SchedulerConfig::default()
        },
    )
    .expect("frozen graph");

    let report = scheduler.run(executor.clone() as Arc<dyn Executor>).await.expect("run");

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(executor.start_order(), vec!["a", "b", "c"]);
    assert_eq!(
        executor.peak_concurrency(),
        1,
        "chain tasks never overlap in running"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn diamond_failure_skips_dependents() {
    init_tracing();

    // a -> {b, c}; {b, c} -> d. c crashes; no recovery possible for a
    // critical crash, so d can never run.
    let graph = graph_of(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
    let roster = roster_of(2, &["general"]);
    let executor = Arc::new(ScriptedExecutor::new().script("c", Script::Crash));

    let mut scheduler = ParallelScheduler::new(
        graph,
        roster,
        SchedulerConfig {
            continue_on_error: true,
            ..SchedulerConfig::default()
        },
    )
    .expect("frozen graph");

    let report = scheduler.run(executor as Arc<dyn Executor>).await.expect("run");

    assert_eq!(report.completed, vec!["a", "b"]);
    let failed_ids: Vec<&str> = report.failed.iter().map(|f| f.task_id.as_str()).collect();
    assert_eq!(failed_ids, vec!["c", "d"]);

    let c = report.failed.iter().find(|f| f.task_id == "c").unwrap();
    assert_eq!(c.kind, Some(ErrorKind::Crash));

    let d = report.failed.iter().find(|f| f.task_id == "d").unwrap();
    assert_eq!(d.reason, "dependency failed");
    assert_eq!(report.metrics.skipped_tasks, 1);
    assert_eq!(report.metrics.failed_tasks, 1);

    match report.outcome {
        ExecutionOutcome::Failed { failed_tasks } => {
            assert_eq!(failed_tasks, vec!["c", "d"]);
        }
        other => panic!("expected Failed outcome, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_cap_is_never_exceeded() {
    init_tracing();

    let entries: Vec<(String, Vec<&str>)> =
        (0..8).map(|i| (format!("t{i}"), vec![])).collect();
    let borrowed: Vec<(&str, &[&str])> = entries
        .iter()
        .map(|(id, deps)| (id.as_str(), deps.as_slice()))
        .collect();
    let graph = graph_of(&borrowed);

    let roster = roster_of(8, &["general"]);
    let executor = Arc::new(ScriptedExecutor::new().default_script(Script::Succeed {
        delay: Duration::from_millis(20),
    }));

    let mut scheduler = ParallelScheduler::new(
        graph,
        roster,
        SchedulerConfig {
            max_concurrent: Some(2),
            ..SchedulerConfig::default()
        },
    )
    .expect("frozen graph");

    let report = scheduler.run(executor.clone() as Arc<dyn Executor>).await.expect("run");

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert!(
        executor.peak_concurrency() <= 2,
        "cap of 2 exceeded: {}",
        executor.peak_concurrency()
    );
    assert_eq!(report.metrics.max_concurrent_observed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_subtask_dispatches_exactly_once_on_success() {
    init_tracing();

    let graph = graph_of(&[
        ("fetch", &[]),
        ("parse", &["fetch"]),
        ("index", &["fetch"]),
        ("report", &["parse", "index"]),
    ]);
    let roster = roster_of(2, &["general"]);
    let executor = Arc::new(ScriptedExecutor::new().default_script(Script::Succeed {
        delay: Duration::from_millis(5),
    }));

    let mut scheduler =
        ParallelScheduler::new(graph, roster, SchedulerConfig::default()).expect("frozen graph");

    let report = scheduler.run(executor.clone() as Arc<dyn Executor>).await.expect("run");

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    for id in ["fetch", "parse", "index", "report"] {
        assert_eq!(executor.call_count(id), 1, "{id} dispatched once");
    }
    // Finality: every subtask decided exactly one way.
    assert_eq!(report.completed.len() + report.failed.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_is_classified_and_fails_without_retries() {
    init_tracing();

    let graph = graph_of(&[("slow", &[])]);
    let roster = roster_of(1, &["general"]);
    let executor = Arc::new(ScriptedExecutor::new().script(
        "slow",
        Script::Busy {
            duration: Duration::from_millis(300),
        },
    ));

    let mut scheduler = ParallelScheduler::new(
        graph,
        roster,
        SchedulerConfig {
            task_timeout: Some(Duration::from_millis(30)),
            continue_on_error: true,
            ..SchedulerConfig::default()
        },
    )
    .expect("frozen graph")
    .with_recovery_engine(no_retry_engine());

    let report = scheduler.run(executor as Arc<dyn Executor>).await.expect("run");

    let failed = &report.failed[0];
    assert_eq!(failed.task_id, "slow");
    assert_eq!(failed.kind, Some(ErrorKind::Timeout));

    let history = scheduler
        .detector()
        .history(None, Some("slow"), Some(ErrorKind::Timeout));
    assert_eq!(history.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn first_failure_aborts_and_cancels_running_work() {
    init_tracing();

    let graph = graph_of(&[("boom", &[]), ("marathon", &[])]);
    let roster = roster_of(2, &["general"]);
    let executor = Arc::new(
        ScriptedExecutor::new()
            .script("boom", Script::Crash)
            .script(
                "marathon",
                Script::Busy {
                    duration: Duration::from_secs(5),
                },
            ),
    );

    let mut scheduler = ParallelScheduler::new(
        graph,
        roster,
        SchedulerConfig {
            continue_on_error: false,
            ..SchedulerConfig::default()
        },
    )
    .expect("frozen graph");

    let report = scheduler.run(executor as Arc<dyn Executor>).await.expect("run");

    assert_eq!(
        report.outcome,
        ExecutionOutcome::Aborted {
            first_failure: "boom".to_owned()
        }
    );
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].task_id, "boom");
    assert_eq!(
        report.cancelled,
        vec!["marathon"],
        "running work reports as cancelled, not failed"
    );
    assert!(
        report.metrics.total_wall_seconds < 2.0,
        "abort must not wait out the marathon sleep"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_capability_fails_subtask_when_continuing() {
    init_tracing();

    let graph = foreman_core::graph::TaskGraph::from_subtasks(vec![
        Subtask::new("normal", "plain work"),
        Subtask::new("exotic", "needs a unicorn").requires(["unicorn-wrangling"]),
    ])
    .expect("valid graph");
    let roster = roster_of(1, &["general"]);
    let executor = Arc::new(ScriptedExecutor::new());

    let mut scheduler = ParallelScheduler::new(
        graph,
        roster,
        SchedulerConfig {
            continue_on_error: true,
            ..SchedulerConfig::default()
        },
    )
    .expect("frozen graph");

    let report = scheduler.run(executor as Arc<dyn Executor>).await.expect("run");

    assert_eq!(report.completed, vec!["normal"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].task_id, "exotic");
    assert!(report.failed[0].reason.contains("no capable agent"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_capability_aborts_when_not_continuing() {
    init_tracing();

    let graph = foreman_core::graph::TaskGraph::from_subtasks(vec![
        Subtask::new("exotic", "needs a unicorn").requires(["unicorn-wrangling"]),
    ])
    .expect("valid graph");
    let roster = roster_of(1, &["general"]);
    let executor = Arc::new(ScriptedExecutor::new());

    let mut scheduler =
        ParallelScheduler::new(graph, roster, SchedulerConfig::default()).expect("frozen graph");

    let report = scheduler.run(executor as Arc<dyn Executor>).await.expect("run");
    assert_eq!(
        report.outcome,
        ExecutionOutcome::Aborted {
            first_failure: "exotic".to_owned()
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unfrozen_graph_is_rejected_up_front() {
    let graph = foreman_core::graph::TaskGraph::new();
    let err = ParallelScheduler::new(graph, roster_of(1, &["general"]), SchedulerConfig::default())
        .err()
        .expect("must reject");
    assert!(matches!(err, SchedulerError::GraphNotFrozen));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stuck_agent_is_visible_mid_run() {
    init_tracing();

    let graph = graph_of(&[("grind", &[])]);
    let roster = roster_of(1, &["general"]);
    let executor = Arc::new(ScriptedExecutor::new().script(
        "grind",
        Script::Busy {
            duration: Duration::from_millis(300),
        },
    ));

    let monitor = Arc::new(StatusMonitor::with_stuck_threshold(Duration::from_millis(50)));
    let mut scheduler =
        ParallelScheduler::new(graph, roster, SchedulerConfig::default())
            .expect("frozen graph")
            .with_monitor(Arc::clone(&monitor));

    let handle = tokio::spawn(async move {
        let report = scheduler.run(executor as Arc<dyn Executor>).await.expect("run");
        report
    });

    // The worker never reports progress, so by 150ms it is stuck.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let stuck = monitor.detect_stuck();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].agent_id, "agent-0");
    assert!(stuck[0].seconds_stuck >= 0.05);
    assert_eq!(stuck[0].current_task.as_deref(), Some("grind"));

    let report = handle.await.expect("join");
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert!(
        monitor.detect_stuck().is_empty(),
        "idle agents are never stuck"
    );
}
