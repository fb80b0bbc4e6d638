//! Tests for fail-recovery strategies: retry policies and custom hooks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use capflow::{
    FailRecoveryStrategy, FailureHandler, RecoveryDecision, RetryPolicy, Scheduler,
    SchedulerError, SchedulerOptions, TaskParams,
};

/// Fails the first `failures` attempts, then succeeds with the attempt count.
fn flaky_task(
    scheduler: &Scheduler<u32>,
    params: TaskParams,
    failures: u32,
    attempts: &Arc<AtomicU32>,
) -> capflow::TaskHandle<u32> {
    let attempts = Arc::clone(attempts);
    scheduler
        .schedule_task(params, move || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt <= failures {
                    Err(anyhow::anyhow!("attempt {attempt} failed"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .expect("schedule")
}

#[tokio::test]
async fn without_recovery_the_error_passes_through() {
    let scheduler: Scheduler<u32> = Scheduler::new(SchedulerOptions::new()).unwrap();
    let handle = scheduler
        .schedule(|| async { Err(anyhow::anyhow!("boom")) })
        .unwrap();
    match handle.await {
        Err(SchedulerError::Task(err)) => assert!(err.to_string().contains("boom")),
        other => panic!("expected task error, got {other:?}"),
    }
}

#[tokio::test]
async fn retry_recovers_after_transient_failures() {
    let scheduler: Scheduler<u32> = Scheduler::new(SchedulerOptions::new()).unwrap();
    let attempts = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::new()
        .with_retries(5)
        .with_min_timeout(Duration::from_millis(10))
        .with_factor(1.0);
    let handle = flaky_task(
        &scheduler,
        TaskParams::new().with_fail_recovery(FailRecoveryStrategy::Retry(policy)),
        2,
        &attempts,
    );
    assert_eq!(handle.await.unwrap(), 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_report_the_original_error() {
    let scheduler: Scheduler<u32> = Scheduler::new(SchedulerOptions::new()).unwrap();
    let attempts = Arc::new(AtomicU32::new(0));
    let started = Instant::now();
    let gaps = Arc::new(Mutex::new(Vec::new()));

    let policy = RetryPolicy::new()
        .with_retries(2)
        .with_min_timeout(Duration::from_millis(50))
        .with_factor(1.0);
    let attempts_clone = Arc::clone(&attempts);
    let gaps_clone = Arc::clone(&gaps);
    let handle = scheduler
        .schedule_task(
            TaskParams::new().with_fail_recovery(FailRecoveryStrategy::Retry(policy)),
            move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                gaps_clone.lock().unwrap().push(started.elapsed());
                async { Err(anyhow::anyhow!("always fails")) }
            },
        )
        .unwrap();

    match handle.await {
        Err(SchedulerError::Task(err)) => assert!(err.to_string().contains("always fails")),
        other => panic!("expected the task's own error, got {other:?}"),
    }
    // Initial attempt plus two retries, roughly 50ms apart.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let gaps = gaps.lock().unwrap();
    assert!(gaps[1] >= Duration::from_millis(40));
    assert!(gaps[2] >= gaps[1] + Duration::from_millis(40));
    assert!(gaps[2] < Duration::from_millis(400));
}

#[tokio::test]
async fn scheduler_level_recovery_applies_to_all_tasks() {
    let policy = RetryPolicy::new()
        .with_retries(3)
        .with_min_timeout(Duration::from_millis(5))
        .with_factor(1.0);
    let scheduler: Scheduler<u32> = Scheduler::new(
        SchedulerOptions::new().with_fail_recovery(FailRecoveryStrategy::Retry(policy)),
    )
    .unwrap();
    let attempts = Arc::new(AtomicU32::new(0));
    let handle = flaky_task(&scheduler, TaskParams::new(), 1, &attempts);
    assert_eq!(handle.await.unwrap(), 2);
}

struct RescueTwice;

#[async_trait]
impl FailureHandler for RescueTwice {
    async fn on_failure(
        &self,
        error: Arc<anyhow::Error>,
        attempt: u32,
    ) -> anyhow::Result<RecoveryDecision> {
        if attempt < 2 {
            Ok(RecoveryDecision::Retry {
                delay: Duration::from_millis(10),
            })
        } else {
            Ok(RecoveryDecision::Fail {
                error: anyhow::anyhow!("gave up after {attempt} retries: {error}"),
            })
        }
    }
}

#[tokio::test]
async fn custom_hook_drives_retries_and_final_error() {
    let scheduler: Scheduler<u32> = Scheduler::new(
        SchedulerOptions::new()
            .with_fail_recovery(FailRecoveryStrategy::Custom(Arc::new(RescueTwice))),
    )
    .unwrap();
    let attempts = Arc::new(AtomicU32::new(0));

    // Succeeds on the second attempt: the hook rescues it once.
    let handle = flaky_task(&scheduler, TaskParams::new(), 1, &attempts);
    assert_eq!(handle.await.unwrap(), 2);

    // Never succeeds: after two rescues the hook gives up with its error.
    let attempts = Arc::new(AtomicU32::new(0));
    let handle = flaky_task(&scheduler, TaskParams::new(), u32::MAX, &attempts);
    match handle.await {
        Err(SchedulerError::Task(err)) => {
            assert!(err.to_string().contains("gave up after 2 retries"));
        }
        other => panic!("expected hook-provided error, got {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

struct BrokenHook;

#[async_trait]
impl FailureHandler for BrokenHook {
    async fn on_failure(
        &self,
        _error: Arc<anyhow::Error>,
        _attempt: u32,
    ) -> anyhow::Result<RecoveryDecision> {
        Err(anyhow::anyhow!("hook exploded"))
    }
}

#[tokio::test]
async fn failing_hook_surfaces_both_errors() {
    let scheduler: Scheduler<u32> = Scheduler::new(
        SchedulerOptions::new()
            .with_fail_recovery(FailRecoveryStrategy::Custom(Arc::new(BrokenHook))),
    )
    .unwrap();
    let handle = scheduler
        .schedule(|| async { Err(anyhow::anyhow!("task broke")) })
        .unwrap();
    match handle.await {
        Err(SchedulerError::OnFailure {
            handler_error,
            task_error,
        }) => {
            assert!(handler_error.to_string().contains("hook exploded"));
            assert!(task_error.to_string().contains("task broke"));
        }
        other => panic!("expected OnFailure, got {other:?}"),
    }
}

#[tokio::test]
async fn retried_tasks_are_exempt_from_the_waiting_timeout() {
    let scheduler: Scheduler<u32> = Scheduler::new(
        SchedulerOptions::new()
            .with_max_capacity(10.0)
            .with_queue_waiting_timeout(Duration::from_millis(40)),
    )
    .unwrap();
    let attempts = Arc::new(AtomicU32::new(0));

    // First attempt runs immediately and fails; the retry is re-admitted at
    // ~60ms, while a blocker occupies the whole budget until ~200ms. Were
    // the waiting timeout re-armed, the retry would die in the queue.
    let policy = RetryPolicy::new()
        .with_retries(1)
        .with_min_timeout(Duration::from_millis(60))
        .with_factor(1.0);
    let handle = flaky_task(
        &scheduler,
        TaskParams::new()
            .with_capacity(5.0)
            .with_fail_recovery(FailRecoveryStrategy::Retry(policy)),
        1,
        &attempts,
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    let blocker = scheduler
        .schedule_with_capacity(10.0, || async {
            tokio::time::sleep(Duration::from_millis(190)).await;
            Ok(0)
        })
        .unwrap();

    assert_eq!(handle.await.unwrap(), 2);
    blocker.await.unwrap();
}
