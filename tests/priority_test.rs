//! Tests for priority ordering, FIFO bands and waiting-limit promotion.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use capflow::{Scheduler, SchedulerOptions, TaskParams};

fn tracked_task(
    scheduler: &Scheduler<u32>,
    label: u32,
    params: TaskParams,
    run: Duration,
    log: &Arc<Mutex<Vec<u32>>>,
) -> capflow::TaskHandle<u32> {
    let log = Arc::clone(log);
    scheduler
        .schedule_task(params, move || {
            log.lock().unwrap().push(label);
            async move {
                tokio::time::sleep(run).await;
                Ok(label)
            }
        })
        .expect("schedule")
}

#[tokio::test]
async fn dispatch_follows_priority_then_admission_order() {
    let scheduler: Scheduler<u32> =
        Scheduler::new(SchedulerOptions::new().with_max_concurrent(1)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    // First task runs immediately and holds the single slot while the rest
    // queue up in mixed priority order.
    let mut handles = vec![tracked_task(
        &scheduler,
        0,
        TaskParams::new(),
        Duration::from_millis(40),
        &log,
    )];
    for (label, priority) in [(1, 9), (2, 5), (3, 1), (4, 5)] {
        handles.push(tracked_task(
            &scheduler,
            label,
            TaskParams::new().with_priority(priority),
            Duration::from_millis(5),
            &log,
        ));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    // Priority 1 first, then the two priority-5 tasks in admission order,
    // then priority 9.
    assert_eq!(*log.lock().unwrap(), vec![0, 3, 2, 4, 1]);
}

#[tokio::test]
async fn equal_priority_tasks_run_in_admission_order() {
    let scheduler: Scheduler<u32> =
        Scheduler::new(SchedulerOptions::new().with_max_concurrent(1)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..5)
        .map(|label| {
            tracked_task(
                &scheduler,
                label,
                TaskParams::new(),
                Duration::from_millis(5),
                &log,
            )
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn waiting_limit_promotes_task_over_higher_priorities() {
    let scheduler: Scheduler<u32> =
        Scheduler::new(SchedulerOptions::new().with_max_capacity(10.0)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    // Fill the whole budget for a while.
    let blocker = tracked_task(
        &scheduler,
        0,
        TaskParams::new().with_capacity(10.0),
        Duration::from_millis(90),
        &log,
    );
    // A low-priority task with a short waiting limit...
    let aged = tracked_task(
        &scheduler,
        1,
        TaskParams::new()
            .with_capacity(5.0)
            .with_priority(9)
            .with_queue_waiting_limit(Duration::from_millis(40)),
        Duration::from_millis(5),
        &log,
    );
    // ...and an urgent task admitted after it.
    let urgent = tracked_task(
        &scheduler,
        2,
        TaskParams::new().with_capacity(5.0).with_priority(1),
        Duration::from_millis(5),
        &log,
    );

    blocker.await.unwrap();
    aged.await.unwrap();
    urgent.await.unwrap();
    // By the time capacity frees, the priority-9 task's limit has elapsed,
    // so it jumps ahead of the priority-1 task.
    assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn aged_task_that_does_not_fit_blocks_smaller_tasks() {
    let scheduler: Scheduler<u32> =
        Scheduler::new(SchedulerOptions::new().with_max_capacity(10.0)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let blocker = tracked_task(
        &scheduler,
        0,
        TaskParams::new().with_capacity(6.0),
        Duration::from_millis(100),
        &log,
    );
    // Needs 8 of 10: does not fit while the blocker holds 6.
    let aged = tracked_task(
        &scheduler,
        1,
        TaskParams::new()
            .with_capacity(8.0)
            .with_priority(9)
            .with_queue_waiting_limit(Duration::from_millis(10)),
        Duration::from_millis(5),
        &log,
    );
    tokio::time::sleep(Duration::from_millis(40)).await;

    // This small urgent task fits the remaining 4 units, but the aged head
    // holds the queue: dispatching it would starve the large task.
    let small = tracked_task(
        &scheduler,
        2,
        TaskParams::new().with_capacity(2.0).with_priority(1),
        Duration::from_millis(5),
        &log,
    );
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(*log.lock().unwrap(), vec![0]);

    blocker.await.unwrap();
    aged.await.unwrap();
    small.await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
}
