//! The scheduler: admission, dispatch loop, timeouts, eviction and lifecycle.
//!
//! All scheduler state lives in a single [`Inner`] record behind a
//! `parking_lot::Mutex`. Every step — admission, the dispatch loop, a
//! completion, a timer firing — locks, mutates and unlocks; caller-supplied
//! futures are always awaited on spawned tasks, never under the lock. Timers
//! carry task ids rather than references, so a timer that fires after its
//! task has already settled is a no-op.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::options::{
    CapacityStrategy, QueueOverflowStrategy, SchedulerOptions, TaskExceedsCapacityStrategy,
};
use crate::core::capacity::CapacityTracker;
use crate::core::error::SchedulerError;
use crate::core::queue::PendingQueue;
use crate::core::release::{apply_catch_up, ReleaseRule, RuleState};
use crate::core::retry::{FailRecoveryStrategy, RecoveryDecision};
use crate::core::task::{Task, TaskFn, TaskHandle, TaskId, TaskParams};
use crate::util::clock::millis_since;

/// Which task groups `stop` settles eagerly instead of draining naturally.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopParams {
    /// Shorthand for all three flags below.
    pub stop_all: bool,
    /// Settle every pending task with [`SchedulerError::Stopped`].
    pub stop_waiting_tasks: bool,
    /// Settle every executing task's channel; the underlying work still runs
    /// to completion but its result is discarded.
    pub reject_executing_tasks: bool,
    /// Cancel every retry timer and settle the affected tasks.
    pub stop_task_retries: bool,
}

impl StopParams {
    /// Drain naturally: no pending, executing or retrying task is disturbed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Settle everything immediately.
    #[must_use]
    pub fn all() -> Self {
        Self {
            stop_all: true,
            ..Self::default()
        }
    }

    /// Settle pending tasks immediately.
    #[must_use]
    pub fn with_stop_waiting_tasks(mut self) -> Self {
        self.stop_waiting_tasks = true;
        self
    }

    /// Settle executing tasks' channels immediately.
    #[must_use]
    pub fn with_reject_executing_tasks(mut self) -> Self {
        self.reject_executing_tasks = true;
        self
    }

    /// Cancel retry timers immediately.
    #[must_use]
    pub fn with_stop_task_retries(mut self) -> Self {
        self.stop_task_retries = true;
        self
    }
}

/// Point-in-time snapshot of scheduler utilization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStats {
    /// Tasks waiting in the pending queue.
    pub queued_tasks: usize,
    /// Tasks currently executing.
    pub executing_tasks: usize,
    /// Tasks sleeping between a failure and their next attempt.
    pub retrying_tasks: usize,
    /// Capacity currently in use.
    pub used_capacity: f64,
    /// Number of tasks counted against the concurrency limit.
    pub used_concurrent: u32,
}

/// A dispatch decision taken under the lock; the callback is invoked and the
/// execution spawned only after the lock is released.
struct Dispatch<T> {
    id: TaskId,
    callback: TaskFn<T>,
    execution_timeout: Option<Duration>,
}

struct ExecutingTask<T> {
    task: Task<T>,
    reserved_capacity: f64,
    reserved_concurrent: u32,
    exec_timer: Option<JoinHandle<()>>,
}

struct RetryingTask<T> {
    task: Task<T>,
    /// `None` while a custom recovery hook is deciding.
    timer: Option<JoinHandle<()>>,
}

struct Inner<T> {
    options: SchedulerOptions,
    capacity: CapacityTracker,
    queue: PendingQueue<T>,
    executing: HashMap<TaskId, ExecutingTask<T>>,
    retrying: HashMap<TaskId, RetryingTask<T>>,
    rules: Vec<RuleState>,
    rules_awake: bool,
    next_task_id: u64,
    next_rule_token: u64,
    /// Monotonic milliseconds of the most recent dispatch.
    last_dispatch_at: Option<u64>,
    delay_wake_armed: bool,
    stopped: bool,
    /// Tasks owned by the scheduler whose result channel is not yet settled.
    live: usize,
}

impl<T> Inner<T> {
    /// Settle a task's result channel. Safe to call on an already-settled
    /// task; the channel fires at most once over a task's lifetime.
    fn settle(&mut self, task: &mut Task<T>, result: Result<T, SchedulerError>) {
        task.cancel_waiting_timer();
        if let Some(tx) = task.tx.take() {
            self.live = self.live.saturating_sub(1);
            let _ = tx.send(result);
        }
    }
}

struct Shared<T> {
    state: Mutex<Inner<T>>,
    started_at: Instant,
    done_tx: watch::Sender<bool>,
}

/// Releases whatever the entry still holds against the accountant.
fn release_reserved<T>(capacity: &mut CapacityTracker, entry: &mut ExecutingTask<T>) {
    if entry.reserved_capacity > 0.0 {
        capacity.release(entry.reserved_capacity);
        entry.reserved_capacity = 0.0;
    }
    if entry.reserved_concurrent > 0 {
        capacity.decr_concurrent(entry.reserved_concurrent);
        entry.reserved_concurrent = 0;
    }
}

impl<T: Send + 'static> Shared<T> {
    fn now_ms(&self) -> u64 {
        millis_since(self.started_at)
    }

    fn check_drained(&self, inner: &Inner<T>) {
        if inner.stopped && inner.live == 0 {
            self.done_tx.send_replace(true);
        }
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    fn submit(
        self: &Arc<Self>,
        params: TaskParams,
        callback: TaskFn<T>,
    ) -> Result<TaskHandle<T>, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle { rx };
        let dispatches = {
            let mut inner = self.state.lock();
            if inner.stopped {
                let _ = tx.send(Err(SchedulerError::Stopped));
                return Ok(handle);
            }
            let capacity = params.capacity.unwrap_or(1.0);
            let priority = params.priority.unwrap_or(5);
            if let Some(max) = inner.options.max_capacity {
                if capacity > max
                    && inner.options.task_exceeds_max_capacity_strategy
                        == TaskExceedsCapacityStrategy::ThrowError
                {
                    return Err(SchedulerError::MaxCapacityExceeded);
                }
            }
            if !capacity.is_finite() || capacity < 0.0 {
                return Err(SchedulerError::InvalidArgument(
                    "task capacity must be non-negative".into(),
                ));
            }
            if priority > 9 {
                return Err(SchedulerError::InvalidArgument(
                    "task priority must be in 0..=9".into(),
                ));
            }
            let id = inner.next_task_id;
            inner.next_task_id += 1;
            inner.live += 1;
            let task = Task {
                id,
                capacity,
                priority,
                seq: 0,
                time_added: 0,
                time_limit: None,
                retry_attempt: 0,
                params,
                callback,
                tx: Some(tx),
                waiting_timer: None,
            };
            self.admit(&mut inner, task, false);
            self.run_loop(&mut inner)
        };
        self.launch(dispatches);
        Ok(handle)
    }

    /// Insert a task into the pending indices, applying the overflow policy
    /// and arming the waiting-timeout timer. Shared between fresh submissions
    /// and retry re-admissions.
    fn admit(self: &Arc<Self>, inner: &mut Inner<T>, mut task: Task<T>, is_retry: bool) {
        if inner.stopped {
            inner.settle(&mut task, Err(SchedulerError::Stopped));
            self.check_drained(inner);
            return;
        }
        if let Some(max) = inner.options.max_capacity {
            if task.capacity > max {
                match inner.options.task_exceeds_max_capacity_strategy {
                    TaskExceedsCapacityStrategy::ThrowError => {
                        // Reachable only on retry re-admission after a
                        // reconfiguration lowered max_capacity below this
                        // task's requirement.
                        inner.settle(&mut task, Err(SchedulerError::MaxCapacityExceeded));
                        return;
                    }
                    TaskExceedsCapacityStrategy::WaitForFullCapacity => task.capacity = max,
                }
            }
        }
        if let Some(max_queue) = inner.options.max_queue_size {
            if inner.queue.len() >= max_queue {
                match inner.options.queue_size_exceeded_strategy {
                    QueueOverflowStrategy::ThrowError => {
                        warn!(task_id = task.id, "queue full, rejecting task");
                        inner.settle(&mut task, Err(SchedulerError::QueueSizeExceeded));
                        return;
                    }
                    QueueOverflowStrategy::Replace => {
                        if let Some(mut victim) = inner.queue.remove_oldest() {
                            warn!(task_id = victim.id, "queue full, evicting oldest task");
                            inner.settle(&mut victim, Err(SchedulerError::QueueSizeExceeded));
                        }
                    }
                    QueueOverflowStrategy::ReplaceByPriority => match inner.queue.lowest_priority()
                    {
                        Some((victim_id, victim_priority)) if victim_priority > task.priority => {
                            let mut victim =
                                inner.queue.remove(victim_id).expect("victim is pending");
                            warn!(
                                task_id = victim.id,
                                "queue full, evicting lower-priority task"
                            );
                            inner.settle(&mut victim, Err(SchedulerError::QueueSizeExceeded));
                        }
                        _ => {
                            warn!(task_id = task.id, "queue full, rejecting task");
                            inner.settle(&mut task, Err(SchedulerError::QueueSizeExceeded));
                            return;
                        }
                    },
                }
            }
        }
        let now = self.now_ms();
        task.time_added = now;
        if task.time_limit.is_none() {
            if let Some(limit) = task
                .params
                .queue_waiting_limit
                .or(inner.options.queue_waiting_limit)
            {
                task.time_limit = Some(now + limit.as_millis() as u64);
            }
        }
        // Retried tasks are exempt from the waiting-timeout budget; the
        // waiting limit above is honored normally because a carried
        // time_limit survives re-admission.
        if !is_retry {
            if let Some(wait_timeout) = task
                .params
                .queue_waiting_timeout
                .or(inner.options.queue_waiting_timeout)
            {
                let weak = Arc::downgrade(self);
                let id = task.id;
                task.waiting_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(wait_timeout).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.on_queue_wait_timeout(id);
                    }
                }));
            }
        }
        debug!(
            task_id = task.id,
            priority = task.priority,
            capacity = task.capacity,
            retry = is_retry,
            "task admitted"
        );
        inner.queue.insert(task);
        self.rules_wake(inner);
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    /// Select and dispatch every currently runnable task. Returns the
    /// dispatch decisions; the caller launches them after unlocking.
    fn run_loop(self: &Arc<Self>, inner: &mut Inner<T>) -> Vec<Dispatch<T>> {
        let mut dispatches = Vec::new();
        loop {
            if inner.queue.is_empty() {
                break;
            }
            if let Some(max_concurrent) = inner.options.max_concurrent {
                if inner.capacity.used_concurrent() >= max_concurrent {
                    break;
                }
            }
            let now = self.now_ms();
            if let Some(min_delay) = inner.options.min_delay_between_tasks {
                if let Some(last) = inner.last_dispatch_at {
                    let gap = min_delay.as_millis() as u64;
                    if now < last.saturating_add(gap) {
                        self.arm_delay_wake(inner, last + gap - now + 1);
                        break;
                    }
                }
            }
            let available = inner.capacity.available(inner.options.max_capacity);
            let selected = match inner.queue.aged_head(now) {
                // An aged task that does not fit holds the head: nothing
                // lower-priority may overtake it.
                Some((id, cap)) => match available {
                    Some(avail) if cap > avail => None,
                    _ => Some(id),
                },
                None => inner.queue.first_fit(available),
            };
            let Some(id) = selected else {
                break;
            };
            let mut task = inner.queue.remove(id).expect("selected task is pending");
            task.cancel_waiting_timer();
            let mut reserved_capacity = 0.0;
            if inner.options.max_capacity.is_some() {
                // Under claim the charge is permanent: nothing is reserved,
                // so completion gives nothing back.
                inner.capacity.charge(task.capacity);
                if inner.options.effective_capacity_strategy() == CapacityStrategy::Reserve {
                    reserved_capacity = task.capacity;
                }
            }
            inner.capacity.incr_concurrent();
            inner.last_dispatch_at = Some(now);
            let execution_timeout = task
                .params
                .execution_timeout
                .or(inner.options.execution_timeout);
            debug!(
                task_id = task.id,
                capacity = task.capacity,
                priority = task.priority,
                used_capacity = inner.capacity.used(),
                "task dispatched"
            );
            dispatches.push(Dispatch {
                id: task.id,
                callback: Arc::clone(&task.callback),
                execution_timeout,
            });
            inner.executing.insert(
                task.id,
                ExecutingTask {
                    task,
                    reserved_capacity,
                    reserved_concurrent: 1,
                    exec_timer: None,
                },
            );
        }
        if inner.queue.is_empty() {
            self.rules_sleep(inner);
        }
        dispatches
    }

    /// Invoke callbacks and spawn executions for decisions taken under the
    /// lock. User code runs here, so the lock must not be held.
    fn launch(self: &Arc<Self>, dispatches: Vec<Dispatch<T>>) {
        for dispatch in dispatches {
            let future = (dispatch.callback)();
            let timer = dispatch.execution_timeout.map(|timeout| {
                let weak = Arc::downgrade(self);
                let id = dispatch.id;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.on_execution_timeout(id);
                    }
                })
            });
            {
                let mut inner = self.state.lock();
                match inner.executing.get_mut(&dispatch.id) {
                    Some(entry) => entry.exec_timer = timer,
                    None => {
                        if let Some(timer) = timer {
                            timer.abort();
                        }
                    }
                }
            }
            let weak = Arc::downgrade(self);
            let id = dispatch.id;
            tokio::spawn(async move {
                let result = future.await;
                if let Some(shared) = weak.upgrade() {
                    shared.on_task_finished(id, result);
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // Completion, failure and timeout handling
    // ------------------------------------------------------------------

    fn on_task_finished(self: &Arc<Self>, id: TaskId, result: anyhow::Result<T>) {
        let dispatches = {
            let mut inner = self.state.lock();
            let Some(mut entry) = inner.executing.remove(&id) else {
                // Result already disowned: execution timeout or rejection.
                return;
            };
            if let Some(timer) = entry.exec_timer.take() {
                timer.abort();
            }
            release_reserved(&mut inner.capacity, &mut entry);
            match result {
                Ok(value) => {
                    debug!(task_id = id, "task completed");
                    inner.settle(&mut entry.task, Ok(value));
                }
                Err(error) => {
                    if entry.task.tx.is_some() {
                        debug!(task_id = id, "task failed");
                        self.handle_failure(&mut inner, entry.task, Arc::new(error));
                    }
                }
            }
            self.check_drained(&inner);
            self.run_loop(&mut inner)
        };
        self.launch(dispatches);
    }

    fn handle_failure(
        self: &Arc<Self>,
        inner: &mut Inner<T>,
        mut task: Task<T>,
        error: Arc<anyhow::Error>,
    ) {
        let strategy = task
            .params
            .fail_recovery
            .clone()
            .unwrap_or_else(|| inner.options.fail_recovery.clone());
        match strategy {
            FailRecoveryStrategy::None => {
                inner.settle(&mut task, Err(SchedulerError::task(error)));
            }
            FailRecoveryStrategy::Retry(policy) => {
                let attempt = task.retry_attempt + 1;
                if attempt > policy.retries {
                    debug!(
                        task_id = task.id,
                        attempts = task.retry_attempt,
                        "retries exhausted"
                    );
                    inner.settle(&mut task, Err(SchedulerError::task(error)));
                    return;
                }
                let delay = policy.delay_for(attempt);
                task.retry_attempt = attempt;
                let id = task.id;
                debug!(
                    task_id = id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
                let timer = self.spawn_retry_timer(id, delay);
                inner.retrying.insert(
                    id,
                    RetryingTask {
                        task,
                        timer: Some(timer),
                    },
                );
            }
            FailRecoveryStrategy::Custom(handler) => {
                let id = task.id;
                let attempt = task.retry_attempt;
                inner.retrying.insert(id, RetryingTask { task, timer: None });
                let weak = Arc::downgrade(self);
                let task_error = Arc::clone(&error);
                tokio::spawn(async move {
                    let decision = handler.on_failure(Arc::clone(&task_error), attempt).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.on_recovery_decision(id, task_error, decision);
                    }
                });
            }
        }
    }

    fn on_recovery_decision(
        self: &Arc<Self>,
        id: TaskId,
        task_error: Arc<anyhow::Error>,
        decision: anyhow::Result<RecoveryDecision>,
    ) {
        let mut inner = self.state.lock();
        let Some(mut entry) = inner.retrying.remove(&id) else {
            return;
        };
        if entry.task.tx.is_none() {
            return;
        }
        match decision {
            Ok(RecoveryDecision::Retry { delay }) => {
                entry.task.retry_attempt += 1;
                debug!(
                    task_id = id,
                    attempt = entry.task.retry_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "recovery hook requested retry"
                );
                entry.timer = Some(self.spawn_retry_timer(id, delay));
                inner.retrying.insert(id, entry);
            }
            Ok(RecoveryDecision::Fail { error }) => {
                inner.settle(
                    &mut entry.task,
                    Err(SchedulerError::task(Arc::new(error))),
                );
                self.check_drained(&inner);
            }
            Err(handler_error) => {
                inner.settle(
                    &mut entry.task,
                    Err(SchedulerError::OnFailure {
                        handler_error: Arc::new(handler_error),
                        task_error,
                    }),
                );
                self.check_drained(&inner);
            }
        }
    }

    fn spawn_retry_timer(self: &Arc<Self>, id: TaskId, delay: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.on_retry_fire(id);
            }
        })
    }

    fn on_retry_fire(self: &Arc<Self>, id: TaskId) {
        let dispatches = {
            let mut inner = self.state.lock();
            let Some(entry) = inner.retrying.remove(&id) else {
                return;
            };
            if entry.task.tx.is_none() {
                return;
            }
            self.admit(&mut inner, entry.task, true);
            self.run_loop(&mut inner)
        };
        self.launch(dispatches);
    }

    fn on_queue_wait_timeout(self: &Arc<Self>, id: TaskId) {
        let dispatches = {
            let mut inner = self.state.lock();
            let Some(mut task) = inner.queue.remove(id) else {
                return;
            };
            debug!(task_id = id, "task timed out waiting in queue");
            inner.settle(&mut task, Err(SchedulerError::QueueTimeout));
            self.check_drained(&inner);
            // The removed task may have been an aged head blocking dispatch.
            self.run_loop(&mut inner)
        };
        self.launch(dispatches);
    }

    fn on_execution_timeout(self: &Arc<Self>, id: TaskId) {
        let dispatches = {
            let mut inner = self.state.lock();
            let Some(mut entry) = inner.executing.remove(&id) else {
                return;
            };
            release_reserved(&mut inner.capacity, &mut entry);
            warn!(task_id = id, "task execution timed out, result disowned");
            inner.settle(&mut entry.task, Err(SchedulerError::ExecutionTimeout));
            self.check_drained(&inner);
            self.run_loop(&mut inner)
        };
        self.launch(dispatches);
    }

    // ------------------------------------------------------------------
    // Minimum-delay gate
    // ------------------------------------------------------------------

    fn arm_delay_wake(self: &Arc<Self>, inner: &mut Inner<T>, wait_ms: u64) {
        if inner.delay_wake_armed {
            return;
        }
        inner.delay_wake_armed = true;
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            if let Some(shared) = weak.upgrade() {
                shared.on_delay_wake();
            }
        });
    }

    fn on_delay_wake(self: &Arc<Self>) {
        let dispatches = {
            let mut inner = self.state.lock();
            inner.delay_wake_armed = false;
            self.run_loop(&mut inner)
        };
        self.launch(dispatches);
    }

    // ------------------------------------------------------------------
    // Release-rule driver
    // ------------------------------------------------------------------

    /// Re-enable dormant rule timers, applying any firings missed since the
    /// queue last emptied.
    fn rules_wake(self: &Arc<Self>, inner: &mut Inner<T>) {
        if inner.rules_awake || inner.rules.is_empty() {
            return;
        }
        let now = self.now_ms();
        let mut used = inner.capacity.used();
        apply_catch_up(&mut inner.rules, &mut used, now);
        inner.capacity.set_used(used);
        for state in inner.rules.iter_mut() {
            let interval = Duration::from_millis(state.rule.interval_ms());
            state.timer =
                Some(self.spawn_rule_timer(state.token, state.residual_delay(now), interval));
        }
        inner.rules_awake = true;
        debug!(used_capacity = inner.capacity.used(), "release rule timers resumed");
    }

    /// Disable rule timers so an idle scheduler does not hold the runtime
    /// open.
    fn rules_sleep(&self, inner: &mut Inner<T>) {
        if !inner.rules_awake {
            return;
        }
        for state in inner.rules.iter_mut() {
            state.cancel_timer();
        }
        inner.rules_awake = false;
        debug!("release rule timers paused");
    }

    fn spawn_rule_timer(
        self: &Arc<Self>,
        token: u64,
        initial: Duration,
        interval: Duration,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut delay = initial;
            loop {
                tokio::time::sleep(delay).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if !shared.on_rule_fire(token) {
                    return;
                }
                drop(shared);
                delay = interval;
            }
        })
    }

    /// Apply one periodic firing. Returns false if the rule is gone or
    /// dormant, telling the timer task to exit.
    fn on_rule_fire(self: &Arc<Self>, token: u64) -> bool {
        let dispatches = {
            let mut inner = self.state.lock();
            if !inner.rules_awake {
                return false;
            }
            let Some(idx) = inner.rules.iter().position(|state| state.token == token) else {
                return false;
            };
            let rule = inner.rules[idx].rule.clone();
            match rule {
                ReleaseRule::Reset { value, .. } => inner.capacity.set_used(value),
                ReleaseRule::Reduce { value, .. } => inner.capacity.release(value),
            }
            inner.rules[idx].last_applied = self.now_ms();
            debug!(used_capacity = inner.capacity.used(), "release rule applied");
            self.run_loop(&mut inner)
        };
        self.launch(dispatches);
        true
    }
}

/// Capacity-aware asynchronous task scheduler.
///
/// Admits caller-supplied units of work and decides, for each, when it may
/// execute under the configured capacity, concurrency and timing
/// constraints. Cloning is cheap; every clone drives the same scheduler.
///
/// Running callbacks are never cancelled: a task that exceeds its execution
/// timeout keeps running in the background, and only its externally observed
/// result is disowned.
///
/// # Example
///
/// ```no_run
/// use capflow::{Scheduler, SchedulerOptions};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let scheduler: Scheduler<String> =
///         Scheduler::new(SchedulerOptions::new().with_max_capacity(10.0))?;
///
///     let handle = scheduler.schedule_with_capacity(4.0, || async {
///         Ok("done".to_string())
///     })?;
///     let result = handle.await?;
///     assert_eq!(result, "done");
///     Ok(())
/// }
/// ```
pub struct Scheduler<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Scheduler<T> {
    /// Create a scheduler from validated options.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidArgument`] or
    /// [`SchedulerError::InvalidCall`] per the option validation rules.
    pub fn new(options: SchedulerOptions) -> Result<Self, SchedulerError> {
        options.validate()?;
        let initially_used = options.initially_used_capacity.unwrap_or(0.0);
        let mut next_rule_token = 0u64;
        let rules = options
            .release_rules
            .iter()
            .map(|rule| {
                let token = next_rule_token;
                next_rule_token += 1;
                RuleState::new(rule.clone(), 0, token)
            })
            .collect();
        let (done_tx, _done_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(Inner {
                options,
                capacity: CapacityTracker::new(initially_used),
                queue: PendingQueue::new(),
                executing: HashMap::new(),
                retrying: HashMap::new(),
                rules,
                rules_awake: false,
                next_task_id: 0,
                next_rule_token,
                last_dispatch_at: None,
                delay_wake_armed: false,
                stopped: false,
                live: 0,
            }),
            started_at: Instant::now(),
            done_tx,
        });
        Ok(Self { shared })
    }

    /// Schedule a task with default parameters (capacity 1, priority 5).
    ///
    /// The returned handle resolves with the task's result or a typed error.
    /// On retry the callback is invoked again, once per attempt.
    ///
    /// # Errors
    ///
    /// Synchronous misuse only; engine-initiated rejections settle the handle.
    pub fn schedule<F, Fut>(&self, f: F) -> Result<TaskHandle<T>, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.schedule_task(TaskParams::new(), f)
    }

    /// Schedule a task that occupies the given capacity while running.
    ///
    /// # Errors
    ///
    /// Synchronous misuse only; engine-initiated rejections settle the handle.
    pub fn schedule_with_capacity<F, Fut>(
        &self,
        capacity: f64,
        f: F,
    ) -> Result<TaskHandle<T>, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.schedule_task(TaskParams::new().with_capacity(capacity), f)
    }

    /// Schedule a task with full per-task parameters.
    ///
    /// # Errors
    ///
    /// Synchronous misuse only; engine-initiated rejections settle the handle.
    pub fn schedule_task<F, Fut>(
        &self,
        params: TaskParams,
        f: F,
    ) -> Result<TaskHandle<T>, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let callback: TaskFn<T> = Arc::new(move || f().boxed());
        self.shared.submit(params, callback)
    }

    /// Wrap a callable so each invocation forwards through [`schedule_task`].
    ///
    /// [`schedule_task`]: Self::schedule_task
    pub fn wrap<F, Fut>(
        &self,
        params: TaskParams,
        f: F,
    ) -> impl Fn() -> Result<TaskHandle<T>, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let callback: TaskFn<T> = Arc::new(move || f().boxed());
        move || shared.submit(params.clone(), Arc::clone(&callback))
    }

    /// The options the scheduler currently runs with.
    pub fn get_options(&self) -> SchedulerOptions {
        self.shared.state.lock().options.clone()
    }

    /// Replace the scheduler options.
    ///
    /// Pending and executing tasks are not disturbed; the new limits apply to
    /// future admission and dispatch decisions. Release-rule state is kept
    /// for rules that appear unchanged in the new list.
    ///
    /// # Errors
    ///
    /// Returns the same validation errors as [`Scheduler::new`].
    pub fn set_options(&self, options: SchedulerOptions) -> Result<(), SchedulerError> {
        options.validate()?;
        let dispatches = {
            let mut inner = self.shared.state.lock();
            let now = self.shared.now_ms();
            let mut old_rules = std::mem::take(&mut inner.rules);
            let mut next_rules = Vec::with_capacity(options.release_rules.len());
            for rule in &options.release_rules {
                if let Some(pos) = old_rules.iter().position(|state| state.rule == *rule) {
                    next_rules.push(old_rules.swap_remove(pos));
                } else {
                    let token = inner.next_rule_token;
                    inner.next_rule_token += 1;
                    let mut state = RuleState::new(rule.clone(), now, token);
                    if inner.rules_awake {
                        let interval = Duration::from_millis(rule.interval_ms());
                        state.timer = Some(self.shared.spawn_rule_timer(
                            token,
                            state.residual_delay(now),
                            interval,
                        ));
                    }
                    next_rules.push(state);
                }
            }
            for mut removed in old_rules {
                removed.cancel_timer();
            }
            inner.rules = next_rules;
            if inner.rules.is_empty() {
                inner.rules_awake = false;
            }
            inner.options = options;
            self.shared.run_loop(&mut inner)
        };
        self.shared.launch(dispatches);
        Ok(())
    }

    /// Current used capacity, after applying any pending release-rule
    /// catch-up.
    pub fn get_used_capacity(&self) -> f64 {
        let mut inner = self.shared.state.lock();
        if !inner.rules_awake && !inner.rules.is_empty() {
            let now = self.shared.now_ms();
            let mut used = inner.capacity.used();
            apply_catch_up(&mut inner.rules, &mut used, now);
            inner.capacity.set_used(used);
        }
        inner.capacity.used()
    }

    /// Set used capacity to an absolute value in `0..=max_capacity`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidCall`] without `max_capacity`;
    /// [`SchedulerError::InvalidArgument`] for out-of-range values.
    pub fn set_used_capacity(&self, value: f64) -> Result<(), SchedulerError> {
        let dispatches = {
            let mut inner = self.shared.state.lock();
            let Some(max) = inner.options.max_capacity else {
                return Err(SchedulerError::InvalidCall(
                    "cannot set used capacity without max_capacity".into(),
                ));
            };
            if !value.is_finite() || !(0.0..=max).contains(&value) {
                return Err(SchedulerError::InvalidArgument(
                    "used capacity must be within 0..=max_capacity".into(),
                ));
            }
            inner.capacity.set_used(value);
            self.shared.run_loop(&mut inner)
        };
        self.shared.launch(dispatches);
        Ok(())
    }

    /// Adjust used capacity by a delta, clamped to `[0, max_capacity]`.
    /// Returns the new value.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidCall`] without `max_capacity`.
    pub fn adjust_used_capacity(&self, delta: f64) -> Result<f64, SchedulerError> {
        let (dispatches, used) = {
            let mut inner = self.shared.state.lock();
            let Some(max) = inner.options.max_capacity else {
                return Err(SchedulerError::InvalidCall(
                    "cannot adjust used capacity without max_capacity".into(),
                ));
            };
            inner.capacity.adjust(delta, max);
            let used = inner.capacity.used();
            (self.shared.run_loop(&mut inner), used)
        };
        self.shared.launch(dispatches);
        Ok(used)
    }

    /// Utilization snapshot.
    pub fn stats(&self) -> SchedulerStats {
        let inner = self.shared.state.lock();
        SchedulerStats {
            queued_tasks: inner.queue.len(),
            executing_tasks: inner.executing.len(),
            retrying_tasks: inner.retrying.len(),
            used_capacity: inner.capacity.used(),
            used_concurrent: inner.capacity.used_concurrent(),
        }
    }

    /// Number of pending tasks.
    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    /// Stop the scheduler and wait until every remaining task has settled.
    ///
    /// Further `schedule` calls settle immediately with
    /// [`SchedulerError::Stopped`]. Unless the corresponding flag clears
    /// them, queued tasks keep draining under the stopped flag and executing
    /// tasks run to completion. Stopping an already-stopped scheduler just
    /// waits for the same drain.
    pub async fn stop(&self, params: StopParams) {
        let shared = Arc::clone(&self.shared);
        {
            let mut inner = shared.state.lock();
            if !inner.stopped {
                info!("scheduler stopping");
                inner.stopped = true;
            }
            let stop_waiting = params.stop_all || params.stop_waiting_tasks;
            let reject_executing = params.stop_all || params.reject_executing_tasks;
            let stop_retries = params.stop_all || params.stop_task_retries;
            if stop_waiting {
                for mut task in inner.queue.drain() {
                    inner.settle(&mut task, Err(SchedulerError::Stopped));
                }
            }
            if reject_executing {
                let mut settled = 0usize;
                for entry in inner.executing.values_mut() {
                    if let Some(tx) = entry.task.tx.take() {
                        let _ = tx.send(Err(SchedulerError::Stopped));
                        settled += 1;
                    }
                }
                inner.live = inner.live.saturating_sub(settled);
            }
            if stop_retries {
                let drained: Vec<RetryingTask<T>> =
                    inner.retrying.drain().map(|(_, entry)| entry).collect();
                for mut entry in drained {
                    if let Some(timer) = entry.timer.take() {
                        timer.abort();
                    }
                    inner.settle(&mut entry.task, Err(SchedulerError::Stopped));
                }
            }
            if inner.queue.is_empty() {
                shared.rules_sleep(&mut inner);
            }
            shared.check_drained(&inner);
        }
        let mut done = shared.done_tx.subscribe();
        let _ = done.wait_for(|drained| *drained).await;
    }
}
