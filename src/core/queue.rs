//! Pending-task indices: priority order, admission order and ageing deadlines.

use std::collections::{BTreeMap, HashMap};

use crate::core::task::{Task, TaskId};

/// The three pending-task orderings plus the owning arena.
///
/// A pending task always appears in the priority and admission indices, and
/// in the deadline index iff its `time_limit` is set. Ordering within the
/// priority index is `(priority, admission seq)`, so newcomers land behind
/// equal-priority incumbents and the whole index reads in dispatch order.
pub(crate) struct PendingQueue<T> {
    tasks: HashMap<TaskId, Task<T>>,
    by_priority: BTreeMap<(u8, u64), TaskId>,
    by_admission: BTreeMap<u64, TaskId>,
    by_deadline: BTreeMap<(u64, u64), TaskId>,
    next_seq: u64,
}

impl<T> PendingQueue<T> {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            by_priority: BTreeMap::new(),
            by_admission: BTreeMap::new(),
            by_deadline: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Insert a task, assigning it a fresh admission sequence number.
    pub fn insert(&mut self, mut task: Task<T>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        task.seq = seq;
        self.by_priority.insert((task.priority, seq), task.id);
        self.by_admission.insert(seq, task.id);
        if let Some(limit) = task.time_limit {
            self.by_deadline.insert((limit, seq), task.id);
        }
        self.tasks.insert(task.id, task);
    }

    /// Remove a task from every index. Returns `None` for unknown ids, so a
    /// stale handle held by a late timer is harmless.
    pub fn remove(&mut self, id: TaskId) -> Option<Task<T>> {
        let task = self.tasks.remove(&id)?;
        self.by_priority.remove(&(task.priority, task.seq));
        self.by_admission.remove(&task.seq);
        if let Some(limit) = task.time_limit {
            self.by_deadline.remove(&(limit, task.seq));
        }
        Some(task)
    }

    /// Remove and return the earliest-admitted pending task.
    pub fn remove_oldest(&mut self) -> Option<Task<T>> {
        let (_, &id) = self.by_admission.first_key_value()?;
        self.remove(id)
    }

    /// The lowest-priority entry (the back of the priority order).
    pub fn lowest_priority(&self) -> Option<(TaskId, u8)> {
        self.by_priority
            .last_key_value()
            .map(|(&(priority, _), &id)| (id, priority))
    }

    /// The head of the deadline index, if its deadline has already passed.
    pub fn aged_head(&self, now_ms: u64) -> Option<(TaskId, f64)> {
        let (&(limit, _), &id) = self.by_deadline.first_key_value()?;
        if limit <= now_ms {
            Some((id, self.tasks[&id].capacity))
        } else {
            None
        }
    }

    /// First task in priority order that fits the available capacity.
    /// `available = None` means capacity is unbounded.
    pub fn first_fit(&self, available: Option<f64>) -> Option<TaskId> {
        match available {
            None => self.by_priority.values().next().copied(),
            Some(avail) => self
                .by_priority
                .values()
                .find(|id| self.tasks[*id].capacity <= avail)
                .copied(),
        }
    }

    /// Remove every pending task, in admission order.
    pub fn drain(&mut self) -> Vec<Task<T>> {
        let ids: Vec<TaskId> = self.by_admission.values().copied().collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{TaskFn, TaskParams};
    use futures::FutureExt;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn noop_callback() -> TaskFn<u32> {
        Arc::new(|| async { Ok::<u32, anyhow::Error>(0) }.boxed())
    }

    fn make_task(id: TaskId, priority: u8, capacity: f64, time_limit: Option<u64>) -> Task<u32> {
        let (tx, _rx) = oneshot::channel();
        Task {
            id,
            capacity,
            priority,
            seq: 0,
            time_added: 0,
            time_limit,
            retry_attempt: 0,
            params: TaskParams::default(),
            callback: noop_callback(),
            tx: Some(tx),
            waiting_timer: None,
        }
    }

    #[tokio::test]
    async fn priority_order_is_ascending_with_fifo_bands() {
        let mut q = PendingQueue::new();
        q.insert(make_task(1, 5, 1.0, None));
        q.insert(make_task(2, 1, 1.0, None));
        q.insert(make_task(3, 5, 1.0, None));
        q.insert(make_task(4, 9, 1.0, None));

        // Unbounded capacity: strict (priority, admission) order.
        assert_eq!(q.first_fit(None), Some(2));
        q.remove(2);
        assert_eq!(q.first_fit(None), Some(1));
        q.remove(1);
        assert_eq!(q.first_fit(None), Some(3));
        q.remove(3);
        assert_eq!(q.first_fit(None), Some(4));
    }

    #[tokio::test]
    async fn first_fit_skips_tasks_that_do_not_fit() {
        let mut q = PendingQueue::new();
        q.insert(make_task(1, 0, 8.0, None));
        q.insert(make_task(2, 5, 3.0, None));
        assert_eq!(q.first_fit(Some(4.0)), Some(2));
        assert_eq!(q.first_fit(Some(10.0)), Some(1));
        assert_eq!(q.first_fit(Some(1.0)), None);
    }

    #[tokio::test]
    async fn aged_head_respects_deadline_order_and_now() {
        let mut q = PendingQueue::new();
        q.insert(make_task(1, 5, 1.0, Some(200)));
        q.insert(make_task(2, 0, 1.0, Some(100)));
        q.insert(make_task(3, 5, 1.0, None));

        assert!(q.aged_head(50).is_none());
        // Earliest deadline wins regardless of priority.
        assert_eq!(q.aged_head(150).map(|(id, _)| id), Some(2));
        q.remove(2);
        assert_eq!(q.aged_head(250).map(|(id, _)| id), Some(1));
    }

    #[tokio::test]
    async fn remove_clears_every_index() {
        let mut q = PendingQueue::new();
        q.insert(make_task(1, 5, 1.0, Some(100)));
        let task = q.remove(1).expect("present");
        assert_eq!(task.id, 1);
        assert!(q.is_empty());
        assert!(q.aged_head(1000).is_none());
        assert_eq!(q.first_fit(None), None);
        assert!(q.remove(1).is_none());
    }

    #[tokio::test]
    async fn oldest_and_lowest_priority_selection() {
        let mut q = PendingQueue::new();
        q.insert(make_task(1, 5, 1.0, None));
        q.insert(make_task(2, 9, 1.0, None));
        q.insert(make_task(3, 0, 1.0, None));

        assert_eq!(q.lowest_priority(), Some((2, 9)));
        assert_eq!(q.remove_oldest().map(|t| t.id), Some(1));
        assert_eq!(q.len(), 2);
    }
}
