//! Pending-task priority queue
//!
//! Orders pending tasks by priority (lower value first), then by insertion
//! order so equal priorities dequeue FIFO. Beyond the usual heap operations
//! it supports removing arbitrary members, lookup by cache key and bulk
//! cancellation of tasks aimed at the same destination.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SchedulerError;
use crate::task::{Priority, Task, TaskId, TaskState};

/// A queued task together with its ordering key
///
/// Entries are ordered by priority (lowest value first), then by insertion
/// order (earlier first). `BinaryHeap` is a max heap, so both comparisons are
/// reversed.
struct QueueEntry {
    priority: Priority,
    insertion_order: u64,
    task: Arc<Task>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.task.id() == other.task.id()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.priority.cmp(&self.priority) {
            Ordering::Equal => other.insertion_order.cmp(&self.insertion_order),
            other => other,
        }
    }
}

/// Thread-safe queue of pending tasks
///
/// A task appears at most once. Every operation takes the queue's own lock,
/// so callers holding other scheduler locks must always acquire them before
/// this one.
pub struct PriorityQueue {
    state: Arc<Mutex<QueueState>>,
}

struct QueueState {
    /// Binary heap of queued tasks (max heap over reversed ordering)
    heap: BinaryHeap<QueueEntry>,

    /// Ids currently in the heap
    members: HashSet<TaskId>,

    /// Insertion counter (for FIFO ordering within same priority)
    insertion_counter: u64,
}

impl QueueState {
    fn take_matching<F>(&mut self, predicate: F) -> Vec<Arc<Task>>
    where
        F: Fn(&Task) -> bool,
    {
        let mut removed = Vec::new();
        let mut remaining = Vec::with_capacity(self.heap.len());
        for entry in self.heap.drain() {
            if predicate(entry.task.as_ref()) {
                removed.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        self.heap = remaining.into();

        removed.sort_by(|a, b| b.cmp(a));
        removed
            .into_iter()
            .map(|entry| {
                self.members.remove(&entry.task.id());
                entry.task
            })
            .collect()
    }
}

impl PriorityQueue {
    /// Create a new empty priority queue
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                members: HashSet::new(),
                insertion_counter: 0,
            })),
        }
    }

    /// Insert a pending task with the given priority
    ///
    /// The task's own priority is updated to match. Fails with
    /// [`SchedulerError::InvalidState`] if the task is already queued or is
    /// no longer pending.
    pub fn insert(&self, task: Arc<Task>, priority: Priority) -> Result<(), SchedulerError> {
        if task.state() != TaskState::Pending {
            return Err(SchedulerError::invalid_state(
                task.id(),
                "only pending tasks can be queued",
            ));
        }

        let mut state = self.state.lock();
        if !state.members.insert(task.id()) {
            return Err(SchedulerError::invalid_state(task.id(), "already queued"));
        }

        let insertion_order = state.insertion_counter;
        state.insertion_counter += 1;

        task.set_priority(priority);
        state.heap.push(QueueEntry {
            priority,
            insertion_order,
            task,
        });
        Ok(())
    }

    /// Remove and return the most urgent task
    ///
    /// Returns `None` if the queue is empty.
    pub fn extract_min(&self) -> Option<Arc<Task>> {
        let mut state = self.state.lock();
        let entry = state.heap.pop()?;
        state.members.remove(&entry.task.id());
        Some(entry.task)
    }

    /// Peek at the most urgent task without removing it
    pub fn peek(&self) -> Option<Arc<Task>> {
        let state = self.state.lock();
        state.heap.peek().map(|entry| entry.task.clone())
    }

    /// Remove a specific task. No-op if it is not queued.
    ///
    /// Returns whether the task was removed.
    pub fn remove(&self, task: &Task) -> bool {
        self.remove_by_id(task.id()).is_some()
    }

    /// Remove a task by id, returning it if it was queued
    pub fn remove_by_id(&self, id: TaskId) -> Option<Arc<Task>> {
        let mut state = self.state.lock();
        if !state.members.contains(&id) {
            return None;
        }
        state.take_matching(|task| task.id() == id).into_iter().next()
    }

    /// Find a queued task with the given cache key
    ///
    /// When several match, the most urgent one is returned.
    pub fn find_by_raw_key(&self, raw_key: &str) -> Option<Arc<Task>> {
        let state = self.state.lock();
        state
            .heap
            .iter()
            .filter(|entry| entry.task.raw_key() == Some(raw_key))
            .max()
            .map(|entry| entry.task.clone())
    }

    /// Cancel and remove every queued task (other than `task` itself) that
    /// targets the same destination as `task`
    ///
    /// Each removed task is flagged for cancellation before the lock is released.
    /// Returns the removed tasks, most urgent first.
    pub fn cancel_all_sharing_target(&self, task: &Task) -> Vec<Arc<Task>> {
        if task.target().is_none() {
            return Vec::new();
        }

        let mut state = self.state.lock();
        let removed = state.take_matching(|queued| {
            queued.id() != task.id() && queued.uses_same_target(task)
        });
        for queued in &removed {
            queued.request_cancel();
        }
        removed
    }

    /// Change the priority of a queued task, keeping its insertion order
    ///
    /// Returns `false` if the task is not queued.
    pub fn update_priority(&self, id: TaskId, priority: Priority) -> bool {
        let mut state = self.state.lock();
        if !state.members.contains(&id) {
            return false;
        }

        let mut entries = std::mem::take(&mut state.heap).into_vec();
        for entry in entries.iter_mut().filter(|entry| entry.task.id() == id) {
            entry.priority = priority;
            entry.task.set_priority(priority);
        }
        state.heap = entries.into();
        true
    }

    /// Check whether a task is queued
    pub fn contains(&self, id: TaskId) -> bool {
        self.state.lock().members.contains(&id)
    }

    /// Get the number of tasks in the queue
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.state.lock().heap.is_empty()
    }

    /// Remove every task, most urgent first
    pub fn drain(&self) -> Vec<Arc<Task>> {
        let mut state = self.state.lock();
        state.take_matching(|_| true)
    }

    /// Get all queued tasks (for debugging/inspection)
    ///
    /// Tasks are returned in arbitrary order (not priority order).
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        let state = self.state.lock();
        state.heap.iter().map(|entry| entry.task.clone()).collect()
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}
