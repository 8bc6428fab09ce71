/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! Task types
//!
//! The reference implementation models a task as a class hierarchy rooted at
//! `BaseTask`. Rust has no single idiomatic stand-in for virtual dispatch, so
//! this is a trait object (`Box<dyn Task>`) carrying a small fixed record of
//! its own (id/name/priority/cancel flag) the way `BaseTask`'s protected
//! fields do, plus `execute` as the one abstract method implementors supply.

use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// The outcome of a single `Task::execute` call
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    pub success: bool,
    pub message: String,
    pub output_data: String,
    pub duration: Duration,
    pub data: HashMap<String, String>,
}

impl TaskResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Shared bookkeeping every task carries, regardless of what `execute` does.
/// Mirrors `BaseTask`'s protected fields.
pub struct TaskHandle {
    id: String,
    name: String,
    priority: TaskPriority,
    cancelled: AtomicBool,
    created_time: Instant,
}

impl TaskHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority,
            cancelled: AtomicBool::new(false),
            created_time: Instant::now(),
        }
    }
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }
    pub fn created_time(&self) -> Instant {
        self.created_time
    }
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release)
    }
}

/// The one abstract method every task must supply, plus an optional model
/// hint used by the engine's model-switch optimization.
///
/// `Sync` is required because a running task stays reachable from the
/// engine's cancellation registry: `cancel_task` may call `cancel()` from a
/// different thread than the one executing it.
pub trait Task: Send + Sync {
    fn handle(&self) -> &TaskHandle;
    fn execute(&self) -> TaskResult;
    /// Name of the model this task needs loaded, if any. Empty/`None` means
    /// the task has no model affinity.
    fn required_model(&self) -> Option<&str> {
        None
    }

    fn id(&self) -> &str {
        self.handle().id()
    }
    fn name(&self) -> &str {
        self.handle().name()
    }
    fn priority(&self) -> TaskPriority {
        self.handle().priority()
    }
    fn is_cancelled(&self) -> bool {
        self.handle().is_cancelled()
    }
    fn cancel(&self) {
        self.handle().cancel()
    }
}

/// A queued task: strictly by priority descending, ties by `created_time`
/// ascending (FIFO within a priority). `BinaryHeap` is a max-heap, so this
/// `Ord` impl is written so that "greater" means "dequeue first".
pub(crate) struct QueuedTask {
    pub(crate) task: Arc<dyn Task>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority() == other.task.priority()
            && self.task.handle().created_time() == other.task.handle().created_time()
    }
}
impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.task.priority().cmp(&other.task.priority()) {
            Ordering::Equal => {
                // earlier created_time must compare as "greater" so the max-heap
                // pops it first
                other
                    .task
                    .handle()
                    .created_time()
                    .cmp(&self.task.handle().created_time())
            }
            ord => ord,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::BinaryHeap, sync::Arc, thread, time::Duration};

    struct NoopTask {
        handle: TaskHandle,
    }

    impl NoopTask {
        fn new(id: &str, priority: TaskPriority) -> Self {
            Self {
                handle: TaskHandle::new(id, id, priority),
            }
        }
    }

    impl Task for NoopTask {
        fn handle(&self) -> &TaskHandle {
            &self.handle
        }
        fn execute(&self) -> TaskResult {
            TaskResult::ok("noop")
        }
    }

    fn push(heap: &mut BinaryHeap<QueuedTask>, id: &str, priority: TaskPriority) {
        heap.push(QueuedTask {
            task: Arc::new(NoopTask::new(id, priority)),
        });
        // guarantee strictly increasing created_time across pushes on fast hosts
        thread::sleep(Duration::from_millis(1));
    }

    #[test]
    fn priority_dequeues_highest_first() {
        let mut heap = BinaryHeap::new();
        push(&mut heap, "a", TaskPriority::Low);
        push(&mut heap, "b", TaskPriority::Urgent);
        push(&mut heap, "c", TaskPriority::Normal);
        push(&mut heap, "d", TaskPriority::High);

        let mut order = Vec::new();
        while let Some(queued) = heap.pop() {
            order.push(queued.task.id().to_string());
        }
        assert_eq!(order, vec!["b", "d", "c", "a"]);
    }

    #[test]
    fn same_priority_is_fifo() {
        let mut heap = BinaryHeap::new();
        push(&mut heap, "first", TaskPriority::Normal);
        push(&mut heap, "second", TaskPriority::Normal);
        push(&mut heap, "third", TaskPriority::Normal);

        assert_eq!(heap.pop().unwrap().task.id(), "first");
        assert_eq!(heap.pop().unwrap().task.id(), "second");
        assert_eq!(heap.pop().unwrap().task.id(), "third");
    }

    #[test]
    fn cancel_flag_is_visible_through_trait_default_methods() {
        let task = NoopTask::new("x", TaskPriority::Low);
        assert!(!task.is_cancelled());
        task.cancel();
        assert!(task.is_cancelled());
    }
}
