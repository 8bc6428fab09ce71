/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! # Workflow engine
//!
//! Accepts tasks, dispatches them across worker threads respecting priority
//! and resource prerequisites, surfaces cancellation and results.

use {
    crate::{
        resource::{LockMode, ResourceInfo, ResourceManager, ResourceType},
        task::{QueuedTask, Task, TaskResult, TaskStatus},
    },
    parking_lot::{Condvar, Mutex},
    std::{
        collections::{BinaryHeap, HashMap},
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    },
};

type TaskArc = Arc<dyn Task>;

const POLL_RESOLUTION: Duration = Duration::from_millis(10);

struct TaskRecord {
    status: Mutex<TaskStatus>,
}

/// Cross-thread queue state: the heap itself plus a cheap lookup of what's
/// currently pending so `getTaskStatus` doesn't need to scan the heap.
struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    stop_requested: bool,
}

pub struct WorkflowEngine {
    queue: Mutex<QueueState>,
    queue_cvar: Condvar,
    records: Mutex<HashMap<String, Arc<TaskRecord>>>,
    results: Mutex<HashMap<String, TaskResult>>,
    results_cvar: Condvar,
    task_resources: Mutex<HashMap<String, Vec<String>>>,
    /// Tasks currently being executed by a worker, keyed by id, so a
    /// `RUNNING` task can still be reached by `cancel_task`.
    active_tasks: Mutex<HashMap<String, TaskArc>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    worker_count: AtomicUsize,
    running: AtomicBool,
    running_task_count: AtomicUsize,
    completed_task_count: AtomicUsize,
    resource_manager: Arc<ResourceManager>,
    optimize_model_switching: AtomicBool,
    current_loaded_model: Mutex<Option<String>>,
    completion_callback: Mutex<Option<Box<dyn Fn(&str, &TaskResult) + Send + Sync>>>,
    initialized: AtomicBool,
}

impl WorkflowEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                stop_requested: false,
            }),
            queue_cvar: Condvar::new(),
            records: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            results_cvar: Condvar::new(),
            task_resources: Mutex::new(HashMap::new()),
            active_tasks: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            worker_count: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            running_task_count: AtomicUsize::new(0),
            completed_task_count: AtomicUsize::new(0),
            resource_manager: ResourceManager::new(),
            optimize_model_switching: AtomicBool::new(false),
            current_loaded_model: Mutex::new(None),
            completion_callback: Mutex::new(None),
            initialized: AtomicBool::new(false),
        })
    }

    /// `worker_count == 0` defaults to the host's available parallelism
    /// (falling back to 4 if it can't be determined). Idempotent.
    pub fn initialize(self: &Arc<Self>, worker_count: usize) {
        if self.initialized.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        let resolved = if worker_count == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            worker_count
        };
        self.worker_count.store(resolved, AtomicOrdering::Release);
    }

    pub fn start(self: &Arc<Self>) -> bool {
        if !self.initialized.load(AtomicOrdering::Acquire) {
            self.initialize(0);
        }
        if self.running.swap(true, AtomicOrdering::AcqRel) {
            return false;
        }
        self.resource_manager
            .register(ResourceInfo::new("llama_model", ResourceType::Model, "llama_model", 1));
        self.resource_manager.register(ResourceInfo::new(
            "stable_diffusion_model",
            ResourceType::Model,
            "stable_diffusion_model",
            1,
        ));
        self.resource_manager
            .register(ResourceInfo::new("gpu_memory", ResourceType::GpuMemory, "gpu_memory", 1));
        let worker_count = self.worker_count.load(AtomicOrdering::Acquire);
        self.resource_manager.register(ResourceInfo::new(
            "cpu_cores",
            ResourceType::CpuMemory,
            "cpu_cores",
            worker_count,
        ));
        let mut workers = self.workers.lock();
        for _ in 0..worker_count {
            let engine = Arc::clone(self);
            workers.push(thread::spawn(move || engine.worker_loop()));
        }
        log::info!("workflow engine started with {worker_count} workers");
        true
    }

    pub fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, AtomicOrdering::AcqRel) {
            return;
        }
        {
            let mut queue = self.queue.lock();
            queue.stop_requested = true;
        }
        self.queue_cvar.notify_all();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        // cancel every task still sitting in the queue
        let mut queue = self.queue.lock();
        for queued in queue.heap.drain() {
            queued.task.cancel();
            self.set_status(queued.task.id(), TaskStatus::Cancelled);
        }
        self.resource_manager.shutdown();
        log::info!("workflow engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.load(AtomicOrdering::Acquire)
    }

    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.resource_manager
    }

    pub fn optimize_model_switching(&self, enable: bool) {
        self.optimize_model_switching.store(enable, AtomicOrdering::Release);
    }

    pub fn is_model_switching_optimized(&self) -> bool {
        self.optimize_model_switching.load(AtomicOrdering::Acquire)
    }

    pub fn set_task_completion_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &TaskResult) + Send + Sync + 'static,
    {
        *self.completion_callback.lock() = Some(Box::new(callback));
    }

    fn set_status(&self, task_id: &str, status: TaskStatus) {
        if let Some(record) = self.records.lock().get(task_id) {
            *record.status.lock() = status;
        }
    }

    /// Fails if the engine isn't running or `task.id()` is already known.
    pub fn submit_task(&self, task: Box<dyn Task>) -> bool {
        self.enqueue(Arc::from(task))
    }

    fn enqueue(&self, task: TaskArc) -> bool {
        if !self.is_running() {
            return false;
        }
        let id = task.id().to_string();
        {
            let mut records = self.records.lock();
            if records.contains_key(&id) {
                return false;
            }
            records.insert(id.clone(), Arc::new(TaskRecord { status: Mutex::new(TaskStatus::Pending) }));
        }
        self.queue.lock().heap.push(QueuedTask { task });
        self.queue_cvar.notify_one();
        true
    }

    /// Acquires every listed resource for `task.id()`, in order, from the
    /// submitter's perspective; on any failure releases what it already took
    /// and returns `false` without enqueuing. The resources stay held across
    /// the queue wait and execution, released by the worker on completion.
    pub fn submit_task_with_resources(&self, task: Box<dyn Task>, resources: &[String], mode: LockMode) -> bool {
        if !self.is_running() {
            return false;
        }
        let task: TaskArc = Arc::from(task);
        let id = task.id().to_string();
        if self.records.lock().contains_key(&id) {
            return false;
        }
        let mut acquired = Vec::with_capacity(resources.len());
        for resource_id in resources {
            if self.resource_manager.acquire_lock(resource_id, &id, mode, 5_000) {
                acquired.push(resource_id.clone());
            } else {
                for held in &acquired {
                    self.resource_manager.release_lock(held, &id);
                }
                return false;
            }
        }
        {
            let mut records = self.records.lock();
            records.insert(id.clone(), Arc::new(TaskRecord { status: Mutex::new(TaskStatus::Pending) }));
        }
        self.task_resources.lock().insert(id, acquired);
        self.queue.lock().heap.push(QueuedTask { task });
        self.queue_cvar.notify_one();
        true
    }

    /// Cooperative: flips a `PENDING` task to `CANCELLED` immediately; a
    /// `RUNNING` task only stops once it observes `is_cancelled()` itself.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let status = match self.records.lock().get(task_id) {
            Some(record) => *record.status.lock(),
            None => return false,
        };
        match status {
            TaskStatus::Pending => {
                let mut queue = self.queue.lock();
                if let Some(queued) = queue.heap.iter().find(|q| q.task.id() == task_id) {
                    queued.task.cancel();
                }
                drop(queue);
                self.set_status(task_id, TaskStatus::Cancelled);
                self.results
                    .lock()
                    .insert(task_id.to_string(), TaskResult::failed("Task cancelled before dispatch"));
                self.results_cvar.notify_all();
                true
            }
            TaskStatus::Running => {
                // the worker observes is_cancelled() on its next checkpoint and
                // finalizes the status transition itself
                match self.active_tasks.lock().get(task_id) {
                    Some(task) => {
                        task.cancel();
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }

    pub fn get_task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.records.lock().get(task_id).map(|r| *r.status.lock())
    }

    pub fn get_task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.results.lock().get(task_id).cloned()
    }

    pub fn pending_task_count(&self) -> usize {
        self.queue.lock().heap.len()
    }

    pub fn running_task_count(&self) -> usize {
        self.running_task_count.load(AtomicOrdering::Acquire)
    }

    pub fn completed_task_count(&self) -> usize {
        self.completed_task_count.load(AtomicOrdering::Acquire)
    }

    /// Drops task bookkeeping for tasks in a terminal status; their results
    /// remain queryable via `get_task_result`.
    pub fn cleanup_completed_tasks(&self) {
        self.records.lock().retain(|_, record| {
            !matches!(
                *record.status.lock(),
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
            )
        });
    }

    /// Polls at ~10ms resolution; returns a synthetic timeout result if
    /// `timeout_ms` elapses first. `timeout_ms == 0` waits indefinitely.
    pub fn wait_for_task(&self, task_id: &str, timeout_ms: u64) -> TaskResult {
        let deadline = if timeout_ms > 0 {
            Some(Instant::now() + Duration::from_millis(timeout_ms))
        } else {
            None
        };
        loop {
            if let Some(result) = self.get_task_result(task_id) {
                return result;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return TaskResult::failed("Task wait timeout");
                }
            }
            thread::sleep(POLL_RESOLUTION);
        }
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let queued = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(queued) = queue.heap.pop() {
                        break Some(queued);
                    }
                    if queue.stop_requested {
                        break None;
                    }
                    self.queue_cvar.wait(&mut queue);
                }
            };
            let queued = match queued {
                Some(q) => q,
                None => break,
            };
            self.execute_task(queued.task);
        }
    }

    fn execute_task(&self, task: TaskArc) {
        let id = task.id().to_string();
        if task.is_cancelled() {
            self.set_status(&id, TaskStatus::Cancelled);
            self.results
                .lock()
                .insert(id.clone(), TaskResult::failed("Task cancelled before dispatch"));
            self.results_cvar.notify_all();
            self.release_task_resources(&id);
            return;
        }
        self.set_status(&id, TaskStatus::Running);
        self.running_task_count.fetch_add(1, AtomicOrdering::AcqRel);
        self.active_tasks.lock().insert(id.clone(), Arc::clone(&task));

        if self.optimize_model_switching.load(AtomicOrdering::Acquire) {
            if let Some(model) = task.required_model() {
                let mut current = self.current_loaded_model.lock();
                if current.as_deref() != Some(model) {
                    log::info!("workflow engine: switching loaded model to '{model}'");
                    *current = Some(model.to_string());
                }
            }
        }

        let started = Instant::now();
        let mut result = task.execute();
        result.duration = started.elapsed();
        if task.is_cancelled() {
            result.success = false;
            result.message = "Task cancelled during execution".to_string();
            self.set_status(&id, TaskStatus::Cancelled);
        } else if result.success {
            self.set_status(&id, TaskStatus::Completed);
        } else {
            self.set_status(&id, TaskStatus::Failed);
        }

        self.running_task_count.fetch_sub(1, AtomicOrdering::AcqRel);
        self.completed_task_count.fetch_add(1, AtomicOrdering::AcqRel);
        self.active_tasks.lock().remove(&id);
        self.results.lock().insert(id.clone(), result.clone());
        self.results_cvar.notify_all();

        if let Some(cb) = self.completion_callback.lock().as_ref() {
            cb(&id, &result);
        }
        self.release_task_resources(&id);
    }

    fn release_task_resources(&self, task_id: &str) {
        if let Some(resources) = self.task_resources.lock().remove(task_id) {
            for resource_id in resources {
                self.resource_manager.release_lock(&resource_id, task_id);
            }
        }
    }
}
