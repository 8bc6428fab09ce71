/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! Integration-style tests exercising the dispatcher and resource manager
//! together, through the public `WorkflowEngine` surface only.

use crate::{
    engine::WorkflowEngine,
    resource::{LockMode, ResourceInfo, ResourceType},
    task::{Task, TaskHandle, TaskPriority, TaskResult},
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

struct RecordingTask {
    handle: TaskHandle,
    order: Arc<AtomicUsize>,
    tx: mpsc::Sender<(String, usize)>,
}

impl Task for RecordingTask {
    fn handle(&self) -> &TaskHandle {
        &self.handle
    }
    fn execute(&self) -> TaskResult {
        let position = self.order.fetch_add(1, Ordering::AcqRel);
        let _ = self.tx.send((self.handle.id().to_string(), position));
        TaskResult::ok("done")
    }
}

struct SleepyTask {
    handle: TaskHandle,
    sleep: Duration,
}

impl Task for SleepyTask {
    fn handle(&self) -> &TaskHandle {
        &self.handle
    }
    fn execute(&self) -> TaskResult {
        let step = Duration::from_millis(10);
        let mut remaining = self.sleep;
        while remaining > Duration::ZERO {
            if self.is_cancelled() {
                return TaskResult::failed("observed cancellation");
            }
            let nap = remaining.min(step);
            thread::sleep(nap);
            remaining -= nap;
        }
        TaskResult::ok("slept")
    }
}

#[test]
fn higher_priority_tasks_run_first_on_a_single_worker() {
    let engine = WorkflowEngine::new();
    engine.initialize(1);
    assert!(engine.start());

    let order = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    // the first task occupies the single worker so the rest queue up in the
    // order we want to observe, not in submission order
    let gate = Box::new(SleepyTask {
        handle: TaskHandle::new("gate", "gate", TaskPriority::Urgent),
        sleep: Duration::from_millis(60),
    });
    assert!(engine.submit_task(gate));
    thread::sleep(Duration::from_millis(10));

    for (id, priority) in [
        ("low", TaskPriority::Low),
        ("urgent", TaskPriority::Urgent),
        ("normal", TaskPriority::Normal),
        ("high", TaskPriority::High),
    ] {
        let task = Box::new(RecordingTask {
            handle: TaskHandle::new(id, id, priority),
            order: Arc::clone(&order),
            tx: tx.clone(),
        });
        assert!(engine.submit_task(task));
    }

    let mut seen = Vec::new();
    for _ in 0..4 {
        let (id, _) = rx.recv_timeout(Duration::from_secs(2)).expect("task result");
        seen.push(id);
    }
    assert_eq!(seen, vec!["urgent", "high", "normal", "low"]);

    engine.stop();
}

#[test]
fn exclusive_resource_serializes_contending_tasks() {
    let engine = WorkflowEngine::new();
    engine.initialize(4);
    assert!(engine.start());
    engine
        .resource_manager()
        .register(ResourceInfo::new("shared_gpu", ResourceType::GpuMemory, "shared_gpu", 1));

    for id in ["writer-a", "writer-b"] {
        let task = Box::new(SleepyTask {
            handle: TaskHandle::new(id, id, TaskPriority::Normal),
            sleep: Duration::from_millis(50),
        });
        assert!(engine.submit_task_with_resources(task, &["shared_gpu".to_string()], LockMode::Exclusive));
    }

    // both must eventually complete, and the resource must never report more
    // than one holder at a time while they run
    thread::sleep(Duration::from_millis(20));
    let info = engine.resource_manager().info("shared_gpu").unwrap();
    assert!(info.holders.len() <= 1);

    thread::sleep(Duration::from_millis(200));
    assert_eq!(engine.completed_task_count(), 2);

    engine.stop();
}

#[test]
fn cancelling_a_running_task_is_observed_cooperatively() {
    let engine = WorkflowEngine::new();
    engine.initialize(1);
    assert!(engine.start());

    let task = Box::new(SleepyTask {
        handle: TaskHandle::new("long-running", "long-running", TaskPriority::Normal),
        sleep: Duration::from_secs(5),
    });
    assert!(engine.submit_task(task));
    thread::sleep(Duration::from_millis(30));

    assert_eq!(engine.get_task_status("long-running"), Some(crate::task::TaskStatus::Running));
    assert!(engine.cancel_task("long-running"));

    let result = engine.wait_for_task("long-running", 2_000);
    assert!(!result.success);
    assert_eq!(engine.get_task_status("long-running"), Some(crate::task::TaskStatus::Cancelled));

    engine.stop();
}

#[test]
fn cancelling_a_pending_task_removes_it_before_dispatch() {
    let engine = WorkflowEngine::new();
    engine.initialize(1);
    assert!(engine.start());

    let gate = Box::new(SleepyTask {
        handle: TaskHandle::new("gate", "gate", TaskPriority::Urgent),
        sleep: Duration::from_millis(80),
    });
    assert!(engine.submit_task(gate));
    thread::sleep(Duration::from_millis(10));

    let queued = Box::new(SleepyTask {
        handle: TaskHandle::new("queued", "queued", TaskPriority::Normal),
        sleep: Duration::from_millis(10),
    });
    assert!(engine.submit_task(queued));
    assert_eq!(engine.get_task_status("queued"), Some(crate::task::TaskStatus::Pending));
    assert!(engine.cancel_task("queued"));
    assert_eq!(engine.get_task_status("queued"), Some(crate::task::TaskStatus::Cancelled));

    engine.stop();
}

#[test]
fn waiting_queue_length_reports_heavy_contention() {
    let engine = WorkflowEngine::new();
    engine.initialize(8);
    assert!(engine.start());
    engine
        .resource_manager()
        .register(ResourceInfo::new("single_slot", ResourceType::ComputeUnit, "single_slot", 1));

    // hold the resource from outside the engine so every submitted task queues
    let mgr = Arc::clone(engine.resource_manager());
    assert!(mgr.acquire_lock("single_slot", "external-holder", LockMode::Exclusive, 0));

    for i in 0..3 {
        let id = format!("contender-{i}");
        let task = Box::new(SleepyTask {
            handle: TaskHandle::new(id.clone(), id, TaskPriority::Normal),
            sleep: Duration::from_millis(10),
        });
        assert!(engine.submit_task_with_resources(task, &["single_slot".to_string()], LockMode::Exclusive));
    }

    thread::sleep(Duration::from_millis(50));
    assert!(mgr.waiting_queue_length("single_slot") > 0);

    mgr.force_release_holder_locks("external-holder");
    engine.stop();
}

#[test]
fn cleanup_completed_tasks_drops_terminal_bookkeeping_but_keeps_results() {
    let engine = WorkflowEngine::new();
    engine.initialize(1);
    assert!(engine.start());

    let task = Box::new(RecordingTask {
        handle: TaskHandle::new("t1", "t1", TaskPriority::Normal),
        order: Arc::new(AtomicUsize::new(0)),
        tx: mpsc::channel().0,
    });
    assert!(engine.submit_task(task));
    let result = engine.wait_for_task("t1", 2_000);
    assert!(result.success);

    engine.cleanup_completed_tasks();
    assert_eq!(engine.get_task_status("t1"), None);
    assert!(engine.get_task_result("t1").is_some());

    engine.stop();
}
