/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! # Resource manager
//!
//! Tracks named resources, issues compatible shared/exclusive locks, and
//! enforces capacity-based reservations. Lock acquisition order whenever more
//! than one of the three tables is held: `resources` -> `locks` ->
//! `reservations`. Violating that order is a design defect.

use {
    parking_lot::{Condvar, Mutex},
    std::{
        collections::{HashMap, HashSet},
        sync::atomic::{AtomicBool, Ordering as AtomicOrdering},
        thread,
        time::{Duration, Instant},
    },
};

/// The default lock timeout recorded for expiry-sweep purposes when the
/// caller asked for an indefinite wait (`timeout_ms <= 0`)
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const CLEANUP_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Past this many waiters on a single resource, `detect_deadlock` trips. This
/// is a conservative length heuristic, not real cycle detection.
const DEADLOCK_QUEUE_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Model,
    GpuMemory,
    CpuMemory,
    ComputeUnit,
    Storage,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn compatible_with(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub id: String,
    pub rtype: ResourceType,
    pub name: String,
    pub capacity: usize,
    pub used: usize,
    pub available: bool,
    pub last_accessed: Instant,
    pub holders: HashSet<String>,
}

impl ResourceInfo {
    pub fn new(id: impl Into<String>, rtype: ResourceType, name: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            rtype,
            name: name.into(),
            capacity,
            used: 0,
            available: true,
            last_accessed: Instant::now(),
            holders: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    holder_id: String,
    mode: LockMode,
    acquired_time: Instant,
    timeout: Duration,
}

#[derive(Debug, Clone)]
struct ReservationEntry {
    requester_id: String,
    amount: usize,
    reserved_time: Instant,
    duration: Duration,
}

pub struct ResourceManager {
    resources: Mutex<HashMap<String, ResourceInfo>>,
    locks: Mutex<HashMap<String, Vec<LockEntry>>>,
    reservations: Mutex<HashMap<String, Vec<ReservationEntry>>>,
    waiting_counts: Mutex<HashMap<String, usize>>,
    /// Paired with `locks`, not a private mutex of its own. A waiter must
    /// hold `locks` continuously from its compatibility check through the
    /// call to `wait`/`wait_for`, since `parking_lot::Condvar` only
    /// guarantees atomicity between "unlock and sleep" relative to the
    /// mutex it's given. Pairing it with an unrelated mutex would leave a
    /// window between the failed check and the wait call where a
    /// concurrent `release_lock` notification could be missed.
    wait_cvar: Condvar,
    status_callback: Mutex<Option<Box<dyn Fn(&str, bool) + Send + Sync>>>,
    cleanup_running: AtomicBool,
    cleanup_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ResourceManager {
    pub fn new() -> std::sync::Arc<Self> {
        let mgr = std::sync::Arc::new(Self {
            resources: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
            waiting_counts: Mutex::new(HashMap::new()),
            wait_cvar: Condvar::new(),
            status_callback: Mutex::new(None),
            cleanup_running: AtomicBool::new(true),
            cleanup_thread: Mutex::new(None),
        });
        let sweep_handle = {
            let mgr = std::sync::Arc::clone(&mgr);
            thread::spawn(move || mgr.cleanup_sweep_loop())
        };
        *mgr.cleanup_thread.lock() = Some(sweep_handle);
        mgr
    }

    pub fn set_resource_status_callback<F>(&self, callback: F)
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        *self.status_callback.lock() = Some(Box::new(callback));
    }

    fn notify_status(&self, resource_id: &str, available: bool) {
        if let Some(cb) = self.status_callback.lock().as_ref() {
            cb(resource_id, available);
        }
    }

    pub fn register(&self, info: ResourceInfo) -> bool {
        let mut resources = self.resources.lock();
        if resources.contains_key(&info.id) {
            return false;
        }
        let id = info.id.clone();
        resources.insert(id, info);
        true
    }

    pub fn unregister(&self, resource_id: &str) -> bool {
        let existed = {
            let mut resources = self.resources.lock();
            resources.remove(resource_id).is_some()
        };
        if !existed {
            return false;
        }
        self.locks.lock().remove(resource_id);
        self.reservations.lock().remove(resource_id);
        self.waiting_counts.lock().remove(resource_id);
        self.wait_cvar.notify_all();
        existed
    }

    fn is_compatible(existing: &[LockEntry], mode: LockMode) -> bool {
        existing.iter().all(|l| l.mode.compatible_with(mode))
    }

    /// Acquire a lock on `resource_id` for `holder_id`. `timeout_ms <= 0`
    /// waits indefinitely; the lock's recorded timeout for expiry-sweep
    /// purposes defaults to [`DEFAULT_LOCK_TIMEOUT`] in that case.
    pub fn acquire_lock(&self, resource_id: &str, holder_id: &str, mode: LockMode, timeout_ms: i64) -> bool {
        if !self.resources.lock().contains_key(resource_id) {
            return false;
        }
        let deadline = if timeout_ms > 0 {
            Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
        } else {
            None
        };
        let recorded_timeout = if timeout_ms > 0 {
            Duration::from_millis(timeout_ms as u64)
        } else {
            DEFAULT_LOCK_TIMEOUT
        };
        let mut locks = self.locks.lock();
        loop {
            let entry = locks.entry(resource_id.to_string()).or_default();
            if Self::is_compatible(entry, mode) {
                entry.push(LockEntry {
                    holder_id: holder_id.to_string(),
                    mode,
                    acquired_time: Instant::now(),
                    timeout: recorded_timeout,
                });
                drop(locks);
                let mut resources = self.resources.lock();
                if let Some(info) = resources.get_mut(resource_id) {
                    info.holders.insert(holder_id.to_string());
                    info.last_accessed = Instant::now();
                    info.available = false;
                }
                self.waiting_counts.lock().remove(resource_id);
                return true;
            }
            *self
                .waiting_counts
                .lock()
                .entry(resource_id.to_string())
                .or_insert(0) += 1;
            // `locks` stays held from the compatibility check above through
            // this call: `wait`/`wait_for` release it and re-acquire it
            // atomically, so a `release_lock` that needs the same mutex to
            // modify the entry can't slip a notification in between.
            let timed_out = match deadline {
                None => {
                    self.wait_cvar.wait(&mut locks);
                    false
                }
                Some(deadline) => {
                    let now = Instant::now();
                    now >= deadline || self.wait_cvar.wait_for(&mut locks, deadline - now).timed_out()
                }
            };
            self.waiting_counts
                .lock()
                .entry(resource_id.to_string())
                .and_modify(|c| *c = c.saturating_sub(1));
            if timed_out {
                return false;
            }
        }
    }

    pub fn release_lock(&self, resource_id: &str, holder_id: &str) -> bool {
        let released = {
            let mut locks = self.locks.lock();
            match locks.get_mut(resource_id) {
                Some(entries) => {
                    if let Some(pos) = entries.iter().position(|l| l.holder_id == holder_id) {
                        entries.remove(pos);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if released {
            let mut resources = self.resources.lock();
            let now_empty = if let Some(info) = resources.get_mut(resource_id) {
                info.holders.remove(holder_id);
                info.last_accessed = Instant::now();
                let empty = info.holders.is_empty();
                info.available = empty;
                empty
            } else {
                false
            };
            drop(resources);
            self.notify_status(resource_id, now_empty);
            self.wait_cvar.notify_all();
        }
        released
    }

    pub fn reserve(&self, resource_id: &str, requester_id: &str, amount: usize, duration_ms: u64) -> bool {
        let mut resources = self.resources.lock();
        match resources.get_mut(resource_id) {
            Some(info) => {
                if info.used + amount > info.capacity {
                    return false;
                }
                info.used += amount;
                info.last_accessed = Instant::now();
                drop(resources);
                self.reservations
                    .lock()
                    .entry(resource_id.to_string())
                    .or_default()
                    .push(ReservationEntry {
                        requester_id: requester_id.to_string(),
                        amount,
                        reserved_time: Instant::now(),
                        duration: Duration::from_millis(duration_ms),
                    });
                true
            }
            None => false,
        }
    }

    pub fn release_reservation(&self, resource_id: &str, requester_id: &str) -> bool {
        let amount = {
            let mut reservations = self.reservations.lock();
            match reservations.get_mut(resource_id) {
                Some(entries) => match entries.iter().position(|r| r.requester_id == requester_id) {
                    Some(pos) => Some(entries.remove(pos).amount),
                    None => None,
                },
                None => None,
            }
        };
        match amount {
            Some(amount) => {
                if let Some(info) = self.resources.lock().get_mut(resource_id) {
                    info.used = info.used.saturating_sub(amount);
                }
                true
            }
            None => false,
        }
    }

    pub fn is_available(&self, resource_id: &str, mode: LockMode) -> bool {
        let available = match self.resources.lock().get(resource_id) {
            Some(info) => info.available,
            None => return false,
        };
        if !available {
            return false;
        }
        let locks = self.locks.lock();
        match locks.get(resource_id) {
            Some(entries) => Self::is_compatible(entries, mode),
            None => true,
        }
    }

    pub fn info(&self, resource_id: &str) -> Option<ResourceInfo> {
        self.resources.lock().get(resource_id).cloned()
    }

    pub fn utilization(&self, resource_id: &str) -> Option<f64> {
        self.resources.lock().get(resource_id).map(|info| {
            if info.capacity == 0 {
                0.0
            } else {
                info.used as f64 / info.capacity as f64
            }
        })
    }

    pub fn list(&self, rtype: ResourceType) -> Vec<String> {
        self.resources
            .lock()
            .values()
            .filter(|info| info.rtype == rtype)
            .map(|info| info.id.clone())
            .collect()
    }

    pub fn statistics(&self) -> HashMap<String, usize> {
        let resources = self.resources.lock();
        let mut stats = HashMap::new();
        stats.insert("total_resources".to_string(), resources.len());
        stats.insert(
            "locked_resources".to_string(),
            resources.values().filter(|r| !r.holders.is_empty()).count(),
        );
        stats.insert(
            "total_used".to_string(),
            resources.values().map(|r| r.used).sum(),
        );
        stats
    }

    pub fn waiting_queue_length(&self, resource_id: &str) -> usize {
        *self.waiting_counts.lock().get(resource_id).unwrap_or(&0)
    }

    /// Returns `true` if any single resource has more than
    /// [`DEADLOCK_QUEUE_THRESHOLD`] waiters. A conservative heuristic, not
    /// real cycle detection.
    pub fn detect_deadlock(&self) -> bool {
        self.waiting_counts.lock().values().any(|&n| n > DEADLOCK_QUEUE_THRESHOLD)
    }

    pub fn force_release_holder_locks(&self, holder_id: &str) -> usize {
        let mut released_resources = Vec::new();
        {
            let mut locks = self.locks.lock();
            for (resource_id, entries) in locks.iter_mut() {
                let before = entries.len();
                entries.retain(|l| l.holder_id != holder_id);
                if entries.len() != before {
                    released_resources.push(resource_id.clone());
                }
            }
        }
        if released_resources.is_empty() {
            return 0;
        }
        let mut resources = self.resources.lock();
        for resource_id in &released_resources {
            if let Some(info) = resources.get_mut(resource_id) {
                info.holders.remove(holder_id);
                info.available = info.holders.is_empty();
            }
        }
        drop(resources);
        self.wait_cvar.notify_all();
        released_resources.len()
    }

    /// Remove locks/reservations whose deadline has passed. Invoked by the
    /// background sweep thread every 30s and callable directly in tests.
    pub fn cleanup_expired_locks(&self) {
        let now = Instant::now();
        let mut expired_per_resource: HashMap<String, Vec<String>> = HashMap::new();
        {
            let mut locks = self.locks.lock();
            for (resource_id, entries) in locks.iter_mut() {
                let mut expired = Vec::new();
                entries.retain(|l| {
                    let alive = now < l.acquired_time + l.timeout;
                    if !alive {
                        expired.push(l.holder_id.clone());
                    }
                    alive
                });
                if !expired.is_empty() {
                    expired_per_resource.insert(resource_id.clone(), expired);
                }
            }
        }
        if !expired_per_resource.is_empty() {
            let mut resources = self.resources.lock();
            for (resource_id, holders) in &expired_per_resource {
                if let Some(info) = resources.get_mut(resource_id) {
                    for h in holders {
                        info.holders.remove(h);
                    }
                    info.available = info.holders.is_empty();
                }
            }
            drop(resources);
            self.wait_cvar.notify_all();
        }
        self.cleanup_expired_reservations(now);
    }

    fn cleanup_expired_reservations(&self, now: Instant) {
        let mut restored: HashMap<String, usize> = HashMap::new();
        {
            let mut reservations = self.reservations.lock();
            for (resource_id, entries) in reservations.iter_mut() {
                let mut freed = 0usize;
                entries.retain(|r| {
                    let alive = now < r.reserved_time + r.duration;
                    if !alive {
                        freed += r.amount;
                    }
                    alive
                });
                if freed > 0 {
                    restored.insert(resource_id.clone(), freed);
                }
            }
        }
        if !restored.is_empty() {
            let mut resources = self.resources.lock();
            for (resource_id, freed) in restored {
                if let Some(info) = resources.get_mut(&resource_id) {
                    info.used = info.used.saturating_sub(freed);
                }
            }
        }
    }

    fn cleanup_sweep_loop(&self) {
        while self.cleanup_running.load(AtomicOrdering::Acquire) {
            thread::sleep(CLEANUP_SWEEP_INTERVAL);
            if !self.cleanup_running.load(AtomicOrdering::Acquire) {
                break;
            }
            self.cleanup_expired_locks();
            if self.detect_deadlock() {
                log::warn!("resource manager: possible deadlock detected (wait queue heuristic tripped)");
            }
        }
    }

    pub fn shutdown(&self) {
        self.cleanup_running.store(false, AtomicOrdering::Release);
        self.wait_cvar.notify_all();
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.cleanup_running.store(false, AtomicOrdering::Release);
    }
}

/// RAII scoped lock: acquires on construction, releases on drop. Move-only;
/// `isLocked()` is `false` when the acquire timed out.
pub struct ScopedLock<'a> {
    manager: &'a ResourceManager,
    resource_id: String,
    holder_id: String,
    locked: bool,
    released: bool,
}

impl<'a> ScopedLock<'a> {
    pub fn new(
        manager: &'a ResourceManager,
        resource_id: impl Into<String>,
        holder_id: impl Into<String>,
        mode: LockMode,
        timeout_ms: i64,
    ) -> Self {
        let resource_id = resource_id.into();
        let holder_id = holder_id.into();
        let locked = manager.acquire_lock(&resource_id, &holder_id, mode, timeout_ms);
        Self {
            manager,
            resource_id,
            holder_id,
            locked,
            released: !locked,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Manually release before the guard drops. A no-op if already released
    /// or the lock was never acquired.
    pub fn unlock(&mut self) {
        if self.locked && !self.released {
            self.manager.release_lock(&self.resource_id, &self.holder_id);
            self.released = true;
        }
    }
}

impl<'a> Drop for ScopedLock<'a> {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    fn manager_with(id: &str, rtype: ResourceType, capacity: usize) -> Arc<ResourceManager> {
        let mgr = ResourceManager::new();
        mgr.register(ResourceInfo::new(id, rtype, id, capacity));
        mgr
    }

    #[test]
    fn shared_locks_do_not_contend() {
        let mgr = manager_with("model", ResourceType::Model, 1);
        assert!(mgr.acquire_lock("model", "reader-1", LockMode::Shared, 100));
        assert!(mgr.acquire_lock("model", "reader-2", LockMode::Shared, 100));
        assert_eq!(mgr.info("model").unwrap().holders.len(), 2);
    }

    #[test]
    fn exclusive_lock_blocks_until_released() {
        let mgr = manager_with("model", ResourceType::Model, 1);
        assert!(mgr.acquire_lock("model", "writer-1", LockMode::Exclusive, 100));

        let waiter_mgr = Arc::clone(&mgr);
        let waiter = thread::spawn(move || waiter_mgr.acquire_lock("model", "writer-2", LockMode::Exclusive, 2_000));

        thread::sleep(Duration::from_millis(50));
        assert!(mgr.release_lock("model", "writer-1"));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn exclusive_acquire_times_out_when_contended() {
        let mgr = manager_with("model", ResourceType::Model, 1);
        assert!(mgr.acquire_lock("model", "writer-1", LockMode::Exclusive, 0));
        assert!(!mgr.acquire_lock("model", "writer-2", LockMode::Exclusive, 50));
    }

    #[test]
    fn reserve_rejects_amounts_past_capacity() {
        let mgr = manager_with("gpu_memory", ResourceType::GpuMemory, 4);
        assert!(mgr.reserve("gpu_memory", "job-1", 3, 60_000));
        assert!(!mgr.reserve("gpu_memory", "job-2", 2, 60_000));
        assert!(mgr.reserve("gpu_memory", "job-2", 1, 60_000));
    }

    #[test]
    fn expired_locks_are_swept() {
        let mgr = manager_with("model", ResourceType::Model, 1);
        assert!(mgr.acquire_lock("model", "holder", LockMode::Exclusive, 10));
        thread::sleep(Duration::from_millis(30));
        mgr.cleanup_expired_locks();
        assert!(mgr.info("model").unwrap().available);
    }

    #[test]
    fn deadlock_heuristic_trips_past_threshold() {
        let mgr = manager_with("model", ResourceType::Model, 1);
        assert!(mgr.acquire_lock("model", "writer-1", LockMode::Exclusive, 0));
        assert!(!mgr.detect_deadlock());

        let mut waiting = Vec::new();
        for i in 0..(DEADLOCK_QUEUE_THRESHOLD + 1) {
            let waiter_mgr = Arc::clone(&mgr);
            let holder = format!("waiter-{i}");
            waiting.push(thread::spawn(move || {
                waiter_mgr.acquire_lock("model", &holder, LockMode::Exclusive, 3_000)
            }));
        }
        thread::sleep(Duration::from_millis(100));
        assert!(mgr.detect_deadlock());

        mgr.force_release_holder_locks("writer-1");
        for w in waiting {
            let _ = w.join();
        }
    }

    #[test]
    fn scoped_lock_releases_on_drop() {
        let mgr = manager_with("model", ResourceType::Model, 1);
        {
            let guard = ScopedLock::new(&mgr, "model", "scope-holder", LockMode::Exclusive, 100);
            assert!(guard.is_locked());
            assert!(!mgr.is_available("model", LockMode::Shared));
        }
        assert!(mgr.is_available("model", LockMode::Shared));
    }
}
