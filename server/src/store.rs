/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! # The in-memory keyspace
//!
//! `DataStore` owns every database, the TTL sweep thread, the change
//! counter, and the apply-callback that feeds the AOF. "Current DB" is a
//! per-connection concept and is never tracked here — callers always pass
//! the index they mean.

use {
    crate::value::{Entry, Value},
    parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    std::{
        cell::Cell,
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        thread,
        time::{Duration, SystemTime, UNIX_EPOCH},
    },
};

pub const DEFAULT_DB_COUNT: usize = 16;
const TTL_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const HOT_THRESHOLD: i64 = 5;

thread_local! {
    /// Set for the duration of an `EXEC` batch on the connection thread
    /// running it. `parking_lot::RwLock` isn't reentrant, so a queued
    /// command's own `begin_write` must not try to read-lock `txn_gate`
    /// while this same thread already holds it write-locked; this flag
    /// lets `begin_write` recognize that case and skip re-acquiring it.
    static IN_TRANSACTION_BATCH: Cell<bool> = Cell::new(false);
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}

#[derive(Default)]
pub struct Database {
    map: HashMap<Vec<u8>, Entry>,
}

type ApplyCallback = dyn Fn(&[Vec<u8>]) + Send + Sync;

/// RAII guard returned by `DataStore::begin_transaction`. Releases
/// `txn_gate`'s write lock and clears the batch marker together, so a
/// queued command's own `begin_write` only ever sees the marker set while
/// the write lock is actually held.
pub struct TransactionGate<'a> {
    _write: RwLockWriteGuard<'a, ()>,
}

impl Drop for TransactionGate<'_> {
    fn drop(&mut self) {
        IN_TRANSACTION_BATCH.with(|flag| flag.set(false));
    }
}

pub struct DataStore {
    databases: Vec<RwLock<Database>>,
    version_counter: AtomicU64,
    change_count: AtomicU64,
    loading: AtomicBool,
    apply_callback: RwLock<Option<Box<ApplyCallback>>>,
    sweep_running: AtomicBool,
    sweep_thread: RwLock<Option<thread::JoinHandle<()>>>,
    /// Held shared by every ordinary write, exclusively by `EXEC` while it
    /// applies a transaction's queued commands, so no standalone write can
    /// land in between two commands of the same transaction.
    txn_gate: RwLock<()>,
}

impl DataStore {
    pub fn new(db_count: usize) -> Arc<Self> {
        let store = Arc::new(Self {
            databases: (0..db_count).map(|_| RwLock::new(Database::default())).collect(),
            version_counter: AtomicU64::new(1),
            change_count: AtomicU64::new(0),
            loading: AtomicBool::new(false),
            apply_callback: RwLock::new(None),
            sweep_running: AtomicBool::new(true),
            sweep_thread: RwLock::new(None),
            txn_gate: RwLock::new(()),
        });
        let sweep_handle = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.ttl_sweep_loop())
        };
        *store.sweep_thread.write() = Some(sweep_handle);
        store
    }

    pub fn db_count(&self) -> usize {
        self.databases.len()
    }

    pub fn valid_db(&self, db: usize) -> bool {
        db < self.databases.len()
    }

    pub fn set_apply_callback<F>(&self, callback: F)
    where
        F: Fn(&[Vec<u8>]) + Send + Sync + 'static,
    {
        *self.apply_callback.write() = Some(Box::new(callback));
    }

    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::Release);
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn get_and_reset_change_count(&self) -> u64 {
        self.change_count.swap(0, Ordering::AcqRel)
    }

    /// Invoked by every write method after releasing the target database's
    /// write lock, so the AOF callback never runs underneath a held
    /// per-db lock. Commands still serialize through `begin_write`/
    /// `begin_transaction`, so AOF order matches commit order.
    fn record_write(&self, raw: &[Vec<u8>]) {
        if self.loading.load(Ordering::Acquire) {
            return;
        }
        self.change_count.fetch_add(1, Ordering::AcqRel);
        if let Some(cb) = self.apply_callback.read().as_ref() {
            cb(raw);
        }
    }

    fn next_version(&self) -> u64 {
        self.version_counter.fetch_add(1, Ordering::AcqRel)
    }

    /// Version of `key` in `db`, or `0` if the key doesn't exist (or never
    /// did). A `WATCH` capturing `0` is invalidated by the key's creation
    /// just as surely as an existing watch is invalidated by a later write,
    /// since creation, mutation, and expiry-driven deletion all change what
    /// this function returns.
    pub fn get_version(&self, db: usize, key: &[u8]) -> u64 {
        let mut guard = self.databases[db].write();
        expire_if_due(&mut guard, key);
        guard.map.get(key).map(|e| e.version).unwrap_or(0)
    }

    /// Acquired by the command layer around a single non-transactional
    /// write's execution. Shared with other ordinary writes; blocks on, and
    /// blocks, an in-progress `EXEC`. Returns `None` instead of read-locking
    /// `txn_gate` when called on a thread that is itself running an `EXEC`
    /// batch (see `begin_transaction`); re-locking there would deadlock
    /// against the write lock that same thread already holds.
    pub fn begin_write(&self) -> Option<RwLockReadGuard<'_, ()>> {
        if IN_TRANSACTION_BATCH.with(Cell::get) {
            None
        } else {
            Some(self.txn_gate.read())
        }
    }

    /// Acquired by the command layer around an entire `EXEC` batch so that
    /// no standalone write lands between two of its queued commands. Marks
    /// this thread as "inside a transaction batch" for the guard's lifetime
    /// so the queued commands' own `begin_write` calls don't try to nest a
    /// read lock under the write lock held here.
    pub fn begin_transaction(&self) -> TransactionGate<'_> {
        let write = self.txn_gate.write();
        IN_TRANSACTION_BATCH.with(|flag| flag.set(true));
        TransactionGate { _write: write }
    }

    pub fn set(&self, db: usize, key: Vec<u8>, value: Vec<u8>, raw: &[Vec<u8>]) {
        let version = self.next_version();
        let mut guard = self.databases[db].write();
        guard.map.insert(key, Entry::new(Value::Str(value), version));
        drop(guard);
        self.record_write(raw);
    }

    pub fn get(&self, db: usize, key: &[u8]) -> Option<Vec<u8>> {
        let mut guard = self.databases[db].write();
        expire_if_due(&mut guard, key);
        guard.map.get(key).and_then(|e| e.value.as_bytes()).map(|b| b.to_vec())
    }

    pub fn del(&self, db: usize, keys: &[Vec<u8>], raw: &[Vec<u8>]) -> usize {
        let mut guard = self.databases[db].write();
        let removed = keys.iter().filter(|k| guard.map.remove(k.as_slice()).is_some()).count();
        drop(guard);
        if removed > 0 {
            self.record_write(raw);
        }
        removed
    }

    pub fn exists(&self, db: usize, keys: &[Vec<u8>]) -> usize {
        let mut guard = self.databases[db].write();
        keys.iter()
            .filter(|k| {
                expire_if_due(&mut guard, k);
                guard.map.contains_key(k.as_slice())
            })
            .count()
    }

    pub fn keys(&self, db: usize, pattern: &[u8]) -> Vec<Vec<u8>> {
        self.scan(db, pattern, usize::MAX)
    }

    pub fn scan(&self, db: usize, pattern: &[u8], count: usize) -> Vec<Vec<u8>> {
        let mut guard = self.databases[db].write();
        let now = now_ms();
        let expired: Vec<Vec<u8>> = guard
            .map
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            guard.map.remove(&k);
        }
        guard
            .map
            .keys()
            .filter(|k| glob_match(pattern, k))
            .take(count)
            .cloned()
            .collect()
    }

    pub fn rename(&self, db: usize, src: &[u8], dst: &[u8], raw: &[Vec<u8>]) -> Result<(), ()> {
        let version = self.next_version();
        let mut guard = self.databases[db].write();
        expire_if_due(&mut guard, src);
        let entry = guard.map.remove(src).ok_or(())?;
        guard.map.insert(dst.to_vec(), Entry { version, ..entry });
        drop(guard);
        self.record_write(raw);
        Ok(())
    }

    /// Returns `1` on success, `0` if the key doesn't exist.
    pub fn pexpire(&self, db: usize, key: &[u8], ms: i64, raw: &[Vec<u8>]) -> i64 {
        let version = self.next_version();
        let mut guard = self.databases[db].write();
        expire_if_due(&mut guard, key);
        match guard.map.get_mut(key) {
            Some(entry) => {
                entry.expires_at_ms = Some(now_ms() + ms);
                entry.version = version;
                drop(guard);
                self.record_write(raw);
                1
            }
            None => 0,
        }
    }

    /// `-2` if the key doesn't exist, `-1` if it has no TTL, else ms
    /// remaining.
    pub fn pttl(&self, db: usize, key: &[u8]) -> i64 {
        let mut guard = self.databases[db].write();
        expire_if_due(&mut guard, key);
        match guard.map.get(key) {
            None => -2,
            Some(entry) => match entry.expires_at_ms {
                None => -1,
                Some(t) => (t - now_ms()).max(0),
            },
        }
    }

    pub fn incr(&self, db: usize, key: &[u8], raw: &[Vec<u8>]) -> Result<i64, String> {
        let version = self.next_version();
        let mut guard = self.databases[db].write();
        expire_if_due(&mut guard, key);
        let current = match guard.map.get(key) {
            None => 0i64,
            Some(entry) => {
                let bytes = entry.value.as_bytes().ok_or_else(|| "value is not a string".to_string())?;
                std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| "value is not an integer".to_string())?
            }
        };
        let next = current
            .checked_add(1)
            .ok_or_else(|| "increment would overflow".to_string())?;
        guard
            .map
            .insert(key.to_vec(), Entry::new(Value::Str(next.to_string().into_bytes()), version));
        drop(guard);
        self.record_write(raw);
        Ok(next)
    }

    pub fn vset(&self, db: usize, key: Vec<u8>, values: Vec<f32>, raw: &[Vec<u8>]) {
        let version = self.next_version();
        let mut guard = self.databases[db].write();
        guard.map.insert(key, Entry::new(Value::Vector(values), version));
        drop(guard);
        self.record_write(raw);
    }

    pub fn vget(&self, db: usize, key: &[u8]) -> Option<Vec<f32>> {
        let mut guard = self.databases[db].write();
        expire_if_due(&mut guard, key);
        guard.map.get(key).and_then(|e| e.value.as_vector()).map(|v| v.to_vec())
    }

    pub fn flushdb(&self, db: usize, raw: &[Vec<u8>]) {
        self.databases[db].write().map.clear();
        self.record_write(raw);
    }

    pub fn flushall(&self, raw: &[Vec<u8>]) {
        for db in &self.databases {
            db.write().map.clear();
        }
        self.record_write(raw);
    }

    /// A point-in-time copy of every non-expired key in `db`, for snapshotting
    /// and AOF rewrite. Lazily drops anything that expired along the way.
    pub fn snapshot_db(&self, db: usize) -> Vec<(Vec<u8>, Value, Option<i64>)> {
        let mut guard = self.databases[db].write();
        let now = now_ms();
        let expired: Vec<Vec<u8>> = guard
            .map
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in expired {
            guard.map.remove(&k);
        }
        guard
            .map
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone(), e.expires_at_ms))
            .collect()
    }

    pub fn info_text(&self) -> String {
        let mut total_keys = 0usize;
        for db in &self.databases {
            total_keys += db.read().map.len();
        }
        format!(
            "databases:{}\r\ntotal_keys:{}\r\nchanges_pending:{}\r\nloading:{}\r\n",
            self.databases.len(),
            total_keys,
            self.change_count.load(Ordering::Acquire),
            self.loading.load(Ordering::Acquire),
        )
    }

    pub fn shutdown(&self) {
        self.sweep_running.store(false, Ordering::Release);
    }

    fn ttl_sweep_loop(&self) {
        while self.sweep_running.load(Ordering::Acquire) {
            thread::sleep(TTL_SWEEP_INTERVAL);
            if !self.sweep_running.load(Ordering::Acquire) {
                break;
            }
            let now = now_ms();
            for db in &self.databases {
                let mut guard = db.write();
                guard.map.retain(|_, entry| !entry.is_expired(now));
            }
        }
    }

    // ---- synthetic composite-key extensions (base spec §3) ----

    pub fn meta_set(&self, db: usize, key: &[u8], field: &[u8], value: Vec<u8>, raw: &[Vec<u8>]) {
        let composite = meta_field_key(key, field);
        self.set(db, composite, value, raw);
    }

    pub fn meta_get(&self, db: usize, key: &[u8], field: &[u8]) -> Option<Vec<u8>> {
        self.get(db, &meta_field_key(key, field))
    }

    pub fn tag_add(&self, db: usize, key: &[u8], tag: &[u8], raw: &[Vec<u8>]) {
        let composite = meta_tags_key(key);
        let mut tags: Vec<Vec<u8>> = self
            .get(db, &composite)
            .map(|existing| existing.split(|&b| b == b',').map(|t| t.to_vec()).filter(|t| !t.is_empty()).collect())
            .unwrap_or_default();
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_vec());
        }
        let joined = tags.join(&b","[..]);
        self.set(db, composite, joined, raw);
    }

    pub fn hot_set(&self, db: usize, key: &[u8], score: i64, raw: &[Vec<u8>]) {
        let score_key = meta_field_key(key, b"hot_score");
        let hot_key = meta_field_key(key, b"hot");
        let hot_flag = if score >= HOT_THRESHOLD { b"1".to_vec() } else { b"0".to_vec() };
        self.set(db, score_key, score.to_string().into_bytes(), raw);
        self.set(db, hot_key, hot_flag, raw);
    }

    pub fn obj_set(&self, db: usize, key: &[u8], data: Vec<u8>, mime: Vec<u8>, raw: &[Vec<u8>]) {
        self.set(db, obj_data_key(key), data, raw);
        self.set(db, obj_mime_key(key), mime, raw);
    }

    pub fn obj_get(&self, db: usize, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let data = self.get(db, &obj_data_key(key))?;
        let mime = self.get(db, &obj_mime_key(key)).unwrap_or_default();
        Some((data, mime))
    }

    pub fn graph_add_edge(&self, db: usize, node: &[u8], relation: &[u8], target: &[u8], raw: &[Vec<u8>]) {
        let composite = graph_adj_key(node);
        let mut edges: Vec<u8> = self.get(db, &composite).unwrap_or_default();
        if !edges.is_empty() {
            edges.push(b',');
        }
        edges.extend_from_slice(relation);
        edges.push(b':');
        edges.extend_from_slice(target);
        self.set(db, composite, edges, raw);
    }

    pub fn graph_neighbors(&self, db: usize, node: &[u8]) -> Vec<Vec<u8>> {
        match self.get(db, &graph_adj_key(node)) {
            Some(edges) if !edges.is_empty() => edges.split(|&b| b == b',').map(|e| e.to_vec()).collect(),
            _ => Vec::new(),
        }
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        self.sweep_running.store(false, Ordering::Release);
    }
}

fn expire_if_due(db: &mut Database, key: &[u8]) {
    let now = now_ms();
    if matches!(db.map.get(key), Some(e) if e.is_expired(now)) {
        db.map.remove(key);
    }
}

fn meta_field_key(key: &[u8], field: &[u8]) -> Vec<u8> {
    [b"__meta:".as_slice(), key, b":", field].concat()
}

fn meta_tags_key(key: &[u8]) -> Vec<u8> {
    meta_field_key(key, b"tags")
}

fn obj_data_key(key: &[u8]) -> Vec<u8> {
    [b"__obj:".as_slice(), key, b":data"].concat()
}

fn obj_mime_key(key: &[u8]) -> Vec<u8> {
    [b"__obj:".as_slice(), key, b":mime"].concat()
}

fn graph_adj_key(node: &[u8]) -> Vec<u8> {
    [b"__graph:adj:".as_slice(), node].concat()
}

/// A small glob matcher supporting `*` and `?`, enough for `KEYS`/`SCAN`
/// patterns; not a full regex engine.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let store = DataStore::new(DEFAULT_DB_COUNT);
        store.set(0, b"foo".to_vec(), b"bar".to_vec(), &[]);
        assert_eq!(store.get(0, b"foo"), Some(b"bar".to_vec()));
    }

    #[test]
    fn expired_key_reads_as_absent() {
        let store = DataStore::new(DEFAULT_DB_COUNT);
        store.set(0, b"foo".to_vec(), b"bar".to_vec(), &[]);
        store.pexpire(0, b"foo", -1, &[]);
        assert_eq!(store.get(0, b"foo"), None);
        assert_eq!(store.pttl(0, b"foo"), -2);
    }

    #[test]
    fn pttl_reports_no_key_no_ttl_and_remaining() {
        let store = DataStore::new(DEFAULT_DB_COUNT);
        assert_eq!(store.pttl(0, b"missing"), -2);
        store.set(0, b"k".to_vec(), b"v".to_vec(), &[]);
        assert_eq!(store.pttl(0, b"k"), -1);
        store.pexpire(0, b"k", 60_000, &[]);
        let ttl = store.pttl(0, b"k");
        assert!(ttl > 0 && ttl <= 60_000);
    }

    #[test]
    fn incr_defaults_to_zero_and_rejects_non_integers() {
        let store = DataStore::new(DEFAULT_DB_COUNT);
        assert_eq!(store.incr(0, b"counter", &[]), Ok(1));
        assert_eq!(store.incr(0, b"counter", &[]), Ok(2));
        store.set(0, b"text".to_vec(), b"not-a-number".to_vec(), &[]);
        assert!(store.incr(0, b"text", &[]).is_err());
    }

    #[test]
    fn version_changes_on_write_and_on_expiry_driven_deletion() {
        let store = DataStore::new(DEFAULT_DB_COUNT);
        assert_eq!(store.get_version(0, b"k"), 0);
        store.set(0, b"k".to_vec(), b"v".to_vec(), &[]);
        let v1 = store.get_version(0, b"k");
        assert!(v1 > 0);
        store.pexpire(0, b"k", -1, &[]);
        assert_eq!(store.get_version(0, b"k"), 0);
    }

    #[test]
    fn apply_callback_fires_exactly_once_per_write_and_is_suppressed_while_loading() {
        let store = DataStore::new(DEFAULT_DB_COUNT);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        store.set_apply_callback(move |args| seen_cb.lock().push(args.to_vec()));

        store.set(0, b"a".to_vec(), b"1".to_vec(), &[b"SET".to_vec(), b"a".to_vec(), b"1".to_vec()]);
        assert_eq!(seen.lock().len(), 1);

        store.set_loading(true);
        store.set(0, b"b".to_vec(), b"2".to_vec(), &[b"SET".to_vec(), b"b".to_vec(), b"2".to_vec()]);
        assert_eq!(seen.lock().len(), 1);
        store.set_loading(false);

        store.set(0, b"c".to_vec(), b"3".to_vec(), &[b"SET".to_vec(), b"c".to_vec(), b"3".to_vec()]);
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn change_count_resets_to_zero_after_read() {
        let store = DataStore::new(DEFAULT_DB_COUNT);
        store.set(0, b"a".to_vec(), b"1".to_vec(), &[]);
        store.set(0, b"b".to_vec(), b"2".to_vec(), &[]);
        assert_eq!(store.get_and_reset_change_count(), 2);
        assert_eq!(store.get_and_reset_change_count(), 0);
    }

    #[test]
    fn keys_glob_matching_and_scan_limit() {
        let store = DataStore::new(DEFAULT_DB_COUNT);
        for k in ["task:1", "task:2", "job:1"] {
            store.set(0, k.as_bytes().to_vec(), b"x".to_vec(), &[]);
        }
        let mut matched = store.keys(0, b"task:*");
        matched.sort();
        assert_eq!(matched, vec![b"task:1".to_vec(), b"task:2".to_vec()]);
        assert_eq!(store.scan(0, b"*", 1).len(), 1);
    }

    #[test]
    fn rename_fails_when_source_missing() {
        let store = DataStore::new(DEFAULT_DB_COUNT);
        assert!(store.rename(0, b"nope", b"dst", &[]).is_err());
        store.set(0, b"src".to_vec(), b"v".to_vec(), &[]);
        assert!(store.rename(0, b"src", b"dst", &[]).is_ok());
        assert_eq!(store.get(0, b"dst"), Some(b"v".to_vec()));
        assert_eq!(store.get(0, b"src"), None);
    }

    #[test]
    fn synthetic_meta_tag_and_graph_keys_round_trip() {
        let store = DataStore::new(DEFAULT_DB_COUNT);
        store.meta_set(0, b"item", b"owner", b"alice".to_vec(), &[]);
        assert_eq!(store.meta_get(0, b"item", b"owner"), Some(b"alice".to_vec()));

        store.tag_add(0, b"item", b"urgent", &[]);
        store.tag_add(0, b"item", b"urgent", &[]);
        assert_eq!(store.meta_get(0, b"item", b"tags"), Some(b"urgent".to_vec()));

        store.graph_add_edge(0, b"a", b"knows", b"b", &[]);
        store.graph_add_edge(0, b"a", b"knows", b"c", &[]);
        assert_eq!(store.graph_neighbors(0, b"a"), vec![b"knows:b".to_vec(), b"knows:c".to_vec()]);
    }
}
