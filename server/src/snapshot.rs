/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! # MCDB snapshots
//!
//! `save_mcdb`/`load_mcdb` implement the binary layout fixed in
//! `SPEC_FULL.md` §2 (magic, version, per-db length-prefixed records, a
//! trailing CRC32 computed with the `crc` crate the way
//! `storage::checksum` does for the teacher's own journal format). The
//! scheduler below evaluates `save S C` conditions once a tick the way
//! `services::bgsave` evaluates its own `BGSave` config, but on a plain
//! condition list instead of a single interval since this spec supports
//! multiple Redis-style `save` lines.

use {
    crate::{
        error::{DbResult, Error},
        store::DataStore,
        value::Value,
    },
    crc::{Crc, CRC_32_ISO_HDLC},
    std::{
        fs::{self, File},
        io::{BufReader, BufWriter, Read, Write},
        path::Path,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    },
};

const MAGIC: &[u8; 4] = b"MCDB";
const VERSION: u8 = 1;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const VALMARK_STRING: u8 = 0;
const VALMARK_VECTOR: u8 = 1;

/// `(seconds, changes)` — mirrors a Redis-conf `save S C` line: trigger a
/// snapshot once `changes` writes have landed within `seconds` of the last
/// save.
#[derive(Debug, Clone, Copy)]
pub struct SaveCondition {
    pub seconds: u64,
    pub changes: u64,
}

pub fn save_mcdb(store: &DataStore, path: &Path) -> DbResult<()> {
    let tmp_path = path.with_extension("tmp");
    let mut body = Vec::new();
    body.extend_from_slice(MAGIC);
    body.push(VERSION);
    body.extend_from_slice(&(store.db_count() as u32).to_be_bytes());
    for db in 0..store.db_count() {
        let entries = store.snapshot_db(db);
        body.extend_from_slice(&(db as u32).to_be_bytes());
        body.extend_from_slice(&(entries.len() as u64).to_be_bytes());
        for (key, value, expires_at_ms) in entries {
            body.extend_from_slice(&(key.len() as u32).to_be_bytes());
            body.extend_from_slice(&key);
            match value {
                Value::Str(bytes) => {
                    body.push(VALMARK_STRING);
                    body.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                    body.extend_from_slice(&bytes);
                }
                Value::Vector(values) => {
                    body.push(VALMARK_VECTOR);
                    body.extend_from_slice(&(values.len() as u32).to_be_bytes());
                    for v in values {
                        body.extend_from_slice(&v.to_be_bytes());
                    }
                }
            }
            match expires_at_ms {
                Some(t) => {
                    body.push(1);
                    body.extend_from_slice(&t.to_be_bytes());
                }
                None => body.push(0),
            }
        }
    }
    let checksum = CRC32.checksum(&body);

    let file = File::create(&tmp_path)
        .map_err(|e| Error::ioerror_extra(e, format!("creating snapshot temp file '{}'", tmp_path.display())))?;
    let mut w = BufWriter::new(file);
    w.write_all(&body)
        .and_then(|_| w.write_all(&checksum.to_be_bytes()))
        .and_then(|_| w.flush())
        .map_err(|e| Error::ioerror_extra(e, "writing snapshot"))?;
    drop(w);
    fs::rename(&tmp_path, path)
        .map_err(|e| Error::ioerror_extra(e, format!("replacing snapshot at '{}'", path.display())))?;
    Ok(())
}

pub fn load_mcdb(store: &DataStore, path: &Path) -> DbResult<()> {
    let mut bytes = Vec::new();
    File::open(path)
        .map_err(|e| Error::ioerror_extra(e, format!("opening snapshot '{}'", path.display())))?
        .read_to_end(&mut bytes)
        .map_err(|e| Error::ioerror_extra(e, "reading snapshot"))?;
    if bytes.len() < 4 + 1 + 4 + 4 {
        return Err(Error::PersistenceFailed("snapshot file is too short".to_string()));
    }
    let (body, checksum_bytes) = bytes.split_at(bytes.len() - 4);
    let expected = u32::from_be_bytes(checksum_bytes.try_into().unwrap());
    if CRC32.checksum(body) != expected {
        return Err(Error::PersistenceFailed("snapshot checksum mismatch".to_string()));
    }

    let mut cursor = Cursor::new(body);
    if cursor.take(4)? != MAGIC.as_slice() {
        return Err(Error::PersistenceFailed("bad snapshot magic".to_string()));
    }
    let version = cursor.byte()?;
    if version != VERSION {
        return Err(Error::PersistenceFailed(format!("unsupported snapshot version {version}")));
    }
    let db_count = cursor.u32()? as usize;

    store.set_loading(true);
    let result = (|| -> DbResult<()> {
        for _ in 0..db_count {
            let db = cursor.u32()? as usize;
            let key_count = cursor.u64()?;
            if !store.valid_db(db) {
                return Err(Error::PersistenceFailed(format!("snapshot references out-of-range db {db}")));
            }
            for _ in 0..key_count {
                let klen = cursor.u32()? as usize;
                let key = cursor.take(klen)?.to_vec();
                let valmark = cursor.byte()?;
                match valmark {
                    VALMARK_STRING => {
                        let vlen = cursor.u32()? as usize;
                        let v = cursor.take(vlen)?.to_vec();
                        store.set(db, key.clone(), v, &[]);
                    }
                    VALMARK_VECTOR => {
                        let vcount = cursor.u32()? as usize;
                        let mut values = Vec::with_capacity(vcount);
                        for _ in 0..vcount {
                            values.push(f32::from_be_bytes(cursor.take(4)?.try_into().unwrap()));
                        }
                        store.vset(db, key.clone(), values, &[]);
                    }
                    other => return Err(Error::PersistenceFailed(format!("unknown value mark {other}"))),
                }
                let has_ttl = cursor.byte()?;
                if has_ttl == 1 {
                    let expiry = cursor.i64()?;
                    let remaining = (expiry - crate::store::now_ms()).max(0);
                    store.pexpire(db, &key, remaining, &[]);
                }
            }
        }
        Ok(())
    })();
    store.set_loading(false);
    result
}

/// A tiny big-endian cursor over an in-memory snapshot body; not a general
/// parser, just enough structure to keep `load_mcdb` from repeating bounds
/// checks by hand at every field.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
    fn take(&mut self, n: usize) -> DbResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::PersistenceFailed("snapshot truncated".to_string()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
    fn byte(&mut self) -> DbResult<u8> {
        Ok(self.take(1)?[0])
    }
    fn u32(&mut self) -> DbResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> DbResult<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> DbResult<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
}

/// Runs alongside the TTL sweep and resource-manager sweep threads. Tracks
/// one `last_save` instant per condition; each tick it reads and resets the
/// change counter and fires `save_mcdb` for the first condition whose
/// `(elapsed, accumulated_changes)` both clear their threshold, then resets
/// every condition's `last_save` together, matching a Redis `SAVE`'s effect
/// on all configured save points at once.
pub struct SnapshotScheduler {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SnapshotScheduler {
    pub fn start(store: Arc<DataStore>, path: std::path::PathBuf, conditions: Vec<SaveCondition>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        if conditions.is_empty() {
            return Self { running, handle: None };
        }
        let tick = if conditions.iter().any(|c| c.seconds == 0) {
            Duration::from_millis(100)
        } else {
            Duration::from_secs(1)
        };
        let thread_running = Arc::clone(&running);
        let handle = thread::spawn(move || {
            let mut last_save = vec![std::time::Instant::now(); conditions.len()];
            let mut accumulated = 0u64;
            while thread_running.load(Ordering::Acquire) {
                thread::sleep(tick);
                if !thread_running.load(Ordering::Acquire) {
                    break;
                }
                accumulated += store.get_and_reset_change_count();
                let now = std::time::Instant::now();
                for (i, cond) in conditions.iter().enumerate() {
                    if now.duration_since(last_save[i]).as_secs() >= cond.seconds && accumulated >= cond.changes {
                        match save_mcdb(&store, &path) {
                            Ok(()) => {
                                log::info!("snapshot scheduler: saved ({} changes, {}s elapsed)", accumulated, cond.seconds);
                                accumulated = 0;
                                for slot in last_save.iter_mut() {
                                    *slot = now;
                                }
                            }
                            Err(e) => log::error!("snapshot scheduler: save failed: {e}"),
                        }
                        break;
                    }
                }
            }
        });
        Self { running, handle: Some(handle) }
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DEFAULT_DB_COUNT;

    #[test]
    fn snapshot_round_trips_strings_vectors_and_ttl() {
        let dir = std::env::temp_dir().join(format!("taskstored-mcdb-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dump.mcdb");

        let store = DataStore::new(DEFAULT_DB_COUNT);
        store.set(0, b"a".to_vec(), b"1".to_vec(), &[]);
        store.pexpire(0, b"a", 60_000, &[]);
        store.vset(3, b"v".to_vec(), vec![1.5, -2.5], &[]);

        save_mcdb(&store, &path).unwrap();

        let restored = DataStore::new(DEFAULT_DB_COUNT);
        load_mcdb(&restored, &path).unwrap();
        assert_eq!(restored.get(0, b"a"), Some(b"1".to_vec()));
        assert!(restored.pttl(0, b"a") > 0);
        assert_eq!(restored.vget(3, b"v"), Some(vec![1.5, -2.5]));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn corrupted_snapshot_is_rejected_by_checksum() {
        let dir = std::env::temp_dir().join(format!("taskstored-mcdb-corrupt-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dump.mcdb");

        let store = DataStore::new(DEFAULT_DB_COUNT);
        store.set(0, b"a".to_vec(), b"1".to_vec(), &[]);
        save_mcdb(&store, &path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let restored = DataStore::new(DEFAULT_DB_COUNT);
        assert!(load_mcdb(&restored, &path).is_err());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn scheduler_saves_once_condition_is_met() {
        let dir = std::env::temp_dir().join(format!("taskstored-mcdb-sched-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("auto.mcdb");

        let store = DataStore::new(DEFAULT_DB_COUNT);
        let scheduler = SnapshotScheduler::start(Arc::clone(&store), path.clone(), vec![SaveCondition { seconds: 0, changes: 2 }]);
        store.set(0, b"a".to_vec(), b"1".to_vec(), &[]);
        store.set(0, b"b".to_vec(), b"2".to_vec(), &[]);
        thread::sleep(Duration::from_millis(300));
        scheduler.stop();

        assert!(path.exists());
        fs::remove_dir_all(&dir).ok();
    }
}
