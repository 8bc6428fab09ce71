/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! # Append-only file
//!
//! One RESP array per successful write command, in commit order. `replay`
//! feeds a file back through the same parser + command dispatch used by live
//! connections, under `DataStore::loading`, so it can never re-log itself.
//! `rewrite` writes a minimal equivalent log reconstructed from live state
//! and atomically replaces the target, mirroring the
//! `diskstore::flush_data`/`fs::rename` two-step the teacher uses for `BGSAVE`.

use {
    crate::{
        command::{value_to_write_command, CommandHandler, ConnectionState},
        error::{DbResult, Error},
        resp,
        store::DataStore,
    },
    parking_lot::Mutex,
    std::{
        fs::{self, File, OpenOptions},
        io::{BufWriter, Read, Write},
        path::{Path, PathBuf},
        sync::Arc,
    },
};

const REPLAY_CHUNK: usize = 8 * 1024;

pub struct AofWriter {
    file: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl AofWriter {
    pub fn open(path: impl Into<PathBuf>) -> DbResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::ioerror_extra(e, format!("opening AOF file '{}'", path.display())))?;
        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one RESP array and flushes immediately. Crash between this
    /// write and the OS's own fsync may still lose the write; this workspace
    /// does not implement an `appendfsync always` policy.
    pub fn append(&self, raw: &[Vec<u8>]) -> DbResult<()> {
        let mut guard = self.file.lock();
        write_command(&mut *guard, raw).map_err(|e| Error::ioerror_extra(e, "appending to AOF"))?;
        guard.flush().map_err(|e| Error::ioerror_extra(e, "flushing AOF"))
    }
}

fn write_command<W: Write>(w: &mut W, raw: &[Vec<u8>]) -> std::io::Result<()> {
    write!(w, "*{}\r\n", raw.len())?;
    for arg in raw {
        write!(w, "${}\r\n", arg.len())?;
        w.write_all(arg)?;
        w.write_all(b"\r\n")?;
    }
    Ok(())
}

/// Replays `path` into `store` through `handler`, exactly as a live
/// connection would apply the same commands, with the apply-callback
/// suppressed throughout. Returns `true` if the file existed and parsing
/// reached EOF without a hard failure; an incomplete final command is
/// silently ignored, and a blanket parse failure still leaves whatever had
/// already been applied visible, per the base spec's preserved behavior.
pub fn replay(path: &Path, store: &Arc<DataStore>, handler: &CommandHandler) -> bool {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    store.set_loading(true);
    let mut conn = ConnectionState::new(false);
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; REPLAY_CHUNK];
    let mut reached_eof = true;
    'outer: loop {
        loop {
            match resp::try_parse_command(&mut buf) {
                Ok(Some(args)) => {
                    handler.dispatch(&args, &mut conn);
                }
                Ok(None) => break,
                Err(()) => {
                    reached_eof = false;
                    break 'outer;
                }
            }
        }
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => {
                reached_eof = false;
                break;
            }
        }
    }
    store.set_loading(false);
    reached_eof
}

/// Reconstructs a minimal AOF from live state: `SELECT i` then one write
/// command per non-expired key, for every database, preserving the caller's
/// current DB selection in the live store's connection-free sense (there is
/// none to preserve here — this just writes a log a fresh replay will load
/// correctly). Suppresses the apply-callback for the duration, same as a
/// real replay, and replaces the target file atomically.
pub fn rewrite(store: &Arc<DataStore>, out_path: &Path) -> DbResult<()> {
    store.set_loading(true);
    let result = rewrite_inner(store, out_path);
    store.set_loading(false);
    result
}

fn rewrite_inner(store: &Arc<DataStore>, out_path: &Path) -> DbResult<()> {
    let tmp_path = out_path.with_extension("rewrite.tmp");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| Error::ioerror_extra(e, format!("opening AOF rewrite temp file '{}'", tmp_path.display())))?;
    let mut w = BufWriter::new(file);
    for db in 0..store.db_count() {
        let entries = store.snapshot_db(db);
        if entries.is_empty() {
            continue;
        }
        write_command(&mut w, &[b"SELECT".to_vec(), db.to_string().into_bytes()])
            .map_err(|e| Error::ioerror_extra(e, "writing AOF rewrite"))?;
        for (key, value, expires_at_ms) in entries {
            let cmd = value_to_write_command(&key, &value);
            write_command(&mut w, &cmd).map_err(|e| Error::ioerror_extra(e, "writing AOF rewrite"))?;
            if let Some(expiry) = expires_at_ms {
                let remaining = (expiry - crate::store::now_ms()).max(0);
                let pexpire = vec![b"PEXPIRE".to_vec(), key.clone(), remaining.to_string().into_bytes()];
                write_command(&mut w, &pexpire).map_err(|e| Error::ioerror_extra(e, "writing AOF rewrite"))?;
            }
        }
    }
    w.flush().map_err(|e| Error::ioerror_extra(e, "flushing AOF rewrite"))?;
    drop(w);
    fs::rename(&tmp_path, out_path)
        .map_err(|e| Error::ioerror_extra(e, format!("replacing AOF at '{}'", out_path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DEFAULT_DB_COUNT;

    #[test]
    fn append_then_replay_restores_state() {
        let dir = std::env::temp_dir().join(format!("taskstored-aof-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let aof_path = dir.join("appendonly.aof");

        let store = DataStore::new(DEFAULT_DB_COUNT);
        let handler = CommandHandler::new(Arc::clone(&store), None);
        let writer = AofWriter::open(&aof_path).unwrap();
        {
            let writer = Arc::new(writer);
            let w = Arc::clone(&writer);
            store.set_apply_callback(move |raw| {
                let _ = w.append(raw);
            });
            let mut conn = ConnectionState::new(false);
            handler.dispatch(&bulk(&["SELECT", "2"]), &mut conn);
            handler.dispatch(&bulk(&["SET", "foo", "bar"]), &mut conn);
            handler.dispatch(&bulk(&["PEXPIRE", "foo", "60000"]), &mut conn);
            handler.dispatch(&bulk(&["SET", "baz", "qux"]), &mut conn);
            handler.dispatch(&bulk(&["DEL", "baz"]), &mut conn);
        }

        let restored = DataStore::new(DEFAULT_DB_COUNT);
        let restored_handler = CommandHandler::new(Arc::clone(&restored), None);
        assert!(replay(&aof_path, &restored, &restored_handler));
        assert_eq!(restored.get(2, b"foo"), Some(b"bar".to_vec()));
        let ttl = restored.pttl(2, b"foo");
        assert!(ttl > 0 && ttl <= 60_000);
        assert_eq!(restored.get(2, b"baz"), None);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rewrite_then_replay_round_trips_live_state() {
        let dir = std::env::temp_dir().join(format!("taskstored-aof-rewrite-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let aof_path = dir.join("rewritten.aof");

        let store = DataStore::new(DEFAULT_DB_COUNT);
        store.set(1, b"k1".to_vec(), b"v1".to_vec(), &[]);
        store.set(1, b"k2".to_vec(), b"v2".to_vec(), &[]);
        store.vset(1, b"vec".to_vec(), vec![1.0, 2.0], &[]);

        rewrite(&store, &aof_path).unwrap();

        let restored = DataStore::new(DEFAULT_DB_COUNT);
        let handler = CommandHandler::new(Arc::clone(&restored), None);
        assert!(replay(&aof_path, &restored, &handler));
        assert_eq!(restored.get(1, b"k1"), Some(b"v1".to_vec()));
        assert_eq!(restored.get(1, b"k2"), Some(b"v2".to_vec()));
        assert_eq!(restored.vget(1, b"vec"), Some(vec![1.0, 2.0]));

        fs::remove_dir_all(&dir).ok();
    }

    fn bulk(args: &[&str]) -> Vec<Vec<u8>> {
        args.iter().map(|s| s.as_bytes().to_vec()).collect()
    }
}
