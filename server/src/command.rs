/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! # Command dispatch
//!
//! Table-driven RESP command handling. A [`CommandHandler`] owns the
//! [`DataStore`] plus the paths it needs for `SAVE`/`BGREWRITEAOF`, and is
//! shared (via `Arc`) across every connection. Per-connection state —
//! current DB, transaction/watch bookkeeping, auth status — lives in
//! [`ConnectionState`], one per socket.

use {
    crate::{
        aof, resp::Reply, snapshot, store::DataStore, txn::TransactionContext, value::Value,
    },
    parking_lot::Mutex,
    std::{path::PathBuf, sync::Arc},
};

pub struct ConnectionState {
    pub current_db: usize,
    pub txn: TransactionContext,
    pub authenticated: bool,
}

impl ConnectionState {
    pub fn new(requires_auth: bool) -> Self {
        Self {
            current_db: 0,
            txn: TransactionContext::default(),
            authenticated: !requires_auth,
        }
    }
}

pub struct CommandHandler {
    store: Arc<DataStore>,
    requirepass: Option<String>,
    snapshot_path: Mutex<Option<PathBuf>>,
    aof_path: Mutex<Option<PathBuf>>,
}

impl CommandHandler {
    pub fn new(store: Arc<DataStore>, requirepass: Option<String>) -> Self {
        Self {
            store,
            requirepass,
            snapshot_path: Mutex::new(None),
            aof_path: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn set_snapshot_path(&self, path: PathBuf) {
        *self.snapshot_path.lock() = Some(path);
    }

    pub fn set_aof_path(&self, path: PathBuf) {
        *self.aof_path.lock() = Some(path);
    }

    pub fn requires_auth(&self) -> bool {
        self.requirepass.is_some()
    }

    /// Dispatches exactly one already-framed command. Never panics on bad
    /// input — every failure becomes a RESP error reply, per the base spec's
    /// propagation policy (command handlers never leak unchecked failures to
    /// the socket layer).
    pub fn dispatch(&self, raw: &[Vec<u8>], conn: &mut ConnectionState) -> Reply {
        let Some(name) = raw.first() else {
            return Reply::Error("empty command".to_string());
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();

        if name == "AUTH" {
            return self.cmd_auth(raw, conn);
        }
        if self.requires_auth() && !conn.authenticated {
            return Reply::Error("NOAUTH Authentication required.".to_string());
        }

        // queue writes while inside MULTI, except for the transaction control
        // commands themselves
        if conn.txn.in_multi() && !matches!(name.as_str(), "EXEC" | "DISCARD" | "MULTI" | "WATCH") {
            conn.txn.queue(raw.to_vec());
            return Reply::Simple("QUEUED".to_string());
        }

        match name.as_str() {
            "PING" => Reply::Simple("PONG".to_string()),
            "SELECT" => self.cmd_select(raw, conn),
            "SET" => self.cmd_set(raw, conn),
            "GET" => self.cmd_get(raw, conn),
            "DEL" => self.cmd_del(raw, conn),
            "EXISTS" => self.cmd_exists(raw, conn),
            "KEYS" => self.cmd_keys(raw, conn),
            "SCAN" => self.cmd_scan(raw, conn),
            "RENAME" => self.cmd_rename(raw, conn),
            "PEXPIRE" => self.cmd_pexpire(raw, conn),
            "PTTL" => self.cmd_pttl(raw, conn),
            "INCR" => self.cmd_incr(raw, conn),
            "VSET" | "SETNX" => self.cmd_vset(raw, conn),
            "VGET" | "GETNX" => self.cmd_vget(raw, conn),
            "FLUSHDB" => self.cmd_flushdb(raw, conn),
            "FLUSHALL" => self.cmd_flushall(raw),
            "MULTI" => self.cmd_multi(conn),
            "EXEC" => self.cmd_exec(conn),
            "DISCARD" => self.cmd_discard(conn),
            "WATCH" => self.cmd_watch(raw, conn),
            "UNWATCH" => self.cmd_unwatch(conn),
            "INFO" => Reply::bulk(self.store.info_text()),
            "SAVE" => self.cmd_save(),
            "BGREWRITEAOF" => self.cmd_bgrewriteaof(raw),
            "METASET" => self.cmd_metaset(raw, conn),
            "METAGET" => self.cmd_metaget(raw, conn),
            "TAGADD" => self.cmd_tagadd(raw, conn),
            "HOTSET" => self.cmd_hotset(raw, conn),
            "OBJSET" => self.cmd_objset(raw, conn),
            "OBJGET" => self.cmd_objget(raw, conn),
            "GRAPH.ADDEDGE" => self.cmd_graph_addedge(raw, conn),
            "GRAPH.NEIGHBORS" => self.cmd_graph_neighbors(raw, conn),
            _ => Reply::Error(format!("unknown command '{name}'")),
        }
    }

    fn cmd_auth(&self, raw: &[Vec<u8>], conn: &mut ConnectionState) -> Reply {
        let Some(expected) = &self.requirepass else {
            return Reply::Error("Client sent AUTH, but no password is set.".to_string());
        };
        match raw.get(1) {
            Some(given) if given.as_slice() == expected.as_bytes() => {
                conn.authenticated = true;
                Reply::Ok
            }
            _ => Reply::Error("invalid password".to_string()),
        }
    }

    fn cmd_select(&self, raw: &[Vec<u8>], conn: &mut ConnectionState) -> Reply {
        match parse_usize(raw.get(1)) {
            Some(idx) if self.store.valid_db(idx) => {
                conn.current_db = idx;
                Reply::Ok
            }
            _ => Reply::Error("DB index is out of range".to_string()),
        }
    }

    fn cmd_set(&self, raw: &[Vec<u8>], conn: &mut ConnectionState) -> Reply {
        match (raw.get(1), raw.get(2)) {
            (Some(k), Some(v)) => {
                let _guard = self.store.begin_write();
                self.store.set(conn.current_db, k.clone(), v.clone(), raw);
                Reply::Ok
            }
            _ => Reply::Error("wrong number of arguments for 'SET'".to_string()),
        }
    }

    fn cmd_get(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match raw.get(1) {
            Some(k) => match self.store.get(conn.current_db, k) {
                Some(v) => Reply::bulk(v),
                None => Reply::Nil,
            },
            None => Reply::Error("wrong number of arguments for 'GET'".to_string()),
        }
    }

    fn cmd_del(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        if raw.len() < 2 {
            return Reply::Error("wrong number of arguments for 'DEL'".to_string());
        }
        let _guard = self.store.begin_write();
        Reply::Integer(self.store.del(conn.current_db, &raw[1..], raw) as i64)
    }

    fn cmd_exists(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        if raw.len() < 2 {
            return Reply::Error("wrong number of arguments for 'EXISTS'".to_string());
        }
        Reply::Integer(self.store.exists(conn.current_db, &raw[1..]) as i64)
    }

    fn cmd_keys(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        let pattern = raw.get(1).map(|p| p.as_slice()).unwrap_or(b"*");
        Reply::array_of_bulks(self.store.keys(conn.current_db, pattern))
    }

    fn cmd_scan(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        let pattern = raw.get(1).map(|p| p.as_slice()).unwrap_or(b"*");
        let count = raw.get(2).and_then(|c| parse_usize(Some(c))).unwrap_or(10);
        Reply::array_of_bulks(self.store.scan(conn.current_db, pattern, count))
    }

    fn cmd_rename(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match (raw.get(1), raw.get(2)) {
            (Some(src), Some(dst)) => {
                let _guard = self.store.begin_write();
                match self.store.rename(conn.current_db, src, dst, raw) {
                    Ok(()) => Reply::Ok,
                    Err(()) => Reply::Error("no such key".to_string()),
                }
            }
            _ => Reply::Error("wrong number of arguments for 'RENAME'".to_string()),
        }
    }

    fn cmd_pexpire(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match (raw.get(1), raw.get(2).and_then(|v| parse_i64(v))) {
            (Some(k), Some(ms)) => {
                let _guard = self.store.begin_write();
                Reply::Integer(self.store.pexpire(conn.current_db, k, ms, raw))
            }
            _ => Reply::Error("wrong number of arguments for 'PEXPIRE'".to_string()),
        }
    }

    fn cmd_pttl(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match raw.get(1) {
            Some(k) => Reply::Integer(self.store.pttl(conn.current_db, k)),
            None => Reply::Error("wrong number of arguments for 'PTTL'".to_string()),
        }
    }

    fn cmd_incr(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match raw.get(1) {
            Some(k) => {
                let _guard = self.store.begin_write();
                match self.store.incr(conn.current_db, k, raw) {
                    Ok(v) => Reply::Integer(v),
                    Err(msg) => Reply::Error(msg),
                }
            }
            None => Reply::Error("wrong number of arguments for 'INCR'".to_string()),
        }
    }

    fn cmd_vset(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        let Some(key) = raw.get(1) else {
            return Reply::Error("wrong number of arguments for 'VSET'".to_string());
        };
        if raw.len() < 3 {
            return Reply::Error("wrong number of arguments for 'VSET'".to_string());
        }
        let mut values = Vec::with_capacity(raw.len() - 2);
        for field in &raw[2..] {
            match std::str::from_utf8(field).ok().and_then(|s| s.parse::<f32>().ok()) {
                Some(v) => values.push(v),
                None => return Reply::Error("not a valid float".to_string()),
            }
        }
        let _guard = self.store.begin_write();
        self.store.vset(conn.current_db, key.clone(), values, raw);
        Reply::Ok
    }

    fn cmd_vget(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match raw.get(1) {
            Some(k) => match self.store.vget(conn.current_db, k) {
                Some(values) => Reply::array_of_bulks(values.iter().map(|v| v.to_string().into_bytes())),
                None => Reply::Nil,
            },
            None => Reply::Error("wrong number of arguments for 'VGET'".to_string()),
        }
    }

    fn cmd_flushdb(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        let _guard = self.store.begin_write();
        self.store.flushdb(conn.current_db, raw);
        Reply::Ok
    }

    fn cmd_flushall(&self, raw: &[Vec<u8>]) -> Reply {
        let _guard = self.store.begin_write();
        self.store.flushall(raw);
        Reply::Ok
    }

    fn cmd_multi(&self, conn: &mut ConnectionState) -> Reply {
        conn.txn.begin();
        Reply::Ok
    }

    /// Applies the queue as one batch under the transaction gate so no
    /// standalone write lands between two of its commands. Fails without
    /// applying anything if any watched key changed since `WATCH`.
    fn cmd_exec(&self, conn: &mut ConnectionState) -> Reply {
        if !conn.txn.in_multi() {
            return Reply::Error("EXEC without MULTI".to_string());
        }
        let valid = conn
            .txn
            .watches_still_valid(|db, key| self.store.get_version(db, key));
        let queued = conn.txn.take_queued();
        conn.txn.unwatch();
        if !valid {
            return Reply::Error("EXEC aborted, watched key was modified".to_string());
        }
        // `take_queued` already cleared `in_multi`, so each of these runs as
        // an ordinary command rather than being re-queued.
        let _gate = self.store.begin_transaction();
        let replies = queued.iter().map(|cmd| self.dispatch(cmd, conn)).collect();
        Reply::Array(replies)
    }

    fn cmd_discard(&self, conn: &mut ConnectionState) -> Reply {
        if !conn.txn.in_multi() {
            return Reply::Error("DISCARD without MULTI".to_string());
        }
        conn.txn.discard();
        Reply::Ok
    }

    fn cmd_watch(&self, raw: &[Vec<u8>], conn: &mut ConnectionState) -> Reply {
        if raw.len() < 2 {
            return Reply::Error("wrong number of arguments for 'WATCH'".to_string());
        }
        for key in &raw[1..] {
            let version = self.store.get_version(conn.current_db, key);
            conn.txn.watch(conn.current_db, key, version);
        }
        Reply::Ok
    }

    fn cmd_unwatch(&self, conn: &mut ConnectionState) -> Reply {
        conn.txn.unwatch();
        Reply::Ok
    }

    fn cmd_save(&self) -> Reply {
        let Some(path) = self.snapshot_path.lock().clone() else {
            return Reply::Error("no snapshot path configured".to_string());
        };
        match snapshot::save_mcdb(&self.store, &path) {
            Ok(()) => Reply::Ok,
            Err(e) => Reply::Error(e.to_string()),
        }
    }

    fn cmd_bgrewriteaof(&self, raw: &[Vec<u8>]) -> Reply {
        let path = match raw.get(1) {
            Some(p) => PathBuf::from(String::from_utf8_lossy(p).to_string()),
            None => match self.aof_path.lock().clone() {
                Some(p) => p,
                None => return Reply::Error("no AOF path configured".to_string()),
            },
        };
        match aof::rewrite(&self.store, &path) {
            Ok(()) => Reply::Ok,
            Err(e) => Reply::Error(e.to_string()),
        }
    }

    fn cmd_metaset(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match (raw.get(1), raw.get(2), raw.get(3)) {
            (Some(k), Some(field), Some(value)) => {
                let _guard = self.store.begin_write();
                self.store.meta_set(conn.current_db, k, field, value.clone(), raw);
                Reply::Ok
            }
            _ => Reply::Error("wrong number of arguments for 'METASET'".to_string()),
        }
    }

    fn cmd_metaget(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match (raw.get(1), raw.get(2)) {
            (Some(k), Some(field)) => match self.store.meta_get(conn.current_db, k, field) {
                Some(v) => Reply::bulk(v),
                None => Reply::Nil,
            },
            _ => Reply::Error("wrong number of arguments for 'METAGET'".to_string()),
        }
    }

    fn cmd_tagadd(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match (raw.get(1), raw.get(2)) {
            (Some(k), Some(tag)) => {
                let _guard = self.store.begin_write();
                self.store.tag_add(conn.current_db, k, tag, raw);
                Reply::Ok
            }
            _ => Reply::Error("wrong number of arguments for 'TAGADD'".to_string()),
        }
    }

    fn cmd_hotset(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match (raw.get(1), raw.get(2).and_then(|v| parse_i64(v))) {
            (Some(k), Some(score)) => {
                let _guard = self.store.begin_write();
                self.store.hot_set(conn.current_db, k, score, raw);
                Reply::Ok
            }
            _ => Reply::Error("wrong number of arguments for 'HOTSET'".to_string()),
        }
    }

    fn cmd_objset(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match (raw.get(1), raw.get(2), raw.get(3)) {
            (Some(k), Some(data), Some(mime)) => {
                let _guard = self.store.begin_write();
                self.store.obj_set(conn.current_db, k, data.clone(), mime.clone(), raw);
                Reply::Ok
            }
            _ => Reply::Error("wrong number of arguments for 'OBJSET'".to_string()),
        }
    }

    fn cmd_objget(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match raw.get(1) {
            Some(k) => match self.store.obj_get(conn.current_db, k) {
                Some((data, mime)) => Reply::array_of_bulks(vec![data, mime]),
                None => Reply::Nil,
            },
            None => Reply::Error("wrong number of arguments for 'OBJGET'".to_string()),
        }
    }

    fn cmd_graph_addedge(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match (raw.get(1), raw.get(2), raw.get(3)) {
            (Some(node), Some(relation), Some(target)) => {
                let _guard = self.store.begin_write();
                self.store.graph_add_edge(conn.current_db, node, relation, target, raw);
                Reply::Ok
            }
            _ => Reply::Error("wrong number of arguments for 'GRAPH.ADDEDGE'".to_string()),
        }
    }

    fn cmd_graph_neighbors(&self, raw: &[Vec<u8>], conn: &ConnectionState) -> Reply {
        match raw.get(1) {
            Some(node) => Reply::array_of_bulks(self.store.graph_neighbors(conn.current_db, node)),
            None => Reply::Error("wrong number of arguments for 'GRAPH.NEIGHBORS'".to_string()),
        }
    }
}

/// Renders a live value back into the RESP `SET`/`VSET` command that would
/// reconstruct it, for `BGREWRITEAOF`.
pub(crate) fn value_to_write_command(key: &[u8], value: &Value) -> Vec<Vec<u8>> {
    match value {
        Value::Str(bytes) => vec![b"SET".to_vec(), key.to_vec(), bytes.clone()],
        Value::Vector(values) => {
            let mut cmd = vec![b"VSET".to_vec(), key.to_vec()];
            cmd.extend(values.iter().map(|v| v.to_string().into_bytes()));
            cmd
        }
    }
}

fn parse_usize(arg: Option<&Vec<u8>>) -> Option<usize> {
    arg.and_then(|a| std::str::from_utf8(a).ok()).and_then(|s| s.parse().ok())
}

fn parse_i64(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DEFAULT_DB_COUNT;

    fn handler() -> CommandHandler {
        CommandHandler::new(DataStore::new(DEFAULT_DB_COUNT), None)
    }

    fn run(h: &CommandHandler, conn: &mut ConnectionState, args: &[&str]) -> Reply {
        h.dispatch(&args.iter().map(|s| s.as_bytes().to_vec()).collect::<Vec<_>>(), conn)
    }

    #[test]
    fn set_then_get() {
        let h = handler();
        let mut conn = ConnectionState::new(false);
        assert!(matches!(run(&h, &mut conn, &["SET", "a", "1"]), Reply::Ok));
        match run(&h, &mut conn, &["GET", "a"]) {
            Reply::Bulk(v) => assert_eq!(v, b"1"),
            _ => panic!("expected bulk reply"),
        }
    }

    #[test]
    fn unauthenticated_connection_is_rejected_until_auth() {
        let h = CommandHandler::new(DataStore::new(DEFAULT_DB_COUNT), Some("secret".to_string()));
        let mut conn = ConnectionState::new(h.requires_auth());
        assert!(matches!(run(&h, &mut conn, &["GET", "a"]), Reply::Error(_)));
        assert!(matches!(run(&h, &mut conn, &["AUTH", "secret"]), Reply::Ok));
        assert!(matches!(run(&h, &mut conn, &["GET", "a"]), Reply::Nil));
    }

    #[test]
    fn multi_exec_applies_queued_writes_atomically() {
        let h = handler();
        let mut conn = ConnectionState::new(false);
        assert!(matches!(run(&h, &mut conn, &["MULTI"]), Reply::Ok));
        assert!(matches!(run(&h, &mut conn, &["SET", "k", "v1"]), Reply::Simple(_)));
        assert!(matches!(run(&h, &mut conn, &["SET", "k2", "v2"]), Reply::Simple(_)));
        match run(&h, &mut conn, &["EXEC"]) {
            Reply::Array(replies) => assert_eq!(replies.len(), 2),
            _ => panic!("expected array reply"),
        }
        assert_eq!(h.store().get(0, b"k"), Some(b"v1".to_vec()));
    }

    #[test]
    fn watch_abort_on_concurrent_write() {
        let h = handler();
        let mut c1 = ConnectionState::new(false);
        let mut c2 = ConnectionState::new(false);
        run(&h, &mut c1, &["SET", "k", "v0"]);
        run(&h, &mut c1, &["WATCH", "k"]);
        run(&h, &mut c1, &["MULTI"]);
        run(&h, &mut c1, &["SET", "k", "v1"]);
        run(&h, &mut c2, &["SET", "k", "v2"]);
        assert!(matches!(run(&h, &mut c1, &["EXEC"]), Reply::Error(_)));
        assert_eq!(h.store().get(0, b"k"), Some(b"v2".to_vec()));
    }

    #[test]
    fn vset_vget_round_trip() {
        let h = handler();
        let mut conn = ConnectionState::new(false);
        run(&h, &mut conn, &["VSET", "embedding", "1.0", "2.5", "-3.0"]);
        match run(&h, &mut conn, &["VGET", "embedding"]) {
            Reply::Array(items) => assert_eq!(items.len(), 3),
            _ => panic!("expected array reply"),
        }
    }
}
