/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! Per-connection transaction state: `MULTI`/`EXEC`/`DISCARD` queuing and
//! optimistic `WATCH`. One [`TransactionContext`] lives inside each
//! connection's loop state; nothing here is shared across connections.

use std::collections::HashMap;

#[derive(Default)]
pub struct TransactionContext {
    in_multi: bool,
    queued: Vec<Vec<Vec<u8>>>,
    /// `(db, key) -> version captured at WATCH time`
    watched: HashMap<(usize, Vec<u8>), u64>,
}

impl TransactionContext {
    pub fn in_multi(&self) -> bool {
        self.in_multi
    }

    pub fn begin(&mut self) {
        self.in_multi = true;
        self.queued.clear();
    }

    pub fn queue(&mut self, raw: Vec<Vec<u8>>) {
        self.queued.push(raw);
    }

    /// Ends the transaction (whether by `EXEC` or `DISCARD`) and hands back
    /// whatever had been queued.
    pub fn take_queued(&mut self) -> Vec<Vec<Vec<u8>>> {
        self.in_multi = false;
        std::mem::take(&mut self.queued)
    }

    pub fn discard(&mut self) {
        self.in_multi = false;
        self.queued.clear();
        self.watched.clear();
    }

    pub fn watch(&mut self, db: usize, key: &[u8], version: u64) {
        self.watched.insert((db, key.to_vec()), version);
    }

    pub fn unwatch(&mut self) {
        self.watched.clear();
    }

    /// `true` iff every watched key still has the version captured at
    /// `WATCH` time — i.e. nothing written it (or expired it) since.
    pub fn watches_still_valid(&self, current: impl Fn(usize, &[u8]) -> u64) -> bool {
        self.watched
            .iter()
            .all(|(&(db, ref key), &captured)| current(db, key) == captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_and_discard_clears_state() {
        let mut ctx = TransactionContext::default();
        ctx.begin();
        ctx.queue(vec![b"SET".to_vec(), b"a".to_vec(), b"1".to_vec()]);
        assert!(ctx.in_multi());
        ctx.discard();
        assert!(!ctx.in_multi());
        assert!(ctx.take_queued().is_empty());
    }

    #[test]
    fn watch_detects_version_change() {
        let mut ctx = TransactionContext::default();
        ctx.watch(0, b"k", 1);
        assert!(ctx.watches_still_valid(|_, _| 1));
        assert!(!ctx.watches_still_valid(|_, _| 2));
    }

    #[test]
    fn exec_returns_queued_commands_in_order() {
        let mut ctx = TransactionContext::default();
        ctx.begin();
        ctx.queue(vec![b"SET".to_vec(), b"a".to_vec(), b"1".to_vec()]);
        ctx.queue(vec![b"SET".to_vec(), b"b".to_vec(), b"2".to_vec()]);
        let queued = ctx.take_queued();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0][1], b"a".to_vec());
        assert_eq!(queued[1][1], b"b".to_vec());
    }
}
