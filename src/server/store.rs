//! Per-replica storage contract and the in-memory reference store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::server::{Addr, Key, Timestamp, Write};
use crate::utils::CbtxError;

use async_trait::async_trait;

use tokio::sync::Mutex;

/// Storage capability every replica's persistence backend must provide.
///
/// Two logical tables are maintained: the pending set of writes accepted
/// locally but not yet quorum-acknowledged, and the stable set of promoted
/// writes. Plus a per-timestamp record of which replicas acknowledged it.
/// Implementations own all mutable state and must synchronize internally;
/// backend errors are returned as-is and never retried here.
#[async_trait]
pub trait ServerStore: Send + Sync {
    /// Returns the stable write of `key` with the smallest timestamp that is
    /// still `>= ts_minimum`, or `None` if no stable write meets the floor.
    async fn good_find(
        &self,
        key: &str,
        ts_minimum: Timestamp,
    ) -> Result<Option<Write>, CbtxError>;

    /// Returns the pending write of `key` whose timestamp equals
    /// `ts_required` exactly, or `None`.
    async fn pending_get(
        &self,
        key: &str,
        ts_required: Timestamp,
    ) -> Result<Option<Write>, CbtxError>;

    /// Appends `w` to the pending set of `w.key`. Adding a write whose
    /// `(key, ts)` is already known is a tolerated no-op.
    async fn pending_add(&self, w: Write) -> Result<(), CbtxError>;

    /// Moves every pending write with timestamp `ts`, across all keys it
    /// touched, into the stable set. Idempotent.
    async fn pending_promote(&self, ts: Timestamp) -> Result<(), CbtxError>;

    /// Records an acknowledgment from replica `from` for `ts` and returns the
    /// number of distinct replicas that acknowledged `ts` so far.
    async fn acks_incr(
        &self,
        from: &str,
        ts: Timestamp,
    ) -> Result<usize, CbtxError>;
}

#[async_trait]
impl<S: ServerStore + ?Sized> ServerStore for Arc<S> {
    async fn good_find(
        &self,
        key: &str,
        ts_minimum: Timestamp,
    ) -> Result<Option<Write>, CbtxError> {
        (**self).good_find(key, ts_minimum).await
    }

    async fn pending_get(
        &self,
        key: &str,
        ts_required: Timestamp,
    ) -> Result<Option<Write>, CbtxError> {
        (**self).pending_get(key, ts_required).await
    }

    async fn pending_add(&self, w: Write) -> Result<(), CbtxError> {
        (**self).pending_add(w).await
    }

    async fn pending_promote(&self, ts: Timestamp) -> Result<(), CbtxError> {
        (**self).pending_promote(ts).await
    }

    async fn acks_incr(
        &self,
        from: &str,
        ts: Timestamp,
    ) -> Result<usize, CbtxError> {
        (**self).acks_incr(from, ts).await
    }
}

/// Inserts `w` into a version list kept sorted by timestamp, unless a write
/// with the same timestamp is already there. Returns true if inserted.
pub(crate) fn insert_sorted(versions: &mut Vec<Write>, w: Write) -> bool {
    match versions.binary_search_by_key(&w.ts, |v| v.ts) {
        Ok(_) => false,
        Err(idx) => {
            versions.insert(idx, w);
            true
        }
    }
}

/// Returns the oldest version in a ts-sorted list that is `>= ts_minimum`.
pub(crate) fn oldest_at_least(
    versions: &[Write],
    ts_minimum: Timestamp,
) -> Option<&Write> {
    let idx = versions.partition_point(|v| v.ts < ts_minimum);
    versions.get(idx)
}

/// Tables guarded together by `MemStore`'s lock.
#[derive(Debug, Default)]
struct MemTables {
    /// Map from key -> pending writes, in arrival order.
    pending: HashMap<Key, Vec<Write>>,

    /// Map from key -> stable writes, sorted by timestamp.
    stable: HashMap<Key, Vec<Write>>,

    /// Map from ts -> keys holding a pending write at that ts.
    pending_keys: HashMap<Timestamp, HashSet<Key>>,

    /// Map from ts -> set of replicas that acknowledged it. Entries are
    /// never removed: a notify replayed after promotion must still find its
    /// sender in the set to stay a no-op, so this grows with the number of
    /// timestamps seen.
    acks: HashMap<Timestamp, HashSet<Addr>>,
}

/// In-memory reference `ServerStore`, for deterministic testing and local
/// clusters. A single lock over all tables makes each operation, including
/// the ack count check and promotion for a timestamp, atomic.
#[derive(Debug, Default)]
pub struct MemStore {
    tables: Mutex<MemTables>,
}

impl MemStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stable version history of `key`, oldest first.
    pub async fn stable_history(&self, key: &str) -> Vec<Write> {
        let tables = self.tables.lock().await;
        tables.stable.get(key).cloned().unwrap_or_default()
    }

    /// Returns the number of pending writes currently held for `key`.
    pub async fn pending_count(&self, key: &str) -> usize {
        let tables = self.tables.lock().await;
        tables.pending.get(key).map_or(0, |ws| ws.len())
    }
}

#[async_trait]
impl ServerStore for MemStore {
    async fn good_find(
        &self,
        key: &str,
        ts_minimum: Timestamp,
    ) -> Result<Option<Write>, CbtxError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .stable
            .get(key)
            .and_then(|versions| oldest_at_least(versions, ts_minimum))
            .cloned())
    }

    async fn pending_get(
        &self,
        key: &str,
        ts_required: Timestamp,
    ) -> Result<Option<Write>, CbtxError> {
        let tables = self.tables.lock().await;
        Ok(tables.pending.get(key).and_then(|ws| {
            ws.iter().find(|w| w.ts == ts_required).cloned()
        }))
    }

    async fn pending_add(&self, w: Write) -> Result<(), CbtxError> {
        let mut tables = self.tables.lock().await;

        let already_stable = tables.stable.get(&w.key).is_some_and(|vs| {
            vs.binary_search_by_key(&w.ts, |v| v.ts).is_ok()
        });
        let already_pending = tables
            .pending
            .get(&w.key)
            .is_some_and(|ws| ws.iter().any(|p| p.ts == w.ts));
        if already_stable || already_pending {
            pf_trace!("duplicate pending_add {} @ {}", w.key, w.ts);
            return Ok(());
        }

        tables
            .pending_keys
            .entry(w.ts)
            .or_default()
            .insert(w.key.clone());
        tables.pending.entry(w.key.clone()).or_default().push(w);
        Ok(())
    }

    async fn pending_promote(&self, ts: Timestamp) -> Result<(), CbtxError> {
        let mut tables = self.tables.lock().await;
        let Some(keys) = tables.pending_keys.remove(&ts) else {
            return Ok(()); // nothing pending at ts, already promoted
        };

        for key in keys {
            let mut moved = Vec::new();
            if let Some(ws) = tables.pending.get_mut(&key) {
                let (hit, rest): (Vec<Write>, Vec<Write>) =
                    ws.drain(..).partition(|w| w.ts == ts);
                *ws = rest;
                moved = hit;
                if ws.is_empty() {
                    tables.pending.remove(&key);
                }
            }

            let versions = tables.stable.entry(key).or_default();
            for w in moved {
                insert_sorted(versions, w);
            }
        }

        pf_debug!("promoted writes @ {}", ts);
        Ok(())
    }

    async fn acks_incr(
        &self,
        from: &str,
        ts: Timestamp,
    ) -> Result<usize, CbtxError> {
        let mut tables = self.tables.lock().await;
        let acked = tables.acks.entry(ts).or_default();
        acked.insert(from.to_string());
        Ok(acked.len())
    }
}
