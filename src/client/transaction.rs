//! Client-side transaction over a `Server` endpoint.
//!
//! Writes are buffered locally and committed together as one sibling group.
//! Reads propagate causal requirements: observing a write at `ts` for some
//! key raises the required timestamp of every sibling of that write to at
//! least `ts`, so later reads of siblings never return versions older than
//! the group already observed.

use std::collections::HashMap;

use crate::server::{Key, Server, Timestamp, Val, Write};
use crate::utils::CbtxError;

use bytes::Bytes;

/// Buffers owned by an open transaction.
#[derive(Debug, Default)]
struct TxnState {
    /// Map from key -> buffered value (`None` for deletion).
    writes: HashMap<Key, Val>,

    /// Map from key -> minimum timestamp any read of it must observe.
    required: HashMap<Key, Timestamp>,
}

/// A transaction bound to a server endpoint and a timestamp. Once committed
/// or aborted its buffers are released and every further call returns
/// `CbtxError::TxnClosed`.
#[derive(Debug)]
pub struct Transaction<'s, S: ?Sized> {
    /// Coordinator endpoint.
    server: &'s S,

    /// Timestamp of this transaction, also its identifier.
    ts: Timestamp,

    /// `None` once closed.
    state: Option<TxnState>,
}

impl<'s, S> Transaction<'s, S>
where
    S: Server + ?Sized,
{
    /// Begins a new transaction at `ts`, which the caller's clock assigns.
    pub fn begin(server: &'s S, ts: Timestamp) -> Self {
        Transaction {
            server,
            ts,
            state: Some(TxnState::default()),
        }
    }

    /// Returns the timestamp of this transaction.
    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    /// Returns true if this transaction has been committed or aborted.
    pub fn is_closed(&self) -> bool {
        self.state.is_none()
    }

    /// Returns the current causal requirement for `key`.
    pub fn required(&self, key: &str) -> Timestamp {
        self.state
            .as_ref()
            .and_then(|state| state.required.get(key).copied())
            .unwrap_or(Timestamp::ZERO)
    }

    fn state_mut(&mut self) -> Result<&mut TxnState, CbtxError> {
        self.state.as_mut().ok_or(CbtxError::TxnClosed)
    }

    /// Buffers a write of `val` to `key`. No I/O.
    pub fn set(
        &mut self,
        key: impl Into<Key>,
        val: impl Into<Bytes>,
    ) -> Result<(), CbtxError> {
        self.state_mut()?.writes.insert(key.into(), Some(val.into()));
        Ok(())
    }

    /// Buffers a deletion of `key`. No I/O.
    pub fn del(&mut self, key: impl Into<Key>) -> Result<(), CbtxError> {
        self.state_mut()?.writes.insert(key.into(), None);
        Ok(())
    }

    /// Reads `key`. A value buffered by this transaction is returned without
    /// consulting the server. Otherwise the server is asked for a version
    /// satisfying the key's causal requirement, and the returned write's
    /// timestamp becomes the requirement floor of all its siblings. Returns
    /// `None` if no satisfying version exists or the key is deleted.
    pub async fn get(&mut self, key: &str) -> Result<Val, CbtxError> {
        let state = self.state.as_ref().ok_or(CbtxError::TxnClosed)?;
        if let Some(val) = state.writes.get(key) {
            return Ok(val.clone());
        }
        let ts_required = state
            .required
            .get(key)
            .copied()
            .unwrap_or(Timestamp::ZERO);

        let Some(w) = self.server.get(key, ts_required).await? else {
            return Ok(None);
        };

        let state = self.state_mut()?;
        for sib in &w.sibs {
            let required = state.required.entry(sib.clone()).or_default();
            if w.ts > *required {
                *required = w.ts;
            }
        }
        Ok(w.val)
    }

    /// Submits one write per buffered key, all carrying this transaction's
    /// timestamp and the identical list of buffered keys as siblings, then
    /// releases the transaction. On the first failure the error is returned
    /// and the transaction stays open; writes already submitted are not
    /// rolled back, and calling `commit()` again resubmits all of them,
    /// which the servers tolerate as duplicates.
    pub async fn commit(&mut self) -> Result<(), CbtxError> {
        let state = self.state.as_ref().ok_or(CbtxError::TxnClosed)?;
        let mut writes: Vec<(Key, Val)> = state
            .writes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        writes.sort_by(|a, b| a.0.cmp(&b.0));
        let sibs: Vec<Key> = writes.iter().map(|(k, _)| k.clone()).collect();

        for (key, val) in writes {
            self.server
                .set(Write::new(key, val, self.ts, sibs.clone()))
                .await?;
        }

        pf_trace!("committed txn {} of {} writes", self.ts, sibs.len());
        self.state = None;
        Ok(())
    }

    /// Discards all buffered writes without submitting anything. Always
    /// succeeds.
    pub fn abort(&mut self) -> Result<(), CbtxError> {
        self.state = None;
        Ok(())
    }
}

#[cfg(test)]
mod transaction_tests {
    use super::*;
    use crate::server::{LocalCluster, MemStore, ServerController, StaticPeer};
    use crate::server::{LocalNotifier, ServerStore};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Server serving a fixed map of writes and recording every call.
    #[derive(Debug, Default)]
    struct ScriptedServer {
        versions: HashMap<Key, Vec<Write>>,
        gets: StdMutex<Vec<(Key, Timestamp)>>,
        sets: StdMutex<Vec<Write>>,
        fail_set_on: Option<Key>,
    }

    impl ScriptedServer {
        fn with(writes: Vec<Write>) -> Self {
            let mut versions: HashMap<Key, Vec<Write>> = HashMap::new();
            for w in writes {
                versions.entry(w.key.clone()).or_default().push(w);
            }
            for vs in versions.values_mut() {
                vs.sort_by_key(|w| w.ts);
            }
            ScriptedServer {
                versions,
                ..Default::default()
            }
        }

        fn gets(&self) -> Vec<(Key, Timestamp)> {
            self.gets.lock().unwrap().clone()
        }

        fn sets(&self) -> Vec<Write> {
            self.sets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Server for ScriptedServer {
        async fn get(
            &self,
            key: &str,
            ts_required: Timestamp,
        ) -> Result<Option<Write>, CbtxError> {
            self.gets.lock().unwrap().push((key.into(), ts_required));
            Ok(self.versions.get(key).and_then(|vs| {
                vs.iter().find(|w| w.ts >= ts_required).cloned()
            }))
        }

        async fn set(&self, w: Write) -> Result<(), CbtxError> {
            if self.fail_set_on.as_ref() == Some(&w.key) {
                return Err(CbtxError::msg("server unavailable"));
            }
            self.sets.lock().unwrap().push(w);
            Ok(())
        }
    }

    fn write(key: &str, val: &str, clock: u64, sibs: &[&str]) -> Write {
        Write::new(
            key.into(),
            Some(Bytes::from(val.to_string())),
            Timestamp::new(clock, 1),
            sibs.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn read_your_writes() -> Result<(), CbtxError> {
        let server =
            ScriptedServer::with(vec![write("A", "stored", 1, &["A"])]);
        let mut txn = Transaction::begin(&server, Timestamp::new(2, 7));
        txn.set("A", "mine")?;
        txn.del("B")?;
        assert_eq!(txn.get("A").await?, Some(Bytes::from("mine")));
        assert_eq!(txn.get("B").await?, None);
        assert!(server.gets().is_empty());

        txn.del("A")?;
        assert_eq!(txn.get("A").await?, None);
        assert!(server.gets().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn causal_floor_propagates() -> Result<(), CbtxError> {
        let server = ScriptedServer::with(vec![
            write("A", "a5", 5, &["A", "B"]),
            write("B", "b2", 2, &["B"]),
            write("B", "b5", 5, &["A", "B"]),
            write("C", "c9", 9, &["C", "B"]),
        ]);
        let mut txn = Transaction::begin(&server, Timestamp::new(10, 7));
        assert_eq!(txn.required("B"), Timestamp::ZERO);

        assert_eq!(txn.get("A").await?, Some(Bytes::from("a5")));
        assert_eq!(txn.required("A"), Timestamp::new(5, 1));
        assert_eq!(txn.required("B"), Timestamp::new(5, 1));
        assert_eq!(txn.get("B").await?, Some(Bytes::from("b5")));

        // C's group raises B further, never lowered afterwards
        assert_eq!(txn.get("C").await?, Some(Bytes::from("c9")));
        assert_eq!(txn.required("B"), Timestamp::new(9, 1));
        assert_eq!(txn.get("A").await?, Some(Bytes::from("a5")));
        assert_eq!(txn.required("B"), Timestamp::new(9, 1));
        assert_eq!(txn.get("B").await?, None); // no B at >= 9 yet

        assert_eq!(
            server.gets(),
            vec![
                ("A".into(), Timestamp::ZERO),
                ("B".into(), Timestamp::new(5, 1)),
                ("C".into(), Timestamp::ZERO),
                ("A".into(), Timestamp::new(5, 1)),
                ("B".into(), Timestamp::new(9, 1)),
            ]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn commit_issues_sibling_group() -> Result<(), CbtxError> {
        let server = ScriptedServer::default();
        let ts = Timestamp::new(3, 7);
        let mut txn = Transaction::begin(&server, ts);
        assert_eq!(txn.ts(), ts);
        txn.set("B", "b")?;
        txn.set("A", "a")?;
        txn.del("C")?;
        txn.commit().await?;
        assert!(txn.is_closed());

        let sibs: Vec<Key> = vec!["A".into(), "B".into(), "C".into()];
        assert_eq!(
            server.sets(),
            vec![
                Write::new("A".into(), Some(Bytes::from("a")), ts, sibs.clone()),
                Write::new("B".into(), Some(Bytes::from("b")), ts, sibs.clone()),
                Write::new("C".into(), None, ts, sibs),
            ]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn closed_txn_fails() -> Result<(), CbtxError> {
        let server = ScriptedServer::default();
        let mut txn = Transaction::begin(&server, Timestamp::new(1, 1));
        txn.set("A", "a")?;
        txn.abort()?;
        assert!(txn.is_closed());
        assert_eq!(txn.set("A", "a"), Err(CbtxError::TxnClosed));
        assert_eq!(txn.del("A"), Err(CbtxError::TxnClosed));
        assert_eq!(txn.get("A").await, Err(CbtxError::TxnClosed));
        assert_eq!(txn.commit().await, Err(CbtxError::TxnClosed));
        assert_eq!(txn.required("A"), Timestamp::ZERO);
        assert!(txn.abort().is_ok());
        assert!(server.sets().is_empty());

        let mut txn = Transaction::begin(&server, Timestamp::new(2, 1));
        txn.commit().await?;
        assert_eq!(txn.get("A").await, Err(CbtxError::TxnClosed));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn failed_commit_stays_open() -> Result<(), CbtxError> {
        let mut server = ScriptedServer::default();
        server.fail_set_on = Some("B".into());
        let mut txn = Transaction::begin(&server, Timestamp::new(4, 2));
        txn.set("A", "a")?;
        txn.set("B", "b")?;
        assert!(txn.commit().await.is_err());
        assert!(!txn.is_closed());
        assert_eq!(server.sets().len(), 1); // A went through, not undone
        assert_eq!(txn.get("B").await?, Some(Bytes::from("b")));
        txn.abort()?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn sibling_scenario_single_replica() -> Result<(), CbtxError> {
        let notifier = LocalNotifier::new();
        let peer = StaticPeer::new("r0", vec!["r0".into()], notifier)?;
        let sc = ServerController::new("r0", MemStore::new(), peer, None)?;

        // an older standalone version of B, already stable
        let mut txn = Transaction::begin(&sc, Timestamp::new(2, 1));
        txn.set("B", "b2")?;
        txn.commit().await?;
        sc.receive_notify("r0", Timestamp::new(2, 1)).await?;

        let ts = Timestamp::new(5, 1);
        let mut txn = Transaction::begin(&sc, ts);
        txn.set("A", "a5")?;
        txn.set("B", "b5")?;
        txn.commit().await?;

        // pending only: unconditional reads miss it, ts-pinned reads see it
        assert_eq!(sc.get("A", Timestamp::ZERO).await?, None);
        assert_eq!(
            sc.get("A", ts).await?.map(|w| w.val),
            Some(Some(Bytes::from("a5")))
        );

        sc.receive_notify("r0", ts).await?;
        assert!(sc.store().good_find("A", Timestamp::ZERO).await?.is_some());

        // a fresh reader of A must then see B at ts 5, not b2
        let mut reader = Transaction::begin(&sc, Timestamp::new(6, 2));
        assert_eq!(reader.get("A").await?, Some(Bytes::from("a5")));
        assert_eq!(reader.get("B").await?, Some(Bytes::from("b5")));
        reader.abort()?;

        // whereas reading B alone starts from the oldest stable version
        let mut reader = Transaction::begin(&sc, Timestamp::new(7, 2));
        assert_eq!(reader.get("B").await?, Some(Bytes::from("b2")));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sibling_scenario_cluster() -> Result<(), CbtxError> {
        let cluster = LocalCluster::new(3, 64, None).await?;
        let old = Timestamp::new(2, 1);
        let writer = cluster.server(0);
        let mut txn = Transaction::begin(&writer, old);
        txn.set("B", "b2")?;
        txn.commit().await?;
        assert!(cluster.wait_stable(1, "B", old, 200).await?);

        // group {A, B} at ts 5 reaches replicas 0 and 2 in full, while
        // replica 1 so far only got A
        let ts = Timestamp::new(5, 1);
        let partial = cluster.server_to(0, vec![0, 2]);
        let mut txn = Transaction::begin(&partial, ts);
        txn.set("A", "a5")?;
        txn.set("B", "b5")?;
        txn.commit().await?;
        let sibs: Vec<Key> = vec!["A".into(), "B".into()];
        let late_a = Write::new("A".into(), Some("a5".into()), ts, sibs.clone());
        cluster.controller(1).set(late_a).await?;
        assert!(cluster.wait_stable(1, "A", ts, 200).await?);

        // having seen A at ts 5, B must not come back as b2
        let server = cluster.server(1);
        let mut reader = Transaction::begin(&server, Timestamp::new(6, 2));
        assert_eq!(reader.get("A").await?, Some(Bytes::from("a5")));
        assert_eq!(reader.required("B"), ts);
        assert_eq!(reader.get("B").await?, None);
        reader.abort()?;

        // once B arrives, the same read order yields the group's B
        let late_b = Write::new("B".into(), Some("b5".into()), ts, sibs);
        cluster.controller(1).set(late_b).await?;
        assert!(cluster.wait_stable(1, "B", ts, 200).await?);
        let mut reader = Transaction::begin(&server, Timestamp::new(7, 2));
        assert_eq!(reader.get("A").await?, Some(Bytes::from("a5")));
        assert_eq!(reader.get("B").await?, Some(Bytes::from("b5")));
        Ok(())
    }
}
