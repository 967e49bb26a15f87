//! Replica topology, quorum policy, and notify-sending contract.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::server::{Addr, Timestamp};
use crate::utils::CbtxError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::sync::{mpsc, Mutex};

/// Notification sent from one replica to another: "I have a pending write
/// for `ts`, please count my ack".
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct NotifyMsg {
    /// Address of the sending replica.
    pub from: Addr,

    /// Timestamp of the pending write.
    pub ts: Timestamp,
}

/// Topology and transport capabilities a replica's controller drives.
#[async_trait]
pub trait ServerPeer: Send + Sync {
    /// Returns the replica addresses responsible for `key`. Successive calls
    /// within one fan-out are treated as a consistent snapshot.
    fn replicas_for(&self, key: &str) -> Vec<Addr>;

    /// Returns the number of distinct acks required before writes at `ts`
    /// can be promoted.
    fn acks_needed(&self, ts: Timestamp) -> usize;

    /// Best-effort transmission of a notify for `ts` to replica `to`.
    async fn send_notify(&self, to: &str, ts: Timestamp) -> Result<(), CbtxError>;
}

/// Delivery seam under `StaticPeer`: moves a `NotifyMsg` to the named
/// replica, at least once and in no particular order.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, to: &str, msg: NotifyMsg) -> Result<(), CbtxError>;
}

/// Reference topology: every key is owned by the same fixed replica list and
/// the quorum is the size of that list.
#[derive(Debug)]
pub struct StaticPeer<N> {
    /// My own address, stamped on outgoing notifies.
    me: Addr,

    /// Replicas owning every key.
    replicas: Vec<Addr>,

    /// Notify delivery transport.
    notifier: N,
}

impl<N: Notifier> StaticPeer<N> {
    /// Creates a new static topology peer.
    pub fn new(
        me: impl Into<Addr>,
        replicas: Vec<Addr>,
        notifier: N,
    ) -> Result<Self, CbtxError> {
        let me = me.into();
        if replicas.is_empty() {
            return logged_err!("empty replicas list for {}", me);
        }
        let mut seen = HashSet::new();
        if let Some(dup) = replicas.iter().find(|r| !seen.insert(*r)) {
            return logged_err!("duplicate replica '{}' in list", dup);
        }

        Ok(StaticPeer {
            me,
            replicas,
            notifier,
        })
    }

    /// Returns my own address.
    pub fn me(&self) -> &str {
        &self.me
    }
}

#[async_trait]
impl<N: Notifier> ServerPeer for StaticPeer<N> {
    fn replicas_for(&self, _key: &str) -> Vec<Addr> {
        self.replicas.clone()
    }

    fn acks_needed(&self, _ts: Timestamp) -> usize {
        self.replicas.len()
    }

    async fn send_notify(&self, to: &str, ts: Timestamp) -> Result<(), CbtxError> {
        pf_trace!("notify {} @ {}", to, ts);
        self.notifier
            .notify(
                to,
                NotifyMsg {
                    from: self.me.clone(),
                    ts,
                },
            )
            .await
    }
}

/// In-process `Notifier` routing messages over tokio channels keyed by
/// replica address. Cloning yields a handle to the same routing table.
#[derive(Debug, Clone, Default)]
pub struct LocalNotifier {
    routes: Arc<Mutex<HashMap<Addr, mpsc::Sender<NotifyMsg>>>>,
}

impl LocalNotifier {
    /// Creates a new routing table with no replicas registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers replica `addr` and returns the receiving end of its notify
    /// channel. Re-registering replaces the previous channel.
    pub async fn register(
        &self,
        addr: impl Into<Addr>,
        chan_cap: usize,
    ) -> Result<mpsc::Receiver<NotifyMsg>, CbtxError> {
        if chan_cap == 0 {
            return logged_err!("invalid chan_cap {}", chan_cap);
        }
        let (tx, rx) = mpsc::channel(chan_cap);
        self.routes.lock().await.insert(addr.into(), tx);
        Ok(rx)
    }

    /// Removes replica `addr` from the routing table; notifies to it fail
    /// from now on, as if the replica were unreachable.
    pub async fn unregister(&self, addr: &str) {
        self.routes.lock().await.remove(addr);
    }
}

#[async_trait]
impl Notifier for LocalNotifier {
    async fn notify(&self, to: &str, msg: NotifyMsg) -> Result<(), CbtxError> {
        let tx = match self.routes.lock().await.get(to) {
            Some(tx) => tx.clone(),
            None => {
                return Err(CbtxError::msg(format!(
                    "unknown replica '{}'",
                    to
                )))
            }
        };
        Ok(tx.send(msg).await?)
    }
}

#[cfg(test)]
mod peer_tests {
    use super::*;

    fn addrs(n: usize) -> Vec<Addr> {
        (0..n).map(|i| format!("r{}", i)).collect()
    }

    #[test]
    fn static_peer_invalid() {
        assert!(StaticPeer::new("r0", vec![], LocalNotifier::new()).is_err());
        assert!(StaticPeer::new(
            "r0",
            vec!["r0".into(), "r1".into(), "r0".into()],
            LocalNotifier::new()
        )
        .is_err());
    }

    #[test]
    fn static_peer_topology() -> Result<(), CbtxError> {
        let sp = StaticPeer::new("r1", addrs(3), LocalNotifier::new())?;
        assert_eq!(sp.me(), "r1");
        assert_eq!(sp.replicas_for("A"), addrs(3));
        assert_eq!(sp.replicas_for("B"), addrs(3));
        assert_eq!(sp.acks_needed(Timestamp::new(1, 1)), 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn local_notify_routing() -> Result<(), CbtxError> {
        let notifier = LocalNotifier::new();
        let mut rx0 = notifier.register("r0", 8).await?;
        let mut rx1 = notifier.register("r1", 8).await?;
        let sp = StaticPeer::new("r1", addrs(2), notifier.clone())?;
        let ts = Timestamp::new(9, 4);

        sp.send_notify("r0", ts).await?;
        sp.send_notify("r1", ts).await?;
        let expect = NotifyMsg {
            from: "r1".into(),
            ts,
        };
        assert_eq!(rx0.recv().await, Some(expect.clone()));
        assert_eq!(rx1.recv().await, Some(expect));

        notifier.unregister("r0").await;
        assert!(sp.send_notify("r0", ts).await.is_err());
        assert!(sp.send_notify("r7", ts).await.is_err());
        assert!(notifier.register("r2", 0).await.is_err());
        Ok(())
    }
}
