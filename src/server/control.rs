//! Commit-and-promotion coordinator of a replica.
//!
//! Per `(key, ts)`, a write moves `absent -> pending -> stable` and never
//! back. `set()` persists the write as pending and fans out notifies to the
//! replicas of every sibling key; `receive_notify()` counts distinct acks
//! and promotes all pending writes of a timestamp once the quorum is met.

use std::collections::HashSet;
use std::sync::Arc;

use crate::server::{Addr, NotifyMsg, ServerPeer, ServerStore};
use crate::server::{Timestamp, Write};
use crate::utils::CbtxError;

use async_trait::async_trait;

use futures::future::join_all;

use serde::Deserialize;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Read/write endpoint a `Transaction` talks to.
#[async_trait]
pub trait Server: Send + Sync {
    /// Reads `key`. With `ts_required == Timestamp::ZERO` only stable
    /// writes are visible; otherwise the pending write at exactly
    /// `ts_required` may be returned when no stable write satisfies it.
    async fn get(
        &self,
        key: &str,
        ts_required: Timestamp,
    ) -> Result<Option<Write>, CbtxError>;

    /// Submits one write of a transaction.
    async fn set(&self, w: Write) -> Result<(), CbtxError>;
}

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControllerConfig {
    /// Notify each distinct replica at most once per `set()`, even if it
    /// owns several sibling keys of the write.
    pub fanout_dedup: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig { fanout_dedup: true }
    }
}

/// The replica's coordinator, with store and peer injected at creation.
#[derive(Debug)]
pub struct ServerController<S, P> {
    /// My own replica address.
    me: Addr,

    /// Local storage of pending/stable writes and acks.
    ss: S,

    /// Topology and notify transport.
    sp: P,

    /// Configuration parameters struct.
    config: ControllerConfig,
}

impl<S, P> ServerController<S, P>
where
    S: ServerStore,
    P: ServerPeer,
{
    /// Creates a new controller. `config_str` is an optional TOML string
    /// overriding fields of `ControllerConfig`.
    pub fn new(
        me: impl Into<Addr>,
        ss: S,
        sp: P,
        config_str: Option<&str>,
    ) -> Result<Self, CbtxError> {
        let config =
            parsed_config!(config_str => ControllerConfig; fanout_dedup)?;
        Ok(ServerController {
            me: me.into(),
            ss,
            sp,
            config,
        })
    }

    /// Returns my own replica address.
    pub fn me(&self) -> &str {
        &self.me
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.ss
    }

    /// Counts an ack from replica `from` for `ts`, promoting the pending
    /// writes of `ts` once the number of distinct acks reaches the quorum.
    /// Redundant notifies past the quorum re-promote, which is a no-op.
    pub async fn receive_notify(
        &self,
        from: &str,
        ts: Timestamp,
    ) -> Result<(), CbtxError> {
        let acks = self.ss.acks_incr(from, ts).await?;
        let needed = self.sp.acks_needed(ts);
        pf_trace!("ack from {} @ {}: {}/{}", from, ts, acks, needed);

        if acks >= needed {
            self.ss.pending_promote(ts).await?;
        }
        Ok(())
    }

    /// Replica addresses to notify for a write with sibling keys `sibs`.
    fn notify_targets(&self, sibs: &[String]) -> Vec<Addr> {
        let mut seen = HashSet::new();
        sibs.iter()
            .flat_map(|k| self.sp.replicas_for(k))
            .filter(|r| !self.config.fanout_dedup || seen.insert(r.clone()))
            .collect()
    }
}

impl<S, P> ServerController<S, P>
where
    S: ServerStore + 'static,
    P: ServerPeer + 'static,
{
    /// Spawns the notify loop thread, which feeds every message received on
    /// `rx_notify` into `receive_notify()` until the channel closes.
    pub fn spawn_notify_loop(
        self: Arc<Self>,
        rx_notify: mpsc::Receiver<NotifyMsg>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::notify_loop_thread(self, rx_notify))
    }

    /// Notify loop thread function.
    async fn notify_loop_thread(
        controller: Arc<Self>,
        mut rx_notify: mpsc::Receiver<NotifyMsg>,
    ) {
        pf_debug!("{} notify loop spawned", controller.me);

        while let Some(NotifyMsg { from, ts }) = rx_notify.recv().await {
            if let Err(e) = controller.receive_notify(&from, ts).await {
                pf_error!(
                    "{} error handling notify from {} @ {}: {}",
                    controller.me,
                    from,
                    ts,
                    e
                );
            }
        }

        // channel gets closed and no messages remain
        pf_debug!("{} notify loop exited", controller.me);
    }
}

#[async_trait]
impl<S, P> Server for ServerController<S, P>
where
    S: ServerStore,
    P: ServerPeer,
{
    async fn get(
        &self,
        key: &str,
        ts_required: Timestamp,
    ) -> Result<Option<Write>, CbtxError> {
        // stable data always wins when present
        if let Some(w) = self.ss.good_find(key, ts_required).await? {
            return Ok(Some(w));
        }
        if ts_required.is_zero() {
            return Ok(None);
        }
        self.ss.pending_get(key, ts_required).await
    }

    async fn set(&self, w: Write) -> Result<(), CbtxError> {
        let ts = w.ts;
        let targets = self.notify_targets(&w.sibs);
        self.ss.pending_add(w).await?;

        // best-effort fan-out; lost notifies are left to anti-entropy
        let results =
            join_all(targets.iter().map(|to| self.sp.send_notify(to, ts)))
                .await;
        for (to, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                pf_warn!("{} notify to {} @ {} failed: {}", self.me, to, ts, e);
            }
        }
        Ok(())
    }
}
