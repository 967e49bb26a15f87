//! Replica-to-replica TCP transport for notify messages.
//!
//! Outgoing notifies go through `TcpNotifier`, which lazily opens one
//! send-only connection per destination replica and drops it upon a write
//! failure so the next notify reconnects. Incoming connections are accepted
//! by `NotifyListener`, which forwards every received `NotifyMsg` into a
//! channel that a controller's notify loop drains.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::server::{Addr, Notifier, NotifyMsg};
use crate::utils::{
    safe_tcp_read, safe_tcp_write_all, tcp_bind_with_retry,
    tcp_connect_with_retry, CbtxError,
};

use async_trait::async_trait;

use bytes::BytesMut;

use serde::Deserialize;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransportConfig {
    /// Number of re-attempts when binding or connecting fails.
    pub connect_retries: u8,

    /// Interval between re-attempts in millisecs.
    pub retry_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connect_retries: 3,
            retry_interval_ms: 100,
        }
    }
}

impl TransportConfig {
    /// Parses a config from an optional TOML string over the defaults.
    pub fn parse(config_str: Option<&str>) -> Result<Self, CbtxError> {
        parsed_config!(config_str => TransportConfig;
                       connect_retries, retry_interval_ms)
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Sending side of the TCP notify transport.
#[derive(Debug)]
pub struct TcpNotifier {
    /// Map from replica address -> socket address to reach it.
    peer_addrs: HashMap<Addr, SocketAddr>,

    /// Map from replica address -> established send connection.
    conns: Mutex<HashMap<Addr, Arc<Mutex<TcpStream>>>>,

    /// Configuration parameters struct.
    config: TransportConfig,
}

impl TcpNotifier {
    /// Creates a new TCP notifier over the given address book. No
    /// connection is made until the first notify to each replica.
    pub fn new(
        peer_addrs: HashMap<Addr, SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<Self, CbtxError> {
        Ok(TcpNotifier {
            peer_addrs,
            conns: Mutex::new(HashMap::new()),
            config: TransportConfig::parse(config_str)?,
        })
    }

    /// Returns the send connection to `to`, connecting if there is none.
    async fn conn_to(
        &self,
        to: &str,
    ) -> Result<Arc<Mutex<TcpStream>>, CbtxError> {
        if let Some(conn) = self.conns.lock().await.get(to) {
            return Ok(conn.clone());
        }

        // connect outside the map lock
        let Some(&sock_addr) = self.peer_addrs.get(to) else {
            return Err(CbtxError::msg(format!("unknown replica '{}'", to)));
        };
        let stream = tcp_connect_with_retry(
            sock_addr,
            self.config.connect_retries,
            self.config.retry_interval(),
        )
        .await?;
        pf_debug!("connected to replica {} at {}", to, sock_addr);

        // keep the first connection if a concurrent notify won the race
        let conn = self
            .conns
            .lock()
            .await
            .entry(to.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(stream)))
            .clone();
        Ok(conn)
    }
}

#[async_trait]
impl Notifier for TcpNotifier {
    async fn notify(&self, to: &str, msg: NotifyMsg) -> Result<(), CbtxError> {
        let conn = self.conn_to(to).await?;
        let mut stream = conn.lock().await;
        if let Err(e) = safe_tcp_write_all(&mut *stream, &msg).await {
            drop(stream);
            self.conns.lock().await.remove(to);
            pf_warn!("dropped connection to {}: {}", to, e);
            return Err(e);
        }
        Ok(())
    }
}

/// Receiving side of the TCP notify transport.
#[derive(Debug)]
pub struct NotifyListener {
    listener: TcpListener,
}

impl NotifyListener {
    /// Binds the listener to `bind_addr`.
    pub async fn bind(
        bind_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, CbtxError> {
        let config = TransportConfig::parse(config_str)?;
        let listener = tcp_bind_with_retry(
            bind_addr,
            config.connect_retries,
            config.retry_interval(),
        )
        .await?;
        Ok(NotifyListener { listener })
    }

    /// Returns the actually bound socket address.
    pub fn local_addr(&self) -> Result<SocketAddr, CbtxError> {
        Ok(self.listener.local_addr()?)
    }

    /// Spawns the acceptor thread, which spawns one message recver thread
    /// per accepted connection; every received notify is sent to `tx_recv`.
    pub fn spawn(self, tx_recv: mpsc::Sender<NotifyMsg>) -> JoinHandle<()> {
        tokio::spawn(Self::acceptor_thread(self.listener, tx_recv))
    }

    /// Acceptor thread function.
    async fn acceptor_thread(
        listener: TcpListener,
        tx_recv: mpsc::Sender<NotifyMsg>,
    ) {
        pf_debug!("notify acceptor thread spawned");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    pf_debug!("accepted notify connection from {}", peer);
                    tokio::spawn(Self::msg_recver_thread(
                        stream,
                        peer,
                        tx_recv.clone(),
                    ));
                }
                Err(e) => {
                    pf_error!("error accepting connection: {}", e);
                    break;
                }
            }
        }

        pf_debug!("notify acceptor thread exited");
    }

    /// Message recver thread function.
    async fn msg_recver_thread(
        mut stream: TcpStream,
        peer: SocketAddr,
        tx_recv: mpsc::Sender<NotifyMsg>,
    ) {
        let mut read_buf = BytesMut::new();
        loop {
            match safe_tcp_read::<NotifyMsg, _>(&mut read_buf, &mut stream)
                .await
            {
                Ok(msg) => {
                    if tx_recv.send(msg).await.is_err() {
                        break; // notify loop gone
                    }
                }
                Err(e) => {
                    pf_debug!("notify connection from {} ended: {}", peer, e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod transport_tests {
    use super::*;
    use crate::server::Timestamp;

    #[test]
    fn config_parse() -> Result<(), CbtxError> {
        let config = TransportConfig::parse(Some("connect_retries = 7"))?;
        assert_eq!(config.connect_retries, 7);
        assert_eq!(config.retry_interval_ms, 100);
        assert!(TransportConfig::parse(Some("retries = 7")).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn notify_over_tcp() -> Result<(), CbtxError> {
        let listener =
            NotifyListener::bind("127.0.0.1:0".parse()?, None).await?;
        let sock_addr = listener.local_addr()?;
        let (tx_recv, mut rx_recv) = mpsc::channel(16);
        let acceptor = listener.spawn(tx_recv);

        let notifier = TcpNotifier::new(
            HashMap::from([("r1".to_string(), sock_addr)]),
            Some("retry_interval_ms = 10"),
        )?;
        for clock in 1..=3 {
            notifier
                .notify(
                    "r1",
                    NotifyMsg {
                        from: "r0".into(),
                        ts: Timestamp::new(clock, 0),
                    },
                )
                .await?;
        }
        for clock in 1..=3 {
            let msg = rx_recv.recv().await;
            assert_eq!(
                msg,
                Some(NotifyMsg {
                    from: "r0".into(),
                    ts: Timestamp::new(clock, 0),
                })
            );
        }

        let unknown = NotifyMsg {
            from: "r0".into(),
            ts: Timestamp::new(4, 0),
        };
        assert!(notifier.notify("r9", unknown).await.is_err());
        acceptor.abort();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dead_replica_not_blocking() -> Result<(), CbtxError> {
        let listener =
            NotifyListener::bind("127.0.0.1:0".parse()?, None).await?;
        let live_addr = listener.local_addr()?;
        let (tx_recv, mut rx_recv) = mpsc::channel(16);
        let acceptor = listener.spawn(tx_recv);

        // an address nobody listens on any more
        let dead_addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;

        let notifier = Arc::new(TcpNotifier::new(
            HashMap::from([
                ("live".to_string(), live_addr),
                ("dead".to_string(), dead_addr),
            ]),
            Some("connect_retries = 10\nretry_interval_ms = 200"),
        )?);
        let msg = NotifyMsg {
            from: "r0".into(),
            ts: Timestamp::new(1, 0),
        };

        let stuck = {
            let notifier = notifier.clone();
            let msg = msg.clone();
            tokio::spawn(async move { notifier.notify("dead", msg).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(
            Duration::from_millis(1000),
            notifier.notify("live", msg.clone()),
        )
        .await
        .map_err(|_| CbtxError::msg("notify to live replica stalled"))??;
        assert_eq!(rx_recv.recv().await, Some(msg));

        stuck.abort();
        acceptor.abort();
        Ok(())
    }
}
