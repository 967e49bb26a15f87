//! Replica side: write model, storage and peer contracts, and the
//! commit-and-promotion controller.

mod write;
mod store;
mod blobstore;
mod peer;
mod transport;
mod control;
mod cluster;

pub use write::{Addr, ClientId, Key, Timestamp, Val, Write};
pub use store::{MemStore, ServerStore};
pub use blobstore::{BlobBackend, BlobServerStore, BlobStoreConfig, Cas, MemBlobs};
pub use peer::{LocalNotifier, Notifier, NotifyMsg, ServerPeer, StaticPeer};
pub use transport::{NotifyListener, TcpNotifier, TransportConfig};
pub use control::{ControllerConfig, Server, ServerController};
pub use cluster::{ClusterServer, LocalCluster, LocalController};

pub(crate) use store::{insert_sorted, oldest_at_least};
