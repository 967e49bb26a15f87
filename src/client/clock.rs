//! Per-client logical clock issuing transaction timestamps.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::server::{ClientId, Timestamp};

/// Lamport-style clock of one client. Timestamps it issues are strictly
/// increasing and carry the client's ID, so two clients never issue equal
/// timestamps.
#[derive(Debug)]
pub struct LogicalClock {
    /// ID of the owning client.
    client: ClientId,

    /// Last clock value issued or observed.
    clock: AtomicU64,
}

impl LogicalClock {
    /// Creates a new clock for `client`, starting from zero.
    pub fn new(client: ClientId) -> Self {
        LogicalClock {
            client,
            clock: AtomicU64::new(0),
        }
    }

    /// Returns the owning client's ID.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Issues the next timestamp.
    pub fn tick(&self) -> Timestamp {
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        Timestamp::new(clock, self.client)
    }

    /// Merges a timestamp observed from elsewhere, so that subsequently
    /// issued timestamps order after it.
    pub fn observe(&self, ts: Timestamp) {
        self.clock.fetch_max(ts.clock, Ordering::SeqCst);
    }
}
