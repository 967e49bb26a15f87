//! Write record model: timestamps, keys, and the replicated write unit.

use std::fmt;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Originating client ID type.
pub type ClientId = u32;

/// Opaque key of a document/row in the underlying store.
pub type Key = String;

/// Opaque replica address.
pub type Addr = String;

/// Value of a write; `None` marks a deletion (tombstone).
pub type Val = Option<Bytes>;

/// Transaction timestamp, also serving as the transaction identifier.
///
/// Composed of a per-client logical clock value and the originating client
/// ID. Timestamps are totally ordered lexicographically on `(clock, client)`
/// (field declaration order matters for the derived `Ord`), so timestamps
/// from causally unrelated clients still compare deterministically and the
/// client ID only breaks ties between equal clock values.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
)]
pub struct Timestamp {
    /// Logical clock value.
    pub clock: u64,

    /// Originating client ID.
    pub client: ClientId,
}

impl Timestamp {
    /// The null timestamp, meaning "no causal requirement".
    pub const ZERO: Timestamp = Timestamp {
        clock: 0,
        client: 0,
    };

    /// Creates a new timestamp.
    pub fn new(clock: u64, client: ClientId) -> Self {
        Timestamp { clock, client }
    }

    /// Returns true if this is the null timestamp.
    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.clock, self.client)
    }
}

/// One write of a transaction. Immutable once created; identity is
/// `(key, ts)`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Write {
    /// Key written.
    pub key: Key,

    /// New value, or `None` for a deletion.
    pub val: Val,

    /// Timestamp of the owning transaction.
    pub ts: Timestamp,

    /// All keys written by the same transaction, including `key` itself.
    pub sibs: Vec<Key>,
}

impl Write {
    /// Creates a new write record.
    pub fn new(key: Key, val: Val, ts: Timestamp, sibs: Vec<Key>) -> Self {
        Write { key, val, ts, sibs }
    }

    /// Identity of this write.
    #[inline]
    pub fn id(&self) -> (&str, Timestamp) {
        (&self.key, self.ts)
    }

    /// Returns true if this write is a deletion.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.val.is_none()
    }
}
