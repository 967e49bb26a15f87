//! `ServerStore` adapter over an external blob store with compare-and-swap.
//!
//! Each logical table lives as MessagePack-encoded blobs under prefixed
//! string keys:
//!   - `<meta>s_<key>`: stable writes of `key`, sorted by timestamp
//!   - `<meta>p_<key>`: pending writes of `key`
//!   - `<meta>t_<ts>`:  keys that received a pending write at `ts`
//!   - `<meta>a_<ts>`:  replicas that acknowledged `ts`
//!
//! The `t_` and `a_` blobs are never deleted. A notify may be replayed at
//! any time after promotion, and keeping its ack set is what makes the
//! replay a no-op; likewise a late duplicate write still finds its index.
//! Space for them grows with the number of timestamps seen.
//!
//! Every mutation is a read-modify-write guarded by the blob's CAS token and
//! retried a bounded number of times upon contention.

use std::collections::{BTreeSet, HashMap};

use crate::server::{insert_sorted, oldest_at_least};
use crate::server::{Addr, Key, ServerStore, Timestamp, Write};
use crate::utils::CbtxError;

use async_trait::async_trait;

use bytes::Bytes;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tokio::sync::Mutex;

/// Optimistic concurrency token of a stored blob.
pub type Cas = u64;

const STABLE_PREFIX: &str = "s_";
const PENDING_PREFIX: &str = "p_";
const INDEX_PREFIX: &str = "t_";
const ACKS_PREFIX: &str = "a_";

/// Minimum capability required from the durable storage engine: get/put of
/// opaque byte blobs keyed by string with a compare-and-swap token.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Fetches the blob stored under `key` together with its CAS token, or
    /// `None` if no blob exists.
    async fn get_cas(&self, key: &str)
        -> Result<Option<(Bytes, Cas)>, CbtxError>;

    /// Stores `val` under `key` only if the blob's current CAS token equals
    /// `cas` (`None` requires that the blob does not exist yet). Returns
    /// `Ok(false)` on a token mismatch.
    async fn put_cas(
        &self,
        key: &str,
        val: Bytes,
        cas: Option<Cas>,
    ) -> Result<bool, CbtxError>;
}

/// In-memory `BlobBackend`, standing in for a document database in tests.
#[derive(Debug, Default)]
pub struct MemBlobs {
    /// Map from blob key -> (blob, CAS token), plus the next token to issue.
    blobs: Mutex<(HashMap<String, (Bytes, Cas)>, Cas)>,
}

impl MemBlobs {
    /// Creates a new empty blob store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobBackend for MemBlobs {
    async fn get_cas(
        &self,
        key: &str,
    ) -> Result<Option<(Bytes, Cas)>, CbtxError> {
        let guard = self.blobs.lock().await;
        Ok(guard.0.get(key).cloned())
    }

    async fn put_cas(
        &self,
        key: &str,
        val: Bytes,
        cas: Option<Cas>,
    ) -> Result<bool, CbtxError> {
        let mut guard = self.blobs.lock().await;
        let (blobs, next_cas) = &mut *guard;
        if blobs.get(key).map(|(_, c)| *c) != cas {
            return Ok(false);
        }
        *next_cas += 1;
        blobs.insert(key.to_string(), (val, *next_cas));
        Ok(true)
    }
}

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BlobStoreConfig {
    /// Key prefix for transaction metadata blobs, to avoid collisions with
    /// other users of the same bucket.
    pub meta_prefix: String,

    /// Maximum number of re-attempts of a CAS update under contention.
    pub cas_retries: u32,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        BlobStoreConfig {
            meta_prefix: "cbtx:".into(),
            cas_retries: 64,
        }
    }
}

/// `ServerStore` implemented over any `BlobBackend`.
#[derive(Debug)]
pub struct BlobServerStore<B> {
    /// Underlying blob storage backend.
    backend: B,

    /// Configuration parameters struct.
    config: BlobStoreConfig,
}

impl<B: BlobBackend> BlobServerStore<B> {
    /// Creates a new blob-backed store. `config_str` is an optional TOML
    /// string overriding fields of `BlobStoreConfig`.
    pub fn new(backend: B, config_str: Option<&str>) -> Result<Self, CbtxError> {
        let config = parsed_config!(config_str => BlobStoreConfig;
                                    meta_prefix, cas_retries)?;
        Ok(BlobServerStore { backend, config })
    }

    fn blob_key(&self, prefix: &str, name: impl std::fmt::Display) -> String {
        format!("{}{}{}", self.config.meta_prefix, prefix, name)
    }

    /// Reads and decodes the record under `blob_key`, defaulting if missing.
    async fn load<T>(&self, blob_key: &str) -> Result<(T, Option<Cas>), CbtxError>
    where
        T: DeserializeOwned + Default,
    {
        match self.backend.get_cas(blob_key).await? {
            Some((blob, cas)) if !blob.is_empty() => {
                Ok((rmp_serde::decode::from_slice(&blob)?, Some(cas)))
            }
            Some((_, cas)) => Ok((T::default(), Some(cas))),
            None => Ok((T::default(), None)),
        }
    }

    /// CAS-guarded read-modify-write of the record under `blob_key`. `f`
    /// mutates the decoded record and returns whether it changed along with
    /// a result; unchanged records are not written back.
    async fn update<T, R, F>(
        &self,
        blob_key: &str,
        mut f: F,
    ) -> Result<R, CbtxError>
    where
        T: Serialize + DeserializeOwned + Default + Send,
        R: Send,
        F: FnMut(&mut T) -> (bool, R) + Send,
    {
        for _ in 0..=self.config.cas_retries {
            let (mut record, cas) = self.load::<T>(blob_key).await?;
            let (changed, result) = f(&mut record);
            if !changed {
                return Ok(result);
            }

            let blob = Bytes::from(rmp_serde::encode::to_vec(&record)?);
            if self.backend.put_cas(blob_key, blob, cas).await? {
                return Ok(result);
            }
            pf_trace!("cas conflict on '{}', retrying", blob_key);
        }

        logged_err!(
            "cas update of '{}' exceeded {} retries",
            blob_key,
            self.config.cas_retries
        )
    }

    /// Returns true if `key` has a stable write at exactly `ts`.
    async fn is_stable(
        &self,
        key: &str,
        ts: Timestamp,
    ) -> Result<bool, CbtxError> {
        Ok(self.good_find(key, ts).await?.is_some_and(|s| s.ts == ts))
    }

    /// Removes every pending write of `key` at `ts`.
    async fn drop_pending(
        &self,
        key: &str,
        ts: Timestamp,
    ) -> Result<(), CbtxError> {
        self.update::<Vec<Write>, _, _>(
            &self.blob_key(PENDING_PREFIX, key),
            |pending| {
                let before = pending.len();
                pending.retain(|w| w.ts != ts);
                (pending.len() != before, ())
            },
        )
        .await
    }
}

#[async_trait]
impl<B: BlobBackend> ServerStore for BlobServerStore<B> {
    async fn good_find(
        &self,
        key: &str,
        ts_minimum: Timestamp,
    ) -> Result<Option<Write>, CbtxError> {
        let (versions, _) = self
            .load::<Vec<Write>>(&self.blob_key(STABLE_PREFIX, key))
            .await?;
        Ok(oldest_at_least(&versions, ts_minimum).cloned())
    }

    async fn pending_get(
        &self,
        key: &str,
        ts_required: Timestamp,
    ) -> Result<Option<Write>, CbtxError> {
        let (pending, _) = self
            .load::<Vec<Write>>(&self.blob_key(PENDING_PREFIX, key))
            .await?;
        Ok(pending.into_iter().find(|w| w.ts == ts_required))
    }

    async fn pending_add(&self, w: Write) -> Result<(), CbtxError> {
        if self.is_stable(&w.key, w.ts).await? {
            pf_trace!("duplicate pending_add {} @ {}", w.key, w.ts);
            return Ok(());
        }

        // index first, so a promotion never misses a write it can see
        let key = w.key.clone();
        self.update::<BTreeSet<Key>, _, _>(
            &self.blob_key(INDEX_PREFIX, w.ts),
            |keys| (keys.insert(key.clone()), ()),
        )
        .await?;

        self.update::<Vec<Write>, _, _>(
            &self.blob_key(PENDING_PREFIX, &w.key),
            |pending| {
                if pending.iter().any(|p| p.ts == w.ts) {
                    (false, ())
                } else {
                    pending.push(w.clone());
                    (true, ())
                }
            },
        )
        .await?;

        // a promote of w.ts may have finished since the first check
        if self.is_stable(&w.key, w.ts).await? {
            pf_trace!("pending_add {} @ {} raced a promote", w.key, w.ts);
            self.drop_pending(&w.key, w.ts).await?;
        }
        Ok(())
    }

    async fn pending_promote(&self, ts: Timestamp) -> Result<(), CbtxError> {
        let (keys, _) = self
            .load::<BTreeSet<Key>>(&self.blob_key(INDEX_PREFIX, ts))
            .await?;

        for key in keys {
            let pending_key = self.blob_key(PENDING_PREFIX, &key);
            let (pending, _) = self.load::<Vec<Write>>(&pending_key).await?;
            let moving: Vec<Write> =
                pending.into_iter().filter(|w| w.ts == ts).collect();
            if moving.is_empty() {
                continue;
            }

            // stable copy lands before the pending one goes away; a failure
            // in between leaves a duplicate that a later promote cleans up
            self.update::<Vec<Write>, _, _>(
                &self.blob_key(STABLE_PREFIX, &key),
                |versions| {
                    let mut changed = false;
                    for w in &moving {
                        changed |= insert_sorted(versions, w.clone());
                    }
                    (changed, ())
                },
            )
            .await?;

            self.drop_pending(&key, ts).await?;
        }

        pf_debug!("promoted writes @ {}", ts);
        Ok(())
    }

    async fn acks_incr(
        &self,
        from: &str,
        ts: Timestamp,
    ) -> Result<usize, CbtxError> {
        self.update::<BTreeSet<Addr>, _, _>(
            &self.blob_key(ACKS_PREFIX, ts),
            |acked| {
                let changed = acked.insert(from.to_string());
                (changed, acked.len())
            },
        )
        .await
    }
}
