use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::kv::{KvError, KvResult};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Put,
    Delete,
}

/// One committed change in a bucket's log.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    /// Position in the backend-wide log.
    pub seq: u64,
    pub bucket: String,
    pub key: String,
    pub op: ChangeOp,
    pub value: Option<Vec<u8>>,
    pub revision: u64,
    pub expires_at: Option<DateTime<Utc>>,
    /// Replica that issued the write.
    pub origin: Uuid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub revision: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl VersionedValue {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Replication log the KV store is layered on.
///
/// Revisions are monotonically increasing per backend. `update` with an
/// `expected_revision` of 0 only succeeds when the key does not exist.
#[async_trait]
pub trait ReplicationBackend: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> KvResult<Option<VersionedValue>>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        origin: Uuid,
    ) -> KvResult<u64>;

    #[allow(clippy::too_many_arguments)]
    async fn update(
        &self,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        expected_revision: u64,
        ttl: Duration,
        origin: Uuid,
    ) -> KvResult<u64>;

    /// Returns the revision of the delete marker, or `None` if the key was absent.
    async fn delete(&self, bucket: &str, key: &str, origin: Uuid) -> KvResult<Option<u64>>;

    async fn entries(&self, bucket: &str) -> KvResult<Vec<(String, VersionedValue)>>;

    /// Subscribe to committed changes of a bucket.
    fn watch(&self, bucket: &str) -> broadcast::Receiver<ChangeEntry>;

    /// Drop expired records, publishing a delete for each.
    async fn purge_expired(&self) -> KvResult<usize>;
}

#[derive(Debug, Default)]
struct BackendState {
    revision: u64,
    seq: u64,
    buckets: HashMap<String, HashMap<String, VersionedValue>>,
}

/// In-process replication log shared by every replica of a test or a
/// single-node deployment.
#[derive(Debug)]
pub struct MemoryBackend {
    state: RwLock<BackendState>,
    watchers: std::sync::Mutex<HashMap<String, broadcast::Sender<ChangeEntry>>>,
    unavailable: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(BackendState::default()),
            watchers: std::sync::Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every write fail, simulating a lost connection to the log.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> KvResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KvError::Backend("replication log unavailable".to_string()));
        }
        Ok(())
    }

    fn sender(&self, bucket: &str) -> broadcast::Sender<ChangeEntry> {
        let mut watchers = self
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        watchers
            .entry(bucket.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .clone()
    }

    fn publish(&self, entry: ChangeEntry) {
        // No subscribers is fine
        let _ = self.sender(&entry.bucket).send(entry);
    }

    fn expiry(ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| Utc::now() + ttl)
    }

    fn commit_put(
        state: &mut BackendState,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        origin: Uuid,
    ) -> ChangeEntry {
        state.revision += 1;
        state.seq += 1;
        let revision = state.revision;
        let expires_at = Self::expiry(ttl);
        state.buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            VersionedValue {
                value: value.clone(),
                revision,
                expires_at,
            },
        );
        ChangeEntry {
            seq: state.seq,
            bucket: bucket.to_string(),
            key: key.to_string(),
            op: ChangeOp::Put,
            value: Some(value),
            revision,
            expires_at,
            origin,
        }
    }
}

#[async_trait]
impl ReplicationBackend for MemoryBackend {
    async fn get(&self, bucket: &str, key: &str) -> KvResult<Option<VersionedValue>> {
        let state = self.state.read().await;
        let now = Utc::now();
        Ok(state
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .filter(|v| !v.is_expired(now))
            .cloned())
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
        origin: Uuid,
    ) -> KvResult<u64> {
        self.check_available()?;
        // Publish under the state lock so watchers see commit order
        let mut state = self.state.write().await;
        let entry = Self::commit_put(&mut state, bucket, key, value, ttl, origin);
        let revision = entry.revision;
        self.publish(entry);
        Ok(revision)
    }

    async fn update(
        &self,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        expected_revision: u64,
        ttl: Duration,
        origin: Uuid,
    ) -> KvResult<u64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let now = Utc::now();
        let actual = state
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .filter(|v| !v.is_expired(now))
            .map(|v| v.revision)
            .unwrap_or(0);
        if actual != expected_revision {
            return Err(KvError::RevisionMismatch {
                key: key.to_string(),
                expected: expected_revision,
                actual,
            });
        }
        let entry = Self::commit_put(&mut state, bucket, key, value, ttl, origin);
        let revision = entry.revision;
        self.publish(entry);
        Ok(revision)
    }

    async fn delete(&self, bucket: &str, key: &str, origin: Uuid) -> KvResult<Option<u64>> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let removed = state.buckets.get_mut(bucket).and_then(|b| b.remove(key));
        if removed.is_none() {
            return Ok(None);
        }
        state.revision += 1;
        state.seq += 1;
        let revision = state.revision;
        self.publish(ChangeEntry {
            seq: state.seq,
            bucket: bucket.to_string(),
            key: key.to_string(),
            op: ChangeOp::Delete,
            value: None,
            revision,
            expires_at: None,
            origin,
        });
        Ok(Some(revision))
    }

    async fn entries(&self, bucket: &str) -> KvResult<Vec<(String, VersionedValue)>> {
        let state = self.state.read().await;
        let now = Utc::now();
        Ok(state
            .buckets
            .get(bucket)
            .map(|b| {
                b.iter()
                    .filter(|(_, v)| !v.is_expired(now))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn watch(&self, bucket: &str) -> broadcast::Receiver<ChangeEntry> {
        self.sender(bucket).subscribe()
    }

    async fn purge_expired(&self) -> KvResult<usize> {
        let purged = {
            let mut state = self.state.write().await;
            let now = Utc::now();
            let mut expired = Vec::new();
            for (bucket, records) in state.buckets.iter_mut() {
                let keys: Vec<String> = records
                    .iter()
                    .filter(|(_, v)| v.is_expired(now))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in keys {
                    records.remove(&key);
                    expired.push((bucket.clone(), key));
                }
            }

            let mut entries = Vec::with_capacity(expired.len());
            for (bucket, key) in expired {
                state.revision += 1;
                state.seq += 1;
                entries.push(ChangeEntry {
                    seq: state.seq,
                    bucket,
                    key,
                    op: ChangeOp::Delete,
                    value: None,
                    revision: state.revision,
                    expires_at: None,
                    origin: Uuid::nil(),
                });
            }
            let count = entries.len();
            for entry in entries {
                self.publish(entry);
            }
            count
        };
        Ok(purged)
    }
}
