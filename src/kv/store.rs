use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::KvConfig;
use crate::kv::backend::{ChangeEntry, ChangeOp, ReplicationBackend};
use crate::kv::{KvError, KvResult};

/// Where an applied change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Committed by this replica.
    Local,
    /// Delivered through the replication log.
    Remote,
    /// Safety-net expiry.
    Expired,
}

/// Callbacks run after a change was applied to the local cache.
///
/// Hooks are serialized per store and may read the store they are attached to.
#[async_trait]
pub trait StoreHooks<T: Send + Sync>: Send + Sync {
    async fn on_updated(&self, key: &str, previous: Option<&T>, current: &T, origin: ChangeOrigin);

    async fn on_deleted(&self, key: &str, previous: Option<&T>, origin: ChangeOrigin);
}

/// Fallback source consulted by [`KvStore::get_or_load`] on a cache miss.
#[async_trait]
pub trait Loader<T>: Send + Sync {
    async fn load(&self, key: &str) -> KvResult<Option<T>>;
}

#[derive(Debug, Clone)]
struct Cached<T> {
    value: T,
    revision: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl<T> Cached<T> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Inner<T> {
    bucket: String,
    replica: Uuid,
    config: KvConfig,
    backend: Arc<dyn ReplicationBackend>,
    cache: RwLock<HashMap<String, Cached<T>>>,
    hooks: std::sync::RwLock<Vec<Arc<dyn StoreHooks<T>>>>,
    loader: std::sync::RwLock<Option<Arc<dyn Loader<T>>>>,
    /// Serializes cache application + hooks.
    apply_lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

/// Replicated bucket of JSON-encoded records with a local cache.
///
/// Cheap to clone; clones share the same cache.
pub struct KvStore<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for KvStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> KvStore<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        bucket: impl Into<String>,
        replica: Uuid,
        backend: Arc<dyn ReplicationBackend>,
        config: KvConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bucket: bucket.into(),
                replica,
                config,
                backend,
                cache: RwLock::new(HashMap::new()),
                hooks: std::sync::RwLock::new(Vec::new()),
                loader: std::sync::RwLock::new(None),
                apply_lock: Mutex::new(()),
                _marker: PhantomData,
            }),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.inner.bucket
    }

    pub fn replica(&self) -> Uuid {
        self.inner.replica
    }

    pub fn add_hooks(&self, hooks: Arc<dyn StoreHooks<T>>) {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(hooks);
    }

    pub fn set_loader(&self, loader: Arc<dyn Loader<T>>) {
        *self
            .inner
            .loader
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(loader);
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        let now = Utc::now();
        self.inner
            .cache
            .read()
            .await
            .get(key)
            .filter(|c| !c.is_expired(now))
            .map(|c| c.value.clone())
    }

    /// Read through to the replication log, then to the loader.
    pub async fn get_or_load(&self, key: &str) -> KvResult<Option<T>> {
        if let Some(value) = self.get(key).await {
            return Ok(Some(value));
        }

        if let Some(remote) = self.inner.backend.get(&self.inner.bucket, key).await? {
            let value: T = serde_json::from_slice(&remote.value)?;
            self.apply_put(
                key,
                value.clone(),
                remote.revision,
                remote.expires_at,
                ChangeOrigin::Remote,
            )
            .await;
            return Ok(Some(value));
        }

        let loader = self
            .inner
            .loader
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(loader) = loader else {
            return Ok(None);
        };
        match loader.load(key).await? {
            Some(value) => {
                self.put(key, value.clone()).await?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Unconditional write.
    pub async fn put(&self, key: &str, value: T) -> KvResult<()> {
        let bytes = serde_json::to_vec(&value)?;
        let revision = self
            .inner
            .backend
            .put(
                &self.inner.bucket,
                key,
                bytes,
                self.inner.config.record_ttl,
                self.inner.replica,
            )
            .await?;
        self.apply_put(key, value, revision, self.local_expiry(), ChangeOrigin::Local)
            .await;
        Ok(())
    }

    /// Remove a key, returning the value this replica had cached.
    pub async fn delete(&self, key: &str) -> KvResult<Option<T>> {
        let revision = self
            .inner
            .backend
            .delete(&self.inner.bucket, key, self.inner.replica)
            .await?;
        Ok(self
            .apply_delete(key, revision.unwrap_or(u64::MAX), ChangeOrigin::Local)
            .await)
    }

    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .inner
            .cache
            .read()
            .await
            .iter()
            .filter(|(k, c)| k.starts_with(prefix) && !c.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub async fn list(&self) -> Vec<T> {
        let now = Utc::now();
        self.inner
            .cache
            .read()
            .await
            .values()
            .filter(|c| !c.is_expired(now))
            .map(|c| c.value.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.cache.read().await.is_empty()
    }

    /// Atomic read-modify-write of one key.
    ///
    /// `update` receives a copy of the current value (or `None`) and returns
    /// the new value plus whether it changed. Unchanged results are not
    /// written. On a concurrent commit by another writer the current value is
    /// re-read and `update` runs again, so at most one write is committed per
    /// call. Returns the resulting value and whether a write happened.
    pub async fn compute_update<F, E>(&self, key: &str, mut update: F) -> Result<(T, bool), E>
    where
        F: FnMut(Option<T>) -> Result<(T, bool), E>,
        E: From<KvError>,
    {
        let attempts = self.inner.config.max_update_retries.max(1);
        for attempt in 0..attempts {
            let current = self.current_versioned(key, attempt > 0).await?;
            let revision = current.as_ref().map(|(_, rev)| *rev).unwrap_or(0);

            let (next, changed) = update(current.map(|(value, _)| value))?;
            if !changed {
                return Ok((next, false));
            }

            let bytes = serde_json::to_vec(&next).map_err(KvError::from)?;
            match self
                .inner
                .backend
                .update(
                    &self.inner.bucket,
                    key,
                    bytes,
                    revision,
                    self.inner.config.record_ttl,
                    self.inner.replica,
                )
                .await
            {
                Ok(new_revision) => {
                    self.apply_put(
                        key,
                        next.clone(),
                        new_revision,
                        self.local_expiry(),
                        ChangeOrigin::Local,
                    )
                    .await;
                    return Ok((next, true));
                }
                Err(KvError::RevisionMismatch { expected, actual, .. }) => {
                    tracing::debug!(
                        bucket = %self.inner.bucket,
                        key,
                        expected,
                        actual,
                        attempt,
                        "Concurrent update, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(KvError::Contended {
            key: key.to_string(),
            attempts,
        }
        .into())
    }

    /// Current value with its revision. `refresh` bypasses the local cache.
    async fn current_versioned(&self, key: &str, refresh: bool) -> KvResult<Option<(T, u64)>> {
        if !refresh {
            let now = Utc::now();
            if let Some(c) = self
                .inner
                .cache
                .read()
                .await
                .get(key)
                .filter(|c| !c.is_expired(now))
            {
                return Ok(Some((c.value.clone(), c.revision)));
            }
        }

        match self.inner.backend.get(&self.inner.bucket, key).await? {
            Some(remote) => {
                let value: T = serde_json::from_slice(&remote.value)?;
                self.apply_put(
                    key,
                    value.clone(),
                    remote.revision,
                    remote.expires_at,
                    ChangeOrigin::Remote,
                )
                .await;
                Ok(Some((value, remote.revision)))
            }
            None => Ok(None),
        }
    }

    fn local_expiry(&self) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.inner.config.record_ttl)
            .ok()
            .map(|ttl| Utc::now() + ttl)
    }

    fn hooks(&self) -> Vec<Arc<dyn StoreHooks<T>>> {
        self.inner
            .hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn apply_put(
        &self,
        key: &str,
        value: T,
        revision: u64,
        expires_at: Option<DateTime<Utc>>,
        origin: ChangeOrigin,
    ) {
        let _guard = self.inner.apply_lock.lock().await;
        let previous = {
            let mut cache = self.inner.cache.write().await;
            if cache.get(key).is_some_and(|c| c.revision >= revision) {
                return;
            }
            cache
                .insert(
                    key.to_string(),
                    Cached {
                        value: value.clone(),
                        revision,
                        expires_at,
                    },
                )
                .map(|c| c.value)
        };

        for hook in self.hooks() {
            hook.on_updated(key, previous.as_ref(), &value, origin).await;
        }
    }

    async fn apply_delete(&self, key: &str, revision: u64, origin: ChangeOrigin) -> Option<T> {
        let _guard = self.inner.apply_lock.lock().await;
        let previous = {
            let mut cache = self.inner.cache.write().await;
            match cache.get(key) {
                Some(c) if c.revision < revision => cache.remove(key).map(|c| c.value),
                _ => None,
            }
        };

        if previous.is_some() {
            for hook in self.hooks() {
                hook.on_deleted(key, previous.as_ref(), origin).await;
            }
        }
        previous
    }

    async fn apply_entry(&self, entry: ChangeEntry) {
        // Own writes are applied by the committing call
        if entry.origin == self.inner.replica {
            return;
        }
        match entry.op {
            ChangeOp::Put => {
                let Some(bytes) = entry.value else {
                    return;
                };
                match serde_json::from_slice::<T>(&bytes) {
                    Ok(value) => {
                        self.apply_put(
                            &entry.key,
                            value,
                            entry.revision,
                            entry.expires_at,
                            ChangeOrigin::Remote,
                        )
                        .await;
                    }
                    Err(e) => {
                        tracing::warn!(
                            bucket = %self.inner.bucket,
                            key = %entry.key,
                            error = %e,
                            "Failed to decode replicated record"
                        );
                    }
                }
            }
            ChangeOp::Delete => {
                let origin = if entry.origin.is_nil() {
                    ChangeOrigin::Expired
                } else {
                    ChangeOrigin::Remote
                };
                self.apply_delete(&entry.key, entry.revision, origin).await;
            }
        }
    }

    /// Load every record of the bucket from the replication log.
    pub async fn sync(&self) -> KvResult<usize> {
        let entries = self.inner.backend.entries(&self.inner.bucket).await?;
        let count = entries.len();
        let mut seen = std::collections::HashSet::with_capacity(count);
        for (key, remote) in entries {
            match serde_json::from_slice::<T>(&remote.value) {
                Ok(value) => {
                    self.apply_put(
                        &key,
                        value,
                        remote.revision,
                        remote.expires_at,
                        ChangeOrigin::Remote,
                    )
                    .await;
                }
                Err(e) => {
                    tracing::warn!(bucket = %self.inner.bucket, key, error = %e, "Skipping undecodable record");
                }
            }
            seen.insert(key);
        }

        let stale: Vec<String> = self
            .inner
            .cache
            .read()
            .await
            .keys()
            .filter(|k| !seen.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            self.apply_delete(&key, u64::MAX, ChangeOrigin::Remote).await;
        }
        Ok(count)
    }

    /// Drop expired entries from the local cache, firing delete hooks.
    pub async fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .inner
            .cache
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.apply_delete(&key, u64::MAX, ChangeOrigin::Expired).await;
        }
        count
    }

    /// Follow the bucket's change log until cancelled.
    pub fn spawn_watcher(&self, token: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        // Subscribe before spawning so no change committed after this call is missed
        let rx = store.inner.backend.watch(&store.inner.bucket);
        tokio::spawn(async move {
            store.run_watcher(rx, token).await;
        })
    }

    async fn run_watcher(
        &self,
        rx: tokio::sync::broadcast::Receiver<ChangeEntry>,
        token: CancellationToken,
    ) {
        let mut changes = BroadcastStream::new(rx);
        let mut eviction = tokio::time::interval(self.inner.config.eviction_interval);

        tracing::debug!(bucket = %self.inner.bucket, replica = %self.inner.replica, "Watcher started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                change = changes.next() => match change {
                    Some(Ok(entry)) => self.apply_entry(entry).await,
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        tracing::warn!(bucket = %self.inner.bucket, skipped, "Watcher lagged, resyncing");
                        if let Err(e) = self.sync().await {
                            tracing::error!(bucket = %self.inner.bucket, error = %e, "Resync failed");
                        }
                    }
                    None => break,
                },
                _ = eviction.tick() => {
                    let evicted = self.evict_expired().await;
                    if evicted > 0 {
                        tracing::debug!(bucket = %self.inner.bucket, evicted, "Evicted expired records");
                    }
                }
            }
        }

        tracing::debug!(bucket = %self.inner.bucket, "Watcher stopped");
    }
}
