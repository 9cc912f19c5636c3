use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::KvConfig;
use crate::kv::backend::ReplicationBackend;
use crate::kv::store::KvStore;
use crate::kv::KvResult;

/// Pointer from a job to a record it can see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRef {
    pub job: String,
    pub id: u64,
    pub updated_at: DateTime<Utc>,
}

/// Secondary index `job -> record ids`, stored as one key per pair.
#[derive(Clone)]
pub struct JobIndex {
    store: KvStore<IndexRef>,
}

fn index_key(job: &str, id: u64) -> String {
    format!("{job}.{id}")
}

impl JobIndex {
    pub fn new(
        bucket: impl Into<String>,
        replica: Uuid,
        backend: Arc<dyn ReplicationBackend>,
        config: KvConfig,
    ) -> Self {
        Self {
            store: KvStore::new(bucket, replica, backend, config),
        }
    }

    pub fn store(&self) -> &KvStore<IndexRef> {
        &self.store
    }

    /// Create or refresh the entry, extending its TTL.
    pub async fn add(&self, job: &str, id: u64) -> KvResult<()> {
        self.store
            .put(
                &index_key(job, id),
                IndexRef {
                    job: job.to_string(),
                    id,
                    updated_at: Utc::now(),
                },
            )
            .await
    }

    pub async fn remove(&self, job: &str, id: u64) -> KvResult<()> {
        self.store.delete(&index_key(job, id)).await.map(|_| ())
    }

    pub async fn contains(&self, job: &str, id: u64) -> bool {
        self.store.get(&index_key(job, id)).await.is_some()
    }

    /// Record ids visible to `job`, ascending.
    pub async fn ids(&self, job: &str) -> Vec<u64> {
        let prefix = format!("{job}.");
        let mut ids: Vec<u64> = self
            .store
            .keys(&prefix)
            .await
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|id| id.parse().ok())
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryBackend;

    fn index() -> JobIndex {
        JobIndex::new(
            "dispatches_index",
            Uuid::new_v4(),
            Arc::new(MemoryBackend::new()),
            KvConfig::default(),
        )
    }

    #[tokio::test]
    async fn ids_are_scoped_per_job() {
        let idx = index();
        idx.add("police", 3).await.unwrap();
        idx.add("police", 1).await.unwrap();
        idx.add("ambulance", 2).await.unwrap();
        idx.add("police_reserve", 9).await.unwrap();

        assert_eq!(idx.ids("police").await, vec![1, 3]);
        assert_eq!(idx.ids("ambulance").await, vec![2]);

        idx.remove("police", 1).await.unwrap();
        assert_eq!(idx.ids("police").await, vec![3]);
        assert!(!idx.contains("police", 1).await);
    }

    #[tokio::test]
    async fn removing_absent_entry_is_ok() {
        let idx = index();
        idx.remove("police", 42).await.unwrap();
        assert!(idx.ids("police").await.is_empty());
    }
}
