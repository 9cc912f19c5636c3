pub mod quadtree;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::config::GeoConfig;
use crate::model::dispatch::{Dispatch, DispatchAttribute};

pub use quadtree::{Bounds, Positioned, Quadtree};

/// Location mirror of a dispatch kept in the per-job index.
///
/// Never authoritative: the dispatch store refreshes it from its update hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPoint {
    pub id: u64,
    pub x: f64,
    pub y: f64,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    /// Already tagged MULTIPLE or DUPLICATE.
    pub flagged: bool,
}

impl DispatchPoint {
    pub fn from_dispatch(dsp: &Dispatch) -> Self {
        Self {
            id: dsp.id,
            x: dsp.x,
            y: dsp.y,
            created_at: dsp.created_at,
            active: !dsp.is_terminal(),
            flagged: dsp.attributes.contains(&DispatchAttribute::Multiple)
                || dsp.attributes.contains(&DispatchAttribute::Duplicate),
        }
    }
}

impl Positioned for DispatchPoint {
    fn id(&self) -> u64 {
        self.id
    }

    fn position(&self) -> (f64, f64) {
        (self.x, self.y)
    }
}

/// Quadtree of dispatch locations for a single job.
#[derive(Debug)]
pub struct JobGeoIndex {
    job: String,
    tree: RwLock<Quadtree<DispatchPoint>>,
}

impl JobGeoIndex {
    pub fn new(job: impl Into<String>, config: &GeoConfig) -> Self {
        Self {
            job: job.into(),
            tree: RwLock::new(Quadtree::new(
                config.bounds,
                config.node_capacity,
                config.max_depth,
            )),
        }
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub async fn upsert(&self, point: DispatchPoint) {
        self.tree.write().await.insert(point);
    }

    pub async fn remove(&self, id: u64) -> bool {
        self.tree.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.tree.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tree.read().await.is_empty()
    }

    pub async fn points(&self) -> Vec<DispatchPoint> {
        self.tree.read().await.items().into_iter().cloned().collect()
    }

    pub async fn k_nearest<F>(
        &self,
        x: f64,
        y: f64,
        k: usize,
        max_distance: f64,
        filter: F,
    ) -> Vec<DispatchPoint>
    where
        F: Fn(&DispatchPoint) -> bool,
    {
        self.tree
            .read()
            .await
            .k_nearest(x, y, k, max_distance, filter)
            .into_iter()
            .cloned()
            .collect()
    }
}

/// Registry of per-job geospatial indexes, created lazily.
#[derive(Debug)]
pub struct GeoRegistry {
    config: GeoConfig,
    indexes: RwLock<HashMap<String, Arc<JobGeoIndex>>>,
}

impl GeoRegistry {
    pub fn new(config: GeoConfig) -> Self {
        Self {
            config,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, job: &str) -> Option<Arc<JobGeoIndex>> {
        self.indexes.read().await.get(job).cloned()
    }

    pub async fn get_or_create(&self, job: &str) -> Arc<JobGeoIndex> {
        if let Some(idx) = self.get(job).await {
            return idx;
        }
        let mut indexes = self.indexes.write().await;
        indexes
            .entry(job.to_string())
            .or_insert_with(|| Arc::new(JobGeoIndex::new(job, &self.config)))
            .clone()
    }

    /// Jobs that currently have a non-empty index.
    pub async fn active_jobs(&self) -> Vec<String> {
        let indexes: Vec<Arc<JobGeoIndex>> = self.indexes.read().await.values().cloned().collect();
        let mut jobs = Vec::new();
        for idx in indexes {
            if !idx.is_empty().await {
                jobs.push(idx.job().to_string());
            }
        }
        jobs.sort();
        jobs
    }

    /// Mirror a dispatch into the index of every job that can see it.
    pub async fn upsert_dispatch(&self, dsp: &Dispatch) {
        let point = DispatchPoint::from_dispatch(dsp);
        for job in &dsp.jobs {
            self.get_or_create(job).await.upsert(point.clone()).await;
        }
    }

    pub async fn remove_dispatch(&self, id: u64, jobs: &[String]) {
        for job in jobs {
            if let Some(idx) = self.get(job).await {
                idx.remove(id).await;
            }
        }
    }
}
