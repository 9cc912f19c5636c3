//! Duplicate detection over the per-job geo indexes.

use std::collections::HashSet;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::DedupConfig;
use crate::error::Result;
use crate::geo::DispatchPoint;
use crate::model::dispatch::{
    DispatchAttribute, DispatchReference, DispatchStatusInput, DispatchStatusKind, ReferenceType,
};
use crate::store::{to_chrono, DispatchStore};

const DUPLICATE_REASON: &str = "Duplicate dispatch";

/// Periodic sweep cancelling dispatches reported close to an earlier one.
pub struct DedupSweep {
    config: DedupConfig,
    dispatches: DispatchStore,
}

impl DedupSweep {
    pub fn new(config: DedupConfig, dispatches: DispatchStore) -> Self {
        Self { config, dispatches }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.run_pass().await;
                }
            }
        }
        tracing::debug!("Dedup sweep stopped");
    }

    /// One pass over every job with an active geo index. Returns the number of
    /// dispatches cancelled as duplicates.
    pub async fn run_pass(&self) -> usize {
        let geo = self.dispatches.geo();
        let cutoff = Utc::now() - to_chrono(self.config.window);
        let mut visited: HashSet<u64> = HashSet::new();
        let mut cancelled = 0;

        'jobs: for job in geo.active_jobs().await {
            let Some(index) = geo.get(&job).await else {
                continue;
            };
            let mut points = index.points().await;
            points.sort_by_key(|p| p.id);

            for source in points {
                if cancelled >= self.config.max_cancelled_per_pass {
                    break 'jobs;
                }
                if !source.active || !visited.insert(source.id) {
                    continue;
                }

                let matches: Vec<DispatchPoint> = index
                    .k_nearest(
                        source.x,
                        source.y,
                        self.config.k_nearest,
                        self.config.radius,
                        |p| {
                            p.id != source.id
                                && p.active
                                && !p.flagged
                                && p.created_at >= cutoff
                                && !visited.contains(&p.id)
                        },
                    )
                    .await;

                for dup in matches {
                    if cancelled >= self.config.max_cancelled_per_pass {
                        break 'jobs;
                    }
                    visited.insert(dup.id);
                    match self.mark_duplicate(source.id, dup.id).await {
                        Ok(()) => {
                            cancelled += 1;
                            tracing::info!(
                                job = %job,
                                dispatch_id = source.id,
                                duplicate_id = dup.id,
                                "Cancelled duplicate dispatch"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                job = %job,
                                dispatch_id = source.id,
                                duplicate_id = dup.id,
                                error = %e,
                                "Failed to mark duplicate dispatch"
                            );
                        }
                    }
                }
            }
        }

        if cancelled > 0 {
            tracing::debug!(cancelled, "Dedup pass finished");
        }
        cancelled
    }

    async fn mark_duplicate(&self, source_id: u64, dup_id: u64) -> Result<()> {
        let dispatches = &self.dispatches;

        dispatches
            .add_attribute(source_id, DispatchAttribute::Multiple)
            .await?;
        dispatches
            .add_references(
                source_id,
                &[DispatchReference::new(dup_id, ReferenceType::DuplicatedBy)],
            )
            .await?;

        dispatches
            .add_attribute(dup_id, DispatchAttribute::Duplicate)
            .await?;
        dispatches
            .add_references(
                dup_id,
                &[DispatchReference::new(source_id, ReferenceType::DuplicateOf)],
            )
            .await?;

        let dup = dispatches.get(dup_id).await?;
        let units = dup.unit_ids();
        if !units.is_empty() {
            dispatches
                .update_assignments(dup_id, &[], &units, None, None)
                .await?;
        }

        dispatches
            .update_status(
                dup_id,
                DispatchStatusInput::new(DispatchStatusKind::Cancelled)
                    .with_reason(DUPLICATE_REASON),
            )
            .await?;
        Ok(())
    }
}
