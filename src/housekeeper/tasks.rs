use std::collections::BTreeMap;

use chrono::Utc;

use crate::error::{CentrumError, ErrorKind, Result};
use crate::housekeeper::Housekeeper;
use crate::model::dispatch::{DispatchAttribute, DispatchStatusInput, DispatchStatusKind};
use crate::model::unit::{UnitStatusInput, UnitStatusKind, UserUnitMapping};
use crate::store::{age, record_key, to_chrono};

const TOO_OLD_REASON: &str = "Dispatch too old";
const NO_MEMBERS_REASON: &str = "No members";

/// What one garbage collection run removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    pub dispatches_deleted: usize,
    pub dispatches_purged: usize,
    pub unit_statuses_deleted: usize,
    /// Records whose TTL ran out, dropped from the replication log.
    pub records_expired: usize,
}

impl GcReport {
    pub fn total(&self) -> usize {
        self.dispatches_deleted
            + self.dispatches_purged
            + self.unit_statuses_deleted
            + self.records_expired
    }
}

impl Housekeeper {
    /// Remove assignments whose confirmation deadline passed. Returns the
    /// number of removed assignments.
    pub async fn expire_assignments(&self) -> Result<usize> {
        let expired = self
            .dispatch_repo
            .expired_assignments(Utc::now())
            .await
            .map_err(|e| CentrumError::backing("list expired assignments", e))?;

        let mut by_dispatch: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for row in expired {
            by_dispatch.entry(row.dispatch_id).or_default().push(row.unit_id);
        }

        let mut removed = 0;
        for (dispatch_id, unit_ids) in by_dispatch {
            let dsp = match self.dispatches.get(dispatch_id).await {
                Ok(dsp) => dsp,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    for unit_id in unit_ids {
                        self.drop_assignment_row(dispatch_id, unit_id).await;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(dispatch_id, error = %e, "Failed to load dispatch with expired assignments");
                    continue;
                }
            };

            let (live, stray): (Vec<u64>, Vec<u64>) =
                unit_ids.into_iter().partition(|id| dsp.has_unit(*id));
            for unit_id in stray {
                self.drop_assignment_row(dispatch_id, unit_id).await;
            }
            if live.is_empty() {
                continue;
            }

            match self
                .dispatches
                .update_assignments(dispatch_id, &[], &live, None, None)
                .await
            {
                Ok(_) => {
                    removed += live.len();
                    tracing::info!(dispatch_id, units = ?live, "Expired unconfirmed assignments");
                }
                Err(e) => {
                    tracing::warn!(dispatch_id, error = %e, "Failed to expire assignments");
                }
            }
        }
        Ok(removed)
    }

    async fn drop_assignment_row(&self, dispatch_id: u64, unit_id: u64) {
        if let Err(e) = self.dispatch_repo.delete_assignment(dispatch_id, unit_id).await {
            tracing::warn!(dispatch_id, unit_id, error = %e, "Failed to delete orphaned assignment");
        }
    }

    /// Cancel open dispatches older than the stale age, oldest first.
    pub async fn cancel_stale_dispatches(&self) -> Result<usize> {
        let mut stale: Vec<_> = self
            .dispatches
            .list_all()
            .await
            .into_iter()
            .filter(|d| !d.is_terminal() && age(d.created_at) >= self.config.stale_dispatch_age)
            .collect();
        stale.sort_by_key(|d| (d.created_at, d.id));
        stale.truncate(self.config.stale_dispatch_limit);

        let mut cancelled = 0;
        for dsp in stale {
            let result = async {
                self.dispatches
                    .add_attribute(dsp.id, DispatchAttribute::TooOld)
                    .await?;
                self.dispatches
                    .update_status(
                        dsp.id,
                        DispatchStatusInput::new(DispatchStatusKind::Cancelled)
                            .with_reason(TOO_OLD_REASON),
                    )
                    .await
            }
            .await;
            match result {
                Ok(_) => cancelled += 1,
                Err(e) => tracing::warn!(dispatch_id = dsp.id, error = %e, "Failed to cancel stale dispatch"),
            }
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled stale dispatches");
        }
        Ok(cancelled)
    }

    /// Drop assigned units without members from open dispatches.
    pub async fn remove_empty_units_from_dispatches(&self) -> Result<usize> {
        let mut removed = 0;
        for dsp in self.dispatches.list_all().await {
            if dsp.is_terminal() || dsp.units.is_empty() {
                continue;
            }

            let mut empty = Vec::new();
            for unit_id in dsp.unit_ids() {
                match self.units.get(unit_id).await {
                    Ok(unit) if unit.is_empty() => empty.push(unit_id),
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => empty.push(unit_id),
                    Err(e) => tracing::warn!(dispatch_id = dsp.id, unit_id, error = %e, "Failed to load assigned unit"),
                }
            }
            if empty.is_empty() {
                continue;
            }

            match self
                .dispatches
                .update_assignments(dsp.id, &[], &empty, None, None)
                .await
            {
                Ok(_) => removed += empty.len(),
                Err(e) => tracing::warn!(dispatch_id = dsp.id, error = %e, "Failed to remove empty units"),
            }
        }
        Ok(removed)
    }

    /// Units without members are UNAVAILABLE; STATIC units are never AVAILABLE.
    pub async fn sanitize_unit_statuses(&self) -> Result<usize> {
        let mut changed = 0;
        for unit in self.units.units().list().await {
            let current = unit.current_status();
            let needs_reset = (unit.is_empty() && current != UnitStatusKind::Unavailable)
                || (unit.is_static() && current == UnitStatusKind::Available);
            if !needs_reset {
                continue;
            }

            let input = UnitStatusInput::new(UnitStatusKind::Unavailable);
            let input = if unit.is_empty() {
                input.with_reason(NO_MEMBERS_REASON)
            } else {
                input
            };
            match self.units.update_status(unit.id, input).await {
                Ok(Some(_)) => changed += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!(unit_id = unit.id, error = %e, "Failed to reset unit status"),
            }
        }
        Ok(changed)
    }

    /// Bring user -> unit mappings in line with unit membership and duty state.
    pub async fn reconcile_user_unit_mappings(&self) -> Result<usize> {
        let mut fixed = 0;

        for mapping in self.units.list_mappings().await {
            let member = match self.units.get(mapping.unit_id).await {
                Ok(unit) => unit.has_user(mapping.user_id),
                Err(e) if e.kind() == ErrorKind::NotFound => false,
                Err(e) => {
                    tracing::warn!(user_id = mapping.user_id, error = %e, "Failed to check unit mapping");
                    continue;
                }
            };

            let result = if !member {
                self.units.remove_mapping(mapping.user_id).await
            } else if !self.tracker.is_user_on_duty(mapping.user_id).await {
                self.units
                    .leave_unit(&mapping.job, mapping.user_id)
                    .await
                    .map(|_| ())
            } else {
                continue;
            };
            match result {
                Ok(()) => fixed += 1,
                Err(e) => tracing::warn!(user_id = mapping.user_id, error = %e, "Failed to fix unit mapping"),
            }
        }

        // Members whose mapping went missing
        for unit in self.units.units().list().await {
            for user_id in unit.user_ids() {
                if self.units.user_mapping(user_id).await.is_some() {
                    continue;
                }
                let mapping = UserUnitMapping {
                    user_id,
                    unit_id: unit.id,
                    job: unit.job.clone(),
                    created_at: Utc::now(),
                };
                match self.units.mappings().put(&record_key(user_id), mapping).await {
                    Ok(()) => fixed += 1,
                    Err(e) => tracing::warn!(user_id, unit_id = unit.id, error = %e, "Failed to restore unit mapping"),
                }
            }
        }
        Ok(fixed)
    }

    /// Keep live units and their index entries ahead of the record TTL.
    pub async fn refresh_units(&self) -> Result<usize> {
        self.units.refresh_from_repository().await
    }

    /// Apply durable retention, drop settled dispatches from the live store
    /// and purge expired records from the replication log.
    pub async fn collect_garbage(&self) -> Result<GcReport> {
        let cutoff = Utc::now() - to_chrono(self.config.retention);
        let mut report = GcReport {
            dispatches_deleted: self
                .dispatch_repo
                .delete_dispatches_older_than(cutoff)
                .await
                .map_err(|e| CentrumError::backing("delete old dispatches", e))?,
            unit_statuses_deleted: self
                .unit_repo
                .delete_unit_statuses_older_than(cutoff)
                .await
                .map_err(|e| CentrumError::backing("delete old unit statuses", e))?,
            ..Default::default()
        };

        for dsp in self.dispatches.list_all().await {
            let settled = dsp
                .status
                .as_ref()
                .filter(|s| s.status.is_terminal())
                .is_some_and(|s| age(s.created_at) >= self.config.terminal_purge_after);
            if !settled {
                continue;
            }
            match self.dispatches.purge(dsp.id).await {
                Ok(()) => report.dispatches_purged += 1,
                Err(e) => tracing::warn!(dispatch_id = dsp.id, error = %e, "Failed to purge dispatch"),
            }
        }

        // Replicas learn about purged records through their watchers
        report.records_expired = self
            .backend
            .purge_expired()
            .await
            .map_err(|e| CentrumError::backing("purge expired records", e))?;

        if report.total() > 0 {
            tracing::info!(
                dispatches_deleted = report.dispatches_deleted,
                dispatches_purged = report.dispatches_purged,
                unit_statuses_deleted = report.unit_statuses_deleted,
                records_expired = report.records_expired,
                "Garbage collected"
            );
        }
        Ok(report)
    }
}
