use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CentrumError, ErrorKind, Result};
use crate::events::EventType;
use crate::geo::GeoRegistry;
use crate::kv::{ChangeOrigin, JobIndex, KvError, KvResult, KvStore, Loader, StoreHooks};
use crate::model::dispatch::{
    Dispatch, DispatchAssignment, DispatchAttribute, DispatchReference, DispatchStatus,
    DispatchStatusInput, DispatchStatusKind,
};
use crate::model::unit::{UnitStatusInput, UnitStatusKind};
use crate::ports::DispatchRepository;
use crate::store::settings::SettingsStore;
use crate::store::units::UnitStore;
use crate::store::{record_key, StoreContext};

/// A unit's answer to an offered dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TakeResponse {
    Accept,
    Decline,
}

/// Result of a batch take: dispatches that were processed and per-id failures.
#[derive(Debug, Default)]
pub struct TakeOutcome {
    pub dispatches: Vec<Dispatch>,
    pub failures: Vec<(u64, CentrumError)>,
}

struct DispatchStoreInner {
    ctx: StoreContext,
    repo: Arc<dyn DispatchRepository>,
    dispatches: KvStore<Dispatch>,
    index: JobIndex,
    geo: Arc<GeoRegistry>,
    units: UnitStore,
    settings: SettingsStore,
}

/// Live dispatch state for one replica.
#[derive(Clone)]
pub struct DispatchStore {
    inner: Arc<DispatchStoreInner>,
}

impl DispatchStore {
    pub fn new(
        ctx: StoreContext,
        repo: Arc<dyn DispatchRepository>,
        geo: Arc<GeoRegistry>,
        units: UnitStore,
        settings: SettingsStore,
    ) -> Self {
        let dispatches =
            KvStore::new("dispatches", ctx.replica, ctx.backend.clone(), ctx.kv.clone());
        let index = JobIndex::new(
            "dispatches_index",
            ctx.replica,
            ctx.backend.clone(),
            ctx.kv.clone(),
        );

        dispatches.add_hooks(Arc::new(DispatchHooks {
            index: index.clone(),
            geo: geo.clone(),
        }));
        dispatches.set_loader(Arc::new(DispatchLoader {
            repo: repo.clone(),
            units: units.clone(),
        }));

        Self {
            inner: Arc::new(DispatchStoreInner {
                ctx,
                repo,
                dispatches,
                index,
                geo,
                units,
                settings,
            }),
        }
    }

    pub fn dispatches(&self) -> &KvStore<Dispatch> {
        &self.inner.dispatches
    }

    pub fn index(&self) -> &JobIndex {
        &self.inner.index
    }

    pub fn geo(&self) -> &Arc<GeoRegistry> {
        &self.inner.geo
    }

    pub fn units(&self) -> &UnitStore {
        &self.inner.units
    }

    pub async fn get(&self, id: u64) -> Result<Dispatch> {
        self.inner
            .dispatches
            .get_or_load(&record_key(id))
            .await?
            .ok_or_else(|| CentrumError::dispatch_not_found(id))
    }

    pub async fn list(&self, jobs: &[String]) -> Vec<Dispatch> {
        self.filter(jobs, &[], &[], |_| true).await
    }

    /// Every dispatch held by this replica, ascending by id.
    pub async fn list_all(&self) -> Vec<Dispatch> {
        let mut dispatches = self.inner.dispatches.list().await;
        dispatches.sort_by_key(|d| d.id);
        dispatches
    }

    /// Dispatches visible to any of `jobs`, ascending by id. Empty `statuses`
    /// means any status.
    pub async fn filter<F>(
        &self,
        jobs: &[String],
        statuses: &[DispatchStatusKind],
        not_statuses: &[DispatchStatusKind],
        predicate: F,
    ) -> Vec<Dispatch>
    where
        F: Fn(&Dispatch) -> bool,
    {
        let mut ids = BTreeSet::new();
        for job in jobs {
            ids.extend(self.inner.index.ids(job).await);
        }

        let mut dispatches = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(dsp) = self.inner.dispatches.get(&record_key(id)).await else {
                continue;
            };
            let status = dsp.current_status();
            if !statuses.is_empty() && !statuses.contains(&status) {
                continue;
            }
            if not_statuses.contains(&status) || !predicate(&dsp) {
                continue;
            }
            dispatches.push(dsp);
        }
        dispatches
    }

    pub async fn create(&self, mut dsp: Dispatch) -> Result<Dispatch> {
        dsp.normalize_jobs();
        if dsp.jobs.is_empty() {
            return Err(CentrumError::NoJobsSpecified);
        }

        dsp.created_at = Utc::now();
        dsp.updated_at = None;
        dsp.status = None;
        dsp.units.clear();
        dsp.creator = match dsp.creator_id {
            Some(user_id) => self.inner.ctx.resolve_user(user_id).await,
            None => None,
        };

        dsp.id = self.inner.repo.insert_dispatch(&dsp).await?;
        let status = self
            .record_status(
                &dsp,
                DispatchStatusInput::new(DispatchStatusKind::New).with_user(dsp.creator_id),
            )
            .await?;
        dsp.status = Some(status);

        self.inner.dispatches.put(&record_key(dsp.id), dsp.clone()).await?;
        self.inner
            .ctx
            .bus
            .publish_dispatch(&dsp, EventType::Created)
            .await;

        tracing::info!(dispatch_id = dsp.id, jobs = ?dsp.jobs, "Dispatch created");
        Ok(dsp)
    }

    /// Update the descriptive fields of a dispatch.
    pub async fn update(&self, dsp: Dispatch) -> Result<Dispatch> {
        let mut merged = self.get(dsp.id).await?;
        merged.message = dsp.message.clone();
        merged.description = dsp.description.clone();
        merged.x = dsp.x;
        merged.y = dsp.y;
        merged.postal = dsp.postal.clone();
        merged.anon = dsp.anon;
        merged.updated_at = Some(Utc::now());
        self.inner.repo.update_dispatch(&merged).await?;

        let result = self
            .inner
            .dispatches
            .compute_update(&record_key(dsp.id), |existing| -> Result<(Dispatch, bool)> {
                let mut existing =
                    existing.ok_or_else(|| CentrumError::dispatch_not_found(dsp.id))?;
                existing.message = merged.message.clone();
                existing.description = merged.description.clone();
                existing.x = merged.x;
                existing.y = merged.y;
                existing.postal = merged.postal.clone();
                existing.anon = merged.anon;
                existing.updated_at = merged.updated_at;
                Ok((existing, true))
            })
            .await;
        let (updated, _) = match result {
            Ok(updated) => updated,
            Err(e) => {
                self.resync(dsp.id).await;
                return Err(e);
            }
        };

        self.inner
            .ctx
            .bus
            .publish_dispatch(&updated, EventType::Updated)
            .await;
        Ok(updated)
    }

    /// Record a status change. Returns `None` when a guard dropped it.
    pub async fn update_status(
        &self,
        dispatch_id: u64,
        input: DispatchStatusInput,
    ) -> Result<Option<DispatchStatus>> {
        let dsp = self.get(dispatch_id).await?;
        let current = dsp.current_status();

        if current.is_terminal() && input.status.is_dropped_when_terminal() {
            tracing::debug!(dispatch_id, status = %input.status, "Dispatch already terminal");
            return Ok(None);
        }
        if input.status.is_repeat_suppressed() && input.status == current {
            return Ok(None);
        }

        let status = self.record_status(&dsp, input).await?;

        let applied = status.clone();
        let result = self
            .inner
            .dispatches
            .compute_update(&record_key(dispatch_id), |existing| -> Result<(Dispatch, bool)> {
                let mut dsp =
                    existing.ok_or_else(|| CentrumError::dispatch_not_found(dispatch_id))?;
                if dsp.status.as_ref().is_some_and(|s| s.id >= applied.id) {
                    return Ok((dsp, false));
                }
                dsp.status = Some(applied.clone());
                dsp.updated_at = Some(applied.created_at);
                Ok((dsp, true))
            })
            .await;
        let updated = match result {
            Ok((updated, _)) => updated,
            Err(e) => {
                self.resync(dispatch_id).await;
                return Err(e);
            }
        };

        self.inner
            .ctx
            .bus
            .publish_dispatch(&updated, EventType::Status)
            .await;
        tracing::debug!(dispatch_id, status = %status.status, "Dispatch status updated");
        Ok(Some(status))
    }

    async fn record_status(
        &self,
        dsp: &Dispatch,
        input: DispatchStatusInput,
    ) -> Result<DispatchStatus> {
        let (x, y) = self.inner.ctx.user_position(input.user_id).await;
        let user = match input.user_id {
            Some(user_id) => self.inner.ctx.resolve_user(user_id).await,
            None => None,
        };

        let mut status = DispatchStatus {
            id: 0,
            created_at: Utc::now(),
            dispatch_id: dsp.id,
            status: input.status,
            reason: input.reason,
            code: input.code,
            unit_id: input.unit_id,
            user_id: input.user_id,
            user,
            x,
            y,
            postal: None,
        };
        status.id = self.inner.repo.insert_dispatch_status(&status).await?;
        Ok(status)
    }

    /// Add and remove assigned units.
    ///
    /// Units without members are never added, and terminal dispatches take no
    /// new units. `expires_at` of `None` makes the assignment permanent. The
    /// assignment rows are written before the live record; if either step
    /// fails the live record is rebuilt from the rows. A dispatch left without
    /// units falls back to UNASSIGNED unless it is terminal.
    pub async fn update_assignments(
        &self,
        dispatch_id: u64,
        to_add: &[u64],
        to_remove: &[u64],
        expires_at: Option<DateTime<Utc>>,
        user_id: Option<u64>,
    ) -> Result<Dispatch> {
        let dsp = self.get(dispatch_id).await?;
        let now = Utc::now();

        let mut adding: Vec<DispatchAssignment> = Vec::new();
        if !dsp.is_terminal() {
            for &unit_id in to_add {
                if dsp.has_unit(unit_id) || adding.iter().any(|a| a.unit_id == unit_id) {
                    continue;
                }
                let unit = match self.inner.units.get(unit_id).await {
                    Ok(unit) => unit,
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        tracing::debug!(dispatch_id, unit_id, "Skipping unknown unit");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if unit.is_empty() {
                    tracing::debug!(dispatch_id, unit_id, "Skipping unit without members");
                    continue;
                }
                adding.push(DispatchAssignment {
                    dispatch_id,
                    unit_id,
                    unit: Some(unit.snapshot()),
                    created_at: now,
                    expires_at,
                });
            }
        }

        let mut removing: Vec<u64> = to_remove
            .iter()
            .copied()
            .filter(|id| dsp.has_unit(*id))
            .collect();
        removing.sort_unstable();
        removing.dedup();

        // Units this call actually added or removed; a concurrent writer may
        // have applied part of the change first
        let mut added: Vec<u64> = Vec::new();
        let mut removed: Vec<u64> = Vec::new();
        if !adding.is_empty() || !removing.is_empty() {
            if let Err(e) = self.write_assignment_rows(&adding, dispatch_id, &removing).await {
                self.resync(dispatch_id).await;
                return Err(e);
            }

            let result = self
                .inner
                .dispatches
                .compute_update(&record_key(dispatch_id), |existing| -> Result<(Dispatch, bool)> {
                    added.clear();
                    removed.clear();
                    let mut dsp =
                        existing.ok_or_else(|| CentrumError::dispatch_not_found(dispatch_id))?;
                    removed.extend(
                        dsp.units
                            .iter()
                            .map(|a| a.unit_id)
                            .filter(|id| removing.contains(id)),
                    );
                    dsp.units.retain(|a| !removing.contains(&a.unit_id));
                    for assignment in &adding {
                        if !dsp.has_unit(assignment.unit_id) {
                            dsp.units.push(assignment.clone());
                            added.push(assignment.unit_id);
                        }
                    }
                    let changed = !added.is_empty() || !removed.is_empty();
                    if changed {
                        dsp.updated_at = Some(Utc::now());
                    }
                    Ok((dsp, changed))
                })
                .await;
            if let Err(e) = result {
                self.resync(dispatch_id).await;
                return Err(e);
            }

            for &unit_id in &added {
                self.update_status(
                    dispatch_id,
                    DispatchStatusInput::new(DispatchStatusKind::UnitAssigned)
                        .with_unit(unit_id)
                        .with_user(user_id),
                )
                .await?;
            }
            for &unit_id in &removed {
                self.update_status(
                    dispatch_id,
                    DispatchStatusInput::new(DispatchStatusKind::UnitUnassigned)
                        .with_unit(unit_id)
                        .with_user(user_id),
                )
                .await?;
            }
        }

        let dsp = self.ensure_unassigned(dispatch_id, user_id).await?;
        if !added.is_empty() || !removed.is_empty() {
            self.inner
                .ctx
                .bus
                .publish_dispatch(&dsp, EventType::Updated)
                .await;
            tracing::debug!(
                dispatch_id,
                added = added.len(),
                removed = removed.len(),
                "Dispatch assignments updated"
            );
        }
        Ok(dsp)
    }

    async fn write_assignment_rows(
        &self,
        adding: &[DispatchAssignment],
        dispatch_id: u64,
        removing: &[u64],
    ) -> Result<()> {
        for assignment in adding {
            self.inner
                .repo
                .insert_assignment(assignment)
                .await
                .map_err(|e| {
                    CentrumError::backing(
                        format!(
                            "insert assignment dispatch={dispatch_id} unit={}",
                            assignment.unit_id
                        ),
                        e,
                    )
                })?;
        }
        for &unit_id in removing {
            self.inner
                .repo
                .delete_assignment(dispatch_id, unit_id)
                .await
                .map_err(|e| {
                    CentrumError::backing(
                        format!("delete assignment dispatch={dispatch_id} unit={unit_id}"),
                        e,
                    )
                })?;
        }
        Ok(())
    }

    /// Force UNASSIGNED on a non-terminal dispatch that has no units left.
    async fn ensure_unassigned(&self, dispatch_id: u64, user_id: Option<u64>) -> Result<Dispatch> {
        let dsp = self.get(dispatch_id).await?;
        if dsp.units.is_empty()
            && !dsp.is_terminal()
            && dsp.current_status() != DispatchStatusKind::Unassigned
        {
            self.update_status(
                dispatch_id,
                DispatchStatusInput::new(DispatchStatusKind::Unassigned).with_user(user_id),
            )
            .await?;
            return self.get(dispatch_id).await;
        }
        Ok(dsp)
    }

    /// A unit accepts or declines dispatches offered to it.
    ///
    /// Fails as a whole only for central-command jobs and storage failures;
    /// terminal or unknown dispatches are reported per id in the outcome.
    pub async fn take_dispatch(
        &self,
        job: &str,
        unit_id: u64,
        dispatch_ids: &[u64],
        response: TakeResponse,
        user_id: Option<u64>,
    ) -> Result<TakeOutcome> {
        let settings = self.inner.settings.get(job).await;
        if settings.is_central_command() {
            return Err(CentrumError::ModeForbidsAction(job.to_string()));
        }
        self.inner.units.get_for_job(job, unit_id).await?;

        let mut outcome = TakeOutcome::default();
        for &dispatch_id in dispatch_ids {
            match self.take_one(job, unit_id, dispatch_id, response, user_id).await {
                Ok(dsp) => outcome.dispatches.push(dsp),
                Err(e) if e.kind() == ErrorKind::BackingStoreFailure => return Err(e),
                Err(e) => {
                    tracing::debug!(dispatch_id, unit_id, error = %e, "Take rejected");
                    outcome.failures.push((dispatch_id, e));
                }
            }
        }
        Ok(outcome)
    }

    async fn take_one(
        &self,
        job: &str,
        unit_id: u64,
        dispatch_id: u64,
        response: TakeResponse,
        user_id: Option<u64>,
    ) -> Result<Dispatch> {
        let dsp = self.get(dispatch_id).await?;
        if !dsp.is_visible_to(job) {
            return Err(CentrumError::dispatch_not_found(dispatch_id));
        }
        if dsp.is_terminal() {
            return Err(CentrumError::AlreadyCompleted(dispatch_id));
        }

        match response {
            TakeResponse::Accept => {
                let confirmed = self.confirm_assignment(&dsp, unit_id).await?;
                self.update_status(
                    dispatch_id,
                    DispatchStatusInput::new(DispatchStatusKind::UnitAccepted)
                        .with_unit(unit_id)
                        .with_user(user_id),
                )
                .await?;
                if confirmed {
                    self.inner
                        .units
                        .update_status(
                            unit_id,
                            UnitStatusInput::new(UnitStatusKind::Busy).with_creator(user_id),
                        )
                        .await?;
                }
            }
            TakeResponse::Decline => {
                if dsp.has_unit(unit_id) {
                    self.write_assignment_rows(&[], dispatch_id, &[unit_id]).await?;
                    let result = self
                        .inner
                        .dispatches
                        .compute_update(
                            &record_key(dispatch_id),
                            |existing| -> Result<(Dispatch, bool)> {
                                let mut dsp = existing
                                    .ok_or_else(|| CentrumError::dispatch_not_found(dispatch_id))?;
                                let before = dsp.units.len();
                                dsp.units.retain(|a| a.unit_id != unit_id);
                                Ok((dsp.clone(), dsp.units.len() != before))
                            },
                        )
                        .await;
                    if let Err(e) = result {
                        self.resync(dispatch_id).await;
                        return Err(e);
                    }
                }
                self.update_status(
                    dispatch_id,
                    DispatchStatusInput::new(DispatchStatusKind::UnitDeclined)
                        .with_unit(unit_id)
                        .with_user(user_id),
                )
                .await?;
            }
        }

        let dsp = self.ensure_unassigned(dispatch_id, user_id).await?;
        self.inner
            .ctx
            .bus
            .publish_dispatch(&dsp, EventType::Updated)
            .await;
        Ok(dsp)
    }

    /// Add the unit without expiry or clear its pending expiry. Returns whether
    /// the confirmation is new.
    async fn confirm_assignment(&self, dsp: &Dispatch, unit_id: u64) -> Result<bool> {
        let dispatch_id = dsp.id;
        match dsp.assignment(unit_id) {
            Some(assignment) if !assignment.is_pending() => return Ok(false),
            Some(_) => {
                self.inner
                    .repo
                    .update_assignment_expiry(dispatch_id, unit_id, None)
                    .await
                    .map_err(|e| {
                        CentrumError::backing(
                            format!("confirm assignment dispatch={dispatch_id} unit={unit_id}"),
                            e,
                        )
                    })?;
            }
            None => {
                let unit = self.inner.units.get(unit_id).await?;
                let assignment = DispatchAssignment {
                    dispatch_id,
                    unit_id,
                    unit: Some(unit.snapshot()),
                    created_at: Utc::now(),
                    expires_at: None,
                };
                self.write_assignment_rows(std::slice::from_ref(&assignment), dispatch_id, &[])
                    .await?;
            }
        }

        let snapshot = match self.inner.units.get(unit_id).await {
            Ok(unit) => Some(unit.snapshot()),
            Err(_) => None,
        };
        let result = self
            .inner
            .dispatches
            .compute_update(&record_key(dispatch_id), |existing| -> Result<(Dispatch, bool)> {
                let mut dsp =
                    existing.ok_or_else(|| CentrumError::dispatch_not_found(dispatch_id))?;
                match dsp.units.iter_mut().find(|a| a.unit_id == unit_id) {
                    Some(assignment) if assignment.expires_at.is_none() => return Ok((dsp, false)),
                    Some(assignment) => assignment.expires_at = None,
                    None => dsp.units.push(DispatchAssignment {
                        dispatch_id,
                        unit_id,
                        unit: snapshot.clone(),
                        created_at: Utc::now(),
                        expires_at: None,
                    }),
                }
                dsp.updated_at = Some(Utc::now());
                Ok((dsp, true))
            })
            .await;
        match result {
            Ok((_, written)) => Ok(written),
            Err(e) => {
                self.resync(dispatch_id).await;
                Err(e)
            }
        }
    }

    /// Add an attribute. Returns `false` without writing if it was present.
    pub async fn add_attribute(
        &self,
        dispatch_id: u64,
        attribute: DispatchAttribute,
    ) -> Result<bool> {
        let dsp = self.get(dispatch_id).await?;
        if dsp.attributes.contains(&attribute) {
            return Ok(false);
        }
        let mut durable = dsp;
        durable.attributes.insert(attribute);
        self.inner.repo.update_dispatch(&durable).await?;

        let (updated, written) = self
            .inner
            .dispatches
            .compute_update(&record_key(dispatch_id), |existing| -> Result<(Dispatch, bool)> {
                let mut dsp =
                    existing.ok_or_else(|| CentrumError::dispatch_not_found(dispatch_id))?;
                let inserted = dsp.attributes.insert(attribute);
                Ok((dsp, inserted))
            })
            .await?;
        if written {
            self.inner
                .ctx
                .bus
                .publish_dispatch(&updated, EventType::Updated)
                .await;
        }
        Ok(written)
    }

    /// Add references that are not present yet. Returns whether anything was written.
    pub async fn add_references(
        &self,
        dispatch_id: u64,
        references: &[DispatchReference],
    ) -> Result<bool> {
        let dsp = self.get(dispatch_id).await?;
        let missing: Vec<DispatchReference> = references
            .iter()
            .filter(|r| !dsp.references.contains(r))
            .copied()
            .collect();
        if missing.is_empty() {
            return Ok(false);
        }
        let mut durable = dsp;
        durable.references.extend(missing.iter().copied());
        self.inner.repo.update_dispatch(&durable).await?;

        let (updated, written) = self
            .inner
            .dispatches
            .compute_update(&record_key(dispatch_id), |existing| -> Result<(Dispatch, bool)> {
                let mut dsp =
                    existing.ok_or_else(|| CentrumError::dispatch_not_found(dispatch_id))?;
                let mut changed = false;
                for reference in &missing {
                    if !dsp.references.contains(reference) {
                        dsp.references.push(*reference);
                        changed = true;
                    }
                }
                Ok((dsp, changed))
            })
            .await?;
        if written {
            self.inner
                .ctx
                .bus
                .publish_dispatch(&updated, EventType::Updated)
                .await;
        }
        Ok(written)
    }

    /// Remove a dispatch from durable storage and the live store.
    pub async fn delete(&self, dispatch_id: u64) -> Result<()> {
        let dsp = self.get(dispatch_id).await?;
        self.inner.repo.delete_dispatch(dispatch_id).await?;
        self.remove_live(&dsp).await?;
        tracing::info!(dispatch_id, "Dispatch deleted");
        Ok(())
    }

    /// Drop a dispatch from the live store only; its history stays durable.
    pub async fn purge(&self, dispatch_id: u64) -> Result<()> {
        let dsp = self.get(dispatch_id).await?;
        self.remove_live(&dsp).await
    }

    async fn remove_live(&self, dsp: &Dispatch) -> Result<()> {
        self.inner.dispatches.delete(&record_key(dsp.id)).await?;
        self.inner
            .ctx
            .bus
            .publish_dispatch(dsp, EventType::Deleted)
            .await;
        Ok(())
    }

    /// Seed the live store with non-terminal dispatches created since `since`.
    pub async fn load_from_repository(&self, since: DateTime<Utc>) -> Result<usize> {
        let mut count = 0;
        for dsp in self.inner.repo.list_dispatches(since).await? {
            let dsp = hydrate_dispatch(self.inner.repo.as_ref(), &self.inner.units, dsp)
                .await
                .map_err(|e| CentrumError::backing("load dispatches", e))?;
            if dsp.is_terminal() {
                continue;
            }
            self.inner.dispatches.put(&record_key(dsp.id), dsp).await?;
            count += 1;
        }
        tracing::info!(count, "Loaded dispatches");
        Ok(count)
    }

    /// Rebuild the live record from durable storage after a failed update.
    async fn resync(&self, dispatch_id: u64) {
        let result = async {
            match self.inner.repo.get_dispatch(dispatch_id).await? {
                Some(dsp) => {
                    let dsp = hydrate_dispatch(self.inner.repo.as_ref(), &self.inner.units, dsp)
                        .await
                        .map_err(|e| CentrumError::backing("resync dispatch", e))?;
                    self.inner.dispatches.put(&record_key(dispatch_id), dsp).await?;
                }
                None => {
                    self.inner.dispatches.delete(&record_key(dispatch_id)).await?;
                }
            }
            Ok::<(), CentrumError>(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(dispatch_id, error = %e, "Failed to resync dispatch from repository");
        }
    }
}

/// Fill in the current status and assignments from durable storage.
async fn hydrate_dispatch(
    repo: &dyn DispatchRepository,
    units: &UnitStore,
    mut dsp: Dispatch,
) -> KvResult<Dispatch> {
    dsp.normalize_jobs();
    dsp.status = repo
        .latest_dispatch_status(dsp.id)
        .await
        .map_err(|e| KvError::Backend(e.to_string()))?;

    let rows = repo
        .list_assignments(dsp.id)
        .await
        .map_err(|e| KvError::Backend(e.to_string()))?;
    let mut assignments = Vec::with_capacity(rows.len());
    for mut row in rows {
        row.unit = units.get(row.unit_id).await.ok().map(|u| u.snapshot());
        assignments.push(row);
    }
    dsp.units = assignments;
    Ok(dsp)
}

struct DispatchLoader {
    repo: Arc<dyn DispatchRepository>,
    units: UnitStore,
}

#[async_trait]
impl Loader<Dispatch> for DispatchLoader {
    async fn load(&self, key: &str) -> KvResult<Option<Dispatch>> {
        let Ok(id) = key.parse::<u64>() else {
            return Ok(None);
        };
        let dsp = self
            .repo
            .get_dispatch(id)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        match dsp {
            Some(dsp) => hydrate_dispatch(self.repo.as_ref(), &self.units, dsp)
                .await
                .map(Some),
            None => Ok(None),
        }
    }
}

/// Mirrors dispatches into the geo index on every replica and into the job
/// index on the committing one.
struct DispatchHooks {
    index: JobIndex,
    geo: Arc<GeoRegistry>,
}

#[async_trait]
impl StoreHooks<Dispatch> for DispatchHooks {
    async fn on_updated(
        &self,
        _key: &str,
        previous: Option<&Dispatch>,
        current: &Dispatch,
        origin: ChangeOrigin,
    ) {
        let dropped_jobs: Vec<String> = previous
            .map(|p| {
                p.jobs
                    .iter()
                    .filter(|j| !current.jobs.contains(j))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if !dropped_jobs.is_empty() {
            self.geo.remove_dispatch(current.id, &dropped_jobs).await;
        }
        self.geo.upsert_dispatch(current).await;

        if origin != ChangeOrigin::Local {
            return;
        }
        for job in &dropped_jobs {
            if let Err(e) = self.index.remove(job, current.id).await {
                tracing::warn!(dispatch_id = current.id, job = %job, error = %e, "Failed to drop dispatch index entry");
            }
        }
        for job in &current.jobs {
            if let Err(e) = self.index.add(job, current.id).await {
                tracing::warn!(dispatch_id = current.id, job = %job, error = %e, "Failed to index dispatch");
            }
        }
    }

    async fn on_deleted(&self, _key: &str, previous: Option<&Dispatch>, origin: ChangeOrigin) {
        let Some(dsp) = previous else {
            return;
        };
        self.geo.remove_dispatch(dsp.id, &dsp.jobs).await;

        if origin != ChangeOrigin::Local {
            return;
        }
        for job in &dsp.jobs {
            if let Err(e) = self.index.remove(job, dsp.id).await {
                tracing::warn!(dispatch_id = dsp.id, job = %job, error = %e, "Failed to drop dispatch index entry");
            }
        }
    }
}
