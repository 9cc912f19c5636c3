use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{CentrumError, ErrorKind, Result};
use crate::events::{EventType, Topic};
use crate::kv::{ChangeOrigin, JobIndex, KvError, KvResult, KvStore, Loader, StoreHooks};
use crate::model::access::{AccessLevel, UnitAccess};
use crate::model::unit::{
    Unit, UnitAssignment, UnitAttribute, UnitStatus, UnitStatusInput, UnitStatusKind,
    UserUnitMapping,
};
use crate::model::user::UserInfo;
use crate::ports::{AccessGate, RepositoryResult, UnitRepository};
use crate::store::{age, record_key, StoreContext};

/// Identical availability statuses within this window are dropped.
const STATUS_REPEAT_WINDOW: Duration = Duration::from_secs(2 * 60);

struct UnitStoreInner {
    ctx: StoreContext,
    repo: Arc<dyn UnitRepository>,
    units: KvStore<Unit>,
    index: JobIndex,
    mappings: KvStore<UserUnitMapping>,
    gate: Arc<dyn AccessGate>,
}

/// Live unit state for one replica.
#[derive(Clone)]
pub struct UnitStore {
    inner: Arc<UnitStoreInner>,
}

impl UnitStore {
    pub fn new(ctx: StoreContext, repo: Arc<dyn UnitRepository>) -> Self {
        Self::build(ctx, repo, None)
    }

    /// Use `gate` instead of the unit's own access lists for join checks.
    pub fn with_access_gate(
        ctx: StoreContext,
        repo: Arc<dyn UnitRepository>,
        gate: Arc<dyn AccessGate>,
    ) -> Self {
        Self::build(ctx, repo, Some(gate))
    }

    fn build(
        ctx: StoreContext,
        repo: Arc<dyn UnitRepository>,
        gate: Option<Arc<dyn AccessGate>>,
    ) -> Self {
        let units = KvStore::new("units", ctx.replica, ctx.backend.clone(), ctx.kv.clone());
        let index = JobIndex::new("units_index", ctx.replica, ctx.backend.clone(), ctx.kv.clone());
        let mappings = KvStore::new(
            "user_unit_mappings",
            ctx.replica,
            ctx.backend.clone(),
            ctx.kv.clone(),
        );

        units.add_hooks(Arc::new(UnitIndexHooks {
            index: index.clone(),
        }));
        units.set_loader(Arc::new(UnitLoader {
            ctx: ctx.clone(),
            repo: repo.clone(),
        }));

        let gate = gate.unwrap_or_else(|| Arc::new(UnitAccessGate::new(units.clone())));

        Self {
            inner: Arc::new(UnitStoreInner {
                ctx,
                repo,
                units,
                index,
                mappings,
                gate,
            }),
        }
    }

    pub fn units(&self) -> &KvStore<Unit> {
        &self.inner.units
    }

    pub fn index(&self) -> &JobIndex {
        &self.inner.index
    }

    pub fn mappings(&self) -> &KvStore<UserUnitMapping> {
        &self.inner.mappings
    }

    pub async fn get(&self, id: u64) -> Result<Unit> {
        self.inner
            .units
            .get_or_load(&record_key(id))
            .await?
            .ok_or_else(|| CentrumError::unit_not_found(id))
    }

    /// Unit `id` if it belongs to `job`.
    pub async fn get_for_job(&self, job: &str, id: u64) -> Result<Unit> {
        let unit = self.get(id).await?;
        if unit.job != job {
            return Err(CentrumError::unit_not_found(id));
        }
        Ok(unit)
    }

    pub async fn list(&self, jobs: &[String]) -> Vec<Unit> {
        self.filter(jobs, &[], &[], |_| true).await
    }

    /// Units of `jobs`, optionally restricted to (or excluding) statuses.
    /// Empty `statuses` means any status.
    pub async fn filter<F>(
        &self,
        jobs: &[String],
        statuses: &[UnitStatusKind],
        not_statuses: &[UnitStatusKind],
        predicate: F,
    ) -> Vec<Unit>
    where
        F: Fn(&Unit) -> bool,
    {
        let mut units = Vec::new();
        for job in jobs {
            for id in self.inner.index.ids(job).await {
                let Some(unit) = self.inner.units.get(&record_key(id)).await else {
                    continue;
                };
                let status = unit.current_status();
                if !statuses.is_empty() && !statuses.contains(&status) {
                    continue;
                }
                if not_statuses.contains(&status) || !predicate(&unit) {
                    continue;
                }
                units.push(unit);
            }
        }
        units.sort_by_key(|u| u.id);
        units.dedup_by_key(|u| u.id);
        units
    }

    /// Units the bot may pick for `job`.
    pub async fn list_available(&self, job: &str) -> Vec<Unit> {
        self.filter(&[job.to_string()], &[UnitStatusKind::Available], &[], |u| {
            !u.attributes.contains(&UnitAttribute::NoDispatchAutoAssign)
        })
        .await
    }

    pub async fn create(&self, mut unit: Unit) -> Result<Unit> {
        unit.created_at = Utc::now();
        unit.updated_at = None;
        unit.users.clear();
        unit.status = None;
        let desired_access = std::mem::take(&mut unit.access);

        unit.id = self.inner.repo.insert_unit(&unit).await?;
        if !desired_access.is_empty() {
            let changes = UnitAccess::default().diff(unit.id, &desired_access);
            unit.access = self.inner.repo.update_unit_access(unit.id, &changes).await?;
        }

        let initial =
            UnitStatusInput::new(UnitStatusKind::Unavailable).with_creator(unit.creator_id);
        unit.status = Some(self.record_status(&unit, initial).await?);

        self.inner.units.put(&record_key(unit.id), unit.clone()).await?;
        self.inner
            .ctx
            .bus
            .publish(&unit.job, Topic::Unit, EventType::Created, &unit)
            .await;

        tracing::info!(unit_id = unit.id, job = %unit.job, name = %unit.name, "Unit created");
        Ok(unit)
    }

    /// Update descriptive fields and access lists. Members and status are
    /// left untouched.
    pub async fn update(&self, unit: Unit) -> Result<Unit> {
        let current = self.get(unit.id).await?;
        self.inner.repo.update_unit(&unit).await?;

        let changes = current.access.diff(unit.id, &unit.access);
        let access = if changes.is_empty() {
            current.access.clone()
        } else {
            self.inner
                .repo
                .update_unit_access(unit.id, &changes)
                .await?
        };

        let result = self
            .inner
            .units
            .compute_update(&record_key(unit.id), |existing| -> Result<(Unit, bool)> {
                let mut existing = existing.ok_or_else(|| CentrumError::unit_not_found(unit.id))?;
                existing.name = unit.name.clone();
                existing.initials = unit.initials.clone();
                existing.color = unit.color.clone();
                existing.description = unit.description.clone();
                existing.attributes = unit.attributes.clone();
                existing.home_postal = unit.home_postal.clone();
                existing.access = access.clone();
                existing.updated_at = Some(Utc::now());
                Ok((existing, true))
            })
            .await;
        let (updated, _) = match result {
            Ok(updated) => updated,
            Err(e) => {
                self.resync(unit.id).await;
                return Err(e);
            }
        };

        self.inner
            .ctx
            .bus
            .publish(&updated.job, Topic::Unit, EventType::Updated, &updated)
            .await;
        Ok(updated)
    }

    /// Record a status change. Returns `None` when a guard dropped it.
    pub async fn update_status(
        &self,
        unit_id: u64,
        input: UnitStatusInput,
    ) -> Result<Option<UnitStatus>> {
        let unit = self.get(unit_id).await?;

        if input.status.is_availability() {
            if unit.is_static() && !input.status.allowed_for_static() {
                tracing::debug!(unit_id, status = %input.status, "Status not allowed for static unit");
                return Ok(None);
            }
            if let Some(current) = &unit.status {
                if current.status == input.status
                    && age(current.created_at) < STATUS_REPEAT_WINDOW
                {
                    return Ok(None);
                }
            }
        }

        let status = self.record_status(&unit, input).await?;

        // Membership pseudo-events only go to history and the change bus
        if status.status.is_availability() {
            let applied = status.clone();
            let result = self
                .inner
                .units
                .compute_update(&record_key(unit_id), |existing| -> Result<(Unit, bool)> {
                    let mut unit = existing.ok_or_else(|| CentrumError::unit_not_found(unit_id))?;
                    if unit.status.as_ref().is_some_and(|s| s.id >= applied.id) {
                        return Ok((unit, false));
                    }
                    unit.status = Some(applied.clone());
                    Ok((unit, true))
                })
                .await;
            if let Err(e) = result {
                self.resync(unit_id).await;
                return Err(e);
            }
        }

        self.inner
            .ctx
            .bus
            .publish(&unit.job, Topic::Unit, EventType::Status, &status)
            .await;
        tracing::debug!(unit_id, status = %status.status, "Unit status updated");
        Ok(Some(status))
    }

    async fn record_status(&self, unit: &Unit, input: UnitStatusInput) -> Result<UnitStatus> {
        let (x, y) = self
            .inner
            .ctx
            .user_position(input.user_id.or(input.creator_id))
            .await;
        let user = match input.user_id {
            Some(user_id) => self.inner.ctx.resolve_user(user_id).await,
            None => None,
        };

        let mut status = UnitStatus {
            id: 0,
            created_at: Utc::now(),
            unit_id: unit.id,
            status: input.status,
            reason: input.reason,
            code: input.code,
            user_id: input.user_id,
            user,
            creator_id: input.creator_id,
            x,
            y,
            postal: None,
        };
        status.id = self.inner.repo.insert_unit_status(&status).await?;
        Ok(status)
    }

    /// Add and remove members of a unit.
    ///
    /// Off-duty users are skipped. A user joining this unit leaves whatever
    /// unit they were in before. The unit becomes AVAILABLE when it gains its
    /// first member and UNAVAILABLE when the last one leaves.
    pub async fn update_unit_assignments(
        &self,
        job: &str,
        unit_id: u64,
        to_add: &[u64],
        to_remove: &[u64],
        creator_id: Option<u64>,
    ) -> Result<Unit> {
        let unit = self.get_for_job(job, unit_id).await?;

        let mut removing: Vec<u64> = to_remove
            .iter()
            .copied()
            .filter(|id| unit.has_user(*id))
            .collect();
        removing.sort_unstable();
        removing.dedup();
        if !removing.is_empty() {
            self.remove_members(&unit, &removing, creator_id).await?;
        }

        let mut adding = Vec::new();
        for &user_id in to_add {
            let already_member = unit.has_user(user_id) && !removing.contains(&user_id);
            if adding.contains(&user_id) || already_member {
                continue;
            }
            if !self.inner.ctx.tracker.is_user_on_duty(user_id).await {
                tracing::debug!(unit_id, user_id, "Skipping off-duty user");
                continue;
            }
            if let Some(mapping) = self.user_mapping(user_id).await {
                if mapping.unit_id != unit_id {
                    self.leave_previous_unit(mapping.unit_id, user_id, creator_id)
                        .await?;
                }
            }
            adding.push(user_id);
        }
        if !adding.is_empty() {
            self.add_members(&unit, &adding, creator_id).await?;
        }

        let unit = self.settle_availability(unit_id, creator_id).await?;
        self.inner
            .ctx
            .bus
            .publish(&unit.job, Topic::Unit, EventType::Updated, &unit)
            .await;
        Ok(unit)
    }

    async fn leave_previous_unit(
        &self,
        unit_id: u64,
        user_id: u64,
        creator_id: Option<u64>,
    ) -> Result<()> {
        match self.get(unit_id).await {
            Ok(previous) if previous.has_user(user_id) => {
                self.remove_members(&previous, &[user_id], creator_id).await?;
                let previous = self.settle_availability(unit_id, creator_id).await?;
                self.inner
                    .ctx
                    .bus
                    .publish(&previous.job, Topic::Unit, EventType::Updated, &previous)
                    .await;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_members(
        &self,
        unit: &Unit,
        users: &[u64],
        creator_id: Option<u64>,
    ) -> Result<()> {
        for &user_id in users {
            self.inner.repo.delete_unit_user(unit.id, user_id).await?;
        }

        let result = self
            .inner
            .units
            .compute_update(&record_key(unit.id), |existing| -> Result<(Unit, bool)> {
                let mut unit = existing.ok_or_else(|| CentrumError::unit_not_found(unit.id))?;
                let before = unit.users.len();
                unit.users.retain(|a| !users.contains(&a.user_id));
                let changed = unit.users.len() != before;
                if changed {
                    unit.updated_at = Some(Utc::now());
                }
                Ok((unit, changed))
            })
            .await;
        if let Err(e) = result {
            self.resync(unit.id).await;
            return Err(e);
        }

        for &user_id in users {
            if self
                .user_mapping(user_id)
                .await
                .is_some_and(|m| m.unit_id == unit.id)
            {
                self.inner.mappings.delete(&record_key(user_id)).await?;
            }
            self.update_status(
                unit.id,
                UnitStatusInput::new(UnitStatusKind::UserRemoved)
                    .with_user(user_id)
                    .with_creator(creator_id),
            )
            .await?;
        }
        Ok(())
    }

    async fn add_members(&self, unit: &Unit, users: &[u64], creator_id: Option<u64>) -> Result<()> {
        for &user_id in users {
            self.inner.repo.insert_unit_user(unit.id, user_id).await?;
        }
        let profiles = self.inner.ctx.resolve_users(users).await;

        let result = self
            .inner
            .units
            .compute_update(&record_key(unit.id), |existing| -> Result<(Unit, bool)> {
                let mut unit = existing.ok_or_else(|| CentrumError::unit_not_found(unit.id))?;
                let mut changed = false;
                for &user_id in users {
                    if unit.has_user(user_id) {
                        continue;
                    }
                    unit.users.push(UnitAssignment {
                        unit_id: unit.id,
                        user_id,
                        user: profiles.iter().find(|p| p.user_id == user_id).cloned(),
                    });
                    changed = true;
                }
                if changed {
                    unit.updated_at = Some(Utc::now());
                }
                Ok((unit, changed))
            })
            .await;
        if let Err(e) = result {
            self.resync(unit.id).await;
            return Err(e);
        }

        for &user_id in users {
            self.inner
                .mappings
                .put(
                    &record_key(user_id),
                    UserUnitMapping {
                        user_id,
                        unit_id: unit.id,
                        job: unit.job.clone(),
                        created_at: Utc::now(),
                    },
                )
                .await?;
            self.update_status(
                unit.id,
                UnitStatusInput::new(UnitStatusKind::UserAdded)
                    .with_user(user_id)
                    .with_creator(creator_id),
            )
            .await?;
        }
        Ok(())
    }

    /// Flip availability after a membership change.
    async fn settle_availability(&self, unit_id: u64, creator_id: Option<u64>) -> Result<Unit> {
        let unit = self.get(unit_id).await?;
        let current = unit.current_status();
        let target = if unit.is_empty() && current != UnitStatusKind::Unavailable {
            Some(UnitStatusKind::Unavailable)
        } else if !unit.is_empty()
            && matches!(current, UnitStatusKind::Unavailable | UnitStatusKind::Unspecified)
        {
            Some(UnitStatusKind::Available)
        } else {
            None
        };

        match target {
            Some(status) => {
                self.update_status(unit_id, UnitStatusInput::new(status).with_creator(creator_id))
                    .await?;
                self.get(unit_id).await
            }
            None => Ok(unit),
        }
    }

    /// Join `user` to a unit after checking the unit's access gate and duty state.
    pub async fn join_unit(&self, job: &str, user: &UserInfo, unit_id: u64) -> Result<Unit> {
        self.get_for_job(job, unit_id).await?;

        if !self
            .inner
            .gate
            .can_user_access_target(unit_id, user, AccessLevel::Join)
            .await?
        {
            return Err(CentrumError::PermissionDenied(format!(
                "user {} may not join unit {}",
                user.user_id, unit_id
            )));
        }
        if !self.inner.ctx.tracker.is_user_on_duty(user.user_id).await {
            return Err(CentrumError::NotOnDuty(user.user_id));
        }

        self.update_unit_assignments(job, unit_id, &[user.user_id], &[], Some(user.user_id))
            .await
    }

    /// Remove a user from the unit of `job` they are in, if any.
    pub async fn leave_unit(&self, job: &str, user_id: u64) -> Result<Option<Unit>> {
        let Some(mapping) = self.user_mapping(user_id).await else {
            return Ok(None);
        };
        if mapping.job != job {
            return Ok(None);
        }

        match self
            .update_unit_assignments(job, mapping.unit_id, &[], &[user_id], Some(user_id))
            .await
        {
            Ok(unit) => Ok(Some(unit)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.remove_mapping(user_id).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&self, unit_id: u64) -> Result<()> {
        let unit = self.get(unit_id).await?;
        self.inner.repo.delete_unit(unit_id).await?;

        for user_id in unit.user_ids() {
            if self
                .user_mapping(user_id)
                .await
                .is_some_and(|m| m.unit_id == unit_id)
            {
                self.remove_mapping(user_id).await?;
            }
        }
        self.inner.units.delete(&record_key(unit_id)).await?;

        self.inner
            .ctx
            .bus
            .publish(&unit.job, Topic::Unit, EventType::Deleted, &unit)
            .await;
        tracing::info!(unit_id, job = %unit.job, "Unit deleted");
        Ok(())
    }

    pub async fn user_mapping(&self, user_id: u64) -> Option<UserUnitMapping> {
        self.inner.mappings.get(&record_key(user_id)).await
    }

    pub async fn list_mappings(&self) -> Vec<UserUnitMapping> {
        self.inner.mappings.list().await
    }

    pub async fn remove_mapping(&self, user_id: u64) -> Result<()> {
        self.inner.mappings.delete(&record_key(user_id)).await?;
        Ok(())
    }

    /// Seed the live store from durable storage. Returns the number of units.
    pub async fn load_from_repository(&self) -> Result<usize> {
        let count = self.seed().await?;
        tracing::info!(count, "Loaded units");
        Ok(count)
    }

    /// Re-put every durable unit, its members' mappings and its index entry.
    ///
    /// Units change rarely, so without this a staffed unit would outlive its
    /// record TTL and vanish from the live views. Units already evicted are
    /// restored.
    pub async fn refresh_from_repository(&self) -> Result<usize> {
        self.seed().await
    }

    async fn seed(&self) -> Result<usize> {
        let units = self.inner.repo.list_units().await?;
        let count = units.len();
        for unit in units {
            let unit = hydrate_unit(&self.inner.ctx, self.inner.repo.as_ref(), unit).await?;
            for user_id in unit.user_ids() {
                self.inner
                    .mappings
                    .put(
                        &record_key(user_id),
                        UserUnitMapping {
                            user_id,
                            unit_id: unit.id,
                            job: unit.job.clone(),
                            created_at: Utc::now(),
                        },
                    )
                    .await?;
            }
            self.inner.units.put(&record_key(unit.id), unit).await?;
        }
        Ok(count)
    }

    /// Rebuild a unit from durable storage after a failed in-memory update.
    async fn resync(&self, unit_id: u64) {
        let result = async {
            match self.inner.repo.get_unit(unit_id).await? {
                Some(unit) => {
                    let unit = hydrate_unit(&self.inner.ctx, self.inner.repo.as_ref(), unit).await?;
                    self.inner.units.put(&record_key(unit_id), unit).await?;
                }
                None => {
                    self.inner.units.delete(&record_key(unit_id)).await?;
                }
            }
            Ok::<(), CentrumError>(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(unit_id, error = %e, "Failed to resync unit from repository");
        }
    }
}

/// Fill in members and current status from durable storage.
async fn hydrate_unit(
    ctx: &StoreContext,
    repo: &dyn UnitRepository,
    mut unit: Unit,
) -> RepositoryResult<Unit> {
    let user_ids = repo.list_unit_users(unit.id).await?;
    let profiles = ctx.resolve_users(&user_ids).await;
    unit.users = user_ids
        .into_iter()
        .map(|user_id| UnitAssignment {
            unit_id: unit.id,
            user_id,
            user: profiles.iter().find(|p| p.user_id == user_id).cloned(),
        })
        .collect();
    unit.status = repo.latest_unit_status(unit.id).await?;
    Ok(unit)
}

struct UnitLoader {
    ctx: StoreContext,
    repo: Arc<dyn UnitRepository>,
}

#[async_trait]
impl Loader<Unit> for UnitLoader {
    async fn load(&self, key: &str) -> KvResult<Option<Unit>> {
        let Ok(id) = key.parse::<u64>() else {
            return Ok(None);
        };
        let unit = self
            .repo
            .get_unit(id)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        match unit {
            Some(unit) => hydrate_unit(&self.ctx, self.repo.as_ref(), unit)
                .await
                .map(Some)
                .map_err(|e| KvError::Backend(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Keeps the `job -> unit` index in step with the units bucket.
struct UnitIndexHooks {
    index: JobIndex,
}

#[async_trait]
impl StoreHooks<Unit> for UnitIndexHooks {
    async fn on_updated(
        &self,
        _key: &str,
        previous: Option<&Unit>,
        current: &Unit,
        origin: ChangeOrigin,
    ) {
        // The committing replica owns the index write
        if origin != ChangeOrigin::Local {
            return;
        }
        if let Some(previous) = previous.filter(|p| p.job != current.job) {
            if let Err(e) = self.index.remove(&previous.job, previous.id).await {
                tracing::warn!(unit_id = current.id, error = %e, "Failed to drop unit index entry");
            }
        }
        if let Err(e) = self.index.add(&current.job, current.id).await {
            tracing::warn!(unit_id = current.id, error = %e, "Failed to index unit");
        }
    }

    async fn on_deleted(&self, _key: &str, previous: Option<&Unit>, origin: ChangeOrigin) {
        if origin != ChangeOrigin::Local {
            return;
        }
        if let Some(unit) = previous {
            if let Err(e) = self.index.remove(&unit.job, unit.id).await {
                tracing::warn!(unit_id = unit.id, error = %e, "Failed to drop unit index entry");
            }
        }
    }
}

/// Join gate backed by the access lists stored on each unit.
///
/// Superusers and the unit's creator always pass.
pub struct UnitAccessGate {
    units: KvStore<Unit>,
}

impl UnitAccessGate {
    pub fn new(units: KvStore<Unit>) -> Self {
        Self { units }
    }
}

#[async_trait]
impl AccessGate for UnitAccessGate {
    async fn can_user_access_target(
        &self,
        target_id: u64,
        user: &UserInfo,
        required: AccessLevel,
    ) -> Result<bool> {
        let unit = self
            .units
            .get_or_load(&record_key(target_id))
            .await?
            .ok_or_else(|| CentrumError::unit_not_found(target_id))?;
        if user.superuser || unit.creator_id == Some(user.user_id) {
            return Ok(true);
        }
        Ok(unit.access.allows(user, required))
    }
}
