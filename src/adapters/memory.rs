//! In-memory implementations of the collaborator ports.
//!
//! Used by the tests and by the binary's single-process mode. State lives
//! behind tokio locks; `set_failing` makes every repository write fail so
//! callers' abort paths can be exercised.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::model::access::{AccessChanges, AccessEntry, UnitAccess, UnitAccessChanges};
use crate::model::dispatch::{Dispatch, DispatchAssignment, DispatchStatus};
use crate::model::settings::CentrumSettings;
use crate::model::unit::{Unit, UnitStatus};
use crate::model::user::{UserMarker, UserProfile};
use crate::ports::{
    CentrumRepository, DispatchRepository, DutyChange, EventPublisher, PublishError,
    RepositoryError, RepositoryResult, Tracker, UnitRepository, UserResolver,
};

const DUTY_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct RepositoryState {
    next_dispatch_id: u64,
    next_dispatch_status_id: u64,
    next_unit_id: u64,
    next_unit_status_id: u64,
    next_access_id: u64,
    dispatches: BTreeMap<u64, Dispatch>,
    dispatch_statuses: Vec<DispatchStatus>,
    assignments: BTreeMap<(u64, u64), DispatchAssignment>,
    units: BTreeMap<u64, StoredUnit>,
    unit_statuses: Vec<UnitStatus>,
    unit_users: BTreeSet<(u64, u64)>,
    settings: HashMap<String, CentrumSettings>,
    disponents: BTreeSet<(String, u64)>,
}

#[derive(Debug, Clone)]
struct StoredUnit {
    unit: Unit,
    deleted: bool,
}

/// Durable storage shared by every replica of a process or test.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<RepositoryState>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful write calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn begin_write(&self, op: &str) -> RepositoryResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepositoryError::Backend(format!("{op}: storage unavailable")));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub async fn dispatch_status_history(&self, dispatch_id: u64) -> Vec<DispatchStatus> {
        let state = self.state.lock().await;
        state
            .dispatch_statuses
            .iter()
            .filter(|s| s.dispatch_id == dispatch_id)
            .cloned()
            .collect()
    }

    pub async fn unit_status_history(&self, unit_id: u64) -> Vec<UnitStatus> {
        let state = self.state.lock().await;
        state
            .unit_statuses
            .iter()
            .filter(|s| s.unit_id == unit_id)
            .cloned()
            .collect()
    }

    /// Test helper: move a dispatch's creation time.
    pub async fn backdate_dispatch(&self, id: u64, created_at: DateTime<Utc>) {
        if let Some(dsp) = self.state.lock().await.dispatches.get_mut(&id) {
            dsp.created_at = created_at;
        }
    }
}

fn apply_access<T: AccessEntry>(list: &mut Vec<T>, changes: &AccessChanges<T>, next_id: &mut u64) {
    let deleted: BTreeSet<u64> = changes.to_delete.iter().map(|e| e.id()).collect();
    list.retain(|e| !deleted.contains(&e.id()));
    for updated in &changes.to_update {
        if let Some(existing) = list.iter_mut().find(|e| e.id() == updated.id()) {
            existing.set_access(updated.access());
        }
    }
    for created in &changes.to_create {
        *next_id += 1;
        let mut entry = created.clone();
        entry.set_id(*next_id);
        list.push(entry);
    }
}

#[async_trait]
impl DispatchRepository for MemoryRepository {
    async fn insert_dispatch(&self, dsp: &Dispatch) -> RepositoryResult<u64> {
        self.begin_write("insert_dispatch")?;
        let mut state = self.state.lock().await;
        state.next_dispatch_id += 1;
        let id = state.next_dispatch_id;
        let mut stored = dsp.clone();
        stored.id = id;
        stored.status = None;
        stored.units.clear();
        state.dispatches.insert(id, stored);
        Ok(id)
    }

    async fn update_dispatch(&self, dsp: &Dispatch) -> RepositoryResult<()> {
        self.begin_write("update_dispatch")?;
        let mut state = self.state.lock().await;
        let Some(stored) = state.dispatches.get_mut(&dsp.id) else {
            return Err(RepositoryError::NotFound {
                entity: "dispatch",
                id: dsp.id,
            });
        };
        let created_at = stored.created_at;
        *stored = dsp.clone();
        stored.created_at = created_at;
        stored.status = None;
        stored.units.clear();
        Ok(())
    }

    async fn delete_dispatch(&self, id: u64) -> RepositoryResult<()> {
        self.begin_write("delete_dispatch")?;
        let mut state = self.state.lock().await;
        state.dispatches.remove(&id);
        state.assignments.retain(|(dispatch_id, _), _| *dispatch_id != id);
        Ok(())
    }

    async fn get_dispatch(&self, id: u64) -> RepositoryResult<Option<Dispatch>> {
        Ok(self.state.lock().await.dispatches.get(&id).cloned())
    }

    async fn list_dispatches(&self, since: DateTime<Utc>) -> RepositoryResult<Vec<Dispatch>> {
        let state = self.state.lock().await;
        Ok(state
            .dispatches
            .values()
            .filter(|d| d.created_at >= since)
            .cloned()
            .collect())
    }

    async fn insert_dispatch_status(&self, status: &DispatchStatus) -> RepositoryResult<u64> {
        self.begin_write("insert_dispatch_status")?;
        let mut state = self.state.lock().await;
        state.next_dispatch_status_id += 1;
        let id = state.next_dispatch_status_id;
        let mut row = status.clone();
        row.id = id;
        state.dispatch_statuses.push(row);
        Ok(id)
    }

    async fn latest_dispatch_status(
        &self,
        dispatch_id: u64,
    ) -> RepositoryResult<Option<DispatchStatus>> {
        let state = self.state.lock().await;
        Ok(state
            .dispatch_statuses
            .iter()
            .filter(|s| s.dispatch_id == dispatch_id)
            .max_by_key(|s| s.id)
            .cloned())
    }

    async fn insert_assignment(&self, assignment: &DispatchAssignment) -> RepositoryResult<()> {
        self.begin_write("insert_assignment")?;
        let mut state = self.state.lock().await;
        let mut row = assignment.clone();
        row.unit = None;
        state
            .assignments
            .insert((assignment.dispatch_id, assignment.unit_id), row);
        Ok(())
    }

    async fn delete_assignment(&self, dispatch_id: u64, unit_id: u64) -> RepositoryResult<()> {
        self.begin_write("delete_assignment")?;
        self.state
            .lock()
            .await
            .assignments
            .remove(&(dispatch_id, unit_id));
        Ok(())
    }

    async fn update_assignment_expiry(
        &self,
        dispatch_id: u64,
        unit_id: u64,
        expires_at: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()> {
        self.begin_write("update_assignment_expiry")?;
        let mut state = self.state.lock().await;
        match state.assignments.get_mut(&(dispatch_id, unit_id)) {
            Some(row) => {
                row.expires_at = expires_at;
                Ok(())
            }
            None => Err(RepositoryError::NotFound {
                entity: "dispatch assignment",
                id: dispatch_id,
            }),
        }
    }

    async fn list_assignments(
        &self,
        dispatch_id: u64,
    ) -> RepositoryResult<Vec<DispatchAssignment>> {
        let state = self.state.lock().await;
        Ok(state
            .assignments
            .range((dispatch_id, 0)..=(dispatch_id, u64::MAX))
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn expired_assignments(
        &self,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Vec<DispatchAssignment>> {
        let state = self.state.lock().await;
        Ok(state
            .assignments
            .values()
            .filter(|a| a.is_expired(now))
            .cloned()
            .collect())
    }

    async fn delete_dispatches_older_than(&self, cutoff: DateTime<Utc>) -> RepositoryResult<usize> {
        self.begin_write("delete_dispatches_older_than")?;
        let mut state = self.state.lock().await;
        let old: Vec<u64> = state
            .dispatches
            .values()
            .filter(|d| d.created_at < cutoff)
            .map(|d| d.id)
            .collect();
        for id in &old {
            state.dispatches.remove(id);
        }
        state
            .assignments
            .retain(|(dispatch_id, _), _| !old.contains(dispatch_id));
        state
            .dispatch_statuses
            .retain(|s| !old.contains(&s.dispatch_id));
        Ok(old.len())
    }
}

#[async_trait]
impl UnitRepository for MemoryRepository {
    async fn insert_unit(&self, unit: &Unit) -> RepositoryResult<u64> {
        self.begin_write("insert_unit")?;
        let mut state = self.state.lock().await;
        state.next_unit_id += 1;
        let id = state.next_unit_id;
        let mut stored = unit.clone();
        stored.id = id;
        stored.status = None;
        stored.users.clear();
        stored.access = UnitAccess::default();
        state.units.insert(
            id,
            StoredUnit {
                unit: stored,
                deleted: false,
            },
        );
        Ok(id)
    }

    async fn update_unit(&self, unit: &Unit) -> RepositoryResult<()> {
        self.begin_write("update_unit")?;
        let mut state = self.state.lock().await;
        let Some(stored) = state.units.get_mut(&unit.id).filter(|s| !s.deleted) else {
            return Err(RepositoryError::NotFound {
                entity: "unit",
                id: unit.id,
            });
        };
        let access = std::mem::take(&mut stored.unit.access);
        stored.unit = unit.clone();
        stored.unit.access = access;
        stored.unit.status = None;
        stored.unit.users.clear();
        Ok(())
    }

    async fn delete_unit(&self, id: u64) -> RepositoryResult<()> {
        self.begin_write("delete_unit")?;
        let mut state = self.state.lock().await;
        if let Some(stored) = state.units.get_mut(&id) {
            stored.deleted = true;
        }
        state.unit_users.retain(|(unit_id, _)| *unit_id != id);
        Ok(())
    }

    async fn get_unit(&self, id: u64) -> RepositoryResult<Option<Unit>> {
        let state = self.state.lock().await;
        Ok(state
            .units
            .get(&id)
            .filter(|s| !s.deleted)
            .map(|s| s.unit.clone()))
    }

    async fn list_units(&self) -> RepositoryResult<Vec<Unit>> {
        let state = self.state.lock().await;
        Ok(state
            .units
            .values()
            .filter(|s| !s.deleted)
            .map(|s| s.unit.clone())
            .collect())
    }

    async fn insert_unit_status(&self, status: &UnitStatus) -> RepositoryResult<u64> {
        self.begin_write("insert_unit_status")?;
        let mut state = self.state.lock().await;
        state.next_unit_status_id += 1;
        let id = state.next_unit_status_id;
        let mut row = status.clone();
        row.id = id;
        state.unit_statuses.push(row);
        Ok(id)
    }

    async fn latest_unit_status(&self, unit_id: u64) -> RepositoryResult<Option<UnitStatus>> {
        let state = self.state.lock().await;
        Ok(state
            .unit_statuses
            .iter()
            .filter(|s| s.unit_id == unit_id && s.status.is_availability())
            .max_by_key(|s| s.id)
            .cloned())
    }

    async fn delete_unit_statuses_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> RepositoryResult<usize> {
        self.begin_write("delete_unit_statuses_older_than")?;
        let mut state = self.state.lock().await;
        let before = state.unit_statuses.len();
        state.unit_statuses.retain(|s| s.created_at >= cutoff);
        Ok(before - state.unit_statuses.len())
    }

    async fn insert_unit_user(&self, unit_id: u64, user_id: u64) -> RepositoryResult<()> {
        self.begin_write("insert_unit_user")?;
        self.state.lock().await.unit_users.insert((unit_id, user_id));
        Ok(())
    }

    async fn delete_unit_user(&self, unit_id: u64, user_id: u64) -> RepositoryResult<()> {
        self.begin_write("delete_unit_user")?;
        self.state.lock().await.unit_users.remove(&(unit_id, user_id));
        Ok(())
    }

    async fn list_unit_users(&self, unit_id: u64) -> RepositoryResult<Vec<u64>> {
        let state = self.state.lock().await;
        Ok(state
            .unit_users
            .range((unit_id, 0)..=(unit_id, u64::MAX))
            .map(|(_, user_id)| *user_id)
            .collect())
    }

    async fn update_unit_access(
        &self,
        unit_id: u64,
        changes: &UnitAccessChanges,
    ) -> RepositoryResult<UnitAccess> {
        self.begin_write("update_unit_access")?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(stored) = state.units.get_mut(&unit_id).filter(|s| !s.deleted) else {
            return Err(RepositoryError::NotFound {
                entity: "unit",
                id: unit_id,
            });
        };
        let access = &mut stored.unit.access;
        apply_access(&mut access.jobs, &changes.jobs, &mut state.next_access_id);
        apply_access(&mut access.users, &changes.users, &mut state.next_access_id);
        apply_access(
            &mut access.qualifications,
            &changes.qualifications,
            &mut state.next_access_id,
        );
        Ok(access.clone())
    }
}

#[async_trait]
impl CentrumRepository for MemoryRepository {
    async fn get_settings(&self, job: &str) -> RepositoryResult<Option<CentrumSettings>> {
        Ok(self.state.lock().await.settings.get(job).cloned())
    }

    async fn upsert_settings(&self, settings: &CentrumSettings) -> RepositoryResult<()> {
        self.begin_write("upsert_settings")?;
        self.state
            .lock()
            .await
            .settings
            .insert(settings.job.clone(), settings.clone());
        Ok(())
    }

    async fn list_settings(&self) -> RepositoryResult<Vec<CentrumSettings>> {
        let state = self.state.lock().await;
        let mut settings: Vec<CentrumSettings> = state.settings.values().cloned().collect();
        settings.sort_by(|a, b| a.job.cmp(&b.job));
        Ok(settings)
    }

    async fn insert_disponent(&self, job: &str, user_id: u64) -> RepositoryResult<()> {
        self.begin_write("insert_disponent")?;
        if !self
            .state
            .lock()
            .await
            .disponents
            .insert((job.to_string(), user_id))
        {
            return Err(RepositoryError::DuplicateKey(format!("{job}/{user_id}")));
        }
        Ok(())
    }

    async fn delete_disponent(&self, job: &str, user_id: u64) -> RepositoryResult<()> {
        self.begin_write("delete_disponent")?;
        self.state
            .lock()
            .await
            .disponents
            .remove(&(job.to_string(), user_id));
        Ok(())
    }

    async fn list_disponents(&self, job: &str) -> RepositoryResult<Vec<u64>> {
        let state = self.state.lock().await;
        Ok(state
            .disponents
            .iter()
            .filter(|(j, _)| j == job)
            .map(|(_, user_id)| *user_id)
            .collect())
    }
}

/// Records every published event.
#[derive(Debug, Default)]
pub struct MemoryEventPublisher {
    events: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subjects(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|(subject, _)| subject.clone())
            .collect()
    }

    pub async fn count(&self, subject: &str) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|(s, _)| s == subject)
            .count()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait]
impl EventPublisher for MemoryEventPublisher {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.events.lock().await.push((subject.to_string(), payload));
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Presence {
    job: String,
    marker: Option<UserMarker>,
}

/// Presence tracker driven by tests or the binary's fixtures.
#[derive(Debug)]
pub struct MemoryTracker {
    users: RwLock<HashMap<u64, Presence>>,
    changes: broadcast::Sender<DutyChange>,
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTracker {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(DUTY_CHANNEL_CAPACITY);
        Self {
            users: RwLock::new(HashMap::new()),
            changes,
        }
    }

    pub async fn set_on_duty(&self, user_id: u64, job: &str, marker: Option<UserMarker>) {
        let previous = self.users.write().await.insert(
            user_id,
            Presence {
                job: job.to_string(),
                marker,
            },
        );
        if previous.is_none() {
            let _ = self.changes.send(DutyChange {
                user_id,
                job: job.to_string(),
                on_duty: true,
            });
        }
    }

    pub async fn set_off_duty(&self, user_id: u64) {
        if let Some(presence) = self.users.write().await.remove(&user_id) {
            let _ = self.changes.send(DutyChange {
                user_id,
                job: presence.job,
                on_duty: false,
            });
        }
    }
}

#[async_trait]
impl Tracker for MemoryTracker {
    async fn user_marker(&self, user_id: u64) -> Option<UserMarker> {
        self.users
            .read()
            .await
            .get(&user_id)
            .and_then(|p| p.marker)
    }

    async fn is_user_on_duty(&self, user_id: u64) -> bool {
        self.users.read().await.contains_key(&user_id)
    }

    fn subscribe_duty_changes(&self) -> broadcast::Receiver<DutyChange> {
        self.changes.subscribe()
    }
}

#[derive(Debug, Default)]
pub struct MemoryUserResolver {
    profiles: RwLock<HashMap<u64, UserProfile>>,
}

impl MemoryUserResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, profile: UserProfile) {
        self.profiles.write().await.insert(profile.user_id, profile);
    }
}

#[async_trait]
impl UserResolver for MemoryUserResolver {
    async fn resolve_users(&self, user_ids: &[u64]) -> RepositoryResult<Vec<UserProfile>> {
        let profiles = self.profiles.read().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| profiles.get(id).cloned())
            .collect())
    }
}
