//! Collaborators the engine depends on but does not implement.
//!
//! Durable storage, the change bus, presence tracking and user lookups live
//! behind these traits. `adapters::memory` provides in-process versions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::access::{AccessLevel, UnitAccess, UnitAccessChanges};
use crate::model::dispatch::{Dispatch, DispatchAssignment, DispatchStatus};
use crate::model::settings::CentrumSettings;
use crate::model::unit::{Unit, UnitStatus};
use crate::model::user::{UserInfo, UserMarker, UserProfile};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

#[async_trait]
pub trait DispatchRepository: Send + Sync {
    /// Insert and return the generated id.
    async fn insert_dispatch(&self, dsp: &Dispatch) -> RepositoryResult<u64>;
    async fn update_dispatch(&self, dsp: &Dispatch) -> RepositoryResult<()>;
    async fn delete_dispatch(&self, id: u64) -> RepositoryResult<()>;
    async fn get_dispatch(&self, id: u64) -> RepositoryResult<Option<Dispatch>>;
    /// Dispatches created at or after `since`.
    async fn list_dispatches(&self, since: DateTime<Utc>) -> RepositoryResult<Vec<Dispatch>>;

    /// Append a status row, returning its monotonically increasing id.
    async fn insert_dispatch_status(&self, status: &DispatchStatus) -> RepositoryResult<u64>;
    async fn latest_dispatch_status(
        &self,
        dispatch_id: u64,
    ) -> RepositoryResult<Option<DispatchStatus>>;

    async fn insert_assignment(&self, assignment: &DispatchAssignment) -> RepositoryResult<()>;
    async fn delete_assignment(&self, dispatch_id: u64, unit_id: u64) -> RepositoryResult<()>;
    async fn update_assignment_expiry(
        &self,
        dispatch_id: u64,
        unit_id: u64,
        expires_at: Option<DateTime<Utc>>,
    ) -> RepositoryResult<()>;
    async fn list_assignments(&self, dispatch_id: u64) -> RepositoryResult<Vec<DispatchAssignment>>;
    async fn expired_assignments(
        &self,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Vec<DispatchAssignment>>;

    /// Durable retention. Returns the number of removed dispatches.
    async fn delete_dispatches_older_than(&self, cutoff: DateTime<Utc>) -> RepositoryResult<usize>;
}

#[async_trait]
pub trait UnitRepository: Send + Sync {
    async fn insert_unit(&self, unit: &Unit) -> RepositoryResult<u64>;
    async fn update_unit(&self, unit: &Unit) -> RepositoryResult<()>;
    /// Soft delete; the unit no longer shows up in listings.
    async fn delete_unit(&self, id: u64) -> RepositoryResult<()>;
    async fn get_unit(&self, id: u64) -> RepositoryResult<Option<Unit>>;
    async fn list_units(&self) -> RepositoryResult<Vec<Unit>>;

    async fn insert_unit_status(&self, status: &UnitStatus) -> RepositoryResult<u64>;
    async fn latest_unit_status(&self, unit_id: u64) -> RepositoryResult<Option<UnitStatus>>;
    async fn delete_unit_statuses_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> RepositoryResult<usize>;

    async fn insert_unit_user(&self, unit_id: u64, user_id: u64) -> RepositoryResult<()>;
    async fn delete_unit_user(&self, unit_id: u64, user_id: u64) -> RepositoryResult<()>;
    async fn list_unit_users(&self, unit_id: u64) -> RepositoryResult<Vec<u64>>;

    /// Apply access changes and return the stored lists with their ids.
    async fn update_unit_access(
        &self,
        unit_id: u64,
        changes: &UnitAccessChanges,
    ) -> RepositoryResult<UnitAccess>;
}

#[async_trait]
pub trait CentrumRepository: Send + Sync {
    async fn get_settings(&self, job: &str) -> RepositoryResult<Option<CentrumSettings>>;
    async fn upsert_settings(&self, settings: &CentrumSettings) -> RepositoryResult<()>;
    async fn list_settings(&self) -> RepositoryResult<Vec<CentrumSettings>>;

    /// Fails with `DuplicateKey` if the user already is a disponent of `job`.
    async fn insert_disponent(&self, job: &str, user_id: u64) -> RepositoryResult<()>;
    async fn delete_disponent(&self, job: &str, user_id: u64) -> RepositoryResult<()>;
    async fn list_disponents(&self, job: &str) -> RepositoryResult<Vec<u64>>;
}

#[derive(Debug, Error)]
#[error("publish to {subject} failed: {message}")]
pub struct PublishError {
    pub subject: String,
    pub message: String,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// A user went on or off duty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DutyChange {
    pub user_id: u64,
    pub job: String,
    pub on_duty: bool,
}

#[async_trait]
pub trait Tracker: Send + Sync {
    async fn user_marker(&self, user_id: u64) -> Option<UserMarker>;
    async fn is_user_on_duty(&self, user_id: u64) -> bool;
    fn subscribe_duty_changes(&self) -> broadcast::Receiver<DutyChange>;
}

#[async_trait]
pub trait UserResolver: Send + Sync {
    /// Profiles for the given ids; unknown ids are left out.
    async fn resolve_users(&self, user_ids: &[u64]) -> RepositoryResult<Vec<UserProfile>>;
}

/// Decides whether a user may act on an access-gated resource.
#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn can_user_access_target(
        &self,
        target_id: u64,
        user: &UserInfo,
        required: AccessLevel,
    ) -> crate::error::Result<bool>;
}
