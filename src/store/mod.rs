pub mod dispatches;
pub mod disponents;
pub mod settings;
pub mod units;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::KvConfig;
use crate::events::EventBus;
use crate::kv::ReplicationBackend;
use crate::model::user::UserProfile;
use crate::ports::{Tracker, UserResolver};

pub use dispatches::{DispatchStore, TakeOutcome, TakeResponse};
pub use disponents::DisponentStore;
pub use settings::SettingsStore;
pub use units::{UnitAccessGate, UnitStore};

/// Collaborators shared by every store of one replica.
#[derive(Clone)]
pub struct StoreContext {
    pub replica: Uuid,
    pub backend: Arc<dyn ReplicationBackend>,
    pub kv: KvConfig,
    pub bus: EventBus,
    pub tracker: Arc<dyn Tracker>,
    pub resolver: Arc<dyn UserResolver>,
}

impl StoreContext {
    pub async fn resolve_user(&self, user_id: u64) -> Option<UserProfile> {
        self.resolve_users(&[user_id]).await.into_iter().next()
    }

    pub async fn resolve_users(&self, user_ids: &[u64]) -> Vec<UserProfile> {
        if user_ids.is_empty() {
            return Vec::new();
        }
        match self.resolver.resolve_users(user_ids).await {
            Ok(profiles) => profiles,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to resolve users");
                Vec::new()
            }
        }
    }

    /// Last visible position of a user, if the tracker knows one.
    pub async fn user_position(&self, user_id: Option<u64>) -> (Option<f64>, Option<f64>) {
        let Some(user_id) = user_id else {
            return (None, None);
        };
        match self.tracker.user_marker(user_id).await {
            Some(marker) if !marker.hidden => (Some(marker.x), Some(marker.y)),
            _ => (None, None),
        }
    }
}

pub(crate) fn record_key(id: u64) -> String {
    id.to_string()
}

/// Time elapsed since `at`; zero for timestamps in the future.
pub(crate) fn age(at: DateTime<Utc>) -> Duration {
    (Utc::now() - at).to_std().unwrap_or_default()
}

/// Out-of-range durations saturate to a century.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
