//! Scheduled maintenance of the live and durable state.
//!
//! Every task is idempotent and may overlap with its own next run. Failures
//! are logged and retried on the next tick.

mod duty;
mod tasks;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::HousekeeperConfig;
use crate::kv::ReplicationBackend;
use crate::ports::{DispatchRepository, Tracker, UnitRepository};
use crate::store::{DispatchStore, DisponentStore, UnitStore};

pub use tasks::GcReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    ExpireAssignments,
    CancelStaleDispatches,
    RemoveEmptyUnits,
    SanitizeUnitStatuses,
    ReconcileUserUnits,
    RefreshUnits,
    CollectGarbage,
}

impl Task {
    const ALL: [Task; 7] = [
        Task::ExpireAssignments,
        Task::CancelStaleDispatches,
        Task::RemoveEmptyUnits,
        Task::SanitizeUnitStatuses,
        Task::ReconcileUserUnits,
        Task::RefreshUnits,
        Task::CollectGarbage,
    ];

    fn name(&self) -> &'static str {
        match self {
            Task::ExpireAssignments => "expire_assignments",
            Task::CancelStaleDispatches => "cancel_stale_dispatches",
            Task::RemoveEmptyUnits => "remove_empty_units",
            Task::SanitizeUnitStatuses => "sanitize_unit_statuses",
            Task::ReconcileUserUnits => "reconcile_user_units",
            Task::RefreshUnits => "refresh_units",
            Task::CollectGarbage => "collect_garbage",
        }
    }

    fn period(&self, config: &HousekeeperConfig) -> Duration {
        match self {
            Task::ExpireAssignments => config.expiration_interval,
            Task::CancelStaleDispatches => config.stale_interval,
            Task::RemoveEmptyUnits => config.empty_unit_interval,
            Task::SanitizeUnitStatuses => config.unit_status_interval,
            Task::ReconcileUserUnits => config.user_unit_interval,
            Task::RefreshUnits => config.unit_refresh_interval,
            Task::CollectGarbage => config.gc_interval,
        }
    }
}

pub struct Housekeeper {
    config: HousekeeperConfig,
    dispatches: DispatchStore,
    units: UnitStore,
    disponents: DisponentStore,
    dispatch_repo: Arc<dyn DispatchRepository>,
    unit_repo: Arc<dyn UnitRepository>,
    tracker: Arc<dyn Tracker>,
    backend: Arc<dyn ReplicationBackend>,
}

impl Housekeeper {
    pub fn new(
        config: HousekeeperConfig,
        dispatches: DispatchStore,
        disponents: DisponentStore,
        dispatch_repo: Arc<dyn DispatchRepository>,
        unit_repo: Arc<dyn UnitRepository>,
        tracker: Arc<dyn Tracker>,
        backend: Arc<dyn ReplicationBackend>,
    ) -> Self {
        let units = dispatches.units().clone();
        Self {
            config,
            dispatches,
            units,
            disponents,
            dispatch_repo,
            unit_repo,
            tracker,
            backend,
        }
    }

    /// Run every task and the duty watcher until `token` is cancelled, then
    /// wait for all of them to finish.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut handles = Vec::with_capacity(Task::ALL.len() + 1);
        for task in Task::ALL {
            let housekeeper = self.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                housekeeper.run_periodic(task, token).await
            }));
        }

        let housekeeper = self.clone();
        let duty_token = token.clone();
        handles.push(tokio::spawn(async move {
            housekeeper.watch_duty_changes(duty_token).await
        }));

        tracing::info!(tasks = handles.len(), "Housekeeper started");
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Housekeeper task did not shut down cleanly");
            }
        }
        tracing::info!("Housekeeper stopped");
    }

    async fn run_periodic(&self, task: Task, token: CancellationToken) {
        let mut interval = tokio::time::interval(task.period(&self.config));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => self.run_task(task).await,
            }
        }
    }

    async fn run_task(&self, task: Task) {
        let result = match task {
            Task::ExpireAssignments => self.expire_assignments().await,
            Task::CancelStaleDispatches => self.cancel_stale_dispatches().await,
            Task::RemoveEmptyUnits => self.remove_empty_units_from_dispatches().await,
            Task::SanitizeUnitStatuses => self.sanitize_unit_statuses().await,
            Task::ReconcileUserUnits => self.reconcile_user_unit_mappings().await,
            Task::RefreshUnits => self.refresh_units().await,
            Task::CollectGarbage => self.collect_garbage().await.map(|r| r.total()),
        };
        match result {
            Ok(0) => {}
            Ok(changed) => tracing::debug!(task = task.name(), changed, "Housekeeper task finished"),
            Err(e) => tracing::error!(task = task.name(), error = %e, "Housekeeper task failed"),
        }
    }
}
