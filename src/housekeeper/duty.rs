use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::housekeeper::Housekeeper;
use crate::ports::DutyChange;

impl Housekeeper {
    /// Take users that went off duty out of their unit and every disponent list.
    pub(super) async fn watch_duty_changes(&self, token: CancellationToken) {
        let mut changes = self.tracker.subscribe_duty_changes();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(change) => self.handle_duty_change(&change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Duty watcher lagged, reconciling unit mappings");
                        if let Err(e) = self.reconcile_user_unit_mappings().await {
                            tracing::error!(error = %e, "Unit mapping reconciliation failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    pub async fn handle_duty_change(&self, change: &DutyChange) {
        if change.on_duty {
            return;
        }
        let user_id = change.user_id;

        if let Some(mapping) = self.units.user_mapping(user_id).await {
            match self.units.leave_unit(&mapping.job, user_id).await {
                Ok(Some(unit)) => {
                    tracing::info!(user_id, unit_id = unit.id, "Removed off-duty user from unit");
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(user_id, error = %e, "Failed to remove off-duty user from unit"),
            }
        }

        for job in self.disponents.jobs_of(user_id).await {
            match self.disponents.sign_out(&job, user_id).await {
                Ok(_) => tracing::info!(user_id, job = %job, "Signed out off-duty disponent"),
                Err(e) => tracing::warn!(user_id, job = %job, error = %e, "Failed to sign out disponent"),
            }
        }
    }
}
