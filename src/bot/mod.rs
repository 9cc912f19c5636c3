//! Round-robin auto-assignment.
//!
//! One [`Bot`] runs per job whose settings ask for automatic assignment; the
//! [`BotManager`] starts and stops them as settings and disponents change.

pub mod manager;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::BotConfig;
use crate::model::dispatch::TERMINAL_DISPATCH_STATUSES;
use crate::model::unit::{Unit, UnitStatusKind};
use crate::store::{age, to_chrono, DispatchStore, UnitStore};

pub use manager::{BotManager, BotManagerMessage};

/// Auto-assignment worker for a single job.
pub struct Bot {
    job: String,
    config: BotConfig,
    dispatches: DispatchStore,
    units: UnitStore,
    /// unit id -> end of cooldown
    cooldowns: Mutex<HashMap<u64, Instant>>,
}

impl Bot {
    pub fn new(job: impl Into<String>, config: BotConfig, dispatches: DispatchStore) -> Self {
        let units = dispatches.units().clone();
        Self {
            job: job.into(),
            config,
            dispatches,
            units,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    /// Run cycles until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        tracing::info!(job = %self.job, "Bot started");
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
            }
        }
        tracing::info!(job = %self.job, "Bot stopped");
    }

    /// One pass over the job's open dispatches, oldest first. Returns the
    /// number of assignments made.
    pub async fn run_cycle(&self) -> usize {
        let dispatches = self
            .dispatches
            .filter(
                std::slice::from_ref(&self.job),
                &[],
                &TERMINAL_DISPATCH_STATUSES,
                |_| true,
            )
            .await;

        let mut assigned = 0;
        for dsp in dispatches {
            if age(dsp.created_at) < self.config.grace_window {
                continue;
            }
            if !dsp.is_unassigned() {
                continue;
            }

            let Some((unit, available)) = self.pick_unit().await else {
                tracing::debug!(job = %self.job, "No unit available, ending cycle");
                break;
            };

            let expires_at = Utc::now() + to_chrono(self.config.assignment_expiry);
            match self
                .dispatches
                .update_assignments(dsp.id, &[unit.id], &[], Some(expires_at), None)
                .await
            {
                Ok(updated) => {
                    let cooldown = self.config.cooldown_for(available);
                    self.cooldowns
                        .lock()
                        .await
                        .insert(unit.id, Instant::now() + cooldown);
                    if updated.has_unit(unit.id) {
                        assigned += 1;
                        tracing::info!(
                            job = %self.job,
                            dispatch_id = dsp.id,
                            unit_id = unit.id,
                            cooldown_secs = cooldown.as_secs(),
                            "Bot assigned unit"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(job = %self.job, dispatch_id = dsp.id, error = %e, "Bot assignment failed");
                    break;
                }
            }
        }
        assigned
    }

    /// Remaining cooldown of a unit, if any.
    pub async fn cooldown_remaining(&self, unit_id: u64) -> Option<Duration> {
        let until = *self.cooldowns.lock().await.get(&unit_id)?;
        let remaining = until.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// A random available unit that is not cooling down, together with the
    /// number of available units.
    async fn pick_unit(&self) -> Option<(Unit, usize)> {
        let mut candidates = self.units.list_available(&self.job).await;
        let available = candidates.len();
        candidates.shuffle(&mut rand::thread_rng());

        let cooling: Vec<u64> = {
            let mut cooldowns = self.cooldowns.lock().await;
            let now = Instant::now();
            cooldowns.retain(|_, until| *until > now);
            cooldowns.keys().copied().collect()
        };

        for candidate in candidates {
            if cooling.contains(&candidate.id) {
                continue;
            }
            // Status may have moved since the listing
            match self.units.get(candidate.id).await {
                Ok(unit)
                    if unit.current_status() == UnitStatusKind::Available && !unit.is_empty() =>
                {
                    return Some((unit, available));
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(unit_id = candidate.id, error = %e, "Skipping unit");
                    continue;
                }
            }
        }
        None
    }
}
