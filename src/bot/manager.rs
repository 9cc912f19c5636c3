use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bot::Bot;
use crate::config::BotConfig;
use crate::store::{DispatchStore, DisponentStore, SettingsStore};

/// Messages accepted by the bot supervisor.
#[derive(Debug)]
pub enum BotManagerMessage {
    /// Re-evaluate which jobs need a bot now instead of on the next tick.
    Reconcile,
}

struct RunningBot {
    bot: Arc<Bot>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Supervisor owning one bot task per job that wants automatic assignment.
pub struct BotManager {
    config: BotConfig,
    jobs: Vec<String>,
    dispatches: DispatchStore,
    settings: SettingsStore,
    disponents: DisponentStore,
    bots: Mutex<HashMap<String, RunningBot>>,
    message_tx: mpsc::Sender<BotManagerMessage>,
}

impl BotManager {
    /// `jobs` are always considered, in addition to every job with saved settings.
    pub fn new(
        config: BotConfig,
        jobs: Vec<String>,
        dispatches: DispatchStore,
        settings: SettingsStore,
        disponents: DisponentStore,
    ) -> (Self, mpsc::Receiver<BotManagerMessage>) {
        let (message_tx, message_rx) = mpsc::channel(16);
        let manager = Self {
            config,
            jobs,
            dispatches,
            settings,
            disponents,
            bots: Mutex::new(HashMap::new()),
            message_tx,
        };
        (manager, message_rx)
    }

    pub fn message_sender(&self) -> mpsc::Sender<BotManagerMessage> {
        self.message_tx.clone()
    }

    /// Jobs that currently have a running bot.
    pub async fn running_jobs(&self) -> Vec<String> {
        let mut jobs: Vec<String> = self.bots.lock().await.keys().cloned().collect();
        jobs.sort();
        jobs
    }

    pub async fn bot(&self, job: &str) -> Option<Arc<Bot>> {
        self.bots.lock().await.get(job).map(|r| r.bot.clone())
    }

    /// Supervise bots until `token` is cancelled, then stop and join all of them.
    pub async fn run(
        &self,
        mut message_rx: mpsc::Receiver<BotManagerMessage>,
        token: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(msg) = message_rx.recv() => match msg {
                    BotManagerMessage::Reconcile => self.reconcile(&token).await,
                },
                _ = interval.tick() => self.reconcile(&token).await,
            }
        }

        self.stop_all().await;
    }

    /// Start bots for newly desired jobs and stop the ones no longer desired.
    pub async fn reconcile(&self, parent: &CancellationToken) {
        let desired = self.desired_jobs().await;
        let mut bots = self.bots.lock().await;

        let stale: Vec<String> = bots
            .keys()
            .filter(|job| !desired.contains(*job))
            .cloned()
            .collect();
        for job in stale {
            if let Some(running) = bots.remove(&job) {
                stop(&job, running).await;
            }
        }

        for job in desired {
            if bots.contains_key(&job) {
                continue;
            }
            let bot = Arc::new(Bot::new(
                job.clone(),
                self.config.clone(),
                self.dispatches.clone(),
            ));
            let token = parent.child_token();
            let handle = tokio::spawn({
                let bot = bot.clone();
                let token = token.clone();
                async move { bot.run(token).await }
            });
            bots.insert(job, RunningBot { bot, token, handle });
        }
    }

    async fn desired_jobs(&self) -> BTreeSet<String> {
        let mut candidates: BTreeSet<String> = self.jobs.iter().cloned().collect();
        candidates.extend(self.settings.list().await.into_iter().map(|s| s.job));

        let mut desired = BTreeSet::new();
        for job in candidates {
            let settings = self.settings.get(&job).await;
            let disponents = self.disponents.count(&job).await;
            if settings.bot_should_run(disponents) {
                desired.insert(job);
            }
        }
        desired
    }

    pub async fn stop_all(&self) {
        let bots: Vec<(String, RunningBot)> = self.bots.lock().await.drain().collect();
        for (job, running) in bots {
            stop(&job, running).await;
        }
    }
}

async fn stop(job: &str, running: RunningBot) {
    running.token.cancel();
    if let Err(e) = running.handle.await {
        tracing::warn!(job, error = %e, "Bot task did not shut down cleanly");
    }
}
