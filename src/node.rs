use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bot::{BotManager, BotManagerMessage};
use crate::config::NodeConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::dedup::DedupSweep;
use crate::error::Result;
use crate::events::EventBus;
use crate::geo::GeoRegistry;
use crate::housekeeper::Housekeeper;
use crate::kv::ReplicationBackend;
use crate::ports::{
    AccessGate, CentrumRepository, DispatchRepository, EventPublisher, Tracker, UnitRepository,
    UserResolver,
};
use crate::store::{
    to_chrono, DispatchStore, DisponentStore, SettingsStore, StoreContext, UnitStore,
};

/// External collaborators a node is built from.
#[derive(Clone)]
pub struct NodeDeps {
    pub backend: Arc<dyn ReplicationBackend>,
    pub dispatch_repo: Arc<dyn DispatchRepository>,
    pub unit_repo: Arc<dyn UnitRepository>,
    pub centrum_repo: Arc<dyn CentrumRepository>,
    pub publisher: Arc<dyn EventPublisher>,
    pub tracker: Arc<dyn Tracker>,
    pub resolver: Arc<dyn UserResolver>,
    /// Replaces the units' own access lists for join checks.
    pub access_gate: Option<Arc<dyn AccessGate>>,
}

/// One replica of the dispatch engine with all of its workers.
pub struct Node {
    pub config: NodeConfig,
    pub replica: Uuid,
    pub settings: SettingsStore,
    pub disponents: DisponentStore,
    pub units: UnitStore,
    pub dispatches: DispatchStore,
    pub bots: Arc<BotManager>,
    pub dedup: Arc<DedupSweep>,
    pub housekeeper: Arc<Housekeeper>,
}

impl Node {
    pub fn new(config: NodeConfig, deps: NodeDeps) -> (Self, mpsc::Receiver<BotManagerMessage>) {
        let replica = Uuid::new_v4();
        let ctx = StoreContext {
            replica,
            backend: deps.backend.clone(),
            kv: config.centrum.kv.clone(),
            bus: EventBus::new(config.service.clone(), deps.publisher.clone()),
            tracker: deps.tracker.clone(),
            resolver: deps.resolver.clone(),
        };

        let settings = SettingsStore::new(ctx.clone(), deps.centrum_repo.clone());
        let disponents = DisponentStore::new(ctx.clone(), deps.centrum_repo.clone());
        let units = match deps.access_gate.clone() {
            Some(gate) => UnitStore::with_access_gate(ctx.clone(), deps.unit_repo.clone(), gate),
            None => UnitStore::new(ctx.clone(), deps.unit_repo.clone()),
        };
        let geo = Arc::new(GeoRegistry::new(config.centrum.geo.clone()));
        let dispatches = DispatchStore::new(
            ctx,
            deps.dispatch_repo.clone(),
            geo,
            units.clone(),
            settings.clone(),
        );

        let (bots, bot_rx) = BotManager::new(
            config.centrum.bot.clone(),
            config.jobs.clone(),
            dispatches.clone(),
            settings.clone(),
            disponents.clone(),
        );
        let dedup = DedupSweep::new(config.centrum.dedup.clone(), dispatches.clone());
        let housekeeper = Housekeeper::new(
            config.centrum.housekeeper.clone(),
            dispatches.clone(),
            disponents.clone(),
            deps.dispatch_repo,
            deps.unit_repo,
            deps.tracker,
            deps.backend,
        );

        let node = Self {
            config,
            replica,
            settings,
            disponents,
            units,
            dispatches,
            bots: Arc::new(bots),
            dedup: Arc::new(dedup),
            housekeeper: Arc::new(housekeeper),
        };
        (node, bot_rx)
    }

    /// Seed every store from durable storage.
    pub async fn load(&self) -> Result<()> {
        let settings = self.settings.load_from_repository().await?;

        let mut jobs: BTreeSet<String> = self.config.jobs.iter().cloned().collect();
        jobs.extend(self.settings.list().await.into_iter().map(|s| s.job));
        let jobs: Vec<String> = jobs.into_iter().collect();
        let disponents = self.disponents.load_from_repository(&jobs).await?;

        let units = self.units.load_from_repository().await?;
        let since = Utc::now() - to_chrono(self.config.centrum.housekeeper.retention);
        let dispatches = self.dispatches.load_from_repository(since).await?;

        tracing::info!(
            node_id = self.config.node_id,
            settings,
            disponents,
            units,
            dispatches,
            "Loaded state from repository"
        );
        Ok(())
    }

    /// Follow the change log of every bucket this node reads.
    pub fn spawn_watchers(&self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.settings.settings().spawn_watcher(token.child_token()),
            self.disponents.disponents().spawn_watcher(token.child_token()),
            self.units.units().spawn_watcher(token.child_token()),
            self.units.index().store().spawn_watcher(token.child_token()),
            self.units.mappings().spawn_watcher(token.child_token()),
            self.dispatches.dispatches().spawn_watcher(token.child_token()),
            self.dispatches.index().store().spawn_watcher(token.child_token()),
        ]
    }

    /// Run the node until `token` is cancelled.
    ///
    /// Loads state, starts the bucket watchers, the bot supervisor, the dedup
    /// sweep, the housekeeper and, if configured, the dashboard. On
    /// cancellation every task is joined before returning.
    pub async fn run(
        self,
        bot_rx: mpsc::Receiver<BotManagerMessage>,
        token: CancellationToken,
    ) -> Result<()> {
        self.load().await?;

        let mut handles = self.spawn_watchers(&token);

        let bots = self.bots.clone();
        let bots_token = token.child_token();
        handles.push(tokio::spawn(async move {
            bots.run(bot_rx, bots_token).await;
        }));

        let dedup = self.dedup.clone();
        let dedup_token = token.child_token();
        handles.push(tokio::spawn(async move {
            dedup.run(dedup_token).await;
        }));

        handles.push(tokio::spawn(
            self.housekeeper.clone().run(token.child_token()),
        ));

        if let Some(addr) = self.config.dashboard_addr {
            let state = DashboardState {
                node_id: self.config.node_id,
                replica: self.replica,
                dispatches: self.dispatches.clone(),
                settings: self.settings.clone(),
                bots: self.bots.clone(),
            };
            let dashboard_token = token.child_token();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = run_dashboard(addr, state) => {}
                    _ = dashboard_token.cancelled() => {}
                }
            }));
        }

        tracing::info!(
            node_id = self.config.node_id,
            replica = %self.replica,
            jobs = ?self.config.jobs,
            "Node started"
        );

        token.cancelled().await;
        tracing::info!(node_id = self.config.node_id, "Shutting down, waiting for workers");

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Worker did not shut down cleanly");
            }
        }
        tracing::info!(node_id = self.config.node_id, "Node stopped");
        Ok(())
    }
}
