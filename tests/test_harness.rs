//! Test harness for centrum integration tests.
//!
//! Builds nodes over shared in-memory collaborators so several replicas can
//! be wired to the same replication backend and durable repository.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use centrum::adapters::{MemoryEventPublisher, MemoryRepository, MemoryTracker, MemoryUserResolver};
use centrum::config::{CentrumConfig, NodeConfig};
use centrum::kv::MemoryBackend;
use centrum::model::dispatch::Dispatch;
use centrum::model::settings::{CentrumMode, CentrumSettings};
use centrum::model::unit::Unit;
use centrum::model::user::UserProfile;
use centrum::node::{Node, NodeDeps};
use tokio_util::sync::CancellationToken;

pub const JOB: &str = "police";

/// Node configuration with short intervals for faster tests
pub fn test_node_config() -> NodeConfig {
    let mut centrum = CentrumConfig::default();
    centrum.bot.interval = Duration::from_millis(50);
    centrum.bot.grace_window = Duration::from_millis(50);
    centrum.bot.reconcile_interval = Duration::from_millis(50);
    centrum.dedup.interval = Duration::from_millis(50);
    NodeConfig::new(1)
        .with_jobs(vec![JOB.to_string()])
        .with_centrum(centrum)
}

/// Shared collaborators for every node built from it.
pub struct TestEnv {
    pub backend: Arc<MemoryBackend>,
    pub repo: Arc<MemoryRepository>,
    pub publisher: Arc<MemoryEventPublisher>,
    pub tracker: Arc<MemoryTracker>,
    pub resolver: Arc<MemoryUserResolver>,
    token: CancellationToken,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_repo(Arc::new(MemoryRepository::new()))
    }

    /// Fresh replication backend over existing durable storage.
    pub fn with_repo(repo: Arc<MemoryRepository>) -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            repo,
            publisher: Arc::new(MemoryEventPublisher::new()),
            tracker: Arc::new(MemoryTracker::new()),
            resolver: Arc::new(MemoryUserResolver::new()),
            token: CancellationToken::new(),
        }
    }

    pub fn deps(&self) -> NodeDeps {
        NodeDeps {
            backend: self.backend.clone(),
            dispatch_repo: self.repo.clone(),
            unit_repo: self.repo.clone(),
            centrum_repo: self.repo.clone(),
            publisher: self.publisher.clone(),
            tracker: self.tracker.clone(),
            resolver: self.resolver.clone(),
            access_gate: None,
        }
    }

    /// A node without watchers, enough for single-replica tests.
    pub fn node(&self) -> Node {
        self.node_with(test_node_config())
    }

    pub fn node_with(&self, config: NodeConfig) -> Node {
        let (node, _bot_rx) = Node::new(config, self.deps());
        node
    }

    /// A node that follows the shared change log.
    pub fn replica(&self, node_id: u64) -> Node {
        let mut config = test_node_config();
        config.node_id = node_id;
        let node = self.node_with(config);
        node.spawn_watchers(&self.token);
        node
    }

    pub async fn on_duty(&self, user_id: u64, job: &str) {
        self.resolver
            .add(UserProfile::new(user_id, "Test", &format!("User{user_id}"), job, 1))
            .await;
        self.tracker.set_on_duty(user_id, job, None).await;
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Unit of `job` with the given members, all put on duty first.
pub async fn staffed_unit(
    env: &TestEnv,
    node: &Node,
    job: &str,
    name: &str,
    members: &[u64],
) -> Unit {
    let unit = node.units.create(Unit::new(job, name, name)).await.unwrap();
    for &user_id in members {
        env.on_duty(user_id, job).await;
    }
    if members.is_empty() {
        return unit;
    }
    node.units
        .update_unit_assignments(job, unit.id, members, &[], None)
        .await
        .unwrap()
}

pub async fn police_dispatch(node: &Node, x: f64, y: f64) -> Dispatch {
    node.dispatches
        .create(Dispatch::new(vec![JOB.to_string()], "Shots fired", x, y))
        .await
        .unwrap()
}

pub async fn enable_auto_assign(node: &Node, job: &str) {
    node.settings
        .update(
            CentrumSettings::new(job).with_mode(CentrumMode::AutoRoundRobin, CentrumMode::Manual),
        )
        .await
        .unwrap();
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
