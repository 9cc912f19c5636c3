use std::net::SocketAddr;
use std::time::Duration;

use crate::geo::Bounds;

/// Auto-assignment bot policy.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Pause between bot cycles.
    pub interval: Duration,
    /// Dispatches younger than this are left for the dedup sweep.
    pub grace_window: Duration,
    /// Expiry window attached to bot assignments.
    pub assignment_expiry: Duration,
    pub cooldown_base: Duration,
    /// Added per available unit above `cooldown_unit_threshold`.
    pub cooldown_per_unit: Duration,
    pub cooldown_unit_threshold: usize,
    /// Upper bound for the whole cooldown.
    pub cooldown_max: Duration,
    /// How often the bot supervisor re-evaluates which jobs need a bot.
    pub reconcile_interval: Duration,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(4),
            grace_window: Duration::from_secs(6),
            assignment_expiry: Duration::from_secs(20),
            cooldown_base: Duration::from_secs(35),
            cooldown_per_unit: Duration::from_secs(5),
            cooldown_unit_threshold: 3,
            cooldown_max: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(5),
        }
    }
}

/// Duplicate detection sweep.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub interval: Duration,
    pub k_nearest: usize,
    pub radius: f64,
    /// Only dispatches created within this window are matched.
    pub window: Duration,
    /// Cap on cancelled duplicates per pass.
    pub max_cancelled_per_pass: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            k_nearest: 8,
            radius: 45.0,
            window: Duration::from_secs(3 * 60),
            max_cancelled_per_pass: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HousekeeperConfig {
    pub expiration_interval: Duration,
    pub stale_interval: Duration,
    pub empty_unit_interval: Duration,
    pub unit_status_interval: Duration,
    pub user_unit_interval: Duration,
    pub gc_interval: Duration,
    /// Live units are re-seeded from durable storage this often. Must stay
    /// well below `KvConfig::record_ttl`.
    pub unit_refresh_interval: Duration,
    /// Non-terminal dispatches older than this are cancelled as TOO_OLD.
    pub stale_dispatch_age: Duration,
    pub stale_dispatch_limit: usize,
    /// Durable retention for dispatches and unit status history.
    pub retention: Duration,
    /// Terminal dispatches are dropped from the live store after this.
    pub terminal_purge_after: Duration,
}

impl Default for HousekeeperConfig {
    fn default() -> Self {
        Self {
            expiration_interval: Duration::from_secs(1),
            stale_interval: Duration::from_secs(60),
            empty_unit_interval: Duration::from_secs(30),
            unit_status_interval: Duration::from_secs(60),
            user_unit_interval: Duration::from_secs(90),
            gc_interval: Duration::from_secs(5 * 60),
            unit_refresh_interval: Duration::from_secs(60 * 60),
            stale_dispatch_age: Duration::from_secs(60 * 60),
            stale_dispatch_limit: 200,
            retention: Duration::from_secs(14 * 24 * 60 * 60),
            terminal_purge_after: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Safety-net expiry applied to every record on write.
    pub record_ttl: Duration,
    /// Attempts made by `compute_update` before giving up on contention.
    pub max_update_retries: usize,
    /// How often expired local entries are evicted.
    pub eviction_interval: Duration,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(24 * 60 * 60),
            max_update_retries: 8,
            eviction_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeoConfig {
    pub bounds: Bounds,
    pub node_capacity: usize,
    pub max_depth: usize,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            bounds: Bounds::new(-9000.0, -9000.0, 11000.0, 11000.0),
            node_capacity: 8,
            max_depth: 12,
        }
    }
}

/// Policy constants for every engine component.
#[derive(Debug, Clone, Default)]
pub struct CentrumConfig {
    pub bot: BotConfig,
    pub dedup: DedupConfig,
    pub housekeeper: HousekeeperConfig,
    pub kv: KvConfig,
    pub geo: GeoConfig,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    /// Namespace used for change-bus subjects.
    pub service: String,
    /// Jobs served by this node in addition to those with saved settings.
    pub jobs: Vec<String>,
    pub dashboard_addr: Option<SocketAddr>,
    pub centrum: CentrumConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            service: "centrum".to_string(),
            jobs: Vec::new(),
            dashboard_addr: None,
            centrum: CentrumConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn with_jobs(mut self, jobs: Vec<String>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_centrum(mut self, centrum: CentrumConfig) -> Self {
        self.centrum = centrum;
        self
    }
}

impl BotConfig {
    /// Cooldown applied to a unit after the bot assigned it, scaled by how
    /// many units are currently available.
    pub fn cooldown_for(&self, available_units: usize) -> Duration {
        let extra_units = available_units.saturating_sub(self.cooldown_unit_threshold) as u32;
        let delay = self.cooldown_base + self.cooldown_per_unit * extra_units;
        delay.min(self.cooldown_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_config_default() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.interval, Duration::from_secs(4));
        assert_eq!(cfg.cooldown_base, Duration::from_secs(35));
        assert!(cfg.grace_window >= Duration::from_secs(5));
        assert!(cfg.grace_window <= Duration::from_secs(7));
    }

    #[test]
    fn cooldown_scales_above_threshold() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.cooldown_for(0), Duration::from_secs(35));
        assert_eq!(cfg.cooldown_for(3), Duration::from_secs(35));
        assert_eq!(cfg.cooldown_for(4), Duration::from_secs(40));
        assert_eq!(cfg.cooldown_for(6), Duration::from_secs(50));
    }

    #[test]
    fn cooldown_is_capped() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.cooldown_for(50), Duration::from_secs(60));
    }

    #[test]
    fn dedup_config_default() {
        let cfg = DedupConfig::default();
        assert_eq!(cfg.k_nearest, 8);
        assert_eq!(cfg.radius, 45.0);
        assert_eq!(cfg.window, Duration::from_secs(180));
    }

    #[test]
    fn housekeeper_config_default() {
        let cfg = HousekeeperConfig::default();
        assert_eq!(cfg.stale_dispatch_age, Duration::from_secs(3600));
        assert_eq!(cfg.stale_dispatch_limit, 200);
        assert_eq!(cfg.retention, Duration::from_secs(14 * 86400));
        assert_eq!(cfg.terminal_purge_after, Duration::from_secs(900));
    }

    #[test]
    fn node_config_builders() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = NodeConfig::new(3).with_dashboard(addr);
        assert_eq!(cfg.node_id, 3);
        assert_eq!(cfg.service, "centrum");
        assert_eq!(cfg.dashboard_addr, Some(addr));
    }
}
