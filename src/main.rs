use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use centrum::adapters::{MemoryEventPublisher, MemoryRepository, MemoryTracker, MemoryUserResolver};
use centrum::config::{CentrumConfig, NodeConfig};
use centrum::kv::MemoryBackend;
use centrum::model::settings::{CentrumMode, CentrumSettings};
use centrum::node::{Node, NodeDeps};
use centrum::ports::CentrumRepository;
use centrum::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "centrum")]
#[command(version)]
#[command(about = "Computer-aided dispatch engine")]
struct Args {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Namespace for change-bus subjects
    #[arg(long, default_value = "centrum")]
    service: String,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Jobs served by this node (comma-separated)
    /// Example: "police,ambulance"
    #[arg(long, value_delimiter = ',')]
    jobs: Vec<String>,

    /// Enable round-robin auto-assignment for every job in --jobs
    #[arg(long)]
    auto_assign: bool,

    /// Seconds between auto-assignment cycles
    #[arg(long, default_value = "4")]
    bot_interval_secs: u64,

    /// Seconds between duplicate detection passes
    #[arg(long, default_value = "5")]
    dedup_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let mut centrum = CentrumConfig::default();
    centrum.bot.interval = Duration::from_secs(args.bot_interval_secs);
    centrum.dedup.interval = Duration::from_secs(args.dedup_interval_secs);

    let mut config = NodeConfig::new(args.node_id)
        .with_jobs(args.jobs.clone())
        .with_centrum(centrum);
    config.service = args.service;
    if let Some(addr) = dashboard_addr {
        config = config.with_dashboard(addr);
    }

    // Single-process mode: every collaborator lives in memory
    let repo = Arc::new(MemoryRepository::new());
    let deps = NodeDeps {
        backend: Arc::new(MemoryBackend::new()),
        dispatch_repo: repo.clone(),
        unit_repo: repo.clone(),
        centrum_repo: repo.clone(),
        publisher: Arc::new(MemoryEventPublisher::new()),
        tracker: Arc::new(MemoryTracker::new()),
        resolver: Arc::new(MemoryUserResolver::new()),
        access_gate: None,
    };

    if args.auto_assign {
        for job in &args.jobs {
            let settings = CentrumSettings::new(job)
                .with_mode(CentrumMode::AutoRoundRobin, CentrumMode::AutoRoundRobin);
            repo.upsert_settings(&settings).await?;
        }
    }

    tracing::info!(
        node_id = config.node_id,
        jobs = ?config.jobs,
        dashboard = ?config.dashboard_addr,
        "Starting centrum node"
    );

    let token = install_shutdown_handler();
    let (node, bot_rx) = Node::new(config, deps);
    node.run(bot_rx, token).await?;
    Ok(())
}
