//! nex node
//!
//! The node runs on a host with a micro-VM hypervisor and serves the
//! bus-based control plane: it keeps a pool of warm VMs, accepts deploy and
//! stop commands, and relays triggers into deployed workloads.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nex_node::bus::MemoryBus;
use nex_node::claims::NodeKeys;
use nex_node::config::NodeConfig;
use nex_node::control::ApiListener;
use nex_node::launcher::{MockLauncher, NoopNetworkReset};
use nex_node::machines::MachineManager;
use nex_node::payload::PayloadCache;
use nex_node::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting nex node");

    let config = NodeConfig::from_env()?;
    info!(
        pool_size = config.machine_pool_size,
        workload_types = ?config.workload_types,
        "Configuration loaded"
    );

    let keys = Arc::new(NodeKeys::generate());
    info!(node_id = %keys.public_key(), "Node identity generated");

    // Dev-mode wiring: in-process buses and a mock launcher. The surrounding
    // runtime replaces these with real capabilities in production deployments.
    let external: Arc<MemoryBus> = Arc::new(MemoryBus::new());
    let internal: Arc<MemoryBus> = Arc::new(MemoryBus::new());
    let launcher = Arc::new(MockLauncher::with_handshakes(internal.clone()));

    let telemetry = Arc::new(Telemetry::new()?);
    let manager = MachineManager::new(
        config.clone(),
        keys.public_key(),
        external.clone(),
        internal.clone(),
        launcher,
        Arc::new(NoopNetworkReset),
        telemetry,
    )
    .await?;

    let warming = tokio::spawn(Arc::clone(&manager).run());

    let cache = Arc::new(PayloadCache::new(external.clone(), internal.clone()));
    let listener = ApiListener::new(external, Arc::clone(&manager), cache, keys, config);
    listener.start(manager.shutdown_signal()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    manager.stop().await?;
    warming.await?;

    Ok(())
}
