use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;

use lib_collector::Engine;
use lib_collector::connections::memory_store::MemoryStore;
use lib_collector::connections::{ProtocolFactory, StorageFactory};
use lib_collector::retrieve::RegistryApi;

mod collector_logic;
use collector_logic::{config, logger};

async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(err) => {
                        log::warn!("Cannot listen for SIGTERM: {}", err);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    let log_path = logger::setup_logging(&config.log_dir(), config.log_level())?;
    log::info!("Logging to {}", log_path.display());

    let engine_config = config.engine_config();
    log::info!(
        "Collector '{}': {} process group(s) x {} slot(s), {} storage slot(s) on {}",
        engine_config.server_name,
        engine_config.processes,
        engine_config.slots_per_process,
        engine_config.persistence_slots,
        engine_config.storage_backend
    );

    let source = RegistryApi::from_config(&engine_config)
        .with_context(|| format!("invalid registry url {}", engine_config.registry_url))?;
    let storage = StorageFactory::with_defaults(&engine_config.storage_backend, MemoryStore::new());
    let engine = Engine::new(
        engine_config,
        Arc::new(source),
        ProtocolFactory::with_defaults(),
        storage,
    );

    // The registry may be down at boot; loading retries until it answers.
    let summary = tokio::select! {
        summary = engine.load() => summary,
        _ = shutdown_signal() => {
            log::info!("Shutdown requested before the initial load completed.");
            return Ok(());
        }
    };
    log::info!(
        "Initial load: {} station(s), {} storage target(s), active servers [{}]",
        summary.stations,
        summary.targets,
        summary.active_servers.join(", ")
    );

    let assigned = engine.assign_pending();
    log::info!("{} station(s) assigned at start", assigned);

    let handle = engine.start();
    shutdown_signal().await;

    handle.close().await;
    log::info!("Shutdown complete.");
    Ok(())
}
