//! # Engine
//!
//! The composition root. An [`Engine`] owns the registry, the outbound queue,
//! the status channel and the log join; [`Engine::start`] spawns every
//! component as its own tokio task and hands back an [`EngineHandle`] that
//! shuts them down again.
//!
//! ```text
//!  registry sync ──► Registry ◄── assignment loop
//!                       │
//!        collection tasks (processes × slots) ──► OutboundQueue ──► persistence
//!                       │                                              │
//!                       └──────── status events ──► watchdog ◄─────────┘
//! ```

use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::collect::{CollectContext, CollectTask};
use super::log_join::{LogJoin, LogMessage, LogSink};
use super::persist::{PersistContext, Persistence};
use super::queue::OutboundQueue;
use super::registry::{lock, AssignmentTable, Registry, SharedRegistry, SlotKey};
use super::registry_sync::{apply_station_list, RegistrySync};
use super::status::{StatusEvent, StatusReporter, TaskControl};
use super::watchdog::{TaskKind, Watchdog};
use crate::config::EngineConfig;
use crate::connections::protocol::ProtocolFactory;
use crate::connections::storage::StorageFactory;
use crate::retrieve::registry_api::{DatabaseRecord, RegistryError, RegistrySource, StationRecord};

/// Name of the persistence task, as seen by the watchdog and the logs.
pub const PERSIST_TASK: &str = "db_task";

/// Name of the collection task driving `key`.
pub fn collect_task_name(key: SlotKey) -> String {
    format!("process_sta_task:{key}")
}

/// What [`Engine::load`] found upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub active_servers: Vec<String>,
    pub stations: usize,
    pub targets: usize,
}

/// Places pending stations and logs every placement.
fn assign_and_log(registry: &SharedRegistry, log: &LogSink) -> usize {
    let mut registry = lock(registry);
    let placed = registry.assign_pending();
    for (key, id) in &placed {
        let code = registry.station(id).map_or("?", |s| s.code.as_str());
        log.info(format!("Station {} ({}) assigned to {}", code, id, key));
    }
    placed.len()
}

async fn assignment_loop(
    registry: SharedRegistry,
    log: LogSink,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let waiting = lock(&registry).unassigned_stations().len();
        if waiting > 0 && assign_and_log(&registry, &log) < waiting {
            log.debug(format!(
                "{} stations still wait for a free slot",
                lock(&registry).unassigned_stations().len()
            ));
        }
    }
    log::debug!("Assignment loop stopped");
}

pub struct Engine {
    config: Arc<EngineConfig>,
    source: Arc<dyn RegistrySource>,
    protocols: Arc<ProtocolFactory>,
    storage: Arc<StorageFactory>,
    registry: SharedRegistry,
    queue: OutboundQueue,
    join: LogJoin,
    log: LogSink,
    status_tx: mpsc::UnboundedSender<StatusEvent>,
    status_rx: mpsc::UnboundedReceiver<StatusEvent>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn RegistrySource>,
        protocols: ProtocolFactory,
        storage: StorageFactory,
    ) -> Self {
        let registry =
            Registry::new(AssignmentTable::with_slots(config.processes, config.slots_per_process))
                .shared();
        let (join, log) = LogJoin::new(
            "engine",
            config.log_flush_interval(),
            config.log_batch_size,
        );
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(config),
            source,
            protocols: Arc::new(protocols),
            storage: Arc::new(storage),
            registry,
            queue: OutboundQueue::new(),
            join,
            log,
            status_tx,
            status_rx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    pub fn queue(&self) -> OutboundQueue {
        self.queue.clone()
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    /// Hands every flushed log batch to `tx` as well.
    pub fn forward_logs(&mut self, tx: mpsc::Sender<Vec<LogMessage>>) {
        self.join.forward_to(tx);
    }

    /// Retries `fetch` with the registry backoff until it succeeds.
    async fn fetch_until_ok<T, F, Fut>(&self, what: &str, mut fetch: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let mut attempt = 0u32;
        loop {
            match fetch().await {
                Ok(value) => return value,
                Err(err) => {
                    attempt += 1;
                    self.log
                        .error(format!("Loading {} failed (attempt {})", what, attempt), &err);
                    tokio::time::sleep(self.config.registry_backoff()).await;
                }
            }
        }
    }

    /// Initial load of servers, stations and storage targets. Retries until the registry answers.
    pub async fn load(&self) -> LoadSummary {
        let servers = self.fetch_until_ok("servers", || self.source.servers()).await;
        let active_servers: Vec<String> = servers
            .iter()
            .filter(|server| server.activated)
            .map(|server| server.name.clone().unwrap_or_else(|| "unnamed".to_string()))
            .collect();
        if active_servers.is_empty() {
            self.log.warn("The registry lists no active server");
        } else {
            self.log
                .info(format!("Active servers: {}", active_servers.join(", ")));
        }

        let stations = self.fetch_until_ok("stations", || self.source.stations()).await;
        let databases = self.fetch_until_ok("databases", || self.source.databases()).await;
        let mut summary = self.load_records(&stations, &databases);
        summary.active_servers = active_servers;
        summary
    }

    /// Applies already fetched registry lists.
    pub fn load_records(
        &self,
        stations: &[StationRecord],
        databases: &[DatabaseRecord],
    ) -> LoadSummary {
        let mut registry = lock(&self.registry);
        let report = apply_station_list(&mut registry, stations);
        for record in databases {
            registry.add_target(record);
        }
        self.log.info(format!(
            "Registry loaded: {} stations, {} storage targets",
            registry.station_count(),
            registry.targets().len()
        ));
        LoadSummary {
            active_servers: Vec::new(),
            stations: report.added.len(),
            targets: registry.targets().len(),
        }
    }

    /// One assignment pass. Returns the number of stations placed.
    pub fn assign_pending(&self) -> usize {
        assign_and_log(&self.registry, &self.log)
    }

    /// Spawns every component and returns the handle that stops them.
    pub fn start(self) -> EngineHandle {
        let Engine {
            config,
            source,
            protocols,
            storage,
            registry,
            queue,
            join,
            log,
            status_tx,
            status_rx,
        } = self;

        let shutdown = CancellationToken::new();
        let log_shutdown = CancellationToken::new();
        let log_task = tokio::spawn(join.run(log_shutdown.clone()));
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut controls = BTreeMap::new();
        let mut watchdog = Watchdog::new(
            Arc::clone(&registry),
            status_rx,
            &config,
            log.named("watchdog"),
        );

        let keys: Vec<SlotKey> = lock(&registry).assignments().keys().collect();
        for key in keys {
            let name = collect_task_name(key);
            let control = TaskControl::new(name.clone());
            let ctx = CollectContext {
                registry: Arc::clone(&registry),
                protocols: Arc::clone(&protocols),
                queue: queue.clone(),
                config: Arc::clone(&config),
                log: log.named(name.clone()),
                status: StatusReporter::new(name.clone(), status_tx.clone()),
            };
            watchdog.register(TaskKind::Collect(key), Arc::clone(&control));
            tasks.push(tokio::spawn(
                CollectTask::new(key, ctx).run(Arc::clone(&control), shutdown.clone()),
            ));
            controls.insert(name, control);
        }

        let control = TaskControl::new(PERSIST_TASK);
        let ctx = PersistContext {
            registry: Arc::clone(&registry),
            storage,
            queue: queue.clone(),
            config: Arc::clone(&config),
            log: log.named(PERSIST_TASK),
            status: StatusReporter::new(PERSIST_TASK, status_tx),
            control: Arc::clone(&control),
        };
        watchdog.register(TaskKind::Persist, Arc::clone(&control));
        tasks.push(tokio::spawn(Persistence::new(ctx).run(shutdown.clone())));
        controls.insert(PERSIST_TASK.to_string(), control);

        tasks.push(tokio::spawn(watchdog.run(shutdown.clone())));

        let sync = RegistrySync::new(
            source,
            Arc::clone(&registry),
            log.named("registry_sync"),
            config.sync_interval(),
        );
        tasks.push(tokio::spawn(sync.run(shutdown.clone())));

        tasks.push(tokio::spawn(assignment_loop(
            Arc::clone(&registry),
            log.named("assignment"),
            config.assignment_interval(),
            shutdown.clone(),
        )));

        log.info(format!(
            "Engine started: {} collection slots, {} storage slots, backend {}",
            controls.len() - 1,
            config.persistence_slots,
            config.storage_backend
        ));

        EngineHandle {
            shutdown,
            log_shutdown,
            tasks,
            log_task,
            controls,
            registry,
            queue,
        }
    }
}

/// Running engine.
pub struct EngineHandle {
    shutdown: CancellationToken,
    log_shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    log_task: JoinHandle<()>,
    controls: BTreeMap<String, Arc<TaskControl>>,
    registry: SharedRegistry,
    queue: OutboundQueue,
}

impl EngineHandle {
    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Every worker slot with the code of the station it holds.
    pub fn slot_table(&self) -> Vec<(SlotKey, Option<String>)> {
        let registry = lock(&self.registry);
        registry
            .assignments()
            .keys()
            .map(|key| (key, registry.station_at(key).map(|s| s.code.clone())))
            .collect()
    }

    /// Control handle of a task, by name.
    pub fn control(&self, name: &str) -> Option<Arc<TaskControl>> {
        self.controls.get(name).cloned()
    }

    /// Stops every task and waits for them, then flushes the log join.
    pub async fn close(self) {
        self.shutdown.cancel();
        for result in join_all(self.tasks).await {
            if let Err(err) = result {
                log::error!("Engine task ended abnormally: {}", err);
            }
        }
        self.log_shutdown.cancel();
        if let Err(err) = self.log_task.await {
            log::error!("Log join ended abnormally: {}", err);
        }
    }
}
