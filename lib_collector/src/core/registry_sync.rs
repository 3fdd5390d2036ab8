//! # Registry Sync Loop
//!
//! Keeps the local registry in line with the upstream station list. Each
//! EXECUTE step fetches the list and applies the difference: new codes are
//! registered (unassigned), codes whose endpoint moved are updated and
//! flagged `changed`, and codes gone upstream lose their slot and are
//! deleted. A failed fetch falls back to DISTRIBUTE and is retried on the
//! next cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::log_join::LogSink;
use super::registry::{lock, Registry, SharedRegistry, StationId};
use crate::retrieve::registry_api::{RegistryError, RegistrySource, StationRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    Distribute,
    Execute,
}

/// Codes touched by one EXECUTE step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// Storage targets registered from the upstream database list.
    pub targets: usize,
}

impl SyncReport {
    pub fn mutations(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len() + self.targets
    }

    pub fn is_empty(&self) -> bool {
        self.mutations() == 0
    }
}

/// Applies `upstream` to `registry`. A code listed twice upstream is applied once.
pub fn apply_station_list(registry: &mut Registry, upstream: &[StationRecord]) -> SyncReport {
    let mut report = SyncReport::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for record in upstream {
        if !seen.insert(record.code.as_str()) {
            continue;
        }
        let known = registry
            .station_by_code(&record.code)
            .map(|station| (station.id.clone(), station.address_differs(record)));
        match known {
            None => {
                registry.add_station(record);
                report.added.push(record.code.clone());
            }
            Some((id, true)) => {
                registry.update_station(&id, record);
                report.updated.push(record.code.clone());
            }
            Some((_, false)) => {}
        }
    }

    let mut gone: Vec<(String, StationId)> = registry
        .stations()
        .filter(|station| !seen.contains(station.code.as_str()))
        .map(|station| (station.code.clone(), station.id.clone()))
        .collect();
    gone.sort_by(|a, b| a.0.cmp(&b.0));
    for (code, id) in gone {
        registry.remove_station(&id);
        report.removed.push(code);
    }
    report
}

pub struct RegistrySync {
    step: SyncStep,
    source: Arc<dyn RegistrySource>,
    registry: SharedRegistry,
    log: LogSink,
    interval: Duration,
}

impl RegistrySync {
    pub fn new(
        source: Arc<dyn RegistrySource>,
        registry: SharedRegistry,
        log: LogSink,
        interval: Duration,
    ) -> Self {
        Self {
            step: SyncStep::Distribute,
            source,
            registry,
            log,
            interval,
        }
    }

    pub fn state(&self) -> SyncStep {
        self.step
    }

    /// Fetches the upstream lists and applies them.
    pub async fn execute(&mut self) -> Result<SyncReport, RegistryError> {
        self.step = SyncStep::Execute;
        let stations = match self.source.stations().await {
            Ok(stations) => stations,
            Err(err) => {
                self.step = SyncStep::Distribute;
                return Err(err);
            }
        };

        let mut report = apply_station_list(&mut lock(&self.registry), &stations);

        match self.source.databases().await {
            Ok(databases) => {
                let mut registry = lock(&self.registry);
                report.targets = databases
                    .iter()
                    .filter(|record| registry.add_target(record).is_some())
                    .count();
            }
            Err(err) => self.log.error("Could not refresh the storage targets", &err),
        }

        self.log_report(&report);
        Ok(report)
    }

    fn log_report(&self, report: &SyncReport) {
        for code in &report.added {
            self.log.info(format!("Station {} registered", code));
        }
        for code in &report.updated {
            self.log.info(format!("Station {} moved upstream, flagged for re-creation", code));
        }
        for code in &report.removed {
            self.log.info(format!("Station {} removed upstream, slot released", code));
        }
        if report.targets > 0 {
            self.log.info(format!("{} storage targets registered", report.targets));
        }
    }

    /// One DISTRIBUTE/EXECUTE round. Errors are logged and retried next round.
    pub async fn cycle(&mut self) {
        match self.execute().await {
            Ok(report) if report.is_empty() => self.log.debug("Registry unchanged"),
            Ok(_) => {}
            Err(err) => self
                .log
                .error("Registry sync failed, retrying next cycle", &err),
        }
        self.step = SyncStep::Distribute;
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.cycle() => {}
            }
        }
        log::debug!("Registry sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log_join::LogJoin;
    use crate::core::registry::{AssignmentTable, SlotKey};
    use crate::retrieve::registry_api::{DatabaseRecord, ServerRecord};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeSource {
        stations: Mutex<Result<Vec<StationRecord>, RegistryError>>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                stations: Mutex::new(Ok(Vec::new())),
            }
        }

        fn set(&self, stations: Result<Vec<StationRecord>, RegistryError>) {
            *self.stations.lock().unwrap() = stations;
        }
    }

    #[async_trait]
    impl RegistrySource for FakeSource {
        async fn stations(&self) -> Result<Vec<StationRecord>, RegistryError> {
            self.stations.lock().unwrap().clone()
        }

        async fn databases(&self) -> Result<Vec<DatabaseRecord>, RegistryError> {
            Ok(Vec::new())
        }

        async fn servers(&self) -> Result<Vec<ServerRecord>, RegistryError> {
            Ok(Vec::new())
        }
    }

    fn sync_with(source: Arc<FakeSource>) -> (RegistrySync, SharedRegistry, LogJoin) {
        let registry = Registry::new(AssignmentTable::with_slots(1, 2)).shared();
        let (join, log) = LogJoin::new("test", Duration::from_secs(5), 256);
        let sync = RegistrySync::new(source, Arc::clone(&registry), log, Duration::from_secs(30));
        (sync, registry, join)
    }

    #[test]
    fn diff_adds_updates_and_removes() {
        let mut registry = Registry::new(AssignmentTable::with_slots(1, 2));
        let first = vec![
            StationRecord::new("STA1", "10.0.0.5", 5001),
            StationRecord::new("STA2", "10.0.0.6", 5001),
        ];
        let report = apply_station_list(&mut registry, &first);
        assert_eq!(report.added, vec!["STA1", "STA2"]);
        registry.assign_pending();

        let second = vec![
            StationRecord::new("STA1", "10.0.0.9", 5001),
            StationRecord::new("STA3", "10.0.0.7", 5001),
        ];
        let report = apply_station_list(&mut registry, &second);
        assert_eq!(report.added, vec!["STA3"]);
        assert_eq!(report.updated, vec!["STA1"]);
        assert_eq!(report.removed, vec!["STA2"]);

        assert!(registry.station_by_code("STA1").unwrap().changed);
        assert!(registry.station_by_code("STA2").is_none());
        assert!(registry.station_at(SlotKey::new(0, 1)).is_none());
    }

    #[test]
    fn duplicate_codes_apply_once() {
        let mut registry = Registry::new(AssignmentTable::with_slots(1, 1));
        let upstream = vec![
            StationRecord::new("STA1", "10.0.0.5", 5001),
            StationRecord::new("STA1", "10.0.0.8", 5001),
        ];
        let report = apply_station_list(&mut registry, &upstream);
        assert_eq!(report.added, vec!["STA1"]);
        assert_eq!(registry.station_count(), 1);
        assert_eq!(registry.station_by_code("STA1").unwrap().host, "10.0.0.5");
    }

    #[tokio::test]
    async fn unchanged_list_is_idempotent() {
        let source = Arc::new(FakeSource::new());
        source.set(Ok(vec![StationRecord::new("STA1", "10.0.0.5", 5001)]));
        let (mut sync, registry, _join) = sync_with(Arc::clone(&source));

        let first = sync.execute().await.unwrap();
        assert_eq!(first.mutations(), 1);
        let id = lock(&registry).station_by_code("STA1").unwrap().id.clone();

        let second = sync.execute().await.unwrap();
        assert!(second.is_empty());
        assert_eq!(lock(&registry).station_by_code("STA1").unwrap().id, id);
    }

    #[tokio::test]
    async fn failed_fetch_reverts_to_distribute() {
        let source = Arc::new(FakeSource::new());
        source.set(Err(RegistryError::Status {
            path: "stations".to_string(),
            status: 503,
        }));
        let (mut sync, registry, _join) = sync_with(Arc::clone(&source));

        assert!(sync.execute().await.is_err());
        assert_eq!(sync.state(), SyncStep::Distribute);
        assert_eq!(lock(&registry).station_count(), 0);

        source.set(Ok(vec![StationRecord::new("STA1", "10.0.0.5", 5001)]));
        sync.cycle().await;
        assert_eq!(lock(&registry).station_count(), 1);
    }
}
