//! # Watchdog
//!
//! Supervises every collection task and the persistence task. Tasks report
//! progress on the status channel; the watchdog alternates between two steps:
//!
//! - **ACTIVATE**: (re)arm every task flagged for activation. All tasks are
//!   flagged when registered.
//! - **MONITOR**: drain the status channel and look for stuck tasks. A task
//!   is stuck when it has been silent for longer than the limit, or (for the
//!   persistence task) when some table holds a record enqueued longer ago than
//!   the limit that has not been persisted yet.
//!
//! A stuck task has its current turn cancelled, its storage handles closed
//! and, for a collection task, its worker slot freed. Nothing is torn down at
//! process level.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::log_join::LogSink;
use super::registry::{lock, SharedRegistry, SlotKey};
use super::status::{Stage, StatusEvent, TaskControl};
use crate::config::EngineConfig;
use crate::connections::storage::{with_timeout, StorageClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStep {
    Activate,
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Collect(SlotKey),
    Persist,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StuckReason {
    Silent(Duration),
    Backlog { table: String, age: Duration },
}

impl fmt::Display for StuckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StuckReason::Silent(after) => write!(f, "no progress for {:?}", after),
            StuckReason::Backlog { table, age } => {
                write!(f, "{} has records waiting for {:?}", table, age)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StuckTask {
    pub name: String,
    pub kind: TaskKind,
    pub reason: StuckReason,
}

struct Monitored {
    kind: TaskKind,
    control: Arc<TaskControl>,
    created: Instant,
    last_progress: Instant,
    needs_activation: bool,
}

/// Closes `handle` until it reports inactive. Returns whether it did.
async fn close_until_inactive(
    handle: &dyn StorageClient,
    attempts: usize,
    limit: Duration,
) -> bool {
    for _ in 0..attempts {
        if !handle.active() {
            return true;
        }
        if let Err(err) = with_timeout(limit, "close", handle.close()).await {
            log::debug!("Close of {} failed: {}", handle.address(), err);
        }
    }
    !handle.active()
}

pub struct Watchdog {
    step: WatchStep,
    tasks: BTreeMap<String, Monitored>,
    events: mpsc::UnboundedReceiver<StatusEvent>,
    /// Per table: enqueued `dt_gen` not yet persisted, with the time it was seen.
    backlog: HashMap<String, BTreeMap<DateTime<Utc>, Instant>>,
    registry: SharedRegistry,
    log: LogSink,
    limit: Duration,
    interval: Duration,
    close_attempts: usize,
    close_timeout: Duration,
}

impl Watchdog {
    pub fn new(
        registry: SharedRegistry,
        events: mpsc::UnboundedReceiver<StatusEvent>,
        config: &EngineConfig,
        log: LogSink,
    ) -> Self {
        Self {
            step: WatchStep::Activate,
            tasks: BTreeMap::new(),
            events,
            backlog: HashMap::new(),
            registry,
            log,
            limit: config.watchdog_limit(),
            interval: config.watchdog_interval(),
            close_attempts: config.watchdog_close_attempts.max(1),
            close_timeout: config.close_timeout(),
        }
    }

    /// Puts a task under supervision; it is armed on the next ACTIVATE step.
    pub fn register(&mut self, kind: TaskKind, control: Arc<TaskControl>) {
        let now = Instant::now();
        self.tasks.insert(
            control.name().to_string(),
            Monitored {
                kind,
                control,
                created: now,
                last_progress: now,
                needs_activation: true,
            },
        );
        self.step = WatchStep::Activate;
    }

    pub fn state(&self) -> WatchStep {
        self.step
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    /// Enqueued records of `table` not yet persisted.
    pub fn backlog_depth(&self, table: &str) -> usize {
        self.backlog.get(table).map_or(0, BTreeMap::len)
    }

    /// Executes one step. Returns the tasks found stuck by a MONITOR step.
    pub async fn step(&mut self) -> Vec<StuckTask> {
        match self.step {
            WatchStep::Activate => {
                self.activate();
                self.step = WatchStep::Monitor;
                Vec::new()
            }
            WatchStep::Monitor => {
                self.drain_events();
                let stuck = self.detect();
                for task in &stuck {
                    self.recover(task).await;
                }
                if !stuck.is_empty() {
                    self.step = WatchStep::Activate;
                }
                stuck
            }
        }
    }

    fn activate(&mut self) {
        let now = Instant::now();
        for (name, task) in self.tasks.iter_mut().filter(|(_, t)| t.needs_activation) {
            task.control.rearm();
            task.created = now;
            task.last_progress = now;
            task.needs_activation = false;
            self.log.debug(format!("{} activated", name));
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match &event.stage {
                Stage::Enqueued { table, dt_gen } => {
                    self.backlog
                        .entry(table.clone())
                        .or_default()
                        .entry(*dt_gen)
                        .or_insert(event.at);
                }
                Stage::Persisted { table, dt_gen } => {
                    if let Some(waiting) = self.backlog.get_mut(table) {
                        waiting.retain(|enqueued, _| enqueued > dt_gen);
                    }
                }
                _ => {}
            }

            match self.tasks.get_mut(&event.origin) {
                Some(task) => task.last_progress = task.last_progress.max(event.at),
                None => self.log.debug(format!(
                    "Ignoring {:?} from unknown task {}",
                    event.stage, event.origin
                )),
            }
        }
    }

    fn detect(&self) -> Vec<StuckTask> {
        let now = Instant::now();
        let mut stuck = Vec::new();
        for (name, task) in self.tasks.iter().filter(|(_, t)| !t.needs_activation) {
            let silent = now.saturating_duration_since(task.last_progress);
            if silent > self.limit {
                stuck.push(StuckTask {
                    name: name.clone(),
                    kind: task.kind,
                    reason: StuckReason::Silent(silent),
                });
                continue;
            }
            if task.kind == TaskKind::Persist {
                if let Some((table, age)) = self.oldest_backlog(now) {
                    if age > self.limit {
                        stuck.push(StuckTask {
                            name: name.clone(),
                            kind: task.kind,
                            reason: StuckReason::Backlog { table, age },
                        });
                    }
                }
            }
        }
        stuck
    }

    fn oldest_backlog(&self, now: Instant) -> Option<(String, Duration)> {
        self.backlog
            .iter()
            .filter_map(|(table, waiting)| {
                waiting
                    .values()
                    .min()
                    .map(|seen| (table.clone(), now.saturating_duration_since(*seen)))
            })
            .max_by_key(|(_, age)| *age)
    }

    async fn recover(&mut self, stuck: &StuckTask) {
        let Some(task) = self.tasks.get_mut(&stuck.name) else {
            return;
        };
        self.log.warn(format!(
            "{} is stuck ({}), alive for {:?}; interrupting",
            stuck.name,
            stuck.reason,
            task.created.elapsed()
        ));
        task.control.interrupt();

        for (key, handle) in task.control.storage_handles() {
            let closed =
                close_until_inactive(handle.as_ref(), self.close_attempts, self.close_timeout)
                    .await;
            if closed {
                self.log.info(format!("Closed storage handle {} of {}", key, stuck.name));
            } else {
                self.log.warn(format!(
                    "Storage handle {} of {} still active after {} close attempts",
                    key, stuck.name, self.close_attempts
                ));
            }
        }

        match task.kind {
            TaskKind::Collect(key) => {
                let freed = lock(&self.registry).unassign_slot(key);
                if let Some(id) = freed {
                    self.log.info(format!("Freed {} held by station {}", key, id));
                }
            }
            TaskKind::Persist => self.backlog.clear(),
        }
        task.needs_activation = true;
    }

    /// Runs the ACTIVATE/MONITOR cycle until `shutdown`.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                stuck = self.step() => {
                    if !stuck.is_empty() {
                        log::debug!("Watchdog recovered {} tasks", stuck.len());
                    }
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        log::debug!("Watchdog stopped");
    }
}
