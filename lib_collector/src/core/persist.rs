//! # Persistence Pipeline
//!
//! A single task drains the outbound queue into a fixed set of logical
//! storage slots (`DB_0`, `DB_1`, ...). Each slot owns at most one storage
//! handle and walks through three steps:
//!
//! 1.  **CREATE**: bind the next storage target (round-robin) and build a
//!     client for it through the [`StorageFactory`].
//! 2.  **CONNECT**: open the handle in a spawned child task with its own
//!     deadline, make sure the target database exists and learn its tables.
//! 3.  **SAVE**: drain the queue, group rows per table, prepare unknown
//!     tables and submit one fire-and-forget `save_data` per table.
//!
//! ## Delivery guarantees
//!
//! Every submission is tracked as a [`PendingSave`]. At the start of each
//! cycle the pipeline settles finished or overdue saves: a failed or timed
//! out save puts its fresh rows back on the queue marked as resubmitted, and
//! rows that were already a resubmission are set aside on the abandoned list
//! (logged at error level). A row is therefore submitted at most twice and is
//! never dropped without a trace.
//!
//! Fresh rows at or before a table's watermark were already submitted once
//! and are discarded; resubmitted rows bypass that check.
//!
//! Connects run as child tasks too, so a slot stuck on an unreachable target
//! never holds up the slots that are already saving.

use chrono::{DateTime, Utc};
use log::Level;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::log_join::LogSink;
use super::queue::{OutboundQueue, OutboundRecord};
use super::registry::{lock, SharedRegistry, StorageTargetId};
use super::status::{Stage, StatusReporter, TaskControl};
use crate::config::EngineConfig;
use crate::connections::storage::{with_timeout, StorageClient, StorageError, StorageFactory};

/// Field every table gets a secondary index on.
pub const TIME_INDEX_FIELD: &str = "DT_GEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbStep {
    Create,
    Connect,
    Save,
}

/// Shared handles the pipeline works with.
#[derive(Clone)]
pub struct PersistContext {
    pub registry: SharedRegistry,
    pub storage: Arc<StorageFactory>,
    pub queue: OutboundQueue,
    pub config: Arc<EngineConfig>,
    pub log: LogSink,
    pub status: StatusReporter,
    /// Where storage handles are published for the watchdog.
    pub control: Arc<TaskControl>,
}

/// One in-flight `save_data` call.
pub struct PendingSave {
    table: String,
    fresh: Vec<OutboundRecord>,
    resubmitted: Vec<OutboundRecord>,
    submitted: Instant,
    handle: JoinHandle<Result<usize, StorageError>>,
    previous_watermark: Option<DateTime<Utc>>,
    /// Watermark installed by this submission.
    watermark: DateTime<Utc>,
    /// Newest `dt_gen` among the submitted rows.
    max_dt: DateTime<Utc>,
}

impl PendingSave {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn rows(&self) -> usize {
        self.fresh.len() + self.resubmitted.len()
    }
}

struct StorageSlot {
    name: String,
    step: DbStep,
    target: Option<StorageTargetId>,
    client: Option<Arc<dyn StorageClient>>,
    /// Connect running in the background while the slot is in CONNECT.
    connecting: Option<JoinHandle<Result<(), StorageError>>>,
    pending: BTreeMap<String, PendingSave>,
    retry_at: Option<Instant>,
}

impl StorageSlot {
    fn new(index: usize) -> Self {
        Self {
            name: format!("DB_{index}"),
            step: DbStep::Create,
            target: None,
            client: None,
            connecting: None,
            pending: BTreeMap::new(),
            retry_at: None,
        }
    }

    fn abort_connect(&mut self) {
        if let Some(handle) = self.connecting.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Default)]
struct TableBatch {
    fresh: Vec<OutboundRecord>,
    resubmitted: Vec<OutboundRecord>,
}

fn group_by_table(records: Vec<OutboundRecord>) -> BTreeMap<String, TableBatch> {
    let mut batches: BTreeMap<String, TableBatch> = BTreeMap::new();
    for record in records {
        let batch = batches.entry(record.table.clone()).or_default();
        if record.resubmitted {
            batch.resubmitted.push(record);
        } else {
            batch.fresh.push(record);
        }
    }
    batches
}

/// Opens `client` and makes sure its database exists.
async fn connect_storage(
    client: &dyn StorageClient,
    limit: Duration,
    op: Duration,
) -> Result<(), StorageError> {
    with_timeout(limit, "async_connect", client.async_connect()).await?;
    let db = client.default_db();
    let databases = with_timeout(op, "list_dbs", client.list_dbs()).await?;
    if !databases.contains(&db) {
        with_timeout(op, "create_db", client.create_db(&db)).await?;
    }
    with_timeout(op, "list_tables", client.list_tables()).await?;
    Ok(())
}

/// Spawns the connect of `client`. A failed connect closes the handle again.
fn spawn_connect(
    client: Arc<dyn StorageClient>,
    config: &EngineConfig,
) -> JoinHandle<Result<(), StorageError>> {
    let limit = config.storage_connect_timeout();
    let op = config.storage_op_timeout();
    let close = config.close_timeout();
    tokio::spawn(async move {
        let result = connect_storage(client.as_ref(), limit, op).await;
        if result.is_err() {
            close_quietly(client.as_ref(), close).await;
        }
        result
    })
}

async fn prepare_table(
    client: &dyn StorageClient,
    table: &str,
    op: Duration,
) -> Result<(), StorageError> {
    with_timeout(op, "create_table", client.create_table(table)).await?;
    with_timeout(op, "create_index", client.create_index(table, TIME_INDEX_FIELD)).await
}

/// Closes a handle, logging instead of failing.
async fn close_quietly(client: &dyn StorageClient, limit: Duration) {
    if let Err(err) = with_timeout(limit, "close", client.close()).await {
        log::debug!("Closing {} failed: {}", client.address(), err);
    }
}

/// Waits for a settled save. Overdue saves are aborted and reported as timeouts.
async fn settle(
    mut pending: PendingSave,
    limit: Duration,
) -> Result<(PendingSave, usize), (PendingSave, StorageError)> {
    if !pending.handle.is_finished() {
        pending.handle.abort();
        return Err((
            pending,
            StorageError::Timeout {
                operation: "save_data",
                after: limit,
            },
        ));
    }
    match (&mut pending.handle).await {
        Ok(Ok(stored)) => Ok((pending, stored)),
        Ok(Err(err)) => Err((pending, err)),
        Err(join) => Err((pending, StorageError::Query(join.to_string()))),
    }
}

pub struct Persistence {
    ctx: PersistContext,
    slots: Vec<StorageSlot>,
    /// Drained rows not yet handed to a save.
    staged: BTreeMap<String, TableBatch>,
    watermarks: HashMap<String, DateTime<Utc>>,
    persisted: HashMap<String, usize>,
    /// Rows that failed twice, newest last, at most `abandoned_limit` of them.
    abandoned: VecDeque<OutboundRecord>,
    /// Abandoned rows dropped because the list was full.
    abandoned_overflow: usize,
    warned_no_targets: bool,
}

impl Persistence {
    pub fn new(ctx: PersistContext) -> Self {
        let slots = (0..ctx.config.persistence_slots.max(1)).map(StorageSlot::new).collect();
        Self {
            ctx,
            slots,
            staged: BTreeMap::new(),
            watermarks: HashMap::new(),
            persisted: HashMap::new(),
            abandoned: VecDeque::new(),
            abandoned_overflow: 0,
            warned_no_targets: false,
        }
    }

    pub fn slot_steps(&self) -> Vec<(String, DbStep)> {
        self.slots.iter().map(|s| (s.name.clone(), s.step)).collect()
    }

    /// Storage target bound to each slot, if any.
    pub fn slot_targets(&self) -> Vec<(String, Option<StorageTargetId>)> {
        self.slots.iter().map(|s| (s.name.clone(), s.target.clone())).collect()
    }

    pub fn pending_saves(&self) -> usize {
        self.slots.iter().map(|s| s.pending.len()).sum()
    }

    pub fn watermark(&self, table: &str) -> Option<DateTime<Utc>> {
        self.watermarks.get(table).copied()
    }

    /// Rows that failed twice and were set aside.
    pub fn abandoned(&self) -> &VecDeque<OutboundRecord> {
        &self.abandoned
    }

    /// Empties the abandoned list.
    pub fn take_abandoned(&mut self) -> Vec<OutboundRecord> {
        self.abandoned.drain(..).collect()
    }

    /// Abandoned rows that did not fit on the list and were dropped.
    pub fn abandoned_overflow(&self) -> usize {
        self.abandoned_overflow
    }

    /// One orchestrator pass over every slot.
    pub async fn cycle(&mut self) {
        self.restore_staged();
        self.recover().await;
        self.create_slots().await;
        self.connect_slots().await;
        let submitted = self.save_slots().await;
        self.ctx.status.report(Stage::Update);

        if self.ctx.queue.is_empty() {
            tokio::time::sleep(self.ctx.config.retry_pause()).await;
        } else if submitted == 0 {
            // Every slot is busy or reconnecting.
            tokio::time::sleep(Duration::from_millis(50)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    /// Puts drained but unsubmitted rows back at the head of the queue.
    fn restore_staged(&mut self) {
        for (_, batch) in std::mem::take(&mut self.staged) {
            self.ctx.queue.push_front_all(batch.fresh);
            self.ctx.queue.push_front_all(batch.resubmitted);
        }
    }

    async fn recover(&mut self) {
        let limit = self.ctx.config.save_timeout();
        let mut broken: Vec<usize> = Vec::new();

        for idx in 0..self.slots.len() {
            let settled: Vec<String> = self.slots[idx]
                .pending
                .iter()
                .filter(|(_, p)| p.handle.is_finished() || p.submitted.elapsed() >= limit)
                .map(|(table, _)| table.clone())
                .collect();

            for table in settled {
                let Some(pending) = self.slots[idx].pending.remove(&table) else {
                    continue;
                };
                match settle(pending, limit).await {
                    Ok((pending, stored)) => self.saved(pending, stored),
                    Err((pending, err)) => {
                        self.ctx.log.error(
                            format!(
                                "Save of {} rows into {} on {} failed",
                                pending.rows(),
                                pending.table,
                                self.slots[idx].name
                            ),
                            &err,
                        );
                        self.requeue(pending);
                        if !broken.contains(&idx) {
                            broken.push(idx);
                        }
                    }
                }
            }
        }

        let close = self.ctx.config.close_timeout();
        for idx in broken {
            let slot = &mut self.slots[idx];
            slot.step = DbStep::Connect;
            if let Some(client) = slot.client.clone() {
                close_quietly(client.as_ref(), close).await;
            }
        }
    }

    fn saved(&mut self, pending: PendingSave, stored: usize) {
        self.ctx.status.report(Stage::Persisted {
            table: pending.table.clone(),
            dt_gen: pending.max_dt,
        });
        let count = self.persisted.entry(pending.table.clone()).or_default();
        *count += stored;
        if *count >= self.ctx.config.progress_every {
            self.ctx.log.info(format!(
                "{} rows persisted into {}, newest at {}",
                count, pending.table, pending.max_dt
            ));
            *count = 0;
        }
    }

    /// Returns the rows of a failed save to the queue, at most once.
    ///
    /// The watermark installed by the failed save stays: its fresh rows come
    /// back as resubmissions, which bypass it.
    fn requeue(&mut self, pending: PendingSave) {
        self.ctx.log.debug(format!(
            "{} watermark kept at {} (was {:?} before the failed save)",
            pending.table, pending.watermark, pending.previous_watermark
        ));

        let fresh: Vec<OutboundRecord> = pending
            .fresh
            .into_iter()
            .map(|mut record| {
                record.resubmitted = true;
                record
            })
            .collect();
        if !fresh.is_empty() {
            self.ctx.log.warn(format!(
                "Resubmitting {} rows of {}",
                fresh.len(),
                pending.table
            ));
            self.ctx.queue.push_all(fresh);
        }

        if !pending.resubmitted.is_empty() {
            self.set_aside(&pending.table, pending.resubmitted);
        }
    }

    /// Keeps rows that failed twice, dropping the oldest past the limit.
    fn set_aside(&mut self, table: &str, rows: Vec<OutboundRecord>) {
        self.ctx.log.log(
            Level::Error,
            format!(
                "{} rows of {} failed a second time and were set aside",
                rows.len(),
                table
            ),
        );
        self.abandoned.extend(rows);

        let limit = self.ctx.config.abandoned_limit;
        if self.abandoned.len() > limit {
            let dropped = self.abandoned.len() - limit;
            self.abandoned.drain(..dropped);
            self.abandoned_overflow += dropped;
            self.ctx.log.log(
                Level::Error,
                format!(
                    "Abandoned list full: dropped {} oldest rows ({} dropped so far)",
                    dropped, self.abandoned_overflow
                ),
            );
        }
    }

    async fn create_slots(&mut self) {
        let close = self.ctx.config.close_timeout();
        let mut missing_target = false;

        for idx in 0..self.slots.len() {
            if self.slots[idx].step != DbStep::Create {
                continue;
            }
            self.slots[idx].abort_connect();
            if let Some(stale) = self.slots[idx].client.take() {
                close_quietly(stale.as_ref(), close).await;
                self.ctx.control.detach_storage(&self.slots[idx].name);
            }

            let target = lock(&self.ctx.registry).next_target();
            let Some(target) = target else {
                missing_target = true;
                continue;
            };

            let slot = &mut self.slots[idx];
            match self.ctx.storage.create(&target) {
                Ok(client) => {
                    self.ctx.log.debug(format!(
                        "{} bound to {} ({})",
                        slot.name,
                        target.id,
                        client.address()
                    ));
                    self.ctx.control.attach_storage(&slot.name, Arc::clone(&client));
                    slot.client = Some(client);
                    slot.target = Some(target.id);
                    slot.step = DbStep::Connect;
                }
                Err(err) => self
                    .ctx
                    .log
                    .error(format!("Could not create a storage client for {}", slot.name), &err),
            }
        }

        if missing_target && !self.warned_no_targets {
            self.ctx
                .log
                .warn("No storage target known yet, persistence slots stay idle");
        }
        self.warned_no_targets = missing_target;
    }

    /// Starts a background connect for every idle CONNECT slot and collects
    /// the ones that finished. Never waits on a connect in progress.
    async fn connect_slots(&mut self) {
        for idx in 0..self.slots.len() {
            let slot = &mut self.slots[idx];
            if slot.step != DbStep::Connect {
                continue;
            }
            let Some(client) = slot.client.clone() else {
                slot.abort_connect();
                slot.step = DbStep::Create;
                continue;
            };

            if let Some(handle) = slot.connecting.take() {
                if !handle.is_finished() {
                    slot.connecting = Some(handle);
                    continue;
                }
                let result = match handle.await {
                    Ok(result) => result,
                    Err(join) => Err(StorageError::Connect(join.to_string())),
                };
                match result {
                    Ok(()) => {
                        slot.step = DbStep::Save;
                        slot.retry_at = None;
                        self.ctx
                            .log
                            .info(format!("{} connected to {}", slot.name, client.address()));
                        self.ctx.status.report(Stage::Connect);
                    }
                    Err(err) => {
                        slot.retry_at = Some(Instant::now() + self.ctx.config.retry_pause() * 3);
                        self.ctx.log.error(
                            format!("{} could not connect to {}", slot.name, client.address()),
                            &err,
                        );
                    }
                }
                continue;
            }

            if slot.retry_at.is_some_and(|at| Instant::now() < at) {
                continue;
            }
            if client.active() {
                slot.step = DbStep::Save;
                continue;
            }
            slot.connecting = Some(spawn_connect(client, &self.ctx.config));
        }
    }

    /// Hands queued rows to idle slots. Returns the number of saves submitted.
    async fn save_slots(&mut self) -> usize {
        let op = self.ctx.config.storage_op_timeout();
        let close = self.ctx.config.close_timeout();
        let mut submitted = 0;

        for idx in 0..self.slots.len() {
            if self.ctx.queue.is_empty() {
                break;
            }
            if self.slots[idx].step != DbStep::Save || !self.slots[idx].pending.is_empty() {
                continue;
            }
            let Some(client) = self.slots[idx].client.clone() else {
                self.slots[idx].step = DbStep::Create;
                continue;
            };
            if !client.active() {
                self.slots[idx].step = DbStep::Connect;
                continue;
            }

            self.staged = group_by_table(self.ctx.queue.drain());
            let tables: Vec<String> = self.staged.keys().cloned().collect();
            for table in tables {
                if !client.tables().contains(&table) {
                    if let Err(err) = prepare_table(client.as_ref(), &table, op).await {
                        self.ctx.log.error(
                            format!("{} could not prepare table {}", self.slots[idx].name, table),
                            &err,
                        );
                        self.restore_staged();
                        close_quietly(client.as_ref(), close).await;
                        self.slots[idx].step = DbStep::Connect;
                        break;
                    }
                    self.ctx.log.debug(format!(
                        "Created table {} with an index on {}",
                        table, TIME_INDEX_FIELD
                    ));
                }
                if let Some(batch) = self.staged.remove(&table) {
                    if self.submit(idx, &client, table, batch) {
                        submitted += 1;
                    }
                }
            }
        }
        submitted
    }

    /// Filters `batch` against the watermark and spawns its save.
    fn submit(
        &mut self,
        idx: usize,
        client: &Arc<dyn StorageClient>,
        table: String,
        batch: TableBatch,
    ) -> bool {
        let previous = self.watermarks.get(&table).copied();
        let offered = batch.fresh.len();
        let fresh: Vec<OutboundRecord> = batch
            .fresh
            .into_iter()
            .filter(|record| previous.is_none_or(|mark| record.dt_gen > mark))
            .collect();
        if fresh.len() < offered {
            self.ctx.log.debug(format!(
                "Discarded {} already submitted rows of {}",
                offered - fresh.len(),
                table
            ));
        }

        let Some(max_dt) = fresh.iter().chain(&batch.resubmitted).map(|r| r.dt_gen).max() else {
            return false;
        };
        let watermark = previous.map_or(max_dt, |mark| mark.max(max_dt));
        self.watermarks.insert(table.clone(), watermark);

        let rows: Vec<Value> = fresh
            .iter()
            .chain(&batch.resubmitted)
            .map(|record| record.doc.clone())
            .collect();
        let handle = tokio::spawn({
            let client = Arc::clone(client);
            let table = table.clone();
            async move { client.save_data(&table, rows).await }
        });

        self.slots[idx].pending.insert(
            table.clone(),
            PendingSave {
                table,
                fresh,
                resubmitted: batch.resubmitted,
                submitted: Instant::now(),
                handle,
                previous_watermark: previous,
                watermark,
                max_dt,
            },
        );
        self.ctx.status.report(Stage::Save);
        true
    }

    /// Recovers from a watchdog interruption: unfinished saves are treated as
    /// timed out and every slot reconnects.
    pub async fn interrupted(&mut self) {
        self.ctx
            .log
            .warn(format!("Persistence interrupted with {} saves in flight", self.pending_saves()));
        self.restore_staged();

        let limit = self.ctx.config.save_timeout();
        for idx in 0..self.slots.len() {
            let pending = std::mem::take(&mut self.slots[idx].pending);
            for (_, save) in pending {
                // Saves that already finished are settled normally.
                match settle(save, limit).await {
                    Ok((save, stored)) => self.saved(save, stored),
                    Err((save, _)) => self.requeue(save),
                }
            }
        }

        let close = self.ctx.config.close_timeout();
        for slot in &mut self.slots {
            slot.abort_connect();
            match slot.client.clone() {
                Some(client) => {
                    close_quietly(client.as_ref(), close).await;
                    slot.step = DbStep::Connect;
                }
                None => slot.step = DbStep::Create,
            }
        }
    }

    /// Lets in-flight saves finish (bounded by the save timeout) and closes every handle.
    async fn shutdown(&mut self) {
        self.restore_staged();
        let limit = self.ctx.config.save_timeout();
        let close = self.ctx.config.close_timeout();

        for idx in 0..self.slots.len() {
            let pending = std::mem::take(&mut self.slots[idx].pending);
            for (table, save) in pending {
                if tokio::time::timeout(limit, save.handle).await.is_err() {
                    log::warn!("Save into {} still running at shutdown", table);
                }
            }
            self.slots[idx].abort_connect();
            if let Some(client) = self.slots[idx].client.take() {
                close_quietly(client.as_ref(), close).await;
                self.ctx.control.detach_storage(&self.slots[idx].name);
            }
        }

        let left = self.ctx.queue.len();
        if left > 0 {
            log::warn!("{} records were still queued at shutdown", left);
        }
    }

    /// Drives the pipeline until `shutdown`, honouring interruptions issued
    /// through the context's control.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let control = Arc::clone(&self.ctx.control);
        loop {
            let interrupt = control.token();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interrupt.cancelled() => self.interrupted().await,
                _ = self.cycle() => {}
            }
        }
        self.shutdown().await;
        log::debug!("Persistence task stopped");
    }
}
