//! # Collection State Machine
//!
//! One [`CollectTask`] drives one worker slot for the lifetime of the engine.
//! Each call to [`CollectTask::turn`] executes exactly one step:
//!
//! - **CREATE**: build the protocol client for the station assigned to the
//!   slot and a fresh latency ring buffer.
//! - **CONNECT**: open the connection in a spawned child task carrying its
//!   own deadline, so abandoning the turn never tears down a half-done
//!   handshake.
//! - **COLLECT**: read one record, decorate it, queue it for persistence,
//!   heartbeat, and run a catch-up burst when the station is falling behind.
//!
//! Transient read failures always land in CONNECT. Only a reassignment, an
//! upstream change of the station or a vanished connection id goes back to
//! CREATE.

use chrono::{SecondsFormat, Utc};
use log::Level;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::catch_up::run_catch_up;
use super::log_join::LogSink;
use super::queue::{OutboundQueue, OutboundRecord};
use super::registry::{lock, SharedRegistry, SlotKey, Station, StationId};
use super::ring_buffer::{RingBuffer, Sample};
use super::status::{Stage, StatusReporter, TaskControl};
use crate::config::EngineConfig;
use crate::connections::protocol::{
    with_timeout, ConnectionId, ProtocolClient, ProtocolError, ProtocolFactory, ProtocolParams,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectStep {
    Create,
    Connect,
    Collect,
}

/// Shared handles a collection task works with.
#[derive(Clone)]
pub struct CollectContext {
    pub registry: SharedRegistry,
    pub protocols: Arc<ProtocolFactory>,
    pub queue: OutboundQueue,
    pub config: Arc<EngineConfig>,
    pub log: LogSink,
    pub status: StatusReporter,
}

/// Borrowed view used for single reads, so catch-up can re-issue them.
struct RecordReader<'a> {
    client: &'a dyn ProtocolClient,
    connection: &'a ConnectionId,
    table: &'a str,
    trace: Value,
    queue: &'a OutboundQueue,
    status: &'a StatusReporter,
    read_timeout: Duration,
}

impl RecordReader<'_> {
    /// Reads one header and record, queues the decorated record and returns
    /// its latency stamped with the record's own time.
    async fn read_one(&self) -> Result<Sample, ProtocolError> {
        let record = with_timeout(self.read_timeout, "read", async {
            self.client.get_message_header(self.connection).await?;
            self.client.get_records().await
        })
        .await?;
        if !record.done {
            return Err(ProtocolError::Decode("incomplete record".to_string()));
        }

        let received = Utc::now();
        let dt_gen = record.timestamp;
        let latency = (received - dt_gen).num_milliseconds() as f64 / 1000.0;

        let mut doc = record.fields;
        doc.insert("TRACE".to_string(), self.trace.clone());
        doc.insert(
            "DT_GEN".to_string(),
            Value::String(dt_gen.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        doc.insert(
            "DT_RECV".to_string(),
            Value::String(received.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        doc.insert("DELTA_TIME".to_string(), json!(latency));

        self.queue
            .push(OutboundRecord::new(self.table, dt_gen, Value::Object(doc)));
        self.status.report(Stage::Collect);
        self.status.report(Stage::Enqueued {
            table: self.table.to_string(),
            dt_gen,
        });
        Ok(Sample { at: dt_gen, latency })
    }

    async fn heart_beat(&self, limit: Duration) -> Result<(), ProtocolError> {
        with_timeout(limit, "heartbeat", self.client.heart_beat(self.connection)).await
    }
}

/// One COLLECT step: a read, the heartbeat and an optional catch-up burst.
/// Returns how many records were queued.
async fn collect_records(
    reader: &RecordReader<'_>,
    ring: &mut RingBuffer,
    config: &EngineConfig,
    log: &LogSink,
) -> Result<usize, ProtocolError> {
    let first = reader.read_one().await?;
    let latency = first.latency;
    ring.add(first);
    reader.heart_beat(config.heartbeat_timeout()).await?;

    let policy = config.catch_up;
    if !policy.triggers(latency, ring.sigma()) {
        return Ok(1);
    }

    log.debug(format!(
        "Giving priority to {}: latency {:.3}s, sigma {:.3}s",
        reader.table,
        latency,
        ring.sigma()
    ));
    let outcome = run_catch_up(&policy, latency, move || reader.read_one()).await?;
    for sample in &outcome.samples {
        ring.add(*sample);
    }
    if !outcome.converged {
        log.debug(format!(
            "Catch-up on {} stopped after {} reads, control mean {:.3}s",
            reader.table,
            outcome.extra_reads(),
            outcome.control_mean
        ));
    }
    Ok(1 + outcome.extra_reads())
}

pub struct CollectTask {
    key: SlotKey,
    ctx: CollectContext,
    step: CollectStep,
    station: Option<StationId>,
    client: Option<Arc<dyn ProtocolClient>>,
    connection: Option<ConnectionId>,
    table: String,
    ring: RingBuffer,
    last_data: Instant,
    records: usize,
}

impl CollectTask {
    pub fn new(key: SlotKey, ctx: CollectContext) -> Self {
        let ring = RingBuffer::new(key.to_string(), ctx.config.ring_buffer_size);
        Self {
            key,
            ctx,
            step: CollectStep::Create,
            station: None,
            client: None,
            connection: None,
            table: String::new(),
            ring,
            last_data: Instant::now(),
            records: 0,
        }
    }

    pub fn key(&self) -> SlotKey {
        self.key
    }

    pub fn step(&self) -> CollectStep {
        self.step
    }

    pub fn station(&self) -> Option<&StationId> {
        self.station.as_ref()
    }

    pub fn connection(&self) -> Option<&ConnectionId> {
        self.connection.as_ref()
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Executes one step of the state machine.
    pub async fn turn(&mut self) {
        let assigned = lock(&self.ctx.registry).station_at(self.key).cloned();
        let Some(station) = assigned else {
            self.release().await;
            self.station = None;
            self.ctx.status.report(Stage::Update);
            tokio::time::sleep(self.ctx.config.retry_pause()).await;
            return;
        };

        if self.station.as_ref() != Some(&station.id) {
            if self.station.is_some() {
                self.ctx
                    .log
                    .info(format!("{} reassigned to station {}", self.key, station.code));
                self.release().await;
            }
            self.station = Some(station.id.clone());
        } else if station.changed && self.step != CollectStep::Create {
            self.ctx.log.info(format!(
                "Station {} changed upstream, rebuilding its client",
                station.code
            ));
            self.release().await;
        } else if self.connection_vanished() {
            self.ctx.log.warn(format!(
                "Connection of station {} is no longer listed by its client",
                station.code
            ));
            self.release().await;
        }

        match self.step {
            CollectStep::Create => self.create(&station).await,
            CollectStep::Connect => self.connect(&station).await,
            CollectStep::Collect => self.collect(&station).await,
        }
    }

    fn connection_vanished(&self) -> bool {
        match (&self.client, &self.connection) {
            (Some(client), Some(id)) => !client.clients().contains(id),
            _ => false,
        }
    }

    async fn create(&mut self, station: &Station) {
        let params = ProtocolParams::from_station(station, self.ctx.config.read_timeout());
        match self.ctx.protocols.create(&params) {
            Ok(client) => {
                self.table = station.table_name();
                self.ring = RingBuffer::new(self.table.clone(), self.ctx.config.ring_buffer_size);
                self.client = Some(client);
                self.connection = None;
                lock(&self.ctx.registry).clear_changed(&station.id);
                self.step = CollectStep::Connect;
                self.ctx.log.info(format!(
                    "{} client for station {} created on {}",
                    station.protocol, station.code, self.key
                ));
                self.ctx.status.report(Stage::Update);
            }
            Err(err) => {
                self.ctx.log.error(
                    format!(
                        "Could not create a {} client for station {}",
                        station.protocol, station.code
                    ),
                    &err,
                );
                tokio::time::sleep(self.ctx.config.retry_pause()).await;
            }
        }
    }

    async fn connect(&mut self, station: &Station) {
        let Some(client) = self.client.clone() else {
            self.step = CollectStep::Create;
            return;
        };

        let limit = self.ctx.config.connect_timeout();
        let handshake = tokio::spawn({
            let client = Arc::clone(&client);
            async move { with_timeout(limit, "connect", client.connect()).await }
        });
        let result = match handshake.await {
            Ok(result) => result,
            Err(join) => Err(ProtocolError::Connect {
                address: client.address(),
                reason: join.to_string(),
            }),
        };

        match result {
            Ok(id) => {
                lock(&self.ctx.registry).mark_connected(&station.id);
                self.ctx.log.info(format!(
                    "Station {} connected on {} as {}",
                    station.code, self.key, id
                ));
                self.connection = Some(id);
                self.last_data = Instant::now();
                self.records = 0;
                self.step = CollectStep::Collect;
                self.ctx.status.report(Stage::Connect);
            }
            Err(err) => {
                self.ctx.log.error(
                    format!("Station {} could not connect to {}", station.code, client.address()),
                    &err,
                );
                self.reconnect().await;
                tokio::time::sleep(self.ctx.config.retry_pause()).await;
            }
        }
    }

    async fn collect(&mut self, station: &Station) {
        let liveness = self.ctx.config.liveness_limit();
        if self.last_data.elapsed() >= liveness {
            self.ctx.log.warn(format!(
                "No record from station {} for {:?}, reconnecting",
                station.code, liveness
            ));
            self.reconnect().await;
            return;
        }

        let (Some(client), Some(connection)) = (self.client.clone(), self.connection.clone()) else {
            self.step = CollectStep::Connect;
            return;
        };

        let outcome = {
            let reader = RecordReader {
                client: client.as_ref(),
                connection: &connection,
                table: &self.table,
                trace: json!([self.key.process, self.key.slot, station.id.0, connection.0]),
                queue: &self.ctx.queue,
                status: &self.ctx.status,
                read_timeout: self.ctx.config.read_timeout(),
            };
            collect_records(&reader, &mut self.ring, &self.ctx.config, &self.ctx.log).await
        };

        match outcome {
            Ok(read) => {
                self.last_data = Instant::now();
                self.records += read;
                if self.records >= self.ctx.config.progress_every {
                    self.ctx.log.info(format!(
                        "Station {} on {}: {} records, mean latency {:.3}s",
                        station.code,
                        self.key,
                        self.records,
                        self.ring.mean()
                    ));
                    self.records = 0;
                }
            }
            Err(err) => {
                self.ctx
                    .log
                    .error(format!("Reading station {} failed", station.code), &err);
                self.reconnect().await;
            }
        }
    }

    /// Closes the connection (if any) and clears the station flags.
    ///
    /// Never fails: close errors and timeouts only change the reported severity.
    async fn reset_connection(&mut self) -> (String, Level) {
        if let Some(id) = &self.station {
            lock(&self.ctx.registry).reset_flags(id);
        }
        let (Some(client), Some(connection)) = (self.client.clone(), self.connection.take()) else {
            return (format!("{} had no open connection", self.key), Level::Debug);
        };
        let limit = self.ctx.config.close_timeout();
        match with_timeout(limit, "close", client.close(&connection)).await {
            Ok(()) => (
                format!("Station {} closed connection {}", client.station(), connection),
                Level::Info,
            ),
            Err(err) => (
                format!(
                    "Station {} connection {} was already gone: {}",
                    client.station(),
                    connection,
                    err
                ),
                Level::Warn,
            ),
        }
    }

    async fn reconnect(&mut self) {
        let (reason, level) = self.reset_connection().await;
        self.ctx.log.log(level, reason);
        self.step = CollectStep::Connect;
    }

    /// Drops connection and client; the next step is CREATE.
    async fn release(&mut self) {
        if self.connection.is_some() {
            let (reason, level) = self.reset_connection().await;
            self.ctx.log.log(level, reason);
        }
        self.client = None;
        self.step = CollectStep::Create;
    }

    /// Recovers from a watchdog interruption.
    pub async fn interrupted(&mut self) {
        self.ctx
            .log
            .warn(format!("{} interrupted during {:?}", self.key, self.step));
        let (reason, level) = self.reset_connection().await;
        self.ctx.log.log(level, reason);
        self.step = if self.client.is_some() {
            CollectStep::Connect
        } else {
            CollectStep::Create
        };
    }

    /// Drives the slot until `shutdown`, honouring interruptions issued through `control`.
    pub async fn run(mut self, control: Arc<TaskControl>, shutdown: CancellationToken) {
        loop {
            let interrupt = control.token();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interrupt.cancelled() => self.interrupted().await,
                _ = self.turn() => {}
            }
        }
        self.release().await;
        log::debug!("Collection task {} stopped", self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log_join::LogJoin;
    use crate::core::registry::{AssignmentTable, Registry};
    use crate::core::status::StatusEvent;
    use crate::retrieve::registry_api::StationRecord;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use serde_json::Map;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use crate::connections::protocol::ProtocolRecord;

    #[derive(Default)]
    struct ScriptedClient {
        latencies: Mutex<VecDeque<f64>>,
        fail_reads: AtomicBool,
        open: Mutex<HashSet<ConnectionId>>,
        connects: AtomicUsize,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl ProtocolClient for ScriptedClient {
        fn station(&self) -> &str {
            "STA1"
        }

        fn address(&self) -> String {
            "10.0.0.5:5001".to_string()
        }

        async fn connect(&self) -> Result<ConnectionId, ProtocolError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            let id = ConnectionId(format!("STA1-{n}"));
            self.open.lock().unwrap().insert(id.clone());
            Ok(id)
        }

        async fn get_message_header(&self, _id: &ConnectionId) -> Result<Value, ProtocolError> {
            Ok(Value::Null)
        }

        async fn get_records(&self) -> Result<ProtocolRecord, ProtocolError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(ProtocolError::Read("connection reset".to_string()));
            }
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            let latency = self.latencies.lock().unwrap().pop_front().unwrap_or(0.1);
            let mut fields = Map::new();
            fields.insert("N".to_string(), json!(n));
            Ok(ProtocolRecord {
                done: true,
                timestamp: Utc::now() - TimeDelta::milliseconds((latency * 1000.0) as i64),
                fields,
            })
        }

        async fn heart_beat(&self, _id: &ConnectionId) -> Result<(), ProtocolError> {
            Ok(())
        }

        async fn close(&self, id: &ConnectionId) -> Result<(), ProtocolError> {
            self.open.lock().unwrap().remove(id);
            Ok(())
        }

        fn clients(&self) -> HashSet<ConnectionId> {
            self.open.lock().unwrap().clone()
        }
    }

    struct Fixture {
        task: CollectTask,
        client: Arc<ScriptedClient>,
        registry: SharedRegistry,
        queue: OutboundQueue,
        station: StationId,
        _events: mpsc::UnboundedReceiver<StatusEvent>,
        _join: LogJoin,
    }

    fn fixture() -> Fixture {
        let mut registry = Registry::new(AssignmentTable::with_slots(1, 1));
        let station = registry
            .add_station(&StationRecord::new("STA1", "10.0.0.5", 5001).with_protocol("script"));
        registry.assign_pending();
        let registry = registry.shared();

        let client = Arc::new(ScriptedClient::default());
        let mut protocols = ProtocolFactory::new();
        let shared = Arc::clone(&client);
        protocols.register("SCRIPT", move |_| Ok(Arc::clone(&shared) as Arc<dyn ProtocolClient>));

        let (join, log) = LogJoin::new("test", Duration::from_secs(5), 256);
        let (tx, events) = mpsc::unbounded_channel();
        let queue = OutboundQueue::new();
        let ctx = CollectContext {
            registry: Arc::clone(&registry),
            protocols: Arc::new(protocols),
            queue: queue.clone(),
            config: Arc::new(EngineConfig::default()),
            log,
            status: StatusReporter::new("process_sta_task:P0:ICO_0", tx),
        };
        Fixture {
            task: CollectTask::new(SlotKey::new(0, 0), ctx),
            client,
            registry,
            queue,
            station,
            _events: events,
            _join: join,
        }
    }

    async fn reach_collect(f: &mut Fixture) {
        f.task.turn().await;
        assert_eq!(f.task.step(), CollectStep::Connect);
        f.task.turn().await;
        assert_eq!(f.task.step(), CollectStep::Collect);
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_queues_decorated_records() {
        let mut f = fixture();
        reach_collect(&mut f).await;
        {
            let reg = lock(&f.registry);
            let station = reg.station(&f.station).unwrap();
            assert!(station.connected && station.initialized);
        }

        f.task.turn().await;
        let records = f.queue.drain();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.table, "STA1_SCRIPT");
        assert_eq!(record.doc["TRACE"], json!([0, 0, f.station.0, "STA1-0"]));
        assert!(record.doc["DT_GEN"].is_string());
        assert!(record.doc["DT_RECV"].is_string());
        assert!(record.doc["DELTA_TIME"].as_f64().unwrap() < 0.74);
        assert_eq!(f.task.ring().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_goes_back_to_connect() {
        let mut f = fixture();
        reach_collect(&mut f).await;

        f.client.fail_reads.store(true, Ordering::SeqCst);
        f.task.turn().await;
        assert_eq!(f.task.step(), CollectStep::Connect);
        assert!(f.client.clients().is_empty());
        assert!(!lock(&f.registry).station(&f.station).unwrap().connected);

        f.client.fail_reads.store(false, Ordering::SeqCst);
        f.task.turn().await;
        assert_eq!(f.task.step(), CollectStep::Collect);
        assert_eq!(f.client.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_station_is_recreated() {
        let mut f = fixture();
        reach_collect(&mut f).await;

        let moved = StationRecord::new("STA1", "10.0.0.9", 5001).with_protocol("script");
        lock(&f.registry).update_station(&f.station, &moved);
        f.task.turn().await;

        // The turn that saw the flag rebuilt the client straight away.
        assert_eq!(f.task.step(), CollectStep::Connect);
        assert!(f.client.clients().is_empty());
        assert!(!lock(&f.registry).station(&f.station).unwrap().changed);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_connection_returns_to_create() {
        let mut f = fixture();
        reach_collect(&mut f).await;

        f.client.open.lock().unwrap().clear();
        f.task.turn().await;
        assert_eq!(f.task.step(), CollectStep::Connect);
        assert!(f.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_rule_forces_reconnect() {
        let mut f = fixture();
        reach_collect(&mut f).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        f.task.turn().await;
        assert_eq!(f.task.step(), CollectStep::Connect);
        assert!(f.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_record_triggers_catch_up() {
        let mut f = fixture();
        f.client.latencies.lock().unwrap().extend([2.0, 0.1, 0.1, 0.1]);
        reach_collect(&mut f).await;

        f.task.turn().await;
        assert_eq!(f.queue.len(), 3);
        assert_eq!(f.task.ring().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn samples_carry_the_record_time() {
        let mut f = fixture();
        f.client.latencies.lock().unwrap().push_back(0.4);
        reach_collect(&mut f).await;

        f.task.turn().await;
        let records = f.queue.drain();
        let sample = f.task.ring().last().copied().unwrap();
        assert_eq!(sample.at, records[0].dt_gen);
        assert!((sample.latency - 0.4).abs() < 0.05);
    }

    #[tokio::test(start_paused = true)]
    async fn unassigned_slot_idles_in_create() {
        let mut f = fixture();
        reach_collect(&mut f).await;

        lock(&f.registry).unassign_slot(SlotKey::new(0, 0));
        f.task.turn().await;
        assert_eq!(f.task.step(), CollectStep::Create);
        assert!(f.task.station().is_none());
        assert!(f.client.clients().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_lands_in_connect() {
        let mut f = fixture();
        reach_collect(&mut f).await;

        f.task.interrupted().await;
        assert_eq!(f.task.step(), CollectStep::Connect);
        assert!(f.task.connection().is_none());
    }
}
