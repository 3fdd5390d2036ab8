//! Fakes shared by the integration tests: an in-process registry source and
//! a scripted protocol client registered under the `SCRIPT` protocol.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use lib_collector::connections::{
    ConnectionId, ProtocolClient, ProtocolError, ProtocolFactory, ProtocolRecord,
};
use lib_collector::retrieve::{
    DatabaseRecord, RegistryError, RegistrySource, ServerRecord, StationRecord,
};
use lib_collector::EngineConfig;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct FakeRegistry {
    stations: Mutex<Vec<StationRecord>>,
    databases: Mutex<Vec<DatabaseRecord>>,
    pub station_fetches: AtomicUsize,
}

impl FakeRegistry {
    pub fn new(stations: Vec<StationRecord>) -> Arc<Self> {
        Arc::new(Self {
            stations: Mutex::new(stations),
            databases: Mutex::new(vec![database()]),
            station_fetches: AtomicUsize::new(0),
        })
    }

    pub fn set_stations(&self, stations: Vec<StationRecord>) {
        *self.stations.lock().unwrap() = stations;
    }
}

#[async_trait]
impl RegistrySource for FakeRegistry {
    async fn stations(&self) -> Result<Vec<StationRecord>, RegistryError> {
        self.station_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.stations.lock().unwrap().clone())
    }

    async fn databases(&self) -> Result<Vec<DatabaseRecord>, RegistryError> {
        Ok(self.databases.lock().unwrap().clone())
    }

    async fn servers(&self) -> Result<Vec<ServerRecord>, RegistryError> {
        Ok(vec![ServerRecord {
            name: Some("collector".to_string()),
            activated: true,
        }])
    }
}

/// Protocol client whose behaviour the test flips at runtime.
#[derive(Default)]
pub struct ScriptedClient {
    /// Records still to hand out; afterwards reads hang.
    pub records_left: AtomicUsize,
    pub fail_reads: AtomicBool,
    pub block_connect: AtomicBool,
    pub connects: AtomicUsize,
    pub reads: AtomicUsize,
    open: Mutex<HashSet<ConnectionId>>,
}

impl ScriptedClient {
    pub fn with_records(n: usize) -> Arc<Self> {
        let client = Self::default();
        client.records_left.store(n, Ordering::SeqCst);
        Arc::new(client)
    }

    pub fn open_connections(&self) -> usize {
        self.open.lock().unwrap().len()
    }
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
        if self.block_connect.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
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
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Err(ProtocolError::Read("connection reset by peer".to_string()));
        }
        let available = self
            .records_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !available {
            return std::future::pending().await;
        }

        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        let mut fields = Map::new();
        fields.insert("N".to_string(), json!(n));
        Ok(ProtocolRecord {
            done: true,
            // Strictly increasing, about 100 ms old.
            timestamp: Utc::now() - TimeDelta::milliseconds(100)
                + TimeDelta::milliseconds(n as i64),
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

/// Factory handing out `client` for the `SCRIPT` protocol, counting creations.
pub fn scripted_factory(client: Arc<ScriptedClient>, created: Arc<AtomicUsize>) -> ProtocolFactory {
    let mut factory = ProtocolFactory::new();
    factory.register("SCRIPT", move |_| {
        created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&client) as Arc<dyn ProtocolClient>)
    });
    factory
}

pub fn station(code: &str) -> StationRecord {
    StationRecord::new(code, "10.0.0.5", 5001).with_protocol("script")
}

pub fn database() -> DatabaseRecord {
    DatabaseRecord {
        host: "db1".to_string(),
        port: 5432,
        dbname: "collector".to_string(),
        ..DatabaseRecord::default()
    }
}

pub fn config(slots: usize) -> EngineConfig {
    EngineConfig {
        processes: 1,
        slots_per_process: slots,
        persistence_slots: 2,
        ..EngineConfig::default()
    }
}
