//! # In-Memory Document Store
//!
//! A process-local backend. Every client built from the same [`MemoryStore`]
//! writes into the same maps, so tests (and single-node dry runs) can inspect
//! what the pipeline persisted. The store can also be told to fail or stall
//! upcoming operations, which is how timeouts and resubmission are exercised.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::storage::{StorageClient, StorageError};
use crate::core::registry::StorageTarget;

#[derive(Default)]
struct Databases {
    tables: BTreeMap<String, BTreeMap<String, Vec<Value>>>,
    indexes: HashSet<(String, String, String)>,
}

#[derive(Default)]
struct Faults {
    stalled_saves: AtomicUsize,
    failed_saves: AtomicUsize,
    refuse_connect: AtomicBool,
}

/// Shared state behind every [`MemoryStorageClient`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<Databases>>,
    faults: Arc<Faults>,
    save_attempts: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, Databases> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A new handle writing into `target.dbname`.
    pub fn client(&self, target: &StorageTarget) -> MemoryStorageClient {
        MemoryStorageClient {
            store: self.clone(),
            db: target.dbname.clone(),
            address: format!("memory://{}:{}", target.host, target.port),
            active: AtomicBool::new(false),
            tables: Mutex::new(HashSet::new()),
        }
    }

    pub fn databases(&self) -> Vec<String> {
        self.data().tables.keys().cloned().collect()
    }

    pub fn rows(&self, db: &str, table: &str) -> Vec<Value> {
        self.data()
            .tables
            .get(db)
            .and_then(|tables| tables.get(table))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_index(&self, db: &str, table: &str, field: &str) -> bool {
        self.data()
            .indexes
            .contains(&(db.to_string(), table.to_string(), field.to_string()))
    }

    /// Number of `save_data` calls received so far, including failed ones.
    pub fn save_attempts(&self) -> usize {
        self.save_attempts.load(Ordering::SeqCst)
    }

    /// The next `n` saves never complete.
    pub fn stall_next_saves(&self, n: usize) {
        self.faults.stalled_saves.store(n, Ordering::SeqCst);
    }

    /// The next `n` saves fail with a query error.
    pub fn fail_next_saves(&self, n: usize) {
        self.faults.failed_saves.store(n, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.faults.refuse_connect.store(refuse, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct MemoryStorageClient {
    store: MemoryStore,
    db: String,
    address: String,
    active: AtomicBool,
    tables: Mutex<HashSet<String>>,
}

impl MemoryStorageClient {
    fn known_tables(&self) -> MutexGuard<'_, HashSet<String>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_active(&self) -> Result<(), StorageError> {
        if self.active() {
            Ok(())
        } else {
            Err(StorageError::NotConnected)
        }
    }
}

#[async_trait]
impl StorageClient for MemoryStorageClient {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn default_db(&self) -> String {
        self.db.clone()
    }

    async fn async_connect(&self) -> Result<(), StorageError> {
        if self.store.faults.refuse_connect.load(Ordering::SeqCst) {
            return Err(StorageError::Connect(format!("{} refused the connection", self.address)));
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_dbs(&self) -> Result<Vec<String>, StorageError> {
        self.ensure_active()?;
        Ok(self.store.databases())
    }

    async fn create_db(&self, name: &str) -> Result<(), StorageError> {
        self.ensure_active()?;
        self.store.data().tables.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>, StorageError> {
        self.ensure_active()?;
        let names: Vec<String> = self
            .store
            .data()
            .tables
            .get(&self.db)
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default();
        self.known_tables().extend(names.iter().cloned());
        Ok(names)
    }

    async fn create_table(&self, name: &str) -> Result<(), StorageError> {
        self.ensure_active()?;
        self.store
            .data()
            .tables
            .entry(self.db.clone())
            .or_default()
            .entry(name.to_string())
            .or_default();
        self.known_tables().insert(name.to_string());
        Ok(())
    }

    async fn create_index(&self, table: &str, field: &str) -> Result<(), StorageError> {
        self.ensure_active()?;
        self.store
            .data()
            .indexes
            .insert((self.db.clone(), table.to_string(), field.to_string()));
        Ok(())
    }

    async fn save_data(&self, table: &str, rows: Vec<Value>) -> Result<usize, StorageError> {
        self.ensure_active()?;
        self.store.save_attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.store.faults.stalled_saves) {
            return std::future::pending().await;
        }
        if take_one(&self.store.faults.failed_saves) {
            return Err(StorageError::Query(format!("write into {table} rejected")));
        }
        let count = rows.len();
        self.store
            .data()
            .tables
            .entry(self.db.clone())
            .or_default()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
        Ok(count)
    }

    fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn tables(&self) -> HashSet<String> {
        self.known_tables().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn clients_share_one_store() {
        let store = MemoryStore::new();
        let target = StorageTarget::local("collector");
        let a = store.client(&target);
        let b = store.client(&target);

        a.async_connect().await.unwrap();
        a.create_db("collector").await.unwrap();
        a.create_table("STA1_NDJSON").await.unwrap();
        a.create_index("STA1_NDJSON", "DT_GEN").await.unwrap();
        assert_eq!(a.save_data("STA1_NDJSON", vec![json!({"E": 1})]).await, Ok(1));

        b.async_connect().await.unwrap();
        assert_eq!(b.list_tables().await.unwrap(), vec!["STA1_NDJSON".to_string()]);
        assert!(b.tables().contains("STA1_NDJSON"));
        assert_eq!(store.rows("collector", "STA1_NDJSON"), vec![json!({"E": 1})]);
        assert!(store.has_index("collector", "STA1_NDJSON", "DT_GEN"));
    }

    #[tokio::test]
    async fn closed_handle_refuses_work() {
        let store = MemoryStore::new();
        let client = store.client(&StorageTarget::local("collector"));
        assert_eq!(client.list_dbs().await, Err(StorageError::NotConnected));
        client.async_connect().await.unwrap();
        client.close().await.unwrap();
        assert!(!client.active());
        assert_eq!(client.save_data("t", vec![]).await, Err(StorageError::NotConnected));
    }

    #[tokio::test]
    async fn scripted_faults_are_consumed_in_order() {
        let store = MemoryStore::new();
        let client = store.client(&StorageTarget::local("collector"));
        client.async_connect().await.unwrap();
        store.fail_next_saves(1);

        assert!(matches!(
            client.save_data("t", vec![json!(1)]).await,
            Err(StorageError::Query(_))
        ));
        assert_eq!(client.save_data("t", vec![json!(1)]).await, Ok(1));
        assert_eq!(store.save_attempts(), 2);

        store.refuse_connections(true);
        let other = store.client(&StorageTarget::local("collector"));
        assert!(matches!(other.async_connect().await, Err(StorageError::Connect(_))));
    }
}
