//! # Storage Clients
//!
//! A storage client is one logical handle on a document store. The
//! persistence pipeline drives it through [`StorageClient`]; the concrete
//! backend is chosen by name through a [`StorageFactory`].

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::memory_store::MemoryStore;
use crate::core::registry::StorageTarget;

/// Errors raised by storage clients.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    #[error("failed to connect to storage: {0}")]
    Connect(String),
    #[error("storage query failed: {0}")]
    Query(String),
    #[error("storage handle is not connected")]
    NotConnected,
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },
    #[error("no storage backend registered under {0}")]
    UnknownBackend(String),
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    fn address(&self) -> String;
    /// Database this handle writes into.
    fn default_db(&self) -> String;

    async fn async_connect(&self) -> Result<(), StorageError>;
    async fn close(&self) -> Result<(), StorageError>;
    async fn list_dbs(&self) -> Result<Vec<String>, StorageError>;
    async fn create_db(&self, name: &str) -> Result<(), StorageError>;
    async fn list_tables(&self) -> Result<Vec<String>, StorageError>;
    async fn create_table(&self, name: &str) -> Result<(), StorageError>;
    async fn create_index(&self, table: &str, field: &str) -> Result<(), StorageError>;
    /// Writes `rows` into `table`, returning how many were stored.
    async fn save_data(&self, table: &str, rows: Vec<Value>) -> Result<usize, StorageError>;

    fn active(&self) -> bool;
    /// Tables known to exist in [`StorageClient::default_db`].
    fn tables(&self) -> HashSet<String>;
}

/// Runs `fut`, mapping an elapsed deadline to [`StorageError::Timeout`].
pub async fn with_timeout<T, F>(
    after: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| StorageError::Timeout { operation, after })?
}

pub type StorageConstructor =
    Arc<dyn Fn(&StorageTarget) -> Result<Arc<dyn StorageClient>, StorageError> + Send + Sync>;

/// Builds storage clients for the configured backend.
#[derive(Clone)]
pub struct StorageFactory {
    backend: String,
    constructors: HashMap<String, StorageConstructor>,
}

impl StorageFactory {
    pub fn new(backend: &str) -> Self {
        Self {
            backend: backend.to_uppercase(),
            constructors: HashMap::new(),
        }
    }

    /// Registers every shipped backend. `MEMORY` clients share `memory`.
    pub fn with_defaults(backend: &str, memory: MemoryStore) -> Self {
        let mut factory = Self::new(backend);
        factory.register("MEMORY", move |target| {
            Ok(Arc::new(memory.client(target)) as Arc<dyn StorageClient>)
        });
        #[cfg(feature = "postgres")]
        factory.register("POSTGRES", |target| {
            Ok(Arc::new(super::db_postgres::PostgresStorage::new(target)) as Arc<dyn StorageClient>)
        });
        factory
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&StorageTarget) -> Result<Arc<dyn StorageClient>, StorageError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(name.to_uppercase(), Arc::new(constructor));
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn create(&self, target: &StorageTarget) -> Result<Arc<dyn StorageClient>, StorageError> {
        let constructor = self
            .constructors
            .get(&self.backend)
            .ok_or_else(|| StorageError::UnknownBackend(self.backend.clone()))?;
        constructor(target)
    }
}

impl fmt::Debug for StorageFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("StorageFactory")
            .field("backend", &self.backend)
            .field("registered", &names)
            .finish()
    }
}
