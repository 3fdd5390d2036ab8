//! # PostgreSQL Document Store
//!
//! Stores records as JSONB documents using `tokio-postgres`. The storage
//! target's database name maps to a schema; each station table becomes
//! `"schema"."table" (id bigserial, dt_gen timestamptz, doc jsonb)`.
//! The connection itself opens the target's `path` database (`postgres`
//! when empty).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};

use super::storage::{StorageClient, StorageError};
use crate::core::registry::StorageTarget;

/// Quotes an SQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn query_error(err: tokio_postgres::Error) -> StorageError {
    StorageError::Query(err.to_string())
}

/// Generation time of a stored row, falling back to now.
fn row_time(row: &Value) -> DateTime<Utc> {
    row.get("DT_GEN")
        .and_then(Value::as_str)
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// One PostgreSQL handle bound to a [`StorageTarget`].
pub struct PostgresStorage {
    target: StorageTarget,
    client: RwLock<Option<Client>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    active: Arc<AtomicBool>,
    tables: Mutex<HashSet<String>>,
}

impl PostgresStorage {
    pub fn new(target: &StorageTarget) -> Self {
        Self {
            target: target.clone(),
            client: RwLock::new(None),
            driver: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
            tables: Mutex::new(HashSet::new()),
        }
    }

    fn known_tables(&self) -> MutexGuard<'_, HashSet<String>> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connection_string(&self) -> String {
        let database = if self.target.path.trim_matches('/').is_empty() {
            "postgres"
        } else {
            self.target.path.trim_matches('/')
        };
        format!(
            "host={} port={} user={} password={} dbname={} connect_timeout=10",
            self.target.host, self.target.port, self.target.user, self.target.password, database
        )
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.target.dbname), quote_ident(table))
    }

    async fn execute(&self, sql: &str) -> Result<(), StorageError> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or(StorageError::NotConnected)?;
        client.batch_execute(sql).await.map_err(query_error)
    }
}

#[async_trait]
impl StorageClient for PostgresStorage {
    fn address(&self) -> String {
        format!("postgres://{}:{}", self.target.host, self.target.port)
    }

    fn default_db(&self) -> String {
        self.target.dbname.clone()
    }

    async fn async_connect(&self) -> Result<(), StorageError> {
        let (client, connection) = tokio_postgres::connect(&self.connection_string(), NoTls)
            .await
            .map_err(|e| StorageError::Connect(e.to_string()))?;

        let active = Arc::clone(&self.active);
        let address = self.address();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::warn!("Postgres connection to {} ended: {}", address, e);
            }
            active.store(false, Ordering::SeqCst);
        });

        *self.client.write().await = Some(client);
        let previous = self
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(driver);
        if let Some(previous) = previous {
            previous.abort();
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.client.write().await.take();
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(driver) = driver {
            driver.abort();
        }
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_dbs(&self) -> Result<Vec<String>, StorageError> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or(StorageError::NotConnected)?;
        let rows = client
            .query("SELECT schema_name FROM information_schema.schemata", &[])
            .await
            .map_err(query_error)?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn create_db(&self, name: &str) -> Result<(), StorageError> {
        self.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(name)))
            .await
    }

    async fn list_tables(&self) -> Result<Vec<String>, StorageError> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or(StorageError::NotConnected)?;
        let rows = client
            .query(
                "SELECT table_name FROM information_schema.tables WHERE table_schema = $1",
                &[&self.target.dbname],
            )
            .await
            .map_err(query_error)?;
        let names: Vec<String> = rows.iter().map(|row| row.get::<_, String>(0)).collect();
        self.known_tables().extend(names.iter().cloned());
        Ok(names)
    }

    async fn create_table(&self, name: &str) -> Result<(), StorageError> {
        self.execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (id BIGSERIAL PRIMARY KEY, dt_gen TIMESTAMPTZ NOT NULL, doc JSONB NOT NULL)",
            self.qualified(name)
        ))
        .await?;
        self.known_tables().insert(name.to_string());
        Ok(())
    }

    async fn create_index(&self, table: &str, field: &str) -> Result<(), StorageError> {
        let index = quote_ident(&format!("{}_{}_idx", table, field.to_lowercase()));
        let column = if field.eq_ignore_ascii_case("DT_GEN") {
            "dt_gen".to_string()
        } else {
            format!("(doc->>'{}')", field.replace('\'', "''"))
        };
        self.execute(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            index,
            self.qualified(table),
            column
        ))
        .await
    }

    async fn save_data(&self, table: &str, rows: Vec<Value>) -> Result<usize, StorageError> {
        let guard = self.client.read().await;
        let client = guard.as_ref().ok_or(StorageError::NotConnected)?;
        let statement = client
            .prepare(&format!(
                "INSERT INTO {} (dt_gen, doc) VALUES ($1, $2)",
                self.qualified(table)
            ))
            .await
            .map_err(query_error)?;

        let mut stored = 0;
        for row in &rows {
            let dt_gen = row_time(row);
            client
                .execute(&statement, &[&dt_gen, row])
                .await
                .map_err(query_error)?;
            stored += 1;
        }
        Ok(stored)
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

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("STA1_NDJSON"), "\"STA1_NDJSON\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn connection_string_uses_path_database() {
        let mut target = StorageTarget::local("collector");
        target.port = 5432;
        target.user = "gnss".to_string();
        target.password = "secret".to_string();
        let storage = PostgresStorage::new(&target);
        assert!(storage.connection_string().contains("dbname=postgres"));

        target.path = "/gnss".to_string();
        let storage = PostgresStorage::new(&target);
        assert!(storage.connection_string().contains("dbname=gnss"));
        assert_eq!(storage.qualified("STA1_NDJSON"), "\"collector\".\"STA1_NDJSON\"");
    }

    #[test]
    fn row_time_reads_generation_stamp() {
        let row = json!({ "DT_GEN": "2024-01-01T00:00:00Z" });
        assert_eq!(row_time(&row).timestamp(), 1_704_067_200);
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let storage = PostgresStorage::new(&StorageTarget::local("collector"));
        assert!(!storage.active());
        assert_eq!(storage.list_dbs().await, Err(StorageError::NotConnected));
        assert_eq!(
            storage.save_data("t", vec![json!({})]).await,
            Err(StorageError::NotConnected)
        );
    }
}
