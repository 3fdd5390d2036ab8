//! # Protocol Clients
//!
//! A protocol client owns the socket to one receiver. The collection state
//! machine only ever sees the [`ProtocolClient`] trait; concrete clients are
//! built by name through a [`ProtocolFactory`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::ndjson_tcp::NdjsonTcpClient;
use crate::core::registry::Station;

/// Errors raised by protocol clients. All of them are recoverable by
/// resetting the connection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("read failed: {0}")]
    Read(String),
    #[error("heartbeat failed: {0}")]
    Heartbeat(String),
    #[error("connection {0} is closed")]
    Closed(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },
    #[error("no protocol registered under {0}")]
    UnknownProtocol(String),
    #[error("could not decode record: {0}")]
    Decode(String),
}

/// Handle naming one open connection of a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolRecord {
    /// `true` once the record is complete.
    pub done: bool,
    /// GNSS time the record was generated at.
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Code of the station this client talks to.
    fn station(&self) -> &str;
    fn address(&self) -> String;

    async fn connect(&self) -> Result<ConnectionId, ProtocolError>;
    async fn get_message_header(&self, id: &ConnectionId) -> Result<Value, ProtocolError>;
    async fn get_records(&self) -> Result<ProtocolRecord, ProtocolError>;
    async fn heart_beat(&self, id: &ConnectionId) -> Result<(), ProtocolError>;
    async fn close(&self, id: &ConnectionId) -> Result<(), ProtocolError>;

    /// Connections currently open on this client.
    fn clients(&self) -> HashSet<ConnectionId>;
}

/// Runs `fut`, mapping an elapsed deadline to [`ProtocolError::Timeout`].
pub async fn with_timeout<T, F>(
    after: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T, ProtocolError>
where
    F: Future<Output = Result<T, ProtocolError>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| ProtocolError::Timeout { operation, after })?
}

/// Everything a constructor needs to build a client for one station.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolParams {
    pub code: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl ProtocolParams {
    pub fn from_station(station: &Station, timeout: Duration) -> Self {
        Self {
            code: station.code.clone(),
            protocol: station.protocol.clone(),
            host: station.protocol_host.clone(),
            port: station.port,
            timeout,
        }
    }
}

pub type ProtocolConstructor =
    Arc<dyn Fn(&ProtocolParams) -> Result<Arc<dyn ProtocolClient>, ProtocolError> + Send + Sync>;

/// Maps upper-cased protocol names to constructors.
#[derive(Clone, Default)]
pub struct ProtocolFactory {
    constructors: HashMap<String, ProtocolConstructor>,
}

impl ProtocolFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory knowing every protocol shipped with the crate.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register("NDJSON", |params| {
            Ok(Arc::new(NdjsonTcpClient::new(params)) as Arc<dyn ProtocolClient>)
        });
        factory
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&ProtocolParams) -> Result<Arc<dyn ProtocolClient>, ProtocolError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(name.to_uppercase(), Arc::new(constructor));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(
        &self,
        params: &ProtocolParams,
    ) -> Result<Arc<dyn ProtocolClient>, ProtocolError> {
        let key = params.protocol.to_uppercase();
        let constructor = self
            .constructors
            .get(&key)
            .ok_or_else(|| ProtocolError::UnknownProtocol(key.clone()))?;
        constructor(params)
    }
}

impl fmt::Debug for ProtocolFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolFactory")
            .field("protocols", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(protocol: &str) -> ProtocolParams {
        ProtocolParams {
            code: "STA1".to_string(),
            protocol: protocol.to_string(),
            host: "127.0.0.1".to_string(),
            port: 5001,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let factory = ProtocolFactory::with_defaults();
        let client = factory.create(&params("ndjson")).unwrap();
        assert_eq!(client.station(), "STA1");
        assert_eq!(client.address(), "127.0.0.1:5001");
    }

    #[test]
    fn unknown_protocol_is_a_creation_error() {
        let factory = ProtocolFactory::with_defaults();
        match factory.create(&params("GSOF")) {
            Err(err) => assert_eq!(err, ProtocolError::UnknownProtocol("GSOF".to_string())),
            Ok(_) => panic!("GSOF is not registered"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_maps_elapsed_deadline() {
        let result: Result<(), _> = with_timeout(Duration::from_secs(2), "connect", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert_eq!(
            result,
            Err(ProtocolError::Timeout {
                operation: "connect",
                after: Duration::from_secs(2)
            })
        );
    }
}
