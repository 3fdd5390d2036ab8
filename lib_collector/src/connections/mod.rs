//! # Connections Module
//!
//! Client contracts for the two kinds of external services the engine talks
//! to, the name-keyed factories that build them, and the shipped
//! implementations.

/// Protocol client contract, errors and factory.
pub mod protocol;
/// Newline-delimited JSON over TCP protocol client.
pub mod ndjson_tcp;

/// Storage client contract, errors and factory.
pub mod storage;
/// Process-local document store.
pub mod memory_store;
/// PostgreSQL document store.
#[cfg(feature = "postgres")]
pub mod db_postgres;

pub use protocol::{
    ConnectionId, ProtocolClient, ProtocolError, ProtocolFactory, ProtocolParams, ProtocolRecord,
};
pub use storage::{StorageClient, StorageError, StorageFactory};
