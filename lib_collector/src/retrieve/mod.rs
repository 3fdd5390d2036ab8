//! # Data Retrieval Module
//!
//! HTTP access to the upstream registry that owns the authoritative list of
//! stations, storage servers and collector servers.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: a generic `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, retrying transient transport failures with
//!   exponential backoff.
//! - **`registry_api`**: the typed upstream records, the `RegistrySource`
//!   trait the engine consumes and its HTTP implementation.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;
/// Upstream registry records and the `RegistrySource` abstraction.
pub mod registry_api;

pub use registry_api::{
    DatabaseRecord, RegistryApi, RegistryError, RegistrySource, ServerRecord, StationRecord,
};
