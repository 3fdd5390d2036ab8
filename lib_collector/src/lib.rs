//! # lib_collector
//!
//! The station-collection engine. Many GNSS receivers are polled concurrently,
//! each by its own collection state machine; decoded records flow through a
//! shared outbound queue into a pool of storage slots, and a watchdog forces
//! wedged tasks back into a clean state without taking the process down.
//!
//! The crate is split the same way the rest of the workspace is:
//!
//! - **`core`**: the state machines, the in-memory registry and the engine
//!   that wires them together.
//! - **`connections`**: protocol and storage client contracts plus the
//!   shipped implementations (NDJSON over TCP, in-memory and PostgreSQL stores).
//! - **`retrieve`**: the HTTP client for the upstream station registry.
//! - **`utils`**: small helpers shared across modules.

pub mod config;
pub mod connections;
pub mod core;
pub mod retrieve;
pub mod utils;

pub use config::EngineConfig;
pub use core::engine::{Engine, EngineHandle};
