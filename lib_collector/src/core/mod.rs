//! # Core Engine Module
//!
//! The state machines and shared state of the collection engine.
//!
//! ## Core Components:
//!
//! - **`registry`**: stations, storage targets and the worker-slot assignment
//!   table, behind one mutex.
//! - **`collect`**: the per-slot collection state machine (CREATE, CONNECT,
//!   COLLECT) with its latency tracking and catch-up bursts.
//! - **`persist`**: the storage-slot pipeline draining the outbound queue,
//!   with timeout recovery and at-most-twice resubmission.
//! - **`watchdog`**: supervises every task through its status events and
//!   interrupts the ones that stop making progress.
//! - **`registry_sync`**: periodic diff of the upstream station list.
//! - **`log_join`**: batches structured log messages from every task.
//! - **`engine`**: the composition root that spawns all of the above.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Fixed-capacity latency window with rolling statistics.
pub mod ring_buffer;
/// Catch-up trigger and burst-read policy.
pub mod catch_up;
/// Stations, storage targets and slot assignments.
pub mod registry;
/// Outbound record queue.
pub mod queue;
/// Progress events and per-task control handles.
pub mod status;
/// Structured log batching.
pub mod log_join;
/// Collection state machine.
pub mod collect;
/// Persistence pipeline.
pub mod persist;
/// Stuck-task detection and recovery.
pub mod watchdog;
/// Upstream station list synchronisation.
pub mod registry_sync;
/// Composition root.
pub mod engine;

// --- Public API Re-exports ---
pub use engine::{Engine, EngineHandle, LoadSummary};
pub use registry::{Registry, SharedRegistry, SlotKey, Station, StationId, StorageTarget};
pub use registry_sync::SyncReport;
