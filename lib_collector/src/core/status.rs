//! Progress events and per-task control handles.
//!
//! Every supervised task reports progress through a [`StatusReporter`]; the
//! watchdog drains the other end of the channel. The watchdog reaches back
//! into a task through its [`TaskControl`]: the interruption token and the
//! storage handles the task registered.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connections::storage::StorageClient;

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Update,
    Connect,
    Save,
    Collect,
    Enqueued { table: String, dt_gen: DateTime<Utc> },
    Persisted { table: String, dt_gen: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub origin: String,
    pub at: Instant,
    pub stage: Stage,
}

/// Sending half of the status queue, stamped with the task name.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    origin: String,
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl StatusReporter {
    pub fn new(origin: impl Into<String>, tx: mpsc::UnboundedSender<StatusEvent>) -> Self {
        Self {
            origin: origin.into(),
            tx,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn report(&self, stage: Stage) {
        // A closed channel only means the watchdog is gone (shutdown).
        let _ = self.tx.send(StatusEvent {
            origin: self.origin.clone(),
            at: Instant::now(),
            stage,
        });
    }
}

/// What the watchdog holds for each supervised task.
pub struct TaskControl {
    name: String,
    token: Mutex<CancellationToken>,
    storage: Mutex<BTreeMap<String, Arc<dyn StorageClient>>>,
    interruptions: AtomicUsize,
}

impl TaskControl {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            token: Mutex::new(CancellationToken::new()),
            storage: Mutex::new(BTreeMap::new()),
            interruptions: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn current(&self) -> MutexGuard<'_, CancellationToken> {
        self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handles(&self) -> MutexGuard<'_, BTreeMap<String, Arc<dyn StorageClient>>> {
        self.storage.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Token the task's current turn should observe.
    pub fn token(&self) -> CancellationToken {
        self.current().clone()
    }

    /// Cancels the current turn and installs a fresh token for the next one.
    pub fn interrupt(&self) {
        let mut token = self.current();
        token.cancel();
        *token = CancellationToken::new();
        self.interruptions.fetch_add(1, Ordering::SeqCst);
    }

    /// Replaces a cancelled token; a live one is kept.
    pub fn rearm(&self) {
        let mut token = self.current();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    pub fn interruptions(&self) -> usize {
        self.interruptions.load(Ordering::SeqCst)
    }

    pub fn attach_storage(&self, key: &str, handle: Arc<dyn StorageClient>) {
        self.handles().insert(key.to_string(), handle);
    }

    pub fn detach_storage(&self, key: &str) {
        self.handles().remove(key);
    }

    pub fn storage_handles(&self) -> Vec<(String, Arc<dyn StorageClient>)> {
        self.handles()
            .iter()
            .map(|(key, handle)| (key.clone(), Arc::clone(handle)))
            .collect()
    }
}

impl std::fmt::Debug for TaskControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskControl")
            .field("name", &self.name)
            .field("interruptions", &self.interruptions())
            .finish()
    }
}
