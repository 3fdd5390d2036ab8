mod common;

use chrono::{TimeDelta, Utc};
use common::{config, database, scripted_factory, station, FakeRegistry, ScriptedClient};
use lib_collector::connections::memory_store::MemoryStore;
use lib_collector::connections::StorageFactory;
use lib_collector::core::log_join::LogJoin;
use lib_collector::core::persist::{PersistContext, Persistence};
use lib_collector::core::queue::{OutboundQueue, OutboundRecord};
use lib_collector::core::registry::{AssignmentTable, Registry};
use lib_collector::core::status::{StatusReporter, TaskControl};
use lib_collector::Engine;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test(start_paused = true)]
async fn collected_records_reach_the_store_once() {
    let source = FakeRegistry::new(vec![station("STA1")]);
    let client = ScriptedClient::with_records(3);
    let store = MemoryStore::new();
    store.stall_next_saves(1);

    let engine = Engine::new(
        config(1),
        source,
        scripted_factory(Arc::clone(&client), Arc::new(AtomicUsize::new(0))),
        StorageFactory::with_defaults("memory", store.clone()),
    );
    engine.load().await;
    engine.assign_pending();
    let handle = engine.start();

    tokio::time::sleep(Duration::from_secs(40)).await;
    handle.close().await;

    let rows = store.rows("collector", "STA1_SCRIPT");
    let numbers: HashSet<i64> = rows.iter().filter_map(|row| row["N"].as_i64()).collect();
    assert_eq!(rows.len(), 3, "unexpected rows: {rows:?}");
    assert_eq!(numbers, HashSet::from([0, 1, 2]));
    assert!(store.save_attempts() >= 2);
    for row in &rows {
        assert!(row["TRACE"].is_array());
        assert!(row["DT_RECV"].is_string());
    }
}

/// Drives the pipeline by hand so every submission is observable.
#[tokio::test(start_paused = true)]
async fn no_row_is_submitted_more_than_twice() {
    let mut registry = Registry::new(AssignmentTable::with_slots(1, 1));
    registry.add_target(&database());
    let store = MemoryStore::new();
    let queue = OutboundQueue::new();
    let (_join, log) = LogJoin::new("test", Duration::from_secs(5), 256);
    let (tx, _events) = mpsc::unbounded_channel();
    let mut pipeline = Persistence::new(PersistContext {
        registry: registry.shared(),
        storage: Arc::new(StorageFactory::with_defaults("memory", store.clone())),
        queue: queue.clone(),
        config: Arc::new(config(1)),
        log,
        status: StatusReporter::new("db_task", tx),
        control: TaskControl::new("db_task"),
    });

    let t0 = Utc::now();
    for n in 0..4 {
        queue.push(OutboundRecord::new(
            "STA1_SCRIPT",
            t0 + TimeDelta::seconds(n),
            json!({ "N": n }),
        ));
    }
    store.stall_next_saves(2);

    pipeline.cycle().await;
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(15)).await;
        pipeline.cycle().await;
    }

    // First submission and its single resubmission both stalled.
    assert_eq!(store.save_attempts(), 2);
    assert_eq!(pipeline.abandoned().len(), 4);
    assert!(store.rows("collector", "STA1_SCRIPT").is_empty());
    assert!(queue.is_empty());

    // The same rows re-delivered as fresh records are recognised as already submitted.
    queue.push(OutboundRecord::new("STA1_SCRIPT", t0, json!({ "N": 0 })));
    pipeline.cycle().await;
    assert_eq!(store.save_attempts(), 2);
}
