//! The outbound queue between the collectors and the persistence pipeline.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// One decorated record waiting to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub table: String,
    pub dt_gen: DateTime<Utc>,
    pub doc: Value,
    /// Set once the record went back to the queue after a failed save.
    pub resubmitted: bool,
}

impl OutboundRecord {
    pub fn new(table: impl Into<String>, dt_gen: DateTime<Utc>, doc: Value) -> Self {
        Self {
            table: table.into(),
            dt_gen,
            doc,
            resubmitted: false,
        }
    }
}

/// Shared FIFO of outbound records. The lock is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct OutboundQueue {
    inner: Arc<Mutex<VecDeque<OutboundRecord>>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, VecDeque<OutboundRecord>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, record: OutboundRecord) {
        self.records().push_back(record);
    }

    pub fn push_all<I>(&self, records: I)
    where
        I: IntoIterator<Item = OutboundRecord>,
    {
        self.records().extend(records);
    }

    /// Puts `records` back at the head of the queue, keeping their order.
    pub fn push_front_all(&self, records: Vec<OutboundRecord>) {
        let mut queue = self.records();
        for record in records.into_iter().rev() {
            queue.push_front(record);
        }
    }

    /// Takes every queued record, oldest first.
    pub fn drain(&self) -> Vec<OutboundRecord> {
        self.records().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn queue_is_fifo_and_shared() {
        let queue = OutboundQueue::new();
        let producer = queue.clone();
        let t0 = Utc::now();
        producer.push(OutboundRecord::new("A", t0, json!(1)));
        producer.push(OutboundRecord::new("B", t0, json!(2)));

        assert_eq!(queue.len(), 2);
        let drained = queue.drain();
        assert_eq!(drained[0].table, "A");
        assert_eq!(drained[1].doc, json!(2));
        assert!(producer.is_empty());
    }

    #[test]
    fn restored_records_go_first() {
        let queue = OutboundQueue::new();
        let t0 = Utc::now();
        queue.push(OutboundRecord::new("C", t0, json!(3)));
        queue.push_front_all(vec![
            OutboundRecord::new("A", t0, json!(1)),
            OutboundRecord::new("B", t0, json!(2)),
        ]);

        let tables: Vec<String> = queue.drain().into_iter().map(|r| r.table).collect();
        assert_eq!(tables, vec!["A", "B", "C"]);
    }
}
