//! Fixed-window latency statistics.
//!
//! A [`RingBuffer`] keeps the most recent samples (bounded by count and,
//! optionally, by age) and reports their mean and population standard
//! deviation. An empty window reports `0.0` for both.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::VecDeque;

/// One latency observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub at: DateTime<Utc>,
    pub latency: f64,
}

#[derive(Debug, Clone)]
pub struct RingBuffer {
    name: String,
    capacity: usize,
    max_age: Option<TimeDelta>,
    samples: VecDeque<Sample>,
}

impl RingBuffer {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            max_age: None,
            samples: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Also evicts samples older than `max_age` relative to the newest one.
    pub fn with_max_age(mut self, max_age: TimeDelta) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// Records `latency` stamped with the current time.
    pub fn push(&mut self, latency: f64) {
        self.add(Sample {
            at: Utc::now(),
            latency,
        });
    }

    pub fn add(&mut self, sample: Sample) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        if let Some(max_age) = self.max_age {
            let horizon = sample.at - max_age;
            while self.samples.front().is_some_and(|s| s.at < horizon) {
                self.samples.pop_front();
            }
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.latency).sum::<f64>() / self.samples.len() as f64
    }

    /// Population standard deviation of the window.
    pub fn sigma(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .samples
            .iter()
            .map(|s| (s.latency - mean).powi(2))
            .sum::<f64>()
            / self.samples.len() as f64;
        variance.max(0.0).sqrt()
    }
}
