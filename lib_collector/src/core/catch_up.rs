//! Adaptive catch-up.
//!
//! When a station falls behind (its latest latency plus the cube of the
//! rolling sigma reaches the upper bound), the collector issues extra reads
//! back to back to drain whatever the receiver has buffered. The burst is fed
//! into a small control window and ends as soon as that window's mean drops
//! below the bound, after `ceil(latency)` reads, or at the configured cap.

use serde::{Deserialize, Serialize};
use std::future::Future;

use super::ring_buffer::{RingBuffer, Sample};

/// Threshold parameters of the catch-up burst.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatchUpPolicy {
    /// Baseline latency in seconds.
    pub mu: f64,
    /// Multiplier applied to `sigma`.
    pub factor: f64,
    /// Baseline spread in seconds.
    pub sigma: f64,
    /// Capacity of the control window used during a burst.
    pub control_size: usize,
    /// Hard cap on extra reads per burst.
    pub max_reads: usize,
}

impl Default for CatchUpPolicy {
    fn default() -> Self {
        Self {
            mu: 0.5,
            factor: 0.8,
            sigma: 0.3,
            control_size: 5,
            max_reads: 120,
        }
    }
}

impl CatchUpPolicy {
    pub fn upper_bound(&self) -> f64 {
        self.mu + self.factor * self.sigma
    }

    /// Whether a record read `latency` seconds late, with the main window at
    /// `sigma`, starts a burst.
    pub fn triggers(&self, latency: f64, sigma: f64) -> bool {
        latency + sigma.powi(3) >= self.upper_bound()
    }

    /// Maximum extra reads for a burst started at `latency`.
    pub fn read_budget(&self, latency: f64) -> usize {
        let wanted = latency.max(0.0).ceil();
        if wanted >= self.max_reads as f64 {
            self.max_reads
        } else {
            wanted as usize
        }
    }
}

/// What a finished burst did.
#[derive(Debug, Clone, PartialEq)]
pub struct CatchUpOutcome {
    /// Samples of the extra reads, oldest first.
    pub samples: Vec<Sample>,
    /// Mean of the control window when the burst stopped.
    pub control_mean: f64,
    /// `true` when the burst ended because the control mean fell below the bound.
    pub converged: bool,
}

impl CatchUpOutcome {
    pub fn extra_reads(&self) -> usize {
        self.samples.len()
    }
}

/// Runs one burst. `read` performs a single record read and yields its sample.
///
/// The first read error ends the burst and is returned as is.
pub async fn run_catch_up<F, Fut, E>(
    policy: &CatchUpPolicy,
    latency: f64,
    mut read: F,
) -> Result<CatchUpOutcome, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Sample, E>>,
{
    let bound = policy.upper_bound();
    let budget = policy.read_budget(latency);
    let mut control = RingBuffer::new("control_acc", policy.control_size);
    control.push(latency);

    let mut samples = Vec::new();
    while samples.len() < budget && control.mean() >= bound {
        let next = read().await?;
        control.add(next);
        samples.push(next);
    }

    let control_mean = control.mean();
    Ok(CatchUpOutcome {
        samples,
        control_mean,
        converged: control_mean < bound,
    })
}
