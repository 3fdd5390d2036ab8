//! # Log Join
//!
//! Tasks hand structured [`LogMessage`]s to a [`LogSink`]; a single
//! [`LogJoin`] task batches them (by size or age), writes each one through the
//! `log` facade with the source component as target, and optionally forwards
//! whole batches downstream.

use chrono::{DateTime, Utc};
use log::Level;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub level: Level,
    pub message: String,
    /// Text of the error that triggered the message, if any.
    pub exception: Option<String>,
}

/// Emits one message through the `log` facade.
fn emit(message: &LogMessage) {
    match &message.exception {
        Some(exception) => log::log!(
            target: message.source.as_str(),
            message.level,
            "{} ({})",
            message.message,
            exception
        ),
        None => log::log!(target: message.source.as_str(), message.level, "{}", message.message),
    }
}

/// Producer side of the join, bound to one source name.
#[derive(Debug, Clone)]
pub struct LogSink {
    source: String,
    tx: mpsc::UnboundedSender<LogMessage>,
}

impl LogSink {
    /// Same channel, different source name.
    pub fn named(&self, source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            tx: self.tx.clone(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn send(&self, level: Level, message: String, exception: Option<String>) {
        let msg = LogMessage {
            timestamp: Utc::now(),
            source: self.source.clone(),
            level,
            message,
            exception,
        };
        // After shutdown the join is gone; write straight through instead.
        if let Err(mpsc::error::SendError(msg)) = self.tx.send(msg) {
            emit(&msg);
        }
    }

    pub fn log(&self, level: Level, message: impl Into<String>) {
        self.send(level, message.into(), None);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(Level::Warn, message);
    }

    /// Error-level message carrying the error text.
    pub fn error(&self, message: impl Into<String>, err: &dyn Display) {
        self.send(Level::Error, message.into(), Some(err.to_string()));
    }
}

pub struct LogJoin {
    rx: mpsc::UnboundedReceiver<LogMessage>,
    flush_every: Duration,
    batch_size: usize,
    forward: Option<mpsc::Sender<Vec<LogMessage>>>,
}

impl LogJoin {
    /// A join and its first sink, named `source`.
    pub fn new(source: &str, flush_every: Duration, batch_size: usize) -> (Self, LogSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let join = Self {
            rx,
            flush_every,
            batch_size: batch_size.max(1),
            forward: None,
        };
        let sink = LogSink {
            source: source.to_string(),
            tx,
        };
        (join, sink)
    }

    /// Also hands every flushed batch to `tx`.
    pub fn forward_to(&mut self, tx: mpsc::Sender<Vec<LogMessage>>) {
        self.forward = Some(tx);
    }

    async fn flush(&self, batch: &mut Vec<LogMessage>) {
        if batch.is_empty() {
            return;
        }
        let batch = std::mem::take(batch);
        for message in &batch {
            emit(message);
        }
        if let Some(forward) = &self.forward {
            if forward.send(batch).await.is_err() {
                log::debug!("Log forward channel closed");
            }
        }
    }

    /// Runs until `shutdown` fires or every sink is dropped, flushing what is left.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_every);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    while let Ok(message) = self.rx.try_recv() {
                        batch.push(message);
                    }
                    break;
                }
                received = self.rx.recv() => match received {
                    Some(message) => {
                        batch.push(message);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.flush(&mut batch).await,
            }
        }
        self.flush(&mut batch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn batches_flush_by_size_and_age() {
        let (mut join, sink) = LogJoin::new("engine", Duration::from_secs(5), 2);
        let (tx, mut rx) = mpsc::channel(8);
        join.forward_to(tx);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(join.run(shutdown.clone()));

        let db = sink.named("db_task");
        sink.info("first");
        db.error("save failed", &"timeout");
        let full = rx.recv().await.unwrap();
        assert_eq!(full.len(), 2);
        assert_eq!(full[0].source, "engine");
        assert_eq!(full[1].source, "db_task");
        assert_eq!(full[1].exception.as_deref(), Some("timeout"));

        sink.warn("lonely");
        let aged = rx.recv().await.unwrap();
        assert_eq!(aged.len(), 1);
        assert_eq!(aged[0].level, Level::Warn);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_messages() {
        let (mut join, sink) = LogJoin::new("engine", Duration::from_secs(3600), 100);
        let (tx, mut rx) = mpsc::channel(8);
        join.forward_to(tx);
        sink.debug("queued before start");

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        join.run(shutdown).await;

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].message, "queued before start");
    }
}
