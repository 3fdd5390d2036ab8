//! # NDJSON over TCP
//!
//! A line-oriented protocol client: each record is one JSON object per line.
//! A line starting with `#` is an optional message header. The record time is
//! read from `DT_GEN`, `timestamp` or `time` (RFC 3339 or epoch seconds). The
//! heartbeat is a bare newline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::protocol::{
    with_timeout, ConnectionId, ProtocolClient, ProtocolError, ProtocolParams, ProtocolRecord,
};

const TIME_FIELDS: [&str; 3] = ["DT_GEN", "timestamp", "time"];

struct Session {
    id: ConnectionId,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Record line read while looking for a header.
    pending: Option<String>,
}

pub struct NdjsonTcpClient {
    code: String,
    host: String,
    port: u16,
    timeout: Duration,
    session: tokio::sync::Mutex<Option<Session>>,
    open: Mutex<HashSet<ConnectionId>>,
    counter: AtomicU64,
}

impl NdjsonTcpClient {
    pub fn new(params: &ProtocolParams) -> Self {
        Self {
            code: params.code.clone(),
            host: params.host.clone(),
            port: params.port,
            timeout: params.timeout,
            session: tokio::sync::Mutex::new(None),
            open: Mutex::new(HashSet::new()),
            counter: AtomicU64::new(0),
        }
    }

    fn open_set(&self) -> std::sync::MutexGuard<'_, HashSet<ConnectionId>> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_session<'a>(
        session: &'a mut Option<Session>,
        id: &ConnectionId,
    ) -> Result<&'a mut Session, ProtocolError> {
        match session {
            Some(s) if &s.id == id => Ok(s),
            _ => Err(ProtocolError::Closed(id.to_string())),
        }
    }

    /// Next non-empty line, or `Closed` at end of stream.
    async fn next_line(session: &mut Session) -> Result<String, ProtocolError> {
        loop {
            let mut line = String::new();
            let read = session
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| ProtocolError::Read(e.to_string()))?;
            if read == 0 {
                return Err(ProtocolError::Closed(session.id.to_string()));
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
    }
}

/// Parses one record line.
pub fn decode_record(line: &str) -> Result<ProtocolRecord, ProtocolError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(ProtocolError::Decode(format!("expected a JSON object, got {line}")));
    };
    let timestamp = record_time(&fields)
        .ok_or_else(|| ProtocolError::Decode("record carries no usable timestamp".to_string()))?;
    Ok(ProtocolRecord {
        done: true,
        timestamp,
        fields,
    })
}

fn record_time(fields: &Map<String, Value>) -> Option<DateTime<Utc>> {
    TIME_FIELDS.iter().find_map(|key| match fields.get(*key)? {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let seconds = n.as_f64()?;
            let whole = seconds.floor();
            let nanos = ((seconds - whole) * 1e9).round() as u32;
            DateTime::<Utc>::from_timestamp(whole as i64, nanos.min(999_999_999))
        }
        _ => None,
    })
}

#[async_trait]
impl ProtocolClient for NdjsonTcpClient {
    fn station(&self) -> &str {
        &self.code
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> Result<ConnectionId, ProtocolError> {
        let address = self.address();
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| ProtocolError::Connect {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let id = ConnectionId(format!("{}-{}", self.code, n));

        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            self.open_set().remove(&previous.id);
        }
        *session = Some(Session {
            id: id.clone(),
            reader: BufReader::new(read),
            writer: write,
            pending: None,
        });
        self.open_set().insert(id.clone());
        log::debug!("NDJSON connection {} open to {}", id, address);
        Ok(id)
    }

    async fn get_message_header(&self, id: &ConnectionId) -> Result<Value, ProtocolError> {
        let mut guard = self.session.lock().await;
        let session = Self::check_session(&mut guard, id)?;
        if session.pending.is_some() {
            return Ok(Value::Null);
        }
        let line = with_timeout(self.timeout, "header", Self::next_line(session)).await?;
        match line.strip_prefix('#') {
            Some(header) => Ok(serde_json::from_str(header.trim())
                .unwrap_or_else(|_| Value::String(header.trim().to_string()))),
            None => {
                session.pending = Some(line);
                Ok(Value::Null)
            }
        }
    }

    async fn get_records(&self) -> Result<ProtocolRecord, ProtocolError> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(ProtocolError::Closed(self.code.clone()));
        };
        let line = match session.pending.take() {
            Some(line) => line,
            None => loop {
                let line = with_timeout(self.timeout, "read", Self::next_line(session)).await?;
                if !line.starts_with('#') {
                    break line;
                }
            },
        };
        decode_record(&line)
    }

    async fn heart_beat(&self, id: &ConnectionId) -> Result<(), ProtocolError> {
        let mut guard = self.session.lock().await;
        let session = Self::check_session(&mut guard, id)?;
        session
            .writer
            .write_all(b"\n")
            .await
            .map_err(|e| ProtocolError::Heartbeat(e.to_string()))
    }

    async fn close(&self, id: &ConnectionId) -> Result<(), ProtocolError> {
        let mut guard = self.session.lock().await;
        let mut session = match guard.take() {
            Some(s) if &s.id == id => s,
            other => {
                *guard = other;
                return Err(ProtocolError::Closed(id.to_string()));
            }
        };
        self.open_set().remove(id);
        let _ = session.writer.shutdown().await;
        Ok(())
    }

    fn clients(&self) -> HashSet<ConnectionId> {
        self.open_set().clone()
    }
}
