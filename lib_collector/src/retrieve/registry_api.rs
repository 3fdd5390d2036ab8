//! # Upstream Registry Client
//!
//! The registry is a small REST service returning JSON arrays for
//! `/stations`, `/databases` and `/servers`. [`RegistrySource`] is the seam the
//! engine depends on; [`RegistryApi`] is the HTTP implementation.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use super::ky_http::ApiClient;
use crate::config::EngineConfig;

/// Errors raised while talking to the upstream registry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(String),
    #[error("registry answered {status} for {path}")]
    Status { path: String, status: u16 },
    #[error("registry payload could not be decoded: {0}")]
    Decode(String),
    #[error("invalid registry url: {0}")]
    Url(String),
}

impl RegistryError {
    fn from_transport(err: anyhow::Error) -> Self {
        if let Some(parse) = err.downcast_ref::<url::ParseError>() {
            return Self::Url(parse.to_string());
        }
        if let Some(http) = err.downcast_ref::<reqwest::Error>() {
            if http.is_decode() {
                return Self::Decode(http.to_string());
            }
        }
        Self::Http(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Ecef {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    #[serde(default)]
    pub ecef: Ecef,
}

/// One entry of `GET /stations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationRecord {
    #[serde(default)]
    pub id: Value,
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub protocol_host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub position: PositionRecord,
}

impl StationRecord {
    pub fn new(code: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            id: Value::Null,
            code: code.into(),
            name: String::new(),
            protocol_host: host.clone(),
            host,
            port,
            protocol: "NDJSON".to_string(),
            position: PositionRecord::default(),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }
}

/// One entry of `GET /databases`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub passw: String,
    #[serde(default)]
    pub dbname: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub info: Value,
}

/// One entry of `GET /servers`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub activated: bool,
}

/// Source of the authoritative registry lists.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn stations(&self) -> Result<Vec<StationRecord>, RegistryError>;
    async fn databases(&self) -> Result<Vec<DatabaseRecord>, RegistryError>;
    async fn servers(&self) -> Result<Vec<ServerRecord>, RegistryError>;
}

/// HTTP implementation of [`RegistrySource`].
///
/// A non-200 answer is retried after a fixed backoff, up to `max_attempts`
/// attempts per fetch (`None` retries forever).
pub struct RegistryApi {
    client: ApiClient,
    backoff: Duration,
    max_attempts: Option<u32>,
}

impl RegistryApi {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let client = ApiClient::new(base_url, token, timeout)
            .map_err(|e| RegistryError::Url(format!("{e:#}")))?;
        Ok(Self {
            client,
            backoff: Duration::from_millis(500),
            max_attempts: Some(3),
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, RegistryError> {
        Ok(Self::new(
            &config.registry_url,
            config.registry_token.clone(),
            config.read_timeout(),
        )?
        .with_retry(config.registry_backoff(), Some(config.registry_max_attempts.max(1))))
    }

    pub fn with_retry(mut self, backoff: Duration, max_attempts: Option<u32>) -> Self {
        self.backoff = backoff;
        self.max_attempts = max_attempts;
        self
    }

    async fn fetch<T>(&self, path: &str) -> Result<Vec<T>, RegistryError>
    where
        T: DeserializeOwned,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let response = self
                .client
                .get_json::<Vec<T>>(path)
                .await
                .map_err(RegistryError::from_transport)?;

            if response.success {
                return response
                    .data
                    .ok_or_else(|| RegistryError::Decode(format!("empty body for {path}")));
            }

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(RegistryError::Status {
                    path: path.to_string(),
                    status: response.status,
                });
            }
            log::warn!(
                "Registry answered {} for {} (attempt {}), retrying in {:?}",
                response.status,
                path,
                attempt,
                self.backoff
            );
            tokio::time::sleep(self.backoff).await;
        }
    }
}

#[async_trait]
impl RegistrySource for RegistryApi {
    async fn stations(&self) -> Result<Vec<StationRecord>, RegistryError> {
        self.fetch("stations").await
    }

    async fn databases(&self) -> Result<Vec<DatabaseRecord>, RegistryError> {
        self.fetch("databases").await
    }

    async fn servers(&self) -> Result<Vec<ServerRecord>, RegistryError> {
        self.fetch("servers").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP answer per incoming connection, in order.
    async fn serve(answers: Vec<(u16, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in answers {
                let (socket, _) = listener.accept().await.unwrap();
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Some(line) = lines.next_line().await.unwrap() {
                    if line.is_empty() {
                        break;
                    }
                }
                let reply = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                write.write_all(reply.as_bytes()).await.unwrap();
                write.shutdown().await.unwrap();
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn station_record_defaults_missing_fields() {
        let record: StationRecord =
            serde_json::from_str(r#"{ "id": 7, "code": "STA1", "host": "10.0.0.5", "port": 5001 }"#)
                .unwrap();
        assert_eq!(record.code, "STA1");
        assert_eq!(record.protocol, "");
        assert_eq!(record.protocol_host, "");
        assert_eq!(record.position.ecef, Ecef::default());
    }

    #[tokio::test]
    async fn fetch_decodes_station_list() {
        let base = serve(vec![(
            200,
            r#"[{"code":"STA1","host":"10.0.0.5","port":5001,"protocol":"ndjson",
                "position":{"ecef":{"x":1.0,"y":2.0,"z":3.0}}}]"#
                .to_string(),
        )])
        .await;
        let api = RegistryApi::new(&base, None, Duration::from_secs(5)).unwrap();

        let stations = api.stations().await.unwrap();
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].port, 5001);
        assert_eq!(stations[0].position.ecef.z, 3.0);
    }

    #[tokio::test]
    async fn non_success_status_is_retried() {
        let base = serve(vec![
            (404, "not yet".to_string()),
            (200, r#"[{"activated":true,"name":"alpha"},{"activated":false}]"#.to_string()),
        ])
        .await;
        let api = RegistryApi::new(&base, None, Duration::from_secs(5))
            .unwrap()
            .with_retry(Duration::from_millis(10), Some(3));

        let servers = api.servers().await.unwrap();
        assert_eq!(servers.len(), 2);
        assert!(servers[0].activated);
    }

    #[tokio::test]
    async fn bounded_attempts_surface_status() {
        let base = serve(vec![(404, String::new()), (404, String::new())]).await;
        let api = RegistryApi::new(&base, None, Duration::from_secs(5))
            .unwrap()
            .with_retry(Duration::from_millis(10), Some(2));

        let err = api.databases().await.unwrap_err();
        assert_eq!(
            err,
            RegistryError::Status {
                path: "databases".to_string(),
                status: 404
            }
        );
    }
}
