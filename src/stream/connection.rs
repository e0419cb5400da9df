// src/stream/connection.rs
//! One transport's connect/receive/close cycle behind a single capability
//! trait. The supervisor never branches on transport kind; the two variants
//! differ only in how they are built and in their error tolerance.
//!
//! - Persistent push: a long-lived TCP connection delivering one JSON
//!   payload per line (the shape of a raw AIS relay).
//! - Polled: one HTTP GET per tick, paced by the rate limiter.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{StreamDescriptor, TransportKind};
use crate::ingest::types::{Category, RawRecord};
use crate::stream::limiter::RateLimiter;

/// Transient transport failures; they drive reconnect/backoff, never panic.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("operation timed out")]
    Timeout,
    #[error("connection closed by peer")]
    Closed,
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("http status {0}")]
    Http(u16),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

pub type ConnResult<T> = Result<T, ConnectionError>;

#[async_trait]
pub trait StreamTransport: Send {
    async fn connect(&mut self) -> ConnResult<()>;
    /// Receive (push) or fetch (poll) the next batch of raw records.
    async fn next_payload(&mut self) -> ConnResult<Vec<RawRecord>>;
    async fn close(&mut self);
    /// `true` when a failed receive burns a single tick (polled) instead of
    /// tearing the connection down (push).
    fn survives_errors(&self) -> bool {
        false
    }
}

/// Injectable constructor so tests can run scripted transports.
pub type TransportFactory =
    Arc<dyn Fn(&StreamDescriptor) -> Box<dyn StreamTransport> + Send + Sync>;

pub fn default_transport_factory(limiter: Arc<RateLimiter>) -> TransportFactory {
    Arc::new(move |d: &StreamDescriptor| -> Box<dyn StreamTransport> {
        match d.transport {
            TransportKind::PersistentPush => Box::new(PersistentPushConnection::new(
                d.clone(),
                Arc::clone(&limiter),
            )),
            TransportKind::Polled => {
                Box::new(PolledConnection::new(d.clone(), Arc::clone(&limiter)))
            }
        }
    })
}

/// Split one wire payload into raw records: a JSON array fans out to one
/// record per element, anything else is a single record.
pub fn fan_out(category: Category, body: &str, arrived_at: u64) -> ConnResult<Vec<RawRecord>> {
    let value: serde_json::Value = serde_json::from_str(body.trim())
        .map_err(|e| ConnectionError::Malformed(e.to_string()))?;
    let payloads = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    Ok(payloads
        .into_iter()
        .map(|payload| RawRecord {
            category,
            payload,
            arrived_at,
        })
        .collect())
}

// ---------------------------------------------------------------
// Persistent push: TCP, newline-delimited JSON
// ---------------------------------------------------------------

pub struct PersistentPushConnection {
    descriptor: StreamDescriptor,
    limiter: Arc<RateLimiter>,
    reader: Option<BufReader<TcpStream>>,
}

impl PersistentPushConnection {
    pub fn new(descriptor: StreamDescriptor, limiter: Arc<RateLimiter>) -> Self {
        Self {
            descriptor,
            limiter,
            reader: None,
        }
    }

    fn addr(&self) -> &str {
        self.descriptor
            .uri
            .strip_prefix("tcp://")
            .unwrap_or(&self.descriptor.uri)
    }
}

#[async_trait]
impl StreamTransport for PersistentPushConnection {
    async fn connect(&mut self) -> ConnResult<()> {
        // Gate reconnect storms through the shared limiter.
        self.limiter.acquire(&self.descriptor.name).await;
        let stream = timeout(
            self.descriptor.connect_timeout(),
            TcpStream::connect(self.addr()),
        )
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(|e| ConnectionError::Io(e.to_string()))?;
        self.reader = Some(BufReader::new(stream));
        Ok(())
    }

    async fn next_payload(&mut self) -> ConnResult<Vec<RawRecord>> {
        let reader = self.reader.as_mut().ok_or(ConnectionError::Closed)?;
        let mut line = String::new();
        let n = timeout(self.descriptor.read_timeout(), reader.read_line(&mut line))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        if n == 0 {
            return Err(ConnectionError::Closed);
        }
        if line.trim().is_empty() {
            return Ok(Vec::new()); // keep-alive blank line
        }
        fan_out(self.descriptor.category, &line, now_unix())
    }

    async fn close(&mut self) {
        self.reader = None;
    }
}

// ---------------------------------------------------------------
// Polled: one HTTP GET per tick
// ---------------------------------------------------------------

pub struct PolledConnection {
    descriptor: StreamDescriptor,
    limiter: Arc<RateLimiter>,
    client: Option<reqwest::Client>,
}

impl PolledConnection {
    pub fn new(descriptor: StreamDescriptor, limiter: Arc<RateLimiter>) -> Self {
        Self {
            descriptor,
            limiter,
            client: None,
        }
    }
}

#[async_trait]
impl StreamTransport for PolledConnection {
    async fn connect(&mut self) -> ConnResult<()> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.descriptor.connect_timeout())
            .timeout(self.descriptor.read_timeout())
            .build()
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        self.client = Some(client);
        Ok(())
    }

    async fn next_payload(&mut self) -> ConnResult<Vec<RawRecord>> {
        // One fetch per grant; the limiter holds this stream to its
        // configured poll interval.
        self.limiter.acquire(&self.descriptor.name).await;
        let client = self.client.as_ref().ok_or(ConnectionError::Closed)?;
        let resp = client
            .get(&self.descriptor.uri)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConnectionError::Timeout
                } else {
                    ConnectionError::Io(e.to_string())
                }
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ConnectionError::Http(status.as_u16()));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        fan_out(self.descriptor.category, &body, now_unix())
    }

    async fn close(&mut self) {
        self.client = None;
    }

    fn survives_errors(&self) -> bool {
        true
    }
}

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use std::time::Duration;

    fn descriptor(uri: &str) -> StreamDescriptor {
        StreamDescriptor {
            name: "t".into(),
            transport: TransportKind::PersistentPush,
            uri: uri.into(),
            poll_interval_ms: None,
            connect_timeout_ms: 1_000,
            read_timeout_ms: 1_000,
            reconnect_delay_ms: 10,
            max_retries: 1,
            filters: vec![],
            category: Category::VesselPosition,
        }
    }

    #[test]
    fn fan_out_splits_arrays_and_wraps_objects() {
        let recs = fan_out(Category::News, r#"[{"a":1},{"b":2}]"#, 10).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].category, Category::News);
        assert_eq!(recs[0].arrived_at, 10);

        let recs = fan_out(Category::News, r#"{"a":1}"#, 10).unwrap();
        assert_eq!(recs.len(), 1);

        assert!(matches!(
            fan_out(Category::News, "not json", 10),
            Err(ConnectionError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn push_transport_reads_lines_until_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"{\"vessel_id\":\"V1\"}\n").await.unwrap();
            sock.write_all(b"[{\"vessel_id\":\"V2\"},{\"vessel_id\":\"V3\"}]\n")
                .await
                .unwrap();
            // Dropping the socket closes the stream.
        });

        let mut conn = PersistentPushConnection::new(
            descriptor(&format!("tcp://{addr}")),
            Arc::new(RateLimiter::new()),
        );
        conn.connect().await.unwrap();
        assert_eq!(conn.next_payload().await.unwrap().len(), 1);
        assert_eq!(conn.next_payload().await.unwrap().len(), 2);
        assert!(matches!(
            conn.next_payload().await,
            Err(ConnectionError::Closed)
        ));
        conn.close().await;
    }

    #[tokio::test]
    async fn push_read_times_out_on_silence() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut d = descriptor(&format!("tcp://{addr}"));
        d.read_timeout_ms = 50;
        let mut conn = PersistentPushConnection::new(d, Arc::new(RateLimiter::new()));
        conn.connect().await.unwrap();
        assert!(matches!(
            conn.next_payload().await,
            Err(ConnectionError::Timeout)
        ));
    }
}
