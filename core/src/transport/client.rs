//! A minimal client over the Unix socket transport, used by integration
//! tests and available to any Rust caller that wants to drive the broker
//! without going through the wire's raw line protocol.
//!
//! Mirrors the agent-side client's listen loop: replies matching a pending
//! request's id are routed to the waiting future, everything else (unsolicited
//! commands, broadcasts) is buffered on an inbox queue for `recv`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

use crate::envelope::Envelope;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A connected client. Dropping it closes the write side and stops the
/// background reader task.
pub struct Client {
    agent_id: String,
    writer: mpsc::UnboundedSender<String>,
    pending: Arc<DashMap<String, oneshot::Sender<Envelope>>>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    _reader_task: tokio::task::JoinHandle<()>,
    _writer_task: tokio::task::JoinHandle<()>,
}

impl Client {
    /// Connect to the broker's Unix socket at `path`.
    pub async fn connect(path: impl AsRef<Path>, agent_id: impl Into<String>) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            while let Some(mut line) = write_rx.recv().await {
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let pending: Arc<DashMap<String, oneshot::Sender<Envelope>>> = Arc::new(DashMap::new());
        let pending_clone = pending.clone();
        let reader_task = tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let envelope = match Envelope::decode(&line) {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                if let Some(reply_to) = &envelope.reply_to {
                    if let Some((_, tx)) = pending_clone.remove(reply_to) {
                        let _ = tx.send(envelope);
                        continue;
                    }
                }
                let _ = inbox_tx.send(envelope);
            }
        });

        Ok(Client {
            agent_id: agent_id.into(),
            writer: write_tx,
            pending,
            inbox: inbox_rx,
            _reader_task: reader_task,
            _writer_task: writer_task,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Send an envelope without waiting for a reply.
    pub fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        self.writer.send(envelope.encode()).map_err(|_| ClientError::NotConnected)
    }

    /// Receive the next envelope that wasn't consumed as a reply to a
    /// pending request (unsolicited commands, broadcasts, agent messages).
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbox.recv().await
    }

    /// Send `envelope` and await the reply whose `reply_to` matches its id,
    /// timing out after `timeout`.
    pub async fn request(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(envelope.id.clone(), tx);
        if let Err(e) = self.send(&envelope) {
            self.pending.remove(&envelope.id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) | Err(_) => {
                self.pending.remove(&envelope.id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Convenience wrapper for `service.request` round trips.
    pub async fn service_request(
        &self,
        service: &str,
        action: &str,
        params: BTreeMap<String, Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let mut payload = BTreeMap::new();
        payload.insert("service".to_string(), Value::String(service.to_string()));
        payload.insert("action".to_string(), Value::String(action.to_string()));
        payload.insert("params".to_string(), Value::Object(params.into_iter().collect()));
        let envelope = Envelope::create(crate::envelope::MSG_SERVICE_REQUEST, self.agent_id.clone(), "broker", payload);
        let reply = self.request(envelope, timeout).await?;
        if reply.r#type == crate::envelope::MSG_SERVICE_ERROR {
            let msg = reply
                .payload
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown service error")
                .to_string();
            return Err(ClientError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg)));
        }
        Ok(reply.payload.get("result").cloned().unwrap_or(Value::Null))
    }
}
