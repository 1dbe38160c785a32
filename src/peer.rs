//! The writing side of a session.
//!
//! Every outgoing message goes through one [`Peer`], which serializes
//! writes so frames never interleave. Outbound requests are tracked in the
//! shared [`RequestLedger`] and resolved by the read loop when the
//! client's answer arrives.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::MessageWriter;
use crate::error::TransportError;
use crate::ledger::{Outcome, RequestLedger};
use crate::protocol::{methods, ErrorObject, LogLevel, LogParams, Message, RequestId};

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode params: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("peer rejected {method}: {error}")]
    Rejected { method: String, error: ErrorObject },
    #[error("peer did not answer {method} within {timeout:?}")]
    TimedOut { method: String, timeout: Duration },
    #[error("{method} was abandoned before the peer answered")]
    Abandoned { method: String },
    #[error("{method} was cancelled")]
    Cancelled { method: String },
}

struct PeerInner {
    writer: Mutex<Box<dyn MessageWriter>>,
    ledger: Arc<RequestLedger>,
    /// Parent of every outbound request's cancellation source.
    session_token: CancellationToken,
    request_timeout: Duration,
}

#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    pub fn new(
        writer: Box<dyn MessageWriter>,
        ledger: Arc<RequestLedger>,
        session_token: CancellationToken,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                writer: Mutex::new(writer),
                ledger,
                session_token,
                request_timeout,
            }),
        }
    }

    /// Write one message. Writes are serialized across all clones.
    pub async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let mut writer = self.inner.writer.lock().await;
        match tokio::time::timeout(WRITE_TIMEOUT, writer.write_message(message)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write timed out",
            ))),
        }
    }

    pub async fn respond(&self, id: RequestId, result: Value) -> Result<(), TransportError> {
        self.send(&Message::response(id, result)).await
    }

    pub async fn respond_error(
        &self,
        id: RequestId,
        error: ErrorObject,
    ) -> Result<(), TransportError> {
        self.send(&Message::error(id, error)).await
    }

    pub async fn notify<P: Serialize>(&self, method: &str, params: &P) -> Result<(), PeerError> {
        let params = serde_json::to_value(params)?;
        self.send(&Message::notification(method, Some(params))).await?;
        Ok(())
    }

    /// Send a `client/log` notification. Failures are only traced.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let params = LogParams {
            level,
            message: message.into(),
        };
        if let Err(e) = self.notify(methods::CLIENT_LOG, &params).await {
            debug!(?e, "failed to forward log message");
        }
    }

    /// Send a request and wait for the peer's answer.
    ///
    /// Gives up after the configured request timeout, or when `cancel`
    /// fires. In both cases the ledger entry is abandoned and a late answer
    /// is ignored.
    pub async fn request<P: Serialize>(
        &self,
        method: &str,
        params: &P,
        cancel: &CancellationToken,
    ) -> Result<Value, PeerError> {
        let params = serde_json::to_value(params)?;
        let ledger = &self.inner.ledger;
        let (id, rx) = ledger.register_outbound(&self.inner.session_token);

        if let Err(e) = self
            .send(&Message::request(id.clone(), method, Some(params)))
            .await
        {
            ledger.abandon_outbound(&id);
            return Err(e.into());
        }

        let timeout = self.inner.request_timeout;
        let answer = tokio::select! {
            _ = cancel.cancelled() => {
                ledger.abandon_outbound(&id);
                return Err(PeerError::Cancelled { method: method.to_string() });
            }
            answer = tokio::time::timeout(timeout, rx) => answer,
        };

        match answer {
            Ok(Ok(Outcome::Completed(value))) => Ok(value),
            Ok(Ok(Outcome::Failed(error))) | Ok(Ok(Outcome::Cancelled(error))) => {
                Err(PeerError::Rejected {
                    method: method.to_string(),
                    error,
                })
            }
            Ok(Err(_)) => Err(PeerError::Abandoned {
                method: method.to_string(),
            }),
            Err(_) => {
                ledger.abandon_outbound(&id);
                Err(PeerError::TimedOut {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    pub async fn close(&self) {
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!(?e, "error closing channel writer");
        }
    }
}
