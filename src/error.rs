use crate::config::ConfigError;
use crate::engine::manifest::ManifestError;
use crate::protocol::ProtocolError;

/// Failures of the message channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A complete frame arrived but its body is not a valid message. The
    /// stream is still in sync, so reading can continue.
    #[error("malformed message: {0}")]
    Malformed(#[from] ProtocolError),
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),
    #[error("channel closed")]
    Closed,
}

impl TransportError {
    /// Whether the reader may keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Malformed(_))
    }
}

/// Failures that keep a session from starting.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("transport setup failed: {0}")]
    Transport(#[from] std::io::Error),
}

/// Join an error and its source chain into a single diagnostic line.
pub fn diagnostic_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.ends_with(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}
