//! Transport error types
//!
//! Centralized error handling for the control plane: proxy-side failures
//! (timeouts are distinguishable from handler errors), and server lifecycle
//! failures. Capability dispatch errors live in [`crate::capability`].

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to callers of the client proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The connection wait expired before the socket reached `connected`.
    #[error("timed out waiting for connection after {0:?}")]
    ConnectTimeout(Duration),

    /// No response arrived for an invoke before its deadline.
    #[error("invoke on '{channel}' timed out after {timeout:?}")]
    InvokeTimeout { channel: String, timeout: Duration },

    /// The reconnect budget is exhausted; the proxy is permanently down.
    #[error("connection lost and retries exhausted")]
    Disconnected,

    /// The remote handler (or the capability table in embedded mode)
    /// reported a failure; the message is the handler's own text.
    #[error("{0}")]
    Handler(String),

    /// Socket-level failure while sending.
    #[error("transport error: {0}")]
    Transport(String),

    /// Message could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProxyError {
    /// Whether this error is a client-side timeout rather than a handler
    /// failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProxyError::ConnectTimeout(_) | ProxyError::InvokeTimeout { .. }
        )
    }
}

/// Errors from starting or running the relay / tool-call servers.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server already running")]
    AlreadyRunning,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ServerError> for String {
    fn from(err: ServerError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_errors_are_distinguishable() {
        let timeout = ProxyError::InvokeTimeout {
            channel: "list_items".into(),
            timeout: Duration::from_secs(30),
        };
        assert!(timeout.is_timeout());
        assert!(ProxyError::ConnectTimeout(Duration::from_secs(10)).is_timeout());
        assert!(!ProxyError::Handler("boom".into()).is_timeout());
        assert!(!ProxyError::Disconnected.is_timeout());
    }

    #[test]
    fn test_handler_error_text_is_verbatim() {
        let err = ProxyError::Handler("unknown channel: nope".into());
        assert_eq!(err.to_string(), "unknown channel: nope");
    }
}
