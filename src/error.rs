use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

/// An error reported by the remote peer for a failed call.
///
/// `stack` is carried as pre-split lines on the wire; [`RemoteError::stack_trace`]
/// joins them back into one multi-line string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
    pub name: String,
    pub stack: Option<Vec<String>>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: name.into(),
            stack: None,
        }
    }

    pub fn stack_trace(&self) -> Option<String> {
        self.stack.as_ref().map(|lines| lines.join("\n"))
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("{0}")]
    Remote(RemoteError),

    /// An arbitrary rejection value, passed through a `CallErrorObj` frame
    /// unchanged. Decode it with the connection's codec.
    #[error("remote rejection value ({} bytes)", .0.len())]
    Value(Bytes),

    #[error("call canceled")]
    Canceled,

    #[error("client disposed")]
    Disposed,

    #[error("connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RpcError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, RpcError::Canceled)
    }

    fn name(&self) -> &'static str {
        match self {
            RpcError::Serialization(_) => "SerializationError",
            RpcError::Frame(_) => "FrameError",
            RpcError::Remote(_) => "Error",
            RpcError::Value(_) => "Error",
            RpcError::Canceled => "Canceled",
            RpcError::Disposed => "Disposed",
            RpcError::ConnectionClosed => "ConnectionClosed",
            RpcError::Transport(_) => "TransportError",
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl From<bincode::Error> for RpcError {
    fn from(err: bincode::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

/// Wire shape of a `CallError` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub name: String,
    pub stack: Option<Vec<String>>,
}

impl ErrorPayload {
    pub fn from_error(err: &RpcError) -> Self {
        match err {
            RpcError::Remote(remote) => Self {
                message: remote.message.clone(),
                name: remote.name.clone(),
                stack: remote.stack.clone(),
            },
            other => Self {
                message: other.to_string(),
                name: other.name().to_string(),
                stack: None,
            },
        }
    }
}

impl From<ErrorPayload> for RemoteError {
    fn from(payload: ErrorPayload) -> Self {
        Self {
            message: payload.message,
            name: payload.name,
            stack: payload.stack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError::new("boom", "Error");
        assert_eq!(err.to_string(), "Error: boom");

        let unnamed = RemoteError::new("boom", "");
        assert_eq!(unnamed.to_string(), "boom");
    }

    #[test]
    fn test_stack_trace_joins_lines() {
        let mut err = RemoteError::new("boom", "Error");
        assert_eq!(err.stack_trace(), None);

        err.stack = Some(vec![
            "Error: boom".to_string(),
            "    at handler".to_string(),
            "    at dispatch".to_string(),
        ]);
        assert_eq!(
            err.stack_trace().unwrap(),
            "Error: boom\n    at handler\n    at dispatch"
        );
    }

    #[test]
    fn test_payload_round_trip_preserves_remote_error() {
        let remote = RemoteError {
            message: "division by zero".to_string(),
            name: "MathError".to_string(),
            stack: Some(vec!["line 1".to_string(), "line 2".to_string()]),
        };
        let payload = ErrorPayload::from_error(&RpcError::Remote(remote.clone()));
        let rebuilt: RemoteError = payload.into();
        assert_eq!(rebuilt, remote);
    }

    #[test]
    fn test_payload_from_local_error() {
        let payload = ErrorPayload::from_error(&RpcError::Canceled);
        assert_eq!(payload.name, "Canceled");
        assert_eq!(payload.stack, None);
    }
}
