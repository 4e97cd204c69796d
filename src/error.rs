use crate::call::MethodType;
use crate::{CallId, ConnectionId};

/// Synchronous failures of the bridge operations.
///
/// In-flight protocol failures never show up here; they are delivered as
/// `error` events once the transport reports a non-OK status.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid connection settings: {0}")]
    Configuration(String),
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),
    #[error("call {0} is already active")]
    DuplicateCall(CallId),
    #[error("call {id} is a {actual} call, not {expected}")]
    CallTypeMismatch {
        id: CallId,
        expected: MethodType,
        actual: MethodType,
    },
    #[error("call {0} no longer accepts messages")]
    CallClosed(CallId),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("invalid method path: {0:?}")]
    InvalidPath(String),
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}
