use thiserror::Error;

/// Failures reported by the RPC channel this crate consumes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("rpc timed out")]
    Timeout,
    #[error("session is stale")]
    StaleSession,
    #[error("remote does not know the referenced instance")]
    UnknownInstance,
    #[error("object not found")]
    NotFound,
    #[error("rpc failed: {0}")]
    Other(String),
}

/// Errors surfaced by the sync engine.
///
/// `Clone` so a finished transfer can hand its result out more than once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("object not found")]
    NotFound,
    #[error("remote does not know the referenced instance")]
    UnknownInstance,
    #[error("session is stale")]
    StaleSession,
    #[error("timed out")]
    Timeout,
    #[error("inconsistent server response: {0}")]
    Inconsistent(String),
    #[error("not supported: {0}")]
    Unsupported(&'static str),
    #[error("transfer aborted")]
    TransferAborted,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("rpc failed: {0}")]
    Rpc(String),
    #[error("io: {0}")]
    Io(String),
}

impl From<RpcError> for SyncError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout => SyncError::Timeout,
            RpcError::StaleSession => SyncError::StaleSession,
            RpcError::UnknownInstance => SyncError::UnknownInstance,
            RpcError::NotFound => SyncError::NotFound,
            RpcError::Other(msg) => SyncError::Rpc(msg),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
