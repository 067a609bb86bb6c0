//! Failure classification and the exception-tracking side channel.

use thiserror::Error;

use crate::model::{RemoteSessionId, SessionId};
use crate::rpc::RpcError;
use crate::store::StorageError;

/// Classified relay failure. Variants are `Clone` so a single failure can
/// fan out to every waiter of a single-flight recreation.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Permanent: the registry has no enabled manager. Not retried.
    #[error("no execution manager available; please contact support")]
    NoManagerAvailable,
    /// Transient: the manager no longer knows the remote session. Handled
    /// by single-flight recreation, invisible to callers.
    #[error("remote session not found: {0}")]
    RemoteSessionMissing(String),
    /// The remote server failed to start.
    #[error("remote server failed to start: {0}")]
    RemoteStartFailed(String),
    /// The remote server failed while processing a message.
    #[error("mcp processing failed: {0}")]
    McpProcessingFailed(String),
    /// Session has no current version to launch.
    #[error("session {0} has no current version")]
    NoCurrentVersion(SessionId),
    /// Deployment does not describe exactly one launch source.
    #[error("invalid launch source: {0}")]
    InvalidLaunchSource(String),
    #[error("secret reveal failed: {0}")]
    Secret(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("queue error: {0}")]
    Queue(String),
    /// Everything else: generic session error, reported to the exception
    /// tracker and rethrown.
    #[error("session error: {0}")]
    Session(String),
}

impl RelayError {
    /// Whether this failure is the recreate-and-retry one.
    #[must_use]
    pub const fn is_remote_session_missing(&self) -> bool {
        matches!(self, Self::RemoteSessionMissing(_))
    }
}

impl From<RpcError> for RelayError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::SessionNotFound(id) => Self::RemoteSessionMissing(id),
            RpcError::StartFailed(msg) => Self::RemoteStartFailed(msg),
            RpcError::ProcessingFailed(msg) => Self::McpProcessingFailed(msg),
            RpcError::Transport(msg) => Self::Session(msg),
            RpcError::Timeout => Self::Session("manager rpc timed out".to_string()),
        }
    }
}

impl From<StorageError> for RelayError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Context attached to reported failures.
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub session_id: Option<SessionId>,
    pub remote_session_id: Option<RemoteSessionId>,
    /// Instance/deployment descriptor for audit trails.
    pub instance: Option<String>,
}

/// Exception-tracking side channel. Persistence failures on the live
/// stream are observed only through this trait, never by the stream
/// consumer.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &RelayError, context: &ReportContext);
}

/// Default reporter: structured logging.
#[derive(Debug, Default, Clone)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &RelayError, context: &ReportContext) {
        tracing::error!(
            session_id = ?context.session_id,
            remote_session_id = ?context.remote_session_id,
            instance = ?context.instance,
            %error,
            "relay failure",
        );
    }
}
