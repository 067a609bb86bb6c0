//! The RPC surface consumed from execution managers.
//!
//! Managers are a fixed external boundary: this module defines the client
//! trait, the wire frame types the streaming calls demultiplex into, and
//! the RPC error shape that feeds `RelayError` classification.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    DiscoveredCapabilities, LaunchDescriptor, RemoteSessionId, RunId, RunState, SessionId,
};

/// RPC failure at the manager boundary.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The manager no longer knows this remote session.
    #[error("remote session not found: {0}")]
    SessionNotFound(String),
    /// The remote server failed to start.
    #[error("remote start failed: {0}")]
    StartFailed(String),
    /// The remote server failed while processing a message.
    #[error("message processing failed: {0}")]
    ProcessingFailed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc timed out")]
    Timeout,
}

/// A manager known to the fleet, as reported by `list_managers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerInfo {
    pub address: String,
    pub id: Option<String>,
}

/// Manager-side view of a remote session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSessionStatus {
    pub id: RemoteSessionId,
    pub ended: bool,
}

/// Manager-side view of a remote run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRunStatus {
    pub id: RunId,
    pub state: RunState,
    pub ended: bool,
}

/// A raw protocol frame as carried on the manager stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Manager-assigned message uuid; stable across replays. Absent on
    /// outbound frames originated locally.
    pub uuid: Option<Uuid>,
    /// Numeric message-kind code (see `MessageKind::from_code`).
    pub kind_code: u8,
    pub method: Option<String>,
    /// Sender-chosen JSON-RPC id, if the message carries one.
    pub id: Option<Value>,
    pub payload: Value,
    /// The run that produced this frame, when known.
    pub run_id: Option<RunId>,
}

/// Lifecycle state carried on session events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventState {
    Started,
    Stopped,
}

/// Session-lifecycle event: the current remote run and its state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub run_id: RunId,
    pub state: RunEventState,
}

/// One demultiplexed frame from a manager stream.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// A protocol message: persisted idempotently and forwarded.
    Message(WireMessage),
    /// A session-lifecycle event: updates run tracking and the mirror.
    SessionEvent(SessionEvent),
    /// A delivery failure for a relayed message.
    DeliveryError { message: String },
    /// Auxiliary output: logged, picked up later by reconciliation.
    Output { chunk: String },
}

/// Run-level event kinds pulled during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Error,
    Log,
}

/// A run-level event (error or log output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Manager-assigned event uuid; stable across replays.
    pub uuid: Uuid,
    pub run_id: RunId,
    pub kind: RunEventKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Replay/filter parameters for `stream_protocol_messages`.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Restrict to these kind codes.
    pub kind_codes: Option<Vec<u8>>,
    /// Replay starting after this unified id.
    pub after_unified_id: Option<String>,
}

/// Time window for the cursor-paginated listing calls.
#[derive(Debug, Clone, Default)]
pub struct TimeWindow {
    pub since: Option<DateTime<Utc>>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }
}

/// Server-streaming result type.
pub type FrameStream = BoxStream<'static, Result<StreamFrame, RpcError>>;

/// Outbound half of the bidirectional `send_message` call.
pub type OutboundStream = BoxStream<'static, WireMessage>;

/// Client for one execution manager.
#[async_trait]
pub trait ManagerClient: Send + Sync {
    /// The managers this endpoint knows about (gossip membership).
    async fn list_managers(&self) -> Result<Vec<ManagerInfo>, RpcError>;

    /// Whether a remote session already exists for this local session.
    async fn check_active_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<RemoteSessionStatus>, RpcError>;

    /// Create the remote execution context for a local session.
    async fn create_session(
        &self,
        session_id: SessionId,
        launch: &LaunchDescriptor,
    ) -> Result<RemoteSessionStatus, RpcError>;

    /// Current status of a remote session.
    async fn get_session(
        &self,
        remote_session_id: &str,
    ) -> Result<RemoteSessionStatus, RpcError>;

    /// Server-streaming read of protocol traffic.
    async fn stream_protocol_messages(
        &self,
        remote_session_id: &str,
        filter: MessageFilter,
    ) -> Result<FrameStream, RpcError>;

    /// Bidirectional streaming send; responses come back on the returned
    /// stream.
    async fn send_message(
        &self,
        remote_session_id: &str,
        outbound: OutboundStream,
    ) -> Result<FrameStream, RpcError>;

    /// Current status of a remote run.
    async fn get_run(&self, run_id: &str) -> Result<RemoteRunStatus, RpcError>;

    /// Protocol messages produced by a run within a time window.
    async fn list_run_messages(
        &self,
        run_id: &str,
        window: TimeWindow,
    ) -> Result<Page<WireMessage>, RpcError>;

    /// Run-level events (errors, log output) within a time window.
    async fn list_run_events(
        &self,
        run_id: &str,
        window: TimeWindow,
    ) -> Result<Page<RunEvent>, RpcError>;

    /// Introspect a server's tools/prompts/resource templates.
    async fn discover_server(
        &self,
        launch: &LaunchDescriptor,
    ) -> Result<DiscoveredCapabilities, RpcError>;
}
