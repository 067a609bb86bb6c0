//! Core abstractions for relaying MCP-style servers through remote
//! execution managers.
//!
//! This crate provides the fundamental building blocks:
//! - Mirror records (`RemoteSessionRecord`, `RemoteRunRecord`) and the
//!   normalized `ProtocolMessage`
//! - `UnifiedIdentity` - per-session message-id unification
//! - `RelayError` - failure classification shared by every layer
//! - Boundary traits for the durable store, job queue, distributed lock,
//!   secret reveal, and manager RPC collaborators

pub mod error;
pub mod identity;
pub mod model;
pub mod queue;
pub mod rpc;
pub mod secrets;
pub mod store;

#[cfg(feature = "test-util")]
pub mod testing;

pub use error::{ErrorReporter, RelayError, ReportContext, TracingReporter};
pub use identity::UnifiedIdentity;
pub use model::{
    LaunchDescriptor, Participant, ParticipantRole, ProtocolMessage, RemoteRunRecord,
    RemoteSessionRecord, SessionContext, SessionId,
};
pub use queue::{Job, JobQueue};
pub use rpc::ManagerClient;
pub use secrets::SecretReveal;
pub use store::{DistributedLock, RelayStore};
