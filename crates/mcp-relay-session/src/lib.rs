//! Remote session lifecycle and connection multiplexing.
//!
//! One internal connection per local session streams protocol traffic
//! bidirectionally; any number of lightweight proxy handles share it.
//! The lifecycle manager creates, validates, and transparently recreates
//! the remote execution context behind a session.

pub mod connection;
pub mod lifecycle;
pub mod proxy;
pub mod singleflight;
pub mod translate;

pub use connection::{
    ConnectionConfig, ConnectionDeps, ConnectionRegistry, EventStream, OutboundFactory,
};
pub use lifecycle::{ActiveRemote, LifecycleHooks, NoopHooks, SessionLifecycle};
pub use proxy::{ConnectionProxy, SessionConnection};
pub use singleflight::SingleFlight;
pub use translate::MessageTranslator;
