//! Lightweight per-consumer handles onto a shared connection.
//!
//! Closing a proxy cancels only that consumer's streams and drops its
//! registration; the internal connection and its other consumers keep
//! going. Teardown of the connection itself is the registry's job
//! (idle eviction) or an explicit `InternalConnection::close`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mcp_relay_core::RelayError;
use mcp_relay_core::model::Participant;

use crate::connection::{EventStream, InternalConnection, OutboundFactory};

/// Consumer-facing connection surface.
#[async_trait]
pub trait SessionConnection: Send + Sync {
    /// Stream normalized protocol messages from the remote session.
    ///
    /// # Errors
    /// Fails when the remote session cannot be (re)created or the stream
    /// cannot be opened.
    async fn read_events(&self, cancel: CancellationToken) -> Result<EventStream, RelayError>;

    /// Send outbound frames; responses come back on the returned stream.
    ///
    /// # Errors
    /// Fails when the remote session cannot be (re)created or the stream
    /// cannot be opened.
    async fn send_messages(
        &self,
        outbound: OutboundFactory,
        cancel: CancellationToken,
    ) -> Result<EventStream, RelayError>;

    /// Cancel this consumer's streams and drop its registration.
    async fn close(&self);
}

/// One consumer's handle onto a shared internal connection.
pub struct ConnectionProxy {
    id: Uuid,
    inner: Arc<InternalConnection>,
    /// Child of the connection's shared token: connection close cancels
    /// every proxy, proxy close cancels only itself.
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ConnectionProxy {
    pub(crate) fn attach(inner: Arc<InternalConnection>) -> Self {
        let id = Uuid::new_v4();
        inner.register_proxy(id);
        let cancel = inner.shared_cancel().child_token();
        Self {
            id,
            inner,
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The sender identity stamped on frames sent through this proxy.
    #[must_use]
    pub fn participant(&self) -> Participant {
        Participant::client(self.id.to_string())
    }

    /// Merge a caller-supplied token with this proxy's own.
    fn compose(&self, caller: CancellationToken) -> CancellationToken {
        let merged = self.cancel.child_token();
        let forward = merged.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = caller.cancelled() => forward.cancel(),
                () = forward.cancelled() => {}
            }
        });
        merged
    }
}

#[async_trait]
impl SessionConnection for ConnectionProxy {
    async fn read_events(&self, cancel: CancellationToken) -> Result<EventStream, RelayError> {
        self.inner.read_events(self.compose(cancel)).await
    }

    async fn send_messages(
        &self,
        outbound: OutboundFactory,
        cancel: CancellationToken,
    ) -> Result<EventStream, RelayError> {
        self.inner
            .send_messages(self.participant(), outbound, self.compose(cancel))
            .await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.inner.unregister_proxy(self.id);
    }
}
