//! Remote session lifecycle: create, validate, transparently recreate.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::Future;

use mcp_relay_core::model::{LaunchDescriptor, RemoteSessionId, RemoteSessionRecord, SessionId};
use mcp_relay_core::queue::Job;
use mcp_relay_core::rpc::{ManagerClient, RpcError};
use mcp_relay_core::secrets::SecretUsage;
use mcp_relay_core::{JobQueue, RelayError, RelayStore, SecretReveal, SessionContext};
use mcp_relay_registry::ManagerRegistry;

use crate::singleflight::SingleFlight;

/// Extension points fired around remote-session creation.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn before_create(&self, _context: &SessionContext) {}
    async fn after_create(&self, _context: &SessionContext, _record: &RemoteSessionRecord) {}
}

/// Default no-op hooks.
#[derive(Debug, Default, Clone)]
pub struct NoopHooks;

#[async_trait]
impl LifecycleHooks for NoopHooks {}

/// The live remote context a session is currently bound to.
#[derive(Clone)]
pub struct ActiveRemote {
    pub record: RemoteSessionRecord,
    pub client: Arc<dyn ManagerClient>,
}

/// Per-session lifecycle manager.
///
/// Holds the currently bound remote context and the single-flight slot
/// that serializes recreations after a "session not found" error.
pub struct SessionLifecycle {
    session_id: SessionId,
    store: Arc<dyn RelayStore>,
    registry: Arc<ManagerRegistry>,
    secrets: Arc<dyn SecretReveal>,
    queue: Arc<dyn JobQueue>,
    hooks: Arc<dyn LifecycleHooks>,
    state: tokio::sync::Mutex<Option<ActiveRemote>>,
    recreation: SingleFlight<ActiveRemote>,
}

impl SessionLifecycle {
    #[must_use]
    pub fn new(
        session_id: SessionId,
        store: Arc<dyn RelayStore>,
        registry: Arc<ManagerRegistry>,
        secrets: Arc<dyn SecretReveal>,
        queue: Arc<dyn JobQueue>,
        hooks: Arc<dyn LifecycleHooks>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            store,
            registry,
            secrets,
            queue,
            hooks,
            state: tokio::sync::Mutex::new(None),
            recreation: SingleFlight::new(),
        })
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The bound remote context, creating it on first use.
    ///
    /// # Errors
    /// Fails fast when the session has no current version, and with a
    /// permanent `NoManagerAvailable` when routing finds nothing.
    pub async fn ensure(&self) -> Result<ActiveRemote, RelayError> {
        let mut state = self.state.lock().await;
        if let Some(active) = state.as_ref() {
            return Ok(active.clone());
        }
        let active = self.create().await?;
        *state = Some(active.clone());
        Ok(active)
    }

    /// Create the remote execution context, reusing a manager-side
    /// session when one already exists for this local session.
    pub async fn create(&self) -> Result<ActiveRemote, RelayError> {
        let context = self
            .store
            .load_session_context(self.session_id)
            .await?
            .ok_or_else(|| RelayError::Session(format!("unknown session {}", self.session_id)))?;
        if context.current_version.is_none() {
            return Err(RelayError::NoCurrentVersion(self.session_id));
        }
        self.hooks.before_create(&context).await;

        let client = self
            .registry
            .select(&context.variant.identifier)
            .await
            .ok_or(RelayError::NoManagerAvailable)?;

        if let Some(status) = client
            .check_active_session(self.session_id)
            .await
            .map_err(RelayError::from)?
        {
            tracing::info!(
                session_id = %self.session_id,
                remote_session_id = %status.id,
                "reusing existing remote session",
            );
            let descriptor = LaunchDescriptor::from_deployment(&context.deployment, None)?;
            let record = RemoteSessionRecord {
                id: status.id,
                session_id: self.session_id,
                kind: descriptor.kind(),
                last_sync_at: None,
                has_ended: status.ended,
                is_finalized: false,
            };
            self.store.upsert_remote_session(&record).await?;
            return Ok(ActiveRemote { record, client });
        }

        let config = match &context.deployment.config_secret_ref {
            Some(secret_ref) => Some(
                self.secrets
                    .reveal(
                        secret_ref,
                        &SecretUsage {
                            instance: self.session_id.to_string(),
                            purpose: "session-create".to_string(),
                        },
                    )
                    .await
                    .map_err(|e| RelayError::Secret(e.to_string()))?,
            ),
            None => None,
        };
        let launch = LaunchDescriptor::from_deployment(&context.deployment, config)?;

        let status = client
            .create_session(self.session_id, &launch)
            .await
            .map_err(RelayError::from)?;
        tracing::info!(
            session_id = %self.session_id,
            remote_session_id = %status.id,
            kind = ?launch.kind(),
            "created remote session",
        );

        let record = RemoteSessionRecord {
            id: status.id,
            session_id: self.session_id,
            kind: launch.kind(),
            last_sync_at: None,
            has_ended: false,
            is_finalized: false,
        };
        self.store.upsert_remote_session(&record).await?;
        self.hooks.after_create(&context, &record).await;

        // One-time capability discovery for variants never introspected.
        if context.variant.last_discovered_at.is_none() {
            self.queue
                .enqueue(Job::Discover(context.variant.id))
                .await
                .map_err(|e| RelayError::Queue(e.to_string()))?;
        }

        Ok(ActiveRemote { record, client })
    }

    /// Single-flight recreation after a "session not found" error.
    async fn recreate(self: &Arc<Self>) -> Result<ActiveRemote, RelayError> {
        let this = Arc::clone(self);
        self.recreation
            .run(move || {
                async move {
                    this.state.lock().await.take();
                    let active = this.create().await?;
                    *this.state.lock().await = Some(active.clone());
                    Ok(active)
                }
                .boxed()
            })
            .await
    }

    /// Run one RPC call against the bound manager. A "session not found"
    /// failure triggers single-flight recreation and exactly one retry;
    /// any other failure is classified and surfaced.
    ///
    /// # Errors
    /// Returns the classified failure of the call or of recreation.
    pub async fn with_client<T, F, Fut>(self: &Arc<Self>, call: F) -> Result<T, RelayError>
    where
        F: Fn(Arc<dyn ManagerClient>, RemoteSessionId) -> Fut,
        Fut: Future<Output = Result<T, RpcError>> + Send,
    {
        let active = self.ensure().await?;
        match call(Arc::clone(&active.client), active.record.id.clone()).await {
            Ok(value) => Ok(value),
            Err(RpcError::SessionNotFound(id)) => {
                tracing::debug!(
                    session_id = %self.session_id,
                    remote_session_id = %id,
                    "remote session missing, recreating",
                );
                let active = self.recreate().await?;
                call(active.client, active.record.id)
                    .await
                    .map_err(RelayError::from)
            }
            Err(e) => Err(RelayError::from(e)),
        }
    }
}
