//! Shared fixtures for the reconciliation tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use mcp_relay_core::error::TracingReporter;
use mcp_relay_core::model::{
    Deployment, LocalSession, RemoteRunRecord, RemoteSessionRecord, RunState, ServerVariant,
    ServerVersion, SessionContext, SessionId, SourceKind, VariantId, VersionId,
};
use mcp_relay_core::queue::MemoryQueue;
use mcp_relay_core::rpc::{ManagerClient, RpcError};
use mcp_relay_core::secrets::StaticSecrets;
use mcp_relay_core::store::MemoryStore;
use mcp_relay_core::testing::FakeManager;
use mcp_relay_registry::{ManagerConnector, ManagerRegistry, RegistryConfig};

use crate::scheduler::{SyncConfig, SyncDeps, SyncScheduler};

struct NoConnector;

#[async_trait]
impl ManagerConnector for NoConnector {
    async fn connect(&self, _address: &str) -> Result<Arc<dyn ManagerClient>, RpcError> {
        Err(RpcError::Transport("not supported in tests".to_string()))
    }
}

pub(crate) struct Fixture {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub manager: Arc<FakeManager>,
    pub managers: Arc<ManagerRegistry>,
    pub scheduler: Arc<SyncScheduler>,
    pub config: SyncConfig,
    pub session_id: SessionId,
    pub variant_id: VariantId,
    pub version_id: VersionId,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(SyncConfig::default()).await
    }

    pub async fn with_config(config: SyncConfig) -> Self {
        let session_id = Uuid::new_v4();
        let variant_id = Uuid::new_v4();
        let version_id = Uuid::new_v4();

        let store = Arc::new(MemoryStore::new());
        store.put_session_context(SessionContext {
            session: LocalSession {
                id: session_id,
                created_at: Utc::now(),
            },
            deployment: Deployment {
                id: Uuid::new_v4(),
                container_image: Some("registry/srv:1".to_string()),
                remote_url: None,
                managed_runtime: None,
                config_secret_ref: Some("sec-1".to_string()),
            },
            variant: ServerVariant {
                id: variant_id,
                identifier: "srv-v1".to_string(),
                last_discovered_at: None,
            },
            current_version: Some(ServerVersion {
                id: version_id,
                variant_id,
                created_at: Utc::now(),
            }),
        });

        let manager = Arc::new(FakeManager::new("mgr-a:9000"));
        let managers = Arc::new(ManagerRegistry::new(
            Arc::new(NoConnector),
            RegistryConfig::default(),
        ));
        managers
            .insert_endpoint("mgr-a:9000", manager.clone(), true)
            .await;

        let queue = Arc::new(MemoryQueue::new());
        let deps = SyncDeps {
            store: store.clone(),
            registry: managers.clone(),
            secrets: Arc::new(StaticSecrets::new().with("sec-1", "{\"token\":\"x\"}")),
            queue: queue.clone(),
            reporter: Arc::new(TracingReporter),
        };
        let scheduler = SyncScheduler::new(deps, config.clone());

        Self {
            store,
            queue,
            manager,
            managers,
            scheduler,
            config,
            session_id,
            variant_id,
            version_id,
        }
    }

    pub fn deps(&self) -> SyncDeps {
        SyncDeps {
            store: self.store.clone(),
            registry: self.managers.clone(),
            secrets: Arc::new(StaticSecrets::new().with("sec-1", "{\"token\":\"x\"}")),
            queue: self.queue.clone(),
            reporter: Arc::new(TracingReporter),
        }
    }
}

pub(crate) fn session_record(
    id: &str,
    session_id: SessionId,
    finalized: bool,
) -> RemoteSessionRecord {
    RemoteSessionRecord {
        id: id.to_string(),
        session_id,
        kind: SourceKind::ContainerImage,
        last_sync_at: None,
        has_ended: finalized,
        is_finalized: finalized,
    }
}

pub(crate) fn run_record(id: &str, session_id: SessionId, state: RunState) -> RemoteRunRecord {
    RemoteRunRecord {
        id: id.to_string(),
        remote_session_id: "rs-1".to_string(),
        session_id,
        kind: SourceKind::ContainerImage,
        state,
        has_ended: false,
        is_finalized: false,
        last_sync_at: None,
    }
}
