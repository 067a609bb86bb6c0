//! Durable-store boundary and the in-memory backend.
//!
//! Every write from this subsystem must tolerate unique-constraint
//! violations as a no-op success: concurrent writers racing to record the
//! same remote event is expected and correct. Insert methods therefore
//! return `bool` ("newly inserted") instead of failing on duplicates.

use std::any::Any;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    Deployment, DiscoveredCapabilities, DiscoveryOutcome, ProtocolMessage, RemoteRunRecord,
    RemoteSessionId, RemoteSessionRecord, RunId, ServerVariant, ServerVersion, SessionContext,
    SessionId, VariantId, VersionId,
};

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("storage error: {0}")]
    Internal(String),
}

/// Everything discovery needs about a variant, independent of any session.
#[derive(Debug, Clone)]
pub struct DiscoveryContext {
    pub variant: ServerVariant,
    pub deployment: Deployment,
    pub current_version: Option<ServerVersion>,
}

/// Durable-store boundary (external collaborator).
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Load the full aggregate (session, deployment, variant, current
    /// version) behind a local session.
    async fn load_session_context(
        &self,
        session_id: SessionId,
    ) -> Result<Option<SessionContext>, StorageError>;

    /// Load the variant aggregate for discovery.
    async fn load_discovery_context(
        &self,
        variant_id: VariantId,
    ) -> Result<Option<DiscoveryContext>, StorageError>;

    /// Insert or update a remote-session mirror row.
    async fn upsert_remote_session(
        &self,
        record: &RemoteSessionRecord,
    ) -> Result<(), StorageError>;

    async fn get_remote_session(
        &self,
        remote_session_id: &str,
    ) -> Result<Option<RemoteSessionRecord>, StorageError>;

    /// The mirror row backing a local session, if one exists.
    async fn get_remote_session_for(
        &self,
        session_id: SessionId,
    ) -> Result<Option<RemoteSessionRecord>, StorageError>;

    /// Non-finalized mirrors in strictly increasing id order, starting
    /// after `after`.
    async fn list_unfinalized_sessions(
        &self,
        after: Option<&RemoteSessionId>,
        limit: usize,
    ) -> Result<Vec<RemoteSessionRecord>, StorageError>;

    /// Insert a run mirror. Returns `false` when the row already existed
    /// (duplicate-key race resolved as "re-read").
    async fn insert_run(&self, record: &RemoteRunRecord) -> Result<bool, StorageError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<RemoteRunRecord>, StorageError>;

    async fn update_run(&self, record: &RemoteRunRecord) -> Result<(), StorageError>;

    async fn list_unfinalized_runs(
        &self,
        after: Option<&RunId>,
        limit: usize,
    ) -> Result<Vec<RemoteRunRecord>, StorageError>;

    async fn list_runs_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<RemoteRunRecord>, StorageError>;

    /// Persist a protocol message at-most-once per uuid. Returns `false`
    /// for duplicates.
    async fn insert_message(
        &self,
        session_id: SessionId,
        message: &ProtocolMessage,
    ) -> Result<bool, StorageError>;

    /// Productive message count for a session.
    async fn message_count(&self, session_id: SessionId) -> Result<u64, StorageError>;

    /// Mark the owning session and any open connection records ended.
    async fn mark_session_ended(&self, session_id: SessionId) -> Result<(), StorageError>;

    /// Lightweight liveness stamp for an open connection.
    async fn record_connection_liveness(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Persist discovered capabilities onto the variant and, when one
    /// exists, its current version, and advance `last_discovered_at`.
    async fn set_variant_discovered(
        &self,
        variant_id: VariantId,
        version_id: Option<VersionId>,
        at: DateTime<Utc>,
        capabilities: &DiscoveredCapabilities,
    ) -> Result<(), StorageError>;

    async fn record_discovery_outcome(
        &self,
        outcome: &DiscoveryOutcome,
    ) -> Result<(), StorageError>;
}

/// Guard for a held distributed lock; released on drop.
pub struct LockGuard {
    _held: Box<dyn Any + Send>,
}

impl LockGuard {
    #[must_use]
    pub fn new(held: impl Any + Send) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

/// Named, keyed mutual exclusion. Used only to serialize run-mirror
/// creation races per session.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn acquire(&self, key: &str) -> Result<LockGuard, StorageError>;
}

#[cfg(feature = "memory")]
pub use memory::{MemoryLock, MemoryStore};

#[cfg(feature = "memory")]
mod memory {
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::{Arc, Mutex, RwLock};

    use super::{
        DiscoveryContext, DistributedLock, LockGuard, RelayStore, StorageError, async_trait,
    };
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use crate::model::{
        DiscoveredCapabilities, DiscoveryOutcome, ProtocolMessage, RemoteRunRecord,
        RemoteSessionId, RemoteSessionRecord, RunId, SessionContext, SessionId, VariantId,
        VersionId,
    };

    fn poisoned(e: impl std::fmt::Display) -> StorageError {
        StorageError::Internal(e.to_string())
    }

    /// In-memory store.
    ///
    /// Useful for tests and single-process deployments. Data is lost on
    /// restart.
    #[derive(Default)]
    pub struct MemoryStore {
        contexts: RwLock<HashMap<SessionId, SessionContext>>,
        remote_sessions: RwLock<BTreeMap<RemoteSessionId, RemoteSessionRecord>>,
        runs: RwLock<BTreeMap<RunId, RemoteRunRecord>>,
        messages: RwLock<HashMap<SessionId, BTreeMap<Uuid, ProtocolMessage>>>,
        ended_sessions: RwLock<HashSet<SessionId>>,
        liveness: RwLock<HashMap<SessionId, DateTime<Utc>>>,
        capabilities: RwLock<HashMap<VariantId, DiscoveredCapabilities>>,
        version_capabilities: RwLock<HashMap<VersionId, DiscoveredCapabilities>>,
        outcomes: RwLock<Vec<DiscoveryOutcome>>,
    }

    impl MemoryStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a session aggregate.
        pub fn put_session_context(&self, context: SessionContext) {
            self.contexts
                .write()
                .expect("contexts lock")
                .insert(context.session.id, context);
        }

        /// Test visibility: whether a session has been marked ended.
        #[must_use]
        pub fn is_session_ended(&self, session_id: SessionId) -> bool {
            self.ended_sessions
                .read()
                .expect("ended lock")
                .contains(&session_id)
        }

        /// Test visibility: recorded discovery outcomes.
        #[must_use]
        pub fn discovery_outcomes(&self) -> Vec<DiscoveryOutcome> {
            self.outcomes.read().expect("outcomes lock").clone()
        }

        /// Test visibility: capabilities stored for a variant.
        #[must_use]
        pub fn capabilities_for(&self, variant_id: VariantId) -> Option<DiscoveredCapabilities> {
            self.capabilities
                .read()
                .expect("capabilities lock")
                .get(&variant_id)
                .cloned()
        }

        /// Test visibility: capabilities stored for a version.
        #[must_use]
        pub fn capabilities_for_version(
            &self,
            version_id: VersionId,
        ) -> Option<DiscoveredCapabilities> {
            self.version_capabilities
                .read()
                .expect("version capabilities lock")
                .get(&version_id)
                .cloned()
        }

        /// Test visibility: last liveness stamp for a session.
        #[must_use]
        pub fn liveness_for(&self, session_id: SessionId) -> Option<DateTime<Utc>> {
            self.liveness
                .read()
                .expect("liveness lock")
                .get(&session_id)
                .copied()
        }
    }

    #[async_trait]
    impl RelayStore for MemoryStore {
        async fn load_session_context(
            &self,
            session_id: SessionId,
        ) -> Result<Option<SessionContext>, StorageError> {
            Ok(self
                .contexts
                .read()
                .map_err(poisoned)?
                .get(&session_id)
                .cloned())
        }

        async fn load_discovery_context(
            &self,
            variant_id: VariantId,
        ) -> Result<Option<DiscoveryContext>, StorageError> {
            Ok(self
                .contexts
                .read()
                .map_err(poisoned)?
                .values()
                .find(|ctx| ctx.variant.id == variant_id)
                .map(|ctx| DiscoveryContext {
                    variant: ctx.variant.clone(),
                    deployment: ctx.deployment.clone(),
                    current_version: ctx.current_version.clone(),
                }))
        }

        async fn upsert_remote_session(
            &self,
            record: &RemoteSessionRecord,
        ) -> Result<(), StorageError> {
            self.remote_sessions
                .write()
                .map_err(poisoned)?
                .insert(record.id.clone(), record.clone());
            Ok(())
        }

        async fn get_remote_session(
            &self,
            remote_session_id: &str,
        ) -> Result<Option<RemoteSessionRecord>, StorageError> {
            Ok(self
                .remote_sessions
                .read()
                .map_err(poisoned)?
                .get(remote_session_id)
                .cloned())
        }

        async fn get_remote_session_for(
            &self,
            session_id: SessionId,
        ) -> Result<Option<RemoteSessionRecord>, StorageError> {
            Ok(self
                .remote_sessions
                .read()
                .map_err(poisoned)?
                .values()
                .find(|r| r.session_id == session_id)
                .cloned())
        }

        async fn list_unfinalized_sessions(
            &self,
            after: Option<&RemoteSessionId>,
            limit: usize,
        ) -> Result<Vec<RemoteSessionRecord>, StorageError> {
            let sessions = self.remote_sessions.read().map_err(poisoned)?;
            Ok(sessions
                .values()
                .filter(|r| !r.is_finalized)
                .filter(|r| after.is_none_or(|a| r.id > *a))
                .take(limit)
                .cloned()
                .collect())
        }

        async fn insert_run(&self, record: &RemoteRunRecord) -> Result<bool, StorageError> {
            let mut runs = self.runs.write().map_err(poisoned)?;
            if runs.contains_key(&record.id) {
                return Ok(false);
            }
            runs.insert(record.id.clone(), record.clone());
            Ok(true)
        }

        async fn get_run(&self, run_id: &str) -> Result<Option<RemoteRunRecord>, StorageError> {
            Ok(self.runs.read().map_err(poisoned)?.get(run_id).cloned())
        }

        async fn update_run(&self, record: &RemoteRunRecord) -> Result<(), StorageError> {
            self.runs
                .write()
                .map_err(poisoned)?
                .insert(record.id.clone(), record.clone());
            Ok(())
        }

        async fn list_unfinalized_runs(
            &self,
            after: Option<&RunId>,
            limit: usize,
        ) -> Result<Vec<RemoteRunRecord>, StorageError> {
            let runs = self.runs.read().map_err(poisoned)?;
            Ok(runs
                .values()
                .filter(|r| !r.is_finalized)
                .filter(|r| after.is_none_or(|a| r.id > *a))
                .take(limit)
                .cloned()
                .collect())
        }

        async fn list_runs_for_session(
            &self,
            session_id: SessionId,
        ) -> Result<Vec<RemoteRunRecord>, StorageError> {
            Ok(self
                .runs
                .read()
                .map_err(poisoned)?
                .values()
                .filter(|r| r.session_id == session_id)
                .cloned()
                .collect())
        }

        async fn insert_message(
            &self,
            session_id: SessionId,
            message: &ProtocolMessage,
        ) -> Result<bool, StorageError> {
            let mut messages = self.messages.write().map_err(poisoned)?;
            let per_session = messages.entry(session_id).or_default();
            if per_session.contains_key(&message.uuid) {
                return Ok(false);
            }
            per_session.insert(message.uuid, message.clone());
            Ok(true)
        }

        async fn message_count(&self, session_id: SessionId) -> Result<u64, StorageError> {
            Ok(self
                .messages
                .read()
                .map_err(poisoned)?
                .get(&session_id)
                .map_or(0, |m| m.len() as u64))
        }

        async fn mark_session_ended(&self, session_id: SessionId) -> Result<(), StorageError> {
            self.ended_sessions
                .write()
                .map_err(poisoned)?
                .insert(session_id);
            self.liveness.write().map_err(poisoned)?.remove(&session_id);
            Ok(())
        }

        async fn record_connection_liveness(
            &self,
            session_id: SessionId,
            at: DateTime<Utc>,
        ) -> Result<(), StorageError> {
            self.liveness
                .write()
                .map_err(poisoned)?
                .insert(session_id, at);
            Ok(())
        }

        async fn set_variant_discovered(
            &self,
            variant_id: VariantId,
            version_id: Option<VersionId>,
            at: DateTime<Utc>,
            capabilities: &DiscoveredCapabilities,
        ) -> Result<(), StorageError> {
            self.capabilities
                .write()
                .map_err(poisoned)?
                .insert(variant_id, capabilities.clone());
            if let Some(version_id) = version_id {
                self.version_capabilities
                    .write()
                    .map_err(poisoned)?
                    .insert(version_id, capabilities.clone());
            }
            let mut contexts = self.contexts.write().map_err(poisoned)?;
            for context in contexts.values_mut() {
                if context.variant.id == variant_id {
                    context.variant.last_discovered_at = Some(at);
                }
            }
            Ok(())
        }

        async fn record_discovery_outcome(
            &self,
            outcome: &DiscoveryOutcome,
        ) -> Result<(), StorageError> {
            self.outcomes.write().map_err(poisoned)?.push(outcome.clone());
            Ok(())
        }
    }

    /// In-memory keyed lock.
    #[derive(Default)]
    pub struct MemoryLock {
        locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    }

    impl MemoryLock {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl DistributedLock for MemoryLock {
        async fn acquire(&self, key: &str) -> Result<LockGuard, StorageError> {
            let mutex = {
                let mut locks = self.locks.lock().map_err(poisoned)?;
                Arc::clone(locks.entry(key.to_string()).or_default())
            };
            let guard = mutex.lock_owned().await;
            Ok(LockGuard::new(guard))
        }
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::model::{
        MessageKind, Participant, ProtocolMessage, RemoteRunRecord, RemoteSessionRecord,
        RunState, SourceKind,
    };
    use serde_json::json;
    use uuid::Uuid;

    fn session_record(id: &str, session_id: SessionId) -> RemoteSessionRecord {
        RemoteSessionRecord {
            id: id.to_string(),
            session_id,
            kind: SourceKind::ContainerImage,
            last_sync_at: None,
            has_ended: false,
            is_finalized: false,
        }
    }

    fn run_record(id: &str, session_id: SessionId) -> RemoteRunRecord {
        RemoteRunRecord {
            id: id.to_string(),
            remote_session_id: "rs-1".to_string(),
            session_id,
            kind: SourceKind::ContainerImage,
            state: RunState::Active,
            has_ended: false,
            is_finalized: false,
            last_sync_at: None,
        }
    }

    fn message(uuid: Uuid) -> ProtocolMessage {
        ProtocolMessage {
            uuid,
            kind: MessageKind::Notification,
            method: Some("notifications/progress".to_string()),
            payload: json!({}),
            sender: Participant::server("run-1"),
            original_id: None,
            unified_id: None,
        }
    }

    #[tokio::test]
    async fn duplicate_message_insert_is_a_noop() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();
        let msg = message(Uuid::now_v7());

        assert!(store.insert_message(session_id, &msg).await.unwrap());
        assert!(!store.insert_message(session_id, &msg).await.unwrap());
        assert_eq!(store.message_count(session_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_run_insert_reports_existing() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();
        let run = run_record("run-1", session_id);

        assert!(store.insert_run(&run).await.unwrap());
        assert!(!store.insert_run(&run).await.unwrap());
    }

    #[tokio::test]
    async fn unfinalized_pages_are_ordered_and_resumable() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();
        for id in ["rs-a", "rs-b", "rs-c", "rs-d"] {
            store
                .upsert_remote_session(&session_record(id, session_id))
                .await
                .unwrap();
        }
        let mut finalized = session_record("rs-b", session_id);
        finalized.is_finalized = true;
        store.upsert_remote_session(&finalized).await.unwrap();

        let first = store.list_unfinalized_sessions(None, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, ["rs-a", "rs-c"]);

        let rest = store
            .list_unfinalized_sessions(Some(&"rs-c".to_string()), 2)
            .await
            .unwrap();
        let ids: Vec<_> = rest.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, ["rs-d"]);
    }

    #[tokio::test]
    async fn memory_lock_serializes_holders() {
        let lock = std::sync::Arc::new(MemoryLock::new());
        let guard = lock.acquire("run-create:s1").await.unwrap();

        let contender = {
            let lock = std::sync::Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire("run-create:s1").await.unwrap() })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
