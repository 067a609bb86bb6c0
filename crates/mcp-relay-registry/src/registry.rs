//! Endpoint registry with gossip-style probing and sticky selection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mcp_relay_core::RelayError;
use mcp_relay_core::rpc::{ManagerClient, RpcError};

use crate::hash::murmur3_32;

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How often the fleet is probed.
    pub probe_interval: Duration,
    /// Hard timeout per probe; exceeding it counts as a failure.
    pub probe_timeout: Duration,
    /// `must_select` attempts before giving up.
    pub select_attempts: u32,
    pub select_initial_backoff: Duration,
    pub select_max_backoff: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            select_attempts: 10,
            select_initial_backoff: Duration::from_millis(500),
            select_max_backoff: Duration::from_secs(5),
        }
    }
}

/// Builds a client for a newly discovered manager address.
#[async_trait]
pub trait ManagerConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn ManagerClient>, RpcError>;
}

struct Endpoint {
    client: Arc<dyn ManagerClient>,
    enabled: bool,
    manager_id: Option<String>,
}

/// Process-wide view of the execution-manager fleet.
///
/// The probe produces a converging, gossip-like view without a strong
/// consistency guarantee; routing tolerates a stale or partially-converged
/// view.
pub struct ManagerRegistry {
    endpoints: RwLock<BTreeMap<String, Endpoint>>,
    connector: Arc<dyn ManagerConnector>,
    config: RegistryConfig,
}

impl ManagerRegistry {
    #[must_use]
    pub fn new(connector: Arc<dyn ManagerConnector>, config: RegistryConfig) -> Self {
        Self {
            endpoints: RwLock::new(BTreeMap::new()),
            connector,
            config,
        }
    }

    /// Seed a known endpoint (enabled until a probe says otherwise).
    ///
    /// # Errors
    /// Returns error if the connector cannot build a client.
    pub async fn register(&self, address: &str) -> Result<(), RelayError> {
        let client = self
            .connector
            .connect(address)
            .await
            .map_err(|e| RelayError::Session(format!("connect {address}: {e}")))?;
        self.insert_endpoint(address, client, true).await;
        Ok(())
    }

    /// Insert or replace an endpoint directly (embedding and tests).
    pub async fn insert_endpoint(
        &self,
        address: &str,
        client: Arc<dyn ManagerClient>,
        enabled: bool,
    ) {
        self.endpoints.write().await.insert(
            address.to_string(),
            Endpoint {
                client,
                enabled,
                manager_id: None,
            },
        );
    }

    /// Remove an endpoint from the known set.
    pub async fn remove_endpoint(&self, address: &str) {
        self.endpoints.write().await.remove(address);
    }

    /// Known endpoints and their enabled flags, in address order.
    pub async fn endpoint_states(&self) -> Vec<(String, bool)> {
        self.endpoints
            .read()
            .await
            .iter()
            .map(|(addr, ep)| (addr.clone(), ep.enabled))
            .collect()
    }

    /// Run the probe loop until cancelled.
    pub fn spawn_probe(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.probe_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => registry.probe_once().await,
                }
            }
        })
    }

    /// One probe pass: ask every known endpoint (enabled or not) for its
    /// membership view, then merge.
    pub async fn probe_once(&self) {
        let known: Vec<(String, Arc<dyn ManagerClient>)> = {
            let endpoints = self.endpoints.read().await;
            endpoints
                .iter()
                .map(|(addr, ep)| (addr.clone(), Arc::clone(&ep.client)))
                .collect()
        };

        let mut failed: HashSet<String> = HashSet::new();
        // address -> manager id learned from membership lists
        let mut live: HashMap<String, Option<String>> = HashMap::new();

        for (address, client) in known {
            match tokio::time::timeout(self.config.probe_timeout, client.list_managers()).await {
                Ok(Ok(peers)) => {
                    live.entry(address.clone()).or_insert(None);
                    for peer in peers {
                        live.entry(peer.address).or_insert(None).clone_from(&peer.id);
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(%address, error = %e, "manager probe failed");
                    failed.insert(address);
                }
                Err(_) => {
                    tracing::debug!(%address, "manager probe timed out");
                    failed.insert(address);
                }
            }
        }

        // Merge the converged view back into the endpoint map.
        let mut to_connect: Vec<(String, Option<String>)> = Vec::new();
        {
            let mut endpoints = self.endpoints.write().await;
            for (address, endpoint) in endpoints.iter_mut() {
                let alive = live.contains_key(address) && !failed.contains(address);
                if endpoint.enabled != alive {
                    tracing::info!(%address, enabled = alive, "manager endpoint state change");
                    endpoint.enabled = alive;
                }
            }
            for (address, manager_id) in &live {
                if !endpoints.contains_key(address) {
                    to_connect.push((address.clone(), manager_id.clone()));
                }
            }
        }

        for (address, manager_id) in to_connect {
            match self.connector.connect(&address).await {
                Ok(client) => {
                    tracing::info!(%address, "registering manager endpoint learned from gossip");
                    let mut endpoints = self.endpoints.write().await;
                    endpoints.insert(
                        address,
                        Endpoint {
                            client,
                            enabled: true,
                            manager_id,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(%address, error = %e, "failed to connect to gossiped manager");
                }
            }
        }
    }

    /// Deterministically select an enabled endpoint for a workload.
    ///
    /// Hashes the identifier, reduces modulo the number of *known*
    /// endpoints, then linearly probes forward past disabled ones.
    /// Returns `None` when no endpoint is enabled.
    pub async fn select(&self, workload: &str) -> Option<Arc<dyn ManagerClient>> {
        self.select_entry(workload).await.map(|(_, client)| client)
    }

    /// Like [`Self::select`], returning the chosen address.
    pub async fn select_address(&self, workload: &str) -> Option<String> {
        self.select_entry(workload).await.map(|(addr, _)| addr)
    }

    async fn select_entry(&self, workload: &str) -> Option<(String, Arc<dyn ManagerClient>)> {
        let endpoints = self.endpoints.read().await;
        if endpoints.is_empty() {
            return None;
        }
        let entries: Vec<(&String, &Endpoint)> = endpoints.iter().collect();
        let start = murmur3_32(workload.as_bytes(), 0) as usize % entries.len();
        for offset in 0..entries.len() {
            let (address, endpoint) = entries[(start + offset) % entries.len()];
            if endpoint.enabled {
                tracing::debug!(%workload, %address, manager_id = ?endpoint.manager_id, "selected manager");
                return Some(((*address).clone(), Arc::clone(&endpoint.client)));
            }
        }
        None
    }

    /// Select with retry/backoff for the transiently-empty registry (e.g.
    /// right after process start).
    ///
    /// # Errors
    /// Returns `RelayError::NoManagerAvailable` once attempts are
    /// exhausted.
    pub async fn must_select(&self, workload: &str) -> Result<Arc<dyn ManagerClient>, RelayError> {
        let mut backoff = self.config.select_initial_backoff;
        for attempt in 0..self.config.select_attempts {
            if let Some(client) = self.select(workload).await {
                return Ok(client);
            }
            tracing::debug!(%workload, attempt, "no enabled manager yet, backing off");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.select_max_backoff);
        }
        Err(RelayError::NoManagerAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_relay_core::rpc::ManagerInfo;
    use mcp_relay_core::testing::FakeManager;
    use std::sync::Mutex;

    struct FakeConnector {
        managers: Mutex<HashMap<String, Arc<FakeManager>>>,
    }

    impl FakeConnector {
        fn new() -> Self {
            Self {
                managers: Mutex::new(HashMap::new()),
            }
        }

        fn with(self, manager: Arc<FakeManager>) -> Self {
            self.managers
                .lock()
                .unwrap()
                .insert(manager.address.clone(), manager);
            self
        }
    }

    #[async_trait]
    impl ManagerConnector for FakeConnector {
        async fn connect(&self, address: &str) -> Result<Arc<dyn ManagerClient>, RpcError> {
            let manager = self
                .managers
                .lock()
                .unwrap()
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(FakeManager::new(address)))
                .clone();
            Ok(manager)
        }
    }

    fn registry() -> ManagerRegistry {
        ManagerRegistry::new(Arc::new(FakeConnector::new()), RegistryConfig::default())
    }

    async fn seed(registry: &ManagerRegistry, address: &str, enabled: bool) -> Arc<FakeManager> {
        let manager = Arc::new(FakeManager::new(address));
        registry
            .insert_endpoint(address, manager.clone(), enabled)
            .await;
        manager
    }

    #[tokio::test]
    async fn selection_is_deterministic() {
        let registry = registry();
        for address in ["mgr-a:9000", "mgr-b:9000", "mgr-c:9000"] {
            seed(&registry, address, true).await;
        }

        let first = registry.select_address("srv-v1").await.unwrap();
        for _ in 0..10 {
            assert_eq!(registry.select_address("srv-v1").await.unwrap(), first);
        }
    }

    #[tokio::test]
    async fn disabled_endpoints_are_never_selected() {
        let registry = registry();
        seed(&registry, "mgr-a:9000", true).await;
        seed(&registry, "mgr-b:9000", false).await;
        seed(&registry, "mgr-c:9000", true).await;

        for workload in ["srv-v1", "srv-v2", "weather", "calc", "files"] {
            let address = registry.select_address(workload).await.unwrap();
            assert_ne!(address, "mgr-b:9000");
        }
    }

    #[tokio::test]
    async fn no_enabled_endpoint_selects_none() {
        let registry = registry();
        seed(&registry, "mgr-a:9000", false).await;
        seed(&registry, "mgr-b:9000", false).await;
        assert!(registry.select("srv-v1").await.is_none());
    }

    #[tokio::test]
    async fn single_enabled_endpoint_wins_every_workload() {
        let registry = registry();
        seed(&registry, "mgr-a:9000", false).await;
        seed(&registry, "mgr-b:9000", true).await;
        seed(&registry, "mgr-c:9000", false).await;

        for workload in ["srv-v1", "srv-v2", "weather", "calc", "files"] {
            assert_eq!(
                registry.select_address(workload).await.unwrap(),
                "mgr-b:9000"
            );
        }
    }

    #[tokio::test]
    async fn removing_a_disabled_endpoint_keeps_routing_to_the_enabled_one() {
        let registry = registry();
        seed(&registry, "mgr-a:9000", true).await;
        seed(&registry, "mgr-b:9000", false).await;

        assert_eq!(registry.select_address("srv-v1").await.unwrap(), "mgr-a:9000");
        registry.remove_endpoint("mgr-b:9000").await;
        assert_eq!(registry.select_address("srv-v1").await.unwrap(), "mgr-a:9000");
    }

    #[tokio::test]
    async fn probe_merges_membership_and_marks_failures() {
        let a = Arc::new(FakeManager::new("mgr-a:9000"));
        a.set_peers(vec![
            ManagerInfo {
                address: "mgr-a:9000".into(),
                id: Some("a".into()),
            },
            ManagerInfo {
                address: "mgr-b:9000".into(),
                id: Some("b".into()),
            },
            ManagerInfo {
                address: "mgr-c:9000".into(),
                id: Some("c".into()),
            },
        ]);
        let b = Arc::new(FakeManager::new("mgr-b:9000"));
        b.fail_probes(true);

        let connector = FakeConnector::new().with(a.clone()).with(b.clone());
        let registry = ManagerRegistry::new(Arc::new(connector), RegistryConfig::default());
        registry.insert_endpoint("mgr-a:9000", a.clone(), true).await;
        registry.insert_endpoint("mgr-b:9000", b.clone(), true).await;

        registry.probe_once().await;

        let states: HashMap<String, bool> =
            registry.endpoint_states().await.into_iter().collect();
        // healthy responder stays enabled
        assert_eq!(states["mgr-a:9000"], true);
        // probe failure wins over membership listing
        assert_eq!(states["mgr-b:9000"], false);
        // unknown member learned from gossip is registered and enabled
        assert_eq!(states["mgr-c:9000"], true);
    }

    #[tokio::test]
    async fn endpoint_absent_from_all_healthy_views_is_disabled() {
        let a = Arc::new(FakeManager::new("mgr-a:9000"));
        a.set_peers(vec![ManagerInfo {
            address: "mgr-a:9000".into(),
            id: None,
        }]);
        let b = Arc::new(FakeManager::new("mgr-b:9000"));
        b.fail_probes(true);

        let connector = FakeConnector::new().with(a.clone()).with(b.clone());
        let registry = ManagerRegistry::new(Arc::new(connector), RegistryConfig::default());
        registry.insert_endpoint("mgr-a:9000", a, true).await;
        registry.insert_endpoint("mgr-b:9000", b, true).await;

        registry.probe_once().await;

        let states: HashMap<String, bool> =
            registry.endpoint_states().await.into_iter().collect();
        assert_eq!(states["mgr-b:9000"], false);
    }

    #[tokio::test]
    async fn must_select_retries_until_an_endpoint_appears() {
        let config = RegistryConfig {
            select_initial_backoff: Duration::from_millis(5),
            select_max_backoff: Duration::from_millis(20),
            ..RegistryConfig::default()
        };
        let registry = Arc::new(ManagerRegistry::new(
            Arc::new(FakeConnector::new()),
            config,
        ));

        let late = Arc::new(FakeManager::new("mgr-late:9000"));
        let filler = {
            let registry = Arc::clone(&registry);
            let late = late.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(15)).await;
                registry.insert_endpoint("mgr-late:9000", late, true).await;
            })
        };

        registry.must_select("srv-v1").await.unwrap();
        assert_eq!(
            registry.select_address("srv-v1").await.unwrap(),
            "mgr-late:9000"
        );
        filler.await.unwrap();
    }

    #[tokio::test]
    async fn must_select_gives_up_with_no_manager_error() {
        let config = RegistryConfig {
            select_attempts: 2,
            select_initial_backoff: Duration::from_millis(1),
            ..RegistryConfig::default()
        };
        let registry = ManagerRegistry::new(Arc::new(FakeConnector::new()), config);
        let err = registry.must_select("srv-v1").await.err().unwrap();
        assert!(matches!(err, RelayError::NoManagerAvailable));
    }
}
