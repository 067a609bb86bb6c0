//! Manager registry and router.
//!
//! Discovers live execution managers through periodic gossip probing and
//! deterministically selects one per workload identifier.

pub mod hash;
pub mod registry;

pub use registry::{ManagerConnector, ManagerRegistry, RegistryConfig};
