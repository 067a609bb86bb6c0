//! Data model: local mirror records for remote state, the normalized
//! protocol message, and the session aggregate loaded from the durable
//! store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RelayError;

/// Local session identifier.
pub type SessionId = Uuid;

/// Server-variant identifier (the routing workload key owner).
pub type VariantId = Uuid;

/// Deployment identifier.
pub type DeploymentId = Uuid;

/// Server-version identifier.
pub type VersionId = Uuid;

/// Manager-chosen remote session identifier.
pub type RemoteSessionId = String;

/// Manager-chosen remote run identifier.
pub type RunId = String;

/// How the deployed server is launched on a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A container image run by the manager.
    ContainerImage,
    /// An already-running server reached over a URL.
    RemoteUrl,
    /// A managed-runtime reference hosted by the platform.
    ManagedRuntime,
}

/// Launch descriptor handed to a manager's `create_session`/`discover_server`
/// RPCs. Exactly one source applies per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum LaunchDescriptor {
    ContainerImage {
        image: String,
        config: Option<String>,
    },
    RemoteUrl {
        url: String,
        config: Option<String>,
    },
    ManagedRuntime {
        runtime_ref: String,
        config: Option<String>,
    },
}

impl LaunchDescriptor {
    /// Build a descriptor from a deployment and its revealed configuration.
    ///
    /// # Errors
    /// Returns an error unless exactly one source field is set on the
    /// deployment.
    pub fn from_deployment(
        deployment: &Deployment,
        config: Option<String>,
    ) -> Result<Self, RelayError> {
        let sources = usize::from(deployment.container_image.is_some())
            + usize::from(deployment.remote_url.is_some())
            + usize::from(deployment.managed_runtime.is_some());
        if sources != 1 {
            return Err(RelayError::InvalidLaunchSource(format!(
                "deployment {} has {sources} launch sources, expected exactly one",
                deployment.id
            )));
        }

        if let Some(image) = &deployment.container_image {
            Ok(Self::ContainerImage {
                image: image.clone(),
                config,
            })
        } else if let Some(url) = &deployment.remote_url {
            Ok(Self::RemoteUrl {
                url: url.clone(),
                config,
            })
        } else if let Some(runtime_ref) = &deployment.managed_runtime {
            Ok(Self::ManagedRuntime {
                runtime_ref: runtime_ref.clone(),
                config,
            })
        } else {
            unreachable!("source count checked above")
        }
    }

    /// The source kind of this descriptor.
    #[must_use]
    pub const fn kind(&self) -> SourceKind {
        match self {
            Self::ContainerImage { .. } => SourceKind::ContainerImage,
            Self::RemoteUrl { .. } => SourceKind::RemoteUrl,
            Self::ManagedRuntime { .. } => SourceKind::ManagedRuntime,
        }
    }
}

/// Local mirror of a manager-side remote session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSessionRecord {
    /// Manager-chosen remote session id.
    pub id: RemoteSessionId,
    /// The local session this remote context backs.
    pub session_id: SessionId,
    /// Launch source kind.
    pub kind: SourceKind,
    /// Last reconciliation watermark.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// The remote session has been observed ended.
    pub has_ended: bool,
    /// Retired: ended plus one final sync pass has run.
    pub is_finalized: bool,
}

/// State of one execution attempt within a remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Active,
    Completed,
    Failed,
}

/// Local mirror of one remote run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRunRecord {
    /// Manager-chosen run id.
    pub id: RunId,
    /// Remote session this run belongs to.
    pub remote_session_id: RemoteSessionId,
    /// Local session owning the remote session.
    pub session_id: SessionId,
    /// Launch source kind, copied from the parent session.
    pub kind: SourceKind,
    pub state: RunState,
    pub has_ended: bool,
    pub is_finalized: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// The logical sender of a protocol message, for unified-id purposes.
///
/// The scope must be stable across a run/session and distinguishable
/// between concurrent runs (server role) or concurrent consumers
/// (client role).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub role: ParticipantRole,
    pub scope_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Client,
    Server,
}

impl Participant {
    #[must_use]
    pub fn client(scope_id: impl Into<String>) -> Self {
        Self {
            role: ParticipantRole::Client,
            scope_id: scope_id.into(),
        }
    }

    #[must_use]
    pub fn server(scope_id: impl Into<String>) -> Self {
        Self {
            role: ParticipantRole::Server,
            scope_id: scope_id.into(),
        }
    }
}

/// Message kind, decoded from the manager's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Error,
    Unknown,
}

impl MessageKind {
    /// Map a manager wire code onto the closed kind set.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Request,
            1 => Self::Response,
            2 => Self::Notification,
            3 => Self::Error,
            _ => Self::Unknown,
        }
    }

    /// The wire code for this kind. `Unknown` has no stable code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
            Self::Notification => 2,
            Self::Error => 3,
            Self::Unknown => u8::MAX,
        }
    }
}

/// Normalized protocol message, persisted at-most-once per `uuid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub uuid: Uuid,
    pub kind: MessageKind,
    pub method: Option<String>,
    pub payload: Value,
    pub sender: Participant,
    /// The id chosen by the original sender, if the message carries one.
    pub original_id: Option<Value>,
    /// Session-unique id assigned by the translator.
    pub unified_id: Option<String>,
}

/// A local session row, as loaded from the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSession {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
}

/// A deployment of a server variant. At most one launch-source field is
/// expected to be set; `LaunchDescriptor::from_deployment` enforces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub container_image: Option<String>,
    pub remote_url: Option<String>,
    pub managed_runtime: Option<String>,
    /// Reference to the encrypted configuration secret, if any.
    pub config_secret_ref: Option<String>,
}

/// A server variant: the stable routing workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerVariant {
    pub id: VariantId,
    /// Stable workload identifier used for manager routing.
    pub identifier: String,
    /// When capability discovery last succeeded for this variant.
    pub last_discovered_at: Option<DateTime<Utc>>,
}

/// A concrete version of a server variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerVersion {
    pub id: VersionId,
    pub variant_id: VariantId,
    pub created_at: DateTime<Utc>,
}

/// The full local aggregate behind one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session: LocalSession,
    pub deployment: Deployment,
    pub variant: ServerVariant,
    /// Sessions without a current version cannot be started.
    pub current_version: Option<ServerVersion>,
}

/// Schema and capability metadata learned by introspecting a server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveredCapabilities {
    pub tools: Vec<Value>,
    pub prompts: Vec<Value>,
    pub resource_templates: Vec<Value>,
    pub capabilities: Value,
}

/// Outcome of one discovery attempt, recorded for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryOutcome {
    pub variant_id: VariantId,
    pub succeeded: bool,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(
        image: Option<&str>,
        url: Option<&str>,
        runtime: Option<&str>,
    ) -> Deployment {
        Deployment {
            id: Uuid::new_v4(),
            container_image: image.map(str::to_string),
            remote_url: url.map(str::to_string),
            managed_runtime: runtime.map(str::to_string),
            config_secret_ref: None,
        }
    }

    #[test]
    fn launch_descriptor_requires_exactly_one_source() {
        let none = deployment(None, None, None);
        assert!(LaunchDescriptor::from_deployment(&none, None).is_err());

        let two = deployment(Some("img"), Some("http://x"), None);
        assert!(LaunchDescriptor::from_deployment(&two, None).is_err());

        let image = deployment(Some("registry/img:1"), None, None);
        let descriptor = LaunchDescriptor::from_deployment(&image, Some("cfg".into())).unwrap();
        assert_eq!(descriptor.kind(), SourceKind::ContainerImage);

        let url = deployment(None, Some("https://srv.example"), None);
        let descriptor = LaunchDescriptor::from_deployment(&url, None).unwrap();
        assert_eq!(descriptor.kind(), SourceKind::RemoteUrl);
    }

    #[test]
    fn message_kind_codes_map_onto_closed_set() {
        assert_eq!(MessageKind::from_code(0), MessageKind::Request);
        assert_eq!(MessageKind::from_code(1), MessageKind::Response);
        assert_eq!(MessageKind::from_code(2), MessageKind::Notification);
        assert_eq!(MessageKind::from_code(3), MessageKind::Error);
        assert_eq!(MessageKind::from_code(200), MessageKind::Unknown);
    }
}
