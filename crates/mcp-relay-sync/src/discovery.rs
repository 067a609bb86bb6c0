//! Capability discovery worker.
//!
//! Introspects a deployed server through a manager and persists the
//! learned tool/prompt/resource-template schema onto the variant and its
//! current version. Guarded by a per-variant cool-down; a cool-down skip
//! is silent (no outcome row), every real attempt records one.

use chrono::Utc;

use mcp_relay_core::RelayError;
use mcp_relay_core::model::{DiscoveryOutcome, LaunchDescriptor, VariantId};
use mcp_relay_core::secrets::SecretUsage;

use crate::scheduler::{SyncConfig, SyncDeps};

/// Run capability discovery for one server variant.
///
/// # Errors
/// Returns storage failures, secret-reveal failures, routing exhaustion,
/// and the introspection failure itself (after recording its outcome).
pub async fn discover_variant(
    deps: &SyncDeps,
    config: &SyncConfig,
    variant_id: VariantId,
) -> Result<(), RelayError> {
    let Some(context) = deps.store.load_discovery_context(variant_id).await? else {
        tracing::debug!(%variant_id, "unknown variant for discovery job, skipping");
        return Ok(());
    };

    let cooldown = chrono::Duration::from_std(config.discovery_cooldown).unwrap_or_default();
    if let Some(at) = context.variant.last_discovered_at {
        if Utc::now() - at < cooldown {
            tracing::debug!(%variant_id, last_discovered_at = %at, "discovery cooling down");
            return Ok(());
        }
    }

    let secret = match &context.deployment.config_secret_ref {
        Some(secret_ref) => Some(
            deps.secrets
                .reveal(
                    secret_ref,
                    &SecretUsage {
                        instance: variant_id.to_string(),
                        purpose: "capability-discovery".to_string(),
                    },
                )
                .await
                .map_err(|e| RelayError::Secret(e.to_string()))?,
        ),
        None => None,
    };
    let launch = LaunchDescriptor::from_deployment(&context.deployment, secret)?;

    let client = deps
        .registry
        .select(&context.variant.identifier)
        .await
        .ok_or(RelayError::NoManagerAvailable)?;

    match client.discover_server(&launch).await {
        Ok(capabilities) => {
            let version_id = context.current_version.as_ref().map(|v| v.id);
            deps.store
                .set_variant_discovered(variant_id, version_id, Utc::now(), &capabilities)
                .await?;
            deps.store
                .record_discovery_outcome(&DiscoveryOutcome {
                    variant_id,
                    succeeded: true,
                    error: None,
                    at: Utc::now(),
                })
                .await?;
            tracing::info!(
                %variant_id,
                tools = capabilities.tools.len(),
                prompts = capabilities.prompts.len(),
                resource_templates = capabilities.resource_templates.len(),
                "capability discovery succeeded",
            );
            Ok(())
        }
        Err(e) => {
            deps.store
                .record_discovery_outcome(&DiscoveryOutcome {
                    variant_id,
                    succeeded: false,
                    error: Some(e.to_string()),
                    at: Utc::now(),
                })
                .await?;
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::Fixture;
    use mcp_relay_core::model::DiscoveredCapabilities;
    use serde_json::json;

    #[tokio::test]
    async fn discovery_persists_capabilities_and_an_outcome() {
        let fx = Fixture::new().await;
        fx.manager.set_capabilities(DiscoveredCapabilities {
            tools: vec![json!({"name": "echo"})],
            prompts: vec![],
            resource_templates: vec![],
            capabilities: json!({"streaming": true}),
        });

        discover_variant(&fx.deps(), &fx.config, fx.variant_id)
            .await
            .unwrap();

        assert_eq!(fx.manager.discover_calls(), 1);
        let stored = fx.store.capabilities_for(fx.variant_id).unwrap();
        assert_eq!(stored.tools.len(), 1);
        // the current version gets the same schema
        let versioned = fx.store.capabilities_for_version(fx.version_id).unwrap();
        assert_eq!(versioned.tools.len(), 1);
        let outcomes = fx.store.discovery_outcomes();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].succeeded);
    }

    #[tokio::test]
    async fn cooldown_skips_are_silent() {
        let fx = Fixture::new().await;

        let deps = fx.deps();
        discover_variant(&deps, &fx.config, fx.variant_id)
            .await
            .unwrap();
        // the first pass stamped last_discovered_at; the second is within
        // the cool-down window
        discover_variant(&deps, &fx.config, fx.variant_id)
            .await
            .unwrap();

        assert_eq!(fx.manager.discover_calls(), 1);
        assert_eq!(fx.store.discovery_outcomes().len(), 1);
    }

    #[tokio::test]
    async fn routing_exhaustion_fails_before_any_introspection() {
        let fx = Fixture::new().await;
        fx.managers.remove_endpoint("mgr-a:9000").await;

        let err = discover_variant(&fx.deps(), &fx.config, fx.variant_id)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoManagerAvailable));
        assert!(fx.store.discovery_outcomes().is_empty());
    }

    #[tokio::test]
    async fn unknown_variants_are_skipped() {
        let fx = Fixture::new().await;
        discover_variant(&fx.deps(), &fx.config, uuid::Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(fx.manager.discover_calls(), 0);
    }
}
