//! Per-session reconciliation worker.

use chrono::Utc;

use mcp_relay_core::RelayError;
use mcp_relay_core::rpc::RpcError;

use crate::scheduler::SyncDeps;

/// Refresh one remote-session mirror from its manager.
///
/// `has_ended` is sticky once observed; `is_finalized` is only set on the
/// second consecutive pass that sees the session ended, so the final run
/// events have had one full cycle to land.
///
/// # Errors
/// Returns storage failures, routing exhaustion, and RPC failures other
/// than "session not found" (which is recorded as ended).
pub async fn sync_session(deps: &SyncDeps, remote_session_id: &str) -> Result<(), RelayError> {
    let Some(mut record) = deps.store.get_remote_session(remote_session_id).await? else {
        tracing::debug!(%remote_session_id, "no mirror for sync job, skipping");
        return Ok(());
    };
    if record.is_finalized {
        return Ok(());
    }
    let Some(context) = deps.store.load_session_context(record.session_id).await? else {
        return Ok(());
    };
    let client = deps
        .registry
        .select(&context.variant.identifier)
        .await
        .ok_or(RelayError::NoManagerAvailable)?;

    let previously_ended = record.has_ended;
    match client.get_session(remote_session_id).await {
        Ok(status) => record.has_ended = record.has_ended || status.ended,
        // The manager has forgotten the session entirely; treat as ended.
        Err(RpcError::SessionNotFound(_)) => record.has_ended = true,
        Err(e) => return Err(e.into()),
    }
    record.is_finalized = previously_ended && record.has_ended;
    record.last_sync_at = Some(Utc::now());
    deps.store.upsert_remote_session(&record).await?;

    if record.is_finalized {
        tracing::info!(%remote_session_id, "remote session finalized");
    }
    Ok(())
}
