//! Per-run reconciliation worker.
//!
//! Pulls protocol messages and run-level events produced since the last
//! watermark (re-queried from slightly before it to tolerate clock skew)
//! and persists them idempotently, then advances the mirror. Once every
//! run of a session has ended, the owning session and its open connection
//! records are marked ended.

use chrono::Utc;
use serde_json::json;

use mcp_relay_core::RelayError;
use mcp_relay_core::model::{MessageKind, Participant, ProtocolMessage};
use mcp_relay_core::rpc::{RunEventKind, TimeWindow};
use mcp_relay_session::MessageTranslator;

use crate::scheduler::{SyncConfig, SyncDeps};

/// Reconcile one remote-run mirror.
///
/// # Errors
/// Returns storage failures, routing exhaustion, and RPC failures.
pub async fn sync_run(
    deps: &SyncDeps,
    config: &SyncConfig,
    run_id: &str,
) -> Result<(), RelayError> {
    let Some(mut record) = deps.store.get_run(run_id).await? else {
        tracing::debug!(%run_id, "no mirror for sync job, skipping");
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
    let status = client.get_run(run_id).await.map_err(RelayError::from)?;

    let overlap = chrono::Duration::from_std(config.overlap).unwrap_or_default();
    let since = record.last_sync_at.map(|at| at - overlap);
    let translator = MessageTranslator::new();
    let sender = Participant::server(run_id);

    let mut persisted = 0u64;
    let mut cursor = None;
    loop {
        let page = client
            .list_run_messages(
                run_id,
                TimeWindow {
                    since,
                    cursor,
                    limit: Some(config.batch_size),
                },
            )
            .await
            .map_err(RelayError::from)?;
        for wire in &page.items {
            let message = translator.decode(wire, sender.clone());
            if deps.store.insert_message(record.session_id, &message).await? {
                persisted += 1;
            }
        }
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }

    let mut cursor = None;
    loop {
        let page = client
            .list_run_events(
                run_id,
                TimeWindow {
                    since,
                    cursor,
                    limit: Some(config.batch_size),
                },
            )
            .await
            .map_err(RelayError::from)?;
        for event in page.items {
            match event.kind {
                RunEventKind::Error => {
                    let message = ProtocolMessage {
                        uuid: event.uuid,
                        kind: MessageKind::Error,
                        method: None,
                        payload: json!({ "message": event.message, "at": event.at }),
                        sender: sender.clone(),
                        original_id: None,
                        unified_id: None,
                    };
                    if deps.store.insert_message(record.session_id, &message).await? {
                        persisted += 1;
                    }
                }
                RunEventKind::Log => {
                    tracing::debug!(%run_id, output = %event.message, "remote run log");
                }
            }
        }
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }

    record.state = status.state;
    record.has_ended = record.has_ended || status.ended;
    record.is_finalized = previously_ended && record.has_ended;
    record.last_sync_at = Some(Utc::now());
    deps.store.update_run(&record).await?;
    tracing::debug!(%run_id, persisted, state = ?record.state, "run reconciled");

    // Every run of the session has ended: retire the session and any open
    // connection records.
    if record.has_ended {
        let runs = deps.store.list_runs_for_session(record.session_id).await?;
        if runs.iter().all(|r| r.has_ended) {
            deps.store.mark_session_ended(record.session_id).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{run_record, Fixture};
    use mcp_relay_core::RelayStore;
    use mcp_relay_core::model::RunState;
    use mcp_relay_core::rpc::{RemoteRunStatus, RunEvent, WireMessage};
    use serde_json::json;
    use uuid::Uuid;

    fn wire(id: u64) -> WireMessage {
        WireMessage {
            uuid: Some(Uuid::now_v7()),
            kind_code: 1,
            method: None,
            id: Some(json!(id)),
            payload: json!({"result": id}),
            run_id: Some("run-1".to_string()),
        }
    }

    #[tokio::test]
    async fn repeated_syncs_persist_no_duplicates() {
        let fx = Fixture::new().await;
        fx.store
            .insert_run(&run_record("run-1", fx.session_id, RunState::Active))
            .await
            .unwrap();
        fx.manager.put_run(RemoteRunStatus {
            id: "run-1".to_string(),
            state: RunState::Active,
            ended: false,
        });
        fx.manager
            .put_run_messages("run-1", vec![wire(1), wire(2)]);

        let deps = fx.deps();
        sync_run(&deps, &fx.config, "run-1").await.unwrap();
        sync_run(&deps, &fx.config, "run-1").await.unwrap();

        assert_eq!(fx.store.message_count(fx.session_id).await.unwrap(), 2);
        let record = fx.store.get_run("run-1").await.unwrap().unwrap();
        assert!(!record.has_ended);
        assert!(!record.is_finalized);
    }

    #[tokio::test]
    async fn second_pass_requeries_from_before_the_watermark() {
        let fx = Fixture::new().await;
        fx.store
            .insert_run(&run_record("run-1", fx.session_id, RunState::Active))
            .await
            .unwrap();
        fx.manager.put_run(RemoteRunStatus {
            id: "run-1".to_string(),
            state: RunState::Active,
            ended: false,
        });

        let deps = fx.deps();
        sync_run(&deps, &fx.config, "run-1").await.unwrap();
        let watermark = fx
            .store
            .get_run("run-1")
            .await
            .unwrap()
            .unwrap()
            .last_sync_at
            .unwrap();
        sync_run(&deps, &fx.config, "run-1").await.unwrap();

        let overlap = chrono::Duration::from_std(fx.config.overlap).unwrap();
        let message_windows = fx.manager.message_windows();
        assert_eq!(message_windows[0].since, None);
        assert_eq!(message_windows[1].since, Some(watermark - overlap));
        // run-level event pulls share the same window
        let event_windows = fx.manager.event_windows();
        assert_eq!(event_windows[1].since, Some(watermark - overlap));
    }

    #[tokio::test]
    async fn finalize_lags_end_detection_by_one_pass() {
        let fx = Fixture::new().await;
        fx.store
            .insert_run(&run_record("run-1", fx.session_id, RunState::Active))
            .await
            .unwrap();
        fx.manager.put_run(RemoteRunStatus {
            id: "run-1".to_string(),
            state: RunState::Completed,
            ended: true,
        });

        let deps = fx.deps();
        sync_run(&deps, &fx.config, "run-1").await.unwrap();
        let record = fx.store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(record.state, RunState::Completed);
        assert!(record.has_ended);
        assert!(!record.is_finalized);

        sync_run(&deps, &fx.config, "run-1").await.unwrap();
        let record = fx.store.get_run("run-1").await.unwrap().unwrap();
        assert!(record.is_finalized);

        // finalized mirrors are skipped from then on
        let calls = fx.manager.list_message_calls();
        sync_run(&deps, &fx.config, "run-1").await.unwrap();
        assert_eq!(fx.manager.list_message_calls(), calls);
    }

    #[tokio::test]
    async fn error_events_are_persisted_as_error_messages() {
        let fx = Fixture::new().await;
        fx.store
            .insert_run(&run_record("run-1", fx.session_id, RunState::Active))
            .await
            .unwrap();
        fx.manager.put_run(RemoteRunStatus {
            id: "run-1".to_string(),
            state: RunState::Failed,
            ended: true,
        });
        let event_uuid = Uuid::now_v7();
        fx.manager.put_run_events(
            "run-1",
            vec![
                RunEvent {
                    uuid: event_uuid,
                    run_id: "run-1".to_string(),
                    kind: RunEventKind::Error,
                    message: "container exited 137".to_string(),
                    at: Utc::now(),
                },
                RunEvent {
                    uuid: Uuid::now_v7(),
                    run_id: "run-1".to_string(),
                    kind: RunEventKind::Log,
                    message: "shutting down".to_string(),
                    at: Utc::now(),
                },
            ],
        );

        let deps = fx.deps();
        sync_run(&deps, &fx.config, "run-1").await.unwrap();
        // only the error event lands in the message log
        assert_eq!(fx.store.message_count(fx.session_id).await.unwrap(), 1);

        // replaying the same event is a no-op
        sync_run(&deps, &fx.config, "run-1").await.unwrap();
        assert_eq!(fx.store.message_count(fx.session_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn session_is_marked_ended_once_every_run_has_ended() {
        let fx = Fixture::new().await;
        fx.store
            .insert_run(&run_record("run-1", fx.session_id, RunState::Active))
            .await
            .unwrap();
        let mut second = run_record("run-2", fx.session_id, RunState::Completed);
        second.has_ended = true;
        fx.store.insert_run(&second).await.unwrap();

        fx.manager.put_run(RemoteRunStatus {
            id: "run-1".to_string(),
            state: RunState::Active,
            ended: false,
        });

        let deps = fx.deps();
        sync_run(&deps, &fx.config, "run-1").await.unwrap();
        assert!(!fx.store.is_session_ended(fx.session_id));

        fx.manager.put_run(RemoteRunStatus {
            id: "run-1".to_string(),
            state: RunState::Completed,
            ended: true,
        });
        sync_run(&deps, &fx.config, "run-1").await.unwrap();
        assert!(fx.store.is_session_ended(fx.session_id));
    }
}
