//! Connection multiplexer: one internal connection per local session,
//! shared by any number of proxy handles.
//!
//! Streaming calls open a manager-side stream and demultiplex frames
//! into protocol messages (persisted idempotently and forwarded),
//! session-lifecycle events (run tracking), delivery errors, and
//! auxiliary output. Consumers read from a bounded channel, so
//! backpressure is explicit.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
// tokio's Instant so paused-clock tests can drive the timers.
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mcp_relay_core::error::ReportContext;
use mcp_relay_core::model::{
    Participant, ProtocolMessage, RemoteRunRecord, RunId, RunState, SessionId,
};
use mcp_relay_core::queue::Job;
use mcp_relay_core::rpc::{
    FrameStream, MessageFilter, RpcError, RunEventState, SessionEvent, StreamFrame, WireMessage,
};
use mcp_relay_core::{
    DistributedLock, ErrorReporter, JobQueue, RelayError, RelayStore, SecretReveal,
};
use mcp_relay_registry::ManagerRegistry;

use crate::lifecycle::{LifecycleHooks, SessionLifecycle};
use crate::proxy::ConnectionProxy;
use crate::translate::MessageTranslator;

/// Multiplexer tuning knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How often an open stream touches the connection.
    pub touch_interval: Duration,
    /// Minimum spacing between persisted liveness stamps.
    pub liveness_interval: Duration,
    /// Idle time after which `can_close` reports true.
    pub idle_timeout: Duration,
    /// Bounded channel capacity between demux and consumer.
    pub channel_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            touch_interval: Duration::from_secs(15),
            liveness_interval: Duration::from_secs(45),
            idle_timeout: Duration::from_secs(60),
            channel_capacity: 64,
        }
    }
}

/// Collaborators shared by every connection.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub store: Arc<dyn RelayStore>,
    pub registry: Arc<ManagerRegistry>,
    pub secrets: Arc<dyn SecretReveal>,
    pub queue: Arc<dyn JobQueue>,
    pub lock: Arc<dyn DistributedLock>,
    pub hooks: Arc<dyn LifecycleHooks>,
    pub reporter: Arc<dyn ErrorReporter>,
}

/// Stream of normalized protocol messages delivered to a consumer.
pub type EventStream = BoxStream<'static, Result<ProtocolMessage, RelayError>>;

/// Factory for the outbound half of a send call. A factory (rather than
/// a stream) keeps the call retryable after a transparent recreation.
pub type OutboundFactory = Arc<dyn Fn() -> BoxStream<'static, WireMessage> + Send + Sync>;

type ReopenFn = Arc<dyn Fn() -> BoxFuture<'static, Result<FrameStream, RelayError>> + Send + Sync>;

/// Explicit, constructor-injected registry of internal connections.
pub struct ConnectionRegistry {
    deps: ConnectionDeps,
    config: ConnectionConfig,
    connections: tokio::sync::Mutex<HashMap<SessionId, Arc<InternalConnection>>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(deps: ConnectionDeps, config: ConnectionConfig) -> Self {
        Self {
            deps,
            config,
            connections: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Return a proxy onto the session's connection, constructing the
    /// internal connection (and its lifecycle manager) on first use.
    pub async fn ensure(&self, session_id: SessionId) -> ConnectionProxy {
        let mut connections = self.connections.lock().await;
        let inner = if let Some(existing) = connections.get(&session_id) {
            existing.touch();
            Arc::clone(existing)
        } else {
            let lifecycle = SessionLifecycle::new(
                session_id,
                Arc::clone(&self.deps.store),
                Arc::clone(&self.deps.registry),
                Arc::clone(&self.deps.secrets),
                Arc::clone(&self.deps.queue),
                Arc::clone(&self.deps.hooks),
            );
            let inner = InternalConnection::new(
                session_id,
                lifecycle,
                self.deps.clone(),
                self.config.clone(),
            );
            connections.insert(session_id, Arc::clone(&inner));
            inner
        };
        drop(connections);
        ConnectionProxy::attach(inner)
    }

    /// Close and drop every idle-eligible connection; returns how many
    /// were evicted. Intended to be driven periodically by the embedding
    /// application.
    pub async fn evict_idle(&self) -> usize {
        let mut connections = self.connections.lock().await;
        let before = connections.len();
        connections.retain(|session_id, connection| {
            if connection.can_close() {
                tracing::debug!(%session_id, "evicting idle connection");
                connection.close();
                false
            } else {
                true
            }
        });
        before - connections.len()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}

/// One internal connection per local session.
pub struct InternalConnection {
    session_id: SessionId,
    lifecycle: Arc<SessionLifecycle>,
    deps: ConnectionDeps,
    config: ConnectionConfig,
    translator: MessageTranslator,
    /// Shared token: cancelling it tears down every consumer's stream.
    cancel: CancellationToken,
    last_activity: StdMutex<Instant>,
    proxies: StdMutex<HashSet<Uuid>>,
    current_run: tokio::sync::Mutex<Option<RunId>>,
}

impl InternalConnection {
    fn new(
        session_id: SessionId,
        lifecycle: Arc<SessionLifecycle>,
        deps: ConnectionDeps,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            lifecycle,
            deps,
            config,
            translator: MessageTranslator::new(),
            cancel: CancellationToken::new(),
            last_activity: StdMutex::new(Instant::now()),
            proxies: StdMutex::new(HashSet::new()),
            current_run: tokio::sync::Mutex::new(None),
        })
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Reset the idle clock.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = Instant::now();
    }

    /// Idle-eligible: no registered proxies and no touch within the
    /// inactivity threshold.
    #[must_use]
    pub fn can_close(&self) -> bool {
        self.proxies.lock().expect("proxies lock").is_empty()
            && self.last_activity.lock().expect("activity lock").elapsed()
                > self.config.idle_timeout
    }

    /// Tear down the underlying manager streams for all consumers.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn shared_cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn register_proxy(&self, id: Uuid) {
        self.proxies.lock().expect("proxies lock").insert(id);
        self.touch();
    }

    pub(crate) fn unregister_proxy(&self, id: Uuid) {
        self.proxies.lock().expect("proxies lock").remove(&id);
        self.touch();
    }

    /// Open the protocol-event read stream.
    ///
    /// # Errors
    /// Fails when the remote session cannot be (re)created or the stream
    /// cannot be opened.
    pub async fn read_events(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<EventStream, RelayError> {
        self.touch();
        let this = Arc::clone(self);
        let open: ReopenFn = Arc::new(move || {
            let this = Arc::clone(&this);
            async move {
                this.lifecycle
                    .with_client(|client, remote_session_id| async move {
                        client
                            .stream_protocol_messages(&remote_session_id, MessageFilter::default())
                            .await
                    })
                    .await
            }
            .boxed()
        });
        let frames = open().await?;
        Ok(self.spawn_demux(frames, open, cancel))
    }

    /// Open the bidirectional send stream: outbound frames are
    /// normalized, persisted, and forwarded; responses come back on the
    /// returned stream.
    ///
    /// # Errors
    /// Fails when the remote session cannot be (re)created or the stream
    /// cannot be opened.
    pub async fn send_messages(
        self: &Arc<Self>,
        sender: Participant,
        outbound: OutboundFactory,
        cancel: CancellationToken,
    ) -> Result<EventStream, RelayError> {
        self.touch();
        let this = Arc::clone(self);
        let open: ReopenFn = Arc::new(move || {
            let this = Arc::clone(&this);
            let outbound = Arc::clone(&outbound);
            let sender = sender.clone();
            async move {
                let translator = this.translator;
                let store = Arc::clone(&this.deps.store);
                let reporter = Arc::clone(&this.deps.reporter);
                let session_id = this.session_id;
                this.lifecycle
                    .with_client(move |client, remote_session_id| {
                        let store = Arc::clone(&store);
                        let reporter = Arc::clone(&reporter);
                        let sender = sender.clone();
                        let wire = (outbound)()
                            .map(move |frame| {
                                let message = translator.outbound(&frame, sender.clone());
                                spawn_persist(
                                    Arc::clone(&store),
                                    Arc::clone(&reporter),
                                    session_id,
                                    message.clone(),
                                );
                                translator.encode(&message)
                            })
                            .boxed();
                        async move { client.send_message(&remote_session_id, wire).await }
                    })
                    .await
            }
            .boxed()
        });
        let frames = open().await?;
        Ok(self.spawn_demux(frames, open, cancel))
    }

    fn spawn_demux(
        self: &Arc<Self>,
        frames: FrameStream,
        reopen: ReopenFn,
        cancel: CancellationToken,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.demux_loop(frames, reopen, cancel, tx).await;
        });
        ReceiverStream::new(rx).boxed()
    }

    async fn demux_loop(
        self: Arc<Self>,
        mut frames: FrameStream,
        reopen: ReopenFn,
        cancel: CancellationToken,
        tx: mpsc::Sender<Result<ProtocolMessage, RelayError>>,
    ) {
        let mut touch_timer = tokio::time::interval(self.config.touch_interval);
        touch_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_liveness: Option<Instant> = None;
        // one reopen per observed miss, reset on progress
        let mut reopened = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.cancel.cancelled() => break,
                _ = touch_timer.tick() => {
                    self.touch();
                    let stamp_due = last_liveness
                        .is_none_or(|at| at.elapsed() >= self.config.liveness_interval);
                    if stamp_due {
                        last_liveness = Some(Instant::now());
                        if let Err(e) = self
                            .deps
                            .store
                            .record_connection_liveness(self.session_id, Utc::now())
                            .await
                        {
                            self.report(&e.into());
                        }
                    }
                }
                frame = frames.next() => match frame {
                    None => break,
                    Some(Ok(frame)) => {
                        reopened = false;
                        self.touch();
                        if !self.handle_frame(frame, &tx).await {
                            break;
                        }
                    }
                    Some(Err(RpcError::SessionNotFound(_))) if !reopened => {
                        reopened = true;
                        match reopen().await {
                            Ok(next) => frames = next,
                            Err(e) => {
                                self.fail(&tx, e).await;
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        self.fail(&tx, e.into()).await;
                        break;
                    }
                }
            }
        }
    }

    /// Returns false once the consumer is gone.
    async fn handle_frame(
        &self,
        frame: StreamFrame,
        tx: &mpsc::Sender<Result<ProtocolMessage, RelayError>>,
    ) -> bool {
        match frame {
            StreamFrame::Message(wire) => {
                let scope = match wire.run_id.clone() {
                    Some(run_id) => run_id,
                    None => self
                        .current_run
                        .lock()
                        .await
                        .clone()
                        .unwrap_or_else(|| self.session_id.to_string()),
                };
                let message = self.translator.decode(&wire, Participant::server(scope));
                // Persistence is attempted before delivery but runs
                // concurrently; failures surface via the reporter only.
                spawn_persist(
                    Arc::clone(&self.deps.store),
                    Arc::clone(&self.deps.reporter),
                    self.session_id,
                    message.clone(),
                );
                tx.send(Ok(message)).await.is_ok()
            }
            StreamFrame::SessionEvent(event) => {
                self.observe_run(&event).await;
                true
            }
            StreamFrame::DeliveryError { message } => tx
                .send(Err(RelayError::McpProcessingFailed(message)))
                .await
                .is_ok(),
            StreamFrame::Output { chunk } => {
                tracing::debug!(session_id = %self.session_id, %chunk, "auxiliary output");
                true
            }
        }
    }

    /// Track the current run id from session-lifecycle events.
    async fn observe_run(&self, event: &SessionEvent) {
        let mut current = self.current_run.lock().await;
        if current.as_deref() != Some(event.run_id.as_str()) {
            // The open stream has moved past the previous run; reconcile
            // it in the background instead of re-deriving its history.
            if let Some(previous) = current.take() {
                self.enqueue(Job::SyncRun(previous)).await;
            }
            *current = Some(event.run_id.clone());
            if let Err(e) = self.create_run_mirror(&event.run_id).await {
                self.report(&e);
            }
        }
        drop(current);

        if event.state == RunEventState::Stopped {
            self.enqueue(Job::SyncRun(event.run_id.clone())).await;
        }
    }

    /// Create the run mirror under the per-session lock; duplicate-key
    /// insert means another reader won the race, which is fine.
    async fn create_run_mirror(&self, run_id: &RunId) -> Result<(), RelayError> {
        let key = format!("run-create:{}", self.session_id);
        let _guard = self.deps.lock.acquire(&key).await?;

        if self.deps.store.get_run(run_id).await?.is_some() {
            return Ok(());
        }
        let Some(remote) = self
            .deps
            .store
            .get_remote_session_for(self.session_id)
            .await?
        else {
            // Mirror row not written yet; reconciliation catches up later.
            return Ok(());
        };
        let record = RemoteRunRecord {
            id: run_id.clone(),
            remote_session_id: remote.id,
            session_id: self.session_id,
            kind: remote.kind,
            state: RunState::Active,
            has_ended: false,
            is_finalized: false,
            last_sync_at: None,
        };
        let inserted = self.deps.store.insert_run(&record).await?;
        if inserted {
            tracing::debug!(session_id = %self.session_id, %run_id, "tracked new remote run");
        }
        Ok(())
    }

    /// Force-sync, report, and surface an unrecoverable stream failure.
    async fn fail(
        &self,
        tx: &mpsc::Sender<Result<ProtocolMessage, RelayError>>,
        error: RelayError,
    ) {
        // Keep the durable mirrors from going stale before propagating.
        self.force_sync().await;
        self.report(&error);
        let _ = tx.send(Err(error)).await;
    }

    async fn force_sync(&self) {
        if let Ok(Some(record)) = self
            .deps
            .store
            .get_remote_session_for(self.session_id)
            .await
        {
            self.enqueue(Job::SyncSession(record.id)).await;
        }
        if let Some(run_id) = self.current_run.lock().await.clone() {
            self.enqueue(Job::SyncRun(run_id)).await;
        }
    }

    async fn enqueue(&self, job: Job) {
        if let Err(e) = self.deps.queue.enqueue(job).await {
            self.report(&RelayError::Queue(e.to_string()));
        }
    }

    fn report(&self, error: &RelayError) {
        self.deps.reporter.report(
            error,
            &ReportContext {
                session_id: Some(self.session_id),
                ..ReportContext::default()
            },
        );
    }
}

fn spawn_persist(
    store: Arc<dyn RelayStore>,
    reporter: Arc<dyn ErrorReporter>,
    session_id: SessionId,
    message: ProtocolMessage,
) {
    tokio::spawn(async move {
        if let Err(e) = store.insert_message(session_id, &message).await {
            reporter.report(
                &e.into(),
                &ReportContext {
                    session_id: Some(session_id),
                    ..ReportContext::default()
                },
            );
        }
    });
}
