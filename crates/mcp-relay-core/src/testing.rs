//! Scriptable fake execution manager for tests.
//!
//! Behavioral tests in the registry/session/sync crates drive this fake
//! instead of a real manager fleet: responses are seeded up front, calls
//! are counted, and streaming frames are pushed through channels the test
//! controls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::model::{DiscoveredCapabilities, LaunchDescriptor, SessionId};
use crate::rpc::{
    FrameStream, ManagerClient, ManagerInfo, MessageFilter, OutboundStream, Page,
    RemoteRunStatus, RemoteSessionStatus, RpcError, RunEvent, StreamFrame, TimeWindow,
    WireMessage,
};

type FrameSender = mpsc::UnboundedSender<Result<StreamFrame, RpcError>>;
type FrameReceiver = mpsc::UnboundedReceiver<Result<StreamFrame, RpcError>>;

/// A fake manager with scriptable responses and call counters.
pub struct FakeManager {
    pub address: String,
    peers: Mutex<Vec<ManagerInfo>>,
    probe_fails: AtomicBool,
    active: Mutex<Option<RemoteSessionStatus>>,
    next_session_ids: Mutex<VecDeque<String>>,
    create_calls: AtomicUsize,
    created: Mutex<Vec<(SessionId, LaunchDescriptor)>>,
    sessions: Mutex<HashMap<String, RemoteSessionStatus>>,
    missing: Mutex<HashSet<String>>,
    runs: Mutex<HashMap<String, RemoteRunStatus>>,
    run_messages: Mutex<HashMap<String, Vec<WireMessage>>>,
    run_events: Mutex<HashMap<String, Vec<RunEvent>>>,
    message_windows: Mutex<Vec<TimeWindow>>,
    event_windows: Mutex<Vec<TimeWindow>>,
    list_message_calls: AtomicUsize,
    discover_calls: AtomicUsize,
    capabilities: Mutex<DiscoveredCapabilities>,
    streams: Mutex<VecDeque<FrameReceiver>>,
    sent: Mutex<Vec<WireMessage>>,
}

impl FakeManager {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            peers: Mutex::new(Vec::new()),
            probe_fails: AtomicBool::new(false),
            active: Mutex::new(None),
            next_session_ids: Mutex::new(VecDeque::new()),
            create_calls: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            missing: Mutex::new(HashSet::new()),
            runs: Mutex::new(HashMap::new()),
            run_messages: Mutex::new(HashMap::new()),
            run_events: Mutex::new(HashMap::new()),
            message_windows: Mutex::new(Vec::new()),
            event_windows: Mutex::new(Vec::new()),
            list_message_calls: AtomicUsize::new(0),
            discover_calls: AtomicUsize::new(0),
            capabilities: Mutex::new(DiscoveredCapabilities::default()),
            streams: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_peers(&self, peers: Vec<ManagerInfo>) {
        *self.peers.lock().expect("peers lock") = peers;
    }

    pub fn fail_probes(&self, fail: bool) {
        self.probe_fails.store(fail, Ordering::SeqCst);
    }

    /// Script the `check_active_session` reply.
    pub fn set_active(&self, status: Option<RemoteSessionStatus>) {
        *self.active.lock().expect("active lock") = status;
    }

    /// Queue the next id handed out by `create_session`.
    pub fn push_session_id(&self, id: impl Into<String>) {
        self.next_session_ids
            .lock()
            .expect("ids lock")
            .push_back(id.into());
    }

    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn created(&self) -> Vec<(SessionId, LaunchDescriptor)> {
        self.created.lock().expect("created lock").clone()
    }

    /// Make every session-scoped call against this remote session id fail
    /// with `SessionNotFound`.
    pub fn mark_missing(&self, remote_session_id: impl Into<String>) {
        self.missing
            .lock()
            .expect("missing lock")
            .insert(remote_session_id.into());
    }

    pub fn put_session(&self, status: RemoteSessionStatus) {
        self.sessions
            .lock()
            .expect("sessions lock")
            .insert(status.id.clone(), status);
    }

    pub fn put_run(&self, status: RemoteRunStatus) {
        self.runs
            .lock()
            .expect("runs lock")
            .insert(status.id.clone(), status);
    }

    pub fn put_run_messages(&self, run_id: impl Into<String>, messages: Vec<WireMessage>) {
        self.run_messages
            .lock()
            .expect("run messages lock")
            .insert(run_id.into(), messages);
    }

    pub fn put_run_events(&self, run_id: impl Into<String>, events: Vec<RunEvent>) {
        self.run_events
            .lock()
            .expect("run events lock")
            .insert(run_id.into(), events);
    }

    #[must_use]
    pub fn list_message_calls(&self) -> usize {
        self.list_message_calls.load(Ordering::SeqCst)
    }

    /// Windows passed to `list_run_messages`, in call order.
    #[must_use]
    pub fn message_windows(&self) -> Vec<TimeWindow> {
        self.message_windows.lock().expect("message windows lock").clone()
    }

    /// Windows passed to `list_run_events`, in call order.
    #[must_use]
    pub fn event_windows(&self) -> Vec<TimeWindow> {
        self.event_windows.lock().expect("event windows lock").clone()
    }

    #[must_use]
    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    pub fn set_capabilities(&self, capabilities: DiscoveredCapabilities) {
        *self.capabilities.lock().expect("capabilities lock") = capabilities;
    }

    /// Queue a stream for the next streaming call; the returned sender
    /// feeds frames to the consumer.
    pub fn queue_stream(&self) -> FrameSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().expect("streams lock").push_back(rx);
        tx
    }

    /// Outbound frames collected from `send_message` calls.
    #[must_use]
    pub fn sent(&self) -> Vec<WireMessage> {
        self.sent.lock().expect("sent lock").clone()
    }

    fn is_missing(&self, remote_session_id: &str) -> bool {
        self.missing
            .lock()
            .expect("missing lock")
            .contains(remote_session_id)
    }

    fn pop_stream(&self) -> FrameStream {
        self.streams.lock().expect("streams lock").pop_front().map_or_else(
            || futures::stream::pending().boxed(),
            |rx| UnboundedReceiverStream::new(rx).boxed(),
        )
    }
}

#[async_trait]
impl ManagerClient for FakeManager {
    async fn list_managers(&self) -> Result<Vec<ManagerInfo>, RpcError> {
        if self.probe_fails.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("probe refused".to_string()));
        }
        Ok(self.peers.lock().expect("peers lock").clone())
    }

    async fn check_active_session(
        &self,
        _session_id: SessionId,
    ) -> Result<Option<RemoteSessionStatus>, RpcError> {
        Ok(self.active.lock().expect("active lock").clone())
    }

    async fn create_session(
        &self,
        session_id: SessionId,
        launch: &LaunchDescriptor,
    ) -> Result<RemoteSessionStatus, RpcError> {
        let call = self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.created
            .lock()
            .expect("created lock")
            .push((session_id, launch.clone()));
        let id = self
            .next_session_ids
            .lock()
            .expect("ids lock")
            .pop_front()
            .unwrap_or_else(|| format!("rs-{}", call + 1));
        let status = RemoteSessionStatus { id, ended: false };
        self.put_session(status.clone());
        Ok(status)
    }

    async fn get_session(
        &self,
        remote_session_id: &str,
    ) -> Result<RemoteSessionStatus, RpcError> {
        if self.is_missing(remote_session_id) {
            return Err(RpcError::SessionNotFound(remote_session_id.to_string()));
        }
        self.sessions
            .lock()
            .expect("sessions lock")
            .get(remote_session_id)
            .cloned()
            .ok_or_else(|| RpcError::SessionNotFound(remote_session_id.to_string()))
    }

    async fn stream_protocol_messages(
        &self,
        remote_session_id: &str,
        _filter: MessageFilter,
    ) -> Result<FrameStream, RpcError> {
        if self.is_missing(remote_session_id) {
            return Err(RpcError::SessionNotFound(remote_session_id.to_string()));
        }
        Ok(self.pop_stream())
    }

    async fn send_message(
        &self,
        remote_session_id: &str,
        mut outbound: OutboundStream,
    ) -> Result<FrameStream, RpcError> {
        if self.is_missing(remote_session_id) {
            return Err(RpcError::SessionNotFound(remote_session_id.to_string()));
        }
        let frames = self.pop_stream();
        let sent: Vec<WireMessage> = {
            let mut collected = Vec::new();
            // Drain whatever the caller has ready; tests use finite
            // outbound streams.
            while let Some(frame) = outbound.next().await {
                collected.push(frame);
            }
            collected
        };
        self.sent.lock().expect("sent lock").extend(sent);
        Ok(frames)
    }

    async fn get_run(&self, run_id: &str) -> Result<RemoteRunStatus, RpcError> {
        self.runs
            .lock()
            .expect("runs lock")
            .get(run_id)
            .cloned()
            .ok_or_else(|| RpcError::Transport(format!("unknown run {run_id}")))
    }

    async fn list_run_messages(
        &self,
        run_id: &str,
        window: TimeWindow,
    ) -> Result<Page<WireMessage>, RpcError> {
        self.list_message_calls.fetch_add(1, Ordering::SeqCst);
        self.message_windows
            .lock()
            .expect("message windows lock")
            .push(window);
        Ok(Page {
            items: self
                .run_messages
                .lock()
                .expect("run messages lock")
                .get(run_id)
                .cloned()
                .unwrap_or_default(),
            next_cursor: None,
        })
    }

    async fn list_run_events(
        &self,
        run_id: &str,
        window: TimeWindow,
    ) -> Result<Page<RunEvent>, RpcError> {
        self.event_windows
            .lock()
            .expect("event windows lock")
            .push(window);
        Ok(Page {
            items: self
                .run_events
                .lock()
                .expect("run events lock")
                .get(run_id)
                .cloned()
                .unwrap_or_default(),
            next_cursor: None,
        })
    }

    async fn discover_server(
        &self,
        _launch: &LaunchDescriptor,
    ) -> Result<DiscoveredCapabilities, RpcError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.capabilities.lock().expect("capabilities lock").clone())
    }
}
