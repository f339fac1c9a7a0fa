//! A wired signaling stack for integration tests.
//!
//! [`TestRig`] starts a real worker pool and room registry behind mock
//! directory and chat services. [`TestClient`] drives a
//! [`SignalingSession`] with JSON frames the way the socket pump does and
//! reads back what the connection actor would have written.

use crate::mock_chat::MockChatStore;
use crate::mock_directory::MockDirectory;
use crate::token_builders::TEST_JWT_SECRET;

use axum::Router;
use common::secret::SecretString;
use common::types::{ConnectionId, ParticipantId, RoomKey};
use room_controller::actors::{ActorMetrics, ConnectionActor, RoomRegistryHandle};
use room_controller::auth::{Identity, JwtIdentityVerifier, Role};
use room_controller::media::{FatalSignal, WorkerPool, WorkerPoolConfig, WorkerSettings};
use room_controller::signaling::protocol::{ResponseFrame, ServerEvent, ServerFrame};
use room_controller::signaling::session::SignalingSession;
use room_controller::signaling::ws::signaling_router;
use room_controller::signaling::SignalingState;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long a client waits for an expected frame.
const FRAME_WAIT: Duration = Duration::from_secs(2);

/// How long a client listens before concluding nothing is coming.
const QUIET_WAIT: Duration = Duration::from_millis(100);

pub struct TestRigBuilder {
    directory: MockDirectory,
    chat: MockChatStore,
    room_capacity: usize,
    num_workers: usize,
    request_timeout: Duration,
    chat_history_limit: usize,
}

impl Default for TestRigBuilder {
    fn default() -> Self {
        Self {
            directory: MockDirectory::new(),
            chat: MockChatStore::new(),
            room_capacity: 100,
            num_workers: 2,
            request_timeout: Duration::from_secs(5),
            chat_history_limit: 50,
        }
    }
}

impl TestRigBuilder {
    pub fn directory(mut self, directory: MockDirectory) -> Self {
        self.directory = directory;
        self
    }

    pub fn chat(mut self, chat: MockChatStore) -> Self {
        self.chat = chat;
        self
    }

    pub fn room_capacity(mut self, capacity: usize) -> Self {
        self.room_capacity = capacity;
        self
    }

    pub fn num_workers(mut self, workers: usize) -> Self {
        self.num_workers = workers;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn chat_history_limit(mut self, limit: usize) -> Self {
        self.chat_history_limit = limit;
        self
    }

    /// Start the pool and registry. Must run inside a Tokio runtime.
    pub fn build(self) -> TestRig {
        let fatal = FatalSignal::new();
        let pool = WorkerPool::start(
            WorkerPoolConfig {
                num_workers: self.num_workers,
                rtc_min_port: 44000,
                rtc_max_port: 44999,
                worker: WorkerSettings {
                    listen_ip: "127.0.0.1".parse().unwrap(),
                    announced_ip: None,
                    call_timeout: Duration::from_secs(5),
                },
            },
            CancellationToken::new(),
            fatal.clone(),
        )
        .expect("worker pool failed to start");

        let metrics = ActorMetrics::new();
        let registry =
            RoomRegistryHandle::new(Arc::clone(&pool), self.room_capacity, Arc::clone(&metrics));

        let state = Arc::new(SignalingState {
            registry,
            directory: Arc::new(self.directory.clone()),
            chat: Arc::new(self.chat.clone()),
            verifier: Arc::new(JwtIdentityVerifier::new(SecretString::from(TEST_JWT_SECRET))),
            metrics: Arc::clone(&metrics),
            request_timeout: self.request_timeout,
            chat_history_limit: self.chat_history_limit,
        });

        TestRig {
            state,
            pool,
            fatal,
            directory: self.directory,
            chat: self.chat,
        }
    }
}

pub struct TestRig {
    pub state: Arc<SignalingState>,
    pub pool: Arc<WorkerPool>,
    pub fatal: FatalSignal,
    pub directory: MockDirectory,
    pub chat: MockChatStore,
}

impl TestRig {
    pub fn builder() -> TestRigBuilder {
        TestRigBuilder::default()
    }

    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.state.metrics
    }

    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.state.registry
    }

    /// The `/ws` router over this rig's state, for `oneshot` requests.
    pub fn router(&self) -> Router {
        signaling_router(Arc::clone(&self.state))
    }

    pub fn client(&self, participant: &str, role: Role) -> TestClient {
        TestClient::connect(
            &self.state,
            Identity {
                participant_id: ParticipantId::from(participant),
                display_name: participant.to_string(),
                role,
            },
        )
    }

    pub fn instructor(&self, participant: &str) -> TestClient {
        self.client(participant, Role::Instructor)
    }

    pub fn student(&self, participant: &str) -> TestClient {
        self.client(participant, Role::Participant)
    }

    /// Whether the registry currently holds a live room for `room_key`.
    pub async fn room_exists(&self, room_key: &str) -> bool {
        self.registry()
            .get(RoomKey::parse(room_key).unwrap())
            .await
            .unwrap()
            .is_some()
    }

    /// Wait for the registry to close `room_key`. Closing runs behind the
    /// leave response, so this polls. `false` if still open after `FRAME_WAIT`.
    pub async fn room_closed(&self, room_key: &str) -> bool {
        let deadline = tokio::time::Instant::now() + FRAME_WAIT;
        loop {
            if !self.room_exists(room_key).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn room_count(&self) -> usize {
        self.registry().status().await.unwrap().room_count
    }
}

/// One scripted client connection.
pub struct TestClient {
    session: SignalingSession,
    frames: mpsc::Receiver<ServerFrame>,
    events: VecDeque<ServerEvent>,
    next_id: u64,
}

impl TestClient {
    pub fn connect(state: &Arc<SignalingState>, identity: Identity) -> Self {
        let (tx, frames) = mpsc::channel(256);
        let (connection, _task) = ConnectionActor::spawn(
            ConnectionId::new(),
            identity.participant_id.clone(),
            tx,
            CancellationToken::new(),
            Arc::clone(&state.metrics),
        );
        Self {
            session: SignalingSession::new(Arc::clone(state), identity, connection),
            frames,
            events: VecDeque::new(),
            next_id: 1,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.session.connection_id()
    }

    /// Peer id other clients see for this connection.
    pub fn peer_id(&self) -> String {
        self.connection_id().to_string()
    }

    pub fn session(&self) -> &SignalingSession {
        &self.session
    }

    /// Send raw text exactly as a socket would deliver it.
    pub async fn send_text(&mut self, text: &str) {
        self.session.handle_text(text).await;
    }

    /// Send a request and wait for its response. Events that arrive first
    /// are kept for [`TestClient::next_event`].
    pub async fn request(&mut self, method: &str, data: Value) -> ResponseFrame {
        let id = self.next_id;
        self.next_id += 1;
        self.send_text(&json!({"id": id, "method": method, "data": data}).to_string())
            .await;
        loop {
            match self.recv().await {
                ServerFrame::Response(r) if r.id == id => return r,
                ServerFrame::Response(r) => panic!("unexpected response {r:?} while waiting for {id}"),
                ServerFrame::Event(e) => self.events.push_back(e),
            }
        }
    }

    /// Send a fire-and-forget event (no id).
    pub async fn emit(&mut self, method: &str, data: Value) {
        self.send_text(&json!({"method": method, "data": data}).to_string())
            .await;
    }

    pub async fn join(&mut self, room_key: &str) -> ResponseFrame {
        self.request("join", json!({"roomKey": room_key})).await
    }

    pub async fn leave(&mut self, room_key: &str) -> ResponseFrame {
        self.request("leave", json!({"roomKey": room_key})).await
    }

    /// Create and connect a transport, returning its id.
    pub async fn open_transport(&mut self, room_key: &str, direction: &str) -> String {
        let created = self
            .request(
                "createTransport",
                json!({"roomKey": room_key, "direction": direction}),
            )
            .await
            .assert_ok();
        let transport_id = created["transportId"].as_str().unwrap().to_string();
        self.request(
            "connectTransport",
            json!({
                "transportId": transport_id,
                "dtlsParams": {
                    "role": "client",
                    "fingerprints": [{"algorithm": "sha-256", "value": "AA:BB:CC"}]
                }
            }),
        )
        .await
        .assert_ok();
        transport_id
    }

    /// Produce Opus audio on a connected send transport, returning the producer id.
    pub async fn produce_audio(&mut self, transport_id: &str) -> String {
        let produced = self
            .request(
                "produce",
                json!({
                    "transportId": transport_id,
                    "kind": "audio",
                    "rtpParams": {
                        "codecs": [{
                            "mimeType": "audio/opus",
                            "payloadType": 111,
                            "clockRate": 48000,
                            "channels": 2
                        }],
                        "encodings": [{"ssrc": 1111}]
                    }
                }),
            )
            .await
            .assert_ok();
        produced["producerId"].as_str().unwrap().to_string()
    }

    /// Consume `producer_id` with the capabilities the room advertised.
    pub async fn consume(
        &mut self,
        transport_id: &str,
        producer_id: &str,
        capabilities: &Value,
    ) -> ResponseFrame {
        self.request(
            "consume",
            json!({
                "transportId": transport_id,
                "producerId": producer_id,
                "rtpCapabilities": capabilities
            }),
        )
        .await
    }

    /// Next event, waiting briefly for one to arrive.
    pub async fn next_event(&mut self) -> ServerEvent {
        if let Some(event) = self.events.pop_front() {
            return event;
        }
        loop {
            match self.recv().await {
                ServerFrame::Event(e) => return e,
                ServerFrame::Response(r) => panic!("unexpected response {r:?} while waiting for an event"),
            }
        }
    }

    /// Skip events until one named `name` arrives.
    pub async fn event_named(&mut self, name: &str) -> ServerEvent {
        loop {
            let event = self.next_event().await;
            if event.name() == name {
                return event;
            }
        }
    }

    /// Every event delivered so far, without waiting for more.
    pub async fn drain_events(&mut self) -> Vec<ServerEvent> {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let mut events: Vec<ServerEvent> = self.events.drain(..).collect();
        while let Ok(frame) = self.frames.try_recv() {
            if let ServerFrame::Event(e) = frame {
                events.push(e);
            }
        }
        events
    }

    /// Assert nothing arrives for a short while.
    pub async fn assert_quiet(&mut self) {
        assert!(self.events.is_empty(), "buffered events: {:?}", self.events);
        if let Ok(frame) = tokio::time::timeout(QUIET_WAIT, self.frames.recv()).await {
            panic!("expected no frames, got {frame:?}");
        }
    }

    /// Drop the connection: leaves every joined room.
    pub async fn close(self) {
        self.session.close().await;
    }

    async fn recv(&mut self) -> ServerFrame {
        tokio::time::timeout(FRAME_WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
    }
}

/// Assertions on response frames.
pub trait ResponseExt {
    /// Assert success and return the payload.
    fn assert_ok(self) -> Value;

    /// Assert failure with the given wire code.
    fn assert_code(&self, code: &str);
}

impl ResponseExt for ResponseFrame {
    fn assert_ok(self) -> Value {
        assert!(
            self.error.is_none(),
            "expected success, got {:?} ({:?})",
            self.code,
            self.error
        );
        self.data.expect("success without data")
    }

    fn assert_code(&self, code: &str) {
        assert_eq!(self.code, Some(code), "response: {self:?}");
    }
}
