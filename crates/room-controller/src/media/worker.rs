//! Media worker actor.
//!
//! A worker hosts routers and everything bound to them: transports,
//! producers and consumers. Callers hold ids plus a [`WorkerHandle`]; every
//! operation is a message round trip bounded by the worker call timeout.
//!
//! Closing is idempotent and cascades downward:
//! router -> transports -> producers/consumers, producer -> its consumers.

use super::pool::FatalSignal;
use super::ports::PortAllocator;
use super::router::RouterHandle;
use super::rtp::{
    negotiate_consumer_codec, router_capabilities, validate_producer_parameters, ConsumerId,
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    ProducerId, RouterId, RtcpParameters, RtpCapabilities, RtpEncodingParameters, RtpParameters,
    TransportId,
};
use crate::actors::metrics::{ActorType, MailboxMonitor};
use crate::errors::{NegotiationError, RcError, Resource};

use common::types::RoomKey;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the worker mailbox.
const WORKER_CHANNEL_BUFFER: usize = 1000;

const ICE_UFRAG_LEN: usize = 16;
const ICE_PWD_LEN: usize = 32;

/// Host candidate priorities (UDP preferred over TCP).
const UDP_CANDIDATE_PRIORITY: u32 = 1_076_302_079;
const TCP_CANDIDATE_PRIORITY: u32 = 1_076_276_479;

/// Per-worker network settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<IpAddr>,
    pub call_timeout: Duration,
}

/// Parameters of a freshly created WebRTC transport.
#[derive(Debug, Clone)]
pub struct TransportCreated {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone)]
pub struct ConsumerCreated {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

pub(super) enum WorkerMessage {
    /// Hold the message loop until `release` fires or is dropped.
    #[cfg(test)]
    Stall { release: oneshot::Receiver<()> },
    CreateRouter {
        room_key: RoomKey,
        respond_to: oneshot::Sender<RouterId>,
    },
    CloseRouter {
        router_id: RouterId,
        respond_to: oneshot::Sender<()>,
    },
    CreateWebRtcTransport {
        router_id: RouterId,
        respond_to: oneshot::Sender<Result<TransportCreated, RcError>>,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), RcError>>,
    },
    CloseTransport {
        transport_id: TransportId,
        respond_to: oneshot::Sender<()>,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: oneshot::Sender<Result<ProducerId, RcError>>,
    },
    /// Responds with the consumers closed along with the producer.
    CloseProducer {
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Vec<ConsumerId>>,
    },
    CanConsume {
        router_id: RouterId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<bool>,
    },
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<ConsumerCreated, RcError>>,
    },
    CloseConsumer {
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<()>,
    },
    GetStatus {
        respond_to: oneshot::Sender<WorkerStatus>,
    },
}

/// Handle to one media worker.
#[derive(Clone)]
pub struct WorkerHandle {
    id: usize,
    pid: u32,
    sender: mpsc::Sender<WorkerMessage>,
    mailbox: Arc<MailboxMonitor>,
    worker_token: CancellationToken,
    pool_token: CancellationToken,
    fatal: FatalSignal,
    call_timeout: Duration,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl WorkerHandle {
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Identifier of the process hosting this worker.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Terminate the worker. Outside pool shutdown this is a worker death.
    pub fn terminate(&self) {
        self.worker_token.cancel();
    }

    /// Hold this worker until `release` fires or is dropped.
    #[cfg(test)]
    pub(crate) async fn stall(&self, release: oneshot::Receiver<()>) {
        let _ = self
            .mailbox
            .send(&self.sender, WorkerMessage::Stall { release })
            .await;
    }

    /// Create a router (room capability context) on this worker.
    pub async fn create_router(&self, room_key: &RoomKey) -> Result<RouterHandle, RcError> {
        let room_key_owned = room_key.clone();
        let router_id = self
            .call("create_router", |respond_to| WorkerMessage::CreateRouter {
                room_key: room_key_owned,
                respond_to,
            })
            .await?;

        Ok(RouterHandle::new(router_id, room_key.clone(), self.clone()))
    }

    pub async fn status(&self) -> Result<WorkerStatus, RcError> {
        self.call("status", |respond_to| WorkerMessage::GetStatus { respond_to })
            .await
    }

    /// One request/response round trip with the worker.
    pub(super) async fn call<T>(
        &self,
        op: &'static str,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerMessage,
    ) -> Result<T, RcError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(&self.sender, build(tx))
            .await
            .map_err(|e| self.unreachable(op, &format!("channel send failed: {e}")))?;

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.unreachable(op, &format!("response receive failed: {e}"))),
            Err(_) => {
                warn!(
                    target: "rc.media.worker",
                    worker_id = self.id,
                    op,
                    timeout_ms = u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Worker call timed out"
                );
                Err(RcError::Timeout(format!("worker {op}")))
            }
        }
    }

    /// A worker that cannot be reached is dead, unless the pool is stopping.
    fn unreachable(&self, op: &'static str, detail: &str) -> RcError {
        if self.pool_token.is_cancelled() {
            return RcError::Internal(format!("media workers shutting down ({op})"));
        }
        self.fatal
            .trip(format!("worker {} unreachable during {op}", self.id));
        RcError::WorkerDied(format!("worker {} pid {}: {detail}", self.id, self.pid))
    }
}

struct RouterState {
    room_key: RoomKey,
    transports: HashSet<TransportId>,
}

struct TransportState {
    router_id: RouterId,
    port: u16,
    connected: bool,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

struct ProducerState {
    router_id: RouterId,
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumers: HashSet<ConsumerId>,
}

struct ConsumerState {
    transport_id: TransportId,
    producer_id: ProducerId,
}

/// The worker actor. Owns all media state for its routers.
pub struct WorkerActor {
    id: usize,
    receiver: mpsc::Receiver<WorkerMessage>,
    cancel_token: CancellationToken,
    settings: WorkerSettings,
    ports: Arc<PortAllocator>,
    capabilities: RtpCapabilities,
    dtls_fingerprint: String,
    next_mid: u64,
    routers: HashMap<RouterId, RouterState>,
    transports: HashMap<TransportId, TransportState>,
    producers: HashMap<ProducerId, ProducerState>,
    consumers: HashMap<ConsumerId, ConsumerState>,
    mailbox: Arc<MailboxMonitor>,
}

impl WorkerActor {
    /// Build a worker and its handle. The caller runs [`WorkerActor::run`].
    ///
    /// `worker_token` must be a child of `pool_token`.
    #[must_use]
    pub fn new(
        id: usize,
        settings: WorkerSettings,
        ports: Arc<PortAllocator>,
        worker_token: CancellationToken,
        pool_token: CancellationToken,
        fatal: FatalSignal,
    ) -> (Self, WorkerHandle) {
        let (sender, receiver) = mpsc::channel(WORKER_CHANNEL_BUFFER);
        let mailbox = MailboxMonitor::shared(ActorType::Worker, format!("worker-{id}"));

        let handle = WorkerHandle {
            id,
            pid: std::process::id(),
            sender,
            mailbox: Arc::clone(&mailbox),
            worker_token: worker_token.clone(),
            pool_token,
            fatal,
            call_timeout: settings.call_timeout,
        };

        let actor = Self {
            id,
            receiver,
            cancel_token: worker_token,
            settings,
            ports,
            capabilities: router_capabilities(),
            dtls_fingerprint: certificate_fingerprint(),
            next_mid: 0,
            routers: HashMap::new(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            mailbox,
        };

        (actor, handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "rc.media.worker", fields(worker_id = self.id))]
    pub async fn run(mut self) {
        info!(target: "rc.media.worker", worker_id = self.id, "Media worker started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "rc.media.worker", worker_id = self.id, "Media worker cancelled");
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            #[cfg(test)]
                            let message = match message {
                                WorkerMessage::Stall { release } => {
                                    let _ = release.await;
                                    continue;
                                }
                                other => other,
                            };
                            self.handle_message(message);
                        }
                        None => break,
                    }
                }
            }
        }

        for transport in self.transports.values() {
            self.ports.release(transport.port);
        }

        info!(
            target: "rc.media.worker",
            worker_id = self.id,
            routers = self.routers.len(),
            transports = self.transports.len(),
            messages_processed = self.mailbox.messages_processed(),
            "Media worker stopped"
        );
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        match message {
            #[cfg(test)]
            WorkerMessage::Stall { .. } => {}

            WorkerMessage::CreateRouter {
                room_key,
                respond_to,
            } => {
                let router_id = RouterId::new();
                debug!(
                    target: "rc.media.worker",
                    worker_id = self.id,
                    router_id = %router_id,
                    room_key = %room_key,
                    "Router created"
                );
                self.routers.insert(
                    router_id,
                    RouterState {
                        room_key,
                        transports: HashSet::new(),
                    },
                );
                let _ = respond_to.send(router_id);
            }

            WorkerMessage::CloseRouter {
                router_id,
                respond_to,
            } => {
                self.close_router(router_id);
                let _ = respond_to.send(());
            }

            WorkerMessage::CreateWebRtcTransport {
                router_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.create_transport(router_id));
            }

            WorkerMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let _ = respond_to.send(self.connect_transport(transport_id, &dtls_parameters));
            }

            WorkerMessage::CloseTransport {
                transport_id,
                respond_to,
            } => {
                self.close_transport(transport_id);
                let _ = respond_to.send(());
            }

            WorkerMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let _ = respond_to.send(self.produce(transport_id, kind, rtp_parameters));
            }

            WorkerMessage::CloseProducer {
                producer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.close_producer(producer_id));
            }

            WorkerMessage::CanConsume {
                router_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => {
                let ok = self.producers.get(&producer_id).is_some_and(|p| {
                    p.router_id == router_id
                        && negotiate_consumer_codec(&p.rtp_parameters, &rtp_capabilities).is_some()
                });
                let _ = respond_to.send(ok);
            }

            WorkerMessage::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => {
                let _ = respond_to.send(self.consume(transport_id, producer_id, &rtp_capabilities));
            }

            WorkerMessage::CloseConsumer {
                consumer_id,
                respond_to,
            } => {
                self.close_consumer(consumer_id);
                let _ = respond_to.send(());
            }

            WorkerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(WorkerStatus {
                    routers: self.routers.len(),
                    transports: self.transports.len(),
                    producers: self.producers.len(),
                    consumers: self.consumers.len(),
                });
            }
        }
    }

    fn create_transport(&mut self, router_id: RouterId) -> Result<TransportCreated, RcError> {
        let router = self
            .routers
            .get_mut(&router_id)
            .ok_or(RcError::NotFound(Resource::Room))?;

        let port = self
            .ports
            .allocate()
            .ok_or_else(|| RcError::Internal("no RTC ports available".to_string()))?;

        let id = TransportId::new();
        router.transports.insert(id);
        self.transports.insert(
            id,
            TransportState {
                router_id,
                port,
                connected: false,
                producers: HashSet::new(),
                consumers: HashSet::new(),
            },
        );

        let ip = self
            .settings
            .announced_ip
            .unwrap_or(self.settings.listen_ip)
            .to_string();

        Ok(TransportCreated {
            id,
            ice_parameters: IceParameters {
                username_fragment: random_token(ICE_UFRAG_LEN),
                password: random_token(ICE_PWD_LEN),
                ice_lite: true,
            },
            ice_candidates: vec![
                IceCandidate {
                    foundation: "udpcandidate".to_string(),
                    priority: UDP_CANDIDATE_PRIORITY,
                    ip: ip.clone(),
                    protocol: "udp".to_string(),
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: None,
                },
                IceCandidate {
                    foundation: "tcpcandidate".to_string(),
                    priority: TCP_CANDIDATE_PRIORITY,
                    ip,
                    protocol: "tcp".to_string(),
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: Some("passive".to_string()),
                },
            ],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: self.dtls_fingerprint.clone(),
                }],
            },
        })
    }

    fn connect_transport(
        &mut self,
        transport_id: TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), RcError> {
        let transport = self
            .transports
            .get_mut(&transport_id)
            .ok_or(RcError::NotFound(Resource::Transport))?;

        if transport.connected {
            return Err(NegotiationError::TransportAlreadyConnected.into());
        }
        if dtls_parameters.fingerprints.is_empty() {
            return Err(NegotiationError::InvalidParameters(
                "dtlsParams must contain at least one fingerprint".to_string(),
            )
            .into());
        }

        transport.connected = true;
        Ok(())
    }

    fn produce(
        &mut self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, RcError> {
        let transport = self
            .transports
            .get_mut(&transport_id)
            .ok_or(RcError::NotFound(Resource::Transport))?;

        if !transport.connected {
            return Err(NegotiationError::TransportNotConnected.into());
        }
        validate_producer_parameters(&self.capabilities, kind, &rtp_parameters)?;

        let id = ProducerId::new();
        transport.producers.insert(id);
        self.producers.insert(
            id,
            ProducerState {
                router_id: transport.router_id,
                transport_id,
                kind,
                rtp_parameters,
                consumers: HashSet::new(),
            },
        );
        Ok(id)
    }

    fn consume(
        &mut self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerCreated, RcError> {
        let transport = self
            .transports
            .get(&transport_id)
            .ok_or(RcError::NotFound(Resource::Transport))?;
        if !transport.connected {
            return Err(NegotiationError::TransportNotConnected.into());
        }

        let producer = self
            .producers
            .get(&producer_id)
            .filter(|p| p.router_id == transport.router_id)
            .ok_or(RcError::NotFound(Resource::Producer))?;

        let codec = negotiate_consumer_codec(&producer.rtp_parameters, rtp_capabilities)
            .ok_or(NegotiationError::IncompatibleCapabilities)?;
        let kind = producer.kind;

        self.next_mid += 1;
        let rtp_parameters = RtpParameters {
            mid: Some(self.next_mid.to_string()),
            codecs: vec![codec],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(rand::thread_rng().gen()),
                rid: None,
            }],
            rtcp: RtcpParameters {
                cname: producer.rtp_parameters.rtcp.cname.clone(),
                reduced_size: Some(true),
            },
        };

        let id = ConsumerId::new();
        self.consumers.insert(
            id,
            ConsumerState {
                transport_id,
                producer_id,
            },
        );
        if let Some(producer) = self.producers.get_mut(&producer_id) {
            producer.consumers.insert(id);
        }
        if let Some(transport) = self.transports.get_mut(&transport_id) {
            transport.consumers.insert(id);
        }

        Ok(ConsumerCreated {
            id,
            producer_id,
            kind,
            rtp_parameters,
        })
    }

    fn close_consumer(&mut self, consumer_id: ConsumerId) {
        let Some(consumer) = self.consumers.remove(&consumer_id) else {
            return;
        };
        if let Some(producer) = self.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(&consumer_id);
        }
        if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(&consumer_id);
        }
    }

    fn close_producer(&mut self, producer_id: ProducerId) -> Vec<ConsumerId> {
        let Some(producer) = self.producers.remove(&producer_id) else {
            return Vec::new();
        };
        if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(&producer_id);
        }

        let closed: Vec<ConsumerId> = producer.consumers.into_iter().collect();
        for consumer_id in &closed {
            self.close_consumer(*consumer_id);
        }
        closed
    }

    fn close_transport(&mut self, transport_id: TransportId) {
        let Some(transport) = self.transports.remove(&transport_id) else {
            return;
        };
        for consumer_id in transport.consumers {
            self.close_consumer(consumer_id);
        }
        for producer_id in transport.producers {
            self.close_producer(producer_id);
        }
        if let Some(router) = self.routers.get_mut(&transport.router_id) {
            router.transports.remove(&transport_id);
        }
        self.ports.release(transport.port);
    }

    fn close_router(&mut self, router_id: RouterId) {
        let Some(router) = self.routers.remove(&router_id) else {
            return;
        };
        let transport_count = router.transports.len();
        for transport_id in router.transports {
            self.close_transport(transport_id);
        }
        debug!(
            target: "rc.media.worker",
            worker_id = self.id,
            router_id = %router_id,
            room_key = %router.room_key,
            transports_closed = transport_count,
            "Router closed"
        );
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// SHA-256 fingerprint of a per-worker certificate, colon-separated hex.
fn certificate_fingerprint() -> String {
    let mut certificate = [0u8; 64];
    rand::thread_rng().fill(&mut certificate);
    let digest = ring::digest::digest(&ring::digest::SHA256, &certificate);
    digest
        .as_ref()
        .iter()
        .map(|byte| hex::encode_upper([*byte]))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::media::rtp::RtpCodecParameters;
    use std::collections::BTreeMap;

    struct Fixture {
        handle: WorkerHandle,
        ports: Arc<PortAllocator>,
        fatal: FatalSignal,
        pool_token: CancellationToken,
    }

    fn spawn_worker(min_port: u16, max_port: u16) -> Fixture {
        let pool_token = CancellationToken::new();
        let ports = Arc::new(PortAllocator::new(min_port, max_port));
        let fatal = FatalSignal::new();
        let (actor, handle) = WorkerActor::new(
            0,
            WorkerSettings {
                listen_ip: "0.0.0.0".parse().unwrap(),
                announced_ip: Some("203.0.113.10".parse().unwrap()),
                call_timeout: Duration::from_secs(5),
            },
            Arc::clone(&ports),
            pool_token.child_token(),
            pool_token.clone(),
            fatal.clone(),
        );
        tokio::spawn(actor.run());
        Fixture {
            handle,
            ports,
            fatal,
            pool_token,
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    fn opus() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: BTreeMap::new(),
                rtcp_feedback: vec![],
            }],
            ..RtpParameters::default()
        }
    }

    fn room() -> RoomKey {
        RoomKey::parse("R1").unwrap()
    }

    #[tokio::test]
    async fn test_transport_parameters() {
        let fx = spawn_worker(40000, 40010);
        let router = fx.handle.create_router(&room()).await.unwrap();

        let transport = router.create_webrtc_transport().await.unwrap();

        assert_eq!(transport.ice_parameters.username_fragment.len(), ICE_UFRAG_LEN);
        assert_eq!(transport.ice_parameters.password.len(), ICE_PWD_LEN);
        assert_eq!(transport.ice_candidates.len(), 2);
        assert_eq!(transport.ice_candidates[0].protocol, "udp");
        assert_eq!(transport.ice_candidates[0].ip, "203.0.113.10");
        assert_eq!(transport.ice_candidates[1].tcp_type.as_deref(), Some("passive"));
        assert_eq!(transport.ice_candidates[0].port, 40000);

        let fingerprint = &transport.dtls_parameters.fingerprints[0];
        assert_eq!(fingerprint.algorithm, "sha-256");
        // 32 bytes -> 32 hex pairs and 31 separators
        assert_eq!(fingerprint.value.len(), 95);

        fx.pool_token.cancel();
    }

    #[tokio::test]
    async fn test_connect_is_accepted_once() {
        let fx = spawn_worker(40000, 40010);
        let router = fx.handle.create_router(&room()).await.unwrap();
        let transport = router.create_webrtc_transport().await.unwrap();

        router.connect_transport(transport.id, dtls()).await.unwrap();
        let err = router
            .connect_transport(transport.id, dtls())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RcError::Negotiation(NegotiationError::TransportAlreadyConnected)
        ));
        fx.pool_token.cancel();
    }

    #[tokio::test]
    async fn test_produce_requires_connected_transport() {
        let fx = spawn_worker(40000, 40010);
        let router = fx.handle.create_router(&room()).await.unwrap();
        let transport = router.create_webrtc_transport().await.unwrap();

        let err = router
            .produce(transport.id, MediaKind::Audio, opus())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RcError::Negotiation(NegotiationError::TransportNotConnected)
        ));

        router.connect_transport(transport.id, dtls()).await.unwrap();
        assert!(router
            .produce(transport.id, MediaKind::Audio, opus())
            .await
            .is_ok());
        fx.pool_token.cancel();
    }

    #[tokio::test]
    async fn test_consume_and_producer_close_cascade() {
        let fx = spawn_worker(40000, 40010);
        let router = fx.handle.create_router(&room()).await.unwrap();

        let send = router.create_webrtc_transport().await.unwrap();
        router.connect_transport(send.id, dtls()).await.unwrap();
        let producer_id = router
            .produce(send.id, MediaKind::Audio, opus())
            .await
            .unwrap();

        let recv = router.create_webrtc_transport().await.unwrap();
        router.connect_transport(recv.id, dtls()).await.unwrap();
        let caps = router.rtp_capabilities().clone();

        assert!(router.can_consume(producer_id, &caps).await.unwrap());
        let consumer = router.consume(recv.id, producer_id, caps).await.unwrap();
        assert_eq!(consumer.kind, MediaKind::Audio);
        assert_eq!(consumer.producer_id, producer_id);
        assert_eq!(consumer.rtp_parameters.codecs[0].payload_type, 100);

        let closed = router.close_producer(producer_id).await.unwrap();
        assert_eq!(closed, vec![consumer.id]);

        let status = fx.handle.status().await.unwrap();
        assert_eq!(status.producers, 0);
        assert_eq!(status.consumers, 0);
        fx.pool_token.cancel();
    }

    #[tokio::test]
    async fn test_consume_with_incompatible_capabilities() {
        let fx = spawn_worker(40000, 40010);
        let router = fx.handle.create_router(&room()).await.unwrap();

        let send = router.create_webrtc_transport().await.unwrap();
        router.connect_transport(send.id, dtls()).await.unwrap();
        let producer_id = router
            .produce(send.id, MediaKind::Audio, opus())
            .await
            .unwrap();
        let recv = router.create_webrtc_transport().await.unwrap();
        router.connect_transport(recv.id, dtls()).await.unwrap();

        let video_only = RtpCapabilities {
            codecs: router
                .rtp_capabilities()
                .codecs
                .iter()
                .filter(|c| c.kind == MediaKind::Video)
                .cloned()
                .collect(),
            header_extensions: vec![],
        };

        assert!(!router.can_consume(producer_id, &video_only).await.unwrap());
        let err = router
            .consume(recv.id, producer_id, video_only)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RcError::Negotiation(NegotiationError::IncompatibleCapabilities)
        ));
        assert_eq!(fx.handle.status().await.unwrap().consumers, 0);
        fx.pool_token.cancel();
    }

    #[tokio::test]
    async fn test_router_close_releases_everything() {
        let fx = spawn_worker(40000, 40010);
        let router = fx.handle.create_router(&room()).await.unwrap();
        let t1 = router.create_webrtc_transport().await.unwrap();
        let _t2 = router.create_webrtc_transport().await.unwrap();
        router.connect_transport(t1.id, dtls()).await.unwrap();
        router
            .produce(t1.id, MediaKind::Audio, opus())
            .await
            .unwrap();
        assert_eq!(fx.ports.in_use(), 2);

        router.close().await.unwrap();
        // Idempotent
        router.close().await.unwrap();

        assert_eq!(fx.handle.status().await.unwrap(), WorkerStatus::default());
        assert_eq!(fx.ports.in_use(), 0);
        fx.pool_token.cancel();
    }

    #[tokio::test]
    async fn test_port_exhaustion_is_internal_error() {
        let fx = spawn_worker(40000, 40000);
        let router = fx.handle.create_router(&room()).await.unwrap();

        router.create_webrtc_transport().await.unwrap();
        let err = router.create_webrtc_transport().await.unwrap_err();
        assert!(matches!(err, RcError::Internal(_)));
        fx.pool_token.cancel();
    }

    #[tokio::test]
    async fn test_call_after_termination_trips_fatal() {
        let fx = spawn_worker(40000, 40010);
        fx.handle.terminate();

        // Wait for the actor to drop its receiver
        while fx.handle.is_alive() {
            tokio::task::yield_now().await;
        }

        let err = fx.handle.create_router(&room()).await.unwrap_err();
        assert!(matches!(err, RcError::WorkerDied(_)));
        assert!(fx.fatal.is_tripped());
    }

    #[tokio::test]
    async fn test_call_during_pool_shutdown_is_not_fatal() {
        let fx = spawn_worker(40000, 40010);
        fx.pool_token.cancel();

        while fx.handle.is_alive() {
            tokio::task::yield_now().await;
        }

        let err = fx.handle.create_router(&room()).await.unwrap_err();
        assert!(matches!(err, RcError::Internal(_)));
        assert!(!fx.fatal.is_tripped());
    }
}
