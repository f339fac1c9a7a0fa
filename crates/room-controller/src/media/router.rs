//! Router handle: one room's capability context on a worker.

use super::rtp::{
    router_capabilities, ConsumerId, DtlsParameters, MediaKind, ProducerId, RouterId,
    RtpCapabilities, RtpParameters, TransportId,
};
use super::worker::{ConsumerCreated, TransportCreated, WorkerHandle, WorkerMessage};
use crate::errors::RcError;

use common::types::RoomKey;
use std::sync::Arc;

/// Handle to a router. Cheap to clone; every operation is routed to the
/// owning worker.
#[derive(Clone, Debug)]
pub struct RouterHandle {
    id: RouterId,
    room_key: RoomKey,
    worker: WorkerHandle,
    capabilities: Arc<RtpCapabilities>,
}

impl RouterHandle {
    pub(super) fn new(id: RouterId, room_key: RoomKey, worker: WorkerHandle) -> Self {
        Self {
            id,
            room_key,
            worker,
            capabilities: Arc::new(router_capabilities()),
        }
    }

    #[must_use]
    pub fn id(&self) -> RouterId {
        self.id
    }

    #[must_use]
    pub fn room_key(&self) -> &RoomKey {
        &self.room_key
    }

    #[must_use]
    pub fn worker_id(&self) -> usize {
        self.worker.id()
    }

    /// Codecs and header extensions this room accepts.
    #[must_use]
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.capabilities
    }

    /// Whether a subscriber with `rtp_capabilities` can receive `producer_id`.
    pub async fn can_consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, RcError> {
        let router_id = self.id;
        let rtp_capabilities = rtp_capabilities.clone();
        self.worker
            .call("can_consume", |respond_to| WorkerMessage::CanConsume {
                router_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            })
            .await
    }

    pub async fn create_webrtc_transport(&self) -> Result<TransportCreated, RcError> {
        let router_id = self.id;
        self.worker
            .call("create_transport", |respond_to| {
                WorkerMessage::CreateWebRtcTransport {
                    router_id,
                    respond_to,
                }
            })
            .await?
    }

    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RcError> {
        self.worker
            .call("connect_transport", |respond_to| {
                WorkerMessage::ConnectTransport {
                    transport_id,
                    dtls_parameters,
                    respond_to,
                }
            })
            .await?
    }

    pub async fn close_transport(&self, transport_id: TransportId) -> Result<(), RcError> {
        self.worker
            .call("close_transport", |respond_to| WorkerMessage::CloseTransport {
                transport_id,
                respond_to,
            })
            .await
    }

    pub async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, RcError> {
        self.worker
            .call("produce", |respond_to| WorkerMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            })
            .await?
    }

    /// Close a producer. Returns the consumers that were closed with it.
    pub async fn close_producer(&self, producer_id: ProducerId) -> Result<Vec<ConsumerId>, RcError> {
        self.worker
            .call("close_producer", |respond_to| WorkerMessage::CloseProducer {
                producer_id,
                respond_to,
            })
            .await
    }

    pub async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerCreated, RcError> {
        self.worker
            .call("consume", |respond_to| WorkerMessage::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            })
            .await?
    }

    pub async fn close_consumer(&self, consumer_id: ConsumerId) -> Result<(), RcError> {
        self.worker
            .call("close_consumer", |respond_to| WorkerMessage::CloseConsumer {
                consumer_id,
                respond_to,
            })
            .await
    }

    /// Close the router and everything created through it. Idempotent.
    pub async fn close(&self) -> Result<(), RcError> {
        let router_id = self.id;
        self.worker
            .call("close_router", |respond_to| WorkerMessage::CloseRouter {
                router_id,
                respond_to,
            })
            .await
    }
}
