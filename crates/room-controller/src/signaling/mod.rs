//! Client signaling over WebSocket.
//!
//! - [`protocol`] - wire frames, request/event payloads and server events
//! - [`session`] - per-connection request handling and room membership
//! - [`ws`] - the `/ws` endpoint: credential check, upgrade, socket pumps

pub mod protocol;
pub mod session;
pub mod ws;

use crate::actors::{ActorMetrics, RoomRegistryHandle};
use crate::auth::IdentityVerifier;
use crate::chat::ChatStore;
use crate::config::Config;
use crate::directory::CourseDirectory;

use std::sync::Arc;
use std::time::Duration;

/// Services shared by every signaling connection.
#[derive(Clone)]
pub struct SignalingState {
    pub registry: RoomRegistryHandle,
    pub directory: Arc<dyn CourseDirectory>,
    pub chat: Arc<dyn ChatStore>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub metrics: Arc<ActorMetrics>,
    /// Upper bound on handling one request.
    pub request_timeout: Duration,
    /// Messages returned with a join.
    pub chat_history_limit: usize,
}

impl SignalingState {
    /// Wire the shared services, taking limits from `config`.
    #[must_use]
    pub fn new(
        config: &Config,
        registry: RoomRegistryHandle,
        directory: Arc<dyn CourseDirectory>,
        chat: Arc<dyn ChatStore>,
        verifier: Arc<dyn IdentityVerifier>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        Self {
            registry,
            directory,
            chat,
            verifier,
            metrics,
            request_timeout: config.request_timeout,
            chat_history_limit: config.chat_history_limit,
        }
    }
}
