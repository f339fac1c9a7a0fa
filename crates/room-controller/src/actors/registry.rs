//! `RoomRegistryActor` - singleton owner of every live room.
//!
//! The registry:
//! - Maps room keys to `RoomActor`s, creating each room (and its router on
//!   the worker pool) exactly once per key
//! - Tracks pending joins per room through leases
//! - Destroys a room once it has no peers and no pending joins
//! - Monitors room actor health (panic detection via `JoinHandle`)
//!
//! Requests are handled one at a time, so concurrent first joiners for the
//! same key always see the same room. The registry never waits on a worker
//! or a room itself: router creation and close checks run as tasks that
//! report back through an internal channel, and acquirers for a key in
//! either state are parked until the outcome is known. Rooms never call
//! back into the registry.
//!
//! # Leases
//!
//! `acquire` returns a [`RoomLease`]. While any lease is held the room is
//! never closed, even if it is momentarily empty. Dropping the lease
//! releases it. A lease is only counted once the acquirer has received it,
//! so an acquire abandoned mid-flight holds nothing open.

use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle};
use crate::errors::{RcError, Resource};
use crate::media::{RouterHandle, WorkerPool};

use common::types::RoomKey;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long a removed room's task gets to finish before we stop waiting.
const ROOM_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a room gets to answer a close check.
const CLOSE_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

type Waiter = oneshot::Sender<Result<RoomActorHandle, RcError>>;

/// Handle to the `RoomRegistryActor`.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomRegistryHandle {
    /// Create a new `RoomRegistryActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>, room_capacity: usize, metrics: Arc<ActorMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let mailbox = MailboxMonitor::shared(ActorType::Registry, "registry");

        let actor = RoomRegistryActor {
            receiver,
            completion_tx,
            completion_rx,
            cancel_token: cancel_token.clone(),
            pool,
            room_capacity,
            rooms: HashMap::new(),
            creating: HashMap::new(),
            next_instance_id: 1,
            accepting_new: true,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            mailbox,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
    ) -> Result<T, RcError> {
        let (tx, rx) = oneshot::channel();
        self.post(build(tx)).await?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))
    }

    async fn post(&self, message: RegistryMessage) -> Result<(), RcError> {
        self.mailbox
            .send(&self.sender, message)
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))
    }

    /// Get or create the room and hold a join lease on it.
    ///
    /// Cancel-safe: if this future is dropped before it resolves, no lease
    /// is held.
    pub async fn acquire(&self, room_key: RoomKey) -> Result<RoomLease, RcError> {
        let room = self
            .request(|respond_to| RegistryMessage::Acquire {
                room_key,
                respond_to,
            })
            .await??;

        Ok(RoomLease {
            registry: self.clone(),
            room,
        })
    }

    /// A peer left `room_key`; close the room if nothing holds it open.
    pub async fn room_vacated(&self, room_key: RoomKey, instance_id: u64) -> Result<(), RcError> {
        self.post(RegistryMessage::RoomVacated {
            room_key,
            instance_id,
        })
        .await
    }

    pub async fn get(&self, room_key: RoomKey) -> Result<Option<RoomActorHandle>, RcError> {
        self.request(|respond_to| RegistryMessage::Get {
            room_key,
            respond_to,
        })
        .await
    }

    /// Force-close a room and every resource in it.
    pub async fn destroy(&self, room_key: RoomKey) -> Result<(), RcError> {
        self.request(|respond_to| RegistryMessage::Destroy {
            room_key,
            respond_to,
        })
        .await?
    }

    pub async fn status(&self) -> Result<RegistryStatus, RcError> {
        self.request(|respond_to| RegistryMessage::GetStatus { respond_to })
            .await
    }

    /// Stop admitting and close every room, waiting up to `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), RcError> {
        self.request(|respond_to| RegistryMessage::Shutdown {
            deadline,
            respond_to,
        })
        .await?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Release a lease without waiting. Falls back to a spawned send when the
    /// mailbox is full.
    fn release_lease(&self, room_key: RoomKey, instance_id: u64) {
        let message = RegistryMessage::ReleaseLease {
            room_key,
            instance_id,
        };
        match self.mailbox.try_send(&self.sender, message) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(message)) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    return;
                };
                let sender = self.sender.clone();
                let mailbox = Arc::clone(&self.mailbox);
                runtime.spawn(async move {
                    let _ = mailbox.send(&sender, message).await;
                });
            }
        }
    }
}

/// A pending join on a room. The room stays open while this is alive.
#[derive(Debug)]
pub struct RoomLease {
    registry: RoomRegistryHandle,
    room: RoomActorHandle,
}

impl RoomLease {
    #[must_use]
    pub fn room(&self) -> &RoomActorHandle {
        &self.room
    }
}

impl Drop for RoomLease {
    fn drop(&mut self) {
        self.registry
            .release_lease(self.room.room_key().clone(), self.room.instance_id());
    }
}

/// Outcome of work the registry handed off to a task.
#[derive(Debug)]
enum Completion {
    RouterCreated {
        room_key: RoomKey,
        result: Result<RouterHandle, RcError>,
    },
    CloseChecked {
        room_key: RoomKey,
        instance_id: u64,
        result: Result<bool, RcError>,
    },
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    /// Joins in flight against this room.
    leases: usize,
    /// A close check is out; new acquirers wait for its answer.
    closing: bool,
    /// The room was vacated again while a close check was out.
    recheck: bool,
    waiters: Vec<Waiter>,
    created_at: std::time::Instant,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    cancel_token: CancellationToken,
    pool: Arc<WorkerPool>,
    room_capacity: usize,
    rooms: HashMap<RoomKey, ManagedRoom>,
    /// Keys whose router is being created, with the acquirers waiting on it.
    creating: HashMap<RoomKey, Vec<Waiter>>,
    next_instance_id: u64,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomRegistryActor {
    /// Run the actor message loop.
    #[instrument(skip_all, name = "rc.actor.registry")]
    async fn run(mut self) {
        info!(
            target: "rc.actor.registry",
            room_capacity = self.room_capacity,
            workers = self.pool.worker_count(),
            "RoomRegistryActor started"
        );

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rc.actor.registry",
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.close_all_rooms(Duration::from_secs(30)).await;
                    break;
                }

                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message).await;
                        }
                        None => {
                            info!(
                                target: "rc.actor.registry",
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.close_all_rooms(Duration::from_secs(30)).await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rc.actor.registry",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Acquire {
                room_key,
                respond_to,
            } => {
                self.acquire(room_key, respond_to).await;
            }

            RegistryMessage::ReleaseLease {
                room_key,
                instance_id,
            } => {
                self.release_lease(&room_key, instance_id);
            }

            RegistryMessage::RoomVacated {
                room_key,
                instance_id,
            } => {
                self.close_if_idle(&room_key, instance_id);
            }

            RegistryMessage::Get {
                room_key,
                respond_to,
            } => {
                let handle = self.rooms.get(&room_key).map(|m| m.handle.clone());
                let _ = respond_to.send(handle);
            }

            RegistryMessage::Destroy {
                room_key,
                respond_to,
            } => {
                let result = self.destroy(&room_key);
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                self.accepting_new = false;
                self.close_all_rooms(deadline).await;
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::RouterCreated { room_key, result } => {
                self.router_created(room_key, result);
            }
            Completion::CloseChecked {
                room_key,
                instance_id,
                result,
            } => {
                self.close_checked(room_key, instance_id, result).await;
            }
        }
    }

    async fn acquire(&mut self, room_key: RoomKey, respond_to: Waiter) {
        if !self.accepting_new {
            let _ = respond_to.send(Err(shutting_down()));
            return;
        }

        if let Some(waiters) = self.creating.get_mut(&room_key) {
            waiters.push(respond_to);
            return;
        }

        if let Some(managed) = self.rooms.get_mut(&room_key) {
            if !managed.task_handle.is_finished() {
                if managed.closing {
                    managed.waiters.push(respond_to);
                } else {
                    let instance_id = managed.handle.instance_id();
                    if !grant(managed, respond_to) {
                        self.close_if_idle(&room_key, instance_id);
                    }
                }
                return;
            }
        }
        // A dead entry is replaced, never reused.
        let mut waiters = vec![respond_to];
        if let Some(mut stale) = self.rooms.remove(&room_key) {
            waiters.append(&mut stale.waiters);
            self.reap(&room_key, stale).await;
        }

        self.start_creation(room_key, waiters);
    }

    /// Create the router off the actor loop; acquirers wait in `creating`.
    fn start_creation(&mut self, room_key: RoomKey, waiters: Vec<Waiter>) {
        if !self.accepting_new {
            fail_all(waiters, &shutting_down());
            return;
        }

        self.creating.insert(room_key.clone(), waiters);
        let pool = Arc::clone(&self.pool);
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = pool.create_router(&room_key).await;
            let _ = completions.send(Completion::RouterCreated { room_key, result });
        });
    }

    fn router_created(&mut self, room_key: RoomKey, result: Result<RouterHandle, RcError>) {
        let waiters = self.creating.remove(&room_key).unwrap_or_default();

        let router = match result {
            Ok(router) => router,
            Err(e) => {
                warn!(
                    target: "rc.actor.registry",
                    room_key = %room_key,
                    error = %e,
                    waiters = waiters.len(),
                    "Router creation failed"
                );
                fail_all(waiters, &e);
                return;
            }
        };

        if !self.accepting_new {
            fail_all(waiters, &shutting_down());
            tokio::spawn(async move {
                let _ = router.close().await;
            });
            return;
        }

        let instance_id = self.next_instance_id;
        self.next_instance_id += 1;

        let (handle, task_handle) = RoomActor::spawn(
            room_key.clone(),
            instance_id,
            self.room_capacity,
            router,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        let mut managed = ManagedRoom {
            handle,
            task_handle,
            leases: 0,
            closing: false,
            recheck: false,
            waiters: Vec::new(),
            created_at: std::time::Instant::now(),
        };
        for waiter in waiters {
            grant(&mut managed, waiter);
        }
        let leases = managed.leases;
        self.rooms.insert(room_key.clone(), managed);
        self.metrics.room_created();

        info!(
            target: "rc.actor.registry",
            room_key = %room_key,
            instance_id,
            leases,
            total_rooms = self.rooms.len(),
            "Room created"
        );

        // Every acquirer gave up while the router was being made.
        if leases == 0 {
            self.close_if_idle(&room_key, instance_id);
        }
    }

    fn release_lease(&mut self, room_key: &RoomKey, instance_id: u64) {
        let Some(managed) = self.rooms.get_mut(room_key) else {
            return;
        };
        if managed.handle.instance_id() != instance_id {
            return;
        }
        managed.leases = managed.leases.saturating_sub(1);
        self.close_if_idle(room_key, instance_id);
    }

    /// Ask the room to close if it is the same instance and has no pending
    /// joins. The room's answer arrives as a `CloseChecked` completion.
    fn close_if_idle(&mut self, room_key: &RoomKey, instance_id: u64) {
        let Some(managed) = self.rooms.get_mut(room_key) else {
            return;
        };
        if managed.handle.instance_id() != instance_id || managed.leases > 0 {
            return;
        }
        if managed.closing {
            managed.recheck = true;
            return;
        }

        managed.closing = true;
        managed.recheck = false;
        let handle = managed.handle.clone();
        let room_key = room_key.clone();
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(CLOSE_CHECK_TIMEOUT, handle.close_if_empty()).await
            {
                Ok(result) => result,
                Err(_) => Err(RcError::Timeout("close check".to_string())),
            };
            let _ = completions.send(Completion::CloseChecked {
                room_key,
                instance_id,
                result,
            });
        });
    }

    async fn close_checked(
        &mut self,
        room_key: RoomKey,
        instance_id: u64,
        result: Result<bool, RcError>,
    ) {
        let Some(managed) = self.rooms.get_mut(&room_key) else {
            return;
        };
        if managed.handle.instance_id() != instance_id {
            return;
        }
        managed.closing = false;

        match result {
            Ok(true) => {
                if let Some(mut managed) = self.rooms.remove(&room_key) {
                    self.metrics.room_removed();
                    info!(
                        target: "rc.actor.registry",
                        room_key = %room_key,
                        instance_id,
                        lifetime_secs = managed.created_at.elapsed().as_secs(),
                        total_rooms = self.rooms.len(),
                        "Room closed"
                    );
                    let waiters = std::mem::take(&mut managed.waiters);
                    spawn_cleanup(room_key.clone(), managed.task_handle);
                    // Joins that arrived during the check get a fresh room.
                    if !waiters.is_empty() {
                        self.start_creation(room_key, waiters);
                    }
                }
            }
            Ok(false) => {
                let recheck = managed.recheck;
                for waiter in std::mem::take(&mut managed.waiters) {
                    grant(managed, waiter);
                }
                if recheck {
                    self.close_if_idle(&room_key, instance_id);
                }
            }
            Err(e) => {
                warn!(
                    target: "rc.actor.registry",
                    room_key = %room_key,
                    error = %e,
                    "Room did not answer close request"
                );
                if managed.task_handle.is_finished() {
                    // Pruned below; waiters move to a fresh room.
                    if let Some(mut stale) = self.rooms.remove(&room_key) {
                        let waiters = std::mem::take(&mut stale.waiters);
                        self.reap(&room_key, stale).await;
                        if !waiters.is_empty() {
                            self.start_creation(room_key, waiters);
                        }
                    }
                } else {
                    // Busy, not gone. Retry once its queue has drained.
                    for waiter in std::mem::take(&mut managed.waiters) {
                        grant(managed, waiter);
                    }
                    self.close_if_idle(&room_key, instance_id);
                }
            }
        }
    }

    fn destroy(&mut self, room_key: &RoomKey) -> Result<(), RcError> {
        let managed = self
            .rooms
            .remove(room_key)
            .ok_or(RcError::NotFound(Resource::Room))?;

        // Cancellation drops every peer and closes the router.
        managed.handle.cancel();
        self.metrics.room_removed();
        fail_all(managed.waiters, &RcError::NotFound(Resource::Room));
        spawn_cleanup(room_key.clone(), managed.task_handle);

        info!(
            target: "rc.actor.registry",
            room_key = %room_key,
            instance_id = managed.handle.instance_id(),
            total_rooms = self.rooms.len(),
            "Room destroyed"
        );
        Ok(())
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            peer_count: self.metrics.peer_count(),
            is_shutting_down: !self.accepting_new,
        }
    }

    async fn close_all_rooms(&mut self, deadline: Duration) {
        self.accepting_new = false;
        for (_, waiters) in self.creating.drain() {
            fail_all(waiters, &shutting_down());
        }
        if self.rooms.is_empty() {
            return;
        }

        info!(
            target: "rc.actor.registry",
            room_count = self.rooms.len(),
            "Closing all rooms"
        );

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        let rooms: Vec<(RoomKey, ManagedRoom)> = self.rooms.drain().collect();
        let count = rooms.len();
        let wait_all = async {
            for (room_key, managed) in rooms {
                fail_all(managed.waiters, &shutting_down());
                if let Err(e) = managed.task_handle.await {
                    warn!(
                        target: "rc.actor.registry",
                        room_key = %room_key,
                        error = ?e,
                        "Room task failed during shutdown"
                    );
                }
            }
        };
        if tokio::time::timeout(deadline, wait_all).await.is_err() {
            warn!(
                target: "rc.actor.registry",
                deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                "Room shutdown timed out"
            );
        }
        for _ in 0..count {
            self.metrics.room_removed();
        }

        info!(target: "rc.actor.registry", "All rooms closed");
    }

    /// Prune rooms whose actor task ended on its own.
    async fn check_room_health(&mut self) {
        let finished: Vec<RoomKey> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect();

        for room_key in finished {
            if let Some(mut managed) = self.rooms.remove(&room_key) {
                warn!(
                    target: "rc.actor.registry",
                    room_key = %room_key,
                    "Room actor task finished unexpectedly"
                );
                let waiters = std::mem::take(&mut managed.waiters);
                self.reap(&room_key, managed).await;
                if !waiters.is_empty() {
                    self.start_creation(room_key, waiters);
                }
            }
        }
    }

    /// Collect a finished room task, counting panics.
    async fn reap(&self, room_key: &RoomKey, managed: ManagedRoom) {
        if let Err(join_error) = managed.task_handle.await {
            if join_error.is_panic() {
                error!(
                    target: "rc.actor.registry",
                    room_key = %room_key,
                    error = ?join_error,
                    "Room actor panicked"
                );
                self.metrics.record_panic(ActorType::Room);
            }
        }
        self.metrics.room_removed();
    }
}

/// Hand the room to an acquirer. The lease only counts if it was delivered.
fn grant(managed: &mut ManagedRoom, waiter: Waiter) -> bool {
    managed.leases += 1;
    if waiter.send(Ok(managed.handle.clone())).is_ok() {
        return true;
    }
    managed.leases -= 1;
    debug!(
        target: "rc.actor.registry",
        room_key = %managed.handle.room_key(),
        "Acquirer gone before the lease was delivered"
    );
    false
}

fn fail_all(waiters: Vec<Waiter>, cause: &RcError) {
    for waiter in waiters {
        let _ = waiter.send(Err(for_waiter(cause)));
    }
}

/// Copy of `cause` for one of several waiters, keeping its client code.
fn for_waiter(cause: &RcError) -> RcError {
    match cause {
        RcError::WorkerDied(msg) => RcError::WorkerDied(msg.clone()),
        RcError::Timeout(msg) => RcError::Timeout(msg.clone()),
        RcError::NotFound(resource) => RcError::NotFound(*resource),
        other => RcError::Internal(other.to_string()),
    }
}

fn shutting_down() -> RcError {
    RcError::Internal("registry is shutting down".to_string())
}

/// Wait for a removed room's task in the background.
fn spawn_cleanup(room_key: RoomKey, task_handle: JoinHandle<()>) {
    tokio::spawn(async move {
        match tokio::time::timeout(ROOM_CLEANUP_TIMEOUT, task_handle).await {
            Ok(Ok(())) => {
                debug!(
                    target: "rc.actor.registry",
                    room_key = %room_key,
                    "Room actor task completed cleanly"
                );
            }
            Ok(Err(e)) => {
                warn!(
                    target: "rc.actor.registry",
                    room_key = %room_key,
                    error = ?e,
                    "Room actor task panicked during removal"
                );
            }
            Err(_) => {
                warn!(
                    target: "rc.actor.registry",
                    room_key = %room_key,
                    "Room actor task cleanup timed out"
                );
            }
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::connection::ConnectionActor;
    use crate::auth::{Identity, Role};
    use crate::media::{FatalSignal, WorkerPoolConfig, WorkerSettings};
    use common::types::{ConnectionId, ParticipantId};
    use futures_util::FutureExt;

    fn pool() -> Arc<WorkerPool> {
        WorkerPool::start(
            WorkerPoolConfig {
                num_workers: 2,
                rtc_min_port: 41000,
                rtc_max_port: 41100,
                worker: WorkerSettings {
                    listen_ip: "127.0.0.1".parse().unwrap(),
                    announced_ip: None,
                    call_timeout: Duration::from_secs(5),
                },
            },
            CancellationToken::new(),
            FatalSignal::new(),
        )
        .unwrap()
    }

    fn key(raw: &str) -> RoomKey {
        RoomKey::parse(raw).unwrap()
    }

    /// Let fire-and-forget registry messages land.
    async fn settle(registry: &RoomRegistryHandle) {
        registry.status().await.unwrap();
    }

    /// Closing finishes after the room answers; poll for it.
    async fn closed(registry: &RoomRegistryHandle, raw: &str) -> bool {
        for _ in 0..200 {
            if registry.get(key(raw)).await.unwrap().is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn join(room: &RoomActorHandle, metrics: &Arc<ActorMetrics>) -> ConnectionId {
        let connection_id = ConnectionId::new();
        let (tx, _rx) = mpsc::channel(16);
        let (connection, _task) = ConnectionActor::spawn(
            connection_id,
            ParticipantId::from("p"),
            tx,
            CancellationToken::new(),
            Arc::clone(metrics),
        );
        room.join(
            connection_id,
            Identity {
                participant_id: ParticipantId::from("p"),
                display_name: "P".to_string(),
                role: Role::Participant,
            },
            connection,
        )
        .await
        .unwrap();
        connection_id
    }

    #[tokio::test]
    async fn test_concurrent_acquire_creates_one_room() {
        let pool = pool();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(Arc::clone(&pool), 10, Arc::clone(&metrics));

        let (a, b) = tokio::join!(registry.acquire(key("R1")), registry.acquire(key("R1")));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.room().instance_id(), b.room().instance_id());
        assert_eq!(pool.status().await.totals.routers, 1);
        assert_eq!(registry.status().await.unwrap().room_count, 1);
    }

    #[tokio::test]
    async fn test_failed_first_join_leaves_nothing() {
        let pool = pool();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(Arc::clone(&pool), 10, Arc::clone(&metrics));

        let lease = registry.acquire(key("R1")).await.unwrap();
        drop(lease);

        assert!(closed(&registry, "R1").await);
        assert_eq!(pool.status().await.totals.routers, 0);
        assert_eq!(metrics.room_count(), 0);
    }

    #[tokio::test]
    async fn test_last_leave_destroys_and_rejoin_is_fresh() {
        let pool = pool();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(Arc::clone(&pool), 10, Arc::clone(&metrics));

        let lease = registry.acquire(key("R1")).await.unwrap();
        let room = lease.room().clone();
        let connection_id = join(&room, &metrics).await;
        drop(lease);
        settle(&registry).await;

        // Occupied: the lease release does not close it
        assert!(registry.get(key("R1")).await.unwrap().is_some());

        room.leave(connection_id).await.unwrap();
        registry
            .room_vacated(key("R1"), room.instance_id())
            .await
            .unwrap();

        assert!(closed(&registry, "R1").await);
        assert_eq!(pool.status().await.totals.routers, 0);

        let again = registry.acquire(key("R1")).await.unwrap();
        assert_ne!(again.room().instance_id(), room.instance_id());
    }

    #[tokio::test]
    async fn test_pending_lease_keeps_empty_room_open() {
        let pool = pool();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(Arc::clone(&pool), 10, Arc::clone(&metrics));

        let first = registry.acquire(key("R1")).await.unwrap();
        let room = first.room().clone();
        let connection_id = join(&room, &metrics).await;
        drop(first);

        let pending = registry.acquire(key("R1")).await.unwrap();
        room.leave(connection_id).await.unwrap();
        registry
            .room_vacated(key("R1"), room.instance_id())
            .await
            .unwrap();
        settle(&registry).await;

        // Empty but a join is in flight
        let still = registry.get(key("R1")).await.unwrap().unwrap();
        assert_eq!(still.instance_id(), room.instance_id());

        drop(pending);
        assert!(closed(&registry, "R1").await);
    }

    #[tokio::test]
    async fn test_abandoned_acquire_of_new_room_holds_nothing() {
        let pool = pool();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(Arc::clone(&pool), 10, Arc::clone(&metrics));

        // Dropped while the router is still being created
        assert!(registry.acquire(key("R1")).now_or_never().is_none());

        // Had the abandoned acquire kept a lease, this release would not close it
        let lease = registry.acquire(key("R1")).await.unwrap();
        drop(lease);

        assert!(closed(&registry, "R1").await);
        assert_eq!(pool.status().await.totals.routers, 0);
        assert_eq!(metrics.room_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_acquire_of_live_room_holds_nothing() {
        let pool = pool();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(Arc::clone(&pool), 10, Arc::clone(&metrics));

        let lease = registry.acquire(key("R1")).await.unwrap();
        let room = lease.room().clone();
        assert!(registry.acquire(key("R1")).now_or_never().is_none());
        settle(&registry).await;

        // A full join and leave afterwards must still close the room
        let connection_id = join(&room, &metrics).await;
        drop(lease);
        room.leave(connection_id).await.unwrap();
        registry
            .room_vacated(key("R1"), room.instance_id())
            .await
            .unwrap();

        assert!(closed(&registry, "R1").await);
        assert_eq!(pool.status().await.totals.routers, 0);
    }

    #[tokio::test]
    async fn test_stalled_worker_does_not_block_other_rooms() {
        let pool = pool();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(Arc::clone(&pool), 10, Arc::clone(&metrics));

        let (release, hold) = oneshot::channel();
        pool.worker(0).unwrap().stall(hold).await;

        // R1 lands on the stalled worker, R2 on the other one
        let mut stuck = Box::pin(registry.acquire(key("R1")));
        assert!((&mut stuck).now_or_never().is_none());
        settle(&registry).await;

        let r2 = tokio::time::timeout(Duration::from_secs(1), registry.acquire(key("R2")))
            .await
            .expect("registry blocked behind a stalled worker")
            .unwrap();
        assert_eq!(r2.room().room_key(), &key("R2"));
        assert!((&mut stuck).now_or_never().is_none());

        release.send(()).unwrap();
        let r1 = stuck.await.unwrap();
        assert_eq!(r1.room().room_key(), &key("R1"));
        assert_eq!(registry.status().await.unwrap().room_count, 2);
    }

    #[tokio::test]
    async fn test_stalled_room_does_not_block_other_rooms() {
        let pool = pool();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(Arc::clone(&pool), 10, Arc::clone(&metrics));

        // First router goes to worker 0
        let r1 = registry.acquire(key("R1")).await.unwrap();

        // R1's close check waits on its router close, which waits on worker 0
        let (release, hold) = oneshot::channel();
        pool.worker(0).unwrap().stall(hold).await;
        drop(r1);
        settle(&registry).await;

        let r2 = tokio::time::timeout(Duration::from_secs(1), registry.acquire(key("R2")))
            .await
            .expect("registry blocked behind a closing room")
            .unwrap();
        assert_eq!(r2.room().room_key(), &key("R2"));

        // A join racing the close check waits for it, then gets a live room
        let mut rejoin = Box::pin(registry.acquire(key("R1")));
        assert!((&mut rejoin).now_or_never().is_none());
        settle(&registry).await;
        assert!((&mut rejoin).now_or_never().is_none());

        release.send(()).unwrap();
        let again = rejoin.await.unwrap();
        join(again.room(), &metrics).await;
        assert_eq!(again.room().get_state().await.unwrap().peers.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_vacated_is_ignored() {
        let pool = pool();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(Arc::clone(&pool), 10, Arc::clone(&metrics));

        let lease = registry.acquire(key("R1")).await.unwrap();
        let instance_id = lease.room().instance_id();
        registry
            .room_vacated(key("R1"), instance_id + 100)
            .await
            .unwrap();
        settle(&registry).await;
        assert!(registry.get(key("R1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_destroy_and_shutdown() {
        let pool = pool();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(Arc::clone(&pool), 10, Arc::clone(&metrics));

        let r1 = registry.acquire(key("R1")).await.unwrap();
        let r2 = registry.acquire(key("R2")).await.unwrap();
        join(r1.room(), &metrics).await;

        registry.destroy(key("R1")).await.unwrap();
        assert!(matches!(
            registry.destroy(key("R1")).await,
            Err(RcError::NotFound(Resource::Room))
        ));

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
        let status = registry.status().await.unwrap();
        assert!(status.is_shutting_down);
        assert_eq!(status.room_count, 0);
        assert!(r2.room().get_state().await.is_err());

        assert!(matches!(
            registry.acquire(key("R3")).await,
            Err(RcError::Internal(_))
        ));
    }
}
