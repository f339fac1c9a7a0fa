//! Actor metrics and mailbox monitoring.
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Registry   | < 100  | 100-500 | > 500    |
//! | Room       | < 100  | 100-500 | > 500    |
//! | Worker     | < 100  | 100-500 | > 500    |
//! | Connection | < 50   | 50-200  | > 200    |
//!
//! A monitor is shared between an actor and its handles: handles record the
//! enqueue, the actor records the dequeue. Handles send through
//! [`MailboxMonitor::send`] or [`MailboxMonitor::try_send`], which count the
//! message while holding a channel permit so the actor can never dequeue it
//! first.

use crate::observability::metrics as prom;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tracing::{debug, warn};

/// Mailbox depth thresholds for registry, room and worker actors.
pub const ROOM_MAILBOX_NORMAL: usize = 100;
pub const ROOM_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for connection actors.
pub const CONNECTION_MAILBOX_NORMAL: usize = 50;
pub const CONNECTION_MAILBOX_WARNING: usize = 200;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// RoomRegistryActor (singleton).
    Registry,
    /// RoomActor (one per room).
    Room,
    /// ConnectionActor (one per signaling connection).
    Connection,
    /// Media worker (fixed pool).
    Worker,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Room => "room",
            ActorType::Connection => "connection",
            ActorType::Worker => "worker",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Room | ActorType::Worker => ROOM_MAILBOX_WARNING,
            ActorType::Connection => CONNECTION_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Room | ActorType::Worker => ROOM_MAILBOX_NORMAL,
            ActorType::Connection => CONNECTION_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth for one actor's mailbox.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Room key, connection id or worker id.
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
    /// Messages dropped due to backpressure.
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Shared monitor for an actor and its handles.
    #[must_use]
    pub fn shared(actor_type: ActorType, actor_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(actor_type, actor_id))
    }

    /// Record a message being added to the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);

        let level = self.level_for_depth(new_depth);
        if level == MailboxLevel::Critical {
            warn!(
                target: "rc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                threshold = self.actor_type.warning_threshold(),
                "Mailbox depth critical"
            );
            prom::set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);
        } else if level == MailboxLevel::Warning
            && new_depth == self.actor_type.normal_threshold() + 1
        {
            debug!(
                target: "rc.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                "Mailbox depth elevated"
            );
            prom::set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);
        }
    }

    /// Send `message`, waiting for mailbox space, and count it.
    ///
    /// Nothing is counted if the wait is cancelled or the channel is closed.
    pub async fn send<T>(&self, sender: &mpsc::Sender<T>, message: T) -> Result<(), SendError<T>> {
        match sender.reserve().await {
            Ok(permit) => {
                self.record_enqueue();
                permit.send(message);
                Ok(())
            }
            Err(_) => Err(SendError(message)),
        }
    }

    /// Send `message` only if the mailbox has space, and count it.
    pub fn try_send<T>(&self, sender: &mpsc::Sender<T>, message: T) -> Result<(), TrySendError<T>> {
        match sender.try_reserve() {
            Ok(permit) => {
                self.record_enqueue();
                permit.send(message);
                Ok(())
            }
            Err(TrySendError::Full(())) => Err(TrySendError::Full(message)),
            Err(TrySendError::Closed(())) => Err(TrySendError::Closed(message)),
        }
    }

    /// Record a message being taken off the mailbox.
    pub fn record_dequeue(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            });
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message that was never enqueued because the mailbox was full.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            target: "rc.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped,
            "Message dropped due to backpressure"
        );
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Aggregated counters for the actor system, mirrored into Prometheus gauges.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub active_rooms: AtomicUsize,
    pub active_peers: AtomicUsize,
    pub active_connections: AtomicUsize,
    /// Total actor panics (indicates bugs).
    pub actor_panics: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let n = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_rooms_active(n);
    }

    pub fn room_removed(&self) {
        let n = decrement(&self.active_rooms);
        prom::set_rooms_active(n);
    }

    pub fn peer_joined(&self) {
        let n = self.active_peers.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_peers_active(n);
    }

    pub fn peer_left(&self) {
        let n = decrement(&self.active_peers);
        prom::set_peers_active(n);
    }

    pub fn connection_opened(&self) {
        let n = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        prom::set_connections_active(n);
    }

    pub fn connection_closed(&self) {
        let n = decrement(&self.active_connections);
        prom::set_connections_active(n);
    }

    /// Record an actor panic.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "rc.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics = total,
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.active_peers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

fn decrement(counter: &AtomicUsize) -> usize {
    let previous = counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(1))
        })
        .unwrap_or(0);
    previous.saturating_sub(1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_actor_type_labels() {
        assert_eq!(ActorType::Registry.as_str(), "registry");
        assert_eq!(ActorType::Room.as_str(), "room");
        assert_eq!(ActorType::Connection.as_str(), "connection");
        assert_eq!(ActorType::Worker.as_str(), "worker");
    }

    #[test]
    fn test_mailbox_monitor_enqueue_dequeue() {
        let monitor = MailboxMonitor::new(ActorType::Room, "R1");

        monitor.record_enqueue();
        monitor.record_enqueue();
        monitor.record_enqueue();
        assert_eq!(monitor.current_depth(), 3);
        assert_eq!(monitor.peak_depth(), 3);

        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 2);
        assert_eq!(monitor.peak_depth(), 3);
        assert_eq!(monitor.messages_processed(), 1);
    }

    #[test]
    fn test_dequeue_never_underflows() {
        let monitor = MailboxMonitor::new(ActorType::Worker, "worker-0");
        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 0);
        assert_eq!(monitor.messages_processed(), 1);
    }

    #[tokio::test]
    async fn test_send_counts_before_actor_can_dequeue() {
        let monitor = MailboxMonitor::new(ActorType::Room, "R1");
        let (tx, mut rx) = mpsc::channel::<u32>(4);

        monitor.send(&tx, 1).await.unwrap();
        monitor.try_send(&tx, 2).unwrap();
        assert_eq!(monitor.current_depth(), 2);

        rx.recv().await.unwrap();
        monitor.record_dequeue();
        rx.recv().await.unwrap();
        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 0);
    }

    #[tokio::test]
    async fn test_failed_sends_are_not_counted() {
        let monitor = MailboxMonitor::new(ActorType::Room, "R1");
        let (tx, rx) = mpsc::channel::<u32>(1);

        monitor.try_send(&tx, 1).unwrap();
        assert!(matches!(monitor.try_send(&tx, 2), Err(TrySendError::Full(2))));

        // Waiting for space and giving up leaves no trace.
        let pending = tokio::time::timeout(Duration::from_millis(10), monitor.send(&tx, 3)).await;
        assert!(pending.is_err());
        assert_eq!(monitor.current_depth(), 1);

        drop(rx);
        assert!(monitor.send(&tx, 4).await.is_err());
        assert!(matches!(monitor.try_send(&tx, 5), Err(TrySendError::Closed(5))));
        assert_eq!(monitor.current_depth(), 1);
    }

    #[test]
    fn test_mailbox_levels_for_connection() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "conn-1");
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);

        for _ in 0..75 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        for _ in 0..150 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
    }

    #[test]
    fn test_mailbox_monitor_drop() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "conn-2");
        monitor.record_drop();
        monitor.record_drop();
        assert_eq!(monitor.messages_dropped(), 2);
        assert_eq!(monitor.current_depth(), 0);
    }

    #[test]
    fn test_actor_metrics_counts() {
        let metrics = ActorMetrics::new();

        metrics.room_created();
        metrics.peer_joined();
        metrics.peer_joined();
        metrics.connection_opened();
        assert_eq!(metrics.room_count(), 1);
        assert_eq!(metrics.peer_count(), 2);
        assert_eq!(metrics.connection_count(), 1);

        metrics.peer_left();
        metrics.room_removed();
        metrics.connection_closed();
        assert_eq!(metrics.room_count(), 0);
        assert_eq!(metrics.peer_count(), 1);
        assert_eq!(metrics.connection_count(), 0);
    }

    #[test]
    fn test_actor_metrics_never_go_negative() {
        let metrics = ActorMetrics::new();
        metrics.room_removed();
        metrics.peer_left();
        assert_eq!(metrics.room_count(), 0);
        assert_eq!(metrics.peer_count(), 0);
    }

    #[test]
    fn test_record_panic_counts() {
        let metrics = ActorMetrics::new();
        metrics.record_panic(ActorType::Room);
        metrics.record_panic(ActorType::Connection);
        assert_eq!(metrics.actor_panics.load(Ordering::Relaxed), 2);
    }
}
