//! Fixed pool of media workers.
//!
//! Workers are spawned once at startup and never respawned. Any worker exit
//! that is not part of pool shutdown trips the process-wide [`FatalSignal`];
//! the binary reacts by flipping readiness and exiting after a grace period.

use super::ports::PortAllocator;
use super::router::RouterHandle;
use super::worker::{WorkerActor, WorkerHandle, WorkerSettings, WorkerStatus};
use crate::config::Config;
use crate::errors::RcError;
use crate::observability::metrics as prom;

use common::types::RoomKey;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Process-wide "a worker died" latch. The first reason wins.
#[derive(Clone, Debug, Default)]
pub struct FatalSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl FatalSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.reason.set(reason.clone()).is_ok() {
            error!(target: "rc.media.pool", reason = %reason, "Fatal media failure, process will exit");
        }
        self.token.cancel();
    }

    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.get().cloned()
    }

    /// Resolves once the signal has been tripped.
    pub async fn tripped(&self) {
        self.token.cancelled().await;
    }
}

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub worker: WorkerSettings,
}

impl WorkerPoolConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            num_workers: config.num_workers,
            rtc_min_port: config.rtc_min_port,
            rtc_max_port: config.rtc_max_port,
            worker: WorkerSettings {
                listen_ip: config.listen_ip,
                announced_ip: config.announced_ip,
                call_timeout: config.worker_timeout,
            },
        }
    }
}

/// Aggregated pool status.
#[derive(Debug, Clone, Default)]
pub struct PoolStatus {
    pub workers: usize,
    pub alive: usize,
    pub totals: WorkerStatus,
    pub ports_in_use: usize,
}

/// The worker pool.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
    cancel_token: CancellationToken,
    fatal: FatalSignal,
    ports: Arc<PortAllocator>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("fatal", &self.fatal.is_tripped())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawn `num_workers` workers and the task that watches them.
    ///
    /// # Errors
    ///
    /// Returns `Internal` when asked for zero workers.
    pub fn start(
        config: WorkerPoolConfig,
        cancel_token: CancellationToken,
        fatal: FatalSignal,
    ) -> Result<Arc<Self>, RcError> {
        if config.num_workers == 0 {
            return Err(RcError::Internal(
                "worker pool requires at least one worker".to_string(),
            ));
        }

        let ports = Arc::new(PortAllocator::new(config.rtc_min_port, config.rtc_max_port));
        let mut tasks = JoinSet::new();
        let mut workers = Vec::with_capacity(config.num_workers);

        for id in 0..config.num_workers {
            let (actor, handle) = WorkerActor::new(
                id,
                config.worker.clone(),
                Arc::clone(&ports),
                cancel_token.child_token(),
                cancel_token.clone(),
                fatal.clone(),
            );
            let pid = handle.pid();
            tasks.spawn(async move {
                let panicked = AssertUnwindSafe(actor.run()).catch_unwind().await.is_err();
                WorkerExit { id, pid, panicked }
            });
            workers.push(handle);
        }

        info!(
            target: "rc.media.pool",
            workers = config.num_workers,
            rtc_min_port = config.rtc_min_port,
            rtc_max_port = config.rtc_max_port,
            "Media worker pool started"
        );

        let monitor = tokio::spawn(watch_workers(tasks, cancel_token.clone(), fatal.clone()));

        Ok(Arc::new(Self {
            workers,
            next: AtomicUsize::new(0),
            cancel_token,
            fatal,
            ports,
            monitor: Mutex::new(Some(monitor)),
        }))
    }

    #[must_use]
    pub fn fatal_signal(&self) -> &FatalSignal {
        &self.fatal
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Worker by index, without advancing the round robin.
    #[cfg(test)]
    pub(crate) fn worker(&self, index: usize) -> Option<&WorkerHandle> {
        self.workers.get(index)
    }

    /// Next worker, round-robin.
    ///
    /// # Errors
    ///
    /// `WorkerDied` once any worker has died.
    pub fn acquire_worker(&self) -> Result<&WorkerHandle, RcError> {
        if let Some(reason) = self.fatal.reason() {
            return Err(RcError::WorkerDied(reason));
        }
        if self.cancel_token.is_cancelled() {
            return Err(RcError::Internal("media workers shutting down".to_string()));
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers
            .get(index)
            .ok_or_else(|| RcError::Internal("worker index out of range".to_string()))
    }

    /// Create a router for `room_key` on the next worker.
    pub async fn create_router(&self, room_key: &RoomKey) -> Result<RouterHandle, RcError> {
        let worker = self.acquire_worker()?;
        let router = worker.create_router(room_key).await?;
        debug!(
            target: "rc.media.pool",
            room_key = %room_key,
            worker_id = worker.id(),
            router_id = %router.id(),
            "Router assigned to worker"
        );
        Ok(router)
    }

    pub async fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            workers: self.workers.len(),
            ports_in_use: self.ports.in_use(),
            ..PoolStatus::default()
        };

        for worker in &self.workers {
            if let Ok(s) = worker.status().await {
                status.alive += 1;
                status.totals.routers += s.routers;
                status.totals.transports += s.transports;
                status.totals.producers += s.producers;
                status.totals.consumers += s.consumers;
            }
        }
        status
    }

    /// Stop all workers and wait for the monitor task.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel_token.cancel();

        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(monitor) = monitor {
            match tokio::time::timeout(timeout, monitor).await {
                Ok(Ok(())) => info!(target: "rc.media.pool", "Media workers stopped"),
                Ok(Err(e)) => warn!(target: "rc.media.pool", error = %e, "Worker monitor task failed"),
                Err(_) => warn!(
                    target: "rc.media.pool",
                    timeout_secs = timeout.as_secs(),
                    "Media worker shutdown timed out"
                ),
            }
        }
    }
}

/// How a worker task ended.
#[derive(Debug, Clone, Copy)]
struct WorkerExit {
    id: usize,
    pid: u32,
    panicked: bool,
}

/// Wait on every worker task. An exit before pool cancellation is a death.
async fn watch_workers(
    mut tasks: JoinSet<WorkerExit>,
    cancel_token: CancellationToken,
    fatal: FatalSignal,
) {
    while let Some(result) = tasks.join_next().await {
        if cancel_token.is_cancelled() {
            continue;
        }

        let reason = match result {
            Ok(exit) => {
                let how = if exit.panicked { "panicked" } else { "exited unexpectedly" };
                let reason = format!("media worker {} (pid {}) {how}", exit.id, exit.pid);
                error!(
                    target: "rc.media.pool",
                    worker_id = exit.id,
                    pid = exit.pid,
                    panicked = exit.panicked,
                    "Media worker died"
                );
                reason
            }
            Err(e) => {
                let reason = format!("media worker task failed: {e}");
                error!(target: "rc.media.pool", reason = %reason, "Media worker died");
                reason
            }
        };
        prom::record_worker_death();
        fatal.trip(reason);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn pool_config(num_workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_workers,
            rtc_min_port: 40000,
            rtc_max_port: 40100,
            worker: WorkerSettings {
                listen_ip: "127.0.0.1".parse().unwrap(),
                announced_ip: None,
                call_timeout: Duration::from_secs(5),
            },
        }
    }

    #[test]
    fn test_fatal_signal_first_reason_wins() {
        let fatal = FatalSignal::new();
        assert!(!fatal.is_tripped());

        fatal.trip("worker 1 died");
        fatal.trip("worker 2 died");

        assert!(fatal.is_tripped());
        assert_eq!(fatal.reason().as_deref(), Some("worker 1 died"));
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let result = WorkerPool::start(pool_config(0), CancellationToken::new(), FatalSignal::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_round_robin_assignment() {
        let token = CancellationToken::new();
        let pool = WorkerPool::start(pool_config(3), token.clone(), FatalSignal::new()).unwrap();

        let ids: Vec<usize> = (0..6)
            .map(|_| pool.acquire_worker().unwrap().id())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_routers_spread_across_workers() {
        let pool =
            WorkerPool::start(pool_config(2), CancellationToken::new(), FatalSignal::new()).unwrap();

        let a = pool.create_router(&RoomKey::parse("A").unwrap()).await.unwrap();
        let b = pool.create_router(&RoomKey::parse("B").unwrap()).await.unwrap();
        assert_ne!(a.worker_id(), b.worker_id());

        let status = pool.status().await;
        assert_eq!(status.alive, 2);
        assert_eq!(status.totals.routers, 2);

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_worker_death_trips_fatal_signal() {
        let fatal = FatalSignal::new();
        let pool = WorkerPool::start(pool_config(2), CancellationToken::new(), fatal.clone()).unwrap();

        let worker = pool.acquire_worker().unwrap();
        let pid = worker.pid();
        worker.terminate();

        tokio::time::timeout(Duration::from_secs(1), fatal.tripped())
            .await
            .expect("fatal signal should trip");
        let reason = fatal.reason().unwrap();
        assert!(reason.contains("worker 0"));
        assert!(reason.contains(&format!("pid {pid}")));

        let err = pool.acquire_worker().unwrap_err();
        assert!(matches!(err, RcError::WorkerDied(_)));

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_is_not_a_death() {
        let fatal = FatalSignal::new();
        let pool = WorkerPool::start(pool_config(2), CancellationToken::new(), fatal.clone()).unwrap();

        pool.shutdown(Duration::from_secs(1)).await;

        assert!(!fatal.is_tripped());
        assert!(matches!(
            pool.acquire_worker().unwrap_err(),
            RcError::Internal(_)
        ));
    }
}
