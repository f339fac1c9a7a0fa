//! Media plane: worker pool, per-room routers and the RTP negotiation rules
//! they enforce.

pub mod pool;
pub mod ports;
pub mod router;
pub mod rtp;
pub mod worker;

pub use pool::{FatalSignal, WorkerPool, WorkerPoolConfig};
pub use router::RouterHandle;
pub use worker::{ConsumerCreated, TransportCreated, WorkerHandle, WorkerSettings};
