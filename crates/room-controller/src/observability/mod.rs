//! Observability for the Room Controller.
//!
//! All actor loops use `#[instrument(skip_all)]` with an explicit field
//! allow-list; participant names never appear in spans or metric labels.
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `rc_rooms_active` | Gauge | none | Live rooms in the registry |
//! | `rc_peers_active` | Gauge | none | Peers across all rooms |
//! | `rc_connections_active` | Gauge | none | Open signaling connections |
//! | `rc_signaling_requests_total` | Counter | `method`, `status` | Request outcomes |
//! | `rc_signaling_request_duration_seconds` | Histogram | `method` | Request latency |
//! | `rc_admission_total` | Counter | `outcome` | Join admission decisions |
//! | `rc_worker_deaths_total` | Counter | none | Fatal media worker exits |
//! | `rc_events_dropped_total` | Counter | none | Events dropped for slow clients |
//! | `rc_actor_panics_total` | Counter | `actor_type` | Actor task panics |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
