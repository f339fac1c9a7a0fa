//! Actor model implementation for the Room Controller.
//!
//! ```text
//! RoomRegistryActor (singleton)
//! └── supervises N RoomActors
//!     └── RoomActor (one per live room)
//!         ├── owns the peer set and the room's router
//!         └── pushes events to ConnectionActors
//!             └── ConnectionActor (one per signaling connection)
//! ```
//!
//! - **Ownership**: each map lives inside exactly one actor and is only
//!   touched from its message loop
//! - **CancellationToken propagation**: the registry hands child tokens to rooms
//! - **Mailbox monitoring**: depth thresholds with metrics and drop counts
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor`, room creation, leases and removal
//! - [`room`] - `RoomActor` per live room
//! - [`connection`] - `ConnectionActor` per signaling connection
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::{RoomLease, RoomRegistryActor, RoomRegistryHandle};
pub use room::{RoomActor, RoomActorHandle};
