//! Room Controller Service Library
//!
//! Session orchestration and signaling for classroom audio/video through a
//! central relay:
//!
//! - Authenticated WebSocket signaling for clients
//! - Room admission against the course directory
//! - Per-room peer, transport, producer and consumer lifecycle
//! - A fixed pool of media workers that own all media state
//! - Room chat with persisted history, typing and hand-raise presence
//!
//! # Architecture
//!
//! ```text
//! WorkerPool (N workers, round-robin)
//! └── Worker -> Routers -> Transports -> Producers / Consumers
//!
//! RoomRegistryActor (singleton)
//! └── RoomActor (one per live room, owns one router)
//!     └── peers, each notified through its ConnectionActor
//!
//! /ws -> SignalingSession (one per socket) -> registry / rooms
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and connection actors
//! - [`auth`] - Bearer credential verification
//! - [`chat`] - Chat persistence
//! - [`config`] - Service configuration from environment
//! - [`directory`] - Course lookup and enrollment checks
//! - [`errors`] - Error types with client-facing codes
//! - [`media`] - Worker pool, workers, routers and RTP types
//! - [`observability`] - Metrics and health endpoints
//! - [`signaling`] - Wire protocol, sessions and the WebSocket endpoint

pub mod actors;
pub mod auth;
pub mod chat;
pub mod config;
pub mod directory;
pub mod errors;
pub mod media;
pub mod observability;
pub mod signaling;
