//! Common utilities and types shared across the classroom relay crates.

#![warn(clippy::pedantic)]

/// Identifier newtypes for rooms, connections and participants
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Bearer credential helpers (size limits, iat validation, claims)
pub mod jwt;
