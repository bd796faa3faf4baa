//! unison-core — latency-compensated synchronized video playback.
//!
//! One controller decides what plays; every connected display starts, pauses
//! and resumes at the same wall-clock instant.
//!
//! # Architecture (Clean Architecture)
//!
//! - **domain**: identifiers, wire messages, playback state (no I/O).
//! - **application**: registry, clock sync, readiness barrier, scheduler,
//!   drift monitor, the [`SyncEngine`](application::engine::SyncEngine) that
//!   owns them, and the port traits they depend on.
//! - **adapters**: clocks, JSON codec, in-memory connections, QUIC host and
//!   display client (Quinn).

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
