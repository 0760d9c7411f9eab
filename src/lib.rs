//! Proxyvisor - a supervisor for proxy binary instances
//!
//! This library runs any number of independently configured proxy processes
//! and:
//! - Spawns, stops and restarts each instance on request, at most one live
//!   process per instance
//! - Captures stdout/stderr line by line into a bounded per-instance ring
//! - Respawns crashed instances with linear backoff and gives up after
//!   repeated failures within a time window
//! - Broadcasts log lines and lifecycle changes to connected observers over
//!   a WebSocket, starting each observer with a full snapshot

pub mod admin;
pub mod config;
pub mod error;
pub mod events;
pub mod logs;
pub mod manager;
pub mod registry;
pub mod restart;
pub mod supervisor;
