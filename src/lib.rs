//! # kernel-worker
//!
//! Execution coordination for a single-kernel notebook runtime.
//!
//! A worker registers a session against a notebook's event-sourced log,
//! claims pending execution requests with compare-and-append commits,
//! runs each claimed cell exactly once, reports outputs and completion,
//! and heartbeats until it shuts down.

pub mod compute;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod store;
pub mod telemetry;
