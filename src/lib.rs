//! Tandemd is an embedded supervisor for a small set of interdependent,
//! long-lived services sharing one deployment unit. It starts services in
//! dependency order, polls their health on a per-service cadence, restarts
//! crashed or persistently-unhealthy processes with bounded backoff, folds
//! per-service states into one aggregate status for the outer platform, and
//! drains everything in reverse order on SIGTERM/SIGINT.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Error handling.
pub mod error;

/// Aggregate health reporting.
pub mod health;

/// Process table, exit reaping, and restart policy.
pub mod monitor;

/// Per-service health probing.
pub mod probe;

/// Validated service registry and dependency ordering.
pub mod registry;

/// Process launching and signal delivery.
pub mod spawn;

/// Shared per-service runtime state.
pub mod state;

/// Launcher and shutdown coordination.
pub mod supervisor;
