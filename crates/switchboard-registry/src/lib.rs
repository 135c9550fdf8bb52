//! Worker discovery and dispatch for Switchboard.
//!
//! - [`AgentRegistry`]: metadata (capabilities, backup worker, concurrency
//!   limit, status), read-mostly, safe for concurrent readers.
//! - [`WorkerPool`]: live [`Worker`](switchboard_core::Worker) instances with
//!   per-worker concurrency permits.
//!
//! The two are joined only at dispatch time.

/// Live worker instances and concurrency limits.
pub mod pool;
/// Worker descriptors.
pub mod registration;
/// The worker registry.
pub mod registry;

pub use pool::WorkerPool;
pub use registration::{render_catalog, AgentRegistration, AgentStatus, WorkerSummary};
pub use registry::AgentRegistry;
