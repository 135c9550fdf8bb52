//! Core types shared across the Switchboard orchestration crates.
//!
//! Switchboard routes business tasks to specialized workers on behalf of
//! many tenants. This crate holds the vocabulary every other crate speaks:
//!
//! - [`SwitchboardError`] and [`SwitchboardResult`]: the unified error type.
//! - [`TenantId`]: the isolation key threaded through every call.
//! - [`Task`] and [`TaskResult`]: the unit of work and its result envelope.
//! - [`WorkingContext`]: the token-budgeted context handed to workers.
//! - [`Worker`]: the pluggable business-logic boundary.
//! - [`SwitchboardConfig`]: TOML configuration for every component.

/// TOML configuration.
pub mod config;
/// Session turns, memory hits and the compiled working context.
pub mod context;
/// The unified error type.
pub mod error;
/// Tasks and result envelopes.
pub mod task;
/// Tracing bootstrap.
pub mod telemetry;
/// Tenant identity.
pub mod tenant;
/// The worker trait.
pub mod worker;

pub use config::{
    AdmissionConfig, BudgetSplit, BusConfig, BusRetryPolicy, ContextConfig, HandoffConfig,
    LlmConfig, LlmProvider, ModelConfig, RetryPolicy, RouterConfig, RuleConfig, Strictness,
    SupervisorConfig, SwitchboardConfig, TelemetryConfig, TokenEncoding,
};
pub use context::{
    ContextBudgetReport, MemoryHit, SectionUsage, SessionTurn, TurnRole, WorkingContext,
};
pub use error::{SwitchboardError, SwitchboardResult};
pub use task::{ErrorClass, ResultStatus, Task, TaskFailure, TaskResult};
pub use telemetry::init_tracing;
pub use tenant::TenantId;
pub use worker::{Worker, SUPERVISOR_ID};
