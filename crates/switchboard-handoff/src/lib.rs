//! Handoff protocol for Switchboard.
//!
//! Every result a worker passes on crosses a [`HandoffValidator`] before it
//! is trusted:
//!
//! 1. **Structural**: schema, call-chain invariants (source in the chain,
//!    target not in it) and the target's required fields. Always runs.
//! 2. **Semantic**: for strict handoffs, a fast-tier model checks every
//!    claim in the payload against the context the source worker had.
//!    A completion outage degrades to structural-only with a warning.
//!
//! Strictness comes from a per-type [`StrictnessTable`]; unknown types are
//! strict.

/// Handoff payloads.
pub mod payload;
/// Per-type strictness table.
pub mod strictness;
/// The two-stage validator.
pub mod validator;

pub use payload::HandoffPayload;
pub use strictness::StrictnessTable;
pub use validator::{HandoffValidator, ValidationOutcome};
