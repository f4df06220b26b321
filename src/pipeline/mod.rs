//! Stages of a session run.
//!
//! ```text
//! validate ──▶ admit ──▶ resolve ──▶ attempt ──▶ attempt ──▶ …
//! (sync)       (guard)   (snapshot)  (exchange)  (fallback)
//! ```
//!
//! 1. [`validate`] checks arity and inputs before any session exists.
//! 2. [`attempt`] drives one exchange with timeout, cancellation and
//!    progress ticks. The orchestrator calls it once per candidate until
//!    a terminal state is reached.

pub(crate) mod attempt;
pub mod validate;
