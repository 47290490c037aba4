//! Plan interpretation and goal-driven iteration over tools and model
//! functions.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (plans, placeholders, model-output
//!   parsing, breaker state). No I/O, fully testable in isolation.
//! - **[`io`]**: Collaborator contracts and side effects (tools, model
//!   functions, backends, config and session files).
//!
//! Orchestration modules ([`interpreter`], [`strategy`]) combine the two:
//! a [`resolver`] maps step targets onto registered executables, the
//! [`binder`] fills in parameters, and an [`executor`] runs each step.

pub mod binder;
pub mod cancel;
pub mod core;
pub mod events;
pub mod executor;
pub mod interpreter;
pub mod io;
pub mod logging;
pub mod resolver;
pub mod strategy;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
