//! Deterministic, pure logic shared by the interpreter and strategies.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod bindings;
pub mod circuit;
pub mod heuristics;
pub mod model_output;
pub mod placeholder;
pub mod plan;
pub mod types;
