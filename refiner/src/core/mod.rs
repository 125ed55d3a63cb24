//! Deterministic, pure logic shared by the refinement loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod cancel;
pub mod classifier;
pub mod convergence;
pub mod feedback;
pub mod history;
pub mod retry;
pub mod types;
