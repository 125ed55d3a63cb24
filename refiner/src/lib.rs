//! Bounded iterative refinement of code-represented engineering designs.
//!
//! A natural-language requirement is turned into a sequence of proposed edits
//! to a target project. Each edit is applied all-or-nothing and validated by
//! running the project's own simulation/test code; failures are fed back into
//! the next proposal until validation passes, the attempt budget runs out, or
//! a fatal error stops the run. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (history, status invariants,
//!   feedback, retry, provider error classification). No I/O.
//! - **[`io`]**: Side-effecting collaborators (config, child processes,
//!   proposal, patch application, validation, run logs).
//!
//! [`controller`] sequences the two into the iteration loop; the `refiner`
//! binary wires it to the command line.

pub mod controller;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
