//! Side-effecting collaborators: configuration, child processes, proposal,
//! project snapshots, patch application, validation and run logs.

pub mod config;
pub mod iteration_log;
pub mod patch;
pub mod process;
pub mod proposer;
pub mod snapshot;
pub mod validation;
