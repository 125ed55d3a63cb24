//! Stable exit codes for refiner CLI commands.

use crate::core::types::RunStatus;

/// Command succeeded, or the run converged.
pub const OK: i32 = 0;
/// Invalid config or arguments, a failed `refiner validate`, or any other error.
pub const INVALID: i32 = 1;
/// The run used its whole budget without converging.
pub const EXHAUSTED: i32 = 2;
/// The run stopped on a fatal error or was cancelled.
pub const FAILED: i32 = 3;

/// Exit code for a finished run.
pub fn for_status(status: RunStatus) -> i32 {
    match status {
        RunStatus::Converged => OK,
        RunStatus::Exhausted => EXHAUSTED,
        RunStatus::Failed => FAILED,
        // A returned state is always terminal; treat anything else as an error.
        RunStatus::Running => INVALID,
    }
}
