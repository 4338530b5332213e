//! Stable exit codes for the agent CLI.

use crate::core::types::StopReason;

/// The agent finished its task.
pub const OK: i32 = 0;
/// Invalid configuration, arguments or other setup errors.
pub const INVALID: i32 = 1;
/// The session stopped before finishing (step limit, no model response,
/// unparseable replies, cancelled by the user, internal error).
pub const STOPPED: i32 = 2;
/// The remote host became unreachable.
pub const CONNECTION: i32 = 3;

pub fn for_stop(stop: &StopReason) -> i32 {
    match stop {
        StopReason::Finished => OK,
        StopReason::ConnectionLost { .. } => CONNECTION,
        _ => STOPPED,
    }
}
