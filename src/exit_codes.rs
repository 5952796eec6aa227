//! Process exit codes for the CLI.

/// The requested operation completed successfully.
pub const OK: i32 = 0;

/// The operation ran but the task (or at least one fan-out item) failed.
pub const FAILED: i32 = 1;

/// A loop was cancelled via its state file before finishing.
pub const CANCELLED: i32 = 3;
