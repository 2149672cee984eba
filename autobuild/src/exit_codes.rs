//! Stable exit codes for `autobuild` CLI commands.

/// Command succeeded (or the run ended in `DONE`).
pub const OK: i32 = 0;
/// Command failed due to invalid layout/config/arguments or other errors.
pub const INVALID: i32 = 1;
/// `autobuild run --until-terminal` ended in `FAIL`.
pub const FAILED: i32 = 2;
