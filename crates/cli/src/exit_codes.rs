//! CLI Exit Code Registry
//!
//! This is the single source of truth for all CLI exit codes.
//! Exit codes are part of the shell contract: scripts rely on them.
//!
//! | Code | Description                                                   |
//! |------|---------------------------------------------------------------|
//! | 0    | Success (unresolved lines are reported, not failures)         |
//! | 1    | General error (store unreadable/unwritable, I/O)              |
//! | 2    | Invalid input (card, month, rows file, config)                |
//! | 3    | A run is already active for the (card, month)                 |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Map it in [`recon_exit_code`]

use cardrecon::ReconError;

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - store or filesystem failure.
pub const EXIT_ERROR: u8 = 1;

/// Usage error - bad arguments, unreadable rows, invalid config.
pub const EXIT_USAGE: u8 = 2;

/// Another run holds the (card, month) slot.
pub const EXIT_RUN_ACTIVE: u8 = 3;

/// Map an engine error to its exit code.
pub fn recon_exit_code(err: &ReconError) -> u8 {
    match err {
        ReconError::ConfigParse(_) | ReconError::ConfigValidation(_) | ReconError::InvalidInput(_) => {
            EXIT_USAGE
        }
        ReconError::RunConflict { .. } => EXIT_RUN_ACTIVE,
        ReconError::CollaboratorIo(_)
        | ReconError::InvalidTransition { .. }
        | ReconError::LineOutOfScope { .. }
        | ReconError::UnknownGroup(_)
        | ReconError::GroupConsumed(_) => EXIT_ERROR,
    }
}
