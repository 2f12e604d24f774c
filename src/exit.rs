//! Process exit codes for the binary.
//!
//! - `0`: every feed was read and every batch delivered (or nothing changed)
//! - `1`: the run finished with failed feeds or batches, or had no feeds
//! - `2`: configuration problem, including a missing token outside a dry run

use crate::config::ConfigError;
use crate::prom::PromError;
use crate::sync::SyncError;

/// Exit code for a run that finished but had feed or batch failures.
pub const EXIT_FAILURES: u8 = 1;
/// Exit code for bad or missing configuration.
pub const EXIT_CONFIG: u8 = 2;

/// Maps an aborted run to its exit code.
///
/// Configuration problems get their own code so a scheduler can tell
/// "fix the setup" apart from "a vendor was down".
pub fn exit_code_for(error: &anyhow::Error) -> u8 {
    let is_config = error.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || matches!(
                cause.downcast_ref::<SyncError>(),
                Some(
                    SyncError::Config(_)
                        | SyncError::Prom(PromError::Config(_) | PromError::InvalidToken)
                )
            )
            || matches!(
                cause.downcast_ref::<PromError>(),
                Some(PromError::Config(_) | PromError::InvalidToken)
            )
    });
    if is_config {
        EXIT_CONFIG
    } else {
        EXIT_FAILURES
    }
}
