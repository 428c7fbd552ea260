//! Centralized constants for the query execution service.
//!
//! Defaults, limits and the fixed message texts reported to the editor.

use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Default connection timeout in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_CONNECTION_TIMEOUT: Duration =
    Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS);

/// Default SQL Server port.
pub const DEFAULT_PORT: u16 = 1433;

/// Application name sent to SQL Server.
pub const DEFAULT_APPLICATION_NAME: &str = "mssql-query-service";

// =============================================================================
// Batch Constants
// =============================================================================

/// Default batch separator keyword.
pub const DEFAULT_BATCH_SEPARATOR: &str = "GO";

/// Highest repeat count accepted after a batch separator (`GO n`).
pub const MAX_BATCH_EXECUTION_COUNT: u32 = 1_000_000;

// =============================================================================
// Result Storage Constants
// =============================================================================

/// Default maximum characters stored per text cell.
pub const DEFAULT_MAX_CHARS_TO_STORE: usize = 65_535;

/// Default maximum characters stored per XML cell.
pub const DEFAULT_MAX_XML_CHARS_TO_STORE: usize = 2_097_152;

/// Rows read per window while exporting a result set.
pub const DEFAULT_EXPORT_WINDOW_ROWS: usize = 1_000;

/// Prefix of the scratch files backing buffered results.
pub const BUFFER_FILE_PREFIX: &str = "mssql-query-";

/// Suffix of the scratch files backing buffered results.
pub const BUFFER_FILE_SUFFIX: &str = ".buf";

/// Column name SQL Server uses for XML showplan result sets.
pub const SHOWPLAN_XML_COLUMN_NAME: &str = "Microsoft SQL Server 2005 XML Showplan";

/// Largest row count addressable through the subset contract.
pub const MAX_ADDRESSABLE_ROWS: u64 = i32::MAX as u64;

// =============================================================================
// Shutdown Constants
// =============================================================================

/// Default shutdown drain timeout in seconds.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Default shutdown force timeout in seconds.
pub const DEFAULT_FORCE_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS);

pub const DEFAULT_FORCE_TIMEOUT: Duration = Duration::from_secs(DEFAULT_FORCE_TIMEOUT_SECS);

/// Poll interval while waiting for running queries to drain.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long queued responses may take to flush once the RPC stream closes.
pub const RPC_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

// =============================================================================
// Logging Constants
// =============================================================================

/// Query text longer than this is truncated in log lines.
pub const LOG_QUERY_TRUNCATE_LENGTH: usize = 100;

// =============================================================================
// Message Text
// =============================================================================

/// Message recorded for a batch that produced no result sets.
pub const MSG_COMMANDS_COMPLETED: &str = "Commands completed successfully.";

/// Message recorded when a batch is interrupted by cancellation.
pub const MSG_QUERY_CANCELLED: &str = "Query was cancelled by user.";

/// Message recorded before a repeated batch starts.
pub const MSG_BEGIN_EXECUTION_LOOP: &str = "Beginning execution loop";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_durations() {
        assert_eq!(DEFAULT_CONNECTION_TIMEOUT, Duration::from_secs(30));
    }

    #[test]
    fn test_shutdown_durations() {
        assert_eq!(DEFAULT_DRAIN_TIMEOUT, Duration::from_secs(30));
        assert_eq!(DEFAULT_FORCE_TIMEOUT, Duration::from_secs(10));
    }

    #[test]
    fn test_storage_limits() {
        assert!(DEFAULT_MAX_CHARS_TO_STORE < DEFAULT_MAX_XML_CHARS_TO_STORE);
        assert_eq!(MAX_ADDRESSABLE_ROWS, 2_147_483_647);
    }
}
