//! Configuration management for the query execution service.
//!
//! Configuration is loaded from environment variables following the 12-factor app pattern.
//! Query settings can later be replaced at runtime by the editor through
//! `workspace/didChangeConfiguration`.

use crate::constants::{
    DEFAULT_APPLICATION_NAME, DEFAULT_BATCH_SEPARATOR, DEFAULT_CONNECTION_TIMEOUT,
    DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_EXPORT_WINDOW_ROWS, DEFAULT_MAX_CHARS_TO_STORE,
    DEFAULT_MAX_XML_CHARS_TO_STORE,
};
use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Defaults applied to every query
    pub query: QueryExecutionSettings,

    /// Result buffer configuration
    pub storage: StorageConfig,

    /// Connection defaults for connect requests
    pub connection: ConnectionConfig,
}

/// Settings that shape how a query is split, executed and stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryExecutionSettings {
    /// Keyword on a line of its own that separates batches
    pub batch_separator: String,

    /// Also split top-level `;`-terminated statements into batches
    pub split_statements: bool,

    /// Maximum characters kept per text cell (and bytes per binary cell)
    pub max_chars_to_store: usize,

    /// Maximum characters kept per XML cell
    pub max_xml_chars_to_store: usize,

    /// `SET ROWCOUNT` applied around the query, 0 for unlimited
    pub row_count: u32,
}

/// Result buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for scratch files, system temp dir when unset
    pub buffer_dir: Option<PathBuf>,

    /// Rows read per window while exporting
    pub export_window_rows: usize,
}

/// Connection defaults used when a connect request leaves them out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Application name sent to SQL Server
    pub application_name: String,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Enable TLS encryption
    pub encrypt: bool,

    /// Trust server certificate (for self-signed certs)
    pub trust_server_certificate: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// All optional:
    /// - `MSSQL_BATCH_SEPARATOR`: Batch separator keyword (default: GO)
    /// - `MSSQL_SPLIT_STATEMENTS`: Split on top-level `;` (default: true)
    /// - `MSSQL_MAX_CHARS`: Characters stored per text cell (default: 65535)
    /// - `MSSQL_MAX_XML_CHARS`: Characters stored per XML cell (default: 2097152)
    /// - `MSSQL_ROW_COUNT`: Row limit per statement, 0 for none (default: 0)
    /// - `MSSQL_QUERY_BUFFER_DIR`: Directory for result scratch files
    /// - `MSSQL_EXPORT_WINDOW`: Rows read per export window (default: 1000)
    /// - `MSSQL_APP_NAME`: Application name (default: mssql-query-service)
    /// - `MSSQL_CONNECT_TIMEOUT`: Connection timeout in seconds (default: 30)
    /// - `MSSQL_ENCRYPT`: Enable TLS (default: true)
    /// - `MSSQL_TRUST_CERT`: Trust server certificate (default: false)
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ServerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let batch_separator = lookup("MSSQL_BATCH_SEPARATOR")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| DEFAULT_BATCH_SEPARATOR.to_string());
        if batch_separator.is_empty() || batch_separator.contains(char::is_whitespace) {
            return Err(ServerError::config(
                "MSSQL_BATCH_SEPARATOR must be a single non-empty word",
            ));
        }

        let split_statements = lookup("MSSQL_SPLIT_STATEMENTS")
            .map(|v| parse_flag(&v))
            .unwrap_or(true);

        let max_chars_to_store = parse_number(&lookup, "MSSQL_MAX_CHARS")?
            .unwrap_or(DEFAULT_MAX_CHARS_TO_STORE);

        let max_xml_chars_to_store = parse_number(&lookup, "MSSQL_MAX_XML_CHARS")?
            .unwrap_or(DEFAULT_MAX_XML_CHARS_TO_STORE);

        let row_count = parse_number(&lookup, "MSSQL_ROW_COUNT")?.unwrap_or(0);

        let buffer_dir = lookup("MSSQL_QUERY_BUFFER_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let export_window_rows = parse_number(&lookup, "MSSQL_EXPORT_WINDOW")?
            .unwrap_or(DEFAULT_EXPORT_WINDOW_ROWS);
        if export_window_rows == 0 {
            return Err(ServerError::config("MSSQL_EXPORT_WINDOW must be at least 1"));
        }

        let application_name =
            lookup("MSSQL_APP_NAME").unwrap_or_else(|| DEFAULT_APPLICATION_NAME.to_string());

        let connect_timeout_secs = parse_number(&lookup, "MSSQL_CONNECT_TIMEOUT")?
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECS);

        // Optional: Encryption settings
        let encrypt = lookup("MSSQL_ENCRYPT")
            .map(|v| parse_flag(&v))
            .unwrap_or(true);

        let trust_server_certificate = lookup("MSSQL_TRUST_CERT")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        Ok(Config {
            query: QueryExecutionSettings {
                batch_separator,
                split_statements,
                max_chars_to_store,
                max_xml_chars_to_store,
                row_count,
            },
            storage: StorageConfig {
                buffer_dir,
                export_window_rows,
            },
            connection: ConnectionConfig {
                application_name,
                connect_timeout: Duration::from_secs(connect_timeout_secs),
                encrypt,
                trust_server_certificate,
            },
        })
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

fn parse_number<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ServerError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ServerError::config(format!("{} must be a number, got '{}'", key, raw))),
    }
}

impl Default for QueryExecutionSettings {
    fn default() -> Self {
        Self {
            batch_separator: DEFAULT_BATCH_SEPARATOR.to_string(),
            split_statements: true,
            max_chars_to_store: DEFAULT_MAX_CHARS_TO_STORE,
            max_xml_chars_to_store: DEFAULT_MAX_XML_CHARS_TO_STORE,
            row_count: 0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            buffer_dir: None,
            export_window_rows: DEFAULT_EXPORT_WINDOW_ROWS,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            connect_timeout: DEFAULT_CONNECTION_TIMEOUT,
            encrypt: true,
            trust_server_certificate: false,
        }
    }
}
