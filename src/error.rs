//! Error types for the query execution service.
//!
//! Errors are split into two families: statement-level errors that are
//! recorded on a batch and never abort the surrounding query, and
//! connection-level errors that fail the whole query.

use thiserror::Error;

/// Domain-specific errors for the query execution service.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error (fatal to a running query)
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// No connection or document is known for the owner URI
    #[error("Query has invalid owner URI: {0}")]
    InvalidOwner(String),

    /// A query for the owner URI is still executing
    #[error("A query is already in progress for this editor session ({0}). Please cancel this query or wait for its completion.")]
    QueryInProgress(String),

    /// No query is registered for the owner URI
    #[error("No query found for owner URI: {0}")]
    NoQueryFound(String),

    /// Batch or result set index out of range
    #[error("{kind} index {index} is out of range, {count} available")]
    InvalidIndex {
        kind: &'static str,
        index: usize,
        count: usize,
    },

    /// Cancel requested on a query that already finished
    #[error("The query has already completed, it cannot be cancelled")]
    AlreadyCompleted,

    /// Read attempted before a result set was fully written
    #[error("Result set {result_set} of batch {batch} has not finished reading from the server")]
    ResultSetNotComplete { batch: usize, result_set: usize },

    /// Row count does not fit the 32-bit row arithmetic of the subset contract
    #[error("Result set is too large to be returned ({rows} rows)")]
    ResultTooLarge { rows: u64 },

    /// A single statement failed; recorded on its batch
    #[error("{message}")]
    Statement {
        message: String,
        number: Option<u32>,
        state: Option<u8>,
        class: Option<u8>,
        line: Option<u32>,
    },

    /// The query was cancelled
    #[error("Query was cancelled by user")]
    Cancelled,

    /// Result buffer I/O or encoding error
    #[error("Result storage error: {0}")]
    Storage(String),

    /// Export failure
    #[error("Failed to save results: {0}")]
    Export(String),

    /// Malformed JSON-RPC traffic
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a connection error with a source.
    pub fn connection_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create an invalid owner error.
    pub fn invalid_owner(owner_uri: impl Into<String>) -> Self {
        Self::InvalidOwner(owner_uri.into())
    }

    /// Create a query-in-progress error.
    pub fn in_progress(owner_uri: impl Into<String>) -> Self {
        Self::QueryInProgress(owner_uri.into())
    }

    /// Create a no-query-found error.
    pub fn no_query(owner_uri: impl Into<String>) -> Self {
        Self::NoQueryFound(owner_uri.into())
    }

    /// Create an out-of-range batch index error.
    pub fn batch_index(index: usize, count: usize) -> Self {
        Self::InvalidIndex {
            kind: "Batch",
            index,
            count,
        }
    }

    /// Create an out-of-range result set index error.
    pub fn result_set_index(index: usize, count: usize) -> Self {
        Self::InvalidIndex {
            kind: "Result set",
            index,
            count,
        }
    }

    /// Create a statement error without server details.
    pub fn statement(msg: impl Into<String>) -> Self {
        Self::Statement {
            message: msg.into(),
            number: None,
            state: None,
            class: None,
            line: None,
        }
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an export error.
    pub fn export(msg: impl Into<String>) -> Self {
        Self::Export(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error must abort the remaining batches of a query.
    ///
    /// Statement errors and cancellation are handled by the batch itself;
    /// everything else means the connection can no longer be trusted.
    pub fn is_connection_level(&self) -> bool {
        !matches!(self, Self::Statement { .. } | Self::Cancelled)
    }

    /// Whether this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// JSON-RPC error code used when this error crosses the RPC boundary.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::InvalidOwner(_)
            | Self::NoQueryFound(_)
            | Self::InvalidIndex { .. }
            | Self::InvalidInput(_) => -32602,
            Self::Protocol(_) => -32700,
            Self::QueryInProgress(_)
            | Self::AlreadyCompleted
            | Self::ResultSetNotComplete { .. }
            | Self::ResultTooLarge { .. } => -32001,
            _ => -32603,
        }
    }

    /// Format a statement error the way SQL Server tools print them.
    ///
    /// `line_offset` translates the batch-relative line reported by the
    /// server into a line of the source document.
    pub fn to_batch_message(&self, line_offset: u32) -> String {
        match self {
            Self::Statement {
                message,
                number: Some(number),
                state,
                class,
                line,
            } => format!(
                "Msg {}, Level {}, State {}, Line {}\n{}",
                number,
                class.unwrap_or(0),
                state.unwrap_or(0),
                line.unwrap_or(0) + line_offset,
                message
            ),
            other => other.to_string(),
        }
    }
}

/// Map SQL Server error numbers to semantic ServerError types.
///
/// Severity 20 and above terminates the connection on the server side, so
/// those are always connection-level regardless of the number.
pub fn from_sql_error(number: u32, class: u8, state: u8, line: u32, message: &str) -> ServerError {
    if class >= 20 {
        return ServerError::connection(format!("Msg {}: {}", number, message));
    }

    match number {
        // Authentication errors
        18456 => ServerError::auth(format!("Login failed: {}", message)),

        // Connection errors
        53 | 233 | 10053 | 10054 | 10060 => {
            ServerError::connection(format!("Msg {}: {}", number, message))
        }

        _ => ServerError::Statement {
            message: message.to_string(),
            number: Some(number),
            state: Some(state),
            class: Some(class),
            line: Some(line),
        },
    }
}

impl From<tiberius::error::Error> for ServerError {
    fn from(e: tiberius::error::Error) -> Self {
        use tiberius::error::Error;

        match &e {
            Error::Server(token) => from_sql_error(
                token.code(),
                token.class(),
                token.state(),
                token.line(),
                token.message(),
            ),
            Error::Io { .. } => ServerError::connection(format!("IO error: {}", e)),
            Error::Tls(_) => ServerError::connection(format!("TLS error: {}", e)),
            Error::Protocol(_) => ServerError::connection(format!("Protocol error: {}", e)),
            Error::Routing { host, port } => ServerError::connection(format!(
                "Server requested routing to {}:{}, which is not supported",
                host, port
            )),
            Error::Conversion(_) | Error::Encoding(_) => {
                ServerError::statement(format!("Type conversion error: {}", e))
            }
            _ => ServerError::internal(e.to_string()),
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::storage(e.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::protocol(e.to_string())
    }
}
