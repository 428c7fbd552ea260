//! Database connectivity and value mapping.

pub mod auth;
mod connection;
pub mod messages;
pub mod types;

pub use auth::{truncate_for_log, AuthenticationType, ConnectionDetails, RawConnection};
pub use connection::{
    BatchItem, BatchStream, ConnectionProvider, QueryConnection, SqlServerConnectionProvider,
};
pub use messages::{server_message_layer, ServerMessageLayer};
pub use types::{DbCellValue, DbColumn, SqlValue, TypeMapper};
