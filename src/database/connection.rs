//! Per-owner connection management for SQL Server.
//!
//! Each owner URI keeps the details it connected with plus at most one idle
//! connection. A query borrows that connection for its whole run and hands it
//! back afterwards, so session state such as temp tables survives between
//! queries of the same editor.

use super::auth::{create_connection, ConnectionDetails, RawConnection};
use super::messages::ServerMessages;
use super::types::{DbColumn, SqlValue, TypeMapper};
use crate::config::ConnectionConfig;
use crate::error::ServerError;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// One item produced while a batch runs.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchItem {
    /// A new result set starts with these columns.
    ResultSet(Vec<DbColumn>),

    /// A row of the current result set.
    Row(Vec<SqlValue>),

    /// An informational message (PRINT, RAISERROR with low severity).
    Message(String),

    /// Rows affected by a statement that produced no result set.
    RowsAffected(u64),
}

/// Stream of items of one executing batch.
pub type BatchStream<'a> = BoxStream<'a, Result<BatchItem, ServerError>>;

/// A connection able to run SQL batches.
#[async_trait]
pub trait QueryConnection: Send {
    /// Send one batch and stream back what it produces.
    async fn execute<'a>(&'a mut self, sql: &str) -> Result<BatchStream<'a>, ServerError>;

    /// Rows touched by the last statement of the previous batch, for
    /// connections whose stream does not report it.
    async fn rows_affected(&mut self) -> Result<Option<u64>, ServerError> {
        Ok(None)
    }

    /// Close the connection politely.
    async fn close(self: Box<Self>) -> Result<(), ServerError>;
}

#[async_trait]
impl QueryConnection for RawConnection {
    async fn execute<'a>(&'a mut self, sql: &str) -> Result<BatchStream<'a>, ServerError> {
        let stream = self.simple_query(sql.to_owned()).await?;

        let items = stream.map(|item| match item {
            Ok(tiberius::QueryItem::Metadata(meta)) => {
                Ok(BatchItem::ResultSet(TypeMapper::columns(meta.columns())))
            }
            Ok(tiberius::QueryItem::Row(row)) => Ok(BatchItem::Row(TypeMapper::extract_row(&row))),
            Err(e) => Err(ServerError::from(e)),
        });

        Ok(ServerMessages::new(items).boxed())
    }

    async fn rows_affected(&mut self) -> Result<Option<u64>, ServerError> {
        // @@ROWCOUNT still holds the last statement of the previous batch
        let row = self
            .simple_query("SELECT CAST(@@ROWCOUNT AS BIGINT)")
            .await?
            .into_row()
            .await?;
        Ok(row
            .and_then(|r| r.try_get::<i64, _>(0).ok().flatten())
            .and_then(|n| u64::try_from(n).ok()))
    }

    async fn close(self: Box<Self>) -> Result<(), ServerError> {
        (*self).close().await.map_err(ServerError::from)
    }
}

/// Resolves owner URIs to live connections.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Open and validate a connection for an owner, replacing any previous one.
    async fn connect(&self, owner_uri: &str, details: ConnectionDetails) -> Result<(), ServerError>;

    /// Forget the owner's connection. Returns whether one existed.
    async fn disconnect(&self, owner_uri: &str) -> bool;

    /// Details the owner connected with.
    fn connection_details(&self, owner_uri: &str) -> Option<ConnectionDetails>;

    /// Whether the owner is connected.
    fn has_connection(&self, owner_uri: &str) -> bool {
        self.connection_details(owner_uri).is_some()
    }

    /// Take the owner's connection for the duration of a query.
    async fn acquire(&self, owner_uri: &str) -> Result<Box<dyn QueryConnection>, ServerError>;

    /// Hand a healthy connection back after a query.
    fn release(&self, owner_uri: &str, connection: Box<dyn QueryConnection>);

    /// Close every idle connection.
    async fn close_idle(&self) {}
}

struct OwnerConnection {
    details: ConnectionDetails,
    idle: Mutex<Option<Box<dyn QueryConnection>>>,
}

/// Connection provider backed by tiberius.
pub struct SqlServerConnectionProvider {
    defaults: ConnectionConfig,
    owners: DashMap<String, OwnerConnection>,
}

impl SqlServerConnectionProvider {
    /// Create a provider using `defaults` for unspecified connection options.
    pub fn new(defaults: ConnectionConfig) -> Self {
        Self {
            defaults,
            owners: DashMap::new(),
        }
    }

    /// Number of connected owners.
    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }
}

#[async_trait]
impl ConnectionProvider for SqlServerConnectionProvider {
    async fn connect(&self, owner_uri: &str, details: ConnectionDetails) -> Result<(), ServerError> {
        info!(
            "Connecting {} to {} (database: {})",
            owner_uri,
            details.server_name,
            details.database_name.as_deref().unwrap_or("<default>")
        );

        let client = create_connection(&details, &self.defaults).await?;
        let previous = self.owners.insert(
            owner_uri.to_string(),
            OwnerConnection {
                details,
                idle: Mutex::new(Some(Box::new(client))),
            },
        );

        if let Some(previous) = previous {
            debug!("Replaced existing connection for {}", owner_uri);
            if let Some(conn) = previous.idle.into_inner() {
                close_quietly(conn).await;
            }
        }
        Ok(())
    }

    async fn disconnect(&self, owner_uri: &str) -> bool {
        match self.owners.remove(owner_uri) {
            Some((_, owner)) => {
                info!("Disconnected {}", owner_uri);
                if let Some(conn) = owner.idle.into_inner() {
                    close_quietly(conn).await;
                }
                true
            }
            None => false,
        }
    }

    fn connection_details(&self, owner_uri: &str) -> Option<ConnectionDetails> {
        self.owners.get(owner_uri).map(|o| o.details.clone())
    }

    async fn acquire(&self, owner_uri: &str) -> Result<Box<dyn QueryConnection>, ServerError> {
        let details = {
            let owner = self
                .owners
                .get(owner_uri)
                .ok_or_else(|| ServerError::invalid_owner(owner_uri))?;
            if let Some(conn) = owner.idle.lock().take() {
                debug!("Reusing idle connection for {}", owner_uri);
                return Ok(conn);
            }
            owner.details.clone()
        };

        debug!("Opening new connection for {}", owner_uri);
        let client = create_connection(&details, &self.defaults).await?;
        Ok(Box::new(client))
    }

    fn release(&self, owner_uri: &str, connection: Box<dyn QueryConnection>) {
        // A disconnected owner or an already refilled slot drops the connection
        if let Some(owner) = self.owners.get(owner_uri) {
            let mut idle = owner.idle.lock();
            if idle.is_none() {
                *idle = Some(connection);
            }
        }
    }

    async fn close_idle(&self) {
        let idle: Vec<Box<dyn QueryConnection>> = self
            .owners
            .iter()
            .filter_map(|owner| owner.idle.lock().take())
            .collect();

        if !idle.is_empty() {
            info!("Closing {} idle connections", idle.len());
        }
        for conn in idle {
            close_quietly(conn).await;
        }
    }
}

async fn close_quietly(conn: Box<dyn QueryConnection>) {
    if let Err(e) = conn.close().await {
        warn!("Error while closing connection: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_owner() {
        let provider = SqlServerConnectionProvider::new(ConnectionConfig::default());
        assert!(!provider.has_connection("file:///a.sql"));
        assert!(!provider.disconnect("file:///a.sql").await);

        let err = provider.acquire("file:///a.sql").await.err().unwrap();
        assert!(matches!(err, ServerError::InvalidOwner(_)));
        assert_eq!(provider.owner_count(), 0);
    }

    #[test]
    fn test_batch_item_equality() {
        assert_eq!(BatchItem::RowsAffected(3), BatchItem::RowsAffected(3));
        assert_ne!(
            BatchItem::Message("a".to_string()),
            BatchItem::Message("b".to_string())
        );
    }
}
